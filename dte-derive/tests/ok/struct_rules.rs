use dte_derive::Validate;

#[derive(Debug)]
pub struct IdentityError(String);

impl From<String> for IdentityError {
    fn from(message: String) -> Self {
        Self(message)
    }
}

#[derive(Validate)]
#[validate_error(IdentityError)]
#[validate(non_empty)]
pub struct Issuer {
    #[validate(is_rut)]
    pub rut: String,
    pub business_name: String,
    pub commune: String,
}

fn main() {
    let ok = Issuer::new("76086428-5".into(), "ACME SpA".into(), "Santiago".into());
    assert!(ok.is_ok());

    let err = Issuer::new("76086428-5".into(), "  ".into(), "Santiago".into());
    match err {
        Err(IdentityError(message)) => assert!(message.contains("business_name")),
        Ok(_) => panic!("blank name accepted"),
    }
}
