use dte_derive::Validate;

#[derive(Validate)]
pub struct Recipient {
    #[validate(is_rut)]
    pub rut: String,
    pub name: String,
}

fn main() {
    let r = Recipient::new("66666666-6".into(), "Cliente".into());
    assert!(r.is_ok());

    let bad = Recipient::new("66666666-1".into(), "Cliente".into());
    assert!(bad.is_err());
}
