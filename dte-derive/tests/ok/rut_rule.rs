use dte_derive::Validate;

#[derive(Validate)]
pub struct Sender {
    #[validate(is_rut)]
    pub rut: String,
}

fn main() {
    // check digit K and dotted form
    assert!(Sender::new("60803000-K".into()).is_ok());
    assert!(Sender::new("60.803.000-k".into()).is_ok());
    assert!(Sender::new("11111111-1".into()).is_ok());
    assert!(Sender::new("12345678-5".into()).is_ok());
    assert!(Sender::new("12345678".into()).is_err());
    assert!(Sender::new("abc-1".into()).is_err());
}
