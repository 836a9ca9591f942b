use dte_derive::Validate;

#[derive(Validate)]
#[validate(non_empty)]
pub struct Line {
    pub name: String,

    #[validate(skip)]
    pub quantity: u32,
}

fn main() {
    let l = Line::new("Servicio".into(), 2);
    assert!(l.is_ok());
}
