use verifactu_derive::Validate;

#[derive(Validate)]
pub struct Issuer {
    pub name: String,
    #[validate(non_empty)]
    pub tax_id: String,
}

fn main() {
    let ok = Issuer::new("Acme".into(), "B12345678".into());
    assert!(ok.is_ok());

    let err = Issuer::new("Acme".into(), "  ".into());
    assert_eq!(err.err().as_deref(), Some("tax_id must be non-empty"));
}
