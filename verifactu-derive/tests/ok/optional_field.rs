use verifactu_derive::Validate;

#[derive(Debug)]
pub struct FieldError(String);

impl From<String> for FieldError {
    fn from(message: String) -> Self {
        FieldError(message)
    }
}

#[derive(Validate)]
#[validate_error(FieldError)]
pub struct Key {
    #[validate(non_empty, no_control_chars)]
    pub series: Option<String>,
}

fn main() {
    assert!(Key::new(None).is_ok());
    assert!(Key::new(Some("A".into())).is_ok());
    let err = Key::new(Some("".into())).err().expect("empty series rejected");
    assert_eq!(err.0, "series must be non-empty");
    assert!(Key::new(Some("A\n".into())).is_err());
}
