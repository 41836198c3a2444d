use verifactu_derive::Validate;

#[derive(Validate)]
#[validate(non_empty)]
pub struct Sample {
    pub name: String,

    #[validate(skip)]
    pub year: i32,
}

fn main() {
    let s = Sample::new("test".into(), 2024);
    assert!(s.is_ok());
}
