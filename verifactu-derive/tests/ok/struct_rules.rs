use verifactu_derive::Validate;

#[derive(Validate)]
#[validate(non_empty, no_delimiter)]
pub struct Line {
    pub series: String,
    pub amount: String,
}

fn main() {
    assert!(Line::new("A".into(), "121.00".into()).is_ok());
    assert!(Line::new("A;B".into(), "121.00".into()).is_err());
    assert!(Line::new("A".into(), "1|2".into()).is_err());
}
