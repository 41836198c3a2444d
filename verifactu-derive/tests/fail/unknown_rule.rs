use verifactu_derive::Validate;

#[derive(Validate)]
pub struct Line {
    #[validate(upper_case)]
    pub series: String,
}

fn main() {}
