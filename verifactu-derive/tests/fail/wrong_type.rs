use verifactu_derive::Validate;

#[derive(Validate)]
#[validate(non_empty)]
pub struct Line {
    pub series: String,
    pub amount: u32,
}

fn main() {}
