//! Builtin validation rules.
//!
//! Each rule expands to a block that checks `value: &str` and returns early
//! with `E::from(String)` on failure.

use proc_macro2::TokenStream;
use quote::quote;

pub(crate) fn dispatch(rule: &str, field: &str) -> Option<TokenStream> {
    match rule {
        "non_empty" => Some(non_empty(field)),
        "no_delimiter" => Some(no_delimiter(field)),
        "no_control_chars" => Some(no_control_chars(field)),
        _ => None,
    }
}

fn non_empty(field: &str) -> TokenStream {
    quote! {
        if value.trim().is_empty() {
            return Err(E::from(format!("{} must be non-empty", #field)));
        }
    }
}

/// `;` separates verification payload fields and `|` separates fingerprint
/// input fields; neither may appear inside a value.
fn no_delimiter(field: &str) -> TokenStream {
    quote! {
        if value.contains([';', '|']) {
            return Err(E::from(format!("{} must not contain ';' or '|'", #field)));
        }
    }
}

fn no_control_chars(field: &str) -> TokenStream {
    quote! {
        if value.chars().any(char::is_control) {
            return Err(E::from(format!("{} must not contain control characters", #field)));
        }
    }
}
