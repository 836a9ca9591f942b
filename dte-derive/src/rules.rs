//! Builtin validation rules.
//!
//! Each rule expands to a guard that returns early with `E::from(String)`,
//! where `E` is the error type named by `#[validate_error(..)]`.

use proc_macro2::{Ident, TokenStream};
use quote::quote;

pub(crate) fn dispatch(rule: &str, field: &Ident) -> Option<TokenStream> {
    match rule {
        "non_empty" => Some(non_empty(field)),
        "is_rut" => Some(is_rut(field)),
        _ => None,
    }
}

fn non_empty(value: &Ident) -> TokenStream {
    quote! {
        if #value.trim().is_empty() {
            return Err(E::from(format!("{} must be non-empty", stringify!(#value))));
        }
    }
}

/// RUT in `12345678-5` form; the check digit is mod 11 with `K` standing for 10.
fn is_rut(value: &Ident) -> TokenStream {
    quote! {
        {
            let normalized: String = #value
                .chars()
                .filter(|c| *c != '.')
                .collect::<String>()
                .to_ascii_uppercase();
            let valid = match normalized.split_once('-') {
                Some((body, dv))
                    if !body.is_empty()
                        && body.len() <= 9
                        && body.bytes().all(|b| b.is_ascii_digit())
                        && dv.len() == 1 =>
                {
                    let mut sum = 0u32;
                    let mut factor = 2u32;
                    for digit in body.bytes().rev() {
                        sum += u32::from(digit - b'0') * factor;
                        factor = if factor == 7 { 2 } else { factor + 1 };
                    }
                    let expected = match 11 - (sum % 11) {
                        11 => '0',
                        10 => 'K',
                        d => char::from(b'0' + d as u8),
                    };
                    dv.starts_with(expected)
                }
                _ => false,
            };
            if !valid {
                return Err(E::from(format!(
                    "{} must be a valid RUT, got '{}'",
                    stringify!(#value),
                    #value
                )));
            }
        }
    }
}
