//! Kenyan mobile number handling.
//!
//! M-Pesa expects subscriber numbers in international form without the plus
//! sign (`2547XXXXXXXX` or `2541XXXXXXXX`). Customers type them in every
//! local variant, so everything entering the booking flow is normalised here.

use crate::utils::error::AppError;

const COUNTRY_CODE: &str = "254";
const SUBSCRIBER_DIGITS: usize = 9;

/// Normalises a Kenyan mobile number to `254XXXXXXXXX`.
pub fn normalize_msisdn(input: &str) -> Result<String, AppError> {
    let compact: String = input
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '-')
        .collect();
    let digits = compact.strip_prefix('+').unwrap_or(&compact);

    if !digits.chars().all(|c| c.is_ascii_digit()) {
        return Err(invalid(input));
    }

    let subscriber = if digits.len() == COUNTRY_CODE.len() + SUBSCRIBER_DIGITS {
        digits.strip_prefix(COUNTRY_CODE)
    } else if digits.len() == SUBSCRIBER_DIGITS + 1 {
        digits.strip_prefix('0')
    } else if digits.len() == SUBSCRIBER_DIGITS {
        Some(digits)
    } else {
        None
    };

    match subscriber {
        Some(rest) if rest.starts_with('7') || rest.starts_with('1') => {
            Ok(format!("{COUNTRY_CODE}{rest}"))
        }
        _ => Err(invalid(input)),
    }
}

/// Masks all but the last three digits, for logs.
pub fn mask_msisdn(msisdn: &str) -> String {
    let keep = 3.min(msisdn.len());
    let (hidden, shown) = msisdn.split_at(msisdn.len() - keep);
    format!("{}{}", "*".repeat(hidden.len()), shown)
}

fn invalid(input: &str) -> AppError {
    AppError::ValidationError(format!(
        "'{}' is not a valid Kenyan mobile number (use 07XXXXXXXX or 2547XXXXXXXX)",
        input.trim()
    ))
}
