// libs/agenda-cell/src/services/identity.rs
//
// Patient identity normalisation. Everything here runs before a booking write.

use std::sync::OnceLock;

use regex::Regex;
use thiserror::Error;

use crate::models::PatientIdentity;

pub const MIN_NAME_CHARS: usize = 3;
pub const MIN_PHONE_DIGITS: usize = 8;
pub const MAX_PHONE_DIGITS: usize = 15;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IdentityError {
    #[error("name must have at least {MIN_NAME_CHARS} characters")]
    Name,

    #[error("RUT {0:?} is not valid")]
    Rut(String),

    #[error("phone {0:?} must have between {MIN_PHONE_DIGITS} and {MAX_PHONE_DIGITS} digits")]
    Phone(String),
}

fn rut_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"^(\d{1,8})-?([0-9K])$").ok())
        .as_ref()
}

/// Modulo-11 check digit of a RUT body.
pub fn rut_check_digit(body: u32) -> char {
    let mut remaining = body;
    let mut sum = 0;
    let mut factor = 2;
    while remaining > 0 {
        sum += (remaining % 10) * factor;
        remaining /= 10;
        factor = if factor == 7 { 2 } else { factor + 1 };
    }

    match 11 - (sum % 11) {
        11 => '0',
        10 => 'K',
        digit => char::from_digit(digit, 10).unwrap_or('0'),
    }
}

/// Accepts `12.345.678-5`, `12345678-5` or `123456785` (and a lowercase `k`),
/// returning the canonical `12345678-5` when the check digit matches.
pub fn normalize_rut(raw: &str) -> Option<String> {
    let compact: String = raw
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '.')
        .collect::<String>()
        .to_uppercase();

    let captures = rut_pattern()?.captures(&compact)?;
    let body: u32 = captures.get(1)?.as_str().parse().ok()?;
    let check = captures.get(2)?.as_str().chars().next()?;

    if rut_check_digit(body) != check {
        return None;
    }
    Some(format!("{}-{}", body, check))
}

/// Keeps only digits; a leading `+` and separators are dropped.
pub fn normalize_phone(raw: &str) -> Option<String> {
    let digits: String = raw.chars().filter(|c| c.is_ascii_digit()).collect();
    let has_letters = raw.chars().any(|c| c.is_alphabetic());

    if has_letters || digits.len() < MIN_PHONE_DIGITS || digits.len() > MAX_PHONE_DIGITS {
        return None;
    }
    Some(digits)
}

/// Trims and collapses inner whitespace.
pub fn normalize_name(raw: &str) -> Option<String> {
    let name = raw.split_whitespace().collect::<Vec<_>>().join(" ");
    if name.chars().count() < MIN_NAME_CHARS {
        return None;
    }
    Some(name)
}

pub fn validate_patient(patient: &PatientIdentity) -> Result<PatientIdentity, IdentityError> {
    let name = normalize_name(&patient.name).ok_or(IdentityError::Name)?;
    let rut = normalize_rut(&patient.rut).ok_or_else(|| IdentityError::Rut(patient.rut.clone()))?;
    let phone = normalize_phone(&patient.phone)
        .ok_or_else(|| IdentityError::Phone(patient.phone.clone()))?;

    Ok(PatientIdentity { name, rut, phone })
}
