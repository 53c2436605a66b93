//! Phone number canonicalization and deterministic contact identity.
//!
//! Contacts are keyed by (account, canonical E.164 number) so re-enrolling
//! the same number updates the existing record instead of duplicating it.

use uuid::Uuid;

use crate::error::{Error, Result};

/// UUIDv5 namespace for contact identity derivation.
pub const CONTACT_NAMESPACE: Uuid = Uuid::from_u128(0x8c5f2a10_4b6e_4d0a_9f3c_2e7b1d6a5c44);

/// Canonicalize a raw phone number to E.164.
///
/// Accepts already-prefixed international numbers and bare US national
/// numbers (10 digits, or 11 with a leading 1). Everything else is rejected
/// at the edge so malformed numbers never reach correlation.
pub fn canonicalize(raw: &str) -> Result<String> {
    let trimmed = raw.trim();
    let has_plus = trimmed.starts_with('+');
    let digits: String = trimmed.chars().filter(|c| c.is_ascii_digit()).collect();

    if digits.is_empty() {
        return Err(Error::InvalidInput(format!(
            "phone number has no digits: {raw:?}"
        )));
    }

    if has_plus {
        // E.164: country code + subscriber, 8..=15 digits total.
        if (8..=15).contains(&digits.len()) && !digits.starts_with('0') {
            return Ok(format!("+{digits}"));
        }
        return Err(Error::InvalidInput(format!(
            "not a valid E.164 number: {raw:?}"
        )));
    }

    match digits.len() {
        10 => Ok(format!("+1{digits}")),
        11 if digits.starts_with('1') => Ok(format!("+{digits}")),
        _ => Err(Error::InvalidInput(format!(
            "cannot infer country code for {raw:?}"
        ))),
    }
}

/// Derive the deterministic contact id for a canonical phone number within
/// an account.
pub fn contact_id(account_id: Uuid, canonical_phone: &str) -> Uuid {
    let name = format!("{account_id}:{canonical_phone}");
    Uuid::new_v5(&CONTACT_NAMESPACE, name.as_bytes())
}
