//! Identifier normalization.
//!
//! Pure functions that turn raw emails, phone numbers and messaging handles
//! into the canonical form stored in the identity cache and compared against
//! contact methods. Every normalizer is idempotent.

use crate::error::{Error, Result};
use crate::models::{ContactMethodType, IdentifierType};

pub fn normalize(raw: &str, identifier_type: IdentifierType) -> String {
    match identifier_type {
        IdentifierType::Email | IdentifierType::ImessageEmail => normalize_email(raw),
        IdentifierType::Phone | IdentifierType::ImessagePhone | IdentifierType::Whatsapp => {
            normalize_phone(raw)
        }
        IdentifierType::Telegram | IdentifierType::Discord | IdentifierType::Twitter => {
            normalize_handle(raw)
        }
    }
}

pub fn normalize_email(raw: &str) -> String {
    raw.trim().to_lowercase()
}

/// Normalize a phone number to E.164-like form.
///
/// Ten bare digits are assumed to be a US number. Numbers from other
/// countries written without a country code come out wrong; there is no
/// locale to consult here.
pub fn normalize_phone(raw: &str) -> String {
    let trimmed = raw.trim();
    let has_plus = trimmed.starts_with('+');
    let digits: String = trimmed.chars().filter(|c| c.is_ascii_digit()).collect();

    if digits.is_empty() {
        return String::new();
    }
    if has_plus {
        return format!("+{}", digits);
    }
    if digits.len() == 10 {
        return format!("+1{}", digits);
    }
    format!("+{}", digits)
}

/// Strip formatting but keep the digits as written, with a leading `+` if
/// one was present. Used for loose overlap checks where no country code can
/// be assumed.
pub fn normalize_phone_loose(raw: &str) -> String {
    let trimmed = raw.trim();
    let digits: String = trimmed.chars().filter(|c| c.is_ascii_digit()).collect();
    if trimmed.starts_with('+') && !digits.is_empty() {
        format!("+{}", digits)
    } else {
        digits
    }
}

pub fn normalize_handle(raw: &str) -> String {
    raw.trim().trim_start_matches('@').trim().to_lowercase()
}

/// Validate a raw identifier and return its normalized form.
pub fn validate(raw: &str, identifier_type: IdentifierType) -> Result<String> {
    let invalid = |reason| Error::InvalidIdentifier {
        value: raw.to_string(),
        reason,
    };

    let normalized = normalize(raw, identifier_type);
    if normalized.is_empty() {
        return Err(invalid("empty after normalization"));
    }

    if identifier_type.is_email_like() {
        let mut parts = normalized.split('@');
        let local = parts.next().unwrap_or("");
        let domain = parts.next().unwrap_or("");
        if local.is_empty() || domain.is_empty() || parts.next().is_some() {
            return Err(invalid("expected local@domain"));
        }
        if normalized.chars().any(char::is_whitespace) {
            return Err(invalid("email contains whitespace"));
        }
    } else if !identifier_type.is_phone_like() && normalized.chars().any(char::is_whitespace) {
        return Err(invalid("handle contains whitespace"));
    }

    Ok(normalized)
}

/// Guess whether an identifier is an email or a phone number. Used for
/// sources such as iMessage where either can appear in the same field.
pub fn detect_identifier_type(raw: &str) -> IdentifierType {
    let trimmed = raw.trim();

    if trimmed.contains('@') {
        return IdentifierType::Email;
    }
    if trimmed.starts_with('+') {
        return IdentifierType::Phone;
    }

    let total = trimmed.chars().count();
    let digits = trimmed.chars().filter(|c| c.is_ascii_digit()).count();
    if digits >= 7 && digits as f64 / total as f64 > 0.5 {
        return IdentifierType::Phone;
    }

    IdentifierType::Email
}

/// Contact method types an identifier of this type can match exactly.
pub fn method_types_for(identifier_type: IdentifierType) -> &'static [ContactMethodType] {
    match identifier_type {
        IdentifierType::Email | IdentifierType::ImessageEmail => {
            &[ContactMethodType::EmailPersonal, ContactMethodType::EmailWork]
        }
        IdentifierType::Phone | IdentifierType::ImessagePhone => &[ContactMethodType::Phone],
        IdentifierType::Whatsapp => &[ContactMethodType::Whatsapp, ContactMethodType::Phone],
        IdentifierType::Telegram => &[ContactMethodType::Telegram],
        IdentifierType::Discord => &[ContactMethodType::Discord],
        IdentifierType::Twitter => &[ContactMethodType::Twitter],
    }
}
