use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::IdentifierType;
use crate::identity::normalize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ContactMethodType {
    #[default]
    EmailPersonal,
    EmailWork,
    Phone,
    Telegram,
    Whatsapp,
    Discord,
    Twitter,
}

impl ContactMethodType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::EmailPersonal => "email_personal",
            Self::EmailWork => "email_work",
            Self::Phone => "phone",
            Self::Telegram => "telegram",
            Self::Whatsapp => "whatsapp",
            Self::Discord => "discord",
            Self::Twitter => "twitter",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "email_work" => Self::EmailWork,
            "phone" => Self::Phone,
            "telegram" => Self::Telegram,
            "whatsapp" => Self::Whatsapp,
            "discord" => Self::Discord,
            "twitter" => Self::Twitter,
            _ => Self::EmailPersonal,
        }
    }

    pub fn is_email(&self) -> bool {
        matches!(self, Self::EmailPersonal | Self::EmailWork)
    }

    /// Identifier type whose normalization applies to values of this method.
    pub fn identifier_type(&self) -> IdentifierType {
        match self {
            Self::EmailPersonal | Self::EmailWork => IdentifierType::Email,
            Self::Phone => IdentifierType::Phone,
            Self::Telegram => IdentifierType::Telegram,
            Self::Whatsapp => IdentifierType::Whatsapp,
            Self::Discord => IdentifierType::Discord,
            Self::Twitter => IdentifierType::Twitter,
        }
    }
}

/// A way to reach a contact. `normalized_value` is what identity matching
/// compares against.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContactMethod {
    pub id: Uuid,
    pub person_id: Uuid,
    pub method_type: ContactMethodType,
    pub value: String,
    pub normalized_value: String,
    pub is_primary: bool,
    pub created_at: DateTime<Utc>,
}

impl ContactMethod {
    pub fn new(person_id: Uuid, method_type: ContactMethodType, value: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            person_id,
            method_type,
            value: value.to_string(),
            normalized_value: normalize::normalize(value, method_type.identifier_type()),
            is_primary: false,
            created_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_normalizes_value() {
        let person_id = Uuid::new_v4();
        let email = ContactMethod::new(person_id, ContactMethodType::EmailWork, " Bob@Example.COM ");
        assert_eq!(email.normalized_value, "bob@example.com");

        let phone = ContactMethod::new(person_id, ContactMethodType::Phone, "(555) 123-4567");
        assert_eq!(phone.normalized_value, "+15551234567");
    }

    #[test]
    fn test_method_type_parse_roundtrip() {
        for t in [
            ContactMethodType::EmailPersonal,
            ContactMethodType::EmailWork,
            ContactMethodType::Phone,
            ContactMethodType::Telegram,
            ContactMethodType::Whatsapp,
        ] {
            assert_eq!(ContactMethodType::parse(t.as_str()), t);
        }
    }
}
