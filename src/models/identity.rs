use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};

/// Kind of raw identifier observed from an external source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentifierType {
    Email,
    Phone,
    Telegram,
    ImessageEmail,
    ImessagePhone,
    Whatsapp,
    Discord,
    Twitter,
}

impl IdentifierType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Email => "email",
            Self::Phone => "phone",
            Self::Telegram => "telegram",
            Self::ImessageEmail => "imessage_email",
            Self::ImessagePhone => "imessage_phone",
            Self::Whatsapp => "whatsapp",
            Self::Discord => "discord",
            Self::Twitter => "twitter",
        }
    }

    /// Unknown names are a validation error, not a silent default.
    pub fn parse(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "email" => Ok(Self::Email),
            "phone" => Ok(Self::Phone),
            "telegram" => Ok(Self::Telegram),
            "imessage_email" => Ok(Self::ImessageEmail),
            "imessage_phone" => Ok(Self::ImessagePhone),
            "whatsapp" => Ok(Self::Whatsapp),
            "discord" => Ok(Self::Discord),
            "twitter" => Ok(Self::Twitter),
            _ => Err(Error::UnknownIdentifierType(s.to_string())),
        }
    }

    pub fn is_email_like(&self) -> bool {
        matches!(self, Self::Email | Self::ImessageEmail)
    }

    pub fn is_phone_like(&self) -> bool {
        matches!(self, Self::Phone | Self::ImessagePhone | Self::Whatsapp)
    }
}

/// Provenance of an identity-to-contact link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum MatchType {
    #[default]
    Unmatched,
    Exact,
    Fuzzy,
    Manual,
}

impl MatchType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unmatched => "unmatched",
            Self::Exact => "exact",
            Self::Fuzzy => "fuzzy",
            Self::Manual => "manual",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "exact" => Self::Exact,
            "fuzzy" => Self::Fuzzy,
            "manual" => Self::Manual,
            _ => Self::Unmatched,
        }
    }
}

/// Cached resolution of one (identifier, type, source) to a contact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExternalIdentity {
    pub id: Uuid,
    pub identifier: String,
    pub identifier_type: IdentifierType,
    pub raw_identifier: Option<String>,
    pub source: String,
    pub source_id: Option<String>,
    pub contact_id: Option<Uuid>,
    pub match_type: MatchType,
    pub match_confidence: Option<f64>,
    pub display_name: Option<String>,
    pub last_seen_at: Option<DateTime<Utc>>,
    pub message_count: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ExternalIdentity {
    pub fn is_matched(&self) -> bool {
        self.contact_id.is_some()
    }
}
