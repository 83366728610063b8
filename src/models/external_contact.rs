use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum MatchStatus {
    #[default]
    Unmatched,
    Matched,
    Ignored,
    Imported,
}

impl MatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unmatched => "unmatched",
            Self::Matched => "matched",
            Self::Ignored => "ignored",
            Self::Imported => "imported",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "matched" => Self::Matched,
            "ignored" => Self::Ignored,
            "imported" => Self::Imported,
            _ => Self::Unmatched,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct EmailEntry {
    pub value: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub primary: bool,
}

impl EmailEntry {
    pub fn new(value: &str) -> Self {
        Self {
            value: value.to_string(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct PhoneEntry {
    pub value: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub primary: bool,
}

impl PhoneEntry {
    pub fn new(value: &str) -> Self {
        Self {
            value: value.to_string(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct AddressEntry {
    pub formatted: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
}

/// Snapshot of one record from an external source, or an import candidate
/// built from a calendar attendee.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExternalContact {
    pub id: Uuid,
    pub source: String,
    pub source_id: String,
    /// Empty when the source has no notion of accounts.
    pub account_id: String,
    pub display_name: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub emails: Vec<EmailEntry>,
    pub phones: Vec<PhoneEntry>,
    pub addresses: Vec<AddressEntry>,
    pub organization: Option<String>,
    pub job_title: Option<String>,
    pub birthday: Option<NaiveDate>,
    pub photo_url: Option<String>,
    pub etag: Option<String>,
    pub crm_contact_id: Option<Uuid>,
    pub match_status: MatchStatus,
    pub duplicate_of_id: Option<Uuid>,
    pub metadata: Map<String, Value>,
    pub times_seen: i64,
    pub synced_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ExternalContact {
    /// Name used when searching for similar CRM contacts.
    pub fn candidate_name(&self) -> Option<String> {
        if let Some(name) = self.display_name.as_deref().filter(|s| !s.trim().is_empty()) {
            return Some(name.to_string());
        }
        match (self.first_name.as_deref(), self.last_name.as_deref()) {
            (Some(first), Some(last)) => Some(format!("{} {}", first, last)),
            (Some(first), None) => Some(first.to_string()),
            _ => None,
        }
    }

    /// True when this upsert inserted the row rather than updating it.
    pub fn was_created(&self) -> bool {
        self.times_seen == 1
    }

    pub fn is_duplicate(&self) -> bool {
        self.duplicate_of_id.is_some()
    }
}

/// Fields written on each sync pass. Identity and match columns are owned
/// by the store and by matching, not by the source.
#[derive(Debug, Clone, Default)]
pub struct ExternalContactUpsert {
    pub source: String,
    pub source_id: String,
    pub account_id: String,
    pub display_name: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub emails: Vec<EmailEntry>,
    pub phones: Vec<PhoneEntry>,
    pub addresses: Vec<AddressEntry>,
    pub organization: Option<String>,
    pub job_title: Option<String>,
    pub birthday: Option<NaiveDate>,
    pub photo_url: Option<String>,
    pub etag: Option<String>,
    pub metadata: Map<String, Value>,
    pub synced_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_email_entry_serialization_omits_defaults() {
        let json = serde_json::to_string(&EmailEntry::new("a@b.com")).unwrap();
        assert_eq!(json, r#"{"value":"a@b.com"}"#);

        let parsed: EmailEntry =
            serde_json::from_str(r#"{"value":"x@y.com","kind":"work","primary":true}"#).unwrap();
        assert!(parsed.primary);
        assert_eq!(parsed.kind.as_deref(), Some("work"));
    }
}
