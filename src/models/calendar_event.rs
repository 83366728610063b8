use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Attendee {
    pub email: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub response_status: String,
    #[serde(default)]
    pub organizer: bool,
    #[serde(default, rename = "self")]
    pub is_self: bool,
}

/// Persisted snapshot of a calendar event the account holder took part in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalendarEvent {
    pub id: Uuid,
    pub account_id: String,
    pub event_id: String,
    pub title: Option<String>,
    pub description: Option<String>,
    pub location: Option<String>,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub status: String,
    pub user_response: Option<String>,
    pub organizer_email: Option<String>,
    pub attendees: Vec<Attendee>,
    pub matched_contact_ids: Vec<Uuid>,
    pub html_link: Option<String>,
    /// Set once the matched contacts' last_contacted has been bumped.
    /// Survives re-syncs of the same event.
    pub last_contacted_updated: bool,
    pub synced_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CalendarEvent {
    pub fn new(account_id: &str, event_id: &str, start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            account_id: account_id.to_string(),
            event_id: event_id.to_string(),
            title: None,
            description: None,
            location: None,
            start_time: start,
            end_time: end,
            status: "confirmed".to_string(),
            user_response: None,
            organizer_email: None,
            attendees: Vec::new(),
            matched_contact_ids: Vec::new(),
            html_link: None,
            last_contacted_updated: false,
            synced_at: now,
            created_at: now,
            updated_at: now,
        }
    }
}
