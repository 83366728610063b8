//! Google Calendar API v3: event listing.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Deserialize;

use super::{read_json, GoogleApiError, TokenSource};
use crate::error::Result;
use crate::models::Attendee;

const DEFAULT_BASE_URL: &str = "https://www.googleapis.com/calendar/v3";
const PAGE_SIZE: &str = "250";

// ============================================================================
// API response types (deserialized from Google Calendar JSON)
// ============================================================================

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventsPage {
    #[serde(default)]
    pub items: Vec<GoogleEvent>,
    pub next_page_token: Option<String>,
    pub next_sync_token: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GoogleEvent {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub html_link: Option<String>,
    pub start: Option<EventDateTime>,
    pub end: Option<EventDateTime>,
    #[serde(default)]
    pub attendees: Vec<Attendee>,
    pub organizer: Option<Organizer>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventDateTime {
    pub date_time: Option<String>,
    /// Set instead of `date_time` for all-day entries.
    pub date: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Organizer {
    #[serde(default)]
    pub email: String,
    #[serde(rename = "self", default)]
    pub is_self: bool,
}

impl GoogleEvent {
    pub fn is_all_day(&self) -> bool {
        self.start
            .as_ref()
            .map_or(false, |s| s.date_time.is_none() && s.date.is_some())
    }

    pub fn is_cancelled(&self) -> bool {
        self.status.as_deref() == Some("cancelled")
    }

    pub fn start_time(&self) -> Option<DateTime<Utc>> {
        self.start.as_ref().and_then(|s| parse_event_datetime(s.date_time.as_deref()?))
    }

    pub fn end_time(&self) -> Option<DateTime<Utc>> {
        self.end.as_ref().and_then(|s| parse_event_datetime(s.date_time.as_deref()?))
    }

    pub fn organizer_email(&self) -> Option<&str> {
        self.organizer
            .as_ref()
            .map(|o| o.email.as_str())
            .filter(|e| !e.is_empty())
    }
}

fn parse_event_datetime(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

// ============================================================================
// Calendar API
// ============================================================================

/// Which slice of the primary calendar to list.
#[derive(Debug, Clone, PartialEq)]
pub enum EventsQuery {
    /// Full listing over a time window; the last page carries a sync token.
    Window {
        time_min: DateTime<Utc>,
        time_max: DateTime<Utc>,
    },
    /// Changes since a previous sync token.
    Incremental { sync_token: String },
}

#[async_trait]
pub trait CalendarApi: Send + Sync {
    /// One page of events for `account`'s primary calendar.
    async fn list_events(
        &self,
        account: &str,
        query: &EventsQuery,
        page_token: Option<&str>,
    ) -> Result<EventsPage>;
}

pub struct GoogleCalendarClient {
    http: reqwest::Client,
    tokens: Arc<dyn TokenSource>,
    base_url: String,
}

impl GoogleCalendarClient {
    pub fn new(tokens: Arc<dyn TokenSource>) -> Self {
        Self::with_base_url(tokens, DEFAULT_BASE_URL)
    }

    pub fn with_base_url(tokens: Arc<dyn TokenSource>, base_url: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            tokens,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl CalendarApi for GoogleCalendarClient {
    async fn list_events(
        &self,
        account: &str,
        query: &EventsQuery,
        page_token: Option<&str>,
    ) -> Result<EventsPage> {
        let access_token = self.tokens.access_token(account)?;

        let mut request = self
            .http
            .get(format!("{}/calendars/primary/events", self.base_url))
            .bearer_auth(access_token)
            .query(&[("maxResults", PAGE_SIZE), ("singleEvents", "true")]);

        request = match query {
            EventsQuery::Window { time_min, time_max } => request.query(&[
                ("timeMin", time_min.to_rfc3339_opts(SecondsFormat::Secs, true)),
                ("timeMax", time_max.to_rfc3339_opts(SecondsFormat::Secs, true)),
                ("orderBy", "startTime".to_string()),
            ]),
            EventsQuery::Incremental { sync_token } => {
                request.query(&[("syncToken", sync_token.as_str())])
            }
        };

        if let Some(token) = page_token {
            request = request.query(&[("pageToken", token)]);
        }

        let resp = request.send().await.map_err(GoogleApiError::Transport)?;
        Ok(read_json(resp).await?)
    }
}
