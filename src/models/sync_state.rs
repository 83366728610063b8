use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    #[default]
    Idle,
    Syncing,
    Error,
    Disabled,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Syncing => "syncing",
            Self::Error => "error",
            Self::Disabled => "disabled",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "syncing" => Self::Syncing,
            "error" => Self::Error,
            "disabled" => Self::Disabled,
            _ => Self::Idle,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SyncStrategy {
    /// Caller queries the source for contacts it already knows.
    ContactDriven,
    /// Pull everything and discover matches.
    #[default]
    FetchAll,
    /// Pull a filtered subset and discover matches.
    FetchFiltered,
}

impl SyncStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ContactDriven => "contact_driven",
            Self::FetchAll => "fetch_all",
            Self::FetchFiltered => "fetch_filtered",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "contact_driven" => Self::ContactDriven,
            "fetch_filtered" => Self::FetchFiltered,
            _ => Self::FetchAll,
        }
    }
}

/// Scheduling and cursor state for one (source, account) pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncState {
    pub id: Uuid,
    pub source: String,
    /// Empty for single-account sources.
    pub account_id: String,
    pub enabled: bool,
    pub status: SyncStatus,
    pub strategy: SyncStrategy,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub last_successful_sync_at: Option<DateTime<Utc>>,
    pub next_sync_at: Option<DateTime<Utc>>,
    pub sync_cursor: Option<String>,
    pub error_message: Option<String>,
    pub error_count: i64,
    pub metadata: Map<String, Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SyncState {
    pub fn new(source: &str, account_id: &str, strategy: SyncStrategy) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            source: source.to_string(),
            account_id: account_id.to_string(),
            enabled: true,
            status: SyncStatus::Idle,
            strategy,
            last_sync_at: None,
            last_successful_sync_at: None,
            next_sync_at: None,
            sync_cursor: None,
            error_message: None,
            error_count: 0,
            metadata: Map::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Cursor to resume from, treating an empty string as none.
    pub fn cursor(&self) -> Option<&str> {
        self.sync_cursor.as_deref().filter(|c| !c.is_empty())
    }

    pub fn account(&self) -> Option<&str> {
        Some(self.account_id.as_str()).filter(|a| !a.is_empty())
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.enabled
            && !matches!(self.status, SyncStatus::Syncing | SyncStatus::Disabled)
            && self.next_sync_at.map_or(true, |at| at <= now)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SyncLogStatus {
    #[default]
    Running,
    Success,
    Error,
}

impl SyncLogStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Success => "success",
            Self::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "success" => Self::Success,
            "error" => Self::Error,
            _ => Self::Running,
        }
    }
}

/// Audit row for one sync run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncLog {
    pub id: Uuid,
    pub sync_state_id: Uuid,
    pub source: String,
    pub account_id: String,
    pub status: SyncLogStatus,
    pub items_processed: i64,
    pub items_matched: i64,
    pub items_created: i64,
    pub error_message: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_is_due() {
        let now = Utc::now();
        let mut state = SyncState::new("gcal", "me@example.com", SyncStrategy::FetchAll);
        assert!(state.is_due(now));

        state.next_sync_at = Some(now + Duration::minutes(5));
        assert!(!state.is_due(now));

        state.next_sync_at = Some(now);
        assert!(state.is_due(now));

        state.status = SyncStatus::Syncing;
        assert!(!state.is_due(now));

        state.status = SyncStatus::Error;
        assert!(state.is_due(now));

        state.enabled = false;
        assert!(!state.is_due(now));
    }

    #[test]
    fn test_empty_cursor_is_none() {
        let mut state = SyncState::new("gcal", "", SyncStrategy::FetchAll);
        state.sync_cursor = Some(String::new());
        assert!(state.cursor().is_none());
        assert!(state.account().is_none());
    }
}
