//! Error types shared by the identity, matching and sync layers.

use thiserror::Error;

use crate::config::ConfigError;
use crate::sync::google::GoogleApiError;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid identifier {value:?}: {reason}")]
    InvalidIdentifier { value: String, reason: &'static str },

    #[error("unknown identifier type: {0}")]
    UnknownIdentifierType(String),

    #[error("invalid record {id}: {reason}")]
    InvalidRecord { id: String, reason: &'static str },

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    // Not named `source`: thiserror would treat it as the error cause.
    #[error("sync already in progress for {sync_source}/{account}")]
    AlreadySyncing { sync_source: String, account: String },

    #[error("sync disabled for {sync_source}/{account}")]
    SyncDisabled { sync_source: String, account: String },

    #[error("no provider registered for source {0}")]
    UnknownSource(String),

    #[error("account id required for {0} sync")]
    MissingAccount(String),

    #[error("sync cancelled")]
    Cancelled,

    #[error("database: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("JSON: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Api(#[from] GoogleApiError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("IO: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    /// True when the external API rejected the incremental cursor and a
    /// full resync can recover.
    pub fn is_recoverable_cursor_error(&self) -> bool {
        matches!(self, Self::Api(GoogleApiError::SyncTokenExpired))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cursor_error_classification() {
        assert!(Error::Api(GoogleApiError::SyncTokenExpired).is_recoverable_cursor_error());
        assert!(!Error::Api(GoogleApiError::Unauthorized).is_recoverable_cursor_error());
        assert!(!Error::Cancelled.is_recoverable_cursor_error());
    }

    #[test]
    fn test_not_found_message() {
        let err = Error::not_found("contact", "abc");
        assert_eq!(err.to_string(), "contact not found: abc");
    }
}
