//! Google Calendar and People API clients.
//!
//! Both clients sit behind traits so the providers can be driven by
//! in-memory fakes. Access tokens come from a [`TokenSource`]; acquiring
//! and refreshing them is handled elsewhere.

pub mod calendar;
pub mod people;

use std::time::{SystemTime, UNIX_EPOCH};

use reqwest::StatusCode;

use crate::db::Database;
use crate::error::{Error, Result};

pub use calendar::{CalendarApi, EventsPage, EventsQuery, GoogleCalendarClient, GoogleEvent};
pub use people::{ConnectionsPage, GooglePeopleClient, GooglePerson, PeopleApi};

/// Provider name for stored OAuth tokens.
pub const PROVIDER_GOOGLE: &str = "google";

#[derive(Debug, thiserror::Error)]
pub enum GoogleApiError {
    #[error("sync token expired, full sync required")]
    SyncTokenExpired,
    #[error("token expired or revoked")]
    Unauthorized,
    #[error("rate limited")]
    RateLimited,
    #[error("API error {status}: {body}")]
    Http { status: u16, body: String },
    #[error("HTTP: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("JSON: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("no Google token for {0}")]
    MissingToken(String),
}

/// Map a failed response to an error. Calendar reports a rejected sync
/// token as 410 `fullSyncRequired`, People as 400 `EXPIRED_SYNC_TOKEN`.
pub(crate) fn classify_failure(status: StatusCode, body: String) -> GoogleApiError {
    match status {
        StatusCode::UNAUTHORIZED => GoogleApiError::Unauthorized,
        StatusCode::GONE => GoogleApiError::SyncTokenExpired,
        StatusCode::TOO_MANY_REQUESTS => GoogleApiError::RateLimited,
        StatusCode::BAD_REQUEST
            if body.contains("EXPIRED_SYNC_TOKEN") || body.contains("fullSyncRequired") =>
        {
            GoogleApiError::SyncTokenExpired
        }
        _ => GoogleApiError::Http {
            status: status.as_u16(),
            body,
        },
    }
}

/// Decode a JSON body or classify the failure.
pub(crate) async fn read_json<T: serde::de::DeserializeOwned>(
    resp: reqwest::Response,
) -> Result<T, GoogleApiError> {
    let status = resp.status();
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        return Err(classify_failure(status, body));
    }
    let bytes = resp.bytes().await?;
    Ok(serde_json::from_slice(&bytes)?)
}

/// Supplies bearer tokens per connected account.
pub trait TokenSource: Send + Sync {
    fn access_token(&self, account: &str) -> Result<String>;

    /// Connected account emails.
    fn accounts(&self) -> Result<Vec<String>>;
}

impl TokenSource for Database {
    fn access_token(&self, account: &str) -> Result<String> {
        let token = self
            .get_oauth_token(PROVIDER_GOOGLE, account)?
            .ok_or_else(|| GoogleApiError::MissingToken(account.to_string()))?;

        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);

        token
            .valid_access_token(now)
            .map(String::from)
            .ok_or(Error::Api(GoogleApiError::Unauthorized))
    }

    fn accounts(&self) -> Result<Vec<String>> {
        Ok(self
            .list_oauth_tokens(PROVIDER_GOOGLE)?
            .into_iter()
            .map(|t| t.email)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::OAuthToken;

    #[test]
    fn test_classify_failure() {
        assert!(matches!(
            classify_failure(StatusCode::GONE, String::new()),
            GoogleApiError::SyncTokenExpired
        ));
        assert!(matches!(
            classify_failure(
                StatusCode::BAD_REQUEST,
                r#"{"error":{"status":"FAILED_PRECONDITION","details":[{"reason":"EXPIRED_SYNC_TOKEN"}]}}"#.into()
            ),
            GoogleApiError::SyncTokenExpired
        ));
        assert!(matches!(
            classify_failure(StatusCode::UNAUTHORIZED, String::new()),
            GoogleApiError::Unauthorized
        ));
        assert!(matches!(
            classify_failure(StatusCode::BAD_REQUEST, "bad field".into()),
            GoogleApiError::Http { status: 400, .. }
        ));
    }

    #[test]
    fn test_database_token_source() {
        let db = Database::open_memory().unwrap();
        assert!(matches!(
            db.access_token("me@example.com"),
            Err(Error::Api(GoogleApiError::MissingToken(_)))
        ));

        db.save_oauth_token(&OAuthToken {
            provider: PROVIDER_GOOGLE.into(),
            email: "me@example.com".into(),
            refresh_token: "r".into(),
            access_token: Some("live".into()),
            expires_at: None,
        })
        .unwrap();
        db.save_oauth_token(&OAuthToken {
            provider: PROVIDER_GOOGLE.into(),
            email: "old@example.com".into(),
            refresh_token: "r".into(),
            access_token: Some("stale".into()),
            expires_at: Some(1),
        })
        .unwrap();

        assert_eq!(db.access_token("me@example.com").unwrap(), "live");
        assert!(matches!(
            db.access_token("old@example.com"),
            Err(Error::Api(GoogleApiError::Unauthorized))
        ));
        assert_eq!(
            db.accounts().unwrap(),
            vec!["me@example.com".to_string(), "old@example.com".to_string()]
        );
    }
}
