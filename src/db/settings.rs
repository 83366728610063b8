use rusqlite::{params, Row};

use super::Database;
use crate::error::Result;

/// Stored OAuth credentials for one provider account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OAuthToken {
    pub provider: String,
    pub email: String,
    pub refresh_token: String,
    pub access_token: Option<String>,
    /// Unix seconds.
    pub expires_at: Option<i64>,
}

impl OAuthToken {
    /// Usable access token with a 60 second safety margin.
    pub fn valid_access_token(&self, now_unix: i64) -> Option<&str> {
        match (self.access_token.as_deref(), self.expires_at) {
            (Some(token), Some(expires_at)) if now_unix < expires_at - 60 => Some(token),
            (Some(token), None) => Some(token),
            _ => None,
        }
    }
}

impl Database {
    // ==================== APP SETTINGS ====================

    pub fn get_setting(&self, key: &str) -> Result<Option<String>> {
        let result = self.conn().query_row(
            "SELECT value FROM app_settings WHERE key = ?",
            [key],
            |row| row.get(0),
        );

        match result {
            Ok(value) => Ok(Some(value)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        self.conn().execute(
            "INSERT INTO app_settings (key, value) VALUES (?1, ?2)
             ON CONFLICT (key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;
        Ok(())
    }

    pub fn delete_setting(&self, key: &str) -> Result<bool> {
        let rows = self
            .conn()
            .execute("DELETE FROM app_settings WHERE key = ?", [key])?;
        Ok(rows > 0)
    }

    // ==================== OAUTH TOKENS ====================

    fn row_to_oauth_token(row: &Row) -> rusqlite::Result<OAuthToken> {
        Ok(OAuthToken {
            provider: row.get("provider")?,
            email: row.get("email")?,
            refresh_token: row.get("refresh_token")?,
            access_token: row.get("access_token")?,
            expires_at: row.get("expires_at")?,
        })
    }

    pub fn save_oauth_token(&self, token: &OAuthToken) -> Result<()> {
        self.conn().execute(
            "INSERT INTO oauth_tokens (provider, email, refresh_token, access_token, expires_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT (provider, email) DO UPDATE SET
                refresh_token = excluded.refresh_token,
                access_token = excluded.access_token,
                expires_at = excluded.expires_at",
            params![
                token.provider,
                token.email,
                token.refresh_token,
                token.access_token,
                token.expires_at,
            ],
        )?;
        Ok(())
    }

    pub fn get_oauth_token(&self, provider: &str, email: &str) -> Result<Option<OAuthToken>> {
        let conn = self.conn();
        let mut stmt =
            conn.prepare("SELECT * FROM oauth_tokens WHERE provider = ? AND email = ?")?;

        match stmt.query_row(params![provider, email], Self::row_to_oauth_token) {
            Ok(token) => Ok(Some(token)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Accounts connected for a provider, by email.
    pub fn list_oauth_tokens(&self, provider: &str) -> Result<Vec<OAuthToken>> {
        let conn = self.conn();
        let mut stmt =
            conn.prepare("SELECT * FROM oauth_tokens WHERE provider = ? ORDER BY email")?;
        let tokens = stmt
            .query_map([provider], Self::row_to_oauth_token)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(tokens)
    }

    pub fn delete_oauth_token(&self, provider: &str, email: &str) -> Result<bool> {
        let rows = self.conn().execute(
            "DELETE FROM oauth_tokens WHERE provider = ? AND email = ?",
            params![provider, email],
        )?;
        Ok(rows > 0)
    }
}
