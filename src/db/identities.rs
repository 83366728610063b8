use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};
use uuid::Uuid;

use super::{parse_opt_ts, parse_opt_uuid, parse_ts, parse_uuid, ts, Database};
use crate::error::{Error, Result};
use crate::identity::{IdentityStore, IdentityUpsert};
use crate::models::*;

const UPSERT_IDENTITY: &str = r#"
INSERT INTO external_identities (
    id, identifier, identifier_type, raw_identifier, source, source_id, contact_id,
    match_type, match_confidence, display_name, last_seen_at, message_count,
    created_at, updated_at
) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?11, ?11)
ON CONFLICT (identifier, identifier_type, source) DO UPDATE SET
    raw_identifier = COALESCE(excluded.raw_identifier, external_identities.raw_identifier),
    source_id = COALESCE(excluded.source_id, external_identities.source_id),
    contact_id = COALESCE(excluded.contact_id, external_identities.contact_id),
    match_type = CASE WHEN excluded.contact_id IS NOT NULL
        THEN excluded.match_type ELSE external_identities.match_type END,
    match_confidence = CASE WHEN excluded.contact_id IS NOT NULL
        THEN excluded.match_confidence ELSE external_identities.match_confidence END,
    display_name = COALESCE(excluded.display_name, external_identities.display_name),
    last_seen_at = excluded.last_seen_at,
    message_count = external_identities.message_count + excluded.message_count,
    updated_at = excluded.updated_at
RETURNING *
"#;

impl Database {
    // ==================== ROW MAPPERS ====================

    fn row_to_identity(row: &Row) -> rusqlite::Result<ExternalIdentity> {
        let id: String = row.get("id")?;
        let identifier_type: String = row.get("identifier_type")?;
        let contact_id: Option<String> = row.get("contact_id")?;
        let match_type: String = row.get("match_type")?;
        let last_seen_at: Option<String> = row.get("last_seen_at")?;
        let created_at: String = row.get("created_at")?;
        let updated_at: String = row.get("updated_at")?;

        Ok(ExternalIdentity {
            id: parse_uuid(&id)?,
            identifier: row.get("identifier")?,
            identifier_type: IdentifierType::parse(&identifier_type).map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(
                    0,
                    rusqlite::types::Type::Text,
                    Box::new(e),
                )
            })?,
            raw_identifier: row.get("raw_identifier")?,
            source: row.get("source")?,
            source_id: row.get("source_id")?,
            contact_id: parse_opt_uuid(contact_id)?,
            match_type: MatchType::parse(&match_type),
            match_confidence: row.get("match_confidence")?,
            display_name: row.get("display_name")?,
            last_seen_at: parse_opt_ts(last_seen_at)?,
            message_count: row.get("message_count")?,
            created_at: parse_ts(&created_at)?,
            updated_at: parse_ts(&updated_at)?,
        })
    }
}

impl IdentityStore for Database {
    fn upsert_identity(&self, entry: &IdentityUpsert) -> Result<ExternalIdentity> {
        let identity = self.conn().query_row(
            UPSERT_IDENTITY,
            params![
                Uuid::new_v4().to_string(),
                entry.identifier,
                entry.identifier_type.as_str(),
                entry.raw_identifier,
                entry.source,
                entry.source_id,
                entry.contact_id.map(|id| id.to_string()),
                entry.match_type.as_str(),
                entry.match_confidence,
                entry.display_name,
                ts(&entry.seen_at),
                entry.message_count_delta,
            ],
            Self::row_to_identity,
        )?;
        Ok(identity)
    }

    fn get_identity(&self, id: Uuid) -> Result<Option<ExternalIdentity>> {
        let identity = self
            .conn()
            .query_row(
                "SELECT * FROM external_identities WHERE id = ?",
                [id.to_string()],
                Self::row_to_identity,
            )
            .optional()?;
        Ok(identity)
    }

    fn get_by_identifier(
        &self,
        identifier_type: IdentifierType,
        identifier: &str,
        source: &str,
    ) -> Result<Option<ExternalIdentity>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            r#"SELECT * FROM external_identities
               WHERE identifier_type = ? AND identifier = ? AND source = ?"#,
        )?;

        let result = stmt.query_row(
            params![identifier_type.as_str(), identifier, source],
            Self::row_to_identity,
        );

        match result {
            Ok(identity) => Ok(Some(identity)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn find_by_identifier(
        &self,
        identifier_type: IdentifierType,
        identifier: &str,
    ) -> Result<Vec<ExternalIdentity>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            r#"SELECT * FROM external_identities
               WHERE identifier_type = ? AND identifier = ?
               ORDER BY created_at ASC"#,
        )?;

        let identities = stmt
            .query_map(
                params![identifier_type.as_str(), identifier],
                Self::row_to_identity,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(identities)
    }

    fn link_to_contact(
        &self,
        id: Uuid,
        contact_id: Uuid,
        match_type: MatchType,
        confidence: Option<f64>,
    ) -> Result<ExternalIdentity> {
        let result = self.conn().query_row(
            r#"UPDATE external_identities
               SET contact_id = ?, match_type = ?, match_confidence = ?, updated_at = ?
               WHERE id = ?
               RETURNING *"#,
            params![
                contact_id.to_string(),
                match_type.as_str(),
                confidence,
                ts(&Utc::now()),
                id.to_string(),
            ],
            Self::row_to_identity,
        );

        match result {
            Ok(identity) => Ok(identity),
            Err(rusqlite::Error::QueryReturnedNoRows) => Err(Error::not_found("identity", id)),
            Err(e) => Err(e.into()),
        }
    }

    fn unlink_from_contact(&self, id: Uuid) -> Result<ExternalIdentity> {
        let result = self.conn().query_row(
            r#"UPDATE external_identities
               SET contact_id = NULL, match_type = 'unmatched', match_confidence = NULL,
                   updated_at = ?
               WHERE id = ?
               RETURNING *"#,
            params![ts(&Utc::now()), id.to_string()],
            Self::row_to_identity,
        );

        match result {
            Ok(identity) => Ok(identity),
            Err(rusqlite::Error::QueryReturnedNoRows) => Err(Error::not_found("identity", id)),
            Err(e) => Err(e.into()),
        }
    }

    fn list_unmatched(
        &self,
        source: Option<&str>,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<ExternalIdentity>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            r#"SELECT * FROM external_identities
               WHERE match_type = 'unmatched'
                 AND (?1 IS NULL OR source = ?1)
               ORDER BY message_count DESC, last_seen_at DESC NULLS LAST, created_at ASC
               LIMIT ?2 OFFSET ?3"#,
        )?;

        let identities = stmt
            .query_map(params![source, limit, offset], Self::row_to_identity)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(identities)
    }

    fn count_unmatched(&self, source: Option<&str>) -> Result<u64> {
        let count: i64 = self.conn().query_row(
            r#"SELECT COUNT(*) FROM external_identities
               WHERE match_type = 'unmatched'
                 AND (?1 IS NULL OR source = ?1)"#,
            params![source],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    fn list_for_contact(&self, contact_id: Uuid) -> Result<Vec<ExternalIdentity>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            r#"SELECT * FROM external_identities
               WHERE contact_id = ?
               ORDER BY last_seen_at DESC NULLS LAST, created_at ASC"#,
        )?;

        let identities = stmt
            .query_map([contact_id.to_string()], Self::row_to_identity)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(identities)
    }

    fn bulk_link_to_contact(
        &self,
        ids: &[Uuid],
        contact_id: Uuid,
        match_type: MatchType,
        confidence: Option<f64>,
    ) -> Result<usize> {
        if ids.is_empty() {
            return Ok(0);
        }

        let conn = self.conn();
        let now = ts(&Utc::now());

        conn.execute("BEGIN IMMEDIATE", [])?;

        let mut linked = 0;
        for id in ids {
            match conn.execute(
                r#"UPDATE external_identities
                   SET contact_id = ?, match_type = ?, match_confidence = ?, updated_at = ?
                   WHERE id = ?"#,
                params![
                    contact_id.to_string(),
                    match_type.as_str(),
                    confidence,
                    now,
                    id.to_string(),
                ],
            ) {
                Ok(rows) => linked += rows,
                Err(e) => {
                    let _ = conn.execute("ROLLBACK", []);
                    return Err(e.into());
                }
            }
        }

        conn.execute("COMMIT", [])?;
        Ok(linked)
    }

    fn list_by_source(&self, source: &str, limit: u32) -> Result<Vec<ExternalIdentity>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            r#"SELECT * FROM external_identities
               WHERE source = ?
               ORDER BY last_seen_at DESC NULLS LAST, created_at ASC
               LIMIT ?"#,
        )?;

        let identities = stmt
            .query_map(params![source, limit], Self::row_to_identity)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(identities)
    }

    fn touch_identity(
        &self,
        id: Uuid,
        message_count_delta: i64,
        seen_at: DateTime<Utc>,
    ) -> Result<ExternalIdentity> {
        let seen_at = ts(&seen_at);
        self.conn()
            .query_row(
                r#"UPDATE external_identities
                   SET message_count = message_count + ?1, last_seen_at = ?2, updated_at = ?2
                   WHERE id = ?3
                   RETURNING *"#,
                params![message_count_delta, seen_at, id.to_string()],
                Self::row_to_identity,
            )
            .optional()?
            .ok_or_else(|| Error::not_found("identity", id))
    }

    fn delete_identity(&self, id: Uuid) -> Result<bool> {
        let rows = self
            .conn()
            .execute("DELETE FROM external_identities WHERE id = ?", [id.to_string()])?;
        Ok(rows > 0)
    }
}
