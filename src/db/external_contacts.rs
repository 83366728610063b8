use chrono::{NaiveDate, Utc};
use rusqlite::{params, Row};
use uuid::Uuid;

use super::{parse_json, parse_opt_ts, parse_opt_uuid, parse_ts, parse_uuid, ts, Database};
use crate::error::{Error, Result};
use crate::identity::normalize::normalize_email;
use crate::models::*;

/// Persistence for external record snapshots and import candidates.
pub trait ExternalContactStore: Send + Sync {
    /// Insert or refresh by (source, source_id, account_id). Match and
    /// duplicate columns are never touched here.
    fn upsert_external_contact(&self, record: &ExternalContactUpsert) -> Result<ExternalContact>;

    fn get_external_contact(&self, id: Uuid) -> Result<Option<ExternalContact>>;

    fn get_external_by_source(
        &self,
        source: &str,
        source_id: &str,
        account_id: &str,
    ) -> Result<Option<ExternalContact>>;

    /// Records of `source` (any account) carrying this email, oldest first.
    fn find_by_normalized_email(&self, source: &str, email: &str) -> Result<Vec<ExternalContact>>;

    fn mark_duplicate(&self, id: Uuid, duplicate_of: Uuid) -> Result<()>;

    fn update_match(
        &self,
        id: Uuid,
        crm_contact_id: Option<Uuid>,
        status: MatchStatus,
    ) -> Result<ExternalContact>;

    fn ignore_external_contact(&self, id: Uuid) -> Result<ExternalContact> {
        self.update_match(id, None, MatchStatus::Ignored)
    }

    /// Unmatched, non-duplicate records awaiting review, newest first.
    fn list_unmatched_external(
        &self,
        source: Option<&str>,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<ExternalContact>>;

    fn count_unmatched_external(&self, source: Option<&str>) -> Result<u64>;

    fn list_external_for_contact(&self, crm_contact_id: Uuid) -> Result<Vec<ExternalContact>>;
}

const UPSERT_EXTERNAL_CONTACT: &str = r#"
INSERT INTO external_contacts (
    id, source, source_id, account_id, etag, display_name, first_name, last_name,
    emails, phones, addresses, organization, job_title, birthday, photo_url,
    metadata, synced_at, created_at, updated_at, normalized_emails
) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?18, ?19)
ON CONFLICT (source, source_id, account_id) DO UPDATE SET
    etag = COALESCE(excluded.etag, external_contacts.etag),
    display_name = COALESCE(excluded.display_name, external_contacts.display_name),
    first_name = COALESCE(excluded.first_name, external_contacts.first_name),
    last_name = COALESCE(excluded.last_name, external_contacts.last_name),
    emails = CASE WHEN excluded.emails <> '[]' THEN excluded.emails ELSE external_contacts.emails END,
    normalized_emails = CASE WHEN excluded.emails <> '[]'
        THEN excluded.normalized_emails ELSE external_contacts.normalized_emails END,
    phones = CASE WHEN excluded.phones <> '[]' THEN excluded.phones ELSE external_contacts.phones END,
    addresses = CASE WHEN excluded.addresses <> '[]'
        THEN excluded.addresses ELSE external_contacts.addresses END,
    organization = COALESCE(excluded.organization, external_contacts.organization),
    job_title = COALESCE(excluded.job_title, external_contacts.job_title),
    birthday = COALESCE(excluded.birthday, external_contacts.birthday),
    photo_url = COALESCE(excluded.photo_url, external_contacts.photo_url),
    metadata = json_patch(external_contacts.metadata, excluded.metadata),
    synced_at = COALESCE(excluded.synced_at, external_contacts.synced_at),
    times_seen = external_contacts.times_seen + 1,
    updated_at = excluded.updated_at
RETURNING *
"#;

/// JSON array of the entries' addresses as `normalize_email` folds them.
fn normalized_emails_json(emails: &[EmailEntry]) -> Result<String> {
    let normalized: Vec<String> = emails
        .iter()
        .map(|e| normalize_email(&e.value))
        .filter(|e| !e.is_empty())
        .collect();
    Ok(serde_json::to_string(&normalized)?)
}

impl Database {
    /// Fill `normalized_emails` for rows written before the column existed.
    pub(super) fn backfill_normalized_emails(&self) -> Result<()> {
        let conn = self.conn();
        let rows = {
            let mut stmt = conn.prepare(
                "SELECT id, emails FROM external_contacts WHERE emails <> '[]' AND normalized_emails = '[]'",
            )?;
            let rows = stmt
                .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows
        };

        for (id, emails) in rows {
            let emails: Vec<EmailEntry> = serde_json::from_str(&emails)?;
            conn.execute(
                "UPDATE external_contacts SET normalized_emails = ?1 WHERE id = ?2",
                params![normalized_emails_json(&emails)?, id],
            )?;
        }
        Ok(())
    }

    fn row_to_external_contact(row: &Row) -> rusqlite::Result<ExternalContact> {
        let id: String = row.get("id")?;
        let birthday: Option<String> = row.get("birthday")?;
        let crm_contact_id: Option<String> = row.get("crm_contact_id")?;
        let duplicate_of_id: Option<String> = row.get("duplicate_of_id")?;
        let match_status: String = row.get("match_status")?;
        let synced_at: Option<String> = row.get("synced_at")?;
        let created_at: String = row.get("created_at")?;
        let updated_at: String = row.get("updated_at")?;

        Ok(ExternalContact {
            id: parse_uuid(&id)?,
            source: row.get("source")?,
            source_id: row.get("source_id")?,
            account_id: row.get("account_id")?,
            display_name: row.get("display_name")?,
            first_name: row.get("first_name")?,
            last_name: row.get("last_name")?,
            emails: parse_json(row.get("emails")?)?,
            phones: parse_json(row.get("phones")?)?,
            addresses: parse_json(row.get("addresses")?)?,
            organization: row.get("organization")?,
            job_title: row.get("job_title")?,
            birthday: birthday.and_then(|b| NaiveDate::parse_from_str(&b, "%Y-%m-%d").ok()),
            photo_url: row.get("photo_url")?,
            etag: row.get("etag")?,
            crm_contact_id: parse_opt_uuid(crm_contact_id)?,
            match_status: MatchStatus::parse(&match_status),
            duplicate_of_id: parse_opt_uuid(duplicate_of_id)?,
            metadata: parse_json(row.get("metadata")?)?,
            times_seen: row.get("times_seen")?,
            synced_at: parse_opt_ts(synced_at)?,
            created_at: parse_ts(&created_at)?,
            updated_at: parse_ts(&updated_at)?,
        })
    }

    fn query_external_contacts(
        &self,
        sql: &str,
        params: impl rusqlite::Params,
    ) -> Result<Vec<ExternalContact>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(sql)?;
        let records = stmt
            .query_map(params, Self::row_to_external_contact)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(records)
    }
}

impl ExternalContactStore for Database {
    fn upsert_external_contact(&self, record: &ExternalContactUpsert) -> Result<ExternalContact> {
        let now = record.synced_at.unwrap_or_else(Utc::now);
        let contact = self.conn().query_row(
            UPSERT_EXTERNAL_CONTACT,
            params![
                Uuid::new_v4().to_string(),
                record.source,
                record.source_id,
                record.account_id,
                record.etag,
                record.display_name,
                record.first_name,
                record.last_name,
                serde_json::to_string(&record.emails)?,
                serde_json::to_string(&record.phones)?,
                serde_json::to_string(&record.addresses)?,
                record.organization,
                record.job_title,
                record.birthday.map(|b| b.format("%Y-%m-%d").to_string()),
                record.photo_url,
                serde_json::to_string(&record.metadata)?,
                record.synced_at.as_ref().map(ts),
                ts(&now),
                normalized_emails_json(&record.emails)?,
            ],
            Self::row_to_external_contact,
        )?;
        Ok(contact)
    }

    fn get_external_contact(&self, id: Uuid) -> Result<Option<ExternalContact>> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT * FROM external_contacts WHERE id = ?")?;

        match stmt.query_row([id.to_string()], Self::row_to_external_contact) {
            Ok(contact) => Ok(Some(contact)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn get_external_by_source(
        &self,
        source: &str,
        source_id: &str,
        account_id: &str,
    ) -> Result<Option<ExternalContact>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT * FROM external_contacts WHERE source = ? AND source_id = ? AND account_id = ?",
        )?;

        match stmt.query_row(params![source, source_id, account_id], Self::row_to_external_contact) {
            Ok(contact) => Ok(Some(contact)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn find_by_normalized_email(&self, source: &str, email: &str) -> Result<Vec<ExternalContact>> {
        self.query_external_contacts(
            r#"SELECT * FROM external_contacts ec
               WHERE ec.source = ?1
                 AND EXISTS (
                     SELECT 1 FROM json_each(ec.normalized_emails) je
                     WHERE je.value = ?2
                 )
               ORDER BY ec.created_at ASC, ec.rowid ASC"#,
            params![source, email],
        )
    }

    fn mark_duplicate(&self, id: Uuid, duplicate_of: Uuid) -> Result<()> {
        let rows = self.conn().execute(
            "UPDATE external_contacts SET duplicate_of_id = ?, updated_at = ? WHERE id = ?",
            params![duplicate_of.to_string(), ts(&Utc::now()), id.to_string()],
        )?;
        if rows == 0 {
            return Err(Error::not_found("external contact", id));
        }
        Ok(())
    }

    fn update_match(
        &self,
        id: Uuid,
        crm_contact_id: Option<Uuid>,
        status: MatchStatus,
    ) -> Result<ExternalContact> {
        let result = self.conn().query_row(
            r#"UPDATE external_contacts
               SET crm_contact_id = ?, match_status = ?, updated_at = ?
               WHERE id = ?
               RETURNING *"#,
            params![
                crm_contact_id.map(|c| c.to_string()),
                status.as_str(),
                ts(&Utc::now()),
                id.to_string(),
            ],
            Self::row_to_external_contact,
        );

        match result {
            Ok(contact) => Ok(contact),
            Err(rusqlite::Error::QueryReturnedNoRows) => {
                Err(Error::not_found("external contact", id))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn list_unmatched_external(
        &self,
        source: Option<&str>,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<ExternalContact>> {
        self.query_external_contacts(
            r#"SELECT * FROM external_contacts
               WHERE match_status = 'unmatched' AND duplicate_of_id IS NULL
                 AND (?1 IS NULL OR source = ?1)
               ORDER BY updated_at DESC, rowid ASC
               LIMIT ?2 OFFSET ?3"#,
            params![source, limit, offset],
        )
    }

    fn count_unmatched_external(&self, source: Option<&str>) -> Result<u64> {
        let count: i64 = self.conn().query_row(
            r#"SELECT COUNT(*) FROM external_contacts
               WHERE match_status = 'unmatched' AND duplicate_of_id IS NULL
                 AND (?1 IS NULL OR source = ?1)"#,
            params![source],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    fn list_external_for_contact(&self, crm_contact_id: Uuid) -> Result<Vec<ExternalContact>> {
        self.query_external_contacts(
            "SELECT * FROM external_contacts WHERE crm_contact_id = ? ORDER BY created_at ASC",
            [crm_contact_id.to_string()],
        )
    }
}
