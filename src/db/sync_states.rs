use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use uuid::Uuid;

use super::{opt_ts, parse_json, parse_opt_ts, parse_ts, parse_uuid, ts, Database};
use crate::error::{Error, Result};
use crate::models::*;

/// Scheduling state and run history for (source, account) pairs.
///
/// Every transition is a single conditional UPDATE, so two processes
/// sharing the database cannot both claim the same state.
pub trait SyncStateStore: Send + Sync {
    fn get_or_create_state(
        &self,
        source: &str,
        account_id: &str,
        strategy: SyncStrategy,
        now: DateTime<Utc>,
    ) -> Result<SyncState>;

    fn get_state(&self, id: Uuid) -> Result<Option<SyncState>>;

    fn find_state(&self, source: &str, account_id: &str) -> Result<Option<SyncState>>;

    fn list_states(&self) -> Result<Vec<SyncState>>;

    /// Enabled, not syncing or disabled, and `next_sync_at` unset or passed.
    fn list_due_states(&self, now: DateTime<Utc>) -> Result<Vec<SyncState>>;

    /// Move to `syncing`. Returns false when another run holds the state, it
    /// is disabled, or `require_due` is set and it is not yet due.
    fn claim_state(&self, id: Uuid, now: DateTime<Utc>, require_due: bool) -> Result<bool>;

    /// A `None` cursor keeps the stored one.
    fn complete_state_success(
        &self,
        id: Uuid,
        cursor: Option<&str>,
        now: DateTime<Utc>,
        next_sync_at: DateTime<Utc>,
    ) -> Result<SyncState>;

    fn complete_state_error(
        &self,
        id: Uuid,
        message: &str,
        now: DateTime<Utc>,
        next_sync_at: DateTime<Utc>,
    ) -> Result<SyncState>;

    /// Back to idle after a cancelled run. Cursor, schedule and error
    /// counters are untouched.
    fn release_state(&self, id: Uuid, now: DateTime<Utc>) -> Result<SyncState>;

    fn set_state_enabled(&self, id: Uuid, enabled: bool, now: DateTime<Utc>)
        -> Result<SyncState>;

    /// States left in `syncing` since before `cutoff` are moved to `error`
    /// and their running logs closed.
    fn reset_stale_states(&self, cutoff: DateTime<Utc>, now: DateTime<Utc>) -> Result<Vec<SyncState>>;

    fn create_log(&self, state_id: Uuid, started_at: DateTime<Utc>) -> Result<SyncLog>;

    /// Writes status, counts, error and completion time from `log`.
    fn complete_log(&self, log: &SyncLog) -> Result<()>;

    fn list_logs(&self, state_id: Uuid, limit: u32, offset: u32) -> Result<Vec<SyncLog>>;

    fn recent_logs(&self, limit: u32) -> Result<Vec<SyncLog>>;

    fn count_logs(&self, state_id: Uuid) -> Result<u64>;

    fn delete_logs_before(&self, before: DateTime<Utc>) -> Result<usize>;
}

const SELECT_LOGS: &str = r#"
SELECT l.*, s.source AS source, s.account_id AS account_id
FROM sync_logs l JOIN sync_states s ON s.id = l.sync_state_id
"#;

pub(crate) const INTERRUPTED: &str = "sync interrupted";

impl Database {
    fn row_to_sync_state(row: &Row) -> rusqlite::Result<SyncState> {
        let id: String = row.get("id")?;
        let status: String = row.get("status")?;
        let strategy: String = row.get("strategy")?;
        let last_sync_at: Option<String> = row.get("last_sync_at")?;
        let last_successful_sync_at: Option<String> = row.get("last_successful_sync_at")?;
        let next_sync_at: Option<String> = row.get("next_sync_at")?;
        let created_at: String = row.get("created_at")?;
        let updated_at: String = row.get("updated_at")?;

        Ok(SyncState {
            id: parse_uuid(&id)?,
            source: row.get("source")?,
            account_id: row.get("account_id")?,
            enabled: row.get::<_, i32>("enabled")? != 0,
            status: SyncStatus::parse(&status),
            strategy: SyncStrategy::parse(&strategy),
            last_sync_at: parse_opt_ts(last_sync_at)?,
            last_successful_sync_at: parse_opt_ts(last_successful_sync_at)?,
            next_sync_at: parse_opt_ts(next_sync_at)?,
            sync_cursor: row.get("sync_cursor")?,
            error_message: row.get("error_message")?,
            error_count: row.get("error_count")?,
            metadata: parse_json(row.get("metadata")?)?,
            created_at: parse_ts(&created_at)?,
            updated_at: parse_ts(&updated_at)?,
        })
    }

    fn row_to_sync_log(row: &Row) -> rusqlite::Result<SyncLog> {
        let id: String = row.get("id")?;
        let sync_state_id: String = row.get("sync_state_id")?;
        let status: String = row.get("status")?;
        let started_at: String = row.get("started_at")?;
        let completed_at: Option<String> = row.get("completed_at")?;

        Ok(SyncLog {
            id: parse_uuid(&id)?,
            sync_state_id: parse_uuid(&sync_state_id)?,
            source: row.get("source")?,
            account_id: row.get("account_id")?,
            status: SyncLogStatus::parse(&status),
            items_processed: row.get("items_processed")?,
            items_matched: row.get("items_matched")?,
            items_created: row.get("items_created")?,
            error_message: row.get("error_message")?,
            started_at: parse_ts(&started_at)?,
            completed_at: parse_opt_ts(completed_at)?,
        })
    }

    fn update_state_returning(
        &self,
        sql: &str,
        params: impl rusqlite::Params,
        id: Uuid,
    ) -> Result<SyncState> {
        self.conn()
            .query_row(sql, params, Self::row_to_sync_state)
            .optional()?
            .ok_or_else(|| Error::not_found("sync state", id))
    }

    fn query_logs(&self, sql: &str, params: impl rusqlite::Params) -> Result<Vec<SyncLog>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(sql)?;
        let logs = stmt
            .query_map(params, Self::row_to_sync_log)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(logs)
    }

    fn close_running_logs(conn: &Connection, state_id: &str, now: &str) -> rusqlite::Result<usize> {
        conn.execute(
            r#"UPDATE sync_logs SET status = 'error', error_message = ?1, completed_at = ?2
               WHERE sync_state_id = ?3 AND status = 'running'"#,
            params![INTERRUPTED, now, state_id],
        )
    }
}

impl SyncStateStore for Database {
    fn get_or_create_state(
        &self,
        source: &str,
        account_id: &str,
        strategy: SyncStrategy,
        now: DateTime<Utc>,
    ) -> Result<SyncState> {
        let conn = self.conn();
        conn.execute(
            r#"INSERT INTO sync_states (id, source, account_id, strategy, created_at, updated_at)
               VALUES (?1, ?2, ?3, ?4, ?5, ?5)
               ON CONFLICT (source, account_id) DO NOTHING"#,
            params![
                Uuid::new_v4().to_string(),
                source,
                account_id,
                strategy.as_str(),
                ts(&now),
            ],
        )?;
        let state = conn.query_row(
            "SELECT * FROM sync_states WHERE source = ? AND account_id = ?",
            params![source, account_id],
            Self::row_to_sync_state,
        )?;
        Ok(state)
    }

    fn get_state(&self, id: Uuid) -> Result<Option<SyncState>> {
        let state = self
            .conn()
            .query_row(
                "SELECT * FROM sync_states WHERE id = ?",
                [id.to_string()],
                Self::row_to_sync_state,
            )
            .optional()?;
        Ok(state)
    }

    fn find_state(&self, source: &str, account_id: &str) -> Result<Option<SyncState>> {
        let state = self
            .conn()
            .query_row(
                "SELECT * FROM sync_states WHERE source = ? AND account_id = ?",
                params![source, account_id],
                Self::row_to_sync_state,
            )
            .optional()?;
        Ok(state)
    }

    fn list_states(&self) -> Result<Vec<SyncState>> {
        let conn = self.conn();
        let mut stmt =
            conn.prepare("SELECT * FROM sync_states ORDER BY source ASC, account_id ASC")?;
        let states = stmt
            .query_map([], Self::row_to_sync_state)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(states)
    }

    fn list_due_states(&self, now: DateTime<Utc>) -> Result<Vec<SyncState>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            r#"SELECT * FROM sync_states
               WHERE enabled = 1
                 AND status NOT IN ('syncing', 'disabled')
                 AND (next_sync_at IS NULL OR next_sync_at <= ?)
               ORDER BY next_sync_at ASC NULLS FIRST, created_at ASC"#,
        )?;
        let states = stmt
            .query_map([ts(&now)], Self::row_to_sync_state)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(states)
    }

    fn claim_state(&self, id: Uuid, now: DateTime<Utc>, require_due: bool) -> Result<bool> {
        let rows = self.conn().execute(
            r#"UPDATE sync_states SET status = 'syncing', updated_at = ?1
               WHERE id = ?2
                 AND enabled = 1
                 AND status NOT IN ('syncing', 'disabled')
                 AND (?3 = 0 OR next_sync_at IS NULL OR next_sync_at <= ?1)"#,
            params![ts(&now), id.to_string(), require_due],
        )?;
        Ok(rows == 1)
    }

    fn complete_state_success(
        &self,
        id: Uuid,
        cursor: Option<&str>,
        now: DateTime<Utc>,
        next_sync_at: DateTime<Utc>,
    ) -> Result<SyncState> {
        self.update_state_returning(
            r#"UPDATE sync_states SET
                   status = CASE WHEN enabled = 0 THEN 'disabled' ELSE 'idle' END,
                   last_sync_at = ?1,
                   last_successful_sync_at = ?1,
                   sync_cursor = COALESCE(?2, sync_cursor),
                   error_message = NULL,
                   error_count = 0,
                   next_sync_at = ?3,
                   updated_at = ?1
               WHERE id = ?4
               RETURNING *"#,
            params![ts(&now), cursor, ts(&next_sync_at), id.to_string()],
            id,
        )
    }

    fn complete_state_error(
        &self,
        id: Uuid,
        message: &str,
        now: DateTime<Utc>,
        next_sync_at: DateTime<Utc>,
    ) -> Result<SyncState> {
        self.update_state_returning(
            r#"UPDATE sync_states SET
                   status = CASE WHEN enabled = 0 THEN 'disabled' ELSE 'error' END,
                   last_sync_at = ?1,
                   error_message = ?2,
                   error_count = error_count + 1,
                   next_sync_at = ?3,
                   updated_at = ?1
               WHERE id = ?4
               RETURNING *"#,
            params![ts(&now), message, ts(&next_sync_at), id.to_string()],
            id,
        )
    }

    fn release_state(&self, id: Uuid, now: DateTime<Utc>) -> Result<SyncState> {
        self.update_state_returning(
            r#"UPDATE sync_states SET
                   status = CASE WHEN enabled = 0 THEN 'disabled' ELSE 'idle' END,
                   updated_at = ?1
               WHERE id = ?2
               RETURNING *"#,
            params![ts(&now), id.to_string()],
            id,
        )
    }

    fn set_state_enabled(
        &self,
        id: Uuid,
        enabled: bool,
        now: DateTime<Utc>,
    ) -> Result<SyncState> {
        // A run in flight keeps `syncing`; its completion lands on `disabled`.
        let sql = if enabled {
            r#"UPDATE sync_states SET
                   enabled = 1,
                   status = CASE WHEN status = 'disabled' THEN 'idle' ELSE status END,
                   updated_at = ?1
               WHERE id = ?2
               RETURNING *"#
        } else {
            r#"UPDATE sync_states SET
                   enabled = 0,
                   status = CASE WHEN status = 'syncing' THEN 'syncing' ELSE 'disabled' END,
                   updated_at = ?1
               WHERE id = ?2
               RETURNING *"#
        };
        self.update_state_returning(sql, params![ts(&now), id.to_string()], id)
    }

    fn reset_stale_states(&self, cutoff: DateTime<Utc>, now: DateTime<Utc>) -> Result<Vec<SyncState>> {
        let now = ts(&now);
        let mut conn = self.conn();
        let tx = conn.transaction()?;

        let states = {
            let mut stmt = tx.prepare(
                r#"UPDATE sync_states SET
                       status = CASE WHEN enabled = 0 THEN 'disabled' ELSE 'error' END,
                       error_message = ?1,
                       updated_at = ?2
                   WHERE status = 'syncing' AND updated_at < ?3
                   RETURNING *"#,
            )?;
            let rows = stmt
                .query_map(params![INTERRUPTED, now, ts(&cutoff)], Self::row_to_sync_state)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows
        };

        for state in &states {
            Self::close_running_logs(&tx, &state.id.to_string(), &now)?;
        }
        tx.commit()?;

        Ok(states)
    }

    fn create_log(&self, state_id: Uuid, started_at: DateTime<Utc>) -> Result<SyncLog> {
        let id = Uuid::new_v4().to_string();
        let conn = self.conn();
        conn.execute(
            "INSERT INTO sync_logs (id, sync_state_id, status, started_at) VALUES (?, ?, 'running', ?)",
            params![id, state_id.to_string(), ts(&started_at)],
        )?;
        let log = conn.query_row(
            &format!("{} WHERE l.id = ?", SELECT_LOGS),
            [id],
            Self::row_to_sync_log,
        )?;
        Ok(log)
    }

    fn complete_log(&self, log: &SyncLog) -> Result<()> {
        let rows = self.conn().execute(
            r#"UPDATE sync_logs SET
                   status = ?1, items_processed = ?2, items_matched = ?3, items_created = ?4,
                   error_message = ?5, completed_at = ?6
               WHERE id = ?7"#,
            params![
                log.status.as_str(),
                log.items_processed,
                log.items_matched,
                log.items_created,
                log.error_message,
                opt_ts(&log.completed_at),
                log.id.to_string(),
            ],
        )?;
        if rows == 0 {
            return Err(Error::not_found("sync log", log.id));
        }
        Ok(())
    }

    fn list_logs(&self, state_id: Uuid, limit: u32, offset: u32) -> Result<Vec<SyncLog>> {
        self.query_logs(
            &format!(
                "{} WHERE l.sync_state_id = ? ORDER BY l.started_at DESC LIMIT ? OFFSET ?",
                SELECT_LOGS
            ),
            params![state_id.to_string(), limit, offset],
        )
    }

    fn recent_logs(&self, limit: u32) -> Result<Vec<SyncLog>> {
        self.query_logs(
            &format!("{} ORDER BY l.started_at DESC LIMIT ?", SELECT_LOGS),
            [limit],
        )
    }

    fn count_logs(&self, state_id: Uuid) -> Result<u64> {
        let count: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM sync_logs WHERE sync_state_id = ?",
            [state_id.to_string()],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    fn delete_logs_before(&self, before: DateTime<Utc>) -> Result<usize> {
        let rows = self.conn().execute(
            "DELETE FROM sync_logs WHERE started_at < ? AND status <> 'running'",
            [ts(&before)],
        )?;
        Ok(rows)
    }
}
