use chrono::{DateTime, Utc};
use rusqlite::{params, Row};
use uuid::Uuid;

use super::{parse_json, parse_ts, parse_uuid, ts, Database};
use crate::error::Result;
use crate::models::CalendarEvent;

pub trait CalendarEventStore: Send + Sync {
    /// Insert or refresh by (account_id, event_id). The processed flag of an
    /// existing row is kept.
    fn upsert_event(&self, event: &CalendarEvent) -> Result<CalendarEvent>;

    fn get_event(&self, account_id: &str, event_id: &str) -> Result<Option<CalendarEvent>>;

    /// Ended, unprocessed events with at least one matched contact, oldest
    /// end time first.
    fn list_past_events_needing_update(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<CalendarEvent>>;

    fn mark_last_contacted_updated(&self, id: Uuid) -> Result<bool>;
}

const UPSERT_EVENT: &str = r#"
INSERT INTO calendar_events (
    id, account_id, event_id, title, description, location, start_time, end_time,
    status, user_response, organizer_email, attendees, matched_contact_ids, html_link,
    last_contacted_updated, synced_at, created_at, updated_at
) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, 0, ?15, ?15, ?15)
ON CONFLICT (account_id, event_id) DO UPDATE SET
    title = excluded.title,
    description = excluded.description,
    location = excluded.location,
    start_time = excluded.start_time,
    end_time = excluded.end_time,
    status = excluded.status,
    user_response = excluded.user_response,
    organizer_email = excluded.organizer_email,
    attendees = excluded.attendees,
    matched_contact_ids = excluded.matched_contact_ids,
    html_link = excluded.html_link,
    synced_at = excluded.synced_at,
    updated_at = excluded.updated_at
RETURNING *
"#;

impl Database {
    fn row_to_calendar_event(row: &Row) -> rusqlite::Result<CalendarEvent> {
        let id: String = row.get("id")?;
        let start_time: String = row.get("start_time")?;
        let end_time: String = row.get("end_time")?;
        let synced_at: String = row.get("synced_at")?;
        let created_at: String = row.get("created_at")?;
        let updated_at: String = row.get("updated_at")?;

        Ok(CalendarEvent {
            id: parse_uuid(&id)?,
            account_id: row.get("account_id")?,
            event_id: row.get("event_id")?,
            title: row.get("title")?,
            description: row.get("description")?,
            location: row.get("location")?,
            start_time: parse_ts(&start_time)?,
            end_time: parse_ts(&end_time)?,
            status: row.get("status")?,
            user_response: row.get("user_response")?,
            organizer_email: row.get("organizer_email")?,
            attendees: parse_json(row.get("attendees")?)?,
            matched_contact_ids: parse_json(row.get("matched_contact_ids")?)?,
            html_link: row.get("html_link")?,
            last_contacted_updated: row.get::<_, i32>("last_contacted_updated")? != 0,
            synced_at: parse_ts(&synced_at)?,
            created_at: parse_ts(&created_at)?,
            updated_at: parse_ts(&updated_at)?,
        })
    }
}

impl CalendarEventStore for Database {
    fn upsert_event(&self, event: &CalendarEvent) -> Result<CalendarEvent> {
        let stored = self.conn().query_row(
            UPSERT_EVENT,
            params![
                event.id.to_string(),
                event.account_id,
                event.event_id,
                event.title,
                event.description,
                event.location,
                ts(&event.start_time),
                ts(&event.end_time),
                event.status,
                event.user_response,
                event.organizer_email,
                serde_json::to_string(&event.attendees)?,
                serde_json::to_string(&event.matched_contact_ids)?,
                event.html_link,
                ts(&event.synced_at),
            ],
            Self::row_to_calendar_event,
        )?;
        Ok(stored)
    }

    fn get_event(&self, account_id: &str, event_id: &str) -> Result<Option<CalendarEvent>> {
        let conn = self.conn();
        let mut stmt =
            conn.prepare("SELECT * FROM calendar_events WHERE account_id = ? AND event_id = ?")?;

        match stmt.query_row(params![account_id, event_id], Self::row_to_calendar_event) {
            Ok(event) => Ok(Some(event)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn list_past_events_needing_update(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<CalendarEvent>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            r#"SELECT * FROM calendar_events
               WHERE last_contacted_updated = 0
                 AND end_time < ?1
                 AND matched_contact_ids <> '[]'
               ORDER BY end_time ASC
               LIMIT ?2"#,
        )?;
        let events = stmt
            .query_map(params![ts(&now), limit], Self::row_to_calendar_event)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(events)
    }

    fn mark_last_contacted_updated(&self, id: Uuid) -> Result<bool> {
        let rows = self.conn().execute(
            "UPDATE calendar_events SET last_contacted_updated = 1, updated_at = ? WHERE id = ?",
            params![ts(&Utc::now()), id.to_string()],
        )?;
        Ok(rows > 0)
    }
}
