//! Google Calendar provider.
//!
//! Records accepted meetings, links their attendees to CRM contacts and
//! turns unknown attendees into import candidates. After each run, contacts
//! seen in meetings that have ended get their `last_contacted` moved to the
//! meeting's end.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use serde_json::{json, Map};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::dedup::mark_if_duplicate;
use super::google::{CalendarApi, EventsQuery, GoogleEvent, TokenSource};
use super::{SourceConfig, SyncContext, SyncFailure, SyncProvider, SyncResult};
use crate::clock::Clock;
use crate::config::Config;
use crate::db::{CalendarEventStore, ContactStore, Database, ExternalContactStore};
use crate::error::{Error, Result};
use crate::identity::normalize::normalize_email;
use crate::identity::{IdentityService, MatchRequest};
use crate::matching::FuzzyMatcher;
use crate::models::{
    Attendee, CalendarEvent, EmailEntry, ExternalContactUpsert, IdentifierType, Person, SyncState,
    SyncStrategy,
};

pub const SOURCE_CALENDAR: &str = "gcal";
/// Import candidates discovered among meeting attendees.
pub const SOURCE_ATTENDEE: &str = "gcal_attendee";

const RESPONSE_ACCEPTED: &str = "accepted";

/// Rooms, group calendars and system calendars rather than people.
const BLOCKED_DOMAINS: [&str; 4] = [
    "group.calendar.google.com",
    "resource.calendar.google.com",
    "calendar.google.com",
    "group.v.calendar.google.com",
];

#[derive(Debug, Default)]
struct EventOutcome {
    matched: i64,
    created: i64,
}

pub struct CalendarSyncProvider {
    api: Arc<dyn CalendarApi>,
    tokens: Arc<dyn TokenSource>,
    identity: IdentityService,
    matcher: FuzzyMatcher,
    externals: Arc<dyn ExternalContactStore>,
    events: Arc<dyn CalendarEventStore>,
    contacts: Arc<dyn ContactStore>,
    clock: Arc<dyn Clock>,
    config: Config,
}

impl CalendarSyncProvider {
    pub fn new(
        api: Arc<dyn CalendarApi>,
        tokens: Arc<dyn TokenSource>,
        db: Arc<Database>,
        clock: Arc<dyn Clock>,
        config: Config,
    ) -> Self {
        Self {
            api,
            tokens,
            identity: IdentityService::from_database(db.clone(), clock.clone()),
            matcher: FuzzyMatcher::new(db.clone(), db.clone()),
            externals: db.clone(),
            events: db.clone(),
            contacts: db,
            clock,
            config,
        }
    }

    /// Full listing over the configured window.
    async fn sync_window(
        &self,
        ctx: &SyncContext,
        account: &str,
        result: &mut SyncResult,
    ) -> Result<()> {
        let (time_min, time_max) = self.config.calendar_window(self.clock.now());
        debug!(account, %time_min, %time_max, "full calendar sync");
        self.sync_pages(ctx, account, &EventsQuery::Window { time_min, time_max }, result)
            .await
    }

    async fn sync_pages(
        &self,
        ctx: &SyncContext,
        account: &str,
        query: &EventsQuery,
        result: &mut SyncResult,
    ) -> Result<()> {
        let mut page_token: Option<String> = None;

        loop {
            let page = ctx
                .run(self.api.list_events(account, query, page_token.as_deref()))
                .await?;

            for event in &page.items {
                ctx.check()?;
                match self.process_event(account, event) {
                    Ok(outcome) => {
                        result.items_processed += 1;
                        result.items_matched += outcome.matched;
                        result.items_created += outcome.created;
                    }
                    Err(err) => warn!(account, event_id = %event.id, error = %err, "failed to process event"),
                }
            }

            match page.next_page_token.filter(|t| !t.is_empty()) {
                Some(token) => page_token = Some(token),
                None => {
                    result.new_cursor = page.next_sync_token.filter(|t| !t.is_empty());
                    return Ok(());
                }
            }
        }
    }

    fn process_event(&self, account: &str, event: &GoogleEvent) -> Result<EventOutcome> {
        if event.is_cancelled() {
            debug!(event_id = %event.id, "skipping cancelled event");
            return Ok(EventOutcome::default());
        }
        if event.is_all_day() {
            debug!(event_id = %event.id, "skipping all-day event");
            return Ok(EventOutcome::default());
        }

        let start = event.start_time().ok_or_else(|| Error::InvalidRecord {
            id: event.id.clone(),
            reason: "missing or malformed start time",
        })?;
        let end = event.end_time().ok_or_else(|| Error::InvalidRecord {
            id: event.id.clone(),
            reason: "missing or malformed end time",
        })?;

        let response = user_response(event, account);
        if response.as_deref() != Some(RESPONSE_ACCEPTED) {
            debug!(event_id = %event.id, response = ?response, "skipping event not accepted");
            return Ok(EventOutcome::default());
        }

        let attendees = build_attendees(event, account);
        let (matched_ids, created) = self.match_attendees(account, event, start, &attendees);

        let now = self.clock.now();
        let mut stored = CalendarEvent::new(account, &event.id, start, end);
        stored.title = event.summary.clone();
        stored.description = non_empty(event.description.as_deref());
        stored.location = non_empty(event.location.as_deref());
        stored.status = event
            .status
            .clone()
            .unwrap_or_else(|| "confirmed".to_string());
        stored.user_response = response;
        stored.organizer_email = event.organizer_email().map(String::from);
        stored.attendees = attendees;
        stored.html_link = non_empty(event.html_link.as_deref());
        stored.matched_contact_ids = matched_ids;
        stored.synced_at = now;
        stored.created_at = now;
        stored.updated_at = now;

        let saved = self.events.upsert_event(&stored)?;

        Ok(EventOutcome {
            matched: saved.matched_contact_ids.len() as i64,
            created,
        })
    }

    /// Exact match, then fuzzy, then import candidate. Returns the distinct
    /// matched contacts and the number of new candidates.
    fn match_attendees(
        &self,
        account: &str,
        event: &GoogleEvent,
        start: DateTime<Utc>,
        attendees: &[Attendee],
    ) -> (Vec<Uuid>, i64) {
        let mut matched: Vec<Uuid> = Vec::new();
        let mut created = 0;

        for attendee in attendees {
            if attendee.is_self || attendee.email.trim().is_empty() {
                continue;
            }
            if is_blocked_domain(&attendee.email) {
                debug!(email = %attendee.email, "skipping calendar resource");
                continue;
            }

            let request = MatchRequest::new(&attendee.email, IdentifierType::Email, SOURCE_CALENDAR)
                .display_name(Some(attendee.display_name.as_str()));

            let identity = match self.identity.match_or_create(&request) {
                Ok(result) => match result.contact_id {
                    Some(contact_id) => {
                        push_unique(&mut matched, contact_id);
                        continue;
                    }
                    None => Some(result.identity),
                },
                Err(err @ Error::InvalidIdentifier { .. }) => {
                    debug!(email = %attendee.email, error = %err, "skipping malformed attendee");
                    continue;
                }
                Err(err) => {
                    debug!(email = %attendee.email, error = %err, "identity match failed");
                    None
                }
            };

            let fuzzy = self
                .matcher
                .find_match(&attendee.display_name, Some(&attendee.email), &self.config.fuzzy)
                .unwrap_or_else(|err| {
                    debug!(name = %attendee.display_name, error = %err, "fuzzy search failed");
                    None
                });

            if let Some(found) = fuzzy {
                debug!(
                    email = %attendee.email,
                    contact_id = %found.contact_id,
                    score = found.score,
                    "fuzzy matched attendee"
                );
                if let Some(identity) = identity {
                    if let Err(err) = self
                        .identity
                        .record_fuzzy_match(identity.id, found.contact_id, found.score)
                    {
                        warn!(email = %attendee.email, error = %err, "failed to record fuzzy link");
                    }
                }
                push_unique(&mut matched, found.contact_id);
                continue;
            }

            match self.store_candidate(account, attendee, event, start) {
                Ok(true) => created += 1,
                Ok(false) => {}
                Err(err) => warn!(email = %attendee.email, error = %err, "failed to store import candidate"),
            }
        }

        (matched, created)
    }

    /// One candidate per normalized email and account; later meetings
    /// refresh its metadata. Returns true when newly created.
    fn store_candidate(
        &self,
        account: &str,
        attendee: &Attendee,
        event: &GoogleEvent,
        start: DateTime<Utc>,
    ) -> Result<bool> {
        let now = self.clock.now();
        let display_name =
            non_empty(Some(attendee.display_name.as_str())).or_else(|| infer_name_from_email(&attendee.email));

        let mut metadata = Map::new();
        metadata.insert("meeting_title".into(), json!(event.summary.clone().unwrap_or_default()));
        metadata.insert(
            "meeting_date".into(),
            json!(start.to_rfc3339_opts(SecondsFormat::Secs, true)),
        );
        metadata.insert("meeting_link".into(), json!(event.html_link.clone().unwrap_or_default()));
        metadata.insert(
            "discovered_at".into(),
            json!(now.to_rfc3339_opts(SecondsFormat::Secs, true)),
        );

        let record = self.externals.upsert_external_contact(&ExternalContactUpsert {
            source: SOURCE_ATTENDEE.to_string(),
            source_id: normalize_email(&attendee.email),
            account_id: account.to_string(),
            display_name,
            emails: vec![EmailEntry::new(attendee.email.trim())],
            metadata,
            synced_at: Some(now),
            ..Default::default()
        })?;

        if !record.was_created() {
            return Ok(false);
        }
        mark_if_duplicate(self.externals.as_ref(), &record)?;
        debug!(email = %attendee.email, "stored import candidate");
        Ok(true)
    }

    /// Move `last_contacted` for contacts of ended meetings, once per event.
    fn bump_past_events(&self) -> Result<usize> {
        let events = self
            .events
            .list_past_events_needing_update(self.clock.now(), self.config.past_event_batch)?;

        for event in &events {
            for contact_id in &event.matched_contact_ids {
                if let Err(err) = self.contacts.update_last_contacted(*contact_id, event.end_time) {
                    warn!(contact_id = %contact_id, event_id = %event.id, error = %err, "failed to update last_contacted");
                }
            }
            // Marked even when a contact update failed, so the batch cannot wedge.
            if let Err(err) = self.events.mark_last_contacted_updated(event.id) {
                warn!(event_id = %event.id, error = %err, "failed to mark event processed");
            }
        }

        if !events.is_empty() {
            info!(events = events.len(), "updated last_contacted from past meetings");
        }
        Ok(events.len())
    }
}

#[async_trait]
impl SyncProvider for CalendarSyncProvider {
    fn config(&self) -> SourceConfig {
        SourceConfig {
            name: SOURCE_CALENDAR,
            display_name: "Google Calendar",
            strategy: SyncStrategy::FetchAll,
            supports_multi_account: true,
            supports_discovery: true,
            default_interval: Duration::hours(24),
        }
    }

    async fn sync(
        &self,
        ctx: &SyncContext,
        state: &SyncState,
        _contacts: &[Person],
    ) -> Result<SyncResult, SyncFailure> {
        let account = state
            .account()
            .ok_or_else(|| Error::MissingAccount(SOURCE_CALENDAR.to_string()))?;
        info!(source = SOURCE_CALENDAR, account, incremental = state.cursor().is_some(), "starting calendar sync");

        let mut result = SyncResult::default();
        let outcome = match state.cursor() {
            None => self.sync_window(ctx, account, &mut result).await,
            Some(cursor) => {
                let query = EventsQuery::Incremental {
                    sync_token: cursor.to_string(),
                };
                match self.sync_pages(ctx, account, &query, &mut result).await {
                    Err(err) if err.is_recoverable_cursor_error() => {
                        warn!(account, "sync token expired, falling back to full sync");
                        self.sync_window(ctx, account, &mut result).await
                    }
                    other => other,
                }
            }
        };

        if let Err(err) = outcome {
            return Err(SyncFailure::new(err, result));
        }

        if let Err(err) = self.bump_past_events() {
            warn!(account, error = %err, "past meeting update failed");
        }

        info!(
            source = SOURCE_CALENDAR,
            account,
            processed = result.items_processed,
            matched = result.items_matched,
            created = result.items_created,
            "calendar sync completed"
        );
        Ok(result)
    }

    async fn validate_credentials(&self, account_id: Option<&str>) -> Result<()> {
        match account_id {
            Some(account) => self.tokens.access_token(account).map(|_| ()),
            None if self.tokens.accounts()?.is_empty() => {
                Err(Error::MissingAccount(SOURCE_CALENDAR.to_string()))
            }
            None => Ok(()),
        }
    }
}

/// The account holder's response. Organizing counts as accepting.
fn user_response(event: &GoogleEvent, account: &str) -> Option<String> {
    if let Some(me) = event
        .attendees
        .iter()
        .find(|a| a.is_self || a.email.eq_ignore_ascii_case(account))
    {
        return Some(me.response_status.clone());
    }

    let organizes = event
        .organizer
        .as_ref()
        .map_or(false, |o| o.is_self || o.email.eq_ignore_ascii_case(account));
    organizes.then(|| RESPONSE_ACCEPTED.to_string())
}

fn build_attendees(event: &GoogleEvent, account: &str) -> Vec<Attendee> {
    let organizer = event.organizer_email();
    event
        .attendees
        .iter()
        .map(|a| Attendee {
            is_self: a.is_self || a.email.eq_ignore_ascii_case(account),
            organizer: a.organizer || organizer.map_or(false, |o| o.eq_ignore_ascii_case(&a.email)),
            ..a.clone()
        })
        .collect()
}

fn is_blocked_domain(email: &str) -> bool {
    let email = email.trim().to_lowercase();
    BLOCKED_DOMAINS.iter().any(|domain| {
        email.ends_with(&format!("@{}", domain)) || email.ends_with(&format!(".{}", domain))
    })
}

/// `john.smith2+work@x.com` becomes "John Smith". `None` when nothing
/// name-like is left.
pub fn infer_name_from_email(email: &str) -> Option<String> {
    let (local, domain) = email.trim().split_once('@')?;
    if local.is_empty() || domain.is_empty() {
        return None;
    }

    let local = match local.find('+') {
        Some(idx) if idx > 0 => &local[..idx],
        _ => local,
    };

    let separator = if local.contains('.') {
        '.'
    } else if local.contains('_') {
        '_'
    } else {
        ' '
    };

    let parts: Vec<String> = local
        .split(separator)
        .map(|part| part.trim().trim_end_matches(|c: char| c.is_ascii_digit()))
        .filter(|part| !part.is_empty())
        .map(capitalize)
        .collect();

    if parts.is_empty() {
        None
    } else {
        Some(parts.join(" "))
    }
}

fn capitalize(s: &str) -> String {
    let lower = s.to_lowercase();
    let mut chars = lower.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

fn non_empty(s: Option<&str>) -> Option<String> {
    s.map(str::trim).filter(|s| !s.is_empty()).map(String::from)
}

fn push_unique(ids: &mut Vec<Uuid>, id: Uuid) {
    if !ids.contains(&id) {
        ids.push(id);
    }
}
