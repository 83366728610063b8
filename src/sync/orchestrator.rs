use std::sync::Arc;

use chrono::Duration;
use futures::future::join_all;
use serde::Serialize;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::{ProviderRegistry, SourceConfig, SyncContext, SyncFailure, SyncProvider};
use crate::clock::Clock;
use crate::config::RetryPolicy;
use crate::db::{ContactStore, Database, SyncStateStore};
use crate::error::{Error, Result};
use crate::models::{Person, SyncLog, SyncLogStatus, SyncState, SyncStatus, SyncStrategy};

/// Contacts handed to a contact-driven provider per run.
const CONTACT_DRIVEN_LIMIT: u32 = 10_000;

const CANCELLED_MESSAGE: &str = "cancelled";

/// Final state and log of one run.
#[derive(Debug, Clone, Serialize)]
pub struct RunOutcome {
    pub state: SyncState,
    pub log: SyncLog,
}

/// Decides which (source, account) pairs run and records every outcome.
pub struct SyncOrchestrator {
    registry: Arc<ProviderRegistry>,
    states: Arc<dyn SyncStateStore>,
    contacts: Arc<dyn ContactStore>,
    clock: Arc<dyn Clock>,
    retry_policy: RetryPolicy,
}

impl SyncOrchestrator {
    pub fn new(
        registry: Arc<ProviderRegistry>,
        states: Arc<dyn SyncStateStore>,
        contacts: Arc<dyn ContactStore>,
        clock: Arc<dyn Clock>,
        retry_policy: RetryPolicy,
    ) -> Self {
        Self {
            registry,
            states,
            contacts,
            clock,
            retry_policy,
        }
    }

    pub fn from_database(
        registry: Arc<ProviderRegistry>,
        db: Arc<Database>,
        clock: Arc<dyn Clock>,
        retry_policy: RetryPolicy,
    ) -> Self {
        Self::new(registry, db.clone(), db, clock, retry_policy)
    }

    pub fn providers(&self) -> Vec<SourceConfig> {
        self.registry.list()
    }

    fn provider(&self, source: &str) -> Result<Arc<dyn SyncProvider>> {
        self.registry
            .get(source)
            .ok_or_else(|| Error::UnknownSource(source.to_string()))
    }

    pub async fn validate(&self, source: &str, account_id: Option<&str>) -> Result<()> {
        self.provider(source)?.validate_credentials(account_id).await
    }

    /// Run one (source, account) now, whether or not it is due.
    pub async fn trigger(
        &self,
        source: &str,
        account_id: Option<&str>,
        ctx: &SyncContext,
    ) -> Result<RunOutcome> {
        let provider = self.provider(source)?;
        let config = provider.config();
        let account = account_id.map(str::trim).unwrap_or_default();
        if config.supports_multi_account && account.is_empty() {
            return Err(Error::MissingAccount(source.to_string()));
        }

        let now = self.clock.now();
        let state = self
            .states
            .get_or_create_state(source, account, config.strategy, now)?;

        if !self.states.claim_state(state.id, now, false)? {
            let current = self.states.get_state(state.id)?.unwrap_or(state);
            return Err(if current.status == SyncStatus::Syncing {
                Error::AlreadySyncing {
                    sync_source: current.source,
                    account: current.account_id,
                }
            } else {
                Error::SyncDisabled {
                    sync_source: current.source,
                    account: current.account_id,
                }
            });
        }

        self.execute(provider, state.id, ctx).await
    }

    /// Claim every due state with a registered provider and run them
    /// concurrently. A run that fails is recorded on its state and log; only
    /// bookkeeping failures are dropped here, after logging.
    pub async fn run_due(&self, ctx: &SyncContext) -> Result<Vec<RunOutcome>> {
        let now = self.clock.now();
        let mut runs = Vec::new();

        for state in self.states.list_due_states(now)? {
            let Some(provider) = self.registry.get(&state.source) else {
                debug!(source = %state.source, "no provider registered, skipping");
                continue;
            };
            if provider.config().supports_multi_account && state.account().is_none() {
                warn!(source = %state.source, "state has no account, skipping");
                continue;
            }
            if !self.states.claim_state(state.id, now, true)? {
                debug!(source = %state.source, account = %state.account_id, "claimed elsewhere");
                continue;
            }
            runs.push(self.execute(provider, state.id, ctx));
        }

        if runs.is_empty() {
            return Ok(Vec::new());
        }
        info!(runs = runs.len(), "running due syncs");

        let mut outcomes = Vec::with_capacity(runs.len());
        for result in join_all(runs).await {
            match result {
                Ok(outcome) => outcomes.push(outcome),
                Err(err) => error!(error = %err, "sync bookkeeping failed"),
            }
        }
        Ok(outcomes)
    }

    /// Run a claimed state and record the outcome.
    async fn execute(
        &self,
        provider: Arc<dyn SyncProvider>,
        state_id: Uuid,
        ctx: &SyncContext,
    ) -> Result<RunOutcome> {
        let config = provider.config();
        let started = self.clock.now();
        let state = self
            .states
            .get_state(state_id)?
            .ok_or_else(|| Error::not_found("sync state", state_id))?;

        let mut log = match self.states.create_log(state.id, started) {
            Ok(log) => log,
            Err(err) => {
                let next = started + self.retry_delay(config.default_interval, &state);
                self.states
                    .complete_state_error(state.id, &err.to_string(), started, next)?;
                return Err(err);
            }
        };

        info!(source = %state.source, account = %state.account_id, "sync started");

        let outcome = match self.load_contacts(&state) {
            Ok(contacts) => provider.sync(ctx, &state, &contacts).await,
            Err(err) => Err(SyncFailure::from(err)),
        };

        let finished = self.clock.now();
        let (transition, counts) = match outcome {
            Ok(result) => {
                log.status = SyncLogStatus::Success;
                info!(
                    source = %state.source,
                    account = %state.account_id,
                    processed = result.items_processed,
                    matched = result.items_matched,
                    created = result.items_created,
                    "sync succeeded"
                );
                let transition = self.states.complete_state_success(
                    state.id,
                    result.new_cursor.as_deref(),
                    finished,
                    finished + config.default_interval,
                );
                (transition, result)
            }
            Err(failure) if failure.is_cancelled() => {
                log.status = SyncLogStatus::Error;
                log.error_message = Some(CANCELLED_MESSAGE.to_string());
                warn!(source = %state.source, account = %state.account_id, "sync cancelled");
                (self.states.release_state(state.id, finished), failure.partial)
            }
            Err(failure) => {
                let message = failure.to_string();
                log.status = SyncLogStatus::Error;
                log.error_message = Some(message.clone());
                error!(
                    source = %state.source,
                    account = %state.account_id,
                    error = %message,
                    errors = state.error_count + 1,
                    "sync failed"
                );
                let next = finished + self.retry_delay(config.default_interval, &state);
                let transition = self
                    .states
                    .complete_state_error(state.id, &message, finished, next);
                (transition, failure.partial)
            }
        };

        log.items_processed = counts.items_processed;
        log.items_matched = counts.items_matched;
        log.items_created = counts.items_created;
        log.completed_at = Some(finished);

        // Close the log even when the state update failed.
        let logged = self.states.complete_log(&log);
        let state = transition?;
        logged?;

        Ok(RunOutcome { state, log })
    }

    fn load_contacts(&self, state: &SyncState) -> Result<Vec<Person>> {
        if state.strategy != SyncStrategy::ContactDriven {
            return Ok(Vec::new());
        }
        self.contacts.list_contacts(CONTACT_DRIVEN_LIMIT)
    }

    fn retry_delay(&self, interval: Duration, state: &SyncState) -> Duration {
        self.retry_policy.retry_after(interval, state.error_count)
    }

    fn require_state(&self, source: &str, account_id: &str) -> Result<SyncState> {
        self.states
            .find_state(source, account_id)?
            .ok_or_else(|| Error::not_found("sync state", format!("{}/{}", source, account_id)))
    }

    /// Creates the state when missing so a source can be disabled up front.
    pub fn set_enabled(&self, source: &str, account_id: Option<&str>, enabled: bool) -> Result<SyncState> {
        let provider = self.provider(source)?;
        let account = account_id.map(str::trim).unwrap_or_default();
        let now = self.clock.now();
        let state = self
            .states
            .get_or_create_state(source, account, provider.config().strategy, now)?;
        let state = self.states.set_state_enabled(state.id, enabled, now)?;
        info!(source, account, enabled, "sync state updated");
        Ok(state)
    }

    pub fn status(&self) -> Result<Vec<SyncState>> {
        self.states.list_states()
    }

    pub fn logs(
        &self,
        source: &str,
        account_id: Option<&str>,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<SyncLog>> {
        let state = self.require_state(source, account_id.unwrap_or_default())?;
        self.states.list_logs(state.id, limit, offset)
    }

    pub fn recent_logs(&self, limit: u32) -> Result<Vec<SyncLog>> {
        self.states.recent_logs(limit)
    }

    /// Delete finished logs started more than `older_than` ago.
    pub fn prune_logs(&self, older_than: Duration) -> Result<usize> {
        let deleted = self.states.delete_logs_before(self.clock.now() - older_than)?;
        if deleted > 0 {
            info!(deleted, "pruned sync logs");
        }
        Ok(deleted)
    }

    /// Reset states stuck in `syncing` for longer than `older_than`, e.g.
    /// after a crash mid-run.
    pub fn recover_stale(&self, older_than: Duration) -> Result<Vec<SyncState>> {
        let now = self.clock.now();
        let states = self.states.reset_stale_states(now - older_than, now)?;
        for state in &states {
            warn!(source = %state.source, account = %state.account_id, "recovered interrupted sync");
        }
        Ok(states)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::sync::testing::{Behavior, FakeProvider};
    use crate::sync::SyncResult;
    use chrono::Utc;
    use tokio_util::sync::CancellationToken;

    const ACCOUNT: &str = "me@example.com";

    struct Fixture {
        db: Arc<Database>,
        clock: Arc<ManualClock>,
        registry: Arc<ProviderRegistry>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                db: Arc::new(Database::open_memory().unwrap()),
                clock: Arc::new(ManualClock::new(Utc::now())),
                registry: Arc::new(ProviderRegistry::new()),
            }
        }

        fn register(&self, provider: FakeProvider) -> Arc<FakeProvider> {
            let provider = Arc::new(provider);
            self.registry.register(provider.clone());
            provider
        }

        fn orchestrator(&self, retry_policy: RetryPolicy) -> SyncOrchestrator {
            SyncOrchestrator::from_database(
                self.registry.clone(),
                self.db.clone(),
                self.clock.clone(),
                retry_policy,
            )
        }
    }

    fn counts(processed: i64, matched: i64, created: i64, cursor: Option<&str>) -> SyncResult {
        SyncResult {
            items_processed: processed,
            items_matched: matched,
            items_created: created,
            new_cursor: cursor.map(String::from),
        }
    }

    #[tokio::test]
    async fn test_successful_run() {
        let f = Fixture::new();
        f.register(FakeProvider::new(
            "gcal",
            SyncStrategy::FetchAll,
            vec![Behavior::Succeed(counts(10, 4, 2, Some("cursor-1")))],
        ));
        let orchestrator = f.orchestrator(RetryPolicy::Fixed);
        let now = f.clock.now();

        let outcome = orchestrator
            .trigger("gcal", Some(ACCOUNT), &SyncContext::default())
            .await
            .unwrap();

        assert_eq!(outcome.state.status, SyncStatus::Idle);
        assert_eq!(outcome.state.sync_cursor.as_deref(), Some("cursor-1"));
        assert_eq!(outcome.state.error_count, 0);
        assert!(outcome.state.last_successful_sync_at.is_some());
        assert_eq!(
            outcome.state.next_sync_at.map(|t| t.timestamp()),
            Some((now + Duration::hours(1)).timestamp())
        );

        assert_eq!(outcome.log.status, SyncLogStatus::Success);
        assert_eq!(outcome.log.items_processed, 10);
        assert_eq!(outcome.log.items_matched, 4);
        assert_eq!(outcome.log.items_created, 2);

        let stored = orchestrator.logs("gcal", Some(ACCOUNT), 10, 0).unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].status, SyncLogStatus::Success);
        assert!(stored[0].completed_at.is_some());
    }

    #[tokio::test]
    async fn test_failed_run_records_error_and_partial_counts() {
        let f = Fixture::new();
        f.register(FakeProvider::new(
            "gcal",
            SyncStrategy::FetchAll,
            vec![
                Behavior::Succeed(counts(1, 0, 0, Some("good"))),
                Behavior::Fail("quota exceeded", counts(3, 1, 0, None)),
            ],
        ));
        let orchestrator = f.orchestrator(RetryPolicy::Fixed);
        let ctx = SyncContext::default();

        orchestrator.trigger("gcal", Some(ACCOUNT), &ctx).await.unwrap();
        let first_success = f.db.find_state("gcal", ACCOUNT).unwrap().unwrap().last_successful_sync_at;

        f.clock.advance(Duration::minutes(10));
        let outcome = orchestrator.trigger("gcal", Some(ACCOUNT), &ctx).await.unwrap();

        assert_eq!(outcome.state.status, SyncStatus::Error);
        assert_eq!(outcome.state.error_count, 1);
        assert!(outcome.state.error_message.as_deref().unwrap().contains("quota exceeded"));
        assert_eq!(outcome.state.sync_cursor.as_deref(), Some("good"));
        assert_eq!(outcome.state.last_successful_sync_at, first_success);
        assert_eq!(
            outcome.state.next_sync_at.map(|t| t.timestamp()),
            Some((f.clock.now() + Duration::hours(1)).timestamp())
        );

        assert_eq!(outcome.log.status, SyncLogStatus::Error);
        assert_eq!(outcome.log.items_processed, 3);
        assert_eq!(outcome.log.items_matched, 1);
    }

    #[tokio::test]
    async fn test_backoff_policy_grows_with_errors() {
        let f = Fixture::new();
        f.register(FakeProvider::new(
            "gcal",
            SyncStrategy::FetchAll,
            vec![Behavior::Fail("down", SyncResult::default())],
        ));
        let orchestrator = f.orchestrator(RetryPolicy::Backoff);
        let ctx = SyncContext::default();

        let first = orchestrator.trigger("gcal", Some(ACCOUNT), &ctx).await.unwrap();
        assert_eq!(
            first.state.next_sync_at.map(|t| t.timestamp()),
            Some((f.clock.now() + Duration::minutes(1)).timestamp())
        );

        let second = orchestrator.trigger("gcal", Some(ACCOUNT), &ctx).await.unwrap();
        assert_eq!(second.state.error_count, 2);
        assert_eq!(
            second.state.next_sync_at.map(|t| t.timestamp()),
            Some((f.clock.now() + Duration::minutes(5)).timestamp())
        );
    }

    #[tokio::test]
    async fn test_cancelled_run_releases_state() {
        let f = Fixture::new();
        f.register(FakeProvider::new(
            "gcal",
            SyncStrategy::FetchAll,
            vec![
                Behavior::Succeed(counts(1, 0, 0, Some("kept"))),
                Behavior::WaitForCancel(counts(2, 0, 0, Some("never-stored"))),
            ],
        ));
        let orchestrator = f.orchestrator(RetryPolicy::Fixed);

        orchestrator
            .trigger("gcal", Some(ACCOUNT), &SyncContext::default())
            .await
            .unwrap();

        let token = CancellationToken::new();
        let ctx = SyncContext::new(token.clone());
        let (outcome, _) = tokio::join!(orchestrator.trigger("gcal", Some(ACCOUNT), &ctx), async {
            tokio::task::yield_now().await;
            token.cancel();
        });
        let outcome = outcome.unwrap();

        assert_eq!(outcome.state.status, SyncStatus::Idle);
        assert_eq!(outcome.state.sync_cursor.as_deref(), Some("kept"));
        assert_eq!(outcome.state.error_count, 0);
        assert_eq!(outcome.log.status, SyncLogStatus::Error);
        assert_eq!(outcome.log.error_message.as_deref(), Some("cancelled"));
        assert_eq!(outcome.log.items_processed, 2);
    }

    #[tokio::test]
    async fn test_trigger_refusals() {
        let f = Fixture::new();
        f.register(FakeProvider::new("gcal", SyncStrategy::FetchAll, vec![]));
        let orchestrator = f.orchestrator(RetryPolicy::Fixed);
        let ctx = SyncContext::default();

        assert!(matches!(
            orchestrator.trigger("nope", Some(ACCOUNT), &ctx).await,
            Err(Error::UnknownSource(_))
        ));
        assert!(matches!(
            orchestrator.trigger("gcal", None, &ctx).await,
            Err(Error::MissingAccount(_))
        ));

        let state = f
            .db
            .get_or_create_state("gcal", ACCOUNT, SyncStrategy::FetchAll, f.clock.now())
            .unwrap();
        assert!(f.db.claim_state(state.id, f.clock.now(), false).unwrap());
        assert!(matches!(
            orchestrator.trigger("gcal", Some(ACCOUNT), &ctx).await,
            Err(Error::AlreadySyncing { .. })
        ));
        f.db.release_state(state.id, f.clock.now()).unwrap();

        orchestrator.set_enabled("gcal", Some(ACCOUNT), false).unwrap();
        assert!(matches!(
            orchestrator.trigger("gcal", Some(ACCOUNT), &ctx).await,
            Err(Error::SyncDisabled { .. })
        ));

        let enabled = orchestrator.set_enabled("gcal", Some(ACCOUNT), true).unwrap();
        assert_eq!(enabled.status, SyncStatus::Idle);
        assert!(orchestrator.trigger("gcal", Some(ACCOUNT), &ctx).await.is_ok());
    }

    #[tokio::test]
    async fn test_run_due_runs_only_due_states() {
        let f = Fixture::new();
        let gcal = f.register(FakeProvider::new("gcal", SyncStrategy::FetchAll, vec![]));
        let directory = f.register(FakeProvider::new("directory", SyncStrategy::ContactDriven, vec![]));
        let orchestrator = f.orchestrator(RetryPolicy::Fixed);
        let ctx = SyncContext::default();
        let now = f.clock.now();

        for person in [Person::with_name("One", "Contact"), Person::with_name("Two", "Contact")] {
            f.db.insert_person(&person).unwrap();
        }

        // Ran just now, so not due for another hour.
        orchestrator.trigger("gcal", Some("fresh@example.com"), &ctx).await.unwrap();
        f.db.get_or_create_state("gcal", "a@example.com", SyncStrategy::FetchAll, now).unwrap();
        f.db.get_or_create_state("directory", "b@example.com", SyncStrategy::ContactDriven, now)
            .unwrap();
        let disabled = f.db.get_or_create_state("gcal", "off@example.com", SyncStrategy::FetchAll, now).unwrap();
        f.db.set_state_enabled(disabled.id, false, now).unwrap();
        f.db.get_or_create_state("unregistered", "c@example.com", SyncStrategy::FetchAll, now).unwrap();

        let outcomes = orchestrator.run_due(&ctx).await.unwrap();
        assert_eq!(outcomes.len(), 2);
        assert!(outcomes.iter().all(|o| o.log.status == SyncLogStatus::Success));

        let gcal_calls = gcal.calls.lock().clone();
        assert_eq!(
            gcal_calls,
            vec![("fresh@example.com".to_string(), 0), ("a@example.com".to_string(), 0)]
        );
        assert_eq!(directory.calls.lock().clone(), vec![("b@example.com".to_string(), 2)]);

        // Everything that ran is now scheduled ahead.
        assert!(orchestrator.run_due(&ctx).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_recover_stale_and_prune() {
        let f = Fixture::new();
        f.register(FakeProvider::new("gcal", SyncStrategy::FetchAll, vec![]));
        let orchestrator = f.orchestrator(RetryPolicy::Fixed);
        let start = f.clock.now();

        orchestrator
            .trigger("gcal", Some("done@example.com"), &SyncContext::default())
            .await
            .unwrap();

        // A run that never finished.
        let stuck = f
            .db
            .get_or_create_state("gcal", ACCOUNT, SyncStrategy::FetchAll, start)
            .unwrap();
        assert!(f.db.claim_state(stuck.id, start, false).unwrap());
        f.db.create_log(stuck.id, start).unwrap();

        f.clock.advance(Duration::hours(2));
        let recovered = orchestrator.recover_stale(Duration::hours(1)).unwrap();
        assert_eq!(recovered.len(), 1);
        assert_eq!(recovered[0].status, SyncStatus::Error);

        let logs = orchestrator.logs("gcal", Some(ACCOUNT), 10, 0).unwrap();
        assert_eq!(logs[0].status, SyncLogStatus::Error);
        assert!(logs[0].completed_at.is_some());

        f.clock.advance(Duration::days(30));
        assert_eq!(orchestrator.prune_logs(Duration::days(7)).unwrap(), 2);
        assert!(orchestrator.recent_logs(10).unwrap().is_empty());
    }

    #[test]
    fn test_status_and_providers() {
        let f = Fixture::new();
        f.register(FakeProvider::new("gcontacts", SyncStrategy::FetchAll, vec![]));
        f.register(FakeProvider::new("gcal", SyncStrategy::FetchAll, vec![]));
        let orchestrator = f.orchestrator(RetryPolicy::Fixed);

        let names: Vec<&str> = orchestrator.providers().iter().map(|p| p.name).collect();
        assert_eq!(names, vec!["gcal", "gcontacts"]);

        orchestrator.set_enabled("gcal", Some(ACCOUNT), false).unwrap();
        let status = orchestrator.status().unwrap();
        assert_eq!(status.len(), 1);
        assert_eq!(status[0].status, SyncStatus::Disabled);
        assert!(matches!(
            orchestrator.logs("gcontacts", Some(ACCOUNT), 10, 0),
            Err(Error::NotFound { .. })
        ));
    }
}
