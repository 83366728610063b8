//! External source synchronization.
//!
//! A [`SyncProvider`] pulls records from one source and reconciles them
//! against the CRM. The [`SyncOrchestrator`] decides when each
//! (source, account) pair runs and records the outcome.

pub mod calendar;
pub mod contacts;
mod dedup;
pub mod google;
mod orchestrator;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::Duration;
use parking_lot::RwLock;
use serde::Serialize;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::models::{Person, SyncState, SyncStrategy};

pub use calendar::CalendarSyncProvider;
pub use contacts::ContactsSyncProvider;
pub use orchestrator::{RunOutcome, SyncOrchestrator};

/// Static description of a provider.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SourceConfig {
    pub name: &'static str,
    pub display_name: &'static str,
    pub strategy: SyncStrategy,
    pub supports_multi_account: bool,
    pub supports_discovery: bool,
    #[serde(serialize_with = "serialize_minutes")]
    pub default_interval: Duration,
}

fn serialize_minutes<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_i64(d.num_minutes())
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SyncResult {
    pub items_processed: i64,
    pub items_matched: i64,
    pub items_created: i64,
    /// Continuation token from the final page. `None` keeps the stored cursor.
    pub new_cursor: Option<String>,
}

/// A failed run together with whatever it finished before failing.
#[derive(Debug, thiserror::Error)]
#[error("{error}")]
pub struct SyncFailure {
    #[source]
    pub error: Error,
    pub partial: SyncResult,
}

impl SyncFailure {
    pub fn new(error: Error, partial: SyncResult) -> Self {
        Self { error, partial }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.error, Error::Cancelled)
    }
}

impl From<Error> for SyncFailure {
    fn from(error: Error) -> Self {
        Self::new(error, SyncResult::default())
    }
}

/// Cancellation and deadline for one or more runs.
#[derive(Debug, Clone, Default)]
pub struct SyncContext {
    cancel: CancellationToken,
    deadline: Option<Instant>,
}

impl SyncContext {
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            cancel,
            deadline: None,
        }
    }

    pub fn with_timeout(mut self, timeout: StdDuration) -> Self {
        self.deadline = Some(Instant::now() + timeout);
        self
    }

    pub fn token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled() || self.deadline.map_or(false, |d| Instant::now() >= d)
    }

    /// `Err(Cancelled)` once cancelled or past the deadline.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            return Err(Error::Cancelled);
        }
        Ok(())
    }

    /// Resolves when the token fires or the deadline passes.
    pub async fn cancelled(&self) {
        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    _ = self.cancel.cancelled() => {}
                    _ = tokio::time::sleep_until(deadline) => {}
                }
            }
            None => self.cancel.cancelled().await,
        }
    }

    /// Run `fut` unless cancellation wins first.
    pub async fn run<T>(&self, fut: impl std::future::Future<Output = Result<T>>) -> Result<T> {
        self.check()?;
        tokio::select! {
            biased;
            _ = self.cancelled() => Err(Error::Cancelled),
            out = fut => out,
        }
    }
}

#[async_trait]
pub trait SyncProvider: Send + Sync {
    fn config(&self) -> SourceConfig;

    /// Pull and reconcile one (source, account) pair. Per-record failures
    /// are logged and skipped; only run-level failures return `Err`.
    /// `contacts` is filled only for contact-driven providers.
    async fn sync(
        &self,
        ctx: &SyncContext,
        state: &SyncState,
        contacts: &[Person],
    ) -> Result<SyncResult, SyncFailure>;

    /// `None` checks that at least one account is connected.
    async fn validate_credentials(&self, account_id: Option<&str>) -> Result<()>;
}

/// Providers by source name.
#[derive(Default)]
pub struct ProviderRegistry {
    providers: RwLock<HashMap<String, Arc<dyn SyncProvider>>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces any provider with the same name.
    pub fn register(&self, provider: Arc<dyn SyncProvider>) {
        let name = provider.config().name.to_string();
        self.providers.write().insert(name, provider);
    }

    pub fn unregister(&self, name: &str) -> bool {
        self.providers.write().remove(name).is_some()
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn SyncProvider>> {
        self.providers.read().get(name).cloned()
    }

    /// Configs sorted by name.
    pub fn list(&self) -> Vec<SourceConfig> {
        let mut configs: Vec<SourceConfig> =
            self.providers.read().values().map(|p| p.config()).collect();
        configs.sort_by(|a, b| a.name.cmp(b.name));
        configs
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.providers.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.providers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.read().is_empty()
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Shared fakes for provider and orchestrator tests.

    use super::*;
    use parking_lot::Mutex;

    /// Scripted provider: pops one behavior per call, repeating the last.
    pub struct FakeProvider {
        pub config: SourceConfig,
        script: Mutex<Vec<Behavior>>,
        pub calls: Mutex<Vec<(String, usize)>>,
    }

    #[derive(Clone)]
    pub enum Behavior {
        Succeed(SyncResult),
        Fail(&'static str, SyncResult),
        /// Block until cancelled, then report the partial result.
        WaitForCancel(SyncResult),
    }

    impl FakeProvider {
        pub fn new(name: &'static str, strategy: SyncStrategy, script: Vec<Behavior>) -> Self {
            Self {
                config: SourceConfig {
                    name,
                    display_name: name,
                    strategy,
                    supports_multi_account: true,
                    supports_discovery: true,
                    default_interval: Duration::hours(1),
                },
                script: Mutex::new(script),
                calls: Mutex::new(Vec::new()),
            }
        }

        fn next(&self) -> Behavior {
            let mut script = self.script.lock();
            if script.len() > 1 {
                script.remove(0)
            } else {
                script
                    .first()
                    .cloned()
                    .unwrap_or(Behavior::Succeed(SyncResult::default()))
            }
        }
    }

    #[async_trait]
    impl SyncProvider for FakeProvider {
        fn config(&self) -> SourceConfig {
            self.config.clone()
        }

        async fn sync(
            &self,
            ctx: &SyncContext,
            state: &SyncState,
            contacts: &[Person],
        ) -> Result<SyncResult, SyncFailure> {
            self.calls
                .lock()
                .push((state.account_id.clone(), contacts.len()));
            match self.next() {
                Behavior::Succeed(result) => Ok(result),
                Behavior::Fail(message, partial) => Err(SyncFailure::new(
                    Error::Io(std::io::Error::new(std::io::ErrorKind::Other, message)),
                    partial,
                )),
                Behavior::WaitForCancel(partial) => {
                    ctx.cancelled().await;
                    Err(SyncFailure::new(Error::Cancelled, partial))
                }
            }
        }

        async fn validate_credentials(&self, _account_id: Option<&str>) -> Result<()> {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::{Behavior, FakeProvider};
    use super::*;

    #[test]
    fn test_registry() {
        let registry = ProviderRegistry::new();
        assert!(registry.is_empty());

        registry.register(Arc::new(FakeProvider::new("b", SyncStrategy::FetchAll, vec![])));
        registry.register(Arc::new(FakeProvider::new("a", SyncStrategy::ContactDriven, vec![])));
        registry.register(Arc::new(FakeProvider::new(
            "a",
            SyncStrategy::FetchAll,
            vec![Behavior::Succeed(SyncResult::default())],
        )));

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.names(), vec!["a", "b"]);
        assert_eq!(registry.list()[0].strategy, SyncStrategy::FetchAll);
        assert!(registry.get("a").is_some());
        assert!(registry.unregister("a"));
        assert!(!registry.unregister("a"));
        assert!(registry.get("a").is_none());
    }

    #[tokio::test]
    async fn test_context_cancellation() {
        let ctx = SyncContext::new(CancellationToken::new());
        assert!(ctx.check().is_ok());
        assert_eq!(ctx.run(async { Ok(5) }).await.unwrap(), 5);

        ctx.token().cancel();
        assert!(matches!(ctx.check(), Err(Error::Cancelled)));
        assert!(matches!(
            ctx.run(std::future::pending::<Result<()>>()).await,
            Err(Error::Cancelled)
        ));
    }

    #[tokio::test]
    async fn test_context_deadline() {
        let ctx = SyncContext::default().with_timeout(StdDuration::from_millis(10));
        let out = ctx.run(std::future::pending::<Result<()>>()).await;
        assert!(matches!(out, Err(Error::Cancelled)));
        assert!(ctx.is_cancelled());
    }
}
