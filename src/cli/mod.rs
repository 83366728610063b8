use std::sync::Arc;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};

use crate::clock::Clock;
use crate::config::Config;
use crate::db::Database;
use crate::identity::IdentityService;
use crate::matching::FuzzyMatcher;
use crate::sync::google::{GoogleCalendarClient, GooglePeopleClient, TokenSource};
use crate::sync::{CalendarSyncProvider, ContactsSyncProvider, ProviderRegistry, SyncOrchestrator};

pub mod display;
pub mod identities;
pub mod imports;
pub mod sync;

pub use identities::run_identities;
pub use imports::run_imports;
pub use sync::{cancel_on_ctrlc, run_sync};

#[derive(Parser)]
#[command(name = "contactsync")]
#[command(about = "Identity resolution and sync for a personal CRM")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Inspect and fix identifier-to-contact links
    #[command(subcommand)]
    Identities(IdentityCommand),
    /// Review records discovered by sync
    #[command(subcommand)]
    Imports(ImportCommand),
    /// Run and manage external syncs
    #[command(subcommand)]
    Sync(SyncCommand),
}

#[derive(Subcommand)]
pub enum IdentityCommand {
    /// List identifiers not linked to any contact
    Unmatched(PageArgs),
    /// Link identities to a contact
    Link(LinkIdentityArgs),
    /// Remove an identity's contact link
    Unlink { identity_id: String },
    /// Resolve an identifier, recording it
    Match(MatchArgs),
    /// Show an identity by id, or every source's view of an identifier
    Show(ShowIdentityArgs),
}

#[derive(Subcommand)]
pub enum ImportCommand {
    /// List unmatched import candidates
    List(ImportListArgs),
    /// Link a candidate to a contact
    Link { external_id: String, contact_id: String },
    /// Hide a candidate from review
    Ignore { external_id: String },
}

#[derive(Subcommand)]
pub enum SyncCommand {
    /// Sync one source now
    Run(SyncRunArgs),
    /// Run every sync that is due
    Due(TimeoutArgs),
    /// Show providers and per-account state
    Status,
    /// Show sync history
    Logs(SyncLogsArgs),
    /// Enable scheduled syncs for a source
    Enable(SourceArgs),
    /// Disable scheduled syncs for a source
    Disable(SourceArgs),
    /// Delete old sync logs
    Prune {
        /// Keep logs newer than this many days
        #[arg(short, long, default_value = "30")]
        days: i64,
    },
    /// Reset syncs left running by a crash
    Recover {
        /// Treat runs older than this many minutes as stuck
        #[arg(short, long, default_value = "60")]
        minutes: i64,
    },
}

#[derive(Args)]
pub struct PageArgs {
    #[arg(short, long, default_value = "20")]
    pub limit: u32,
    #[arg(short, long, default_value = "0")]
    pub offset: u32,
    /// Only identities seen by this source
    #[arg(short, long)]
    pub source: Option<String>,
}

#[derive(Args)]
pub struct LinkIdentityArgs {
    /// Contact UUID
    #[arg(short, long)]
    pub contact: String,
    /// One or more identity UUIDs
    #[arg(required = true)]
    pub identity_ids: Vec<String>,
}

#[derive(Args)]
pub struct MatchArgs {
    /// Email, phone number or handle
    pub identifier: String,
    /// Identifier type; detected from the value when omitted
    #[arg(short = 't', long = "type")]
    pub identifier_type: Option<String>,
    #[arg(short, long, default_value = "cli")]
    pub source: String,
    /// Display name seen alongside the identifier
    #[arg(short, long)]
    pub name: Option<String>,
}

#[derive(Args)]
pub struct ShowIdentityArgs {
    /// Identity UUID, contact UUID or raw identifier
    pub value: String,
    #[arg(short = 't', long = "type")]
    pub identifier_type: Option<String>,
}

#[derive(Args)]
pub struct ImportListArgs {
    #[arg(short, long)]
    pub source: Option<String>,
    #[arg(short, long, default_value = "20")]
    pub limit: u32,
    #[arg(short, long, default_value = "0")]
    pub offset: u32,
    /// Show likely contacts for each candidate
    #[arg(long)]
    pub suggest: bool,
}

#[derive(Args)]
pub struct SourceArgs {
    pub source: String,
    #[arg(short, long)]
    pub account: Option<String>,
}

#[derive(Args)]
pub struct TimeoutArgs {
    /// Give up after this many seconds
    #[arg(long)]
    pub timeout: Option<u64>,
}

#[derive(Args)]
pub struct SyncRunArgs {
    #[command(flatten)]
    pub target: SourceArgs,
    #[command(flatten)]
    pub timeout: TimeoutArgs,
}

#[derive(Args)]
pub struct SyncLogsArgs {
    /// Source name; recent logs across all sources when omitted
    pub source: Option<String>,
    #[arg(short, long)]
    pub account: Option<String>,
    #[arg(short, long, default_value = "20")]
    pub limit: u32,
    #[arg(short, long, default_value = "0")]
    pub offset: u32,
}

/// Shared handles for one command invocation.
pub struct App {
    pub db: Arc<Database>,
    pub config: Config,
    pub clock: Arc<dyn Clock>,
}

impl App {
    pub fn open() -> Result<Self> {
        let db = Arc::new(Database::open_at(Config::database_path()?)?);
        Ok(Self::new(db)?)
    }

    pub fn new(db: Arc<Database>) -> crate::Result<Self> {
        let config = Config::load(&db)?;
        let clock = config.clock();
        Ok(Self { db, config, clock })
    }

    pub fn identity(&self) -> IdentityService {
        IdentityService::from_database(self.db.clone(), self.clock.clone())
    }

    pub fn matcher(&self) -> FuzzyMatcher {
        FuzzyMatcher::new(self.db.clone(), self.db.clone())
    }

    /// Registry with the Google providers.
    pub fn registry(&self) -> ProviderRegistry {
        let registry = ProviderRegistry::new();
        let tokens: Arc<dyn TokenSource> = self.db.clone();

        registry.register(Arc::new(CalendarSyncProvider::new(
            Arc::new(GoogleCalendarClient::new(tokens.clone())),
            tokens.clone(),
            self.db.clone(),
            self.clock.clone(),
            self.config.clone(),
        )));
        registry.register(Arc::new(ContactsSyncProvider::new(
            Arc::new(GooglePeopleClient::new(tokens.clone())),
            tokens,
            self.db.clone(),
            self.clock.clone(),
            self.config.clone(),
        )));

        registry
    }

    pub fn orchestrator(&self) -> SyncOrchestrator {
        SyncOrchestrator::from_database(
            Arc::new(self.registry()),
            self.db.clone(),
            self.clock.clone(),
            self.config.retry_policy,
        )
    }
}

/// Parse a UUID argument, naming the argument on failure.
pub(crate) fn parse_id(what: &str, value: &str) -> Result<uuid::Uuid> {
    uuid::Uuid::parse_str(value.trim())
        .map_err(|_| anyhow::anyhow!("invalid {} id: {}", what, value))
}
