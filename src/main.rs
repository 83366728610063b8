use clap::Parser;
use contactsync::cli::{cancel_on_ctrlc, run_identities, run_imports, run_sync, App, Cli, Commands};
use contactsync::config::Config;
use contactsync::sync::SyncContext;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(Config::log_filter()))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let app = App::open()?;

    match cli.command {
        Commands::Identities(command) => run_identities(&app, command)?,
        Commands::Imports(command) => run_imports(&app, command)?,
        Commands::Sync(command) => {
            let token = CancellationToken::new();
            cancel_on_ctrlc(token.clone());
            run_sync(&app, command, SyncContext::new(token)).await?;
        }
    }

    Ok(())
}
