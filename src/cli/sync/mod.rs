use std::time::Duration as StdDuration;

use anyhow::Result;
use chrono::Duration;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use super::display::{print_log, print_provider, print_state};
use super::{App, SourceArgs, SyncCommand, SyncLogsArgs, TimeoutArgs};
use crate::sync::{RunOutcome, SyncContext};

/// Execute a sync subcommand. `ctx` carries the Ctrl-C token.
pub async fn run_sync(app: &App, command: SyncCommand, ctx: SyncContext) -> Result<()> {
    let orchestrator = app.orchestrator();

    match command {
        SyncCommand::Run(args) => {
            let ctx = with_timeout(ctx, &args.timeout);
            let SourceArgs { source, account } = args.target;
            let outcome = orchestrator.trigger(&source, account.as_deref(), &ctx).await?;
            print_outcome(&outcome);
        }
        SyncCommand::Due(timeout) => {
            let ctx = with_timeout(ctx, &timeout);
            let outcomes = orchestrator.run_due(&ctx).await?;
            if outcomes.is_empty() {
                println!("Nothing due.");
            }
            for outcome in &outcomes {
                print_outcome(outcome);
            }
        }
        SyncCommand::Status => {
            println!("Providers:");
            for config in orchestrator.providers() {
                print_provider(&config);
            }
            let states = orchestrator.status()?;
            if !states.is_empty() {
                println!("\nAccounts:");
                for state in &states {
                    print_state(state);
                }
            }
        }
        SyncCommand::Logs(SyncLogsArgs { source, account, limit, offset }) => {
            let logs = match source.as_deref() {
                Some(source) => orchestrator.logs(source, account.as_deref(), limit, offset)?,
                None => orchestrator.recent_logs(limit)?,
            };
            if logs.is_empty() {
                println!("No sync logs.");
            }
            for log in &logs {
                print_log(log);
            }
        }
        SyncCommand::Enable(args) => {
            let state = orchestrator.set_enabled(&args.source, args.account.as_deref(), true)?;
            println!("Enabled {}", state.source);
        }
        SyncCommand::Disable(args) => {
            let state = orchestrator.set_enabled(&args.source, args.account.as_deref(), false)?;
            println!("Disabled {}", state.source);
        }
        SyncCommand::Prune { days } => {
            let deleted = orchestrator.prune_logs(Duration::days(days))?;
            println!("Deleted {} sync logs", deleted);
        }
        SyncCommand::Recover { minutes } => {
            let states = orchestrator.recover_stale(Duration::minutes(minutes))?;
            println!("Recovered {} interrupted syncs", states.len());
        }
    }

    Ok(())
}

/// Cancel `token` on Ctrl-C. Returns false when no handler could be
/// installed; the sync still runs but can only end by timeout.
pub fn cancel_on_ctrlc(token: CancellationToken) -> bool {
    let installed = ctrlc::set_handler(move || {
        eprintln!("\nReceived Ctrl+C, cancelling sync...");
        token.cancel();
    });
    if let Err(err) = installed {
        warn!(error = %err, "could not install Ctrl+C handler; sync cannot be interrupted");
        return false;
    }
    true
}

fn with_timeout(ctx: SyncContext, timeout: &TimeoutArgs) -> SyncContext {
    match timeout.timeout {
        Some(secs) => ctx.with_timeout(StdDuration::from_secs(secs)),
        None => ctx,
    }
}

fn print_outcome(outcome: &RunOutcome) {
    print_state(&outcome.state);
    print_log(&outcome.log);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_ctrlc_handler_is_reported() {
        let first = CancellationToken::new();
        cancel_on_ctrlc(first.clone());

        let second = CancellationToken::new();
        assert!(!cancel_on_ctrlc(second.clone()));
        assert!(!first.is_cancelled());
        assert!(!second.is_cancelled());
    }
}
