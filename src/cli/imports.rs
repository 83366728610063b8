use anyhow::{anyhow, Result};

use super::display::{print_candidate, print_suggestions};
use super::{parse_id, App, ImportCommand, ImportListArgs};
use crate::db::{ContactStore, ExternalContactStore};
use crate::models::MatchStatus;

pub fn run_imports(app: &App, command: ImportCommand) -> Result<()> {
    match command {
        ImportCommand::List(args) => list(app, args),
        ImportCommand::Link { external_id, contact_id } => {
            let external_id = parse_id("import", &external_id)?;
            let contact_id = parse_id("contact", &contact_id)?;
            if app.db.get_contact(contact_id)?.is_none() {
                return Err(anyhow!("contact not found: {}", contact_id));
            }
            let record = app
                .db
                .update_match(external_id, Some(contact_id), MatchStatus::Matched)?;
            println!(
                "Linked {} to {}",
                record.candidate_name().unwrap_or_else(|| record.source_id.clone()),
                contact_id
            );
            Ok(())
        }
        ImportCommand::Ignore { external_id } => {
            let record = app.db.ignore_external_contact(parse_id("import", &external_id)?)?;
            println!("Ignored {}", record.candidate_name().unwrap_or(record.source_id));
            Ok(())
        }
    }
}

fn list(app: &App, args: ImportListArgs) -> Result<()> {
    let source = args.source.as_deref();
    let records = app.db.list_unmatched_external(source, args.limit, args.offset)?;
    if records.is_empty() {
        println!("No import candidates.");
        return Ok(());
    }

    println!("Import candidates ({} total):\n", app.db.count_unmatched_external(source)?);
    let matcher = app.matcher();
    for record in &records {
        print_candidate(record);
        if args.suggest {
            print_suggestions(&matcher.suggest(record, &app.config.suggestions)?);
        }
    }
    Ok(())
}
