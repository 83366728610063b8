use anyhow::{anyhow, Result};

use super::display::{print_identity, print_identity_detail};
use super::{parse_id, App, IdentityCommand, MatchArgs, PageArgs, ShowIdentityArgs};
use crate::identity::normalize::detect_identifier_type;
use crate::identity::MatchRequest;
use crate::models::IdentifierType;

pub fn run_identities(app: &App, command: IdentityCommand) -> Result<()> {
    match command {
        IdentityCommand::Unmatched(args) => list_unmatched(app, args),
        IdentityCommand::Link(args) => {
            let contact_id = parse_id("contact", &args.contact)?;
            let ids = args
                .identity_ids
                .iter()
                .map(|id| parse_id("identity", id))
                .collect::<Result<Vec<_>>>()?;
            let linked = app.identity().bulk_link_identities(&ids, contact_id)?;
            println!("Linked {} of {} identities to {}", linked, ids.len(), contact_id);
            Ok(())
        }
        IdentityCommand::Unlink { identity_id } => {
            let identity = app.identity().unlink_identity(parse_id("identity", &identity_id)?)?;
            println!("Unlinked {}", identity.identifier);
            Ok(())
        }
        IdentityCommand::Match(args) => run_match(app, args),
        IdentityCommand::Show(args) => show(app, args),
    }
}

fn list_unmatched(app: &App, args: PageArgs) -> Result<()> {
    let service = app.identity();
    let source = args.source.as_deref();

    let identities = service.list_unmatched(source, args.limit, args.offset)?;
    if identities.is_empty() {
        println!("No unmatched identities.");
        return Ok(());
    }

    println!("Unmatched identities ({} total):\n", service.count_unmatched(source)?);
    for identity in &identities {
        print_identity(identity);
    }
    Ok(())
}

fn identifier_type(raw: &str, explicit: Option<&str>) -> Result<IdentifierType> {
    match explicit {
        Some(name) => Ok(IdentifierType::parse(name)?),
        None => Ok(detect_identifier_type(raw)),
    }
}

fn run_match(app: &App, args: MatchArgs) -> Result<()> {
    let identifier_type = identifier_type(&args.identifier, args.identifier_type.as_deref())?;
    let request = MatchRequest::new(&args.identifier, identifier_type, &args.source)
        .display_name(args.name.as_deref());
    let result = app.identity().match_or_create(&request)?;

    let how = if result.cached { "cached" } else { "searched" };
    match result.contact_id {
        Some(contact_id) => {
            let name = app
                .db
                .get_person_by_id(contact_id)?
                .and_then(|p| p.display_name)
                .unwrap_or_else(|| contact_id.to_string());
            println!("{} -> {} ({}, {})", result.identity.identifier, name, result.match_type.as_str(), how);
        }
        None => println!("{} is unmatched ({})", result.identity.identifier, how),
    }
    Ok(())
}

/// Accepts an identity id, a contact id, or a raw identifier.
fn show(app: &App, args: ShowIdentityArgs) -> Result<()> {
    let service = app.identity();

    if let Ok(id) = uuid::Uuid::parse_str(args.value.trim()) {
        if let Some(identity) = service.get_identity(id)? {
            print_identity_detail(&identity);
            return Ok(());
        }
        let linked = service.list_for_contact(id)?;
        if linked.is_empty() {
            return Err(anyhow!("no identity or linked contact with id {}", id));
        }
        println!("Identities linked to {}:\n", id);
        for identity in &linked {
            print_identity(identity);
        }
        return Ok(());
    }

    let identifier_type = identifier_type(&args.value, args.identifier_type.as_deref())?;
    let seen = service.find_across_sources(&args.value, identifier_type)?;
    if seen.is_empty() {
        println!("{} has not been seen by any source.", args.value);
        return Ok(());
    }
    for identity in &seen {
        print_identity(identity);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use std::sync::Arc;

    #[test]
    fn test_identifier_type_detection() {
        assert_eq!(identifier_type("a@b.com", None).unwrap(), IdentifierType::Email);
        assert_eq!(identifier_type("+15551234567", None).unwrap(), IdentifierType::Phone);
        assert_eq!(
            identifier_type("@handle", Some("telegram")).unwrap(),
            IdentifierType::Telegram
        );
        assert!(identifier_type("x", Some("fax")).is_err());
    }

    #[test]
    fn test_commands_against_store() {
        let app = App::new(Arc::new(Database::open_memory().unwrap())).unwrap();

        run_match(
            &app,
            MatchArgs {
                identifier: "New@Example.com".into(),
                identifier_type: None,
                source: "cli".into(),
                name: None,
            },
        )
        .unwrap();
        assert_eq!(app.identity().count_unmatched(Some("cli")).unwrap(), 1);

        list_unmatched(&app, PageArgs { limit: 10, offset: 0, source: Some("cli".into()) }).unwrap();
        show(&app, ShowIdentityArgs { value: "new@example.com".into(), identifier_type: None }).unwrap();
        assert!(show(
            &app,
            ShowIdentityArgs { value: uuid::Uuid::new_v4().to_string(), identifier_type: None }
        )
        .is_err());
    }
}
