use chrono::{DateTime, Datelike, Local, Timelike, Utc};

use crate::matching::FuzzyMatch;
use crate::models::{ExternalContact, ExternalIdentity, SyncLog, SyncState};
use crate::sync::SourceConfig;

/// One line per identity: value, source, link.
pub fn print_identity(identity: &ExternalIdentity) {
    let link = match identity.contact_id {
        Some(id) => format!("-> {} ({})", id, identity.match_type.as_str()),
        None => "unmatched".to_string(),
    };
    let name = identity
        .display_name
        .as_deref()
        .map(|n| format!(" \"{}\"", truncate(n, 30)))
        .unwrap_or_default();

    println!(
        "  {}  {} [{}/{}]{}  {}",
        identity.id,
        identity.identifier,
        identity.identifier_type.as_str(),
        identity.source,
        name,
        link
    );
}

/// Full identity detail.
pub fn print_identity_detail(identity: &ExternalIdentity) {
    println!("{}\n", identity.identifier);
    println!("  id          {}", identity.id);
    println!("  type        {}", identity.identifier_type.as_str());
    println!("  source      {}", identity.source);
    if let Some(raw) = &identity.raw_identifier {
        println!("  raw         {}", raw);
    }
    if let Some(name) = &identity.display_name {
        println!("  name        {}", name);
    }
    match identity.contact_id {
        Some(contact) => {
            let confidence = identity
                .match_confidence
                .map(|c| format!(" {:.2}", c))
                .unwrap_or_default();
            println!(
                "  contact     {} ({}{})",
                contact,
                identity.match_type.as_str(),
                confidence
            );
        }
        None => println!("  contact     (unmatched)"),
    }
    println!("  seen        {} times", identity.message_count);
    if let Some(seen) = identity.last_seen_at {
        println!("  last seen   {}", format_time(&seen));
    }
}

/// Import candidate with its emails and phones.
pub fn print_candidate(record: &ExternalContact) {
    let name = record.candidate_name().unwrap_or_else(|| "(unnamed)".to_string());
    println!("{}  {} [{}/{}]", record.id, name, record.source, record.account_id);

    for email in &record.emails {
        println!("    {}", email.value);
    }
    for phone in &record.phones {
        println!("    {}", phone.value);
    }
    if let Some(org) = &record.organization {
        match &record.job_title {
            Some(title) => println!("    {} at {}", title, org),
            None => println!("    {}", org),
        }
    }
    if let Some(title) = record.metadata.get("meeting_title").and_then(|v| v.as_str()) {
        println!("    met in \"{}\"", truncate(title, 40));
    }
}

pub fn print_suggestions(suggestions: &[FuzzyMatch]) {
    for s in suggestions {
        println!("      ? {} {} ({:.0}%)", s.contact_id, s.contact_name, s.score * 100.0);
    }
}

pub fn print_provider(config: &SourceConfig) {
    println!(
        "  {:<12} {} [{}, every {}m]",
        config.name,
        config.display_name,
        config.strategy.as_str(),
        config.default_interval.num_minutes()
    );
}

pub fn print_state(state: &SyncState) {
    let account = state.account().unwrap_or("-");
    let last = state
        .last_successful_sync_at
        .map(|t| format_time(&t))
        .unwrap_or_else(|| "never".to_string());
    let next = state
        .next_sync_at
        .map(|t| format_time(&t))
        .unwrap_or_else(|| "now".to_string());

    println!(
        "  {:<12} {:<28} {:<9} last ok: {}  next: {}",
        state.source,
        truncate(account, 28),
        state.status.as_str(),
        last,
        next
    );
    if let Some(message) = &state.error_message {
        println!("      error ({}x): {}", state.error_count, truncate(message, 60));
    }
}

pub fn print_log(log: &SyncLog) {
    let duration = log
        .completed_at
        .map(|end| format!("{}s", (end - log.started_at).num_seconds()))
        .unwrap_or_else(|| "-".to_string());

    println!(
        "  {}  {:<10} {:<7} {:>5} processed {:>5} matched {:>5} created  {}",
        format_time(&log.started_at),
        log.source,
        log.status.as_str(),
        log.items_processed,
        log.items_matched,
        log.items_created,
        duration
    );
    if let Some(message) = &log.error_message {
        println!("      {}", truncate(message, 70));
    }
}

/// Local time, relative to today.
pub fn format_time(time: &DateTime<Utc>) -> String {
    format_time_at(&time.with_timezone(&Local), &Local::now())
}

fn format_time_at(date: &DateTime<Local>, now: &DateTime<Local>) -> String {
    let today = now.date_naive();
    let day = date.date_naive();
    let (pm, hour) = date.hour12();
    let clock = format!("{}:{:02}{}", hour, date.minute(), if pm { "pm" } else { "am" });

    if day == today {
        format!("Today at {}", clock)
    } else if Some(day) == today.pred_opt() {
        format!("Yesterday at {}", clock)
    } else if date.year() == now.year() {
        format!("{} {} at {}", month_abbrev(date.month()), date.day(), clock)
    } else {
        format!("{} {}, {} at {}", month_abbrev(date.month()), date.day(), date.year(), clock)
    }
}

fn month_abbrev(month: u32) -> &'static str {
    match month {
        1 => "Jan",
        2 => "Feb",
        3 => "Mar",
        4 => "Apr",
        5 => "May",
        6 => "Jun",
        7 => "Jul",
        8 => "Aug",
        9 => "Sep",
        10 => "Oct",
        11 => "Nov",
        12 => "Dec",
        _ => "???",
    }
}

/// First line, cut to `max_len` characters.
pub fn truncate(text: &str, max_len: usize) -> String {
    let trimmed = text.lines().next().unwrap_or("").trim();

    if trimmed.chars().count() <= max_len {
        trimmed.to_string()
    } else {
        let truncated: String = trimmed.chars().take(max_len.saturating_sub(1)).collect();
        format!("{}…", truncated.trim_end())
    }
}
