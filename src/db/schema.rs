pub const SCHEMA_VERSION: i32 = 3;

/// V1: contacts, their reachable methods and the identity cache.
pub const SCHEMA_V1: &str = r#"
CREATE TABLE IF NOT EXISTS schema_version (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    version INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS persons (
    id TEXT PRIMARY KEY,
    name_given TEXT,
    name_family TEXT,
    display_name TEXT,
    search_name TEXT,
    last_contacted TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_persons_search_name ON persons(search_name);

CREATE TABLE IF NOT EXISTS contact_methods (
    id TEXT PRIMARY KEY,
    person_id TEXT NOT NULL REFERENCES persons(id) ON DELETE CASCADE,
    method_type TEXT NOT NULL,
    value TEXT NOT NULL,
    normalized_value TEXT NOT NULL,
    is_primary INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_contact_methods_person ON contact_methods(person_id);
CREATE INDEX IF NOT EXISTS idx_contact_methods_lookup ON contact_methods(method_type, normalized_value);

-- contact_id is a weak reference: no foreign key, cleared only by unlink.
CREATE TABLE IF NOT EXISTS external_identities (
    id TEXT PRIMARY KEY,
    identifier TEXT NOT NULL,
    identifier_type TEXT NOT NULL,
    raw_identifier TEXT,
    source TEXT NOT NULL,
    source_id TEXT,
    contact_id TEXT,
    match_type TEXT NOT NULL DEFAULT 'unmatched',
    match_confidence REAL,
    display_name TEXT,
    last_seen_at TEXT,
    message_count INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    UNIQUE (identifier, identifier_type, source)
);

CREATE INDEX IF NOT EXISTS idx_external_identities_contact ON external_identities(contact_id);
CREATE INDEX IF NOT EXISTS idx_external_identities_unmatched
    ON external_identities(match_type, message_count DESC, last_seen_at DESC);
CREATE INDEX IF NOT EXISTS idx_external_identities_lookup
    ON external_identities(identifier_type, identifier);

CREATE TABLE IF NOT EXISTS app_settings (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS oauth_tokens (
    provider TEXT NOT NULL,
    email TEXT NOT NULL,
    refresh_token TEXT NOT NULL,
    access_token TEXT,
    expires_at INTEGER,
    created_at TEXT DEFAULT CURRENT_TIMESTAMP,
    PRIMARY KEY (provider, email)
);
"#;

/// V2: external record snapshots, calendar events and sync bookkeeping.
pub const MIGRATION_V2: &str = r#"
CREATE TABLE IF NOT EXISTS external_contacts (
    id TEXT PRIMARY KEY,
    source TEXT NOT NULL,
    source_id TEXT NOT NULL,
    account_id TEXT NOT NULL DEFAULT '',
    etag TEXT,
    display_name TEXT,
    first_name TEXT,
    last_name TEXT,
    emails TEXT NOT NULL DEFAULT '[]',
    phones TEXT NOT NULL DEFAULT '[]',
    addresses TEXT NOT NULL DEFAULT '[]',
    organization TEXT,
    job_title TEXT,
    birthday TEXT,
    photo_url TEXT,
    crm_contact_id TEXT,
    match_status TEXT NOT NULL DEFAULT 'unmatched',
    duplicate_of_id TEXT REFERENCES external_contacts(id) ON DELETE SET NULL,
    metadata TEXT NOT NULL DEFAULT '{}',
    times_seen INTEGER NOT NULL DEFAULT 1,
    synced_at TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    UNIQUE (source, source_id, account_id)
);

CREATE INDEX IF NOT EXISTS idx_external_contacts_status ON external_contacts(match_status, source);
CREATE INDEX IF NOT EXISTS idx_external_contacts_crm ON external_contacts(crm_contact_id);

CREATE TABLE IF NOT EXISTS calendar_events (
    id TEXT PRIMARY KEY,
    account_id TEXT NOT NULL,
    event_id TEXT NOT NULL,
    title TEXT,
    description TEXT,
    location TEXT,
    start_time TEXT NOT NULL,
    end_time TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'confirmed',
    user_response TEXT,
    organizer_email TEXT,
    attendees TEXT NOT NULL DEFAULT '[]',
    matched_contact_ids TEXT NOT NULL DEFAULT '[]',
    html_link TEXT,
    last_contacted_updated INTEGER NOT NULL DEFAULT 0,
    synced_at TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    UNIQUE (account_id, event_id)
);

CREATE INDEX IF NOT EXISTS idx_calendar_events_pending
    ON calendar_events(last_contacted_updated, end_time);

CREATE TABLE IF NOT EXISTS sync_states (
    id TEXT PRIMARY KEY,
    source TEXT NOT NULL,
    account_id TEXT NOT NULL DEFAULT '',
    enabled INTEGER NOT NULL DEFAULT 1,
    status TEXT NOT NULL DEFAULT 'idle',
    strategy TEXT NOT NULL DEFAULT 'fetch_all',
    last_sync_at TEXT,
    last_successful_sync_at TEXT,
    next_sync_at TEXT,
    sync_cursor TEXT,
    error_message TEXT,
    error_count INTEGER NOT NULL DEFAULT 0,
    metadata TEXT NOT NULL DEFAULT '{}',
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    UNIQUE (source, account_id)
);

CREATE INDEX IF NOT EXISTS idx_sync_states_due ON sync_states(enabled, status, next_sync_at);

CREATE TABLE IF NOT EXISTS sync_logs (
    id TEXT PRIMARY KEY,
    sync_state_id TEXT NOT NULL REFERENCES sync_states(id) ON DELETE CASCADE,
    status TEXT NOT NULL DEFAULT 'running',
    items_processed INTEGER NOT NULL DEFAULT 0,
    items_matched INTEGER NOT NULL DEFAULT 0,
    items_created INTEGER NOT NULL DEFAULT 0,
    error_message TEXT,
    started_at TEXT NOT NULL,
    completed_at TEXT
);

CREATE INDEX IF NOT EXISTS idx_sync_logs_state ON sync_logs(sync_state_id, started_at DESC);
"#;

/// V3: emails folded by the Rust normalizer, kept beside the raw entries so
/// duplicate lookups agree with identity matching on non-ASCII addresses.
pub const MIGRATION_V3: &str = r#"
ALTER TABLE external_contacts ADD COLUMN normalized_emails TEXT NOT NULL DEFAULT '[]';
"#;
