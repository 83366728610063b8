//! Google Contacts provider.
//!
//! Mirrors each connection into `external_contacts`, marks cross-account
//! duplicates, and links records to CRM contacts by email, then phone,
//! then name. A linked contact gains any email or phone it was missing.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::dedup::mark_if_duplicate;
use super::google::{GooglePerson, PeopleApi, TokenSource};
use super::{SourceConfig, SyncContext, SyncFailure, SyncProvider, SyncResult};
use crate::clock::Clock;
use crate::config::Config;
use crate::db::{ContactMethodStore, Database, ExternalContactStore};
use crate::error::{Error, Result};
use crate::identity::normalize;
use crate::identity::{IdentityService, MatchRequest};
use crate::matching::FuzzyMatcher;
use crate::models::{
    AddressEntry, ContactMethod, ContactMethodType, EmailEntry, ExternalContact,
    ExternalContactUpsert, ExternalIdentity, IdentifierType, MatchStatus, Person, PhoneEntry,
    SyncState, SyncStrategy,
};

pub const SOURCE_CONTACTS: &str = "gcontacts";

/// What happened to one connection.
#[derive(Debug, Default, PartialEq)]
struct PersonOutcome {
    created: bool,
    matched: bool,
}

pub struct ContactsSyncProvider {
    api: Arc<dyn PeopleApi>,
    tokens: Arc<dyn TokenSource>,
    identity: IdentityService,
    matcher: FuzzyMatcher,
    externals: Arc<dyn ExternalContactStore>,
    methods: Arc<dyn ContactMethodStore>,
    clock: Arc<dyn Clock>,
    config: Config,
}

impl ContactsSyncProvider {
    pub fn new(
        api: Arc<dyn PeopleApi>,
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
            methods: db,
            clock,
            config,
        }
    }

    async fn sync_pages(
        &self,
        ctx: &SyncContext,
        account: &str,
        sync_token: Option<&str>,
        result: &mut SyncResult,
    ) -> Result<()> {
        let mut page_token: Option<String> = None;

        loop {
            let page = ctx
                .run(self.api.list_connections(account, sync_token, page_token.as_deref()))
                .await?;

            for person in &page.connections {
                ctx.check()?;
                match self.process_person(account, person) {
                    Ok(outcome) => {
                        result.items_processed += 1;
                        result.items_created += outcome.created as i64;
                        result.items_matched += outcome.matched as i64;
                    }
                    Err(err) => warn!(
                        account,
                        resource = %person.resource_name,
                        error = %err,
                        "failed to process contact"
                    ),
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

    fn process_person(&self, account: &str, person: &GooglePerson) -> Result<PersonOutcome> {
        if !person.has_useful_data() {
            debug!(resource = %person.resource_name, "skipping empty contact");
            return Ok(PersonOutcome::default());
        }

        let record = self
            .externals
            .upsert_external_contact(&self.to_upsert(account, person))?;
        let created = record.was_created();

        if created {
            if let Some(canonical) = mark_if_duplicate(self.externals.as_ref(), &record)? {
                debug!(resource = %person.resource_name, canonical = %canonical, "contact is a duplicate");
                return Ok(PersonOutcome {
                    created,
                    matched: false,
                });
            }
        }

        if record.is_duplicate() || record.crm_contact_id.is_some() {
            return Ok(PersonOutcome {
                created,
                matched: false,
            });
        }
        if matches!(record.match_status, MatchStatus::Ignored | MatchStatus::Imported) {
            return Ok(PersonOutcome {
                created,
                matched: false,
            });
        }

        // The record is stored either way; a failed match leaves it for review.
        let matched = match self.attempt_match(&record) {
            Ok(matched) => matched,
            Err(err) => {
                warn!(
                    source = SOURCE_CONTACTS,
                    resource = %person.resource_name,
                    error = %err,
                    "matching failed; contact left unmatched"
                );
                false
            }
        };
        Ok(PersonOutcome { created, matched })
    }

    fn to_upsert(&self, account: &str, person: &GooglePerson) -> ExternalContactUpsert {
        let name = person.names.first();
        let organization = person.organizations.first();

        ExternalContactUpsert {
            source: SOURCE_CONTACTS.to_string(),
            source_id: person.resource_name.clone(),
            account_id: account.to_string(),
            display_name: name.and_then(|n| non_empty(n.display_name.as_deref())),
            first_name: name.and_then(|n| non_empty(n.given_name.as_deref())),
            last_name: name.and_then(|n| non_empty(n.family_name.as_deref())),
            emails: person
                .email_addresses
                .iter()
                .filter(|e| !e.value.trim().is_empty())
                .map(|e| EmailEntry {
                    value: e.value.trim().to_string(),
                    kind: e.kind.clone(),
                    primary: e.is_primary(),
                })
                .collect(),
            phones: person
                .phone_numbers
                .iter()
                .filter(|p| !p.value.trim().is_empty())
                .map(|p| PhoneEntry {
                    value: p.value.trim().to_string(),
                    kind: p.kind.clone(),
                    primary: p.is_primary(),
                })
                .collect(),
            addresses: person
                .addresses
                .iter()
                .filter(|a| !a.formatted_value.trim().is_empty())
                .map(|a| AddressEntry {
                    formatted: a.formatted_value.clone(),
                    kind: a.kind.clone(),
                })
                .collect(),
            organization: organization.and_then(|o| non_empty(o.name.as_deref())),
            job_title: organization.and_then(|o| non_empty(o.title.as_deref())),
            birthday: person.birthday(),
            photo_url: person.photos.first().and_then(|p| non_empty(Some(p.url.as_str()))),
            etag: person.etag.clone().filter(|e| !e.is_empty()),
            metadata: Default::default(),
            synced_at: Some(self.clock.now()),
        }
    }

    /// Emails, then phones, through the identity cache; then name
    /// similarity. Returns true when the record was linked.
    fn attempt_match(&self, record: &ExternalContact) -> Result<bool> {
        let identifiers = record
            .emails
            .iter()
            .map(|e| (e.value.as_str(), IdentifierType::Email))
            .chain(record.phones.iter().map(|p| (p.value.as_str(), IdentifierType::Phone)));

        let mut observed: Vec<ExternalIdentity> = Vec::new();
        for (raw, identifier_type) in identifiers {
            let request = MatchRequest::new(raw, identifier_type, SOURCE_CONTACTS)
                .display_name(record.display_name.as_deref());

            let result = match self.identity.match_or_create(&request) {
                Ok(result) => result,
                Err(err) => {
                    debug!(identifier = raw, error = %err, "identifier skipped");
                    continue;
                }
            };

            if let Some(contact_id) = result.contact_id {
                self.link(record, contact_id)?;
                return Ok(true);
            }
            observed.push(result.identity);
        }

        let Some(name) = record.candidate_name() else {
            return Ok(false);
        };
        let email = record.emails.first().map(|e| e.value.as_str());
        let Some(found) = self.matcher.find_match(&name, email, &self.config.fuzzy)? else {
            return Ok(false);
        };

        debug!(
            resource = %record.source_id,
            contact_id = %found.contact_id,
            score = found.score,
            "fuzzy matched contact"
        );
        for identity in &observed {
            if let Err(err) = self
                .identity
                .record_fuzzy_match(identity.id, found.contact_id, found.score)
            {
                warn!(identity = %identity.id, error = %err, "failed to record fuzzy link");
            }
        }
        self.link(record, found.contact_id)?;
        Ok(true)
    }

    fn link(&self, record: &ExternalContact, contact_id: Uuid) -> Result<()> {
        self.externals
            .update_match(record.id, Some(contact_id), MatchStatus::Matched)?;
        if let Err(err) = self.enrich(contact_id, record) {
            warn!(contact_id = %contact_id, error = %err, "enrichment failed");
        }
        Ok(())
    }

    /// Add the record's emails and phones the contact does not have yet.
    fn enrich(&self, contact_id: Uuid, record: &ExternalContact) -> Result<usize> {
        let existing = self.methods.list_methods(contact_id)?;

        let candidates = record
            .emails
            .iter()
            .map(|email| {
                let method_type = match email.kind.as_deref() {
                    Some(kind) if kind.eq_ignore_ascii_case("work") => ContactMethodType::EmailWork,
                    _ => ContactMethodType::EmailPersonal,
                };
                (method_type, email.value.as_str())
            })
            .chain(record.phones.iter().map(|p| (ContactMethodType::Phone, p.value.as_str())));

        let mut added: Vec<ContactMethod> = Vec::new();
        for (method_type, value) in candidates {
            if normalize::validate(value, method_type.identifier_type()).is_err() {
                continue;
            }
            let method = ContactMethod::new(contact_id, method_type, value);
            let same = |m: &ContactMethod| {
                m.method_type.identifier_type() == method_type.identifier_type()
                    && m.normalized_value == method.normalized_value
            };
            if existing.iter().any(same) || added.iter().any(same) {
                continue;
            }
            added.push(method);
        }

        for method in &added {
            self.methods.add_method(method)?;
        }
        if !added.is_empty() {
            debug!(contact_id = %contact_id, added = added.len(), "enriched contact");
        }
        Ok(added.len())
    }
}

#[async_trait]
impl SyncProvider for ContactsSyncProvider {
    fn config(&self) -> SourceConfig {
        SourceConfig {
            name: SOURCE_CONTACTS,
            display_name: "Google Contacts",
            strategy: SyncStrategy::FetchAll,
            supports_multi_account: true,
            supports_discovery: true,
            default_interval: Duration::hours(1),
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
            .ok_or_else(|| Error::MissingAccount(SOURCE_CONTACTS.to_string()))?;
        info!(source = SOURCE_CONTACTS, account, incremental = state.cursor().is_some(), "starting contacts sync");

        let mut result = SyncResult::default();
        let mut outcome = self.sync_pages(ctx, account, state.cursor(), &mut result).await;
        if matches!(&outcome, Err(err) if err.is_recoverable_cursor_error() && state.cursor().is_some()) {
            warn!(account, "sync token expired, falling back to full sync");
            outcome = self.sync_pages(ctx, account, None, &mut result).await;
        }

        if let Err(err) = outcome {
            return Err(SyncFailure::new(err, result));
        }

        info!(
            source = SOURCE_CONTACTS,
            account,
            processed = result.items_processed,
            matched = result.items_matched,
            created = result.items_created,
            "contacts sync completed"
        );
        Ok(result)
    }

    async fn validate_credentials(&self, account_id: Option<&str>) -> Result<()> {
        match account_id {
            Some(account) => self.tokens.access_token(account).map(|_| ()),
            None if self.tokens.accounts()?.is_empty() => {
                Err(Error::MissingAccount(SOURCE_CONTACTS.to_string()))
            }
            None => Ok(()),
        }
    }
}

fn non_empty(s: Option<&str>) -> Option<String> {
    s.map(str::trim).filter(|s| !s.is_empty()).map(String::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::identity::IdentityStore;
    use crate::models::MatchType;
    use crate::sync::google::people::{FieldValue, PersonName};
    use crate::sync::google::{ConnectionsPage, GoogleApiError};
    use chrono::Utc;
    use parking_lot::Mutex;

    const ME: &str = "me@example.com";

    /// Pages chained by page token "1", "2"...; optionally rejects sync tokens.
    #[derive(Default)]
    struct FakePeople {
        pages: Vec<ConnectionsPage>,
        expire_sync_token: bool,
        calls: Mutex<Vec<(Option<String>, Option<String>)>>,
    }

    impl FakePeople {
        fn with_pages(pages: Vec<Vec<GooglePerson>>) -> Self {
            let count = pages.len();
            let pages = pages
                .into_iter()
                .enumerate()
                .map(|(i, connections)| ConnectionsPage {
                    connections,
                    next_page_token: (i + 1 < count).then(|| (i + 1).to_string()),
                    next_sync_token: (i + 1 == count).then(|| "people-sync-1".to_string()),
                })
                .collect();
            Self {
                pages,
                ..Default::default()
            }
        }
    }

    #[async_trait]
    impl PeopleApi for FakePeople {
        async fn list_connections(
            &self,
            _account: &str,
            sync_token: Option<&str>,
            page_token: Option<&str>,
        ) -> Result<ConnectionsPage> {
            self.calls
                .lock()
                .push((sync_token.map(String::from), page_token.map(String::from)));
            if self.expire_sync_token && sync_token.is_some() {
                return Err(Error::Api(GoogleApiError::SyncTokenExpired));
            }
            let index = page_token.map_or(0, |t| t.parse::<usize>().unwrap());
            Ok(self.pages[index].clone())
        }
    }

    fn person(resource: &str, name: &str, emails: &[&str], phones: &[&str]) -> GooglePerson {
        let value = |v: &&str| FieldValue {
            value: v.to_string(),
            ..Default::default()
        };
        GooglePerson {
            resource_name: resource.into(),
            names: if name.is_empty() {
                vec![]
            } else {
                vec![PersonName {
                    display_name: Some(name.into()),
                    ..Default::default()
                }]
            },
            email_addresses: emails.iter().map(value).collect(),
            phone_numbers: phones.iter().map(value).collect(),
            ..Default::default()
        }
    }

    struct Fixture {
        db: Arc<Database>,
        clock: Arc<ManualClock>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                db: Arc::new(Database::open_memory().unwrap()),
                clock: Arc::new(ManualClock::new(Utc::now())),
            }
        }

        fn provider(&self, api: FakePeople) -> ContactsSyncProvider {
            ContactsSyncProvider::new(
                Arc::new(api),
                self.db.clone(),
                self.db.clone(),
                self.clock.clone(),
                Config::default(),
            )
        }

        fn contact(&self, given: &str, family: &str, methods: &[(ContactMethodType, &str)]) -> Uuid {
            let person = Person::with_name(given, family);
            self.db.insert_person(&person).unwrap();
            for (method_type, value) in methods {
                self.db
                    .insert_contact_method(&ContactMethod::new(person.id, *method_type, value))
                    .unwrap();
            }
            person.id
        }

        fn state(&self, account: &str, cursor: Option<&str>) -> SyncState {
            let mut state = SyncState::new(SOURCE_CONTACTS, account, SyncStrategy::FetchAll);
            state.sync_cursor = cursor.map(String::from);
            state
        }
    }

    #[tokio::test]
    async fn test_contacts_mirrored_and_matched_across_pages() {
        let f = Fixture::new();
        let dana = f.contact("Dana", "Scully", &[(ContactMethodType::EmailWork, "dana@fbi.gov")]);
        let fox = f.contact("Fox", "Mulder", &[(ContactMethodType::Phone, "555-123-4567")]);

        let api = FakePeople::with_pages(vec![
            vec![
                person("people/1", "Dana Scully", &["Dana@FBI.gov"], &["(555) 000-1111"]),
                person("people/2", "", &[], &[]),
            ],
            vec![
                person("people/3", "Fox", &[], &["+1 555 123 4567"]),
                person("people/4", "Walter Skinner", &["ws@fbi.gov"], &[]),
            ],
        ]);
        let result = f
            .provider(api)
            .sync(&SyncContext::default(), &f.state(ME, None), &[])
            .await
            .unwrap();

        assert_eq!(result.items_processed, 4);
        assert_eq!(result.items_created, 3);
        assert_eq!(result.items_matched, 2);
        assert_eq!(result.new_cursor.as_deref(), Some("people-sync-1"));

        let scully = f.db.get_external_by_source(SOURCE_CONTACTS, "people/1", ME).unwrap().unwrap();
        assert_eq!(scully.crm_contact_id, Some(dana));
        assert_eq!(scully.match_status, MatchStatus::Matched);

        let mulder = f.db.get_external_by_source(SOURCE_CONTACTS, "people/3", ME).unwrap().unwrap();
        assert_eq!(mulder.crm_contact_id, Some(fox));

        // Dana gained the phone number she was missing.
        let methods = f.db.list_methods(dana).unwrap();
        assert!(methods
            .iter()
            .any(|m| m.method_type == ContactMethodType::Phone && m.normalized_value == "+15550001111"));
        assert_eq!(methods.iter().filter(|m| m.method_type.is_email()).count(), 1);

        let queue = f.db.list_unmatched_external(Some(SOURCE_CONTACTS), 10, 0).unwrap();
        assert_eq!(queue.len(), 1);
        assert_eq!(queue[0].source_id, "people/4");
    }

    #[tokio::test]
    async fn test_match_failure_keeps_contact_and_continues() {
        let f = Fixture::new();
        f.contact("Dana", "Scully", &[(ContactMethodType::EmailWork, "dana@fbi.gov")]);
        let fox = f.contact("Fox", "Mulder", &[(ContactMethodType::EmailWork, "fox@fbi.gov")]);
        f.db.conn()
            .execute_batch(
                "CREATE TRIGGER reject_link BEFORE UPDATE OF match_status ON external_contacts
                 WHEN NEW.source_id = 'people/1'
                 BEGIN SELECT RAISE(ABORT, 'link rejected'); END;",
            )
            .unwrap();

        let api = FakePeople::with_pages(vec![vec![
            person("people/1", "Dana Scully", &["dana@fbi.gov"], &[]),
            person("people/2", "Fox Mulder", &["fox@fbi.gov"], &[]),
        ]]);
        let result = f
            .provider(api)
            .sync(&SyncContext::default(), &f.state(ME, None), &[])
            .await
            .unwrap();

        assert_eq!(result.items_processed, 2);
        assert_eq!(result.items_created, 2);
        assert_eq!(result.items_matched, 1);

        let failed = f.db.get_external_by_source(SOURCE_CONTACTS, "people/1", ME).unwrap().unwrap();
        assert_eq!(failed.match_status, MatchStatus::Unmatched);
        assert_eq!(failed.crm_contact_id, None);
        let linked = f.db.get_external_by_source(SOURCE_CONTACTS, "people/2", ME).unwrap().unwrap();
        assert_eq!(linked.crm_contact_id, Some(fox));
    }

    #[tokio::test]
    async fn test_resync_does_not_count_as_created() {
        let f = Fixture::new();
        let pages = || FakePeople::with_pages(vec![vec![person("people/1", "Solo", &["solo@x.com"], &[])]]);

        let first = f.provider(pages()).sync(&SyncContext::default(), &f.state(ME, None), &[]).await.unwrap();
        let second = f.provider(pages()).sync(&SyncContext::default(), &f.state(ME, None), &[]).await.unwrap();
        assert_eq!(first.items_created, 1);
        assert_eq!(second.items_created, 0);

        let record = f.db.get_external_by_source(SOURCE_CONTACTS, "people/1", ME).unwrap().unwrap();
        assert_eq!(record.times_seen, 2);
    }

    #[tokio::test]
    async fn test_second_account_copy_is_duplicate() {
        let f = Fixture::new();
        let connection = || FakePeople::with_pages(vec![vec![person("people/9", "Same Person", &["same@x.com"], &[])]]);

        f.provider(connection())
            .sync(&SyncContext::default(), &f.state("a@example.com", None), &[])
            .await
            .unwrap();
        f.clock.advance(Duration::minutes(5));
        f.provider(connection())
            .sync(&SyncContext::default(), &f.state("b@example.com", None), &[])
            .await
            .unwrap();

        let first = f.db.get_external_by_source(SOURCE_CONTACTS, "people/9", "a@example.com").unwrap().unwrap();
        let second = f.db.get_external_by_source(SOURCE_CONTACTS, "people/9", "b@example.com").unwrap().unwrap();
        assert!(first.duplicate_of_id.is_none());
        assert_eq!(second.duplicate_of_id, Some(first.id));
        assert_eq!(f.db.count_unmatched_external(Some(SOURCE_CONTACTS)).unwrap(), 1);
    }

    #[tokio::test]
    async fn test_fuzzy_name_match_links_identities() {
        let f = Fixture::new();
        let ada = f.contact("Ada", "Lovelace", &[]);

        let api = FakePeople::with_pages(vec![vec![person("people/1", "Ada Lovelace", &["ada@engine.org"], &[])]]);
        let result = f.provider(api).sync(&SyncContext::default(), &f.state(ME, None), &[]).await.unwrap();
        assert_eq!(result.items_matched, 1);

        let identity = f
            .db
            .get_by_identifier(IdentifierType::Email, "ada@engine.org", SOURCE_CONTACTS)
            .unwrap()
            .unwrap();
        assert_eq!(identity.contact_id, Some(ada));
        assert_eq!(identity.match_type, MatchType::Fuzzy);
        assert_eq!(f.db.list_methods(ada).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_expired_sync_token_restarts_full_listing() {
        let f = Fixture::new();
        let api = FakePeople {
            expire_sync_token: true,
            ..FakePeople::with_pages(vec![vec![person("people/1", "Anyone", &[], &[])]])
        };
        let provider = f.provider(api);

        let result = provider
            .sync(&SyncContext::default(), &f.state(ME, Some("old-token")), &[])
            .await
            .unwrap();
        assert_eq!(result.items_processed, 1);
        assert_eq!(result.new_cursor.as_deref(), Some("people-sync-1"));
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let f = Fixture::new();
        let ctx = SyncContext::default();
        ctx.token().cancel();

        let failure = f
            .provider(FakePeople::with_pages(vec![vec![]]))
            .sync(&ctx, &f.state(ME, None), &[])
            .await
            .unwrap_err();
        assert!(failure.is_cancelled());
        assert_eq!(failure.partial.items_processed, 0);
    }

    #[test]
    fn test_enrich_skips_known_and_invalid_values() {
        let f = Fixture::new();
        let id = f.contact("Known", "Values", &[(ContactMethodType::EmailPersonal, "k@x.com")]);
        let provider = f.provider(FakePeople::default());

        let record = f
            .db
            .upsert_external_contact(&ExternalContactUpsert {
                source: SOURCE_CONTACTS.into(),
                source_id: "people/1".into(),
                account_id: ME.into(),
                emails: vec![
                    EmailEntry::new("K@x.com"),
                    EmailEntry {
                        kind: Some("work".into()),
                        ..EmailEntry::new("k@work.com")
                    },
                    EmailEntry::new("garbage"),
                ],
                phones: vec![PhoneEntry::new("555.222.3333"), PhoneEntry::new("(555) 222-3333")],
                ..Default::default()
            })
            .unwrap();

        assert_eq!(provider.enrich(id, &record).unwrap(), 2);
        let methods = f.db.list_methods(id).unwrap();
        assert!(methods
            .iter()
            .any(|m| m.method_type == ContactMethodType::EmailWork && m.normalized_value == "k@work.com"));
        assert_eq!(methods.len(), 3);
    }
}
