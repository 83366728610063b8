use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, warn};
use uuid::Uuid;

use super::normalize::{self, method_types_for};
use super::store::{IdentityStore, IdentityUpsert};
use crate::clock::Clock;
use crate::db::{ContactMethodStore, ContactStore, Database};
use crate::error::{Error, Result};
use crate::models::{ExternalIdentity, IdentifierType, MatchType};

#[derive(Debug, Clone)]
pub struct MatchRequest {
    pub raw_identifier: String,
    pub identifier_type: IdentifierType,
    pub source: String,
    pub source_id: Option<String>,
    pub display_name: Option<String>,
    /// When set, the caller already knows the owner and no search runs.
    pub known_contact_id: Option<Uuid>,
}

impl MatchRequest {
    pub fn new(raw_identifier: &str, identifier_type: IdentifierType, source: &str) -> Self {
        Self {
            raw_identifier: raw_identifier.to_string(),
            identifier_type,
            source: source.to_string(),
            source_id: None,
            display_name: None,
            known_contact_id: None,
        }
    }

    pub fn display_name(mut self, name: Option<&str>) -> Self {
        self.display_name = name.map(str::trim).filter(|n| !n.is_empty()).map(String::from);
        self
    }

    pub fn for_contact(mut self, contact_id: Uuid) -> Self {
        self.known_contact_id = Some(contact_id);
        self
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MatchResult {
    pub identity: ExternalIdentity,
    pub contact_id: Option<Uuid>,
    pub match_type: MatchType,
    /// The answer came from the cache; no search ran.
    pub cached: bool,
}

impl MatchResult {
    fn new(identity: ExternalIdentity, cached: bool) -> Self {
        Self {
            contact_id: identity.contact_id,
            match_type: identity.match_type,
            identity,
            cached,
        }
    }
}

/// Resolves external identifiers to CRM contacts through the identity cache.
#[derive(Clone)]
pub struct IdentityService {
    identities: Arc<dyn IdentityStore>,
    contacts: Arc<dyn ContactStore>,
    methods: Arc<dyn ContactMethodStore>,
    clock: Arc<dyn Clock>,
}

impl IdentityService {
    pub fn new(
        identities: Arc<dyn IdentityStore>,
        contacts: Arc<dyn ContactStore>,
        methods: Arc<dyn ContactMethodStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            identities,
            contacts,
            methods,
            clock,
        }
    }

    pub fn from_database(db: Arc<Database>, clock: Arc<dyn Clock>) -> Self {
        Self::new(db.clone(), db.clone(), db, clock)
    }

    /// Resolve an identifier, creating or refreshing its cache entry.
    ///
    /// Every call adds one to the entry's message count and refreshes
    /// `last_seen_at`, whatever the outcome. A cached entry is returned as
    /// is, even when unmatched; only an explicit unlink or link changes it.
    pub fn match_or_create(&self, request: &MatchRequest) -> Result<MatchResult> {
        let normalized = normalize::validate(&request.raw_identifier, request.identifier_type)?;

        if let Some(contact_id) = request.known_contact_id {
            return self.link_known_contact(request, normalized, contact_id);
        }

        let cached = self
            .identities
            .get_by_identifier(request.identifier_type, &normalized, &request.source)?
            .is_some();

        let (contact_id, match_type, confidence) = if cached {
            (None, MatchType::Unmatched, None)
        } else {
            match self.search_exact(request.identifier_type, &normalized)? {
                Some(contact_id) => (Some(contact_id), MatchType::Exact, Some(1.0)),
                None => (None, MatchType::Unmatched, None),
            }
        };

        // On a cache hit the null contact leaves the stored link untouched.
        let identity = self.identities.upsert_identity(&IdentityUpsert {
            match_type,
            contact_id,
            match_confidence: confidence,
            ..self.observation(request, normalized)
        })?;

        debug!(
            source = %request.source,
            identifier = %identity.identifier,
            match_type = identity.match_type.as_str(),
            cached,
            "identity resolved"
        );

        Ok(MatchResult::new(identity, cached))
    }

    fn link_known_contact(
        &self,
        request: &MatchRequest,
        normalized: String,
        contact_id: Uuid,
    ) -> Result<MatchResult> {
        if self.contacts.get_contact(contact_id)?.is_none() {
            return Err(Error::not_found("contact", contact_id));
        }

        let identity = self.identities.upsert_identity(&IdentityUpsert {
            contact_id: Some(contact_id),
            match_type: MatchType::Exact,
            match_confidence: Some(1.0),
            ..self.observation(request, normalized)
        })?;

        Ok(MatchResult::new(identity, false))
    }

    /// One owning contact, or none when nothing matches or the value is
    /// shared by several contacts.
    fn search_exact(&self, identifier_type: IdentifierType, normalized: &str) -> Result<Option<Uuid>> {
        let owners = self
            .methods
            .find_contacts_by_method(method_types_for(identifier_type), normalized)?;

        match owners.as_slice() {
            [] => Ok(None),
            [only] => Ok(Some(*only)),
            _ => {
                warn!(
                    identifier = normalized,
                    contacts = owners.len(),
                    "identifier belongs to several contacts, leaving unmatched"
                );
                Ok(None)
            }
        }
    }

    fn observation(&self, request: &MatchRequest, normalized: String) -> IdentityUpsert {
        IdentityUpsert {
            identifier: normalized,
            identifier_type: request.identifier_type,
            raw_identifier: Some(request.raw_identifier.clone()),
            source: request.source.clone(),
            source_id: request.source_id.clone(),
            contact_id: None,
            match_type: MatchType::Unmatched,
            match_confidence: None,
            display_name: request.display_name.clone(),
            message_count_delta: 1,
            seen_at: self.clock.now(),
        }
    }

    // ==================== MANUAL OPERATIONS ====================

    pub fn link_identity(&self, identity_id: Uuid, contact_id: Uuid) -> Result<ExternalIdentity> {
        self.require_contact(contact_id)?;
        self.identities
            .link_to_contact(identity_id, contact_id, MatchType::Manual, Some(1.0))
    }

    pub fn unlink_identity(&self, identity_id: Uuid) -> Result<ExternalIdentity> {
        self.identities.unlink_from_contact(identity_id)
    }

    pub fn bulk_link_identities(&self, identity_ids: &[Uuid], contact_id: Uuid) -> Result<usize> {
        self.require_contact(contact_id)?;
        self.identities
            .bulk_link_to_contact(identity_ids, contact_id, MatchType::Manual, Some(1.0))
    }

    /// Record a fuzzy link found by a provider so later lookups hit the
    /// cache. Manual links are left alone.
    pub fn record_fuzzy_match(
        &self,
        identity_id: Uuid,
        contact_id: Uuid,
        confidence: f64,
    ) -> Result<ExternalIdentity> {
        let identity = self
            .identities
            .get_identity(identity_id)?
            .ok_or_else(|| Error::not_found("identity", identity_id))?;

        if identity.match_type == MatchType::Manual {
            return Ok(identity);
        }

        self.identities
            .link_to_contact(identity_id, contact_id, MatchType::Fuzzy, Some(confidence))
    }

    pub fn get_identity(&self, identity_id: Uuid) -> Result<Option<ExternalIdentity>> {
        self.identities.get_identity(identity_id)
    }

    pub fn list_unmatched(
        &self,
        source: Option<&str>,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<ExternalIdentity>> {
        self.identities.list_unmatched(source, limit, offset)
    }

    pub fn count_unmatched(&self, source: Option<&str>) -> Result<u64> {
        self.identities.count_unmatched(source)
    }

    pub fn list_for_contact(&self, contact_id: Uuid) -> Result<Vec<ExternalIdentity>> {
        self.identities.list_for_contact(contact_id)
    }

    pub fn list_by_source(&self, source: &str, limit: u32) -> Result<Vec<ExternalIdentity>> {
        self.identities.list_by_source(source, limit)
    }

    /// Cross-source view of one identifier.
    pub fn find_across_sources(
        &self,
        raw_identifier: &str,
        identifier_type: IdentifierType,
    ) -> Result<Vec<ExternalIdentity>> {
        let normalized = normalize::validate(raw_identifier, identifier_type)?;
        self.identities.find_by_identifier(identifier_type, &normalized)
    }

    pub fn delete_identity(&self, identity_id: Uuid) -> Result<bool> {
        self.identities.delete_identity(identity_id)
    }

    fn require_contact(&self, contact_id: Uuid) -> Result<()> {
        match self.contacts.get_contact(contact_id)? {
            Some(_) => Ok(()),
            None => Err(Error::not_found("contact", contact_id)),
        }
    }
}
