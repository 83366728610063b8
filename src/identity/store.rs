use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::Result;
use crate::models::{ExternalIdentity, IdentifierType, MatchType};

/// One observation of an identifier, written with merge semantics.
#[derive(Debug, Clone)]
pub struct IdentityUpsert {
    /// Already normalized.
    pub identifier: String,
    pub identifier_type: IdentifierType,
    pub raw_identifier: Option<String>,
    pub source: String,
    pub source_id: Option<String>,
    pub contact_id: Option<Uuid>,
    pub match_type: MatchType,
    pub match_confidence: Option<f64>,
    pub display_name: Option<String>,
    pub message_count_delta: i64,
    pub seen_at: DateTime<Utc>,
}

/// Persistence for the identity cache, keyed by
/// (identifier, identifier_type, source).
pub trait IdentityStore: Send + Sync {
    /// Insert or merge in a single atomic statement.
    ///
    /// On conflict: non-null incoming fields replace stored ones and null
    /// ones never clear them, `message_count` grows by the delta, and
    /// `last_seen_at` is always overwritten. Link fields only change when a
    /// contact id is supplied.
    fn upsert_identity(&self, entry: &IdentityUpsert) -> Result<ExternalIdentity>;

    fn get_identity(&self, id: Uuid) -> Result<Option<ExternalIdentity>>;

    fn get_by_identifier(
        &self,
        identifier_type: IdentifierType,
        identifier: &str,
        source: &str,
    ) -> Result<Option<ExternalIdentity>>;

    /// Every source's row for this identifier.
    fn find_by_identifier(
        &self,
        identifier_type: IdentifierType,
        identifier: &str,
    ) -> Result<Vec<ExternalIdentity>>;

    /// Errors with `NotFound` when the identity does not exist.
    fn link_to_contact(
        &self,
        id: Uuid,
        contact_id: Uuid,
        match_type: MatchType,
        confidence: Option<f64>,
    ) -> Result<ExternalIdentity>;

    /// Clears the contact and confidence and resets to unmatched.
    fn unlink_from_contact(&self, id: Uuid) -> Result<ExternalIdentity>;

    /// Highest message_count first, then most recently seen. `source`
    /// narrows to one source.
    fn list_unmatched(
        &self,
        source: Option<&str>,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<ExternalIdentity>>;

    fn count_unmatched(&self, source: Option<&str>) -> Result<u64>;

    fn list_for_contact(&self, contact_id: Uuid) -> Result<Vec<ExternalIdentity>>;

    /// Link a batch in one transaction. Unknown ids are skipped; returns the
    /// number of rows linked.
    fn bulk_link_to_contact(
        &self,
        ids: &[Uuid],
        contact_id: Uuid,
        match_type: MatchType,
        confidence: Option<f64>,
    ) -> Result<usize>;

    /// Most recently seen first.
    fn list_by_source(&self, source: &str, limit: u32) -> Result<Vec<ExternalIdentity>>;

    /// Record activity without a full upsert.
    fn touch_identity(
        &self,
        id: Uuid,
        message_count_delta: i64,
        seen_at: DateTime<Utc>,
    ) -> Result<ExternalIdentity>;

    fn delete_identity(&self, id: Uuid) -> Result<bool>;
}
