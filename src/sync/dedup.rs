use tracing::debug;
use uuid::Uuid;

use crate::db::ExternalContactStore;
use crate::error::Result;
use crate::identity::normalize::normalize_email;
use crate::models::ExternalContact;

/// Mark a newly created record as a duplicate of the oldest earlier record
/// in the same source sharing one of its emails. Returns the canonical id
/// when marked.
pub(crate) fn mark_if_duplicate(
    store: &dyn ExternalContactStore,
    record: &ExternalContact,
) -> Result<Option<Uuid>> {
    if record.is_duplicate() {
        return Ok(record.duplicate_of_id);
    }

    for entry in &record.emails {
        let email = normalize_email(&entry.value);
        if email.is_empty() {
            continue;
        }

        for other in store.find_by_normalized_email(&record.source, &email)? {
            // Oldest first: anything after this point is newer than us.
            if other.id == record.id {
                break;
            }
            if other.is_duplicate() {
                continue;
            }

            store.mark_duplicate(record.id, other.id)?;
            debug!(
                source = %record.source,
                duplicate = %record.id,
                canonical = %other.id,
                email = %email,
                "marked duplicate"
            );
            return Ok(Some(other.id));
        }
    }

    Ok(None)
}
