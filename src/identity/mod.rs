//! Identity resolution: normalization, the identity cache and the resolver
//! that ties external identifiers to CRM contacts.

pub mod normalize;
mod service;
mod store;

pub use service::{IdentityService, MatchRequest, MatchResult};
pub use store::{IdentityStore, IdentityUpsert};
