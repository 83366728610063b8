//! Fuzzy contact matching.
//!
//! Used after exact identity resolution comes back empty. A candidate's
//! score blends trigram name similarity with the share of its contact
//! methods that also appear on the external record.

mod trigram;

use std::collections::HashSet;
use std::sync::Arc;

use serde::Serialize;
use uuid::Uuid;

use crate::db::{ContactMethodStore, ContactStore, SimilarContact};
use crate::error::Result;
use crate::identity::normalize::{normalize_email, normalize_phone_loose};
use crate::models::{ContactMethod, ContactMethodType, ExternalContact};

pub use trigram::trigram_similarity;

/// Weights and thresholds for one matching context.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct FuzzyConfig {
    /// Name similarity floor for candidate retrieval.
    pub min_similarity: f64,
    /// Composite score needed to accept a candidate.
    pub confidence_threshold: f64,
    pub name_weight: f64,
    pub method_weight: f64,
    pub candidate_limit: usize,
}

impl FuzzyConfig {
    /// Automatic linking of calendar attendees.
    pub const CALENDAR: Self = Self {
        min_similarity: 0.3,
        confidence_threshold: 0.7,
        name_weight: 0.6,
        method_weight: 0.4,
        candidate_limit: 5,
    };

    /// Suggestions shown next to import candidates.
    pub const IMPORT: Self = Self {
        min_similarity: 0.3,
        confidence_threshold: 0.5,
        name_weight: 0.6,
        method_weight: 0.4,
        candidate_limit: 5,
    };

    /// Composite score. A candidate with no comparable methods is scored on
    /// name alone rather than being penalized for the missing term.
    pub fn score(&self, name_similarity: f64, method_matches: usize, total_methods: usize) -> f64 {
        if total_methods == 0 {
            return name_similarity;
        }
        let overlap = method_matches as f64 / total_methods as f64;
        self.name_weight * name_similarity + self.method_weight * overlap
    }
}

impl Default for FuzzyConfig {
    fn default() -> Self {
        Self::CALENDAR
    }
}

/// A contact returned by the similarity search together with its methods.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub contact_id: Uuid,
    pub name: String,
    pub name_similarity: f64,
    pub methods: Vec<ContactMethod>,
}

impl Candidate {
    pub fn new(similar: &SimilarContact, methods: Vec<ContactMethod>) -> Self {
        Self {
            contact_id: similar.contact.id,
            name: similar.contact.full_name().to_string(),
            name_similarity: similar.similarity,
            methods,
        }
    }

    /// (matching, total) over email methods only.
    fn email_overlap(&self, normalized_email: Option<&str>) -> (usize, usize) {
        let emails = self.methods.iter().filter(|m| m.method_type.is_email());
        let mut total = 0;
        let mut hits = 0;
        for method in emails {
            total += 1;
            if Some(normalize_email(&method.value).as_str()) == normalized_email {
                hits += 1;
            }
        }
        (hits, total)
    }

    /// (matching, total) over email and phone methods.
    fn record_overlap(&self, emails: &HashSet<String>, phones: &HashSet<String>) -> (usize, usize) {
        let mut total = 0;
        let mut hits = 0;
        for method in &self.methods {
            if method.method_type.is_email() {
                total += 1;
                if emails.contains(&normalize_email(&method.value)) {
                    hits += 1;
                }
            } else if method.method_type == ContactMethodType::Phone {
                total += 1;
                if phones.contains(&normalize_phone_loose(&method.value)) {
                    hits += 1;
                }
            }
        }
        (hits, total)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FuzzyMatch {
    pub contact_id: Uuid,
    pub contact_name: String,
    pub score: f64,
}

/// Pick the highest-scoring candidate at or above the confidence threshold.
///
/// Candidates are expected in retrieval order (name similarity descending);
/// on equal scores the earlier candidate wins.
pub fn best_match(
    candidates: &[Candidate],
    external_email: Option<&str>,
    config: &FuzzyConfig,
) -> Option<FuzzyMatch> {
    let mut best: Option<FuzzyMatch> = None;

    for candidate in candidates {
        let (hits, total) = candidate.email_overlap(external_email);
        let score = config.score(candidate.name_similarity, hits, total);
        if score < config.confidence_threshold {
            continue;
        }
        if best.as_ref().map_or(true, |b| score > b.score) {
            best = Some(FuzzyMatch {
                contact_id: candidate.contact_id,
                contact_name: candidate.name.clone(),
                score,
            });
        }
    }

    best
}

/// Fetches candidates through the contact stores and scores them.
#[derive(Clone)]
pub struct FuzzyMatcher {
    contacts: Arc<dyn ContactStore>,
    methods: Arc<dyn ContactMethodStore>,
}

impl FuzzyMatcher {
    pub fn new(contacts: Arc<dyn ContactStore>, methods: Arc<dyn ContactMethodStore>) -> Self {
        Self { contacts, methods }
    }

    fn candidates(&self, name: &str, config: &FuzzyConfig) -> Result<Vec<Candidate>> {
        let similar =
            self.contacts
                .find_similar_contacts(name, config.min_similarity, config.candidate_limit)?;

        let mut candidates = Vec::with_capacity(similar.len());
        for s in &similar {
            candidates.push(Candidate::new(s, self.methods.list_methods(s.contact.id)?));
        }
        Ok(candidates)
    }

    /// Match a display name plus optional email, e.g. a calendar attendee.
    pub fn find_match(
        &self,
        display_name: &str,
        email: Option<&str>,
        config: &FuzzyConfig,
    ) -> Result<Option<FuzzyMatch>> {
        if display_name.trim().is_empty() {
            return Ok(None);
        }
        let candidates = self.candidates(display_name, config)?;
        let email = email.map(normalize_email);
        Ok(best_match(&candidates, email.as_deref(), config))
    }

    /// Ranked suggestions for an unmatched external record, best first.
    /// Both emails and phones count toward method overlap.
    pub fn suggest(&self, external: &ExternalContact, config: &FuzzyConfig) -> Result<Vec<FuzzyMatch>> {
        let Some(name) = external.candidate_name() else {
            return Ok(Vec::new());
        };

        let emails: HashSet<String> = external.emails.iter().map(|e| normalize_email(&e.value)).collect();
        let phones: HashSet<String> = external
            .phones
            .iter()
            .map(|p| normalize_phone_loose(&p.value))
            .collect();

        let mut suggestions: Vec<FuzzyMatch> = self
            .candidates(&name, config)?
            .into_iter()
            .filter_map(|candidate| {
                let (hits, total) = candidate.record_overlap(&emails, &phones);
                let score = config.score(candidate.name_similarity, hits, total);
                (score >= config.confidence_threshold).then(|| FuzzyMatch {
                    contact_id: candidate.contact_id,
                    contact_name: candidate.name,
                    score,
                })
            })
            .collect();

        suggestions.sort_by(|a, b| b.score.total_cmp(&a.score));
        Ok(suggestions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::models::{EmailEntry, Person, PhoneEntry};
    use chrono::Utc;
    use serde_json::Map;

    fn candidate(similarity: f64, emails: &[&str]) -> Candidate {
        let id = Uuid::new_v4();
        Candidate {
            contact_id: id,
            name: format!("candidate {}", similarity),
            name_similarity: similarity,
            methods: emails
                .iter()
                .map(|e| ContactMethod::new(id, ContactMethodType::EmailPersonal, e))
                .collect(),
        }
    }

    #[test]
    fn test_score_weights() {
        let config = FuzzyConfig::CALENDAR;
        assert!((config.score(0.5, 1, 2) - (0.3 + 0.2)).abs() < 1e-9);
        assert!((config.score(1.0, 1, 1) - 1.0).abs() < 1e-9);
        assert_eq!(config.score(0.8, 0, 0), 0.8);
        assert!((config.score(0.8, 0, 3) - 0.48).abs() < 1e-9);
    }

    #[test]
    fn test_acceptance_threshold() {
        let candidates = vec![candidate(0.9, &[]), candidate(0.75, &[]), candidate(0.4, &[])];

        let config = FuzzyConfig {
            confidence_threshold: 0.8,
            ..FuzzyConfig::CALENDAR
        };
        let found = best_match(&candidates, None, &config).unwrap();
        assert_eq!(found.contact_id, candidates[0].contact_id);
        assert!((found.score - 0.9).abs() < 1e-9);

        let strict = FuzzyConfig {
            confidence_threshold: 0.95,
            ..FuzzyConfig::CALENDAR
        };
        assert!(best_match(&candidates, None, &strict).is_none());
    }

    #[test]
    fn test_first_candidate_wins_ties() {
        let candidates = vec![candidate(0.8, &[]), candidate(0.8, &[])];
        let found = best_match(&candidates, None, &FuzzyConfig::CALENDAR).unwrap();
        assert_eq!(found.contact_id, candidates[0].contact_id);
    }

    #[test]
    fn test_method_overlap_can_promote_weaker_name() {
        // 0.6 * 0.9 + 0.4 * 0 = 0.54 vs 0.6 * 0.7 + 0.4 * 1 = 0.82
        let candidates = vec![
            candidate(0.9, &["someone@else.com"]),
            candidate(0.7, &["Alice@Example.com"]),
        ];
        let found = best_match(&candidates, Some("alice@example.com"), &FuzzyConfig::CALENDAR).unwrap();
        assert_eq!(found.contact_id, candidates[1].contact_id);
        assert!((found.score - 0.82).abs() < 1e-9);
    }

    #[test]
    fn test_fuzzy_matcher_against_database() {
        let db = Arc::new(Database::open_memory().unwrap());
        let alice = Person::with_name("Alice", "Johnson");
        db.insert_person(&alice).unwrap();
        db.insert_contact_method(&ContactMethod::new(alice.id, ContactMethodType::EmailWork, "alice@corp.com"))
            .unwrap();

        let matcher = FuzzyMatcher::new(db.clone(), db.clone());
        let found = matcher
            .find_match("Alice Johnson", Some("ALICE@corp.com"), &FuzzyConfig::CALENDAR)
            .unwrap()
            .unwrap();
        assert_eq!(found.contact_id, alice.id);

        // Same name, different email: 0.6 * 1.0 = 0.6 < 0.7
        assert!(matcher
            .find_match("Alice Johnson", Some("alice@home.com"), &FuzzyConfig::CALENDAR)
            .unwrap()
            .is_none());
        assert!(matcher.find_match("", None, &FuzzyConfig::CALENDAR).unwrap().is_none());
    }

    #[test]
    fn test_suggest_counts_phone_overlap() {
        let db = Arc::new(Database::open_memory().unwrap());
        let bob = Person::with_name("Bob", "Stone");
        db.insert_person(&bob).unwrap();
        db.insert_contact_method(&ContactMethod::new(bob.id, ContactMethodType::EmailPersonal, "bob@home.com"))
            .unwrap();
        db.insert_contact_method(&ContactMethod::new(bob.id, ContactMethodType::Phone, "(555) 222-3333"))
            .unwrap();

        let now = Utc::now();
        let external = ExternalContact {
            id: Uuid::new_v4(),
            source: "gcontacts".into(),
            source_id: "people/1".into(),
            account_id: String::new(),
            display_name: Some("Bob Stone".into()),
            first_name: None,
            last_name: None,
            emails: vec![EmailEntry::new("other@x.com")],
            phones: vec![PhoneEntry::new("555-222-3333")],
            addresses: Vec::new(),
            organization: None,
            job_title: None,
            birthday: None,
            photo_url: None,
            etag: None,
            crm_contact_id: None,
            match_status: Default::default(),
            duplicate_of_id: None,
            metadata: Map::new(),
            times_seen: 1,
            synced_at: None,
            created_at: now,
            updated_at: now,
        };

        let matcher = FuzzyMatcher::new(db.clone(), db.clone());
        let suggestions = matcher.suggest(&external, &FuzzyConfig::IMPORT).unwrap();
        assert_eq!(suggestions.len(), 1);
        assert_eq!(suggestions[0].contact_id, bob.id);
        // Half of Bob's methods overlap.
        assert!((suggestions[0].score - 0.8).abs() < 1e-9);
    }
}
