use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A CRM contact. Owned by the contact repository; the sync engine only
/// reads it, searches it by name and moves `last_contacted` forward.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Person {
    pub id: Uuid,
    pub name_given: Option<String>,
    pub name_family: Option<String>,
    pub display_name: Option<String>,
    pub search_name: Option<String>,
    pub last_contacted: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Person {
    pub fn new() -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name_given: None,
            name_family: None,
            display_name: None,
            search_name: None,
            last_contacted: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_name(given: &str, family: &str) -> Self {
        let mut person = Self::new();
        person.name_given = Some(given.to_string()).filter(|s| !s.is_empty());
        person.name_family = Some(family.to_string()).filter(|s| !s.is_empty());
        person.compute_names();
        person
    }

    /// Recompute display_name and search_name from the name parts.
    pub fn compute_names(&mut self) {
        let parts: Vec<&str> = [self.name_given.as_deref(), self.name_family.as_deref()]
            .into_iter()
            .flatten()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect();

        if parts.is_empty() {
            return;
        }

        let full = parts.join(" ");
        self.search_name = Some(full.to_lowercase());
        self.display_name = Some(full);
    }

    /// Full name used for similarity search.
    pub fn full_name(&self) -> &str {
        self.display_name.as_deref().unwrap_or("")
    }
}

impl Default for Person {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compute_names() {
        let person = Person::with_name("Ada", "Lovelace");
        assert_eq!(person.display_name.as_deref(), Some("Ada Lovelace"));
        assert_eq!(person.search_name.as_deref(), Some("ada lovelace"));
    }

    #[test]
    fn test_compute_names_given_only() {
        let person = Person::with_name("Cher", "");
        assert_eq!(person.full_name(), "Cher");
        assert!(person.name_family.is_none());
    }
}
