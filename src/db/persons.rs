use chrono::{DateTime, Utc};
use rusqlite::{params, params_from_iter, Row};
use uuid::Uuid;

use super::{parse_opt_ts, parse_ts, parse_uuid, ts, Database};
use crate::error::Result;
use crate::matching::trigram_similarity;
use crate::models::*;

/// Contact returned by a name-similarity search.
#[derive(Debug, Clone, PartialEq)]
pub struct SimilarContact {
    pub contact: Person,
    pub similarity: f64,
}

/// Read access to CRM contacts needed by matching and sync.
pub trait ContactStore: Send + Sync {
    fn get_contact(&self, id: Uuid) -> Result<Option<Person>>;

    /// Contacts handed to contact-driven providers, by name.
    fn list_contacts(&self, limit: u32) -> Result<Vec<Person>>;

    /// Contacts whose full name scores strictly above `threshold`, best first.
    fn find_similar_contacts(
        &self,
        name: &str,
        threshold: f64,
        limit: usize,
    ) -> Result<Vec<SimilarContact>>;

    /// Move `last_contacted` forward to `at`. Returns false when the contact
    /// is missing or already has a later value.
    fn update_last_contacted(&self, id: Uuid, at: DateTime<Utc>) -> Result<bool>;
}

pub trait ContactMethodStore: Send + Sync {
    fn list_methods(&self, person_id: Uuid) -> Result<Vec<ContactMethod>>;

    /// Distinct contacts owning a method of one of `types` with this
    /// normalized value, oldest method first.
    fn find_contacts_by_method(
        &self,
        types: &[ContactMethodType],
        normalized_value: &str,
    ) -> Result<Vec<Uuid>>;

    fn add_method(&self, method: &ContactMethod) -> Result<()>;
}

impl Database {
    // ==================== PERSON CRUD ====================

    pub fn insert_person(&self, person: &Person) -> Result<()> {
        self.conn().execute(
            r#"INSERT INTO persons (
                id, name_given, name_family, display_name, search_name,
                last_contacted, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)"#,
            params![
                person.id.to_string(),
                person.name_given,
                person.name_family,
                person.display_name,
                person.search_name,
                person.last_contacted.as_ref().map(ts),
                ts(&person.created_at),
                ts(&person.updated_at),
            ],
        )?;
        Ok(())
    }

    pub fn get_person_by_id(&self, id: Uuid) -> Result<Option<Person>> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT * FROM persons WHERE id = ?")?;

        let result = stmt.query_row([id.to_string()], Self::row_to_person);

        match result {
            Ok(person) => Ok(Some(person)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn list_persons(&self, limit: u32, offset: u32) -> Result<Vec<Person>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT * FROM persons ORDER BY search_name ASC, created_at ASC LIMIT ? OFFSET ?",
        )?;

        let persons = stmt
            .query_map([limit, offset], Self::row_to_person)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(persons)
    }

    pub fn delete_person(&self, id: Uuid) -> Result<bool> {
        let rows = self
            .conn()
            .execute("DELETE FROM persons WHERE id = ?", [id.to_string()])?;
        Ok(rows > 0)
    }

    // ==================== CONTACT METHOD CRUD ====================

    pub fn insert_contact_method(&self, method: &ContactMethod) -> Result<()> {
        let conn = self.conn();
        conn.execute(
            r#"INSERT INTO contact_methods (
                id, person_id, method_type, value, normalized_value, is_primary, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?)"#,
            params![
                method.id.to_string(),
                method.person_id.to_string(),
                method.method_type.as_str(),
                method.value,
                method.normalized_value,
                method.is_primary as i32,
                ts(&method.created_at),
            ],
        )?;
        Ok(())
    }

    pub fn get_methods_for_person(&self, person_id: Uuid) -> Result<Vec<ContactMethod>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT * FROM contact_methods WHERE person_id = ? ORDER BY is_primary DESC, created_at ASC",
        )?;

        let methods = stmt
            .query_map([person_id.to_string()], Self::row_to_contact_method)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(methods)
    }

    pub fn delete_contact_method(&self, id: Uuid) -> Result<bool> {
        let rows = self
            .conn()
            .execute("DELETE FROM contact_methods WHERE id = ?", [id.to_string()])?;
        Ok(rows > 0)
    }

    // ==================== ROW MAPPERS ====================

    fn row_to_person(row: &Row) -> rusqlite::Result<Person> {
        let id: String = row.get("id")?;
        let last_contacted: Option<String> = row.get("last_contacted")?;
        let created_at: String = row.get("created_at")?;
        let updated_at: String = row.get("updated_at")?;

        Ok(Person {
            id: parse_uuid(&id)?,
            name_given: row.get("name_given")?,
            name_family: row.get("name_family")?,
            display_name: row.get("display_name")?,
            search_name: row.get("search_name")?,
            last_contacted: parse_opt_ts(last_contacted)?,
            created_at: parse_ts(&created_at)?,
            updated_at: parse_ts(&updated_at)?,
        })
    }

    fn row_to_contact_method(row: &Row) -> rusqlite::Result<ContactMethod> {
        let id: String = row.get("id")?;
        let person_id: String = row.get("person_id")?;
        let method_type: String = row.get("method_type")?;
        let created_at: String = row.get("created_at")?;

        Ok(ContactMethod {
            id: parse_uuid(&id)?,
            person_id: parse_uuid(&person_id)?,
            method_type: ContactMethodType::parse(&method_type),
            value: row.get("value")?,
            normalized_value: row.get("normalized_value")?,
            is_primary: row.get::<_, i32>("is_primary")? != 0,
            created_at: parse_ts(&created_at)?,
        })
    }
}

impl ContactStore for Database {
    fn get_contact(&self, id: Uuid) -> Result<Option<Person>> {
        self.get_person_by_id(id)
    }

    fn list_contacts(&self, limit: u32) -> Result<Vec<Person>> {
        self.list_persons(limit, 0)
    }

    fn find_similar_contacts(
        &self,
        name: &str,
        threshold: f64,
        limit: usize,
    ) -> Result<Vec<SimilarContact>> {
        if name.trim().is_empty() || limit == 0 {
            return Ok(Vec::new());
        }

        let persons = {
            let conn = self.conn();
            let mut stmt = conn.prepare(
                "SELECT * FROM persons WHERE display_name IS NOT NULL ORDER BY created_at ASC",
            )?;
            let rows = stmt
                .query_map([], Self::row_to_person)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows
        };

        let mut scored: Vec<SimilarContact> = persons
            .into_iter()
            .filter_map(|contact| {
                let similarity = trigram_similarity(name, contact.full_name());
                (similarity > threshold).then_some(SimilarContact {
                    contact,
                    similarity,
                })
            })
            .collect();

        // Stable sort keeps creation order among equal scores.
        scored.sort_by(|a, b| b.similarity.total_cmp(&a.similarity));
        scored.truncate(limit);
        Ok(scored)
    }

    fn update_last_contacted(&self, id: Uuid, at: DateTime<Utc>) -> Result<bool> {
        let at = ts(&at);
        let rows = self.conn().execute(
            r#"UPDATE persons SET last_contacted = ?1, updated_at = ?1
               WHERE id = ?2 AND (last_contacted IS NULL OR last_contacted < ?1)"#,
            params![at, id.to_string()],
        )?;
        Ok(rows > 0)
    }
}

impl ContactMethodStore for Database {
    fn list_methods(&self, person_id: Uuid) -> Result<Vec<ContactMethod>> {
        self.get_methods_for_person(person_id)
    }

    fn find_contacts_by_method(
        &self,
        types: &[ContactMethodType],
        normalized_value: &str,
    ) -> Result<Vec<Uuid>> {
        if types.is_empty() {
            return Ok(Vec::new());
        }

        let placeholders = vec!["?"; types.len()].join(", ");
        let sql = format!(
            r#"SELECT person_id FROM contact_methods
               WHERE normalized_value = ? AND method_type IN ({})
               GROUP BY person_id
               ORDER BY MIN(created_at) ASC"#,
            placeholders
        );

        let mut values: Vec<String> = Vec::with_capacity(types.len() + 1);
        values.push(normalized_value.to_string());
        values.extend(types.iter().map(|t| t.as_str().to_string()));

        let conn = self.conn();
        let mut stmt = conn.prepare(&sql)?;
        let ids = stmt
            .query_map(params_from_iter(values.iter()), |row| {
                let id: String = row.get(0)?;
                parse_uuid(&id)
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(ids)
    }

    fn add_method(&self, method: &ContactMethod) -> Result<()> {
        self.insert_contact_method(method)
    }
}
