//! Google People API v1: the account's contact connections.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::NaiveDate;
use serde::Deserialize;

use super::{read_json, GoogleApiError, TokenSource};
use crate::error::Result;

const DEFAULT_BASE_URL: &str = "https://people.googleapis.com/v1";
const PERSON_FIELDS: &str = "names,emailAddresses,phoneNumbers,addresses,organizations,birthdays,photos";
const PAGE_SIZE: &str = "1000";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionsPage {
    #[serde(default)]
    pub connections: Vec<GooglePerson>,
    pub next_page_token: Option<String>,
    pub next_sync_token: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GooglePerson {
    #[serde(default)]
    pub resource_name: String,
    pub etag: Option<String>,
    #[serde(default)]
    pub names: Vec<PersonName>,
    #[serde(default)]
    pub email_addresses: Vec<FieldValue>,
    #[serde(default)]
    pub phone_numbers: Vec<FieldValue>,
    #[serde(default)]
    pub addresses: Vec<PostalAddress>,
    #[serde(default)]
    pub organizations: Vec<Organization>,
    #[serde(default)]
    pub birthdays: Vec<Birthday>,
    #[serde(default)]
    pub photos: Vec<Photo>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersonName {
    pub display_name: Option<String>,
    pub given_name: Option<String>,
    pub family_name: Option<String>,
}

/// An email address or phone number entry.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldValue {
    #[serde(default)]
    pub value: String,
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub metadata: Option<FieldMetadata>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct FieldMetadata {
    #[serde(default)]
    pub primary: bool,
}

impl FieldValue {
    pub fn is_primary(&self) -> bool {
        self.metadata.as_ref().map_or(false, |m| m.primary)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PostalAddress {
    #[serde(default)]
    pub formatted_value: String,
    #[serde(rename = "type")]
    pub kind: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Organization {
    pub name: Option<String>,
    pub title: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Birthday {
    pub date: Option<DateParts>,
}

/// Year is 0 or missing when the contact only stores month and day.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DateParts {
    #[serde(default)]
    pub year: i32,
    #[serde(default)]
    pub month: u32,
    #[serde(default)]
    pub day: u32,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Photo {
    #[serde(default)]
    pub url: String,
}

impl GooglePerson {
    pub fn has_useful_data(&self) -> bool {
        !self.names.is_empty() || !self.email_addresses.is_empty() || !self.phone_numbers.is_empty()
    }

    /// Full birthdays only.
    pub fn birthday(&self) -> Option<NaiveDate> {
        let date = self.birthdays.first()?.date.as_ref()?;
        if date.year <= 0 {
            return None;
        }
        NaiveDate::from_ymd_opt(date.year, date.month, date.day)
    }
}

#[async_trait]
pub trait PeopleApi: Send + Sync {
    /// One page of connections; pass a sync token for changes only.
    async fn list_connections(
        &self,
        account: &str,
        sync_token: Option<&str>,
        page_token: Option<&str>,
    ) -> Result<ConnectionsPage>;
}

pub struct GooglePeopleClient {
    http: reqwest::Client,
    tokens: Arc<dyn TokenSource>,
    base_url: String,
}

impl GooglePeopleClient {
    pub fn new(tokens: Arc<dyn TokenSource>) -> Self {
        Self::with_base_url(tokens, DEFAULT_BASE_URL)
    }

    pub fn with_base_url(tokens: Arc<dyn TokenSource>, base_url: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            tokens,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl PeopleApi for GooglePeopleClient {
    async fn list_connections(
        &self,
        account: &str,
        sync_token: Option<&str>,
        page_token: Option<&str>,
    ) -> Result<ConnectionsPage> {
        let access_token = self.tokens.access_token(account)?;

        let mut request = self
            .http
            .get(format!("{}/people/me/connections", self.base_url))
            .bearer_auth(access_token)
            .query(&[
                ("personFields", PERSON_FIELDS),
                ("pageSize", PAGE_SIZE),
                ("requestSyncToken", "true"),
            ]);

        if let Some(token) = sync_token {
            request = request.query(&[("syncToken", token)]);
        }
        if let Some(token) = page_token {
            request = request.query(&[("pageToken", token)]);
        }

        let resp = request.send().await.map_err(GoogleApiError::Transport)?;
        Ok(read_json(resp).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_connections_page() {
        let json = r#"{
            "connections": [{
                "resourceName": "people/c1",
                "etag": "%EgU",
                "names": [{"displayName": "Dana Scully", "givenName": "Dana", "familyName": "Scully"}],
                "emailAddresses": [{"value": "dana@fbi.gov", "type": "work", "metadata": {"primary": true}}],
                "phoneNumbers": [{"value": "(555) 123-4567"}],
                "organizations": [{"name": "FBI", "title": "Agent"}],
                "birthdays": [{"date": {"year": 1964, "month": 2, "day": 23}}, {"text": "Feb 23"}]
            }, {
                "resourceName": "people/c2",
                "birthdays": [{"date": {"month": 7, "day": 4}}]
            }],
            "nextPageToken": "p2"
        }"#;

        let page: ConnectionsPage = serde_json::from_str(json).unwrap();
        assert_eq!(page.next_page_token.as_deref(), Some("p2"));

        let dana = &page.connections[0];
        assert!(dana.has_useful_data());
        assert_eq!(dana.email_addresses[0].kind.as_deref(), Some("work"));
        assert!(dana.email_addresses[0].is_primary());
        assert!(!dana.phone_numbers[0].is_primary());
        assert_eq!(dana.birthday(), NaiveDate::from_ymd_opt(1964, 2, 23));

        let partial = &page.connections[1];
        assert!(!partial.has_useful_data());
        assert!(partial.birthday().is_none());
    }
}
