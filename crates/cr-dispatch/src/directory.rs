//! Contact Directory Side-Channel
//!
//! After a record is claimed for dispatch, the contact can be upserted into
//! an external address book so the conversation shows a name instead of a
//! bare number. This is strictly best-effort: directory failures are logged
//! and flagged on the record, and the send proceeds regardless.

use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use cr_common::ContactRecord;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// What the upsert found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirectoryOutcome {
    /// Contact did not exist and was created.
    Created,
    /// Contact already present, left untouched.
    Existing,
}

/// External address book client.
#[async_trait]
pub trait DirectoryService: Send + Sync {
    /// Ensure a contact exists for the record's normalized phone.
    async fn ensure_contact(
        &self,
        record: &ContactRecord,
        phone: &str,
    ) -> Result<DirectoryOutcome>;
}

/// HTTP directory configuration
#[derive(Debug, Clone)]
pub struct HttpDirectoryConfig {
    pub base_url: String,
    pub api_token: String,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
}

impl Default for HttpDirectoryConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            api_token: String::new(),
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    results: Vec<serde_json::Value>,
}

#[derive(Debug, Serialize)]
struct CreateContactRequest<'a> {
    #[serde(rename = "givenName")]
    given_name: &'a str,
    #[serde(rename = "familyName")]
    family_name: &'a str,
    phone: &'a str,
}

/// Directory client over a contacts REST API.
pub struct HttpDirectory {
    config: HttpDirectoryConfig,
    client: reqwest::Client,
}

impl HttpDirectory {
    pub fn new(config: HttpDirectoryConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.request_timeout)
            .build()?;

        Ok(Self { config, client })
    }

    async fn search(&self, phone: &str) -> Result<bool> {
        let response = self
            .client
            .get(format!("{}/contacts/search", self.config.base_url))
            .header("Authorization", format!("Bearer {}", self.config.api_token))
            .query(&[("phone", phone)])
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(anyhow!("directory search failed: HTTP {}", response.status()));
        }
        let parsed: SearchResponse = response.json().await?;
        Ok(!parsed.results.is_empty())
    }

    async fn create(&self, record: &ContactRecord, phone: &str) -> Result<()> {
        let payload = CreateContactRequest {
            given_name: &record.name,
            family_name: &record.surname,
            phone,
        };

        let response = self
            .client
            .post(format!("{}/contacts", self.config.base_url))
            .header("Authorization", format!("Bearer {}", self.config.api_token))
            .json(&payload)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(anyhow!("contact create failed: HTTP {}", response.status()));
        }
        Ok(())
    }
}

#[async_trait]
impl DirectoryService for HttpDirectory {
    async fn ensure_contact(
        &self,
        record: &ContactRecord,
        phone: &str,
    ) -> Result<DirectoryOutcome> {
        if self.search(phone).await? {
            debug!(phone, "Contact already in directory");
            return Ok(DirectoryOutcome::Existing);
        }
        self.create(record, phone).await?;
        debug!(phone, "Created directory contact");
        Ok(DirectoryOutcome::Created)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn sample_record() -> ContactRecord {
        ContactRecord {
            row: 0,
            name: "Ana".to_string(),
            surname: "Rossi".to_string(),
            phone: "3401234567".to_string(),
            call_date: String::new(),
            outcome: String::new(),
            pos: String::new(),
            operator: String::new(),
            template_id: String::new(),
            status: None,
            dispatched_at: None,
            directory_flag: None,
        }
    }

    async fn directory_for(server: &MockServer) -> HttpDirectory {
        HttpDirectory::new(HttpDirectoryConfig {
            base_url: server.uri(),
            api_token: "tok".to_string(),
            ..Default::default()
        })
        .unwrap()
    }

    #[tokio::test]
    async fn existing_contact_is_not_recreated() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/contacts/search"))
            .and(query_param("phone", "+393401234567"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "results": [{"id": "c-1"}]
            })))
            .mount(&server)
            .await;

        let directory = directory_for(&server).await;
        let outcome = directory
            .ensure_contact(&sample_record(), "+393401234567")
            .await
            .unwrap();
        assert_eq!(outcome, DirectoryOutcome::Existing);
    }

    #[tokio::test]
    async fn missing_contact_is_created() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/contacts/search"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "results": []
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/contacts"))
            .respond_with(ResponseTemplate::new(201))
            .expect(1)
            .mount(&server)
            .await;

        let directory = directory_for(&server).await;
        let outcome = directory
            .ensure_contact(&sample_record(), "+393401234567")
            .await
            .unwrap();
        assert_eq!(outcome, DirectoryOutcome::Created);
    }

    #[tokio::test]
    async fn search_failure_propagates() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let directory = directory_for(&server).await;
        assert!(directory
            .ensure_contact(&sample_record(), "+393401234567")
            .await
            .is_err());
    }
}
