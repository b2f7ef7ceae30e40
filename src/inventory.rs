//! metal-api project inventory
//!
//! The only call consumed is the project listing. Requests are HMAC signed
//! when a key is configured.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use aws_lc_rs::hmac;
use chrono::{SecondsFormat, Utc};
use serde::Deserialize;
use tracing::{debug, instrument};

use crate::cache::FetchAll;
use crate::config::AccountingSettings;
use crate::Error;

/// Path of the project listing relative to the metal-api base URL
pub const PROJECT_LIST_PATH: &str = "v1/project";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Identity of a project as known to the inventory
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InventoryRecord {
    /// Project id
    pub project_id: String,
    /// Tenant owning the project
    pub tenant_id: String,
    /// Display name
    pub name: String,
}

#[derive(Debug, Deserialize)]
struct ProjectResponse {
    meta: ProjectMeta,
    #[serde(default)]
    name: String,
    #[serde(default)]
    tenant_id: String,
}

#[derive(Debug, Deserialize)]
struct ProjectMeta {
    id: String,
}

impl From<ProjectResponse> for InventoryRecord {
    fn from(p: ProjectResponse) -> Self {
        Self {
            project_id: p.meta.id,
            tenant_id: p.tenant_id,
            name: p.name,
        }
    }
}

/// HMAC signer for metal-api requests
pub struct HmacAuth {
    auth_type: String,
    key: hmac::Key,
}

impl HmacAuth {
    /// Create a signer for the given auth type and shared key
    pub fn new(auth_type: impl Into<String>, key: &[u8]) -> Self {
        Self {
            auth_type: auth_type.into(),
            key: hmac::Key::new(hmac::HMAC_SHA256, key),
        }
    }

    /// `Authorization` header value for a request carrying `body` at `date`
    pub fn authorization(&self, date: &str, body: &[u8]) -> String {
        let mut ctx = hmac::Context::with_key(&self.key);
        ctx.update(body);
        ctx.update(date.as_bytes());
        let tag = ctx.sign();
        format!("{} {}", self.auth_type, hex(tag.as_ref()))
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Lists projects from the metal-api
pub struct MetalProjectSource {
    client: reqwest::Client,
    url: reqwest::Url,
    auth: Option<HmacAuth>,
}

impl MetalProjectSource {
    /// Build a source from the controller's accounting settings
    pub fn new(settings: &AccountingSettings) -> Result<Self, Error> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| Error::config(format!("failed to create HTTP client: {e}")))?;
        Self::with_client(client, settings)
    }

    /// Build a source with a custom HTTP client
    pub fn with_client(
        client: reqwest::Client,
        settings: &AccountingSettings,
    ) -> Result<Self, Error> {
        let mut base = settings.metal_url.clone();
        if !base.ends_with('/') {
            base.push('/');
        }
        let url = reqwest::Url::parse(&base)
            .and_then(|u| u.join(PROJECT_LIST_PATH))
            .map_err(|e| Error::config(format!("invalid metalURL {:?}: {e}", settings.metal_url)))?;

        let auth = (!settings.metal_hmac.is_empty())
            .then(|| HmacAuth::new(settings.auth_type(), settings.metal_hmac.as_bytes()));

        Ok(Self { client, url, auth })
    }

    /// Fully resolved listing URL
    pub fn url(&self) -> &reqwest::Url {
        &self.url
    }

    /// List all projects
    #[instrument(skip(self), fields(url = %self.url))]
    pub async fn list_projects(&self) -> Result<Vec<InventoryRecord>, Error> {
        let mut request = self.client.get(self.url.clone());
        if let Some(auth) = &self.auth {
            let date = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
            request = request
                .header("Authorization", auth.authorization(&date, &[]))
                .header("X-Date", date);
        }

        let response = request
            .send()
            .await
            .map_err(|e| Error::fetch(format!("request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::fetch(format!("metal-api returned {status}: {body}")));
        }

        let projects: Vec<ProjectResponse> = response
            .json()
            .await
            .map_err(|e| Error::fetch(format!("invalid project listing: {e}")))?;

        debug!(count = projects.len(), "listed projects");
        Ok(projects.into_iter().map(InventoryRecord::from).collect())
    }
}

#[async_trait]
impl FetchAll<String, InventoryRecord> for MetalProjectSource {
    async fn fetch_all(&self) -> Result<HashMap<String, InventoryRecord>, Error> {
        Ok(self
            .list_projects()
            .await?
            .into_iter()
            .map(|record| (record.project_id.clone(), record))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{header_exists, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn settings(url: &str, hmac: &str) -> AccountingSettings {
        AccountingSettings {
            metal_url: url.to_string(),
            metal_hmac: hmac.to_string(),
            ..Default::default()
        }
    }

    fn listing() -> serde_json::Value {
        json!([
            {"meta": {"id": "p1", "kind": "Project"}, "name": "proj-one", "tenant_id": "t1"},
            {"meta": {"id": "p2"}, "name": "proj-two", "tenant_id": "t2", "description": "x"}
        ])
    }

    #[test]
    fn signature_is_hex_sha256_with_auth_type_prefix() {
        let auth = HmacAuth::new("Metal-Admin", b"secret");
        let value = auth.authorization("2024-01-01T00:00:00Z", &[]);
        let (prefix, digest) = value.split_once(' ').unwrap();
        assert_eq!(prefix, "Metal-Admin");
        assert_eq!(digest.len(), 64);
        assert!(digest.chars().all(|c| c.is_ascii_hexdigit()));

        // Deterministic for the same date, different for another
        assert_eq!(value, auth.authorization("2024-01-01T00:00:00Z", &[]));
        assert_ne!(value, auth.authorization("2024-01-01T00:00:01Z", &[]));
    }

    #[test]
    fn signature_depends_on_key() {
        let a = HmacAuth::new("Metal-Admin", b"one");
        let b = HmacAuth::new("Metal-Admin", b"two");
        let date = "2024-01-01T00:00:00Z";
        assert_ne!(a.authorization(date, &[]), b.authorization(date, &[]));
    }

    #[test]
    fn listing_url_keeps_base_path() {
        let source =
            MetalProjectSource::new(&settings("https://metal.example.com/metal", "")).unwrap();
        assert_eq!(source.url().as_str(), "https://metal.example.com/metal/v1/project");
    }

    #[tokio::test]
    async fn fetch_all_keys_records_by_project_id() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/project"))
            .and(header_exists("Authorization"))
            .and(header_exists("X-Date"))
            .respond_with(ResponseTemplate::new(200).set_body_json(listing()))
            .expect(1)
            .mount(&server)
            .await;

        let source = MetalProjectSource::new(&settings(&server.uri(), "secret")).unwrap();
        let projects = source.fetch_all().await.unwrap();

        assert_eq!(projects.len(), 2);
        assert_eq!(
            projects["p1"],
            InventoryRecord {
                project_id: "p1".to_string(),
                tenant_id: "t1".to_string(),
                name: "proj-one".to_string(),
            }
        );
        assert_eq!(projects["p2"].tenant_id, "t2");
    }

    #[tokio::test]
    async fn unsigned_when_no_key_configured() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/project"))
            .and(header_exists("Authorization"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v1/project"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
            .mount(&server)
            .await;

        let source = MetalProjectSource::new(&settings(&server.uri(), "")).unwrap();
        assert!(source.fetch_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn configured_auth_type_is_used() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/project"))
            .and(header_exists("Authorization"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
            .expect(1)
            .mount(&server)
            .await;

        let mut settings = settings(&server.uri(), "secret");
        settings.metal_auth_type = "Metal-View".to_string();
        let source = MetalProjectSource::new(&settings).unwrap();
        source.fetch_all().await.unwrap();

        let requests = server.received_requests().await.unwrap();
        let auth = requests[0].headers.get("Authorization").unwrap().to_str().unwrap();
        assert!(auth.starts_with("Metal-View "));
    }

    #[tokio::test]
    async fn server_error_is_a_fetch_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/project"))
            .respond_with(ResponseTemplate::new(503).set_body_string("maintenance"))
            .mount(&server)
            .await;

        let source = MetalProjectSource::new(&settings(&server.uri(), "")).unwrap();
        match source.fetch_all().await {
            Err(Error::Fetch(msg)) => {
                assert!(msg.contains("503"));
                assert!(msg.contains("maintenance"));
            }
            other => panic!("expected fetch error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn malformed_listing_is_a_fetch_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/project"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"not": "a list"})))
            .mount(&server)
            .await;

        let source = MetalProjectSource::new(&settings(&server.uri(), "")).unwrap();
        assert!(matches!(source.fetch_all().await, Err(Error::Fetch(_))));
    }
}
