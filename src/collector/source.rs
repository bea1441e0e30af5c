//! Source client contract and bundled adapters
//!
//! A source client does one thing: fetch a raw payload for a key. Retry,
//! circuit breaking, and timeouts are the collector's job.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use url::Url;

use crate::error::{CallResult, SourceError};

/// Contract implemented by every data provider adapter
#[async_trait]
pub trait SourceClient: Send + Sync {
    fn name(&self) -> &str;

    /// Base timeout for a single fetch; the collection strategy scales this
    fn base_timeout(&self) -> Duration {
        Duration::from_secs(10)
    }

    async fn fetch(&self, key: &str) -> CallResult<Value>;

    /// Static data served only when the live path has failed outright
    fn fallback_data(&self, _key: &str) -> Option<Value> {
        None
    }
}

/// Generic JSON-over-HTTP source
///
/// The endpoint is a template with a `{key}` placeholder; the key is
/// URL-encoded before substitution. An optional API key is sent as a
/// bearer token.
pub struct HttpJsonSource {
    name: String,
    endpoint: String,
    api_key: Option<String>,
    client: reqwest::Client,
    base_timeout: Duration,
    fallback: Option<Value>,
}

impl HttpJsonSource {
    pub fn new(name: &str, endpoint: &str, api_key: Option<String>) -> CallResult<Self> {
        // Validate the template up front so a bad endpoint fails at wiring
        // time rather than on the first fetch
        Url::parse(&endpoint.replace("{key}", "probe"))
            .map_err(|e| SourceError::Config(format!("invalid endpoint for '{}': {}", name, e)))?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .user_agent("vantage/0.3.0")
            .build()
            .expect("Failed to build HTTP client");

        Ok(Self {
            name: name.to_string(),
            endpoint: endpoint.to_string(),
            api_key,
            client,
            base_timeout: Duration::from_secs(10),
            fallback: None,
        })
    }

    pub fn with_base_timeout(mut self, timeout: Duration) -> Self {
        self.base_timeout = timeout;
        self
    }

    /// Attach static data for the degraded path
    pub fn with_fallback(mut self, fallback: Value) -> Self {
        self.fallback = Some(fallback);
        self
    }

    fn url_for(&self, key: &str) -> String {
        self.endpoint
            .replace("{key}", &urlencoding::encode(key))
    }
}

#[async_trait]
impl SourceClient for HttpJsonSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn base_timeout(&self) -> Duration {
        self.base_timeout
    }

    async fn fetch(&self, key: &str) -> CallResult<Value> {
        let url = self.url_for(key);
        tracing::debug!("Fetching '{}' from {}", key, self.name);

        let mut request = self.client.get(&url);
        if let Some(api_key) = &self.api_key {
            request = request.bearer_auth(api_key);
        }

        let response = request.send().await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(SourceError::api_error(
                status.as_u16(),
                format!("{} error: {}", self.name, body),
            ));
        }

        let payload: Value = response.json().await?;
        Ok(payload)
    }

    fn fallback_data(&self, _key: &str) -> Option<Value> {
        self.fallback.clone()
    }
}

/// Fixed-payload source, useful for seed data and wiring tests
pub struct StaticSource {
    name: String,
    data: Value,
}

impl StaticSource {
    pub fn new(name: &str, data: Value) -> Self {
        Self {
            name: name.to_string(),
            data,
        }
    }
}

#[async_trait]
impl SourceClient for StaticSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch(&self, _key: &str) -> CallResult<Value> {
        Ok(self.data.clone())
    }
}
