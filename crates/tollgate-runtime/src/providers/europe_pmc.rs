//! Europe PMC literature-search provider.
//!
//! Wraps the Europe PMC REST search endpoint. Query syntax is the caller's
//! business; this provider just ships the query, classifies failures, and
//! meters one unit per request (the service is free, but requests still
//! count toward rate observation).

use super::{factory::ProviderFactory, AttemptFailure, Invocation, Provider, ProviderError};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use std::sync::Arc;
use std::time::Duration;

const DEFAULT_BASE_URL: &str = "https://www.ebi.ac.uk/europepmc/webservices/rest";
const MAX_PAGE_SIZE: u64 = 1000;

/// Europe PMC search provider. No credential required.
#[derive(Debug)]
pub struct EuropePmcProvider {
    base_url: String,
    /// Sent with requests so the service can reach out about usage.
    email: Option<String>,
    timeout: Duration,
}

impl Default for EuropePmcProvider {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            email: None,
            timeout: Duration::from_secs(30),
        }
    }
}

impl EuropePmcProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(config: &JsonValue) -> Self {
        Self {
            base_url: config["base_url"]
                .as_str()
                .unwrap_or(DEFAULT_BASE_URL)
                .to_string(),
            email: config["email"].as_str().map(str::to_string),
            timeout: Duration::from_secs(config["timeout_secs"].as_u64().unwrap_or(30)),
        }
    }

    fn client(&self) -> &reqwest::Client {
        static CLIENT: std::sync::OnceLock<reqwest::Client> = std::sync::OnceLock::new();
        CLIENT.get_or_init(|| {
            reqwest::Client::builder()
                .timeout(Duration::from_secs(60))
                .build()
                .expect("Failed to build HTTP client")
        })
    }
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(rename = "hitCount", default)]
    hit_count: u64,
    #[serde(rename = "resultList", default)]
    result_list: ResultList,
}

#[derive(Debug, Deserialize, Default)]
struct ResultList {
    #[serde(default)]
    result: Vec<JsonValue>,
}

#[async_trait]
impl Provider for EuropePmcProvider {
    fn name(&self) -> &str {
        "europe-pmc"
    }

    async fn invoke(
        &self,
        operation: &str,
        params: &JsonValue,
    ) -> Result<Invocation, AttemptFailure> {
        let query = params["query"].as_str().ok_or_else(|| {
            AttemptFailure::unbilled(ProviderError::InvalidRequest(
                "'query' parameter is required".to_string(),
            ))
        })?;

        let page_size = params["max_results"]
            .as_u64()
            .unwrap_or(25)
            .min(MAX_PAGE_SIZE)
            .to_string();

        let mut request = self
            .client()
            .get(format!("{}/search", self.base_url))
            .query(&[
                ("query", query),
                ("format", "json"),
                ("pageSize", page_size.as_str()),
            ])
            .timeout(self.timeout);

        if let Some(email) = &self.email {
            request = request.query(&[("email", email.as_str())]);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                AttemptFailure::unbilled(ProviderError::Timeout(self.timeout))
            } else {
                AttemptFailure::unbilled(ProviderError::Http(e.to_string()))
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            // A 4xx means the query itself was rejected; retrying it is
            // pointless. Still one metered request either way.
            return Err(AttemptFailure::billed(
                ProviderError::Api {
                    status: status.as_u16(),
                    message,
                },
                1,
            ));
        }

        let body: SearchResponse = response
            .json()
            .await
            .map_err(|e| AttemptFailure::unbilled(ProviderError::Parse(e.to_string())))?;

        tracing::debug!(
            operation,
            hit_count = body.hit_count,
            returned = body.result_list.result.len(),
            "Europe PMC search succeeded"
        );

        Ok(Invocation {
            value: json!({
                "hit_count": body.hit_count,
                "results": body.result_list.result,
            }),
            quantity: 1,
        })
    }
}

/// Factory for Europe PMC providers.
///
/// ## Configuration Format
/// ```json
/// {
///   "base_url": "https://...",   // Optional
///   "email": "you@example.org",  // Optional, contact address for the service
///   "timeout_secs": 30           // Optional
/// }
/// ```
pub struct EuropePmcProviderFactory;

impl ProviderFactory for EuropePmcProviderFactory {
    fn provider_type(&self) -> &'static str {
        "europe-pmc"
    }

    fn create(&self, config: &JsonValue) -> Result<Arc<dyn Provider>, ProviderError> {
        Ok(Arc::new(EuropePmcProvider::from_config(config)))
    }

    fn validate_config(&self, config: &JsonValue) -> Result<(), ProviderError> {
        if let Some(url) = config["base_url"].as_str() {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                return Err(ProviderError::NotConfigured(
                    "base_url must start with http:// or https://".to_string(),
                ));
            }
        }
        Ok(())
    }

    fn description(&self) -> &'static str {
        "Europe PMC literature-search provider"
    }
}
