//! Anthropic Claude provider.
//!
//! Speaks the messages API. Every text-generation operation maps onto one
//! chat completion; the operation name only matters to metering, which the
//! gateway handles. Billable units are provider-reported tokens, with a
//! character-count estimate when the API reports none.
//!
//! ## Security
//!
//! The API key lives in an [`ApiCredential`]: redacted in Debug/Display,
//! zeroed on drop, exposed only when the request header is built.

use super::{
    factory::ProviderFactory,
    secrets::{ApiCredential, CredentialSource},
    AttemptFailure, Invocation, Provider, ProviderError,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use std::sync::Arc;
use std::time::Duration;

/// Environment variable holding the Anthropic API key.
pub const ANTHROPIC_API_KEY_ENV: &str = "ANTHROPIC_API_KEY";

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com/v1";
const DEFAULT_MODEL: &str = "claude-3-5-sonnet-20241022";

/// Anthropic Claude text-generation provider.
pub struct AnthropicProvider {
    credential: ApiCredential,
    base_url: String,
    default_model: String,
    timeout: Duration,
}

impl std::fmt::Debug for AnthropicProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnthropicProvider")
            .field("credential", &self.credential)
            .field("base_url", &self.base_url)
            .field("default_model", &self.default_model)
            .finish()
    }
}

impl AnthropicProvider {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            credential: ApiCredential::new(
                api_key,
                CredentialSource::Programmatic,
                "Anthropic API key",
            ),
            base_url: DEFAULT_BASE_URL.to_string(),
            default_model: DEFAULT_MODEL.to_string(),
            timeout: Duration::from_secs(30),
        }
    }

    /// Read the key from `ANTHROPIC_API_KEY`.
    pub fn from_env() -> Result<Self, ProviderError> {
        let credential = ApiCredential::from_env(ANTHROPIC_API_KEY_ENV, "Anthropic API key")?;
        Ok(Self {
            credential,
            base_url: DEFAULT_BASE_URL.to_string(),
            default_model: DEFAULT_MODEL.to_string(),
            timeout: Duration::from_secs(30),
        })
    }

    /// Build from JSON configuration with environment fallback for the key.
    pub fn from_config(config: &JsonValue) -> Result<Self, ProviderError> {
        let credential = ApiCredential::from_config_or_env(
            config,
            "api_key",
            ANTHROPIC_API_KEY_ENV,
            "Anthropic API key",
        )?;

        Ok(Self {
            credential,
            base_url: config["base_url"]
                .as_str()
                .unwrap_or(DEFAULT_BASE_URL)
                .to_string(),
            default_model: config["model"].as_str().unwrap_or(DEFAULT_MODEL).to_string(),
            timeout: Duration::from_secs(config["timeout_secs"].as_u64().unwrap_or(30)),
        })
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
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

#[derive(Debug, Serialize)]
struct MessagesRequest {
    model: String,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    messages: Vec<ChatTurn>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

#[derive(Debug, Serialize)]
struct ChatTurn {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    content: Vec<ContentBlock>,
    model: String,
    stop_reason: Option<String>,
    usage: Usage,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    text: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct Usage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    error: ApiErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ApiErrorDetail {
    message: String,
}

#[async_trait]
impl Provider for AnthropicProvider {
    fn name(&self) -> &str {
        "claude"
    }

    async fn invoke(
        &self,
        operation: &str,
        params: &JsonValue,
    ) -> Result<Invocation, AttemptFailure> {
        let prompt = params["prompt"].as_str().ok_or_else(|| {
            AttemptFailure::unbilled(ProviderError::InvalidRequest(
                "'prompt' parameter is required".to_string(),
            ))
        })?;

        let request = MessagesRequest {
            model: params["model"]
                .as_str()
                .unwrap_or(&self.default_model)
                .to_string(),
            max_tokens: params["max_tokens"].as_u64().unwrap_or(1024) as u32,
            system: params["system"].as_str().map(str::to_string),
            messages: vec![ChatTurn {
                role: "user".to_string(),
                content: prompt.to_string(),
            }],
            temperature: params["temperature"].as_f64().map(|t| t as f32),
        };

        // Exposed only here, at the point of use.
        let response = self
            .client()
            .post(format!("{}/messages", self.base_url))
            .header("x-api-key", self.credential.expose())
            .header("anthropic-version", "2023-06-01")
            .header("content-type", "application/json")
            .timeout(self.timeout)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    AttemptFailure::unbilled(ProviderError::Timeout(self.timeout))
                } else {
                    AttemptFailure::unbilled(ProviderError::Http(e.to_string()))
                }
            })?;

        let status = response.status();

        if status == 401 || status == 403 {
            return Err(AttemptFailure::unbilled(ProviderError::Auth));
        }

        if status == 429 {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .map(Duration::from_secs);
            return Err(AttemptFailure::unbilled(ProviderError::RateLimited {
                retry_after,
            }));
        }

        if !status.is_success() {
            let message = response
                .json::<ApiErrorBody>()
                .await
                .map(|b| b.error.message)
                .unwrap_or_else(|e| format!("unreadable error body: {}", e));

            // The request reached the provider; bill the prompt estimate.
            return Err(AttemptFailure::billed(
                ProviderError::Api {
                    status: status.as_u16(),
                    message,
                },
                self.estimate_quantity(prompt),
            ));
        }

        let body: MessagesResponse = response
            .json()
            .await
            .map_err(|e| AttemptFailure::unbilled(ProviderError::Parse(e.to_string())))?;

        let content = body
            .content
            .into_iter()
            .filter_map(|block| block.text)
            .collect::<Vec<_>>()
            .join("");

        let reported = body.usage.input_tokens + body.usage.output_tokens;
        let quantity = if reported > 0 {
            reported
        } else {
            self.estimate_quantity(prompt) + self.estimate_quantity(&content)
        };

        tracing::debug!(
            operation,
            model = %body.model,
            quantity,
            "Claude completion succeeded"
        );

        Ok(Invocation {
            value: json!({
                "content": content,
                "model": body.model,
                "stop_reason": body.stop_reason,
            }),
            quantity,
        })
    }

    async fn health_check(&self) -> bool {
        !self.credential.is_empty()
    }
}

/// Factory for Claude providers.
///
/// ## Configuration Format
/// ```json
/// {
///   "api_key": "sk-ant-...",        // Optional, falls back to ANTHROPIC_API_KEY env
///   "base_url": "https://...",      // Optional, custom API endpoint
///   "model": "claude-3-5-sonnet-20241022",  // Optional, default model
///   "timeout_secs": 30              // Optional
/// }
/// ```
pub struct AnthropicProviderFactory;

impl ProviderFactory for AnthropicProviderFactory {
    fn provider_type(&self) -> &'static str {
        "claude"
    }

    fn create(&self, config: &JsonValue) -> Result<Arc<dyn Provider>, ProviderError> {
        Ok(Arc::new(AnthropicProvider::from_config(config)?))
    }

    fn validate_config(&self, config: &JsonValue) -> Result<(), ProviderError> {
        if !ApiCredential::is_available(config, "api_key", ANTHROPIC_API_KEY_ENV) {
            return Err(ProviderError::NotConfigured(format!(
                "Anthropic API key required: set 'api_key' in config or {} env",
                ANTHROPIC_API_KEY_ENV
            )));
        }

        if let Some(url) = config["base_url"].as_str() {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                return Err(ProviderError::NotConfigured(
                    "base_url must start with http:// or https://".to_string(),
                ));
            }
        }

        Ok(())
    }

    fn default_config(&self) -> JsonValue {
        json!({ "model": DEFAULT_MODEL })
    }

    fn description(&self) -> &'static str {
        "Anthropic Claude text-generation provider"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_creation() {
        let provider = AnthropicProvider::new("test-key");
        assert_eq!(provider.name(), "claude");
    }

    #[test]
    fn test_token_estimation() {
        let provider = AnthropicProvider::new("test-key");
        let estimate = provider.estimate_quantity("Hello, world!"); // 13 chars
        assert!((2..=5).contains(&estimate));
    }

    #[tokio::test]
    async fn test_missing_prompt_is_permanent() {
        let provider = AnthropicProvider::new("test-key");
        let failure = provider
            .invoke("generate", &json!({"model": "claude-3-5-sonnet-20241022"}))
            .await
            .unwrap_err();

        assert!(failure.error.is_permanent());
        assert_eq!(failure.billed_quantity, 0);
    }

    #[test]
    fn test_factory_validate_invalid_base_url() {
        let factory = AnthropicProviderFactory;
        let config = json!({
            "api_key": "test-key",
            "base_url": "invalid-url"
        });
        assert!(factory.validate_config(&config).is_err());
    }

    #[test]
    fn test_factory_create_with_api_key() {
        let factory = AnthropicProviderFactory;
        let provider = factory.create(&json!({"api_key": "test-api-key"})).unwrap();
        assert_eq!(provider.name(), "claude");
    }

    #[test]
    fn test_api_key_not_in_debug_output() {
        let secret_key = "sk-ant-REDACTED";
        let provider = AnthropicProvider::new(secret_key);

        let debug_output = format!("{:?}", provider);
        assert!(
            !debug_output.contains(secret_key),
            "API key was exposed in Debug output!"
        );
        assert!(debug_output.contains("[REDACTED]"));
    }

    #[tokio::test]
    async fn test_health_check_requires_key() {
        assert!(AnthropicProvider::new("k").health_check().await);
        assert!(!AnthropicProvider::new("").health_check().await);
    }
}
