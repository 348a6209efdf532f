//! OpenAI-compatible chat-completions provider.
//!
//! Covers backends that expose the `/chat/completions` wire format behind
//! different base URLs: Kimi (Moonshot) and Qwen (DashScope compatible
//! mode) ship as presets, and any other compatible endpoint works via
//! configuration.

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

const KIMI_BASE_URL: &str = "https://api.moonshot.cn/v1";
const KIMI_MODEL: &str = "moonshot-v1-8k";
const KIMI_KEY_ENV: &str = "KIMI_API_KEY";

const QWEN_BASE_URL: &str = "https://dashscope.aliyuncs.com/compatible-mode/v1";
const QWEN_MODEL: &str = "qwen-turbo";
const QWEN_KEY_ENV: &str = "QWEN_API_KEY";

/// A chat-completions backend identified by name, base URL, and model.
pub struct OpenAiCompatProvider {
    name: String,
    credential: ApiCredential,
    base_url: String,
    default_model: String,
    timeout: Duration,
}

impl std::fmt::Debug for OpenAiCompatProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiCompatProvider")
            .field("name", &self.name)
            .field("credential", &self.credential)
            .field("base_url", &self.base_url)
            .field("default_model", &self.default_model)
            .finish()
    }
}

impl OpenAiCompatProvider {
    pub fn new(
        name: impl Into<String>,
        api_key: impl Into<String>,
        base_url: impl Into<String>,
        default_model: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            credential: ApiCredential::new(
                api_key,
                CredentialSource::Programmatic,
                "Chat-completions API key",
            ),
            base_url: base_url.into(),
            default_model: default_model.into(),
            timeout: Duration::from_secs(30),
        }
    }

    /// Kimi (Moonshot) preset, key from `KIMI_API_KEY`.
    pub fn kimi_from_env() -> Result<Self, ProviderError> {
        let credential = ApiCredential::from_env(KIMI_KEY_ENV, "Kimi API key")?;
        Ok(Self {
            name: "kimi".to_string(),
            credential,
            base_url: KIMI_BASE_URL.to_string(),
            default_model: KIMI_MODEL.to_string(),
            timeout: Duration::from_secs(30),
        })
    }

    /// Qwen (DashScope) preset, key from `QWEN_API_KEY`.
    pub fn qwen_from_env() -> Result<Self, ProviderError> {
        let credential = ApiCredential::from_env(QWEN_KEY_ENV, "Qwen API key")?;
        Ok(Self {
            name: "qwen".to_string(),
            credential,
            base_url: QWEN_BASE_URL.to_string(),
            default_model: QWEN_MODEL.to_string(),
            timeout: Duration::from_secs(30),
        })
    }

    fn from_config(
        config: &JsonValue,
        name: &'static str,
        base_url: &'static str,
        model: &'static str,
        env_var: &'static str,
        key_name: &'static str,
    ) -> Result<Self, ProviderError> {
        let credential = ApiCredential::from_config_or_env(config, "api_key", env_var, key_name)?;

        Ok(Self {
            name: config["name"].as_str().unwrap_or(name).to_string(),
            credential,
            base_url: config["base_url"].as_str().unwrap_or(base_url).to_string(),
            default_model: config["model"].as_str().unwrap_or(model).to_string(),
            timeout: Duration::from_secs(config["timeout_secs"].as_u64().unwrap_or(30)),
        })
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
struct CompletionsRequest {
    model: String,
    messages: Vec<ChatTurn>,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

#[derive(Debug, Serialize)]
struct ChatTurn {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct CompletionsResponse {
    choices: Vec<Choice>,
    model: Option<String>,
    #[serde(default)]
    usage: Usage,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct Usage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

#[async_trait]
impl Provider for OpenAiCompatProvider {
    fn name(&self) -> &str {
        &self.name
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

        let mut messages = Vec::new();
        if let Some(system) = params["system"].as_str() {
            messages.push(ChatTurn {
                role: "system".to_string(),
                content: system.to_string(),
            });
        }
        messages.push(ChatTurn {
            role: "user".to_string(),
            content: prompt.to_string(),
        });

        let request = CompletionsRequest {
            model: params["model"]
                .as_str()
                .unwrap_or(&self.default_model)
                .to_string(),
            messages,
            max_tokens: params["max_tokens"].as_u64().unwrap_or(1024) as u32,
            temperature: params["temperature"].as_f64().map(|t| t as f32),
        };

        let response = self
            .client()
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(self.credential.expose())
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
            return Err(AttemptFailure::unbilled(ProviderError::RateLimited {
                retry_after: None,
            }));
        }

        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(AttemptFailure::billed(
                ProviderError::Api {
                    status: status.as_u16(),
                    message,
                },
                self.estimate_quantity(prompt),
            ));
        }

        let body: CompletionsResponse = response
            .json()
            .await
            .map_err(|e| AttemptFailure::unbilled(ProviderError::Parse(e.to_string())))?;

        let choice = body.choices.into_iter().next().ok_or_else(|| {
            AttemptFailure::unbilled(ProviderError::Parse("response had no choices".to_string()))
        })?;
        let content = choice.message.content.unwrap_or_default();

        let reported = body.usage.prompt_tokens + body.usage.completion_tokens;
        let quantity = if reported > 0 {
            reported
        } else {
            self.estimate_quantity(prompt) + self.estimate_quantity(&content)
        };

        tracing::debug!(
            provider = %self.name,
            operation,
            quantity,
            "Chat completion succeeded"
        );

        Ok(Invocation {
            value: json!({
                "content": content,
                "model": body.model,
                "stop_reason": choice.finish_reason,
            }),
            quantity,
        })
    }

    async fn health_check(&self) -> bool {
        !self.credential.is_empty()
    }
}

/// Factory preset for one OpenAI-compatible backend.
///
/// ## Configuration Format
/// ```json
/// {
///   "api_key": "...",       // Optional, falls back to the preset's env var
///   "base_url": "https://...",  // Optional, preset default
///   "model": "...",         // Optional, preset default
///   "timeout_secs": 30      // Optional
/// }
/// ```
pub struct OpenAiCompatFactory {
    type_name: &'static str,
    base_url: &'static str,
    model: &'static str,
    env_var: &'static str,
    key_name: &'static str,
    about: &'static str,
}

impl OpenAiCompatFactory {
    pub const KIMI: OpenAiCompatFactory = OpenAiCompatFactory {
        type_name: "kimi",
        base_url: KIMI_BASE_URL,
        model: KIMI_MODEL,
        env_var: KIMI_KEY_ENV,
        key_name: "Kimi API key",
        about: "Kimi (Moonshot AI) chat-completions provider",
    };

    pub const QWEN: OpenAiCompatFactory = OpenAiCompatFactory {
        type_name: "qwen",
        base_url: QWEN_BASE_URL,
        model: QWEN_MODEL,
        env_var: QWEN_KEY_ENV,
        key_name: "Qwen API key",
        about: "Qwen (Alibaba Cloud) chat-completions provider",
    };
}

impl ProviderFactory for OpenAiCompatFactory {
    fn provider_type(&self) -> &'static str {
        self.type_name
    }

    fn create(&self, config: &JsonValue) -> Result<Arc<dyn Provider>, ProviderError> {
        Ok(Arc::new(OpenAiCompatProvider::from_config(
            config,
            self.type_name,
            self.base_url,
            self.model,
            self.env_var,
            self.key_name,
        )?))
    }

    fn validate_config(&self, config: &JsonValue) -> Result<(), ProviderError> {
        if !ApiCredential::is_available(config, "api_key", self.env_var) {
            return Err(ProviderError::NotConfigured(format!(
                "{} required: set 'api_key' in config or {} env",
                self.key_name, self.env_var
            )));
        }
        Ok(())
    }

    fn default_config(&self) -> JsonValue {
        json!({ "base_url": self.base_url, "model": self.model })
    }

    fn description(&self) -> &'static str {
        self.about
    }
}
