//! Provider abstractions for tollgate-runtime.
//!
//! A provider is anything that can perform a named operation for a payload
//! and report how many billable units the attempt consumed: an AI
//! text-generation backend, a literature-search service, or a test double.
//! The gateway depends only on the [`Provider`] trait; transport details
//! stay inside each implementation.
//!
//! ## Security
//!
//! All providers use the [`secrets`] module for credential handling.
//! See [`ApiCredential`] for the patterns.

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use std::time::Duration;
use thiserror::Error;

mod factory;
pub mod secrets;

#[cfg(feature = "anthropic")]
mod anthropic;

#[cfg(feature = "openai-compat")]
mod openai_compat;

#[cfg(feature = "europe-pmc")]
mod europe_pmc;

pub use factory::{ProviderFactory, ProviderRegistry};
pub use secrets::{ApiCredential, CredentialSource};

#[cfg(feature = "anthropic")]
pub use anthropic::{AnthropicProvider, AnthropicProviderFactory, ANTHROPIC_API_KEY_ENV};

#[cfg(feature = "openai-compat")]
pub use openai_compat::{OpenAiCompatFactory, OpenAiCompatProvider};

#[cfg(feature = "europe-pmc")]
pub use europe_pmc::{EuropePmcProvider, EuropePmcProviderFactory};

/// Errors a provider can produce for one attempt.
#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("HTTP request failed: {0}")]
    Http(String),

    #[error("rate limited, retry after {retry_after:?}")]
    RateLimited { retry_after: Option<Duration> },

    #[error("API error: {status} - {message}")]
    Api { status: u16, message: String },

    #[error("response parse error: {0}")]
    Parse(String),

    #[error("authentication failed")]
    Auth,

    #[error("timeout after {0:?}")]
    Timeout(Duration),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("provider not configured: {0}")]
    NotConfigured(String),
}

impl ProviderError {
    /// Permanent failures short-circuit retries against this provider: the
    /// request is at fault, not the endpoint, so a retry cannot succeed.
    pub fn is_permanent(&self) -> bool {
        match self {
            ProviderError::Auth
            | ProviderError::InvalidRequest(_)
            | ProviderError::NotConfigured(_) => true,
            ProviderError::Api { status, .. } => {
                (400..500).contains(status) && *status != 408 && *status != 429
            }
            _ => false,
        }
    }
}

/// One failed attempt, with whatever units it still consumed. A rejected
/// request that the provider processed far enough to bill is metered even
/// though no value came back.
#[derive(Debug)]
pub struct AttemptFailure {
    pub error: ProviderError,
    pub billed_quantity: u64,
}

impl AttemptFailure {
    pub fn unbilled(error: ProviderError) -> Self {
        Self {
            error,
            billed_quantity: 0,
        }
    }

    pub fn billed(error: ProviderError, billed_quantity: u64) -> Self {
        Self {
            error,
            billed_quantity,
        }
    }
}

impl From<ProviderError> for AttemptFailure {
    fn from(error: ProviderError) -> Self {
        Self::unbilled(error)
    }
}

/// Successful attempt: the opaque result plus the units it consumed.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub value: JsonValue,
    pub quantity: u64,
}

/// The single capability boundary between the gateway and any backend.
///
/// Implementations classify their own failures (transient vs permanent vs
/// rate-limited) through [`ProviderError`]; the retry engine acts on that
/// classification without knowing the transport.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Provider identity used for circuit breaking, metering, and cache
    /// scoping.
    fn name(&self) -> &str;

    /// Perform a named operation. `params` is an opaque JSON payload whose
    /// shape is an agreement between caller and provider.
    async fn invoke(
        &self,
        operation: &str,
        params: &JsonValue,
    ) -> Result<Invocation, AttemptFailure>;

    /// Cheap liveness probe; defaults to configured-means-healthy.
    async fn health_check(&self) -> bool {
        true
    }

    /// Fallback unit estimate when a backend reports no usage.
    fn estimate_quantity(&self, text: &str) -> u64 {
        // ~4 chars per token
        (text.len() / 4) as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_permanent_classification() {
        assert!(ProviderError::Auth.is_permanent());
        assert!(ProviderError::InvalidRequest("missing prompt".into()).is_permanent());
        assert!(ProviderError::Api {
            status: 400,
            message: "bad request".into()
        }
        .is_permanent());

        assert!(!ProviderError::Http("connection reset".into()).is_permanent());
        assert!(!ProviderError::Timeout(Duration::from_secs(30)).is_permanent());
        assert!(!ProviderError::RateLimited { retry_after: None }.is_permanent());
        assert!(!ProviderError::Api {
            status: 503,
            message: "overloaded".into()
        }
        .is_permanent());
        // 429 arrives as Api status from some backends; still transient.
        assert!(!ProviderError::Api {
            status: 429,
            message: "slow down".into()
        }
        .is_permanent());
    }

    #[test]
    fn test_attempt_failure_billing() {
        let failure = AttemptFailure::billed(
            ProviderError::Api {
                status: 500,
                message: "boom".into(),
            },
            250,
        );
        assert_eq!(failure.billed_quantity, 250);

        let failure: AttemptFailure = ProviderError::Auth.into();
        assert_eq!(failure.billed_quantity, 0);
    }
}
