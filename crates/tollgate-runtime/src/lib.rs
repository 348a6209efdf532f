//! # tollgate-runtime
//!
//! Async side of Tollgate: provider backends, circuit breaking,
//! retry/failover, and the orchestration gateway.
//!
//! The deterministic pieces — fingerprints, cache policy, the usage ledger,
//! quota math — live in `tollgate-core`; this crate composes them around
//! real remote calls.
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use tollgate_runtime::{Gateway, providers::AnthropicProvider};
//!
//! let gateway = Gateway::builder()
//!     .provider(Arc::new(AnthropicProvider::from_env()?))
//!     .build();
//!
//! let outcome = gateway
//!     .perform("summarize", &params, &["claude".to_string()])
//!     .await?;
//! println!("${:.4}: {}", outcome.derived_cost, outcome.value);
//! ```

pub mod gateway;
pub mod providers;
pub mod resilience;

pub use gateway::{Gateway, GatewayBuilder, PerformOutcome};
pub use providers::{AttemptFailure, Invocation, Provider, ProviderError};
pub use resilience::{CircuitBreakerRegistry, CircuitState, ExecutionOutcome, FailoverExecutor};

// Core types most embedders need alongside the gateway.
pub use tollgate_core::{
    GatewayConfig, GatewayError, QuotaPolicy, QuotaStatus, UsageSummary, Window,
};
