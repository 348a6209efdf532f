//! # tollgate-core
//!
//! Deterministic core of Tollgate: caching, metering, and quota evaluation
//! for metered remote providers.
//!
//! This crate never performs I/O beyond its pluggable storage backends and
//! never makes network calls. The async side — providers, circuit breaking,
//! retry/failover, orchestration — lives in `tollgate-runtime`.
//!
//! ## Key Guarantees
//!
//! 1. **Deterministic fingerprints**: logically identical requests hash to
//!    the same cache key regardless of parameter order
//! 2. **Cache is advisory**: storage failures degrade to misses, never to
//!    caller-visible errors
//! 3. **Append-only ledger**: usage events are never mutated after creation
//! 4. **Advisory quota**: the ledger reports, callers decide

pub mod cache;
pub mod config;
pub mod error;
pub mod fingerprint;
pub mod ledger;

pub use cache::{CacheBackend, CacheEntry, CacheStats, CacheStore, JsonFileBackend, MemoryBackend};
pub use config::{BreakerConfig, CacheConfig, ConfigError, GatewayConfig, RetryConfig};
pub use error::{ExhaustionReport, GatewayError, ProviderExhaustion};
pub use fingerprint::{fingerprint, Fingerprint, FingerprintScope};
pub use ledger::{
    JsonFileStore, NullStore, QuotaPolicy, QuotaStatus, RateTable, UsageBreakdown, UsageEvent,
    UsageLedger, UsageStore, UsageSummary, Window,
};
