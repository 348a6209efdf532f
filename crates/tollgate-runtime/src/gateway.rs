//! Orchestration facade.
//!
//! One entry point composes the whole stack for a logical request:
//! cache lookup, quota gate, retry/failover execution, metering, cache
//! write-back. Control flow is strictly top-down; no component calls back
//! upward.
//!
//! Two concurrent misses on the same fingerprint may both invoke a provider
//! and both write the cache. That redundancy is accepted: provider calls
//! are idempotent, and serializing unrelated requests behind a per-key lock
//! would cost more than the duplicate call.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value as JsonValue;

use tollgate_core::{
    fingerprint, CacheStats, CacheStore, GatewayConfig, GatewayError, JsonFileStore, QuotaPolicy,
    QuotaStatus, UsageLedger, UsageSummary, Window,
};

use crate::providers::{AttemptFailure, Provider, ProviderError};
use crate::resilience::{CircuitBreakerRegistry, CircuitState, FailoverExecutor};

/// Result of a `perform` call.
#[derive(Debug)]
pub struct PerformOutcome {
    pub value: JsonValue,
    /// Cost of the successful attempt. Zero on cache hits.
    pub derived_cost: f64,
    /// Provider that served the request; `None` on cache hits.
    pub provider: Option<String>,
    pub cached: bool,
}

/// The gateway owns the composed services and exposes the operation-shaped
/// boundary every collaborator calls.
///
/// Construct one at startup and share it by handle; the cache, ledger, and
/// breaker registry are process-wide state with their own interior locking.
pub struct Gateway {
    providers: HashMap<String, Arc<dyn Provider>>,
    cache: Arc<CacheStore>,
    ledger: Arc<UsageLedger>,
    breakers: Arc<CircuitBreakerRegistry>,
    executor: FailoverExecutor,
    config: GatewayConfig,
}

impl Gateway {
    pub fn builder() -> GatewayBuilder {
        GatewayBuilder::new()
    }

    /// Perform a named operation against an ordered provider chain.
    ///
    /// Flow: cache lookup (hit returns immediately, nothing metered) →
    /// quota gate (fail fast before any remote call) → retry/failover
    /// execution → meter the success, write the cache, return.
    ///
    /// Billing is per attempt: failed attempts that still consumed
    /// provider resources were already metered by the time this returns.
    pub async fn perform(
        &self,
        operation: &str,
        params: &JsonValue,
        providers: &[String],
    ) -> Result<PerformOutcome, GatewayError> {
        for name in providers {
            if !self.providers.contains_key(name) {
                return Err(GatewayError::UnknownProvider(name.clone()));
            }
        }

        let key = fingerprint(operation, params, providers, self.config.cache.scope);

        if self.config.cache.enabled {
            if let Some(value) = self.cache.get(&key) {
                tracing::debug!(operation, fingerprint = %key, "Cache hit");
                return Ok(PerformOutcome {
                    value,
                    derived_cost: 0.0,
                    provider: None,
                    cached: true,
                });
            }
        }

        if let Some(policy) = &self.config.quota {
            let status = self.ledger.check_quota(policy);
            if !status.daily_within_limit || !status.monthly_within_limit {
                tracing::warn!(
                    operation,
                    daily_used = status.daily_used,
                    monthly_used = status.monthly_used,
                    "Quota exceeded, refusing before any provider call"
                );
                return Err(GatewayError::QuotaExceeded(status));
            }
        }

        let chain: HashMap<String, Arc<dyn Provider>> = providers
            .iter()
            .map(|name| (name.clone(), Arc::clone(&self.providers[name])))
            .collect();
        let ledger = Arc::clone(&self.ledger);
        let attempt_timeout = self.config.retry.attempt_timeout;
        let op = operation.to_string();
        let payload = params.clone();

        let outcome = self
            .executor
            .execute(operation, providers, move |provider_name| {
                let provider = Arc::clone(&chain[&provider_name]);
                let ledger = Arc::clone(&ledger);
                let op = op.clone();
                let payload = payload.clone();

                async move {
                    let started = Instant::now();
                    let result = match tokio::time::timeout(
                        attempt_timeout,
                        provider.invoke(&op, &payload),
                    )
                    .await
                    {
                        Ok(result) => result,
                        Err(_) => Err(AttemptFailure::unbilled(ProviderError::Timeout(
                            attempt_timeout,
                        ))),
                    };

                    let latency = started.elapsed();
                    match result {
                        Ok(invocation) => {
                            tracing::debug!(
                                provider = %provider_name,
                                operation = %op,
                                latency_ms = latency.as_millis() as u64,
                                "Attempt completed"
                            );
                            Ok(invocation)
                        }
                        Err(failure) => {
                            // Billable failures are metered per attempt, even
                            // though the logical operation may yet succeed.
                            if failure.billed_quantity > 0 {
                                ledger.record(&provider_name, &op, failure.billed_quantity);
                            }
                            tracing::debug!(
                                provider = %provider_name,
                                operation = %op,
                                latency_ms = latency.as_millis() as u64,
                                "Attempt failed"
                            );
                            Err(failure)
                        }
                    }
                }
            })
            .await?;

        let derived_cost =
            self.ledger
                .record(&outcome.provider, operation, outcome.invocation.quantity);

        if self.config.cache.enabled {
            let ttl = self.config.cache.ttl_for(operation);
            self.cache
                .put(key, outcome.invocation.value.clone(), Some(ttl));
        }

        tracing::info!(
            operation,
            provider = %outcome.provider,
            attempts = outcome.attempts,
            cost = derived_cost,
            "Operation completed"
        );

        Ok(PerformOutcome {
            value: outcome.invocation.value,
            derived_cost,
            provider: Some(outcome.provider),
            cached: false,
        })
    }

    /// Aggregated usage for dashboards and metrics collaborators.
    pub fn usage_summary(&self, window: Window) -> UsageSummary {
        self.ledger.summarize(window)
    }

    /// Quota status against an explicit policy. Pure read.
    pub fn check_quota(&self, policy: &QuotaPolicy) -> QuotaStatus {
        self.ledger.check_quota(policy)
    }

    /// Quota status against the configured policy, if one is set.
    pub fn configured_quota(&self) -> Option<QuotaStatus> {
        self.config
            .quota
            .as_ref()
            .map(|policy| self.ledger.check_quota(policy))
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    /// Circuit state for one provider, so observability surfaces can tell
    /// "we didn't try" apart from "we tried and failed".
    pub fn circuit_state(&self, provider: &str) -> CircuitState {
        self.breakers.state(provider)
    }

    /// Maintenance hook: drop expired cache entries.
    pub fn cleanup_expired(&self) -> usize {
        self.cache.invalidate_expired()
    }

    /// Maintenance hook: drop usage events older than the given age.
    pub fn prune_usage(&self, older_than: Duration) -> usize {
        self.ledger.prune(older_than)
    }

    /// Registered provider names, sorted.
    pub fn provider_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.providers.keys().cloned().collect();
        names.sort();
        names
    }

    /// Liveness of every registered provider, probed concurrently.
    pub async fn health_snapshot(&self) -> HashMap<String, bool> {
        let probes = self.providers.iter().map(|(name, provider)| {
            let name = name.clone();
            let provider = Arc::clone(provider);
            async move { (name, provider.health_check().await) }
        });
        futures::future::join_all(probes).await.into_iter().collect()
    }
}

/// Builder wiring explicit service handles into a gateway.
///
/// Services not supplied are constructed from the configuration, so embedders
/// can share a ledger across gateways or swap cache backends without any
/// global state.
pub struct GatewayBuilder {
    config: GatewayConfig,
    providers: Vec<Arc<dyn Provider>>,
    cache: Option<Arc<CacheStore>>,
    ledger: Option<Arc<UsageLedger>>,
    breakers: Option<Arc<CircuitBreakerRegistry>>,
}

impl GatewayBuilder {
    pub fn new() -> Self {
        Self {
            config: GatewayConfig::default(),
            providers: Vec::new(),
            cache: None,
            ledger: None,
            breakers: None,
        }
    }

    pub fn config(mut self, config: GatewayConfig) -> Self {
        self.config = config;
        self
    }

    /// Register a provider under its own name.
    pub fn provider(mut self, provider: Arc<dyn Provider>) -> Self {
        self.providers.push(provider);
        self
    }

    pub fn cache(mut self, cache: Arc<CacheStore>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn ledger(mut self, ledger: Arc<UsageLedger>) -> Self {
        self.ledger = Some(ledger);
        self
    }

    pub fn breakers(mut self, breakers: Arc<CircuitBreakerRegistry>) -> Self {
        self.breakers = Some(breakers);
        self
    }

    pub fn build(self) -> Gateway {
        let cache = self
            .cache
            .unwrap_or_else(|| Arc::new(CacheStore::from_config(&self.config.cache)));

        let ledger = self.ledger.unwrap_or_else(|| {
            Arc::new(match &self.config.usage_storage_path {
                Some(path) => UsageLedger::with_store(
                    self.config.rates.clone(),
                    Box::new(JsonFileStore::new(path)),
                ),
                None => UsageLedger::new(self.config.rates.clone()),
            })
        });

        let breakers = self
            .breakers
            .unwrap_or_else(|| Arc::new(CircuitBreakerRegistry::new(self.config.breaker.clone())));

        let executor = FailoverExecutor::new(Arc::clone(&breakers), self.config.retry.clone());

        let providers = self
            .providers
            .into_iter()
            .map(|p| (p.name().to_string(), p))
            .collect();

        Gateway {
            providers,
            cache,
            ledger,
            breakers,
            executor,
            config: self.config,
        }
    }
}

impl Default for GatewayBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::Invocation;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tollgate_core::{CacheConfig, RateTable, RetryConfig};

    /// Provider that fails the first `fail_first` calls, then succeeds.
    struct ScriptedProvider {
        name: String,
        fail_first: u32,
        billed_failure_quantity: u64,
        calls: AtomicU32,
    }

    impl ScriptedProvider {
        fn reliable(name: &str) -> Self {
            Self {
                name: name.to_string(),
                fail_first: 0,
                billed_failure_quantity: 0,
                calls: AtomicU32::new(0),
            }
        }

        fn flaky(name: &str, fail_first: u32, billed: u64) -> Self {
            Self {
                name: name.to_string(),
                fail_first,
                billed_failure_quantity: billed,
                calls: AtomicU32::new(0),
            }
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Provider for ScriptedProvider {
        fn name(&self) -> &str {
            &self.name
        }

        async fn invoke(
            &self,
            _operation: &str,
            params: &JsonValue,
        ) -> Result<Invocation, AttemptFailure> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.fail_first {
                return Err(AttemptFailure::billed(
                    ProviderError::Api {
                        status: 500,
                        message: "scripted failure".into(),
                    },
                    self.billed_failure_quantity,
                ));
            }
            Ok(Invocation {
                value: json!({"echo": params.clone()}),
                quantity: 100,
            })
        }
    }

    struct SlowProvider;

    #[async_trait]
    impl Provider for SlowProvider {
        fn name(&self) -> &str {
            "slow"
        }

        async fn invoke(
            &self,
            _operation: &str,
            _params: &JsonValue,
        ) -> Result<Invocation, AttemptFailure> {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok(Invocation {
                value: json!("too late"),
                quantity: 1,
            })
        }
    }

    fn test_config() -> GatewayConfig {
        GatewayConfig {
            retry: RetryConfig {
                max_retries_per_provider: 2,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(4),
                attempt_timeout: Duration::from_secs(1),
            },
            quota: None,
            ..GatewayConfig::default()
        }
    }

    fn rate_for(provider: &str, rate: f64) -> RateTable {
        let mut table = RateTable::empty();
        table.set_default_rate(provider, rate);
        table
    }

    #[tokio::test]
    async fn test_second_call_is_served_from_cache() {
        let provider = Arc::new(ScriptedProvider::reliable("mock"));
        let ledger = Arc::new(UsageLedger::new(rate_for("mock", 0.01)));

        let gateway = Gateway::builder()
            .config(test_config())
            .provider(provider.clone())
            .ledger(ledger.clone())
            .build();

        let params = json!({"prompt": "hello"});
        let chain = vec!["mock".to_string()];

        let first = gateway.perform("generate", &params, &chain).await.unwrap();
        assert!(!first.cached);
        assert_eq!(first.provider.as_deref(), Some("mock"));
        assert!((first.derived_cost - 1.0).abs() < 1e-12);

        let second = gateway.perform("generate", &params, &chain).await.unwrap();
        assert!(second.cached);
        assert_eq!(second.derived_cost, 0.0);
        assert_eq!(second.provider, None);
        assert_eq!(second.value, first.value);

        // One invoke, one ledger event: the hit cost nothing.
        assert_eq!(provider.calls(), 1);
        assert_eq!(ledger.event_count(), 1);
    }

    #[tokio::test]
    async fn test_quota_refuses_before_any_call() {
        let provider = Arc::new(ScriptedProvider::reliable("mock"));
        let ledger = Arc::new(UsageLedger::new(rate_for("mock", 1.0)));
        ledger.record("mock", "generate", 11); // $11 already spent today

        let config = GatewayConfig {
            quota: Some(QuotaPolicy {
                daily_limit: 10.0,
                monthly_limit: 100.0,
            }),
            ..test_config()
        };

        let gateway = Gateway::builder()
            .config(config)
            .provider(provider.clone())
            .ledger(ledger)
            .build();

        let error = gateway
            .perform("generate", &json!({"prompt": "hi"}), &["mock".to_string()])
            .await
            .unwrap_err();

        assert!(matches!(error, GatewayError::QuotaExceeded(_)));
        assert_eq!(provider.calls(), 0);
    }

    #[tokio::test]
    async fn test_billable_failed_attempts_are_metered() {
        let flaky = Arc::new(ScriptedProvider::flaky("flaky", 2, 50));
        let backup = Arc::new(ScriptedProvider::reliable("backup"));
        let ledger = Arc::new(UsageLedger::new(RateTable::empty()));

        let gateway = Gateway::builder()
            .config(test_config())
            .provider(flaky.clone())
            .provider(backup.clone())
            .ledger(ledger.clone())
            .build();

        let outcome = gateway
            .perform(
                "generate",
                &json!({"prompt": "hi"}),
                &["flaky".to_string(), "backup".to_string()],
            )
            .await
            .unwrap();

        assert_eq!(outcome.provider.as_deref(), Some("backup"));
        assert_eq!(flaky.calls(), 2);
        assert_eq!(backup.calls(), 1);

        // Two billed failures plus the success: three events.
        assert_eq!(ledger.event_count(), 3);
        let summary = ledger.summarize(Window::Day);
        assert_eq!(summary.by_provider["flaky"].quantity, 100);
        assert_eq!(summary.by_provider["backup"].quantity, 100);
    }

    #[tokio::test]
    async fn test_unknown_provider_is_rejected() {
        let gateway = Gateway::builder().config(test_config()).build();

        let error = gateway
            .perform("generate", &json!({}), &["ghost".to_string()])
            .await
            .unwrap_err();

        assert!(matches!(error, GatewayError::UnknownProvider(name) if name == "ghost"));
    }

    #[tokio::test]
    async fn test_timeout_counts_as_provider_failure() {
        let config = GatewayConfig {
            retry: RetryConfig {
                max_retries_per_provider: 1,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(4),
                attempt_timeout: Duration::from_millis(10),
            },
            quota: None,
            ..GatewayConfig::default()
        };

        let gateway = Gateway::builder()
            .config(config)
            .provider(Arc::new(SlowProvider))
            .build();

        let error = gateway
            .perform("generate", &json!({"prompt": "hi"}), &["slow".to_string()])
            .await
            .unwrap_err();

        match error {
            GatewayError::AllProvidersExhausted(report) => {
                assert_eq!(report.providers().len(), 1);
                assert!(report.providers()[0].last_error.contains("timeout"));
            }
            other => panic!("Expected exhaustion, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_cache_disabled_always_invokes() {
        let provider = Arc::new(ScriptedProvider::reliable("mock"));
        let config = GatewayConfig {
            cache: CacheConfig {
                enabled: false,
                ..CacheConfig::default()
            },
            ..test_config()
        };

        let gateway = Gateway::builder()
            .config(config)
            .provider(provider.clone())
            .build();

        let params = json!({"prompt": "hello"});
        let chain = vec!["mock".to_string()];
        gateway.perform("generate", &params, &chain).await.unwrap();
        gateway.perform("generate", &params, &chain).await.unwrap();

        assert_eq!(provider.calls(), 2);
    }

    #[tokio::test]
    async fn test_maintenance_hooks() {
        let gateway = Gateway::builder().config(test_config()).build();

        assert_eq!(gateway.cleanup_expired(), 0);
        assert_eq!(gateway.prune_usage(Duration::from_secs(3600)), 0);
        assert_eq!(gateway.cache_stats().entry_count, 0);
        assert!(gateway.provider_names().is_empty());
    }

    #[tokio::test]
    async fn test_health_snapshot_covers_all_providers() {
        let gateway = Gateway::builder()
            .config(test_config())
            .provider(Arc::new(ScriptedProvider::reliable("a")))
            .provider(Arc::new(ScriptedProvider::reliable("b")))
            .build();

        let health = gateway.health_snapshot().await;
        assert_eq!(health.len(), 2);
        assert!(health["a"]);
        assert!(health["b"]);
    }
}
