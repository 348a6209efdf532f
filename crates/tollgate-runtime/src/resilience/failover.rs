//! Retry/failover execution.
//!
//! Drives a caller-supplied invoke closure through an ordered provider
//! chain: exponential backoff between retries on one provider, immediate
//! failover when a provider exhausts its attempts, and the circuit breaker
//! consulted before every attempt. The executor never reorders providers;
//! the chain is the caller's quality judgment.

use std::future::Future;
use std::sync::Arc;

use backon::{BackoffBuilder, ExponentialBuilder};

use tollgate_core::{ExhaustionReport, GatewayError, ProviderExhaustion, RetryConfig};

use crate::providers::{AttemptFailure, Invocation};
use crate::resilience::CircuitBreakerRegistry;

/// A successful execution: which provider served it and at what attempt cost.
#[derive(Debug)]
pub struct ExecutionOutcome {
    pub provider: String,
    pub invocation: Invocation,
    /// Invoke calls made across the whole chain, including failures.
    pub attempts: u32,
}

/// The retry/failover engine.
pub struct FailoverExecutor {
    breakers: Arc<CircuitBreakerRegistry>,
    config: RetryConfig,
}

impl FailoverExecutor {
    pub fn new(breakers: Arc<CircuitBreakerRegistry>, config: RetryConfig) -> Self {
        Self { breakers, config }
    }

    /// Run `invoke` against each provider in order until one succeeds.
    ///
    /// Failure handling per attempt:
    /// - breaker rejection: skip to the next provider, no call made
    /// - transient failure: breaker penalty, backoff, retry same provider
    /// - permanent failure: no breaker penalty, straight to the next
    ///   provider (the request is at fault, retrying cannot help)
    pub async fn execute<F, Fut>(
        &self,
        operation: &str,
        providers: &[String],
        mut invoke: F,
    ) -> Result<ExecutionOutcome, GatewayError>
    where
        F: FnMut(String) -> Fut,
        Fut: Future<Output = Result<Invocation, AttemptFailure>>,
    {
        if providers.is_empty() {
            return Err(GatewayError::NoCandidates);
        }

        let mut report = ExhaustionReport::default();
        let mut total_attempts = 0u32;

        'providers: for provider in providers {
            let mut delays = ExponentialBuilder::default()
                .with_min_delay(self.config.base_delay)
                .with_max_delay(self.config.max_delay)
                .with_max_times(self.config.max_retries_per_provider as usize)
                .build();

            let mut attempts_here = 0u32;
            let mut last_error = String::new();

            for attempt in 0..self.config.max_retries_per_provider {
                if !self.breakers.admit(provider) {
                    // Distinct from a real failure: we did not try.
                    tracing::info!(provider = %provider, operation, "Circuit open, skipping provider");
                    report.push(ProviderExhaustion {
                        provider: provider.clone(),
                        attempts: attempts_here,
                        last_error: if attempts_here == 0 {
                            "circuit open, not attempted".to_string()
                        } else {
                            format!("{} (circuit opened)", last_error)
                        },
                    });
                    continue 'providers;
                }

                attempts_here += 1;
                total_attempts += 1;

                match invoke(provider.clone()).await {
                    Ok(invocation) => {
                        self.breakers.record_success(provider);
                        tracing::debug!(
                            provider = %provider,
                            operation,
                            attempts = total_attempts,
                            "Attempt succeeded"
                        );
                        return Ok(ExecutionOutcome {
                            provider: provider.clone(),
                            invocation,
                            attempts: total_attempts,
                        });
                    }
                    Err(failure) => {
                        last_error = failure.error.to_string();

                        if failure.error.is_permanent() {
                            tracing::warn!(
                                provider = %provider,
                                operation,
                                error = %failure.error,
                                "Permanent failure, failing over"
                            );
                            break;
                        }

                        self.breakers.record_failure(provider);
                        tracing::warn!(
                            provider = %provider,
                            operation,
                            attempt = attempt + 1,
                            error = %failure.error,
                            "Attempt failed"
                        );

                        if attempt + 1 < self.config.max_retries_per_provider {
                            let delay = delays.next().unwrap_or(self.config.max_delay);
                            tokio::time::sleep(delay).await;
                        }
                    }
                }
            }

            report.push(ProviderExhaustion {
                provider: provider.clone(),
                attempts: attempts_here,
                last_error: if last_error.is_empty() {
                    "no attempts made".to_string()
                } else {
                    last_error
                },
            });
        }

        tracing::warn!(operation, tried = providers.len(), "All providers exhausted");
        Err(GatewayError::AllProvidersExhausted(report))
    }
}
