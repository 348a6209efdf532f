//! Per-provider circuit breakers.
//!
//! When a provider fails repeatedly its circuit opens and attempts against
//! it are rejected without a call, until a cooldown admits a single probe.
//! One registry serves all in-flight requests; transitions happen inside a
//! short write-lock so the hot path stays cheap.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::time::Instant;

use tollgate_core::BreakerConfig;

/// State of one provider's circuit.
#[derive(Debug, Clone)]
pub enum CircuitState {
    /// Normal operation, counting consecutive failures.
    Closed { failures: u32 },

    /// Rejecting attempts until the cooldown elapses.
    Open { opened_at: Instant },

    /// Cooldown elapsed; one probe is in flight (`probing`) or about to be.
    HalfOpen { probing: bool },
}

/// Registry of circuit breakers keyed by provider identity.
///
/// Callers ask [`admit`](Self::admit) before every attempt and report the
/// outcome with [`record_success`](Self::record_success) /
/// [`record_failure`](Self::record_failure). State is shared across
/// requests; cancelling one request never touches it.
pub struct CircuitBreakerRegistry {
    states: RwLock<HashMap<String, CircuitState>>,
    config: BreakerConfig,
}

impl CircuitBreakerRegistry {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            states: RwLock::new(HashMap::new()),
            config,
        }
    }

    /// Ask whether an attempt against this provider is allowed right now.
    ///
    /// Open circuits reject until `recovery_timeout` has elapsed, then admit
    /// exactly one probe; while that probe is unresolved every other caller
    /// is rejected.
    pub fn admit(&self, provider: &str) -> bool {
        let mut states = self.states.write();
        match states.get(provider) {
            None | Some(CircuitState::Closed { .. }) => true,
            Some(CircuitState::Open { opened_at }) => {
                if opened_at.elapsed() >= self.config.recovery_timeout {
                    states.insert(
                        provider.to_string(),
                        CircuitState::HalfOpen { probing: true },
                    );
                    tracing::info!(provider, "Circuit half-open, admitting probe");
                    true
                } else {
                    false
                }
            }
            Some(CircuitState::HalfOpen { probing }) => {
                if *probing {
                    false
                } else {
                    states.insert(
                        provider.to_string(),
                        CircuitState::HalfOpen { probing: true },
                    );
                    true
                }
            }
        }
    }

    /// Report a successful attempt. Resets the failure count; a successful
    /// probe closes the circuit.
    pub fn record_success(&self, provider: &str) {
        let mut states = self.states.write();
        match states.get(provider) {
            Some(CircuitState::HalfOpen { .. }) => {
                states.insert(provider.to_string(), CircuitState::Closed { failures: 0 });
                tracing::info!(provider, "Circuit closed after successful probe");
            }
            Some(CircuitState::Open { .. }) => {
                // A success can only arrive here from an attempt admitted
                // before the circuit opened; the cooldown still stands.
                tracing::debug!(provider, "Success reported while circuit open, ignoring");
            }
            _ => {
                states.insert(provider.to_string(), CircuitState::Closed { failures: 0 });
            }
        }
    }

    /// Report a failed attempt. Crossing the threshold opens the circuit;
    /// a failed probe reopens it and restarts the cooldown.
    pub fn record_failure(&self, provider: &str) {
        let mut states = self.states.write();
        match states.get(provider) {
            Some(CircuitState::HalfOpen { .. }) => {
                states.insert(
                    provider.to_string(),
                    CircuitState::Open {
                        opened_at: Instant::now(),
                    },
                );
                tracing::warn!(provider, "Circuit reopened after failed probe");
            }
            Some(CircuitState::Open { .. }) => {}
            Some(CircuitState::Closed { failures }) => {
                let failures = failures + 1;
                if failures >= self.config.failure_threshold {
                    states.insert(
                        provider.to_string(),
                        CircuitState::Open {
                            opened_at: Instant::now(),
                        },
                    );
                    tracing::warn!(provider, failures, "Circuit opened after repeated failures");
                } else {
                    states.insert(provider.to_string(), CircuitState::Closed { failures });
                }
            }
            None => {
                states.insert(provider.to_string(), CircuitState::Closed { failures: 1 });
            }
        }
    }

    /// Current state, for observability.
    pub fn state(&self, provider: &str) -> CircuitState {
        self.states
            .read()
            .get(provider)
            .cloned()
            .unwrap_or(CircuitState::Closed { failures: 0 })
    }

    /// Reset every circuit to closed.
    pub fn reset(&self) {
        self.states.write().clear();
    }
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self::new(BreakerConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn registry(threshold: u32, recovery: Duration) -> CircuitBreakerRegistry {
        CircuitBreakerRegistry::new(BreakerConfig {
            failure_threshold: threshold,
            recovery_timeout: recovery,
        })
    }

    #[test]
    fn test_circuit_starts_closed() {
        let registry = CircuitBreakerRegistry::default();
        assert!(registry.admit("claude"));
    }

    #[test]
    fn test_five_failures_open_the_circuit() {
        let registry = registry(5, Duration::from_secs(60));

        for _ in 0..4 {
            registry.record_failure("claude");
            assert!(registry.admit("claude"));
        }
        registry.record_failure("claude");

        // The sixth attempt request is rejected without a call.
        assert!(!registry.admit("claude"));
        assert!(matches!(
            registry.state("claude"),
            CircuitState::Open { .. }
        ));
    }

    #[test]
    fn test_success_resets_failure_count() {
        let registry = registry(3, Duration::from_secs(60));

        registry.record_failure("claude");
        registry.record_failure("claude");
        registry.record_success("claude");

        registry.record_failure("claude");
        registry.record_failure("claude");
        assert!(registry.admit("claude"));
    }

    #[test]
    fn test_recovery_admits_exactly_one_probe() {
        let registry = registry(1, Duration::from_millis(10));

        registry.record_failure("claude");
        assert!(!registry.admit("claude"));

        std::thread::sleep(Duration::from_millis(20));

        // First caller gets the probe; concurrent callers are rejected
        // until it resolves.
        assert!(registry.admit("claude"));
        assert!(!registry.admit("claude"));
        assert!(!registry.admit("claude"));

        registry.record_success("claude");
        assert!(registry.admit("claude"));
        assert!(matches!(
            registry.state("claude"),
            CircuitState::Closed { failures: 0 }
        ));
    }

    #[test]
    fn test_failed_probe_reopens_circuit() {
        let registry = registry(1, Duration::from_millis(10));

        registry.record_failure("claude");
        std::thread::sleep(Duration::from_millis(20));
        assert!(registry.admit("claude"));

        registry.record_failure("claude");
        assert!(!registry.admit("claude"));
        assert!(matches!(
            registry.state("claude"),
            CircuitState::Open { .. }
        ));
    }

    #[test]
    fn test_providers_are_independent() {
        let registry = registry(2, Duration::from_secs(60));

        registry.record_failure("claude");
        registry.record_failure("claude");

        assert!(!registry.admit("claude"));
        assert!(registry.admit("kimi"));
    }
}
