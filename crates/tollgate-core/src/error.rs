//! Caller-facing failure shapes.
//!
//! Only two failures escape a `perform` call once providers exist:
//! quota-exceeded (before any remote call) and all-providers-exhausted
//! (after every candidate ran out of attempts). Everything else is absorbed
//! or wrapped below these.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ledger::QuotaStatus;

/// Per-provider slice of an exhaustion report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderExhaustion {
    pub provider: String,
    /// Attempts actually made; 0 means the breaker rejected the provider
    /// without a call.
    pub attempts: u32,
    pub last_error: String,
}

/// Everything tried, nothing worked. One entry per candidate provider.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExhaustionReport(pub Vec<ProviderExhaustion>);

impl ExhaustionReport {
    pub fn push(&mut self, exhaustion: ProviderExhaustion) {
        self.0.push(exhaustion);
    }

    pub fn providers(&self) -> &[ProviderExhaustion] {
        &self.0
    }
}

impl fmt::Display for ExhaustionReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for entry in &self.0 {
            if !first {
                write!(f, "; ")?;
            }
            first = false;
            write!(
                f,
                "{} ({} attempt{}): {}",
                entry.provider,
                entry.attempts,
                if entry.attempts == 1 { "" } else { "s" },
                entry.last_error
            )?;
        }
        Ok(())
    }
}

/// Failure shapes surfaced by the orchestration facade.
#[derive(Error, Debug)]
pub enum GatewayError {
    /// Spending limit reached; no remote call was made. Recoverable by
    /// waiting for the next window or raising limits.
    #[error(
        "quota exceeded: daily ${:.2}/${:.2}, monthly ${:.2}/${:.2}",
        .0.daily_used, .0.daily_limit, .0.monthly_used, .0.monthly_limit
    )]
    QuotaExceeded(QuotaStatus),

    /// Every candidate provider ran out of attempts.
    #[error("all providers exhausted: {0}")]
    AllProvidersExhausted(ExhaustionReport),

    /// A candidate name that no registered provider answers to.
    #[error("unknown provider: {0}")]
    UnknownProvider(String),

    /// `perform` was called with an empty candidate list.
    #[error("no candidate providers given")]
    NoCandidates,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exhaustion_report_display() {
        let mut report = ExhaustionReport::default();
        report.push(ProviderExhaustion {
            provider: "claude".into(),
            attempts: 2,
            last_error: "timeout after 30s".into(),
        });
        report.push(ProviderExhaustion {
            provider: "kimi".into(),
            attempts: 0,
            last_error: "circuit open, not attempted".into(),
        });

        let rendered = GatewayError::AllProvidersExhausted(report).to_string();
        assert!(rendered.contains("claude (2 attempts): timeout after 30s"));
        assert!(rendered.contains("kimi (0 attempts): circuit open"));
    }

    #[test]
    fn test_quota_error_display_includes_amounts() {
        let status = QuotaStatus {
            daily_used: 10.01,
            daily_limit: 10.0,
            daily_remaining: 0.0,
            daily_within_limit: false,
            monthly_used: 42.5,
            monthly_limit: 100.0,
            monthly_remaining: 57.5,
            monthly_within_limit: true,
        };

        let rendered = GatewayError::QuotaExceeded(status).to_string();
        assert!(rendered.contains("$10.01/$10.00"));
        assert!(rendered.contains("$42.50/$100.00"));
    }
}
