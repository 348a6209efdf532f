//! Usage ledger: append-only metering with cost derivation and quota checks.
//!
//! Every completed remote attempt lands here as a [`UsageEvent`], whether it
//! succeeded or failed while still consuming billable units. Events are never
//! mutated; summaries and quota checks aggregate on demand.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use lazy_static::lazy_static;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Internal persistence error. Absorbed at the ledger boundary: the
/// in-memory ledger stays authoritative when the mirror store misbehaves.
#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("store I/O: {0}")]
    Io(#[from] std::io::Error),

    #[error("store encoding: {0}")]
    Encoding(String),
}

/// One metered remote attempt. Append-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageEvent {
    pub timestamp: DateTime<Utc>,
    pub provider: String,
    pub operation: String,
    pub quantity: u64,
    pub cost: f64,
}

/// Per-provider or per-operation slice of a summary.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UsageBreakdown {
    pub cost: f64,
    pub quantity: u64,
    pub requests: u64,
}

/// Aggregated usage over a window.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UsageSummary {
    pub total_cost: f64,
    pub total_quantity: u64,
    pub total_requests: u64,
    pub by_provider: HashMap<String, UsageBreakdown>,
    pub by_operation: HashMap<String, UsageBreakdown>,
}

/// Aggregation window for [`UsageLedger::summarize`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Window {
    /// Trailing 24 hours.
    Day,
    /// Trailing 30 days.
    Month,
    Range {
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },
}

impl Window {
    fn contains(&self, timestamp: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        match self {
            Window::Day => timestamp >= now - ChronoDuration::hours(24),
            Window::Month => timestamp >= now - ChronoDuration::days(30),
            Window::Range { start, end } => timestamp >= *start && timestamp < *end,
        }
    }
}

/// Spending ceilings in USD. Configuration, not state.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QuotaPolicy {
    pub daily_limit: f64,
    pub monthly_limit: f64,
}

impl Default for QuotaPolicy {
    fn default() -> Self {
        Self {
            daily_limit: 10.0,
            monthly_limit: 100.0,
        }
    }
}

/// Result of a quota check. Advisory: callers decide whether to block.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuotaStatus {
    pub daily_used: f64,
    pub daily_limit: f64,
    pub daily_remaining: f64,
    pub daily_within_limit: bool,
    pub monthly_used: f64,
    pub monthly_limit: f64,
    pub monthly_remaining: f64,
    pub monthly_within_limit: bool,
}

/// Per-provider unit rates in USD. An operation without its own rate falls
/// back to the provider default; an unknown provider costs nothing.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderRates {
    pub default_rate: f64,
    pub per_operation: HashMap<String, f64>,
}

/// Rate table keyed by provider name. Rates are USD per metered unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RateTable {
    rates: HashMap<String, ProviderRates>,
}

lazy_static! {
    /// Built-in rates, expressed per unit (token or request).
    /// Derived from published per-million-token pricing.
    static ref BUILTIN_RATES: RateTable = {
        let mut rates = HashMap::new();
        rates.insert(
            "claude".to_string(),
            ProviderRates { default_rate: 3.00 / 1_000_000.0, per_operation: HashMap::new() },
        );
        rates.insert(
            "kimi".to_string(),
            ProviderRates { default_rate: 0.20 / 1_000_000.0, per_operation: HashMap::new() },
        );
        rates.insert(
            "qwen".to_string(),
            ProviderRates { default_rate: 0.60 / 1_000_000.0, per_operation: HashMap::new() },
        );
        // Literature search is unmetered money-wise; requests still count.
        rates.insert(
            "europe-pmc".to_string(),
            ProviderRates { default_rate: 0.0, per_operation: HashMap::new() },
        );
        RateTable { rates }
    };
}

impl RateTable {
    pub fn empty() -> Self {
        Self {
            rates: HashMap::new(),
        }
    }

    /// Table with the built-in provider rates.
    pub fn builtin() -> Self {
        BUILTIN_RATES.clone()
    }

    pub fn set_default_rate(&mut self, provider: impl Into<String>, rate: f64) {
        self.rates.entry(provider.into()).or_default().default_rate = rate;
    }

    pub fn set_operation_rate(
        &mut self,
        provider: impl Into<String>,
        operation: impl Into<String>,
        rate: f64,
    ) {
        self.rates
            .entry(provider.into())
            .or_default()
            .per_operation
            .insert(operation.into(), rate);
    }

    /// USD per unit for a `(provider, operation)` pair.
    pub fn unit_rate(&self, provider: &str, operation: &str) -> f64 {
        self.rates
            .get(provider)
            .map(|p| {
                p.per_operation
                    .get(operation)
                    .copied()
                    .unwrap_or(p.default_rate)
            })
            .unwrap_or(0.0)
    }
}

/// Append-log persistence boundary for usage events.
pub trait UsageStore: Send + Sync {
    fn load(&self) -> Result<Vec<UsageEvent>, LedgerError>;
    fn persist(&self, events: &[UsageEvent]) -> Result<(), LedgerError>;
}

/// Store that keeps nothing. Default for embedded use.
pub struct NullStore;

impl UsageStore for NullStore {
    fn load(&self) -> Result<Vec<UsageEvent>, LedgerError> {
        Ok(Vec::new())
    }

    fn persist(&self, _: &[UsageEvent]) -> Result<(), LedgerError> {
        Ok(())
    }
}

/// JSON file store: the full event list rewritten after each change.
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl UsageStore for JsonFileStore {
    fn load(&self) -> Result<Vec<UsageEvent>, LedgerError> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let raw = fs::read_to_string(&self.path)?;
        serde_json::from_str(&raw).map_err(|e| LedgerError::Encoding(e.to_string()))
    }

    fn persist(&self, events: &[UsageEvent]) -> Result<(), LedgerError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let raw = serde_json::to_string_pretty(events)
            .map_err(|e| LedgerError::Encoding(e.to_string()))?;
        fs::write(&self.path, raw)?;
        Ok(())
    }
}

/// The usage ledger. Appends are atomic per event; aggregation reads see a
/// snapshot that may trail in-flight appends, which is acceptable for
/// advisory quota checks.
pub struct UsageLedger {
    events: RwLock<Vec<UsageEvent>>,
    rates: RateTable,
    store: Box<dyn UsageStore>,
}

impl UsageLedger {
    pub fn new(rates: RateTable) -> Self {
        Self {
            events: RwLock::new(Vec::new()),
            rates,
            store: Box::new(NullStore),
        }
    }

    /// Ledger backed by a persistent store. Prior events are loaded up
    /// front; a load failure starts the ledger empty.
    pub fn with_store(rates: RateTable, store: Box<dyn UsageStore>) -> Self {
        let events = match store.load() {
            Ok(events) => events,
            Err(e) => {
                tracing::warn!(error = %e, "Could not load usage history, starting empty");
                Vec::new()
            }
        };

        Self {
            events: RwLock::new(events),
            rates,
            store,
        }
    }

    /// Meter one attempt: derive cost from the rate table, append the event,
    /// return the cost so the caller can surface it immediately.
    pub fn record(&self, provider: &str, operation: &str, quantity: u64) -> f64 {
        let cost = self.rates.unit_rate(provider, operation) * quantity as f64;

        let event = UsageEvent {
            timestamp: Utc::now(),
            provider: provider.to_string(),
            operation: operation.to_string(),
            quantity,
            cost,
        };
        tracing::debug!(provider, operation, quantity, cost, "Metered attempt");
        self.append_event(event);
        cost
    }

    /// Append a pre-built event (e.g. usage imported from another process).
    pub fn append_event(&self, event: UsageEvent) {
        let mut events = self.events.write();
        events.push(event);
        if let Err(e) = self.store.persist(&events) {
            tracing::warn!(error = %e, "Usage event not persisted");
        }
    }

    /// Aggregate events whose timestamp falls inside the window.
    pub fn summarize(&self, window: Window) -> UsageSummary {
        let now = Utc::now();
        let events = self.events.read();

        let mut summary = UsageSummary::default();
        for event in events.iter().filter(|e| window.contains(e.timestamp, now)) {
            summary.total_cost += event.cost;
            summary.total_quantity += event.quantity;
            summary.total_requests += 1;

            let provider = summary
                .by_provider
                .entry(event.provider.clone())
                .or_default();
            provider.cost += event.cost;
            provider.quantity += event.quantity;
            provider.requests += 1;

            let operation = summary
                .by_operation
                .entry(event.operation.clone())
                .or_default();
            operation.cost += event.cost;
            operation.quantity += event.quantity;
            operation.requests += 1;
        }
        summary
    }

    /// Pure read against the policy. `within_limit` is strict: spend equal
    /// to the limit already counts as over.
    pub fn check_quota(&self, policy: &QuotaPolicy) -> QuotaStatus {
        let daily_used = self.summarize(Window::Day).total_cost;
        let monthly_used = self.summarize(Window::Month).total_cost;

        QuotaStatus {
            daily_used,
            daily_limit: policy.daily_limit,
            daily_remaining: (policy.daily_limit - daily_used).max(0.0),
            daily_within_limit: daily_used < policy.daily_limit,
            monthly_used,
            monthly_limit: policy.monthly_limit,
            monthly_remaining: (policy.monthly_limit - monthly_used).max(0.0),
            monthly_within_limit: monthly_used < policy.monthly_limit,
        }
    }

    /// Drop events older than the given age. Irreversible.
    pub fn prune(&self, older_than: Duration) -> usize {
        let cutoff =
            Utc::now() - ChronoDuration::from_std(older_than).unwrap_or(ChronoDuration::zero());

        let mut events = self.events.write();
        let before = events.len();
        events.retain(|e| e.timestamp >= cutoff);
        let removed = before - events.len();

        if removed > 0 {
            if let Err(e) = self.store.persist(&events) {
                tracing::warn!(error = %e, "Pruned ledger not persisted");
            }
            tracing::info!(removed, "Pruned usage events");
        }
        removed
    }

    pub fn event_count(&self) -> usize {
        self.events.read().len()
    }
}
