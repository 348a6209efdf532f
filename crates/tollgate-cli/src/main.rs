//! Maintenance and reporting CLI for Tollgate.
//!
//! These are the out-of-band hooks: usage summaries, quota status, cache
//! statistics, and the cleanup/prune sweeps that scheduling collaborators
//! run. Request-path traffic goes through the `tollgate-runtime` gateway,
//! not this binary.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};

use tollgate_core::{
    CacheStore, GatewayConfig, JsonFileStore, QuotaPolicy, RateTable, UsageLedger, Window,
};

#[derive(Parser)]
#[command(name = "tollgate", about = "Maintenance hooks for the Tollgate gateway", version)]
struct Cli {
    /// Path to a YAML gateway configuration.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Aggregated usage for a window.
    Usage {
        /// "day", "month", or "all".
        #[arg(long, default_value = "day")]
        window: String,
    },

    /// Spending against the configured quota.
    Quota,

    /// Cache entry count, byte volume, and hit/miss counters.
    CacheStats,

    /// Remove expired cache entries.
    Cleanup,

    /// Remove usage events older than the given age.
    Prune {
        /// Age threshold, e.g. "90days" or "12h".
        #[arg(long, default_value = "90days")]
        older_than: String,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => GatewayConfig::from_yaml_file(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => GatewayConfig::default(),
    };

    match cli.command {
        Command::Usage { window } => {
            let ledger = open_ledger(&config);
            let window = parse_window(&window)?;
            print_json(&ledger.summarize(window))
        }
        Command::Quota => {
            let ledger = open_ledger(&config);
            let policy = config.quota.clone().unwrap_or_else(QuotaPolicy::default);
            print_json(&ledger.check_quota(&policy))
        }
        Command::CacheStats => {
            let cache = open_cache(&config)?;
            print_json(&cache.stats())
        }
        Command::Cleanup => {
            let cache = open_cache(&config)?;
            let removed = cache.invalidate_expired();
            println!("removed {} expired cache entries", removed);
            Ok(())
        }
        Command::Prune { older_than } => {
            let age: Duration = humantime::parse_duration(&older_than)
                .with_context(|| format!("invalid duration '{}'", older_than))?;
            let ledger = open_ledger(&config);
            let removed = ledger.prune(age);
            println!("removed {} usage events", removed);
            Ok(())
        }
    }
}

fn open_ledger(config: &GatewayConfig) -> UsageLedger {
    let rates: RateTable = config.rates.clone();
    match &config.usage_storage_path {
        Some(path) => UsageLedger::with_store(rates, Box::new(JsonFileStore::new(path))),
        None => {
            tracing::warn!("No usage_storage_path configured; ledger starts empty");
            UsageLedger::new(rates)
        }
    }
}

fn open_cache(config: &GatewayConfig) -> Result<CacheStore> {
    if config.cache.storage_path.is_none() {
        bail!("cache maintenance requires cache.storage_path in the config");
    }
    Ok(CacheStore::from_config(&config.cache))
}

fn parse_window(raw: &str) -> Result<Window> {
    match raw {
        "day" => Ok(Window::Day),
        "month" => Ok(Window::Month),
        "all" => Ok(Window::Range {
            start: chrono_min(),
            end: chrono_max(),
        }),
        other => bail!("unknown window '{}'; expected day, month, or all", other),
    }
}

fn chrono_min() -> chrono::DateTime<chrono::Utc> {
    chrono::DateTime::<chrono::Utc>::MIN_UTC
}

fn chrono_max() -> chrono::DateTime<chrono::Utc> {
    chrono::DateTime::<chrono::Utc>::MAX_UTC
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
