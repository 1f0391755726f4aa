//! Cart Recovery: abandoned-checkout recovery automation.
//!
//! Loads configuration, wires the Shopify client and the persistence store,
//! then runs one recovery pass or prints the A/B test report.

use anyhow::Context;
use chrono::Utc;
use clap::{Parser, ValueEnum};
use recovery_core::config::AppConfig;
use recovery_core::RecoveryStore;
use recovery_experimentation::{CounterStore, InMemoryCounterStore, StoreCounterStore, VariantAllocator};
use recovery_integrations::{PostgRestStore, ShopifyClient};
use recovery_orchestrator::{RecoveryOrchestrator, RunMode};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Mode {
    /// Decide and log everything, write nothing
    DryRun,
    /// Create codes, tag customers and record sessions
    Execute,
    /// Print the A/B test evaluation and exit
    Report,
}

#[derive(Parser, Debug)]
#[command(name = "cart-recovery")]
#[command(about = "Abandoned-cart recovery automation")]
#[command(version)]
struct Cli {
    #[arg(long, value_enum, default_value_t = Mode::DryRun, env = "CART_RECOVERY_MODE")]
    mode: Mode,

    /// Process at most this many checkouts
    #[arg(long)]
    max_checkouts: Option<usize>,

    /// Debug-level logging
    #[arg(short, long, default_value_t = false)]
    verbose: bool,

    /// Emit logs as JSON
    #[arg(long, default_value_t = false)]
    json_logs: bool,

    /// Configuration file (optional; missing files are ignored)
    #[arg(long, default_value = "cart-recovery.toml")]
    config: PathBuf,

    /// Shopify store domain (overrides config)
    #[arg(long, env = "SHOPIFY_STORE")]
    store_domain: Option<String>,

    /// Shopify Admin API token (overrides config)
    #[arg(long, env = "SHOPIFY_ACCESS_TOKEN", hide_env_values = true)]
    access_token: Option<String>,
}

fn init_tracing(cli: &Cli) {
    let default_filter = if cli.verbose {
        "cart_recovery=debug,recovery_=debug"
    } else {
        "cart_recovery=info,recovery_=info"
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| default_filter.into());
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if cli.json_logs {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli);

    if let Err(e) = run(cli).await {
        error!(error = %e, "Cart recovery failed");
        return Err(e);
    }
    Ok(())
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let mut config = AppConfig::load(Some(cli.config.as_path()))
        .with_context(|| format!("failed to load configuration from {}", cli.config.display()))?;

    if let Some(domain) = cli.store_domain {
        config.shopify.store_domain = domain;
    }
    if let Some(token) = cli.access_token {
        config.shopify.access_token = Some(token);
    }

    let warnings = config.validate().context("invalid configuration")?;
    for warning in &warnings {
        warn!(warning = %warning, "Configuration smell");
    }

    info!(
        mode = ?cli.mode,
        store_domain = %config.shopify.store_domain,
        store_enabled = config.store.is_configured(),
        touchpoints = config.sequence.touchpoints.len(),
        ab_tests = config.experiments.tests.len(),
        "Configuration loaded"
    );

    let store: Option<Arc<dyn RecoveryStore>> = if config.store.is_configured() {
        let store = PostgRestStore::new(&config.store).context("failed to configure the persistence store")?;
        Some(Arc::new(store))
    } else {
        info!("No persistence store configured; using the legacy eligibility rule");
        None
    };

    if cli.mode == Mode::Report {
        let counters: Arc<dyn CounterStore> = match &store {
            Some(store) => Arc::new(StoreCounterStore::new(store.clone())),
            None => {
                warn!("No persistence store configured; the report has no data");
                Arc::new(InMemoryCounterStore::new())
            }
        };
        let allocator = VariantAllocator::new(&config.experiments, counters);
        let evaluations = allocator.evaluate_tests().await?;
        println!("{}", serde_json::to_string_pretty(&evaluations)?);
        return Ok(());
    }

    let mode = match cli.mode {
        Mode::Execute => RunMode::Execute,
        _ => RunMode::DryRun,
    };
    let shopify = ShopifyClient::new(&config.shopify).context("Shopify credentials are required")?;
    let orchestrator = RecoveryOrchestrator::new(config, mode, Arc::new(shopify), store);

    let summary = orchestrator.run(Utc::now(), cli.max_checkouts).await?;
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}
