//! FASTLANE: DEX trade execution core
//!
//! Entry point. Loads configuration, initialises structured logging,
//! restores transaction and breaker state, reconciles what was left
//! unresolved, then executes opportunities read as JSON lines from stdin
//! until input ends or Ctrl+C.

use anyhow::{Context, Result};
use chrono::Utc;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use fastlane::chain::dry_run::{DryRunChain, DryRunSigner};
use fastlane::chain::jsonrpc::{JsonRpcProvider, JsonRpcSigner};
use fastlane::chain::{PrebuiltCalldata, RpcProvider, TransactionSigner};
use fastlane::config::AppConfig;
use fastlane::engine::pool::Dispatcher;
use fastlane::engine::reconciler::Reconciler;
use fastlane::engine::{Collaborators, ExecutionServices};
use fastlane::events::TracingObserver;
use fastlane::risk::RiskCache;
use fastlane::storage;
use fastlane::types::{Opportunity, RiskScore};

const BANNER: &str = r#"
 _____ _    ____ _____ _        _    _   _ _____
|  ___/ \  / ___|_   _| |      / \  | \ | | ____|
| |_ / _ \ \___ \ | | | |     / _ \ |  \| |  _|
|  _/ ___ \ ___) || | | |___ / ___ \| |\  | |___
|_|/_/   \_\____/ |_| |_____/_/   \_\_| \_|_____|

  DEX trade execution core
  v0.1.0
"#;

/// One line of stdin: an opportunity, or a risk score to cache ahead of it.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum InputLine {
    Risk {
        fingerprint: String,
        risk_score: Decimal,
        #[serde(default)]
        categories: BTreeMap<String, Decimal>,
    },
    Opportunity(Box<Opportunity>),
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (non-fatal if missing)
    let _ = dotenv::dotenv();

    let cfg = AppConfig::load("config.toml")?;
    init_logging();

    println!("{BANNER}");
    info!(
        engine = %cfg.engine.name,
        dry_run = cfg.engine.dry_run,
        max_concurrent = cfg.engine.max_concurrent,
        backend = ?cfg.persistence.backend,
        "FASTLANE starting up"
    );

    // -- Collaborators ----------------------------------------------------

    let (provider, signer): (Arc<dyn RpcProvider>, Arc<dyn TransactionSigner>) = if cfg.engine.dry_run {
        warn!("Dry-run mode: transactions go to a simulated chain");
        (
            Arc::new(DryRunChain::new("dry-run", cfg.engine.dry_run_confirm_after_polls)),
            Arc::new(DryRunSigner),
        )
    } else {
        let provider = JsonRpcProvider::from_config(&cfg.rpc)?;
        info!(provider = %cfg.rpc.provider_name, chains = ?provider.chains(), "JSON-RPC provider ready");
        let signer_env = cfg
            .rpc
            .signer_url_env
            .as_deref()
            .context("rpc.signer_url_env is required outside dry-run mode")?;
        let signer = JsonRpcSigner::new(AppConfig::resolve_secret(signer_env)?)?;
        (Arc::new(provider), Arc::new(signer))
    };

    // -- Restore state ----------------------------------------------------

    let persistence = storage::open_store(&cfg.persistence).await?;
    let (services, breaker_writer) = ExecutionServices::assemble(
        cfg.clone(),
        Collaborators {
            provider,
            signer,
            encoder: Arc::new(PrebuiltCalldata::default()),
            risk_source: None,
            observer: Arc::new(TracingObserver),
        },
        persistence.clone(),
    );
    let services = Arc::new(services);

    let restored = services
        .store
        .restore()
        .await
        .context("Failed to restore transaction records")?;
    let breakers = services.breakers.restore(persistence.as_ref()).await?;
    info!(records = restored, breakers, "State restored");

    let reconciler = Arc::new(Reconciler::new(services.clone()));
    let report = reconciler.run_once().await;
    info!(
        confirmed = report.confirmed,
        failed = report.failed,
        abandoned = report.abandoned,
        still_pending = report.still_pending,
        "Startup reconciliation complete"
    );

    // -- Main loop --------------------------------------------------------

    let shutdown = CancellationToken::new();
    let (tx, rx) = mpsc::channel::<Opportunity>(cfg.engine.queue_capacity);

    let reconcile_task = {
        let reconciler = reconciler.clone();
        let shutdown = shutdown.clone();
        let interval = cfg.engine.reconcile_interval();
        tokio::spawn(async move { reconciler.run_until(interval, shutdown).await })
    };

    let dispatch_task = {
        let dispatcher = Dispatcher::new(services.clone());
        let shutdown = shutdown.clone();
        tokio::spawn(async move { dispatcher.run(rx, shutdown).await })
    };

    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Shutdown signal received.");
                shutdown.cancel();
            }
        });
    }

    info!("Reading opportunities from stdin. Press Ctrl+C to stop.");

    tokio::select! {
        result = read_stdin(tx, services.risk.clone()) => {
            match result {
                Ok(lines) => info!(lines, "Input closed, draining"),
                Err(e) => error!(error = %e, "Input failed, draining"),
            }
        }
        _ = shutdown.cancelled() => {}
    }

    let dispatch = dispatch_task.await.context("Dispatcher task failed")?;
    shutdown.cancel();
    if let Err(e) = reconcile_task.await {
        error!(error = %e, "Reconciler task failed");
    }

    // Drain queued transitions first so persist_all writes last.
    services.breakers.close_persistence();
    if let Err(e) = breaker_writer.await {
        error!(error = %e, "Breaker persistence writer failed");
    }
    services
        .breakers
        .persist_all(persistence.as_ref())
        .await
        .context("Failed to persist breaker state")?;

    info!(
        received = dispatch.received,
        confirmed = dispatch.confirmed,
        failed = dispatch.failed,
        abandoned = dispatch.abandoned,
        monitoring_abandoned = dispatch.monitoring_abandoned,
        duplicates = dispatch.duplicates,
        open_breakers = ?services.breakers.open_keys(),
        "FASTLANE shut down cleanly."
    );

    Ok(())
}

/// Forward stdin lines to the dispatcher until EOF. Returns lines read.
async fn read_stdin(tx: mpsc::Sender<Opportunity>, risk: Arc<RiskCache>) -> Result<usize> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut count = 0;

    while let Some(line) = lines.next_line().await.context("Failed to read stdin")? {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        count += 1;

        match serde_json::from_str::<InputLine>(line) {
            Ok(InputLine::Risk {
                fingerprint,
                risk_score,
                categories,
            }) => {
                risk.set(
                    &fingerprint,
                    RiskScore {
                        score: risk_score,
                        categories,
                        computed_at: Utc::now(),
                    },
                );
            }
            Ok(InputLine::Opportunity(opp)) => {
                if tx.send(*opp).await.is_err() {
                    warn!("Dispatcher stopped, input discarded");
                    break;
                }
            }
            Err(e) => warn!(line = count, error = %e, "Unparseable input line skipped"),
        }
    }
    Ok(count)
}

/// Initialise the `tracing` subscriber.
fn init_logging() {
    use tracing_subscriber::{fmt, EnvFilter};

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("fastlane=info"));

    let json_logging = std::env::var("FASTLANE_LOG_JSON").is_ok();

    if json_logging {
        fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .with_thread_ids(true)
            .init();
    } else {
        fmt()
            .with_env_filter(env_filter)
            .with_target(true)
            .init();
    }
}
