//! DEX-aggregator arbitrage engine
//!
//! Scans configured token loops and triangles against two aggregators,
//! decides profitability in exact integer arithmetic, and executes
//! atomically (one versioned transaction, optionally via a block-engine
//! bundle) or sequentially per leg.

use anyhow::{Context, Result};
use clap::Parser;
use serde_json::json;
use solana_sdk::signer::Signer;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

mod config;
mod decider;
mod event_log;
mod executor;
mod fee_model;
mod health;
mod jito_client;
mod jupiter;
mod openocean;
mod pairs;
mod priority_fee;
mod rate_limiter;
mod rpc;
mod scanner;
mod scheduler;
mod trigger;
mod tx_builder;
mod types;
mod ultra;
mod wallet;

use config::{Config, ExecutionProvider, Mode};
use event_log::{EventLog, EventType};
use executor::Executor;
use fee_model::FeeConverter;
use rate_limiter::{AdaptiveRateLimiter, PairBreaker};
use scanner::ScanContext;
use scheduler::Engine;

#[derive(Debug, Parser)]
#[command(name = "agg-arb-bot", about = "Aggregator loop/triangle arbitrage engine")]
struct Cli {
    /// One scheduling pass over every pair, then exit
    #[arg(long)]
    once: bool,

    /// Create the associated token accounts for every configured mint,
    /// then exit
    #[arg(long)]
    setup_wallet: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();
    let cfg = Arc::new(Config::from_env()?);
    let pair_list = pairs::load_pairs(&cfg.pairs_path)?;

    info!("💰 Starting aggregator arbitrage engine");
    info!("  • Mode: {}", cfg.mode.as_str());
    info!("  • Execution: {} via {}", cfg.execution_strategy.as_str(), match cfg.execution_provider {
        ExecutionProvider::Swap => "swap",
        ExecutionProvider::Ultra => "ultra",
    });
    info!("  • Trigger: {}", cfg.trigger.strategy.as_str());
    info!("  • Pairs: {}", pair_list.len());

    let events = Arc::new(EventLog::open(
        &cfg.event_log_path,
        cfg.log_verbose,
        cfg.event_log_rotate,
        cfg.event_log_max_bytes,
        cfg.event_log_max_files,
    )?);

    let wallet = Arc::new(wallet::load_keypair(&cfg.wallet_secret)?);
    let rpc = Arc::new(rpc::SolanaRpc::new(&cfg.rpc_url, &cfg.commitment));

    // Setup-wallet is a one-shot maintenance command
    if cli.setup_wallet {
        let mut mints = Vec::new();
        for pair in &pair_list {
            for mint in pair.mints() {
                mints.push(
                    mint.parse()
                        .map_err(|e| anyhow::anyhow!("pair {}: bad mint {}: {}", pair.name, mint, e))?,
                );
            }
        }
        let created = rpc.setup_wallet(&wallet, &mints).await?;
        info!("✅ setup-wallet complete ({} accounts created)", created);
        return Ok(());
    }

    // Rate governors, one per upstream
    let jupiter_limiter = Arc::new(AdaptiveRateLimiter::new("jupiter", cfg.jupiter.rate.clone()));
    let openocean_limiter = Arc::new(AdaptiveRateLimiter::new(
        "openocean",
        cfg.openocean.rate.clone(),
    ));

    let jupiter = Arc::new(jupiter::JupiterQuoteClient::new(
        &cfg.jupiter.base_url,
        "https://api.jup.ag/swap/v1",
        cfg.jupiter.api_key.clone(),
        cfg.jupiter.quote_cache_ttl_ms,
        jupiter_limiter.clone(),
    )?);
    let ultra = Arc::new(ultra::UltraClient::new(
        &cfg.jupiter.ultra_base_url,
        "https://api.jup.ag/ultra",
        cfg.jupiter.api_key.clone(),
        jupiter_limiter.clone(),
    ));
    let openocean = if cfg.openocean.enabled {
        Some(Arc::new(openocean::OpenOceanClient::new(
            cfg.openocean.clone(),
            openocean_limiter.clone(),
        )))
    } else {
        None
    };
    let jito = if cfg.jito.enabled {
        Some(Arc::new(jito_client::JitoBundleClient::new(
            &cfg.jito.block_engine_url,
        )))
    } else {
        None
    };

    let fee_converter = Arc::new(FeeConverter::new(jupiter.clone()));
    let decider = Arc::new(decider::Decider::from_cmd(cfg.decider_cmd.as_deref()));
    let breaker = Arc::new(PairBreaker::new());

    let ctx = Arc::new(ScanContext {
        cfg: cfg.clone(),
        jupiter: jupiter.clone(),
        ultra: ultra.clone(),
        openocean: openocean.clone(),
        fee_converter,
        decider,
        breaker,
        events: events.clone(),
        wallet_pubkey: wallet.pubkey().to_string(),
    });

    let executor = Arc::new(Executor {
        cfg: cfg.clone(),
        rpc: rpc.clone(),
        wallet: wallet.clone(),
        jupiter,
        ultra,
        openocean,
        jito,
        priority_fees: Arc::new(priority_fee::PriorityFeeEstimator::new(cfg.fees.clone())),
        events: events.clone(),
    });

    for warning in cfg.startup_warnings(&pair_list) {
        warn!("⚠️ {}", warning);
        events
            .emit(EventType::Warning, json!({"message": warning}))
            .await;
    }

    events
        .emit(
            EventType::Startup,
            json!({
                "mode": cfg.mode.as_str(),
                "executionStrategy": cfg.execution_strategy.as_str(),
                "triggerStrategy": cfg.trigger.strategy.as_str(),
                "pairs": pair_list.len(),
                "openoceanEnabled": cfg.openocean.enabled,
                "jitoEnabled": cfg.jito.enabled,
                "wallet": wallet.pubkey().to_string(),
                "once": cli.once,
            }),
        )
        .await;

    let (shutdown_tx, _) = broadcast::channel(4);

    if let Some(port) = cfg.health_port {
        let state = Arc::new(health::HealthState {
            mode: cfg.mode.as_str(),
            execution_strategy: cfg.execution_strategy.as_str(),
            trigger_strategy: cfg.trigger.strategy.as_str(),
            pair_count: pair_list.len(),
            started_at: std::time::Instant::now(),
            limiters: vec![jupiter_limiter.clone(), openocean_limiter.clone()],
        });
        let rx = shutdown_tx.subscribe();
        tokio::spawn(async move {
            if let Err(e) = health::serve(port, state, rx).await {
                warn!("⚠️ health endpoint stopped: {:#}", e);
            }
        });
    }

    // Signal handler: request a graceful stop between scans
    {
        let shutdown_tx = shutdown_tx.clone();
        tokio::spawn(async move {
            let sigint = tokio::signal::ctrl_c();
            #[cfg(unix)]
            {
                let mut sigterm =
                    tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                        .expect("sigterm handler");
                tokio::select! {
                    _ = sigint => info!("🛑 SIGINT received"),
                    _ = sigterm.recv() => info!("🛑 SIGTERM received"),
                }
            }
            #[cfg(not(unix))]
            {
                let _ = sigint.await;
                info!("🛑 Ctrl+C received");
            }
            let _ = shutdown_tx.send(());
        });
    }

    if cfg.mode == Mode::Live {
        info!("🚨 LIVE mode: transactions will be signed and sent");
    } else {
        info!("🧪 dry-run mode: building only, nothing is sent");
    }

    let engine = Engine {
        cfg: cfg.clone(),
        pairs: pair_list,
        ctx,
        executor,
        events: events.clone(),
        shutdown_tx: shutdown_tx.clone(),
    };

    let result = engine.run(cli.once).await;

    events
        .emit(
            EventType::Shutdown,
            json!({"clean": result.is_ok(), "once": cli.once}),
        )
        .await;

    match result {
        Ok(()) => {
            info!("👋 shutdown complete");
            Ok(())
        }
        Err(e) => {
            error!("❌ engine stopped: {:#}", e);
            Err(e).context("engine failed")
        }
    }
}
