// Optional health endpoint
//
// GET /healthz -> "ok"; GET /metrics -> limiter snapshots and run
// identity as JSON. Never exposes secrets.

use anyhow::{Context, Result};
use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::broadcast;
use tracing::info;

use crate::rate_limiter::AdaptiveRateLimiter;

pub struct HealthState {
    pub mode: &'static str,
    pub execution_strategy: &'static str,
    pub trigger_strategy: &'static str,
    pub pair_count: usize,
    pub started_at: Instant,
    pub limiters: Vec<Arc<AdaptiveRateLimiter>>,
}

async fn healthz() -> &'static str {
    "ok"
}

async fn metrics(State(state): State<Arc<HealthState>>) -> Json<serde_json::Value> {
    let limiters: Vec<_> = state.limiters.iter().map(|l| l.snapshot()).collect();
    Json(json!({
        "mode": state.mode,
        "executionStrategy": state.execution_strategy,
        "triggerStrategy": state.trigger_strategy,
        "pairs": state.pair_count,
        "uptimeSeconds": state.started_at.elapsed().as_secs(),
        "limiters": limiters,
    }))
}

fn build_router(state: Arc<HealthState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics))
        .with_state(state)
}

/// Serve until the shutdown signal fires
pub async fn serve(
    port: u16,
    state: Arc<HealthState>,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("failed to bind health port {}", port))?;
    info!("🩺 Health endpoint on :{} (/healthz, /metrics)", port);
    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
        })
        .await
        .context("health server failed")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RateConfig;

    #[tokio::test]
    async fn test_metrics_shape_has_no_secrets() {
        let limiter = Arc::new(AdaptiveRateLimiter::new(
            "jupiter",
            RateConfig {
                rps: 1.0,
                min_rps: 0.25,
                burst: 1.0,
                penalty_ms: 1_000,
                recovery_every_ms: 1_000,
                recovery_step_rps: 0.1,
                backoff_base_ms: 100,
                backoff_max_ms: 1_000,
                max_attempts: 4,
                cooldown_429_ms: 30_000,
            },
        ));
        let state = Arc::new(HealthState {
            mode: "dry-run",
            execution_strategy: "atomic",
            trigger_strategy: "immediate",
            pair_count: 2,
            started_at: Instant::now(),
            limiters: vec![limiter],
        });

        let Json(body) = metrics(State(state)).await;
        assert_eq!(body["mode"], "dry-run");
        assert_eq!(body["pairs"], 2);
        assert_eq!(body["limiters"][0]["name"], "jupiter");
        let rendered = body.to_string();
        assert!(!rendered.to_lowercase().contains("secret"));
        assert!(!rendered.to_lowercase().contains("key"));
    }
}
