// Block-engine bundle client
//
// Submits single-transaction bundles over the block-engine JSON-RPC API
// and optionally waits on the inflight status endpoint with a hard
// deadline. The tip is expected to already be inside the transaction;
// this client never creates a separate tip transaction.

use anyhow::{Context, Result};
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use serde::{Deserialize, Serialize};
use solana_sdk::pubkey::Pubkey;
use solana_sdk::transaction::VersionedTransaction;
use std::num::NonZeroU32;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

const SUBMIT_TIMEOUT: Duration = Duration::from_secs(15);
const STATUS_POLL_INTERVAL: Duration = Duration::from_millis(400);

/// Official mainnet tip accounts
const DEFAULT_TIP_ACCOUNTS: [&str; 8] = [
    "96gYZGLnJYVFmbjzopPSU6QiEV5fGqZNyN9nmNhvrZU5",
    "HFqU5x63VTqvQss8hp11i4wVV8bD44PvwucfZ2bU7gRe",
    "Cw8CFyM9FkoMi7K7Crf6HNQqf4uEMzpKw6QNghXLvLkY",
    "ADaUMid9yfUytqMBgopwjb2DTLSokTSzL1zt6iGPaS49",
    "DfXygSm4jCyNCybVYYK6DwvWqjKee8pbDmJGcLWNDXjh",
    "ADuUkR4vqLUMWXxW9gh6D6L8pMSawimctcNZ5pGwDcEt",
    "DttWaMuVvTiduZRnguLF7jNxTgiMBZ1hyAumKUiL2KRL",
    "3AVi9Tg9Uo68tJfuvoKvqKNWKkC5wPdSSdeBnizKZ6jT",
];

/// Pick the configured tip account when it parses, else one of the
/// defaults uniformly at random
pub fn choose_tip_account(configured: Option<&str>) -> Pubkey {
    if let Some(raw) = configured {
        if let Ok(pubkey) = raw.parse() {
            return pubkey;
        }
        warn!("⚠️ JITO_TIP_ACCOUNT {:?} is not a valid pubkey, using default set", raw);
    }
    use rand::Rng;
    let idx = rand::thread_rng().gen_range(0..DEFAULT_TIP_ACCOUNTS.len());
    DEFAULT_TIP_ACCOUNTS[idx]
        .parse()
        .expect("default tip accounts are valid")
}

/// Bundle outcomes as reported by the inflight status endpoint.
/// "Invalid" (not tracked by the engine) maps to Dropped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BundleOutcome {
    Landed,
    Rejected,
    Dropped,
    /// Deadline passed without a terminal status; the caller returns
    /// without confirmation
    Pending,
}

impl BundleOutcome {
    /// Whether the RPC fallback should take over
    pub fn is_failure(&self) -> bool {
        matches!(self, BundleOutcome::Rejected | BundleOutcome::Dropped)
    }
}

#[derive(Debug, Serialize)]
struct RpcRequest<'a, P: Serialize> {
    jsonrpc: &'a str,
    id: u64,
    method: &'a str,
    params: P,
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: Option<serde_json::Value>,
    #[serde(default)]
    error: Option<RpcError>,
}

#[derive(Debug, Deserialize)]
struct RpcError {
    code: i64,
    message: String,
}

pub struct JitoBundleClient {
    http: reqwest::Client,
    endpoint: String,
    // Block engines accept ~1 submission/sec per IP
    pacer: DefaultDirectRateLimiter,
}

impl JitoBundleClient {
    pub fn new(block_engine_url: &str) -> Self {
        let endpoint = format!("{}/api/v1/bundles", block_engine_url.trim_end_matches('/'));
        info!("🌐 Block engine endpoint: {}", endpoint);
        Self {
            http: reqwest::Client::new(),
            endpoint,
            pacer: RateLimiter::direct(Quota::per_second(NonZeroU32::new(1).unwrap())),
        }
    }

    async fn call(&self, method: &str, params: serde_json::Value) -> Result<serde_json::Value> {
        let request = RpcRequest {
            jsonrpc: "2.0",
            id: Uuid::new_v4().as_u128() as u64,
            method,
            params,
        };
        let response = self
            .http
            .post(&self.endpoint)
            .json(&request)
            .timeout(SUBMIT_TIMEOUT)
            .send()
            .await
            .with_context(|| format!("block engine {} request failed", method))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("HTTP {}: {}", status.as_u16(), body);
        }

        let parsed: RpcResponse = response.json().await?;
        if let Some(error) = parsed.error {
            anyhow::bail!("block engine error {}: {}", error.code, error.message);
        }
        parsed
            .result
            .ok_or_else(|| anyhow::anyhow!("block engine returned no result"))
    }

    /// Submit the signed transactions as one bundle; returns the bundle id
    pub async fn submit_bundle(&self, transactions: &[VersionedTransaction]) -> Result<String> {
        self.pacer.until_ready().await;

        let encoded: Result<Vec<String>> = transactions
            .iter()
            .map(|tx| {
                let bytes = bincode::serialize(tx).context("failed to serialize transaction")?;
                Ok(bs58::encode(bytes).into_string())
            })
            .collect();
        let encoded = encoded?;

        let started = Instant::now();
        let result = self
            .call("sendBundle", serde_json::json!([encoded]))
            .await?;
        let bundle_id = result
            .as_str()
            .ok_or_else(|| anyhow::anyhow!("sendBundle returned no bundle id"))?
            .to_string();
        info!(
            "📦 Bundle submitted in {}ms: {}",
            started.elapsed().as_millis(),
            bundle_id
        );
        Ok(bundle_id)
    }

    /// Poll inflight status until a terminal outcome or the deadline
    pub async fn wait_for_result(&self, bundle_id: &str, wait_ms: u64) -> BundleOutcome {
        let deadline = Instant::now() + Duration::from_millis(wait_ms);
        loop {
            match self.inflight_status(bundle_id).await {
                Ok(Some(status)) => match status.as_str() {
                    "Landed" => return BundleOutcome::Landed,
                    "Failed" => return BundleOutcome::Rejected,
                    "Invalid" => return BundleOutcome::Dropped,
                    other => debug!("⏳ bundle {} status: {}", bundle_id, other),
                },
                Ok(None) => debug!("⏳ bundle {} not yet tracked", bundle_id),
                Err(e) => warn!("⚠️ bundle status poll failed: {:#}", e),
            }
            if Instant::now() >= deadline {
                return BundleOutcome::Pending;
            }
            tokio::time::sleep(STATUS_POLL_INTERVAL).await;
        }
    }

    async fn inflight_status(&self, bundle_id: &str) -> Result<Option<String>> {
        let result = self
            .call(
                "getInflightBundleStatuses",
                serde_json::json!([[bundle_id]]),
            )
            .await?;
        Ok(result["value"]
            .as_array()
            .and_then(|entries| entries.first())
            .and_then(|entry| entry["status"].as_str())
            .map(|s| s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_choose_tip_account_prefers_valid_configured() {
        let configured = DEFAULT_TIP_ACCOUNTS[3];
        assert_eq!(
            choose_tip_account(Some(configured)),
            configured.parse::<Pubkey>().unwrap()
        );
    }

    #[test]
    fn test_choose_tip_account_falls_back_on_garbage() {
        let picked = choose_tip_account(Some("not-a-pubkey"));
        assert!(DEFAULT_TIP_ACCOUNTS
            .iter()
            .any(|a| a.parse::<Pubkey>().unwrap() == picked));

        let random = choose_tip_account(None);
        assert!(DEFAULT_TIP_ACCOUNTS
            .iter()
            .any(|a| a.parse::<Pubkey>().unwrap() == random));
    }

    #[test]
    fn test_bundle_outcome_failure_set() {
        assert!(BundleOutcome::Rejected.is_failure());
        assert!(BundleOutcome::Dropped.is_failure());
        assert!(!BundleOutcome::Landed.is_failure());
        assert!(!BundleOutcome::Pending.is_failure());
    }
}
