// Priority-fee estimation (micro-lamports per compute unit)
//
// Three strategies: off (configured static price), rpc-recent
// (percentile over getRecentPrioritizationFees), helius (priority-fee
// API). Estimation failures fall back to the configured static price.

use anyhow::{Context, Result};
use serde_json::json;
use solana_client::nonblocking::rpc_client::RpcClient;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::{FeeConfig, PriorityFeeLevel, PriorityFeeStrategy};

const HELIUS_TIMEOUT: Duration = Duration::from_secs(10);

fn level_percentile(level: PriorityFeeLevel) -> f64 {
    match level {
        PriorityFeeLevel::Low => 0.25,
        PriorityFeeLevel::Medium => 0.50,
        PriorityFeeLevel::High => 0.75,
        PriorityFeeLevel::VeryHigh => 0.95,
    }
}

fn level_name(level: PriorityFeeLevel) -> &'static str {
    match level {
        PriorityFeeLevel::Low => "low",
        PriorityFeeLevel::Medium => "medium",
        PriorityFeeLevel::High => "high",
        PriorityFeeLevel::VeryHigh => "veryHigh",
    }
}

/// Percentile over a recent-fee sample; empty samples yield 0
pub fn percentile(mut fees: Vec<u64>, pct: f64) -> u64 {
    if fees.is_empty() {
        return 0;
    }
    fees.sort_unstable();
    let rank = ((fees.len() - 1) as f64 * pct.clamp(0.0, 1.0)).round() as usize;
    fees[rank]
}

pub struct PriorityFeeEstimator {
    cfg: FeeConfig,
    http: reqwest::Client,
}

impl PriorityFeeEstimator {
    pub fn new(cfg: FeeConfig) -> Self {
        Self {
            cfg,
            http: reqwest::Client::new(),
        }
    }

    /// Compute-unit price to apply to the next transaction
    pub async fn cu_price(&self, rpc: &RpcClient) -> u64 {
        let estimated = match self.cfg.priority_fee_strategy {
            PriorityFeeStrategy::Off => return self.cfg.cu_price_micro_lamports,
            PriorityFeeStrategy::RpcRecent => self.from_rpc(rpc).await,
            PriorityFeeStrategy::Helius => self.from_helius().await,
        };
        match estimated {
            Ok(price) => price.max(self.cfg.cu_price_micro_lamports),
            Err(e) => {
                warn!("⚠️ priority fee estimation failed, using static price: {:#}", e);
                self.cfg.cu_price_micro_lamports
            }
        }
    }

    async fn from_rpc(&self, rpc: &RpcClient) -> Result<u64> {
        let fees = rpc
            .get_recent_prioritization_fees(&[])
            .await
            .context("getRecentPrioritizationFees failed")?;
        let sample: Vec<u64> = fees
            .iter()
            .map(|f| f.prioritization_fee)
            .filter(|&f| f > 0)
            .collect();
        let price = percentile(sample, level_percentile(self.cfg.priority_fee_level));
        debug!("priority fee (rpc-recent): {} micro-lamports", price);
        Ok(price)
    }

    async fn from_helius(&self) -> Result<u64> {
        let url = self
            .cfg
            .helius_url
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("HELIUS_PRIORITY_FEE_URL not configured"))?;

        let body = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "getPriorityFeeEstimate",
            "params": [{
                "options": { "priorityLevel": level_name(self.cfg.priority_fee_level) }
            }],
        });

        let response = self
            .http
            .post(url)
            .json(&body)
            .timeout(HELIUS_TIMEOUT)
            .send()
            .await
            .context("helius request failed")?;

        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("HTTP {}: {}", status.as_u16(), response.text().await.unwrap_or_default());
        }

        let parsed: serde_json::Value = response.json().await?;
        let estimate = parsed["result"]["priorityFeeEstimate"]
            .as_f64()
            .ok_or_else(|| anyhow::anyhow!("malformed helius response"))?;
        debug!("priority fee (helius): {} micro-lamports", estimate);
        Ok(estimate.max(0.0) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_percentile() {
        assert_eq!(percentile(vec![], 0.5), 0);
        assert_eq!(percentile(vec![10], 0.5), 10);
        assert_eq!(percentile(vec![30, 10, 20], 0.5), 20);
        assert_eq!(percentile(vec![30, 10, 20], 0.0), 10);
        assert_eq!(percentile(vec![30, 10, 20], 1.0), 30);
        // 95th over 1..=100 sits near the top
        let fees: Vec<u64> = (1..=100).collect();
        assert_eq!(percentile(fees, 0.95), 95);
    }

    #[test]
    fn test_level_mapping() {
        assert_eq!(level_percentile(PriorityFeeLevel::Low), 0.25);
        assert_eq!(level_name(PriorityFeeLevel::VeryHigh), "veryHigh");
    }
}
