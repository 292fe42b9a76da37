// Pair configuration file loading and validation
//
// The pair file is JSON: { "pairs": [ ... ] }. Pairs are immutable after
// load; every numeric amount is an atomic-unit decimal string.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;

use crate::types::is_decimal_string;

fn default_cooldown_ms() -> u64 {
    30_000
}

fn default_min_profit() -> String {
    "0".to_string()
}

/// One configured loop (A→B→A) or triangle (A→B→C→A)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct PairConfig {
    pub name: String,
    pub a_mint: String,
    pub b_mint: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub c_mint: Option<String>,

    /// Default slippage for every leg, bps
    pub slippage_bps: u16,
    /// Optional per-leg overrides, clamped to [1, 5000]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub leg_slippage_bps: Option<Vec<u16>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub include_dexes: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exclude_dexes: Option<Vec<String>>,

    /// Default input size (atomic units of A)
    pub amount_a: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub amount_a_steps: Option<Vec<String>>,
    /// Sizes strictly greater than this are never quoted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_notional_a: Option<String>,

    /// Minimum absolute profit in atomic units of A
    #[serde(default = "default_min_profit")]
    pub min_profit_a: String,
    /// Optional minimum profit as bps of the input notional
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_profit_bps: Option<u32>,

    #[serde(default = "default_cooldown_ms")]
    pub cooldown_ms: u64,

    // Per-pair fee/compute overrides
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cu_limit: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cu_price_micro_lamports: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_fee_lamports: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rent_buffer_lamports: Option<u64>,
}

impl PairConfig {
    pub fn is_triangular(&self) -> bool {
        self.c_mint.is_some()
    }

    /// Slippage for leg `idx` (0-based), clamped to [1, 5000]
    pub fn leg_slippage(&self, idx: usize) -> u16 {
        let raw = self
            .leg_slippage_bps
            .as_ref()
            .and_then(|v| v.get(idx).copied())
            .unwrap_or(self.slippage_bps);
        clamp_slippage(raw)
    }

    pub fn amount_a_atomic(&self) -> u128 {
        // Validated at load time
        self.amount_a.parse().unwrap_or(0)
    }

    pub fn min_profit_a_atomic(&self) -> u128 {
        self.min_profit_a.parse().unwrap_or(0)
    }

    pub fn max_notional_atomic(&self) -> Option<u128> {
        self.max_notional_a.as_ref().and_then(|s| s.parse().ok())
    }

    /// Every distinct mint touched by this pair, A first
    pub fn mints(&self) -> Vec<&str> {
        let mut out = vec![self.a_mint.as_str(), self.b_mint.as_str()];
        if let Some(c) = &self.c_mint {
            out.push(c.as_str());
        }
        out
    }

    fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            anyhow::bail!("pair with empty name");
        }
        for mint in self.mints() {
            if mint.is_empty() {
                anyhow::bail!("pair {}: empty mint", self.name);
            }
        }
        if !(1..=5000).contains(&self.slippage_bps) {
            anyhow::bail!(
                "pair {}: slippageBps {} out of range [1, 5000]",
                self.name,
                self.slippage_bps
            );
        }
        if let Some(legs) = &self.leg_slippage_bps {
            for (i, bps) in legs.iter().enumerate() {
                if !(1..=5000).contains(bps) {
                    anyhow::bail!(
                        "pair {}: leg {} slippage {} out of range [1, 5000]",
                        self.name,
                        i + 1,
                        bps
                    );
                }
            }
        }
        if !is_decimal_string(&self.amount_a) {
            anyhow::bail!("pair {}: amountA {:?} is not a decimal string", self.name, self.amount_a);
        }
        if let Some(steps) = &self.amount_a_steps {
            for step in steps {
                if !is_decimal_string(step) {
                    anyhow::bail!(
                        "pair {}: amountASteps entry {:?} is not a decimal string",
                        self.name,
                        step
                    );
                }
            }
        }
        if let Some(max) = &self.max_notional_a {
            if !is_decimal_string(max) {
                anyhow::bail!(
                    "pair {}: maxNotionalA {:?} is not a decimal string",
                    self.name,
                    max
                );
            }
        }
        if !is_decimal_string(&self.min_profit_a) {
            anyhow::bail!(
                "pair {}: minProfitA {:?} is not a decimal string",
                self.name,
                self.min_profit_a
            );
        }
        if let Some(bps) = self.min_profit_bps {
            if bps > 10_000 {
                anyhow::bail!(
                    "pair {}: minProfitBps {} out of range [0, 10000]",
                    self.name,
                    bps
                );
            }
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize, Serialize)]
struct PairsFile {
    pairs: Vec<PairConfig>,
}

/// Clamp slippage bps to the accepted [1, 5000] window
pub fn clamp_slippage(bps: u16) -> u16 {
    bps.clamp(1, 5000)
}

/// Load and validate the pair file
pub fn load_pairs(path: &str) -> Result<Vec<PairConfig>> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read pair config {}", path))?;
    let file: PairsFile = serde_json::from_str(&raw)
        .with_context(|| format!("failed to parse pair config {}", path))?;

    if file.pairs.is_empty() {
        anyhow::bail!("pair config {} has no pairs", path);
    }

    let mut seen = HashSet::new();
    for pair in &file.pairs {
        pair.validate()?;
        if !seen.insert(pair.name.clone()) {
            anyhow::bail!("duplicate pair name {:?}", pair.name);
        }
    }

    Ok(file.pairs)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_pair() -> PairConfig {
        serde_json::from_value(serde_json::json!({
            "name": "SOL/USDC",
            "aMint": "So11111111111111111111111111111111111111112",
            "bMint": "EPjFWdd5AufqSSqeM2qN1xzybapC8G4wEGGkZwyTDt1v",
            "slippageBps": 50,
            "amountA": "1000000000",
        }))
        .unwrap()
    }

    #[test]
    fn test_defaults() {
        let pair = sample_pair();
        assert_eq!(pair.cooldown_ms, 30_000);
        assert_eq!(pair.min_profit_a, "0");
        assert!(!pair.is_triangular());
        assert_eq!(pair.amount_a_atomic(), 1_000_000_000);
    }

    #[test]
    fn test_leg_slippage_clamped() {
        let mut pair = sample_pair();
        pair.leg_slippage_bps = Some(vec![20, 9000]);
        assert_eq!(pair.leg_slippage(0), 20);
        // Validation rejects 9000, but the accessor still clamps
        assert_eq!(pair.leg_slippage(1), 5000);
        assert_eq!(pair.leg_slippage(2), 50);
    }

    #[test]
    fn test_validate_rejects_bad_amount() {
        let mut pair = sample_pair();
        pair.amount_a = "1.5".to_string();
        assert!(pair.validate().is_err());

        let mut pair = sample_pair();
        pair.slippage_bps = 0;
        assert!(pair.validate().is_err());

        let mut pair = sample_pair();
        pair.min_profit_bps = Some(10_001);
        assert!(pair.validate().is_err());
    }

    #[test]
    fn test_roundtrip_preserves_fields() {
        let pair = sample_pair();
        let json = serde_json::to_string(&pair).unwrap();
        let back: PairConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.name, pair.name);
        assert_eq!(back.slippage_bps, pair.slippage_bps);
        assert_eq!(back.amount_a, pair.amount_a);
        assert_eq!(back.cooldown_ms, pair.cooldown_ms);
    }
}
