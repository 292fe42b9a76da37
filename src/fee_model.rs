// Fee and tip model
//
// Estimates the lamport cost of landing a candidate, computes the bundle
// tip (fixed or output-proportional), and translates lamport costs into
// input-token units when the input mint is not native. The conversion
// uses the *optimistic* out-amount of a one-SOL reference quote, which
// overstates out-per-SOL and therefore overstates the fee in A: the
// profitability check stays conservative.

use anyhow::{Context, Result};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::OnceCell;
use tracing::debug;

use crate::config::{JitoConfig, TipMode};
use crate::jupiter::{JupiterQuoteClient, QuoteRequest};
use crate::pairs::clamp_slippage;
use crate::types::{Provider, NATIVE_MINT};

pub const LAMPORTS_PER_SOL: u128 = 1_000_000_000;

/// Conversion cache TTL bounds (raised to the pair cooldown when larger)
const CONVERSION_TTL_DEFAULT_MS: u64 = 60_000;
const CONVERSION_TTL_MIN_MS: u64 = 10_000;

/// Inputs to the lamport fee estimate
#[derive(Debug, Clone, Copy)]
pub struct FeeParams {
    pub base_fee_lamports: u64,
    pub rent_buffer_lamports: u64,
    pub cu_limit: u32,
    pub cu_price_micro_lamports: u64,
    pub tx_count: u64,
    pub sigs_per_tx: u64,
    pub tip_lamports: u64,
}

/// priority = cuLimit * cuPrice / 1e6, integer
pub fn priority_fee_lamports(cu_limit: u32, cu_price_micro_lamports: u64) -> u64 {
    ((cu_limit as u128).saturating_mul(cu_price_micro_lamports as u128) / 1_000_000)
        .min(u64::MAX as u128) as u64
}

/// Total lamport estimate for one candidate
pub fn estimate_fee_lamports(params: &FeeParams) -> u64 {
    let priority = priority_fee_lamports(params.cu_limit, params.cu_price_micro_lamports);
    params
        .base_fee_lamports
        .saturating_mul(params.tx_count)
        .saturating_mul(params.sigs_per_tx)
        .saturating_add(params.rent_buffer_lamports.saturating_mul(params.tx_count))
        .saturating_add(priority.saturating_mul(params.tx_count))
        .saturating_add(params.tip_lamports)
}

/// Tip for a candidate. Dynamic tips only apply to native-input pairs;
/// everything else falls back to the fixed amount.
pub fn compute_tip(
    jito: &JitoConfig,
    a_mint_is_native: bool,
    in_amount: u128,
    last_leg_min_out: u128,
) -> u64 {
    if !jito.enabled {
        return 0;
    }
    match jito.tip_mode {
        TipMode::Fixed => jito.tip_lamports,
        TipMode::Dynamic => {
            if !a_mint_is_native {
                return jito.tip_lamports;
            }
            let gross = last_leg_min_out.saturating_sub(in_amount);
            if gross == 0 {
                return 0;
            }
            let raw = gross.saturating_mul(jito.tip_bps as u128) / 10_000;
            let clamped = raw
                .max(jito.min_tip_lamports as u128)
                .min(jito.max_tip_lamports as u128);
            clamped.min(u64::MAX as u128) as u64
        }
    }
}

/// feeInA = ceil(feeLamports * outPerSol / 1e9)
pub fn convert_fee_to_a(fee_lamports: u64, out_per_sol: u128) -> u128 {
    let numerator = (fee_lamports as u128).saturating_mul(out_per_sol);
    (numerator + LAMPORTS_PER_SOL - 1) / LAMPORTS_PER_SOL
}

/// minProfitInA = max(minProfitA, floor(amountA * minProfitBps / 10_000))
pub fn min_profit_in_a(
    min_profit_a: u128,
    min_profit_bps: Option<u32>,
    amount_a: u128,
) -> u128 {
    match min_profit_bps {
        Some(bps) if amount_a > 0 => {
            let from_bps = amount_a.saturating_mul(bps as u128) / 10_000;
            min_profit_a.max(from_bps)
        }
        _ => min_profit_a,
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ConversionKey {
    pair: String,
    a_mint: String,
    slippage_bps: u16,
    provider: Provider,
}

struct ConversionSlot {
    inserted: Instant,
    ttl: Duration,
    cell: Arc<OnceCell<u128>>,
}

/// Lamport→A conversion through a cached one-SOL reference quote. The
/// reference quote counts against the Primary rate budget.
pub struct FeeConverter {
    jupiter: Arc<JupiterQuoteClient>,
    cache: DashMap<ConversionKey, ConversionSlot>,
}

impl FeeConverter {
    pub fn new(jupiter: Arc<JupiterQuoteClient>) -> Self {
        Self {
            jupiter,
            cache: DashMap::new(),
        }
    }

    /// Optimistic out-amount of quoting exactly one native unit into A
    pub async fn out_per_sol(
        &self,
        pair: &str,
        a_mint: &str,
        slippage_bps: u16,
        provider: Provider,
        pair_cooldown_ms: u64,
    ) -> Result<u128> {
        let slippage_bps = clamp_slippage(slippage_bps);
        let ttl = Duration::from_millis(
            CONVERSION_TTL_DEFAULT_MS
                .max(CONVERSION_TTL_MIN_MS)
                .max(pair_cooldown_ms),
        );
        let key = ConversionKey {
            pair: pair.to_string(),
            a_mint: a_mint.to_string(),
            slippage_bps,
            provider,
        };

        let cell = {
            let mut entry = self.cache.entry(key.clone()).or_insert_with(|| ConversionSlot {
                inserted: Instant::now(),
                ttl,
                cell: Arc::new(OnceCell::new()),
            });
            if entry.inserted.elapsed() > entry.ttl && entry.cell.initialized() {
                *entry = ConversionSlot {
                    inserted: Instant::now(),
                    ttl,
                    cell: Arc::new(OnceCell::new()),
                };
            }
            entry.cell.clone()
        };

        let result = cell
            .get_or_try_init(|| async {
                let quote = self
                    .jupiter
                    .quote_exact_in(&QuoteRequest {
                        input_mint: NATIVE_MINT.to_string(),
                        output_mint: a_mint.to_string(),
                        amount: LAMPORTS_PER_SOL,
                        slippage_bps,
                        include_dexes: None,
                        exclude_dexes: None,
                    })
                    .await
                    .context("fee conversion reference quote failed")?;
                debug!(
                    "💱 {}: 1 SOL ≈ {} {} (fee conversion)",
                    pair, quote.out_amount, a_mint
                );
                Ok::<u128, anyhow::Error>(quote.out_amount)
            })
            .await
            .map(|v| *v);

        if result.is_err() {
            if let Some(entry) = self.cache.get(&key) {
                if Arc::ptr_eq(&entry.cell, &cell) {
                    drop(entry);
                    self.cache.remove(&key);
                }
            }
        }
        result
    }

    /// Fee in input-token units; identity when A is the native mint
    pub async fn fee_in_a(
        &self,
        pair: &str,
        a_mint: &str,
        slippage_bps: u16,
        provider: Provider,
        pair_cooldown_ms: u64,
        fee_lamports: u64,
    ) -> Result<u128> {
        if a_mint == NATIVE_MINT {
            return Ok(fee_lamports as u128);
        }
        let out_per_sol = self
            .out_per_sol(pair, a_mint, slippage_bps, provider, pair_cooldown_ms)
            .await?;
        Ok(convert_fee_to_a(fee_lamports, out_per_sol))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn jito(mode: TipMode) -> JitoConfig {
        JitoConfig {
            enabled: true,
            block_engine_url: String::new(),
            tip_mode: mode,
            tip_lamports: 100_000,
            tip_bps: 2_000,
            min_tip_lamports: 5_000,
            max_tip_lamports: 50_000,
            tip_account: None,
            wait_ms: 0,
            fallback_rpc: false,
        }
    }

    #[test]
    fn test_priority_fee_integer_division() {
        assert_eq!(priority_fee_lamports(600_000, 0), 0);
        assert_eq!(priority_fee_lamports(600_000, 1_000), 600);
        // 1.4M CU at 10k micro-lamports = 14_000 lamports
        assert_eq!(priority_fee_lamports(1_400_000, 10_000), 14_000);
        // Truncation, not rounding
        assert_eq!(priority_fee_lamports(100, 1), 0);
    }

    #[test]
    fn test_fee_estimate_formula() {
        let params = FeeParams {
            base_fee_lamports: 5_000,
            rent_buffer_lamports: 2_000,
            cu_limit: 600_000,
            cu_price_micro_lamports: 1_000,
            tx_count: 2,
            sigs_per_tx: 3,
            tip_lamports: 7,
        };
        // 5000*2*3 + 2000*2 + 600*2 + 7
        assert_eq!(estimate_fee_lamports(&params), 30_000 + 4_000 + 1_200 + 7);
    }

    #[test]
    fn test_fixed_tip_independent_of_quotes() {
        let cfg = jito(TipMode::Fixed);
        assert_eq!(compute_tip(&cfg, true, 0, 0), 100_000);
        assert_eq!(compute_tip(&cfg, true, 1_000_000, 900_000), 100_000);
        assert_eq!(compute_tip(&cfg, false, 1, u128::MAX), 100_000);
    }

    #[test]
    fn test_dynamic_tip_clamps() {
        let cfg = jito(TipMode::Dynamic);

        // Non-positive gross: zero tip
        assert_eq!(compute_tip(&cfg, true, 1_000_000, 1_000_000), 0);
        assert_eq!(compute_tip(&cfg, true, 1_000_000, 900_000), 0);

        // raw = 10_000 * 2000 / 10_000 = 2_000 -> clamped up to min 5_000
        assert_eq!(compute_tip(&cfg, true, 1_000_000, 1_010_000), 5_000);

        // raw = 1_000_000 * 2000 / 10_000 = 200_000 -> clamped down to 50_000
        assert_eq!(compute_tip(&cfg, true, 1_000_000, 2_000_000), 50_000);

        // Non-native input falls back to the fixed amount
        assert_eq!(compute_tip(&cfg, false, 1_000_000, 2_000_000), 100_000);
    }

    #[test]
    fn test_tip_disabled() {
        let mut cfg = jito(TipMode::Dynamic);
        cfg.enabled = false;
        assert_eq!(compute_tip(&cfg, true, 0, u128::MAX), 0);
    }

    #[test]
    fn test_convert_fee_to_a_rounds_up() {
        // 5000 lamports at 1 SOL = 150 USDC-units: ceil(5000 * 150 / 1e9)
        assert_eq!(convert_fee_to_a(5_000, 150), 1);
        // Exact division stays exact
        assert_eq!(convert_fee_to_a(1_000_000_000, 150), 150);
        assert_eq!(convert_fee_to_a(500_000_000, 150), 75);
        // Just above an exact boundary rounds up
        assert_eq!(convert_fee_to_a(500_000_001, 150), 76);
        assert_eq!(convert_fee_to_a(0, 150), 0);
    }

    #[test]
    fn test_min_profit_in_a() {
        assert_eq!(min_profit_in_a(1_000, None, 5_000_000), 1_000);
        // floor(5_000_000 * 50 / 10_000) = 25_000 > 1_000
        assert_eq!(min_profit_in_a(1_000, Some(50), 5_000_000), 25_000);
        // Absolute floor wins when bps product is smaller
        assert_eq!(min_profit_in_a(1_000_000, Some(1), 5_000_000), 1_000_000);
        // Zero notional ignores bps
        assert_eq!(min_profit_in_a(1_000, Some(50), 0), 1_000);
    }
}
