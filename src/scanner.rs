// Per-pair scan: enumerate candidate sizes, quote legs, price fees,
// decide profitability
//
// Legs within one amount are sequential (leg N+1 spends leg N's min-out)
// and amounts within one scan are sequential. A 429 from a provider
// opens that provider's per-pair breaker and stops further quotes on it
// for the rest of the scan.

use anyhow::Result;
use serde_json::json;
use std::sync::Arc;
use tracing::debug;

use crate::config::{Config, ExecutionProvider, ExecutionStrategy};
use crate::decider::Decider;
use crate::event_log::{EventLog, EventType};
use crate::fee_model::{compute_tip, estimate_fee_lamports, min_profit_in_a, FeeConverter, FeeParams};
use crate::jupiter::{JupiterQuoteClient, QuoteRequest};
use crate::openocean::OpenOceanClient;
use crate::pairs::PairConfig;
use crate::rate_limiter::{is_http_429, PairBreaker};
use crate::types::{
    Candidate, LegQuote, LoopCandidate, Provider, TriangularCandidate, UltraLegs, NATIVE_MINT,
};
use crate::ultra::UltraClient;

/// Shared handles consumed by every scan
pub struct ScanContext {
    pub cfg: Arc<Config>,
    pub jupiter: Arc<JupiterQuoteClient>,
    pub ultra: Arc<UltraClient>,
    pub openocean: Option<Arc<OpenOceanClient>>,
    pub fee_converter: Arc<FeeConverter>,
    pub decider: Arc<Decider>,
    pub breaker: Arc<PairBreaker>,
    pub events: Arc<EventLog>,
    pub wallet_pubkey: String,
}

#[derive(Debug, Default)]
pub struct ScanOutcome {
    pub candidates: Vec<Candidate>,
}

impl ScanOutcome {
    /// argmax by conservative profit, first-seen wins ties
    pub fn best(&self) -> Option<&Candidate> {
        best_candidate(&self.candidates)
    }
}

pub fn best_candidate(candidates: &[Candidate]) -> Option<&Candidate> {
    let mut best: Option<&Candidate> = None;
    for candidate in candidates {
        match best {
            Some(current)
                if current.decision().conservative_profit
                    >= candidate.decision().conservative_profit => {}
            _ => best = Some(candidate),
        }
    }
    best
}

/// Conservative profit of a candidate in bps of its notional
pub fn conservative_bps(candidate: &Candidate) -> i128 {
    let amount = candidate.amount_a() as i128;
    if amount == 0 {
        return 0;
    }
    candidate.decision().conservative_profit * 10_000 / amount
}

/// Amount list for one scan: override (when present and non-empty), else
/// configured steps, else the single default size. Non-decimal entries
/// are dropped, sizes strictly above maxNotionalA are cut, duplicates
/// collapse to the first occurrence.
pub fn build_amount_list(pair: &PairConfig, amount_override: Option<&[String]>) -> Vec<u128> {
    let source: Vec<String> = match amount_override {
        Some(list) if !list.is_empty() => list.to_vec(),
        _ => pair
            .amount_a_steps
            .clone()
            .unwrap_or_else(|| vec![pair.amount_a.clone()]),
    };

    let max_notional = pair.max_notional_atomic();
    let mut seen = std::collections::HashSet::new();
    source
        .iter()
        .filter(|s| crate::types::is_decimal_string(s))
        .filter_map(|s| s.parse::<u128>().ok())
        .filter(|amount| match max_notional {
            Some(max) => *amount <= max,
            None => true,
        })
        .filter(|amount| seen.insert(*amount))
        .collect()
}

fn fee_params(
    cfg: &Config,
    pair: &PairConfig,
    tx_count: u64,
    sigs_per_tx: u64,
    tip_lamports: u64,
) -> FeeParams {
    FeeParams {
        base_fee_lamports: pair.base_fee_lamports.unwrap_or(cfg.fees.base_fee_lamports),
        rent_buffer_lamports: pair
            .rent_buffer_lamports
            .unwrap_or(cfg.fees.rent_buffer_lamports),
        cu_limit: pair.cu_limit.unwrap_or(cfg.fees.cu_limit),
        cu_price_micro_lamports: pair
            .cu_price_micro_lamports
            .unwrap_or(cfg.fees.cu_price_micro_lamports),
        tx_count,
        sigs_per_tx,
        tip_lamports,
    }
}

impl ScanContext {
    async fn jupiter_leg(
        &self,
        pair: &PairConfig,
        input_mint: &str,
        output_mint: &str,
        amount: u128,
        leg_idx: usize,
    ) -> Result<LegQuote> {
        self.jupiter
            .quote_exact_in(&QuoteRequest {
                input_mint: input_mint.to_string(),
                output_mint: output_mint.to_string(),
                amount,
                slippage_bps: pair.leg_slippage(leg_idx),
                include_dexes: pair.include_dexes.clone(),
                exclude_dexes: pair.exclude_dexes.clone(),
            })
            .await
    }

    async fn emit_candidate(&self, candidate: &Candidate, provider: Provider) {
        let decision = candidate.decision();
        self.events
            .emit(
                EventType::Candidate,
                json!({
                    "pair": candidate.pair(),
                    "provider": provider.as_str(),
                    "legs": candidate.leg_count(),
                    "amountA": candidate.amount_a().to_string(),
                    "tipLamports": candidate.tip_lamports(),
                    "feeLamports": candidate.fee_lamports(),
                    "profit": decision.profit.to_string(),
                    "conservativeProfit": decision.conservative_profit.to_string(),
                    "profitable": decision.profitable,
                }),
            )
            .await;
    }

    /// On quote failure: log, and when it is a 429 trip the breaker
    async fn handle_leg_error(&self, provider: Provider, pair: &PairConfig, err: &anyhow::Error) -> bool {
        self.events
            .emit(
                EventType::CandidateError,
                json!({
                    "pair": pair.name,
                    "provider": provider.as_str(),
                    "error": format!("{:#}", err),
                }),
            )
            .await;

        if is_http_429(err) {
            let (cooldown, snapshot) = match provider {
                Provider::Jupiter => (
                    self.cfg.jupiter.rate.cooldown_429_ms,
                    Some(self.jupiter.limiter().snapshot()),
                ),
                Provider::OpenOcean => (
                    self.cfg.openocean.rate.cooldown_429_ms,
                    self.openocean.as_ref().map(|oo| oo.limiter().snapshot()),
                ),
            };
            self.breaker.open(provider, &pair.name, cooldown);
            self.events
                .emit(
                    EventType::RateLimit,
                    json!({
                        "pair": pair.name,
                        "provider": provider.as_str(),
                        "cooldownMs": cooldown,
                        "limiter": snapshot,
                    }),
                )
                .await;
            return true;
        }
        false
    }

    async fn decide_candidate(
        &self,
        amount: u128,
        last_leg: &LegQuote,
        fee_in_a: u128,
        min_profit: u128,
    ) -> crate::types::Decision {
        self.decider
            .decide(
                amount,
                last_leg.out_amount,
                last_leg.min_out_amount,
                fee_in_a,
                min_profit,
            )
            .await
    }

    async fn loop_candidate(
        &self,
        pair: &PairConfig,
        amount: u128,
        use_ultra: bool,
    ) -> Result<Candidate> {
        let a_is_native = pair.a_mint == NATIVE_MINT;
        let sequential = self.cfg.execution_strategy == ExecutionStrategy::Sequential;

        let (leg1, leg2, ultra_legs) = if use_ultra {
            let order1 = self
                .ultra
                .order(
                    &pair.a_mint,
                    &pair.b_mint,
                    amount,
                    &self.wallet_pubkey,
                    pair.exclude_dexes.as_deref(),
                )
                .await?;
            let order2 = self
                .ultra
                .order(
                    &pair.b_mint,
                    &pair.a_mint,
                    order1.quote.min_out_amount,
                    &self.wallet_pubkey,
                    pair.exclude_dexes.as_deref(),
                )
                .await?;
            (
                order1.quote.clone(),
                order2.quote.clone(),
                Some(UltraLegs { order1, order2 }),
            )
        } else {
            let leg1 = self
                .jupiter_leg(pair, &pair.a_mint, &pair.b_mint, amount, 0)
                .await?;
            let leg2 = self
                .jupiter_leg(pair, &pair.b_mint, &pair.a_mint, leg1.min_out_amount, 1)
                .await?;
            (leg1, leg2, None)
        };

        let tip = compute_tip(&self.cfg.jito, a_is_native, amount, leg2.min_out_amount);
        // One tx atomic, two for sequential (ultra is always sequential)
        let tx_count = if sequential || use_ultra { 2 } else { 1 };
        let fee_lamports = estimate_fee_lamports(&fee_params(&self.cfg, pair, tx_count, 1, tip));
        let fee_in_a = self
            .fee_converter
            .fee_in_a(
                &pair.name,
                &pair.a_mint,
                pair.slippage_bps,
                Provider::Jupiter,
                pair.cooldown_ms,
                fee_lamports,
            )
            .await?;
        let min_profit = min_profit_in_a(pair.min_profit_a_atomic(), pair.min_profit_bps, amount);
        let decision = self
            .decide_candidate(amount, &leg2, fee_in_a, min_profit)
            .await;

        Ok(Candidate::Loop(LoopCandidate {
            pair: pair.name.clone(),
            amount_a: amount,
            leg1,
            leg2,
            ultra: ultra_legs,
            tip_lamports: tip,
            fee_lamports,
            fee_in_a,
            decision,
        }))
    }

    async fn triangular_candidate(&self, pair: &PairConfig, amount: u128) -> Result<Candidate> {
        let c_mint = pair.c_mint.as_deref().expect("triangular pair");
        let a_is_native = pair.a_mint == NATIVE_MINT;

        let leg1 = self
            .jupiter_leg(pair, &pair.a_mint, &pair.b_mint, amount, 0)
            .await?;
        let leg2 = self
            .jupiter_leg(pair, &pair.b_mint, c_mint, leg1.min_out_amount, 1)
            .await?;
        let leg3 = self
            .jupiter_leg(pair, c_mint, &pair.a_mint, leg2.min_out_amount, 2)
            .await?;

        let tip = compute_tip(&self.cfg.jito, a_is_native, amount, leg3.min_out_amount);
        let fee_lamports = estimate_fee_lamports(&fee_params(&self.cfg, pair, 1, 1, tip));
        let fee_in_a = self
            .fee_converter
            .fee_in_a(
                &pair.name,
                &pair.a_mint,
                pair.slippage_bps,
                Provider::Jupiter,
                pair.cooldown_ms,
                fee_lamports,
            )
            .await?;
        let min_profit = min_profit_in_a(pair.min_profit_a_atomic(), pair.min_profit_bps, amount);
        let decision = self
            .decide_candidate(amount, &leg3, fee_in_a, min_profit)
            .await;

        Ok(Candidate::Triangular(TriangularCandidate {
            pair: pair.name.clone(),
            amount_a: amount,
            leg1,
            leg2,
            leg3,
            tip_lamports: tip,
            fee_lamports,
            fee_in_a,
            decision,
        }))
    }

    async fn secondary_candidate(&self, pair: &PairConfig, amount: u128) -> Result<Candidate> {
        let openocean = self
            .openocean
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("openocean client not configured"))?;
        let a_is_native = pair.a_mint == NATIVE_MINT;

        let leg1 = openocean
            .quote_exact_in(&pair.a_mint, &pair.b_mint, amount, pair.leg_slippage(0))
            .await?;
        let leg2 = openocean
            .quote_exact_in(
                &pair.b_mint,
                &pair.a_mint,
                leg1.min_out_amount,
                pair.leg_slippage(1),
            )
            .await?;

        let tip = compute_tip(&self.cfg.jito, a_is_native, amount, leg2.min_out_amount);
        let fee_lamports = estimate_fee_lamports(&fee_params(
            &self.cfg,
            pair,
            2,
            self.cfg.openocean.sigs_estimate as u64,
            tip,
        ));
        let fee_in_a = self
            .fee_converter
            .fee_in_a(
                &pair.name,
                &pair.a_mint,
                pair.slippage_bps,
                Provider::OpenOcean,
                pair.cooldown_ms,
                fee_lamports,
            )
            .await?;
        let min_profit = min_profit_in_a(pair.min_profit_a_atomic(), pair.min_profit_bps, amount);
        let decision = self
            .decide_candidate(amount, &leg2, fee_in_a, min_profit)
            .await;

        Ok(Candidate::LoopSecondary(LoopCandidate {
            pair: pair.name.clone(),
            amount_a: amount,
            leg1,
            leg2,
            ultra: None,
            tip_lamports: tip,
            fee_lamports,
            fee_in_a,
            decision,
        }))
    }

    /// Whether the Secondary second opinion is worth its budget, given
    /// the best Primary candidate. Ok(()) = fetch it.
    fn secondary_gate(&self, best_primary: &Candidate) -> std::result::Result<(), &'static str> {
        let bps = conservative_bps(best_primary);
        let gate = self.cfg.openocean.gate_bps as i128;
        let near = self.cfg.openocean.near_gate_bps as i128;
        if bps < gate {
            return Err("below-gate");
        }
        if near > 0 && bps > gate + near {
            return Err("above-near-gate");
        }
        Ok(())
    }

    /// Scan one pair. `amount_override` comes from the trigger's
    /// amount-mode rotation; `use_secondary` from its tick gating.
    pub async fn scan_pair(
        &self,
        pair: &PairConfig,
        amount_override: Option<&[String]>,
        use_secondary: bool,
    ) -> Result<ScanOutcome> {
        let mut outcome = ScanOutcome::default();

        // Primary breaker open: nothing to scan
        if let Some(remaining) = self.breaker.remaining_ms(Provider::Jupiter, &pair.name) {
            self.events
                .emit(
                    EventType::Skip,
                    json!({
                        "pair": pair.name,
                        "reason": "rate-limited",
                        "provider": Provider::Jupiter.as_str(),
                        "cooldownMsRemaining": remaining,
                    }),
                )
                .await;
            return Ok(outcome);
        }

        let amounts = build_amount_list(pair, amount_override);
        if amounts.is_empty() {
            self.events
                .emit(
                    EventType::Skip,
                    json!({"pair": pair.name, "reason": "no-amounts"}),
                )
                .await;
            return Ok(outcome);
        }

        let use_ultra = self.cfg.execution_provider == ExecutionProvider::Ultra
            && !pair.is_triangular()
            && pair.a_mint == NATIVE_MINT
            && self.cfg.execution_strategy == ExecutionStrategy::Sequential;

        for &amount in &amounts {
            let result = if pair.is_triangular() {
                self.triangular_candidate(pair, amount).await
            } else {
                self.loop_candidate(pair, amount, use_ultra).await
            };

            match result {
                Ok(candidate) => {
                    self.emit_candidate(&candidate, Provider::Jupiter).await;
                    outcome.candidates.push(candidate);
                }
                Err(e) => {
                    let tripped = self.handle_leg_error(Provider::Jupiter, pair, &e).await;
                    if tripped {
                        // Stop hammering the provider for this scan
                        break;
                    }
                }
            }
        }

        // Secondary second opinion: loop pairs, sequential strategy only
        if use_secondary
            && self.cfg.openocean.enabled
            && self.openocean.is_some()
            && !pair.is_triangular()
            && self.cfg.execution_strategy == ExecutionStrategy::Sequential
            && !outcome.candidates.is_empty()
        {
            self.scan_secondary(pair, &mut outcome).await;
        }

        let best = outcome.best();
        self.events
            .emit(
                EventType::ScanSummary,
                json!({
                    "pair": pair.name,
                    "amounts": amounts.len(),
                    "candidates": outcome.candidates.len(),
                    "bestConservativeProfit": best
                        .map(|c| c.decision().conservative_profit.to_string()),
                    "bestProfitable": best.map(|c| c.decision().profitable),
                }),
            )
            .await;

        Ok(outcome)
    }

    async fn scan_secondary(&self, pair: &PairConfig, outcome: &mut ScanOutcome) {
        let Some(best_primary) = outcome.best().cloned() else {
            return;
        };

        if let Err(reason) = self.secondary_gate(&best_primary) {
            self.events
                .emit(
                    EventType::OpenOceanSkip,
                    json!({
                        "pair": pair.name,
                        "reason": reason,
                        "primaryBps": conservative_bps(&best_primary).to_string(),
                    }),
                )
                .await;
            return;
        }

        if let Some(remaining) = self.breaker.remaining_ms(Provider::OpenOcean, &pair.name) {
            self.events
                .emit(
                    EventType::Skip,
                    json!({
                        "pair": pair.name,
                        "reason": "rate-limited",
                        "provider": Provider::OpenOcean.as_str(),
                        "cooldownMsRemaining": remaining,
                    }),
                )
                .await;
            return;
        }

        debug!("🌊 second opinion for {} @ {}", pair.name, best_primary.amount_a());
        match self.secondary_candidate(pair, best_primary.amount_a()).await {
            Ok(candidate) => {
                self.emit_candidate(&candidate, Provider::OpenOcean).await;
                outcome.candidates.push(candidate);
            }
            Err(e) => {
                self.handle_leg_error(Provider::OpenOcean, pair, &e).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Decision, LoopCandidate, QuoteRoute};

    fn pair_with(steps: Option<Vec<&str>>, max: Option<&str>) -> PairConfig {
        serde_json::from_value(json!({
            "name": "SOL/USDC",
            "aMint": NATIVE_MINT,
            "bMint": "EPjFWdd5AufqSSqeM2qN1xzybapC8G4wEGGkZwyTDt1v",
            "slippageBps": 50,
            "amountA": "1000000",
            "amountASteps": steps,
            "maxNotionalA": max,
        }))
        .unwrap()
    }

    fn candidate(amount: u128, conservative: i128) -> Candidate {
        let quote = LegQuote {
            provider: Provider::Jupiter,
            input_mint: NATIVE_MINT.to_string(),
            output_mint: NATIVE_MINT.to_string(),
            in_amount: amount,
            out_amount: 0,
            min_out_amount: 0,
            slippage_bps: 50,
            route: QuoteRoute::Jupiter(serde_json::Value::Null),
        };
        Candidate::Loop(LoopCandidate {
            pair: "SOL/USDC".to_string(),
            amount_a: amount,
            leg1: quote.clone(),
            leg2: quote,
            ultra: None,
            tip_lamports: 0,
            fee_lamports: 0,
            fee_in_a: 0,
            decision: Decision {
                profit: conservative,
                conservative_profit: conservative,
                profitable: conservative > 0,
            },
        })
    }

    #[test]
    fn test_amount_list_default_and_steps() {
        let pair = pair_with(None, None);
        assert_eq!(build_amount_list(&pair, None), vec![1_000_000]);

        let pair = pair_with(Some(vec!["100", "200", "100"]), None);
        assert_eq!(build_amount_list(&pair, None), vec![100, 200]);
    }

    #[test]
    fn test_amount_list_override_wins() {
        let pair = pair_with(Some(vec!["100"]), None);
        let over = vec!["500".to_string(), "bad".to_string(), "700".to_string()];
        assert_eq!(build_amount_list(&pair, Some(&over)), vec![500, 700]);
        // Empty override falls through to configured steps
        assert_eq!(build_amount_list(&pair, Some(&[])), vec![100]);
    }

    #[test]
    fn test_amount_list_max_notional_is_strict() {
        let pair = pair_with(Some(vec!["100", "200", "201"]), Some("200"));
        // Exactly at the ceiling survives; strictly greater is cut
        assert_eq!(build_amount_list(&pair, None), vec![100, 200]);
    }

    #[test]
    fn test_best_candidate_tie_break_first_seen() {
        let candidates = vec![candidate(100, 5), candidate(200, 9), candidate(300, 9)];
        let best = best_candidate(&candidates).unwrap();
        assert_eq!(best.amount_a(), 200, "first of the tied maxima wins");
        assert!(best_candidate(&[]).is_none());
    }

    #[test]
    fn test_conservative_bps() {
        // 5_000 on 1_000_000 = 50 bps
        assert_eq!(conservative_bps(&candidate(1_000_000, 5_000)), 50);
        assert_eq!(conservative_bps(&candidate(1_000_000, -10_000)), -100);
        assert_eq!(conservative_bps(&candidate(0, 5_000)), 0);
    }
}
