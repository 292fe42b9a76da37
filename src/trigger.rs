// Trigger engine: observe/execute windows around the scanner
//
// Four strategies share one window state machine
// (IDLE → OBSERVING → (READY | INSUFFICIENT) → EXECUTING → (FIRED | EXPIRED)):
//
//   immediate  one scan, fire iff best is profitable
//   average    observe collects positive conservative profits, execute
//              fires on the first best >= average (and profitable)
//   vwap       EMA of per-tick VWAP ppm; arm at target ppm, fire on a
//              trailing stop from the post-arm peak
//   bollinger  vwap plus EWM variance; arm at EMA + k*sigma, optional
//              emergency fire at EMA + emergencySigma*sigma
//
// Transitions are deadline-driven except FIRED. The stop signal is
// honored between ticks.

use anyhow::Result;
use serde_json::json;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing::debug;

use crate::config::{AmountMode, TriggerStrategy};
use crate::event_log::EventType;
use crate::pairs::PairConfig;
use crate::scanner::{ScanContext, ScanOutcome};
use crate::types::Candidate;

/// Single-pass EMA + exponentially weighted variance over tick signals
#[derive(Debug, Clone, Default)]
pub struct WindowStats {
    pub ema: f64,
    pub ewm_var: f64,
    pub samples: u32,
    pub max_ppm: f64,
}

impl WindowStats {
    pub fn update(&mut self, alpha: f64, x: f64) {
        if !x.is_finite() {
            return;
        }
        if self.samples == 0 {
            self.ema = x;
            self.ewm_var = 0.0;
            self.max_ppm = x;
        } else {
            let delta = x - self.ema;
            self.ema += alpha * delta;
            self.ewm_var = (1.0 - alpha) * (self.ewm_var + alpha * delta * delta);
            self.max_ppm = self.max_ppm.max(x);
        }
        self.samples += 1;
    }

    pub fn sigma(&self) -> f64 {
        self.ewm_var.max(0.0).sqrt()
    }

    pub fn upper_band(&self, k: f64) -> f64 {
        self.ema + k * self.sigma()
    }
}

/// alpha = 0 selects the classic 2/(N+1) over the observe window
pub fn effective_alpha(alpha: f64, observe_ms: u64, observe_interval_ms: u64) -> f64 {
    if alpha > 0.0 {
        return alpha;
    }
    let n = (observe_ms / observe_interval_ms.max(1)).max(1) as f64;
    (2.0 / (n + 1.0)).clamp(0.01, 1.0)
}

/// Per-tick VWAP profit signal in ppm of notional:
/// (sum of conservative profits) * 1e6 / (sum of amounts)
pub fn tick_vwap_ppm(outcome: &ScanOutcome) -> Option<f64> {
    let mut profit_sum = 0i128;
    let mut amount_sum = 0u128;
    for candidate in &outcome.candidates {
        profit_sum += candidate.decision().conservative_profit;
        amount_sum += candidate.amount_a();
    }
    if amount_sum == 0 {
        return None;
    }
    Some(profit_sum as f64 * 1e6 / amount_sum as f64)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrailAction {
    Idle,
    Armed,
    Fire,
}

/// Arm-then-trailing-stop tracker for the execute phase
#[derive(Debug, Clone, Default)]
pub struct TrailState {
    pub armed: bool,
    pub peak: f64,
    pub declines: u32,
}

impl TrailState {
    pub fn on_tick(
        &mut self,
        ppm: f64,
        arm_threshold: f64,
        drop_ppm: f64,
        lookback: u32,
    ) -> TrailAction {
        if !self.armed {
            if ppm >= arm_threshold {
                self.armed = true;
                self.peak = ppm;
                self.declines = 0;
                return TrailAction::Armed;
            }
            return TrailAction::Idle;
        }

        if ppm > self.peak {
            self.peak = ppm;
            self.declines = 0;
            return TrailAction::Idle;
        }
        if self.peak - ppm >= drop_ppm && ppm < self.peak {
            self.declines += 1;
            if self.declines >= lookback.max(1) {
                return TrailAction::Fire;
            }
        } else {
            self.declines = 0;
        }
        TrailAction::Idle
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Single,
    Observe,
    Execute,
}

impl Phase {
    fn as_str(&self) -> &'static str {
        match self {
            Phase::Single => "single",
            Phase::Observe => "observe",
            Phase::Execute => "execute",
        }
    }
}

/// Secondary usage gate inside a window: phase flags, every-N-ticks
/// thinning, and force-on once a strategy has armed
pub fn secondary_allowed(
    enabled: bool,
    phase: Phase,
    tick: u32,
    every_n_ticks: u32,
    use_in_observe: bool,
    use_in_execute: bool,
    armed: bool,
) -> bool {
    if !enabled {
        return false;
    }
    if armed {
        return true;
    }
    let phase_ok = match phase {
        Phase::Single => true,
        Phase::Observe => use_in_observe,
        Phase::Execute => use_in_execute,
    };
    phase_ok && tick % every_n_ticks.max(1) == 0
}

/// Sizes the trigger hands to the scanner for one tick.
/// `fixed` picks k sizes from the preferred index once per window;
/// `rotate` advances a persistent cursor by k per tick.
pub fn select_amounts(
    mode: AmountMode,
    sizes: &[String],
    preferred: &str,
    max_per_tick: usize,
    cursor: &mut usize,
) -> Option<Vec<String>> {
    if sizes.is_empty() {
        return None;
    }
    let k = max_per_tick.max(1).min(sizes.len());
    match mode {
        AmountMode::All => None,
        AmountMode::Fixed => {
            let start = sizes.iter().position(|s| s == preferred).unwrap_or(0);
            Some((0..k).map(|i| sizes[(start + i) % sizes.len()].clone()).collect())
        }
        AmountMode::Rotate => {
            let start = *cursor % sizes.len();
            let picked = (0..k)
                .map(|i| sizes[(start + i) % sizes.len()].clone())
                .collect();
            *cursor = (start + k) % sizes.len();
            Some(picked)
        }
    }
}

struct WindowRun<'a> {
    ctx: &'a ScanContext,
    pair: &'a PairConfig,
    sizes: Vec<String>,
    fixed_amounts: Option<Vec<String>>,
    rotate_cursor: &'a mut usize,
    shutdown: &'a mut broadcast::Receiver<()>,
    armed: bool,
}

impl<'a> WindowRun<'a> {
    fn new(
        ctx: &'a ScanContext,
        pair: &'a PairConfig,
        rotate_cursor: &'a mut usize,
        shutdown: &'a mut broadcast::Receiver<()>,
    ) -> Self {
        let sizes = pair
            .amount_a_steps
            .clone()
            .unwrap_or_else(|| vec![pair.amount_a.clone()]);
        // Fixed mode chooses its window slice once, up front
        let fixed_amounts = match ctx.cfg.trigger.amount_mode {
            AmountMode::Fixed => {
                let mut scratch = 0usize;
                select_amounts(
                    AmountMode::Fixed,
                    &sizes,
                    &pair.amount_a,
                    ctx.cfg.trigger.max_amounts_per_tick,
                    &mut scratch,
                )
            }
            _ => None,
        };
        Self {
            ctx,
            pair,
            sizes,
            fixed_amounts,
            rotate_cursor,
            shutdown,
            armed: false,
        }
    }

    async fn tick(&mut self, phase: Phase, tick: u32) -> Result<ScanOutcome> {
        let trigger = &self.ctx.cfg.trigger;
        let oo = &self.ctx.cfg.openocean;

        let amount_override = match trigger.amount_mode {
            AmountMode::All => None,
            AmountMode::Fixed => self.fixed_amounts.clone(),
            AmountMode::Rotate => select_amounts(
                AmountMode::Rotate,
                &self.sizes,
                &self.pair.amount_a,
                trigger.max_amounts_per_tick,
                self.rotate_cursor,
            ),
        };

        let use_secondary = secondary_allowed(
            oo.enabled,
            phase,
            tick,
            oo.every_n_ticks,
            oo.use_in_observe,
            oo.use_in_execute,
            self.armed,
        );

        self.ctx
            .scan_pair(self.pair, amount_override.as_deref(), use_secondary)
            .await
    }

    /// Sleep one interval; false when the stop signal arrived
    async fn pause(&mut self, interval_ms: u64) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_millis(interval_ms)) => true,
            _ = self.shutdown.recv() => false,
        }
    }

    async fn emit(&self, ty: EventType, fields: serde_json::Value) {
        self.ctx.events.emit(ty, fields).await;
    }

    async fn skip(&self, reason: &str, extra: serde_json::Value) {
        let mut fields = json!({"pair": self.pair.name, "reason": reason});
        if let (Some(obj), Some(extra)) = (fields.as_object_mut(), extra.as_object()) {
            for (key, value) in extra {
                obj.insert(key.clone(), value.clone());
            }
        }
        self.emit(EventType::Skip, fields).await;
    }
}

/// Run one trigger window for the pair. Returns the candidate to execute
/// when the strategy fired.
pub async fn run_window(
    ctx: &ScanContext,
    pair: &PairConfig,
    rotate_cursor: &mut usize,
    shutdown: &mut broadcast::Receiver<()>,
) -> Result<Option<Candidate>> {
    let strategy = ctx.cfg.trigger.strategy;
    let mut run = WindowRun::new(ctx, pair, rotate_cursor, shutdown);
    match strategy {
        TriggerStrategy::Immediate => immediate(&mut run).await,
        TriggerStrategy::Average => average(&mut run).await,
        TriggerStrategy::Vwap => banded(&mut run, false).await,
        TriggerStrategy::Bollinger => banded(&mut run, true).await,
    }
}

async fn immediate(run: &mut WindowRun<'_>) -> Result<Option<Candidate>> {
    let outcome = run.tick(Phase::Single, 0).await?;
    let Some(best) = outcome.best() else {
        run.skip("no-candidates", json!({})).await;
        return Ok(None);
    };
    if !best.decision().profitable {
        run.skip("not-profitable", json!({})).await;
        return Ok(None);
    }
    run.emit(
        EventType::TriggerFire,
        json!({
            "pair": run.pair.name,
            "strategy": "immediate",
            "reason": "profitable",
            "conservativeProfit": best.decision().conservative_profit.to_string(),
        }),
    )
    .await;
    Ok(Some(best.clone()))
}

async fn average(run: &mut WindowRun<'_>) -> Result<Option<Candidate>> {
    let trigger = run.ctx.cfg.trigger.clone();
    run.emit(
        EventType::TriggerStart,
        json!({
            "pair": run.pair.name,
            "strategy": "average",
            "phase": Phase::Observe.as_str(),
            "observeMs": trigger.observe_ms,
        }),
    )
    .await;

    // OBSERVING: collect positive conservative profits of per-tick bests
    let mut positives: Vec<i128> = Vec::new();
    let observe_deadline = Instant::now() + Duration::from_millis(trigger.observe_ms);
    let mut tick = 0u32;
    while Instant::now() < observe_deadline {
        let outcome = run.tick(Phase::Observe, tick).await?;
        if let Some(best) = outcome.best() {
            let profit = best.decision().conservative_profit;
            if profit > 0 {
                positives.push(profit);
            }
        }
        tick += 1;
        if !run.pause(trigger.observe_interval_ms).await {
            return Ok(None);
        }
    }

    let average: i128 = if positives.is_empty() {
        0
    } else {
        positives.iter().sum::<i128>() / positives.len() as i128
    };
    run.emit(
        EventType::TriggerStats,
        json!({
            "pair": run.pair.name,
            "strategy": "average",
            "samples": positives.len(),
            "average": average.to_string(),
        }),
    )
    .await;

    // EXECUTING: first profitable best clearing the observed average
    let execute_deadline = Instant::now() + Duration::from_millis(trigger.execute_ms);
    let mut tick = 0u32;
    while Instant::now() < execute_deadline {
        let outcome = run.tick(Phase::Execute, tick).await?;
        if let Some(best) = outcome.best() {
            let decision = best.decision();
            if decision.profitable && decision.conservative_profit >= average {
                run.emit(
                    EventType::TriggerFire,
                    json!({
                        "pair": run.pair.name,
                        "strategy": "average",
                        "reason": "above-average",
                        "average": average.to_string(),
                        "conservativeProfit": decision.conservative_profit.to_string(),
                    }),
                )
                .await;
                return Ok(Some(best.clone()));
            }
        }
        tick += 1;
        if !run.pause(trigger.execute_interval_ms).await {
            return Ok(None);
        }
    }

    run.skip("window-expired", json!({"strategy": "average"})).await;
    Ok(None)
}

/// Shared vwap / bollinger window. `use_band` selects the Bollinger
/// upper band as the arming threshold and enables emergency sigma.
async fn banded(run: &mut WindowRun<'_>, use_band: bool) -> Result<Option<Candidate>> {
    let trigger = run.ctx.cfg.trigger.clone();
    let strategy_name = if use_band { "bollinger" } else { "vwap" };
    let alpha = effective_alpha(trigger.alpha, trigger.observe_ms, trigger.observe_interval_ms);
    let mut stats = WindowStats::default();

    run.emit(
        EventType::TriggerStart,
        json!({
            "pair": run.pair.name,
            "strategy": strategy_name,
            "phase": Phase::Observe.as_str(),
            "observeMs": trigger.observe_ms,
            "alpha": alpha,
        }),
    )
    .await;

    // OBSERVING
    let observe_deadline = Instant::now() + Duration::from_millis(trigger.observe_ms);
    let mut tick = 0u32;
    while Instant::now() < observe_deadline {
        let outcome = run.tick(Phase::Observe, tick).await?;
        if let Some(ppm) = tick_vwap_ppm(&outcome) {
            stats.update(alpha, ppm);
        }

        // Emergency break-through is live during observe once the
        // sample floor is met
        if use_band && trigger.emergency_sigma > 0.0 && stats.samples >= trigger.min_samples {
            if let Some(best) = outcome.best() {
                let best_ppm = best.conservative_ppm();
                let threshold = stats.upper_band(trigger.emergency_sigma);
                if best_ppm >= threshold && best.decision().profitable {
                    run.emit(
                        EventType::TriggerFire,
                        json!({
                            "pair": run.pair.name,
                            "strategy": strategy_name,
                            "reason": "emergency-sigma",
                            "phase": Phase::Observe.as_str(),
                            "ppm": best_ppm,
                            "threshold": threshold,
                        }),
                    )
                    .await;
                    return Ok(Some(best.clone()));
                }
            }
        }
        tick += 1;
        if !run.pause(trigger.observe_interval_ms).await {
            return Ok(None);
        }
    }

    // READY | INSUFFICIENT
    if stats.samples < trigger.min_samples {
        run.skip(
            "insufficient-samples",
            json!({
                "strategy": strategy_name,
                "samples": stats.samples,
                "minSamples": trigger.min_samples,
            }),
        )
        .await;
        return Ok(None);
    }

    let arm_threshold = if use_band {
        stats.upper_band(trigger.bollinger_k)
    } else {
        trigger.target_ppm
    };
    run.emit(
        EventType::TriggerStats,
        json!({
            "pair": run.pair.name,
            "strategy": strategy_name,
            "samples": stats.samples,
            "ema": stats.ema,
            "sigma": stats.sigma(),
            "maxPpm": stats.max_ppm,
            "armThreshold": arm_threshold,
        }),
    )
    .await;

    // EXECUTING: arm then trail
    let mut trail = TrailState::default();
    let execute_deadline = Instant::now() + Duration::from_millis(trigger.execute_ms);
    let mut tick = 0u32;
    while Instant::now() < execute_deadline {
        let outcome = run.tick(Phase::Execute, tick).await?;
        if let Some(best) = outcome.best() {
            let best_ppm = best.conservative_ppm();

            if use_band && trigger.emergency_sigma > 0.0 {
                let threshold = stats.upper_band(trigger.emergency_sigma);
                if best_ppm >= threshold && best.decision().profitable {
                    run.emit(
                        EventType::TriggerFire,
                        json!({
                            "pair": run.pair.name,
                            "strategy": strategy_name,
                            "reason": "emergency-sigma",
                            "phase": Phase::Execute.as_str(),
                            "ppm": best_ppm,
                            "threshold": threshold,
                        }),
                    )
                    .await;
                    return Ok(Some(best.clone()));
                }
            }

            match trail.on_tick(
                best_ppm,
                arm_threshold,
                trigger.trail_drop_ppm,
                trigger.lookback,
            ) {
                TrailAction::Armed => {
                    run.armed = true;
                    run.emit(
                        EventType::TriggerArm,
                        json!({
                            "pair": run.pair.name,
                            "strategy": strategy_name,
                            "ppm": best_ppm,
                            "amountA": best.amount_a().to_string(),
                            "armThreshold": arm_threshold,
                        }),
                    )
                    .await;
                }
                TrailAction::Fire => {
                    if best.decision().profitable {
                        run.emit(
                            EventType::TriggerFire,
                            json!({
                                "pair": run.pair.name,
                                "strategy": strategy_name,
                                "reason": "trailing-stop",
                                "ppm": best_ppm,
                                "peak": trail.peak,
                            }),
                        )
                        .await;
                        return Ok(Some(best.clone()));
                    }
                    run.skip("not-profitable", json!({"strategy": strategy_name}))
                        .await;
                    return Ok(None);
                }
                TrailAction::Idle => {
                    debug!(
                        "{} {}: ppm {:.1} (peak {:.1}, declines {})",
                        strategy_name, run.pair.name, best_ppm, trail.peak, trail.declines
                    );
                }
            }
        }
        tick += 1;
        if !run.pause(trigger.execute_interval_ms).await {
            return Ok(None);
        }
    }

    run.skip("window-expired", json!({"strategy": strategy_name})).await;
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_effective_alpha_auto() {
        // N = 30_000 / 1_000 = 30 -> 2/31
        let alpha = effective_alpha(0.0, 30_000, 1_000);
        assert!((alpha - 2.0 / 31.0).abs() < 1e-12);
        // Explicit alpha passes through
        assert_eq!(effective_alpha(0.4, 30_000, 1_000), 0.4);
        // Tiny windows clamp high
        assert_eq!(effective_alpha(0.0, 1_000, 1_000), 1.0);
        // Huge windows clamp at 0.01
        assert_eq!(effective_alpha(0.0, 10_000_000, 1_000), 0.01);
    }

    #[test]
    fn test_window_stats_ema_and_variance() {
        let mut stats = WindowStats::default();
        stats.update(0.5, 100.0);
        assert_eq!(stats.ema, 100.0);
        assert_eq!(stats.sigma(), 0.0);
        assert_eq!(stats.samples, 1);

        stats.update(0.5, 200.0);
        // ema = 100 + 0.5*100 = 150
        assert!((stats.ema - 150.0).abs() < 1e-9);
        // ewm_var = 0.5 * (0 + 0.5*100^2) = 2500
        assert!((stats.ewm_var - 2500.0).abs() < 1e-9);
        assert!((stats.sigma() - 50.0).abs() < 1e-9);

        // Non-finite signals are ignored
        stats.update(0.5, f64::NAN);
        assert_eq!(stats.samples, 2);
    }

    #[test]
    fn test_trailing_stop_fires_after_consecutive_declines() {
        // upper = 46; ticks 50 (arm), 49, 48 -> fire after 2 declines
        let mut trail = TrailState::default();
        assert_eq!(trail.on_tick(50.0, 46.0, 1.0, 2), TrailAction::Armed);
        assert_eq!(trail.on_tick(49.0, 46.0, 1.0, 2), TrailAction::Idle);
        assert_eq!(trail.declines, 1);
        assert_eq!(trail.on_tick(48.0, 46.0, 1.0, 2), TrailAction::Fire);
    }

    #[test]
    fn test_trailing_stop_resets_on_new_peak() {
        let mut trail = TrailState::default();
        assert_eq!(trail.on_tick(50.0, 46.0, 1.0, 2), TrailAction::Armed);
        assert_eq!(trail.on_tick(48.0, 46.0, 1.0, 2), TrailAction::Idle);
        // New peak clears the decline streak
        assert_eq!(trail.on_tick(55.0, 46.0, 1.0, 2), TrailAction::Idle);
        assert_eq!(trail.declines, 0);
        assert!((trail.peak - 55.0).abs() < 1e-12);
        // Small dips below the drop threshold also reset
        assert_eq!(trail.on_tick(54.5, 46.0, 1.0, 2), TrailAction::Idle);
        assert_eq!(trail.declines, 0);
    }

    #[test]
    fn test_trailing_stop_does_not_arm_below_threshold() {
        let mut trail = TrailState::default();
        assert_eq!(trail.on_tick(45.9, 46.0, 1.0, 2), TrailAction::Idle);
        assert!(!trail.armed);
    }

    #[test]
    fn test_secondary_gating() {
        // every 3 ticks in observe
        assert!(secondary_allowed(true, Phase::Observe, 0, 3, true, true, false));
        assert!(!secondary_allowed(true, Phase::Observe, 1, 3, true, true, false));
        assert!(!secondary_allowed(true, Phase::Observe, 2, 3, true, true, false));
        assert!(secondary_allowed(true, Phase::Observe, 3, 3, true, true, false));

        // phase flags
        assert!(!secondary_allowed(true, Phase::Observe, 0, 1, false, true, false));
        assert!(secondary_allowed(true, Phase::Execute, 0, 1, false, true, false));

        // armed forces it on regardless
        assert!(secondary_allowed(true, Phase::Observe, 1, 3, false, false, true));

        // master switch
        assert!(!secondary_allowed(false, Phase::Single, 0, 1, true, true, true));
    }

    #[test]
    fn test_select_amounts_fixed_prefers_configured_index() {
        let sizes: Vec<String> = ["100", "200", "300", "400"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let mut cursor = 0;
        let picked = select_amounts(AmountMode::Fixed, &sizes, "300", 2, &mut cursor).unwrap();
        assert_eq!(picked, vec!["300", "400"]);
        // Preferred size missing: start at 0
        let picked = select_amounts(AmountMode::Fixed, &sizes, "999", 2, &mut cursor).unwrap();
        assert_eq!(picked, vec!["100", "200"]);
        // Cursor untouched by fixed mode
        assert_eq!(cursor, 0);
    }

    #[test]
    fn test_select_amounts_rotate_advances_cursor() {
        let sizes: Vec<String> = ["100", "200", "300"].iter().map(|s| s.to_string()).collect();
        let mut cursor = 0;
        assert_eq!(
            select_amounts(AmountMode::Rotate, &sizes, "100", 2, &mut cursor).unwrap(),
            vec!["100", "200"]
        );
        assert_eq!(cursor, 2);
        // Wraps around
        assert_eq!(
            select_amounts(AmountMode::Rotate, &sizes, "100", 2, &mut cursor).unwrap(),
            vec!["300", "100"]
        );
        assert_eq!(cursor, 1);
    }

    #[test]
    fn test_select_amounts_all_mode_is_none() {
        let sizes = vec!["100".to_string()];
        let mut cursor = 0;
        assert!(select_amounts(AmountMode::All, &sizes, "100", 2, &mut cursor).is_none());
    }

    #[test]
    fn test_tick_vwap_ppm_empty() {
        let outcome = ScanOutcome::default();
        assert!(tick_vwap_ppm(&outcome).is_none());
    }
}
