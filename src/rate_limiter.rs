// Adaptive rate governor for upstream quote providers
//
// Token bucket with continuous refill at `current_rps`, clamped to `burst`.
// A 429 halves the rate (floored at `min_rps`) and opens a penalty window;
// successes outside the penalty window step the rate back toward base.
// Calls are serialized through a FIFO sequencer so each scheduled call
// consumes exactly one token, in arrival order.

use anyhow::Result;
use dashmap::DashMap;
use serde::Serialize;
use std::future::Future;
use std::sync::Mutex as StdMutex;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio_retry::strategy::ExponentialBackoff;
use tracing::{debug, warn};

use crate::config::RateConfig;
use crate::types::Provider;

#[derive(Debug)]
struct BucketState {
    current_rps: f64,
    tokens: f64,
    last_refill: Instant,
    cooldown_until: Option<Instant>,
    penalty_until: Option<Instant>,
    last_recovery: Instant,
    last_429: Option<Instant>,
    calls: u64,
    hits_429: u64,
}

/// Point-in-time limiter view for /metrics and rate_limit events
#[derive(Debug, Clone, Serialize)]
pub struct LimiterSnapshot {
    pub name: String,
    pub base_rps: f64,
    pub current_rps: f64,
    pub tokens: f64,
    pub calls: u64,
    pub hits_429: u64,
    pub penalty_remaining_ms: u64,
    pub cooldown_remaining_ms: u64,
}

pub struct AdaptiveRateLimiter {
    name: String,
    cfg: RateConfig,
    seq: Mutex<()>,
    state: StdMutex<BucketState>,
}

impl AdaptiveRateLimiter {
    pub fn new(name: impl Into<String>, cfg: RateConfig) -> Self {
        let now = Instant::now();
        let name = name.into();
        debug!(
            "limiter {} ready: {:.2} rps (min {:.2}, burst {:.1})",
            name, cfg.rps, cfg.min_rps, cfg.burst
        );
        Self {
            name,
            state: StdMutex::new(BucketState {
                current_rps: cfg.rps,
                tokens: cfg.burst,
                last_refill: now,
                cooldown_until: None,
                penalty_until: None,
                last_recovery: now,
                last_429: None,
                calls: 0,
                hits_429: 0,
            }),
            cfg,
            seq: Mutex::new(()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &RateConfig {
        &self.cfg
    }

    /// Wait for a token (FIFO relative to other callers) and consume it
    pub async fn acquire(&self) {
        let _guard = self.seq.lock().await;
        loop {
            let wait = {
                let mut st = self.state.lock().unwrap();
                let now = Instant::now();

                // Continuous refill
                let elapsed = now.duration_since(st.last_refill).as_secs_f64();
                st.tokens = (st.tokens + elapsed * st.current_rps).min(self.cfg.burst);
                st.last_refill = now;

                let cooldown_wait = st
                    .cooldown_until
                    .filter(|&until| until > now)
                    .map(|until| until - now)
                    .unwrap_or(Duration::ZERO);

                let token_wait = if st.tokens >= 1.0 {
                    Duration::ZERO
                } else {
                    let deficit = 1.0 - st.tokens;
                    Duration::from_secs_f64(deficit / st.current_rps.max(0.01))
                };

                let wait = cooldown_wait.max(token_wait);
                if wait.is_zero() {
                    st.tokens -= 1.0;
                    st.calls += 1;
                    None
                } else {
                    Some(wait)
                }
            };

            match wait {
                None => return,
                Some(d) => tokio::time::sleep(d).await,
            }
        }
    }

    /// Halve the rate and start the penalty window
    pub fn note_429(&self) {
        let mut st = self.state.lock().unwrap();
        let now = Instant::now();
        let before = st.current_rps;
        st.current_rps = (st.current_rps * 0.5).max(self.cfg.min_rps);
        st.penalty_until = Some(now + Duration::from_millis(self.cfg.penalty_ms));
        st.last_recovery = now;
        st.last_429 = Some(now);
        st.hits_429 += 1;
        warn!(
            "⏬ {} rate limited: {:.2} → {:.2} rps (penalty {}ms)",
            self.name, before, st.current_rps, self.cfg.penalty_ms
        );
    }

    /// Step the rate back toward base; no-op inside the penalty window
    pub fn note_success(&self) {
        let mut st = self.state.lock().unwrap();
        let now = Instant::now();
        if st.penalty_until.is_some_and(|until| now < until) {
            return;
        }
        st.penalty_until = None;
        if st.current_rps < self.cfg.rps
            && now.duration_since(st.last_recovery)
                >= Duration::from_millis(self.cfg.recovery_every_ms)
        {
            st.current_rps = (st.current_rps + self.cfg.recovery_step_rps).min(self.cfg.rps);
            st.last_recovery = now;
            debug!("⏫ {} recovering: {:.2} rps", self.name, st.current_rps);
        }
    }

    /// Monotonic-only extension of the shared cooldown
    pub fn cooldown(&self, ms: u64) {
        let mut st = self.state.lock().unwrap();
        let until = Instant::now() + Duration::from_millis(ms);
        st.cooldown_until = Some(match st.cooldown_until {
            Some(existing) if existing > until => existing,
            _ => until,
        });
    }

    pub fn current_rps(&self) -> f64 {
        self.state.lock().unwrap().current_rps
    }

    pub fn snapshot(&self) -> LimiterSnapshot {
        let st = self.state.lock().unwrap();
        let now = Instant::now();
        let remaining = |t: Option<Instant>| {
            t.filter(|&until| until > now)
                .map(|until| (until - now).as_millis() as u64)
                .unwrap_or(0)
        };
        LimiterSnapshot {
            name: self.name.clone(),
            base_rps: self.cfg.rps,
            current_rps: st.current_rps,
            tokens: st.tokens,
            calls: st.calls,
            hits_429: st.hits_429,
            penalty_remaining_ms: remaining(st.penalty_until),
            cooldown_remaining_ms: remaining(st.cooldown_until),
        }
    }
}

/// Per-(provider, pair) rate-limit fuse
pub struct PairBreaker {
    open_until: DashMap<(Provider, String), Instant>,
}

impl PairBreaker {
    pub fn new() -> Self {
        Self {
            open_until: DashMap::new(),
        }
    }

    /// Open (or extend, forward-only) the breaker
    pub fn open(&self, provider: Provider, pair: &str, ms: u64) {
        let until = Instant::now() + Duration::from_millis(ms);
        self.open_until
            .entry((provider, pair.to_string()))
            .and_modify(|existing| {
                if until > *existing {
                    *existing = until;
                }
            })
            .or_insert(until);
    }

    /// Remaining open window in ms, if still open
    pub fn remaining_ms(&self, provider: Provider, pair: &str) -> Option<u64> {
        let entry = self.open_until.get(&(provider, pair.to_string()))?;
        let now = Instant::now();
        if *entry > now {
            Some((*entry - now).as_millis() as u64)
        } else {
            None
        }
    }

    pub fn is_open(&self, provider: Provider, pair: &str) -> bool {
        self.remaining_ms(provider, pair).is_some()
    }
}

impl Default for PairBreaker {
    fn default() -> Self {
        Self::new()
    }
}

/// HTTP 429 detection from an error message (upstreams surface status in text)
pub fn is_http_429(err: &anyhow::Error) -> bool {
    let msg = format!("{:#}", err);
    msg.contains("429") || msg.to_lowercase().contains("too many requests")
}

/// Transient upstream failures worth retrying
pub fn is_retryable(err: &anyhow::Error) -> bool {
    if is_http_429(err) {
        return true;
    }
    let msg = format!("{:#}", err).to_lowercase();
    ["500", "502", "503", "504"]
        .iter()
        .any(|code| msg.contains(&format!("http {}", code)) || msg.contains(&format!("status {}", code)))
        || msg.contains("timeout")
        || msg.contains("timed out")
        || msg.contains("connection")
        || msg.contains("network")
        || msg.contains("aborted")
        || msg.contains("error sending request")
}

/// Run `op` under the limiter with exponential backoff. Every attempt
/// consumes a token; only transient failures are retried; the final
/// failure propagates.
pub async fn retry_with_limiter<T, F, Fut>(
    limiter: &AdaptiveRateLimiter,
    what: &str,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let cfg = limiter.config().clone();
    let mut delays = ExponentialBackoff::from_millis(2)
        .factor((cfg.backoff_base_ms / 2).max(1))
        .max_delay(Duration::from_millis(cfg.backoff_max_ms));

    let mut last_err = None;
    let max_attempts = cfg.max_attempts.max(1);
    for attempt in 1..=max_attempts {
        limiter.acquire().await;
        match op().await {
            Ok(value) => {
                limiter.note_success();
                return Ok(value);
            }
            Err(e) => {
                if is_http_429(&e) {
                    limiter.note_429();
                }
                let retryable = is_retryable(&e);
                warn!(
                    "❌ {} attempt {}/{} failed{}: {:#}",
                    what,
                    attempt,
                    max_attempts,
                    if retryable { "" } else { " (permanent)" },
                    e
                );
                last_err = Some(e);
                if !retryable || attempt == max_attempts {
                    break;
                }
                let delay = delays
                    .next()
                    .unwrap_or(Duration::from_millis(cfg.backoff_max_ms));
                // Up to 25% extra jitter so concurrent pairs don't re-align
                let jitter = delay.mul_f64(fastrand::f64() * 0.25);
                tokio::time::sleep(delay + jitter).await;
            }
        }
    }

    Err(last_err.unwrap_or_else(|| anyhow::anyhow!("{}: no attempts made", what)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_cfg() -> RateConfig {
        RateConfig {
            rps: 10.0,
            min_rps: 1.0,
            burst: 2.0,
            penalty_ms: 60_000,
            recovery_every_ms: 0,
            recovery_step_rps: 0.5,
            backoff_base_ms: 10,
            backoff_max_ms: 50,
            max_attempts: 3,
            cooldown_429_ms: 1_000,
        }
    }

    #[test]
    fn test_note_429_halves_down_to_floor() {
        let limiter = AdaptiveRateLimiter::new("test", test_cfg());
        assert!((limiter.current_rps() - 10.0).abs() < 1e-9);
        limiter.note_429();
        assert!((limiter.current_rps() - 5.0).abs() < 1e-9);
        limiter.note_429();
        limiter.note_429();
        limiter.note_429();
        limiter.note_429();
        // Floor at min_rps
        assert!((limiter.current_rps() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_no_recovery_during_penalty() {
        let limiter = AdaptiveRateLimiter::new("test", test_cfg());
        limiter.note_429();
        let after_429 = limiter.current_rps();
        limiter.note_success();
        assert_eq!(limiter.current_rps(), after_429, "penalty blocks recovery");
    }

    #[test]
    fn test_recovery_steps_back_to_base() {
        let mut cfg = test_cfg();
        cfg.penalty_ms = 0;
        let limiter = AdaptiveRateLimiter::new("test", cfg);
        limiter.note_429();
        let degraded = limiter.current_rps();
        limiter.note_success();
        assert!(limiter.current_rps() > degraded);
        for _ in 0..100 {
            limiter.note_success();
        }
        assert!((limiter.current_rps() - 10.0).abs() < 1e-9, "capped at base");
    }

    #[tokio::test]
    async fn test_acquire_consumes_tokens() {
        let limiter = AdaptiveRateLimiter::new("test", test_cfg());
        // burst = 2: two immediate grants
        limiter.acquire().await;
        limiter.acquire().await;
        let snap = limiter.snapshot();
        assert_eq!(snap.calls, 2);
        assert!(snap.tokens < 1.0);
    }

    #[test]
    fn test_breaker_forward_only() {
        let breaker = PairBreaker::new();
        assert!(!breaker.is_open(Provider::Jupiter, "SOL/USDC"));

        breaker.open(Provider::Jupiter, "SOL/USDC", 30_000);
        let first = breaker.remaining_ms(Provider::Jupiter, "SOL/USDC").unwrap();
        assert!(first > 29_000);

        // Shorter re-open must not shrink the window
        breaker.open(Provider::Jupiter, "SOL/USDC", 1);
        let second = breaker.remaining_ms(Provider::Jupiter, "SOL/USDC").unwrap();
        assert!(second > 25_000);

        // Scoped per provider
        assert!(!breaker.is_open(Provider::OpenOcean, "SOL/USDC"));
    }

    #[test]
    fn test_error_classification() {
        assert!(is_http_429(&anyhow::anyhow!("HTTP 429: slow down")));
        assert!(is_retryable(&anyhow::anyhow!("HTTP 503: unavailable")));
        assert!(is_retryable(&anyhow::anyhow!("request timed out")));
        assert!(!is_retryable(&anyhow::anyhow!("HTTP 400: bad amount")));
        assert!(!is_http_429(&anyhow::anyhow!("HTTP 400: bad amount")));
    }

    #[tokio::test]
    async fn test_retry_gives_up_on_permanent_error() {
        let limiter = AdaptiveRateLimiter::new("test", test_cfg());
        let mut attempts = 0u32;
        let result: Result<()> = retry_with_limiter(&limiter, "quote", || {
            attempts += 1;
            async { Err(anyhow::anyhow!("HTTP 400: bad request")) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(attempts, 1, "permanent errors are not retried");
    }

    #[tokio::test]
    async fn test_retry_exhausts_attempts_on_transient_error() {
        let limiter = AdaptiveRateLimiter::new("test", test_cfg());
        let mut attempts = 0u32;
        let result: Result<()> = retry_with_limiter(&limiter, "quote", || {
            attempts += 1;
            async { Err(anyhow::anyhow!("HTTP 502: bad gateway")) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(attempts, 3);
    }
}
