// Thin scheduler
//
// One long-lived task per pair, staggered across the poll interval so
// the upstream budget is not hit in bursts. Scans run under a global
// concurrency limit; a pair is never scanned twice concurrently. Pair
// cooldowns apply after executions and errors. Error counters enforce
// the bounded-error exit.

use anyhow::Result;
use dashmap::DashMap;
use serde_json::json;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, Semaphore};
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::event_log::{EventLog, EventType};
use crate::executor::Executor;
use crate::pairs::PairConfig;
use crate::scanner::ScanContext;
use crate::trigger;

/// Per-pair mutable state owned by the scheduler
#[derive(Debug, Default, Clone)]
pub struct PairState {
    pub cooldown_until: Option<Instant>,
    pub rotate_cursor: usize,
}

/// Total / consecutive error accounting with bounded-exit thresholds
pub struct ErrorTracker {
    total: AtomicU32,
    consecutive: AtomicU32,
    max_total: u32,
    max_consecutive: u32,
}

impl ErrorTracker {
    pub fn new(max_total: u32, max_consecutive: u32) -> Self {
        Self {
            total: AtomicU32::new(0),
            consecutive: AtomicU32::new(0),
            max_total,
            max_consecutive,
        }
    }

    /// Record a failure; true when a bounded-error threshold is crossed
    pub fn record_error(&self) -> bool {
        let total = self.total.fetch_add(1, Ordering::Relaxed) + 1;
        let consecutive = self.consecutive.fetch_add(1, Ordering::Relaxed) + 1;
        (self.max_total > 0 && total >= self.max_total)
            || (self.max_consecutive > 0 && consecutive >= self.max_consecutive)
    }

    pub fn record_ok(&self) {
        self.consecutive.store(0, Ordering::Relaxed);
    }

    pub fn totals(&self) -> (u32, u32) {
        (
            self.total.load(Ordering::Relaxed),
            self.consecutive.load(Ordering::Relaxed),
        )
    }
}

pub struct Engine {
    pub cfg: Arc<Config>,
    pub pairs: Vec<PairConfig>,
    pub ctx: Arc<ScanContext>,
    pub executor: Arc<Executor>,
    pub events: Arc<EventLog>,
    pub shutdown_tx: broadcast::Sender<()>,
}

struct PairWorker {
    cfg: Arc<Config>,
    pair: PairConfig,
    ctx: Arc<ScanContext>,
    executor: Arc<Executor>,
    events: Arc<EventLog>,
    states: Arc<DashMap<String, PairState>>,
    errors: Arc<ErrorTracker>,
    semaphore: Arc<Semaphore>,
    shutdown_tx: broadcast::Sender<()>,
    exit_requested: Arc<AtomicBool>,
    stagger: Duration,
    once: bool,
}

impl PairWorker {
    fn state(&self) -> PairState {
        self.states
            .get(&self.pair.name)
            .map(|s| s.clone())
            .unwrap_or_default()
    }

    fn save_cursor(&self, cursor: usize) {
        self.states
            .entry(self.pair.name.clone())
            .or_default()
            .rotate_cursor = cursor;
    }

    fn apply_cooldown(&self) {
        let until = Instant::now() + Duration::from_millis(self.pair.cooldown_ms);
        self.states
            .entry(self.pair.name.clone())
            .or_default()
            .cooldown_until = Some(until);
    }

    async fn on_error(&self, stage: &str, err: &anyhow::Error) {
        self.events
            .emit(
                EventType::Error,
                json!({
                    "pair": self.pair.name,
                    "stage": stage,
                    "error": format!("{:#}", err),
                }),
            )
            .await;
        self.apply_cooldown();

        if self.errors.record_error() && !self.exit_requested.swap(true, Ordering::SeqCst) {
            let (total, consecutive) = self.errors.totals();
            self.events
                .emit(
                    EventType::Exit,
                    json!({
                        "reason": "bounded-errors",
                        "errorsTotal": total,
                        "errorsConsecutive": consecutive,
                    }),
                )
                .await;
            error!(
                "🛑 bounded-error exit: {} total / {} consecutive errors",
                total, consecutive
            );
            let _ = self.shutdown_tx.send(());
        }
    }

    /// One observe/execute window plus execution of a fired candidate
    async fn run_round(&self, shutdown: &mut broadcast::Receiver<()>) {
        // Concurrency limit applies to the whole window
        let Ok(_permit) = self.semaphore.acquire().await else {
            return;
        };

        let mut cursor = self.state().rotate_cursor;
        let window = trigger::run_window(&self.ctx, &self.pair, &mut cursor, shutdown).await;
        self.save_cursor(cursor);

        match window {
            Ok(Some(candidate)) => {
                match self.executor.execute(&self.pair, &candidate).await {
                    Ok(report) => {
                        self.errors.record_ok();
                        if report.executed {
                            info!(
                                "💰 {} executed: {:?}{}",
                                self.pair.name,
                                report.signatures,
                                if report.fallback_rpc { " (rpc fallback)" } else { "" }
                            );
                        }
                        self.apply_cooldown();
                    }
                    Err(e) => self.on_error("execute", &e).await,
                }
            }
            Ok(None) => self.errors.record_ok(),
            Err(e) => self.on_error("scan", &e).await,
        }
    }

    async fn run(self) {
        let mut shutdown = self.shutdown_tx.subscribe();

        // Spread pairs across the poll interval
        if !self.stagger.is_zero() {
            tokio::select! {
                _ = tokio::time::sleep(self.stagger) => {}
                _ = shutdown.recv() => return,
            }
        }

        loop {
            if self.exit_requested.load(Ordering::SeqCst) {
                return;
            }

            // Honor the pair cooldown
            if let Some(until) = self.state().cooldown_until {
                let now = Instant::now();
                if until > now {
                    tokio::select! {
                        _ = tokio::time::sleep(until - now) => {}
                        _ = shutdown.recv() => return,
                    }
                }
            }

            self.run_round(&mut shutdown).await;

            if self.once {
                return;
            }

            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(self.cfg.poll_interval_ms)) => {}
                _ = shutdown.recv() => return,
            }
        }
    }
}

impl Engine {
    /// Run until shutdown (or one pass with `once`). Err = bounded-error
    /// exit, mapped to a non-zero process exit code by main.
    pub async fn run(&self, once: bool) -> Result<()> {
        let states: Arc<DashMap<String, PairState>> = Arc::new(DashMap::new());
        let errors = Arc::new(ErrorTracker::new(
            self.cfg.max_errors_before_exit,
            self.cfg.max_consecutive_errors_before_exit,
        ));
        let semaphore = Arc::new(Semaphore::new(self.cfg.pair_concurrency));
        let exit_requested = Arc::new(AtomicBool::new(false));

        let pair_count = self.pairs.len().max(1);
        let mut set = JoinSet::new();
        for (idx, pair) in self.pairs.iter().enumerate() {
            let worker = PairWorker {
                cfg: self.cfg.clone(),
                pair: pair.clone(),
                ctx: self.ctx.clone(),
                executor: self.executor.clone(),
                events: self.events.clone(),
                states: states.clone(),
                errors: errors.clone(),
                semaphore: semaphore.clone(),
                shutdown_tx: self.shutdown_tx.clone(),
                exit_requested: exit_requested.clone(),
                stagger: Duration::from_millis(
                    self.cfg.poll_interval_ms * idx as u64 / pair_count as u64,
                ),
                once,
            };
            set.spawn(worker.run());
        }

        while let Some(joined) = set.join_next().await {
            if let Err(e) = joined {
                warn!("⚠️ pair task ended abnormally: {}", e);
            }
        }

        if exit_requested.load(Ordering::SeqCst) {
            anyhow::bail!("bounded-error exit");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_tracker_total_threshold() {
        let tracker = ErrorTracker::new(3, 0);
        assert!(!tracker.record_error());
        assert!(!tracker.record_error());
        assert!(tracker.record_error());
        assert_eq!(tracker.totals().0, 3);
    }

    #[test]
    fn test_error_tracker_consecutive_resets() {
        let tracker = ErrorTracker::new(0, 2);
        assert!(!tracker.record_error());
        tracker.record_ok();
        assert!(!tracker.record_error());
        // Two in a row without an intervening success
        assert!(tracker.record_error());
    }

    #[test]
    fn test_error_tracker_disabled_thresholds() {
        let tracker = ErrorTracker::new(0, 0);
        for _ in 0..100 {
            assert!(!tracker.record_error());
        }
    }
}
