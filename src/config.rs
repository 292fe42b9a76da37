use anyhow::{Context, Result};
use std::env;

use crate::pairs::PairConfig;
use crate::types::NATIVE_MINT;

/// Trading mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    DryRun,
    Live,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::DryRun => "dry-run",
            Mode::Live => "live",
        }
    }
}

/// Runtime profile; `hft` trims logging and Secondary usage
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Profile {
    Default,
    Hft,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionStrategy {
    Atomic,
    Sequential,
}

impl ExecutionStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStrategy::Atomic => "atomic",
            ExecutionStrategy::Sequential => "sequential",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionProvider {
    Swap,
    Ultra,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerStrategy {
    Immediate,
    Average,
    Vwap,
    Bollinger,
}

impl TriggerStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerStrategy::Immediate => "immediate",
            TriggerStrategy::Average => "average",
            TriggerStrategy::Vwap => "vwap",
            TriggerStrategy::Bollinger => "bollinger",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AmountMode {
    All,
    Fixed,
    Rotate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PriorityFeeStrategy {
    Off,
    RpcRecent,
    Helius,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PriorityFeeLevel {
    Low,
    Medium,
    High,
    VeryHigh,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TipMode {
    Fixed,
    Dynamic,
}

/// Per-upstream rate budget and backoff knobs
#[derive(Debug, Clone)]
pub struct RateConfig {
    pub rps: f64,
    pub min_rps: f64,
    pub burst: f64,
    pub penalty_ms: u64,
    pub recovery_every_ms: u64,
    pub recovery_step_rps: f64,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub max_attempts: u32,
    /// Per-pair breaker open window after a 429
    pub cooldown_429_ms: u64,
}

impl RateConfig {
    fn from_env(prefix: &str, default_rps: f64) -> Result<Self> {
        let rps = env_f64(&format!("{prefix}_RPS"), default_rps)?.max(0.05);
        let min_rps = env_f64(&format!("{prefix}_MIN_RPS"), (rps * 0.25).max(0.05))?.max(0.05);
        Ok(Self {
            rps,
            min_rps: min_rps.min(rps),
            burst: env_f64(&format!("{prefix}_BURST"), 1.0)?.max(1.0),
            penalty_ms: env_u64(&format!("{prefix}_PENALTY_MS"), 10_000)?.max(1_000),
            recovery_every_ms: env_u64(&format!("{prefix}_RECOVERY_EVERY_MS"), 5_000)?.max(1_000),
            recovery_step_rps: env_f64(&format!("{prefix}_RECOVERY_STEP_RPS"), 0.1)?,
            backoff_base_ms: env_u64(&format!("{prefix}_BACKOFF_BASE_MS"), 250)?,
            backoff_max_ms: env_u64(&format!("{prefix}_BACKOFF_MAX_MS"), 4_000)?,
            max_attempts: env_u64(&format!("{prefix}_MAX_ATTEMPTS"), 4)? as u32,
            cooldown_429_ms: env_u64(&format!("{prefix}_429_COOLDOWN_MS"), 30_000)?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct TriggerConfig {
    pub strategy: TriggerStrategy,
    pub observe_ms: u64,
    pub observe_interval_ms: u64,
    pub execute_ms: u64,
    pub execute_interval_ms: u64,
    /// EMA smoothing; 0 = auto (2 / (N + 1) over the observe window)
    pub alpha: f64,
    pub bollinger_k: f64,
    pub min_samples: u32,
    pub lookback: u32,
    pub trail_drop_ppm: f64,
    pub emergency_sigma: f64,
    /// Arming threshold for the vwap strategy, ppm of notional
    pub target_ppm: f64,
    pub amount_mode: AmountMode,
    pub max_amounts_per_tick: usize,
}

#[derive(Debug, Clone)]
pub struct FeeConfig {
    pub base_fee_lamports: u64,
    pub rent_buffer_lamports: u64,
    pub cu_limit: u32,
    pub cu_price_micro_lamports: u64,
    pub priority_fee_strategy: PriorityFeeStrategy,
    pub priority_fee_level: PriorityFeeLevel,
    pub helius_url: Option<String>,
}

#[derive(Debug, Clone)]
pub struct JitoConfig {
    pub enabled: bool,
    pub block_engine_url: String,
    pub tip_mode: TipMode,
    pub tip_lamports: u64,
    pub tip_bps: u32,
    pub min_tip_lamports: u64,
    pub max_tip_lamports: u64,
    pub tip_account: Option<String>,
    pub wait_ms: u64,
    pub fallback_rpc: bool,
}

#[derive(Debug, Clone)]
pub struct JupiterConfig {
    pub base_url: String,
    pub ultra_base_url: String,
    pub api_key: Option<String>,
    pub quote_cache_ttl_ms: u64,
    pub rate: RateConfig,
}

#[derive(Debug, Clone)]
pub struct OpenOceanConfig {
    pub enabled: bool,
    pub base_url: String,
    /// Skip Secondary when best-Primary conservative bps is below this
    pub gate_bps: i64,
    /// When > 0, skip Secondary when best-Primary bps exceeds gate + near-gate
    pub near_gate_bps: i64,
    pub every_n_ticks: u32,
    pub use_in_observe: bool,
    pub use_in_execute: bool,
    /// Provider-declared signatures per transaction for fee estimation
    pub sigs_estimate: u32,
    pub referrer: Option<String>,
    pub referrer_fee_bps: Option<u32>,
    pub enabled_dex_ids: Option<String>,
    pub disabled_dex_ids: Option<String>,
    pub rate: RateConfig,
}

/// Full engine configuration loaded from the environment
#[derive(Debug, Clone)]
pub struct Config {
    pub rpc_url: String,
    pub rpc_ws_url: Option<String>,
    pub commitment: String,
    pub wallet_secret: String,
    pub mode: Mode,
    pub profile: Profile,
    pub execution_strategy: ExecutionStrategy,
    pub execution_provider: ExecutionProvider,
    pub live_preflight_simulate: bool,
    pub dry_run_simulate: bool,
    pub pairs_path: String,

    pub poll_interval_ms: u64,
    pub pair_concurrency: usize,
    pub max_errors_before_exit: u32,
    pub max_consecutive_errors_before_exit: u32,
    pub min_balance_lamports: u64,
    pub balance_refresh_ms: u64,

    pub trigger: TriggerConfig,
    pub fees: FeeConfig,
    pub jito: JitoConfig,
    pub jupiter: JupiterConfig,
    pub openocean: OpenOceanConfig,

    pub log_verbose: bool,
    pub event_log_path: String,
    pub event_log_rotate: bool,
    pub event_log_max_bytes: u64,
    pub event_log_max_files: u32,
    pub health_port: Option<u16>,
    pub decider_cmd: Option<String>,
}

fn env_str(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_opt(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.is_empty())
}

fn env_u64(key: &str, default: u64) -> Result<u64> {
    match env::var(key) {
        Ok(v) => v
            .trim()
            .parse()
            .with_context(|| format!("invalid {}: {:?}", key, v)),
        Err(_) => Ok(default),
    }
}

fn env_f64(key: &str, default: f64) -> Result<f64> {
    match env::var(key) {
        Ok(v) => v
            .trim()
            .parse()
            .with_context(|| format!("invalid {}: {:?}", key, v)),
        Err(_) => Ok(default),
    }
}

fn env_bool(key: &str, default: bool) -> bool {
    match env::var(key) {
        Ok(v) => matches!(v.to_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        // Load .env file
        dotenvy::dotenv().ok();

        let rpc_url = env::var("SOLANA_RPC_URL").context("SOLANA_RPC_URL is required")?;
        let wallet_secret =
            env::var("WALLET_SECRET_KEY").context("WALLET_SECRET_KEY is required")?;

        let mode = match env_str("MODE", "dry-run").to_lowercase().as_str() {
            "dry-run" | "dryrun" => Mode::DryRun,
            "live" => Mode::Live,
            other => anyhow::bail!("invalid MODE: {:?} (expected dry-run|live)", other),
        };

        let profile = match env_str("PROFILE", "default").to_lowercase().as_str() {
            "default" => Profile::Default,
            "hft" => Profile::Hft,
            other => anyhow::bail!("invalid PROFILE: {:?} (expected default|hft)", other),
        };

        let execution_strategy =
            match env_str("EXECUTION_STRATEGY", "atomic").to_lowercase().as_str() {
                "atomic" => ExecutionStrategy::Atomic,
                "sequential" => ExecutionStrategy::Sequential,
                other => anyhow::bail!(
                    "invalid EXECUTION_STRATEGY: {:?} (expected atomic|sequential)",
                    other
                ),
            };

        let execution_provider =
            match env_str("EXECUTION_PROVIDER", "swap").to_lowercase().as_str() {
                "swap" => ExecutionProvider::Swap,
                "ultra" => ExecutionProvider::Ultra,
                other => anyhow::bail!(
                    "invalid EXECUTION_PROVIDER: {:?} (expected swap|ultra)",
                    other
                ),
            };

        let commitment = env_str("SOLANA_COMMITMENT", "confirmed").to_lowercase();
        if !matches!(commitment.as_str(), "processed" | "confirmed" | "finalized") {
            anyhow::bail!(
                "invalid SOLANA_COMMITMENT: {:?} (expected processed|confirmed|finalized)",
                commitment
            );
        }

        let trigger_strategy =
            match env_str("TRIGGER_STRATEGY", "immediate").to_lowercase().as_str() {
                "immediate" => TriggerStrategy::Immediate,
                "average" | "avg" | "avg-window" => TriggerStrategy::Average,
                "vwap" => TriggerStrategy::Vwap,
                "bollinger" => TriggerStrategy::Bollinger,
                other => anyhow::bail!("invalid TRIGGER_STRATEGY: {:?}", other),
            };

        let amount_mode = match env_str("AMOUNT_MODE", "all").to_lowercase().as_str() {
            "all" => AmountMode::All,
            "fixed" => AmountMode::Fixed,
            "rotate" => AmountMode::Rotate,
            other => {
                anyhow::bail!("invalid AMOUNT_MODE: {:?} (expected all|fixed|rotate)", other)
            }
        };

        let priority_fee_strategy =
            match env_str("PRIORITY_FEE_STRATEGY", "off").to_lowercase().as_str() {
                "off" => PriorityFeeStrategy::Off,
                "rpc-recent" | "rpc_recent" => PriorityFeeStrategy::RpcRecent,
                "helius" => PriorityFeeStrategy::Helius,
                other => anyhow::bail!("invalid PRIORITY_FEE_STRATEGY: {:?}", other),
            };

        let priority_fee_level =
            match env_str("PRIORITY_FEE_LEVEL", "medium").to_lowercase().as_str() {
                "low" => PriorityFeeLevel::Low,
                "medium" => PriorityFeeLevel::Medium,
                "high" => PriorityFeeLevel::High,
                "veryhigh" | "very-high" | "very_high" => PriorityFeeLevel::VeryHigh,
                other => anyhow::bail!("invalid PRIORITY_FEE_LEVEL: {:?}", other),
            };

        let tip_mode = match env_str("JITO_TIP_MODE", "fixed").to_lowercase().as_str() {
            "fixed" => TipMode::Fixed,
            "dynamic" => TipMode::Dynamic,
            other => anyhow::bail!("invalid JITO_TIP_MODE: {:?} (expected fixed|dynamic)", other),
        };

        let trigger = TriggerConfig {
            strategy: trigger_strategy,
            observe_ms: env_u64("TRIGGER_OBSERVE_MS", 30_000)?,
            observe_interval_ms: env_u64("TRIGGER_OBSERVE_INTERVAL_MS", 1_000)?.max(50),
            execute_ms: env_u64("TRIGGER_EXECUTE_MS", 10_000)?,
            execute_interval_ms: env_u64("TRIGGER_EXECUTE_INTERVAL_MS", 500)?.max(50),
            alpha: env_f64("TRIGGER_VWAP_ALPHA", 0.0)?,
            bollinger_k: env_f64("TRIGGER_BOLLINGER_K", 1.5)?,
            min_samples: env_u64("TRIGGER_MIN_SAMPLES", 10)? as u32,
            lookback: env_u64("TRIGGER_TRAIL_LOOKBACK", 2)?.max(1) as u32,
            trail_drop_ppm: env_f64("TRIGGER_TRAIL_DROP_PPM", 100.0)?,
            emergency_sigma: env_f64("TRIGGER_EMERGENCY_SIGMA", 0.0)?,
            target_ppm: env_f64("TRIGGER_TARGET_PPM", 0.0)?,
            amount_mode,
            max_amounts_per_tick: env_u64("AMOUNT_MAX_PER_TICK", 2)?.max(1) as usize,
        };

        let fees = FeeConfig {
            base_fee_lamports: env_u64("BASE_FEE_LAMPORTS", 5_000)?,
            rent_buffer_lamports: env_u64("RENT_BUFFER_LAMPORTS", 0)?,
            cu_limit: env_u64("CU_LIMIT", 600_000)? as u32,
            cu_price_micro_lamports: env_u64("CU_PRICE_MICRO_LAMPORTS", 0)?,
            priority_fee_strategy,
            priority_fee_level,
            helius_url: env_opt("HELIUS_PRIORITY_FEE_URL"),
        };

        let jito = JitoConfig {
            enabled: env_bool("JITO_ENABLED", false),
            block_engine_url: env_str(
                "JITO_BLOCK_ENGINE_URL",
                "https://mainnet.block-engine.jito.wtf",
            ),
            tip_mode,
            tip_lamports: env_u64("JITO_TIP_LAMPORTS", 100_000)?,
            tip_bps: env_u64("JITO_TIP_BPS", 1_000)? as u32,
            min_tip_lamports: env_u64("JITO_MIN_TIP_LAMPORTS", 1_000)?,
            max_tip_lamports: env_u64("JITO_MAX_TIP_LAMPORTS", 1_000_000)?,
            tip_account: env_opt("JITO_TIP_ACCOUNT"),
            wait_ms: env_u64("JITO_WAIT_MS", 0)?,
            fallback_rpc: env_bool("JITO_FALLBACK_RPC", false),
        };

        let jupiter = JupiterConfig {
            base_url: env_str("JUPITER_BASE_URL", "https://api.jup.ag/swap/v1"),
            ultra_base_url: env_str("JUPITER_ULTRA_BASE_URL", "https://api.jup.ag/ultra"),
            api_key: env_opt("JUPITER_API_KEY"),
            quote_cache_ttl_ms: env_u64("JUPITER_QUOTE_CACHE_TTL_MS", 250)?,
            rate: RateConfig::from_env("JUP", 1.0)?,
        };

        let mut openocean = OpenOceanConfig {
            enabled: env_bool("OPENOCEAN_ENABLED", false),
            base_url: env_str(
                "OPENOCEAN_BASE_URL",
                "https://open-api.openocean.finance/v4/solana",
            ),
            gate_bps: env_u64("OPENOCEAN_JUPITER_GATE_BPS", 0)? as i64,
            near_gate_bps: env_u64("OPENOCEAN_JUPITER_NEAR_GATE_BPS", 0)? as i64,
            every_n_ticks: env_u64("OPENOCEAN_EVERY_N_TICKS", 1)?.max(1) as u32,
            use_in_observe: env_bool("OPENOCEAN_OBSERVE", true),
            use_in_execute: env_bool("OPENOCEAN_EXECUTE", true),
            sigs_estimate: env_u64("OPENOCEAN_SIGS_ESTIMATE", 3)?.max(1) as u32,
            referrer: env_opt("OPENOCEAN_REFERRER"),
            referrer_fee_bps: env_opt("OPENOCEAN_REFERRER_FEE_BPS")
                .map(|v| v.parse().context("invalid OPENOCEAN_REFERRER_FEE_BPS"))
                .transpose()?,
            enabled_dex_ids: env_opt("OPENOCEAN_ENABLED_DEX_IDS"),
            disabled_dex_ids: env_opt("OPENOCEAN_DISABLED_DEX_IDS"),
            rate: RateConfig::from_env("OPENOCEAN", 0.5)?,
        };

        let mut log_verbose = env_bool("LOG_VERBOSE", true);

        // hft profile: quiet logs, no Secondary during observe, thinned ticks
        if profile == Profile::Hft {
            if env::var("LOG_VERBOSE").is_err() {
                log_verbose = false;
            }
            openocean.use_in_observe = false;
            openocean.every_n_ticks = openocean.every_n_ticks.max(2);
        }

        let config = Self {
            rpc_url,
            rpc_ws_url: env_opt("SOLANA_WS_URL"),
            commitment,
            wallet_secret,
            mode,
            profile,
            execution_strategy,
            execution_provider,
            live_preflight_simulate: env_bool("LIVE_PREFLIGHT_SIMULATE", true),
            dry_run_simulate: env_bool("DRY_RUN_SIMULATE", false),
            pairs_path: env_str("PAIRS_CONFIG_PATH", "pairs.json"),

            poll_interval_ms: env_u64("POLL_INTERVAL_MS", 5_000)?,
            pair_concurrency: env_u64("PAIR_CONCURRENCY", 2)?.max(1) as usize,
            max_errors_before_exit: env_u64("MAX_ERRORS_BEFORE_EXIT", 0)? as u32,
            max_consecutive_errors_before_exit: env_u64("MAX_CONSECUTIVE_ERRORS_BEFORE_EXIT", 0)?
                as u32,
            min_balance_lamports: env_u64("MIN_BALANCE_LAMPORTS", 0)?,
            balance_refresh_ms: env_u64("BALANCE_REFRESH_MS", 30_000)?,

            trigger,
            fees,
            jito,
            jupiter,
            openocean,

            log_verbose,
            event_log_path: env_str("EVENT_LOG_PATH", "events.ndjson"),
            event_log_rotate: env_bool("EVENT_LOG_ROTATE", false),
            event_log_max_bytes: env_u64("EVENT_LOG_MAX_BYTES", 50_000_000)?,
            event_log_max_files: env_u64("EVENT_LOG_MAX_FILES", 5)? as u32,
            health_port: env_opt("HEALTH_PORT")
                .map(|v| v.parse().context("invalid HEALTH_PORT"))
                .transpose()?,
            decider_cmd: env_opt("DECIDER_CMD"),
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate cross-field consistency
    fn validate(&self) -> Result<()> {
        if self.poll_interval_ms == 0 {
            anyhow::bail!("POLL_INTERVAL_MS must be > 0");
        }
        if self.jito.min_tip_lamports > self.jito.max_tip_lamports {
            anyhow::bail!(
                "JITO_MIN_TIP_LAMPORTS {} exceeds JITO_MAX_TIP_LAMPORTS {}",
                self.jito.min_tip_lamports,
                self.jito.max_tip_lamports
            );
        }
        if self.jito.tip_bps > 10_000 {
            anyhow::bail!("JITO_TIP_BPS {} out of range [0, 10000]", self.jito.tip_bps);
        }
        if self.trigger.bollinger_k < 0.0 {
            anyhow::bail!("TRIGGER_BOLLINGER_K must be >= 0");
        }
        if !(0.0..=1.0).contains(&self.trigger.alpha) {
            anyhow::bail!("TRIGGER_VWAP_ALPHA must be within [0, 1]");
        }
        Ok(())
    }

    /// Warnings for permitted but suspicious combinations, logged at startup
    pub fn startup_warnings(&self, pairs: &[PairConfig]) -> Vec<String> {
        let mut out = Vec::new();
        if self.execution_provider == ExecutionProvider::Ultra
            && self.execution_strategy == ExecutionStrategy::Atomic
        {
            out.push(
                "execution provider 'ultra' only supports sequential execution; \
                 ultra candidates will be skipped at execute time"
                    .to_string(),
            );
        }
        if self.openocean.enabled && self.execution_strategy == ExecutionStrategy::Atomic {
            out.push(
                "OpenOcean second opinions require sequential execution; the secondary \
                 path is disabled under the atomic strategy"
                    .to_string(),
            );
        }
        if self.jito.enabled && self.execution_strategy == ExecutionStrategy::Sequential {
            out.push("bundle submission only applies to the atomic strategy".to_string());
        }
        if self.jito.enabled && self.jito.tip_mode == TipMode::Dynamic {
            let non_native: Vec<&str> = pairs
                .iter()
                .filter(|p| p.a_mint != NATIVE_MINT)
                .map(|p| p.name.as_str())
                .collect();
            if !non_native.is_empty() {
                out.push(format!(
                    "dynamic tip only applies to native-input pairs; [{}] will pay \
                     the fixed tip amount",
                    non_native.join(", ")
                ));
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Env-var tests mutate process state; keep them in one test to avoid
    // interleaving with parallel test threads.
    #[test]
    fn test_from_env_defaults_and_hft_profile() {
        env::set_var("SOLANA_RPC_URL", "https://api.mainnet-beta.solana.com");
        env::set_var("WALLET_SECRET_KEY", "[1,2,3]");

        let config = Config::from_env().unwrap();
        assert_eq!(config.mode, Mode::DryRun);
        assert_eq!(config.execution_strategy, ExecutionStrategy::Atomic);
        assert_eq!(config.trigger.strategy, TriggerStrategy::Immediate);
        assert_eq!(config.fees.base_fee_lamports, 5_000);
        assert!((config.jupiter.rate.min_rps - 0.25).abs() < 1e-9);
        assert!(config.log_verbose);

        env::set_var("PROFILE", "hft");
        env::set_var("OPENOCEAN_EVERY_N_TICKS", "1");
        let config = Config::from_env().unwrap();
        assert_eq!(config.profile, Profile::Hft);
        assert!(!config.log_verbose);
        assert!(!config.openocean.use_in_observe);
        assert_eq!(config.openocean.every_n_ticks, 2);

        env::remove_var("PROFILE");
        env::remove_var("OPENOCEAN_EVERY_N_TICKS");

        env::set_var("MODE", "nonsense");
        assert!(Config::from_env().is_err());
        env::remove_var("MODE");

        // Dynamic tips silently fall back to fixed on non-native inputs;
        // that combo must be surfaced at startup
        env::set_var("JITO_ENABLED", "true");
        env::set_var("JITO_TIP_MODE", "dynamic");
        let config = Config::from_env().unwrap();

        let pair = |name: &str, a_mint: &str| -> PairConfig {
            serde_json::from_value(serde_json::json!({
                "name": name,
                "aMint": a_mint,
                "bMint": "EPjFWdd5AufqSSqeM2qN1xzybapC8G4wEGGkZwyTDt1v",
                "slippageBps": 50,
                "amountA": "1000000",
            }))
            .unwrap()
        };
        let native = pair("SOL/USDC", NATIVE_MINT);
        let non_native = pair("USDC/SOL", "EPjFWdd5AufqSSqeM2qN1xzybapC8G4wEGGkZwyTDt1v");

        let warnings = config.startup_warnings(std::slice::from_ref(&native));
        assert!(!warnings.iter().any(|w| w.contains("dynamic tip")));

        let warnings = config.startup_warnings(&[native, non_native]);
        let tip_warning = warnings
            .iter()
            .find(|w| w.contains("dynamic tip"))
            .expect("non-native pair under dynamic tip must warn");
        assert!(tip_warning.contains("USDC/SOL"));
        assert!(!tip_warning.contains("SOL/USDC,"));

        env::remove_var("JITO_ENABLED");
        env::remove_var("JITO_TIP_MODE");
    }
}
