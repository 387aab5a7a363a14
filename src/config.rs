// =============================================================================
// Engine Configuration — JSON file + environment overlay, atomic save
// =============================================================================
//
// Every tunable lives here. A JSON config file provides the base (all
// fields carry serde defaults, so old files survive new fields), and
// recognised environment variables overlay it — the deployment surface is
// env-first, the file is convenience. Secrets (API keys) are read from the
// environment by `main` and never serialised here.
//
// Persistence uses the tmp + rename pattern to prevent corruption on crash.
// =============================================================================

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::agents::rl_filter::RlConfig;
use crate::breaker::BreakerConfig;
use crate::retry::RetryPolicy;
use crate::risk::RiskConfig;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_true() -> bool {
    true
}

fn default_watchlist() -> Vec<String> {
    vec![
        "SPY".to_string(),
        "QQQ".to_string(),
        "IWM".to_string(),
        "DIA".to_string(),
    ]
}

fn default_index_symbol() -> String {
    "SPY".to_string()
}

fn default_daily_investment() -> f64 {
    1_000.0
}

fn default_lookback_days() -> u32 {
    60
}

fn default_max_retries() -> u32 {
    3
}

fn default_backoff_seconds() -> f64 {
    1.0
}

fn default_av_max_retries() -> u32 {
    1
}

fn default_av_seconds() -> f64 {
    15.0
}

fn default_cache_ttl_seconds() -> u64 {
    6 * 3600
}

fn default_cache_max_age_days() -> f64 {
    7.0
}

fn default_daily_loss_pct() -> f64 {
    0.02
}

fn default_max_consec_losses() -> u32 {
    3
}

fn default_max_api_errors() -> u32 {
    5
}

fn default_cooldown_seconds() -> u64 {
    3600
}

fn default_base_pct() -> f64 {
    0.01
}

fn default_kelly_safety() -> f64 {
    0.5
}

fn default_target_vol() -> f64 {
    0.15
}

fn default_max_symbol_pct() -> f64 {
    0.10
}

fn default_stop_atr_mult() -> f64 {
    2.0
}

fn default_state_expiry_hours() -> f64 {
    72.0
}

fn default_state_path() -> String {
    "state/system_state.json".to_string()
}

fn default_cache_dir() -> String {
    "state/cache".to_string()
}

fn default_health_log_path() -> String {
    "state/health.jsonl".to_string()
}

fn default_audit_log_path() -> String {
    "state/audit.jsonl".to_string()
}

fn default_buy_threshold() -> f64 {
    0.35
}

fn default_specialist_timeout_seconds() -> u64 {
    10
}

fn default_run_deadline_seconds() -> u64 {
    300
}

fn default_max_workers() -> usize {
    8
}

fn default_epsilon() -> f64 {
    0.1
}

fn default_alpha() -> f64 {
    0.1
}

fn default_gamma() -> f64 {
    0.95
}

fn default_override_threshold() -> f64 {
    0.2
}

fn default_llm_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_llm_max_tokens() -> u32 {
    256
}

// =============================================================================
// EngineConfig
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    // --- Operating mode ------------------------------------------------------

    /// Trade against paper brokers (in-memory fills). Live trading must be
    /// switched on explicitly.
    #[serde(default = "default_true")]
    pub paper_trading: bool,

    /// Cap on total new notional submitted per run.
    #[serde(default = "default_daily_investment")]
    pub daily_investment: f64,

    #[serde(default = "default_true")]
    pub enable_broker_failover: bool,

    // --- Universe ------------------------------------------------------------

    #[serde(default = "default_watchlist")]
    pub watchlist: Vec<String>,

    /// Index symbol used for the pre-market market-data smoke test.
    #[serde(default = "default_index_symbol")]
    pub index_symbol: String,

    #[serde(default = "default_lookback_days")]
    pub lookback_days: u32,

    // --- Market data sources -------------------------------------------------

    #[serde(default = "default_max_retries")]
    pub yfinance_max_retries: u32,
    #[serde(default = "default_backoff_seconds")]
    pub yfinance_initial_backoff_seconds: f64,

    #[serde(default = "default_max_retries")]
    pub alpaca_max_retries: u32,
    #[serde(default = "default_backoff_seconds")]
    pub alpaca_initial_backoff_seconds: f64,

    #[serde(default = "default_av_max_retries")]
    pub alphavantage_max_retries: u32,
    #[serde(default = "default_av_seconds")]
    pub alphavantage_backoff_seconds: f64,
    #[serde(default = "default_av_seconds")]
    pub alphavantage_min_interval_seconds: f64,

    #[serde(default = "default_cache_ttl_seconds")]
    pub cache_ttl_seconds: u64,
    #[serde(default = "default_cache_max_age_days")]
    pub cache_max_age_days: f64,

    // --- Circuit breaker -----------------------------------------------------

    /// Daily loss fraction that trips the breaker (0.02 = 2%).
    #[serde(default = "default_daily_loss_pct")]
    pub circuit_daily_loss_pct: f64,
    #[serde(default = "default_max_consec_losses")]
    pub circuit_max_consec_losses: u32,
    #[serde(default = "default_max_api_errors")]
    pub circuit_max_api_errors: u32,
    #[serde(default = "default_cooldown_seconds")]
    pub circuit_cooldown_seconds: u64,

    // --- Risk ----------------------------------------------------------------

    #[serde(default = "default_base_pct")]
    pub risk_base_pct: f64,
    #[serde(default = "default_kelly_safety")]
    pub risk_kelly_safety: f64,
    #[serde(default = "default_target_vol")]
    pub risk_target_vol: f64,
    #[serde(default = "default_max_symbol_pct")]
    pub risk_max_symbol_pct: f64,
    #[serde(default = "default_stop_atr_mult")]
    pub risk_stop_atr_mult: f64,
    #[serde(default)]
    pub risk_veto_on_stale: bool,

    // --- State & logs --------------------------------------------------------

    #[serde(default = "default_state_expiry_hours")]
    pub state_expiry_hours: f64,
    #[serde(default = "default_state_path")]
    pub state_path: String,
    #[serde(default = "default_cache_dir")]
    pub cache_dir: String,
    #[serde(default = "default_health_log_path")]
    pub health_log_path: String,
    #[serde(default = "default_audit_log_path")]
    pub audit_log_path: String,

    // --- Pipeline ------------------------------------------------------------

    #[serde(default = "default_buy_threshold")]
    pub buy_threshold: f64,
    #[serde(default = "default_specialist_timeout_seconds")]
    pub specialist_timeout_seconds: u64,
    #[serde(default = "default_run_deadline_seconds")]
    pub run_deadline_seconds: u64,
    /// Upper bound on the per-symbol worker pool; the effective pool is
    /// min(this, available cores).
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,

    // --- RL filter -----------------------------------------------------------

    #[serde(default = "default_true")]
    pub rl_enabled: bool,
    #[serde(default = "default_epsilon")]
    pub rl_epsilon: f64,
    #[serde(default = "default_alpha")]
    pub rl_alpha: f64,
    #[serde(default = "default_gamma")]
    pub rl_gamma: f64,
    #[serde(default = "default_override_threshold")]
    pub rl_override_threshold: f64,

    // --- LLM -----------------------------------------------------------------

    /// Empty endpoint disables the LLM; research degrades to HOLD.
    #[serde(default)]
    pub llm_endpoint: String,
    #[serde(default = "default_llm_model")]
    pub llm_model: String,
    #[serde(default = "default_llm_max_tokens")]
    pub llm_max_tokens: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        serde_json::from_str("{}").expect("empty config deserialises from defaults")
    }
}

impl EngineConfig {
    /// Load from a JSON file, then overlay environment variables.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config from {}", path.display()))?;
        let mut config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse config from {}", path.display()))?;
        config.apply_env();
        info!(path = %path.display(), watchlist = ?config.watchlist, "config loaded");
        Ok(config)
    }

    /// Defaults plus the environment overlay.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env();
        config
    }

    /// Overlay recognised environment variables onto the current values.
    pub fn apply_env(&mut self) {
        env_f64("DAILY_INVESTMENT", &mut self.daily_investment);
        env_bool("PAPER_TRADING", &mut self.paper_trading);
        env_bool("ENABLE_BROKER_FAILOVER", &mut self.enable_broker_failover);

        env_u32("YFINANCE_MAX_RETRIES", &mut self.yfinance_max_retries);
        env_f64(
            "YFINANCE_INITIAL_BACKOFF_SECONDS",
            &mut self.yfinance_initial_backoff_seconds,
        );
        env_u32("ALPACA_MAX_RETRIES", &mut self.alpaca_max_retries);
        env_f64(
            "ALPACA_INITIAL_BACKOFF_SECONDS",
            &mut self.alpaca_initial_backoff_seconds,
        );
        env_u32("ALPHAVANTAGE_MAX_RETRIES", &mut self.alphavantage_max_retries);
        env_f64(
            "ALPHAVANTAGE_BACKOFF_SECONDS",
            &mut self.alphavantage_backoff_seconds,
        );
        env_f64(
            "ALPHAVANTAGE_MIN_INTERVAL_SECONDS",
            &mut self.alphavantage_min_interval_seconds,
        );

        env_u64("CACHE_TTL_SECONDS", &mut self.cache_ttl_seconds);
        env_f64("CACHE_MAX_AGE_DAYS", &mut self.cache_max_age_days);

        env_f64("CIRCUIT_DAILY_LOSS_PCT", &mut self.circuit_daily_loss_pct);
        env_u32("CIRCUIT_MAX_CONSEC_LOSSES", &mut self.circuit_max_consec_losses);
        env_u32("CIRCUIT_MAX_API_ERRORS", &mut self.circuit_max_api_errors);

        env_f64("RISK_BASE_PCT", &mut self.risk_base_pct);
        env_f64("RISK_KELLY_SAFETY", &mut self.risk_kelly_safety);

        env_f64("STATE_EXPIRY_HOURS", &mut self.state_expiry_hours);

        if let Ok(raw) = std::env::var("MERIDIAN_WATCHLIST") {
            let symbols: Vec<String> = raw
                .split(',')
                .map(|s| s.trim().to_uppercase())
                .filter(|s| !s.is_empty())
                .collect();
            if !symbols.is_empty() {
                self.watchlist = symbols;
            }
        }
    }

    /// Persist the current configuration atomically (tmp + rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let content =
            serde_json::to_string_pretty(self).context("failed to serialise config to JSON")?;
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp.display()))?;
        std::fs::rename(&tmp, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;
        info!(path = %path.display(), "config saved (atomic)");
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Derived component configs
    // -------------------------------------------------------------------------

    pub fn breaker_config(&self) -> BreakerConfig {
        BreakerConfig {
            daily_loss_pct: self.circuit_daily_loss_pct,
            max_consec_losses: self.circuit_max_consec_losses,
            max_api_errors: self.circuit_max_api_errors,
            cooldown: Duration::from_secs(self.circuit_cooldown_seconds),
        }
    }

    pub fn risk_config(&self) -> RiskConfig {
        RiskConfig {
            base_pct: self.risk_base_pct,
            kelly_safety: self.risk_kelly_safety,
            target_vol: self.risk_target_vol,
            max_symbol_pct: self.risk_max_symbol_pct,
            stop_atr_mult: self.risk_stop_atr_mult,
            veto_on_stale: self.risk_veto_on_stale,
        }
    }

    pub fn rl_config(&self) -> RlConfig {
        RlConfig {
            enabled: self.rl_enabled,
            epsilon: self.rl_epsilon,
            alpha: self.rl_alpha,
            gamma: self.rl_gamma,
            override_threshold: self.rl_override_threshold,
            seed: None,
        }
    }

    pub fn yfinance_retry(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.yfinance_max_retries,
            Duration::from_secs_f64(self.yfinance_initial_backoff_seconds),
        )
    }

    pub fn alpaca_retry(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.alpaca_max_retries,
            Duration::from_secs_f64(self.alpaca_initial_backoff_seconds),
        )
    }

    pub fn alphavantage_retry(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.alphavantage_max_retries,
            Duration::from_secs_f64(self.alphavantage_backoff_seconds),
        )
    }

    /// Effective per-symbol worker pool: min(configured, cores).
    pub fn effective_workers(&self) -> usize {
        let cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        self.max_workers.min(cores).max(1)
    }

    pub fn specialist_timeout(&self) -> Duration {
        Duration::from_secs(self.specialist_timeout_seconds)
    }

    pub fn run_deadline(&self) -> Duration {
        Duration::from_secs(self.run_deadline_seconds)
    }
}

// =============================================================================
// Env parsing helpers
// =============================================================================

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    let raw = std::env::var(key).ok()?;
    match raw.trim().parse::<T>() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(key, raw, "ignoring unparseable environment override");
            None
        }
    }
}

fn env_f64(key: &str, target: &mut f64) {
    if let Some(v) = env_parse::<f64>(key) {
        *target = v;
    }
}

fn env_u32(key: &str, target: &mut u32) {
    if let Some(v) = env_parse::<u32>(key) {
        *target = v;
    }
}

fn env_u64(key: &str, target: &mut u64) {
    if let Some(v) = env_parse::<u64>(key) {
        *target = v;
    }
}

fn env_bool(key: &str, target: &mut bool) {
    if let Ok(raw) = std::env::var(key) {
        match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => *target = true,
            "0" | "false" | "no" | "off" => *target = false,
            _ => warn!(key, raw, "ignoring unparseable boolean override"),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_contract() {
        let cfg = EngineConfig::default();
        assert!(cfg.paper_trading);
        assert!(cfg.enable_broker_failover);
        assert_eq!(cfg.lookback_days, 60);
        assert!((cfg.circuit_daily_loss_pct - 0.02).abs() < 1e-12);
        assert_eq!(cfg.circuit_max_consec_losses, 3);
        assert_eq!(cfg.circuit_max_api_errors, 5);
        assert!((cfg.risk_base_pct - 0.01).abs() < 1e-12);
        assert!((cfg.state_expiry_hours - 72.0).abs() < 1e-12);
        assert!((cfg.alphavantage_min_interval_seconds - 15.0).abs() < 1e-12);
        assert_eq!(cfg.cache_ttl_seconds, 21_600);
        assert!((cfg.buy_threshold - 0.35).abs() < 1e-12);
        assert_eq!(cfg.specialist_timeout_seconds, 10);
        assert_eq!(cfg.run_deadline_seconds, 300);
    }

    #[test]
    fn empty_json_deserialises_to_defaults() {
        let cfg: EngineConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.watchlist, default_watchlist());
        assert!(cfg.rl_enabled);
    }

    #[test]
    fn partial_json_fills_defaults() {
        let json = r#"{ "watchlist": ["SPY"], "lookback_days": 30 }"#;
        let cfg: EngineConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.watchlist, vec!["SPY"]);
        assert_eq!(cfg.lookback_days, 30);
        assert_eq!(cfg.circuit_max_consec_losses, 3);
    }

    #[test]
    fn save_load_roundtrip() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("config.json");

        let mut cfg = EngineConfig::default();
        cfg.watchlist = vec!["QQQ".into()];
        cfg.daily_investment = 2_500.0;
        cfg.save(&path).unwrap();

        let loaded = EngineConfig::load(&path).unwrap();
        assert_eq!(loaded.watchlist, vec!["QQQ"]);
        assert!((loaded.daily_investment - 2_500.0).abs() < 1e-12);
    }

    #[test]
    fn derived_configs_carry_values_through() {
        let mut cfg = EngineConfig::default();
        cfg.circuit_daily_loss_pct = 0.03;
        cfg.risk_kelly_safety = 0.25;
        cfg.yfinance_max_retries = 7;

        assert!((cfg.breaker_config().daily_loss_pct - 0.03).abs() < 1e-12);
        assert!((cfg.risk_config().kelly_safety - 0.25).abs() < 1e-12);
        assert_eq!(cfg.yfinance_retry().max_retries, 7);
    }

    #[test]
    fn effective_workers_is_bounded() {
        let mut cfg = EngineConfig::default();
        cfg.max_workers = 1_000;
        let effective = cfg.effective_workers();
        assert!(effective >= 1);
        assert!(effective <= 1_000);

        cfg.max_workers = 0;
        assert_eq!(cfg.effective_workers(), 1);
    }
}
