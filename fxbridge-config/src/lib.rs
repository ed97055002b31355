//! Layered configuration loading utilities.

use std::path::{Path, PathBuf};

use anyhow::Result;
use config::{Config, ConfigError, Environment, File};
use rust_decimal::Decimal;
use serde::Deserialize;

/// Root application configuration deserialized from layered sources.
#[derive(Debug, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub risk: RiskConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub accounts: Vec<AccountConfig>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            cache: CacheConfig::default(),
            store: StoreConfig::default(),
            dispatch: DispatchConfig::default(),
            risk: RiskConfig::default(),
            metrics: MetricsConfig::default(),
            accounts: Vec::new(),
        }
    }
}

/// Projection cache tuning. TTL-bearing keys are kept alive by the session
/// sweep, which runs on `risk.sweep_interval_ms`.
#[derive(Clone, Debug, Deserialize)]
pub struct CacheConfig {
    /// TTL applied to every TTL-bearing projection key.
    #[serde(default = "default_cache_ttl_ms")]
    pub ttl_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_ms: default_cache_ttl_ms(),
        }
    }
}

/// Durable store locations.
#[derive(Clone, Debug, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_history_path")]
    pub history_path: PathBuf,
    #[serde(default = "default_instructions_path")]
    pub instructions_path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            history_path: default_history_path(),
            instructions_path: default_instructions_path(),
        }
    }
}

/// Instruction queue dispatcher tuning.
#[derive(Clone, Debug, Deserialize)]
pub struct DispatchConfig {
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Only instructions younger than this window are ever picked up.
    #[serde(default = "default_lookback_secs")]
    pub lookback_secs: u64,
    /// Hard upper bound on any single gateway submission.
    #[serde(default = "default_command_timeout_ms")]
    pub command_timeout_ms: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    /// How long an Open waits for a first quote on a cold symbol.
    #[serde(default = "default_quote_wait_ms")]
    pub quote_wait_ms: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            lookback_secs: default_lookback_secs(),
            command_timeout_ms: default_command_timeout_ms(),
            max_retries: default_max_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
            quote_wait_ms: default_quote_wait_ms(),
        }
    }
}

/// Shared tuning for the two autonomous risk managers. All distances are in
/// pips of the order's symbol.
#[derive(Clone, Debug, Deserialize)]
pub struct RiskConfig {
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,
    #[serde(default)]
    pub stop_management: StopManagementConfig,
    #[serde(default)]
    pub loss_averaging: LossAveragingConfig,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            sweep_interval_ms: default_sweep_interval_ms(),
            stop_management: StopManagementConfig::default(),
            loss_averaging: LossAveragingConfig::default(),
        }
    }
}

/// Stepped trailing-stop parameters.
#[derive(Clone, Debug, Deserialize)]
pub struct StopManagementConfig {
    /// Profit distance below which stops are never touched.
    #[serde(default = "default_msl_min_profit_pips")]
    pub min_profit_pips: Decimal,
    /// Profit distance at which the first stop is placed.
    #[serde(default = "default_msl_first_level_pips")]
    pub first_level_pips: Decimal,
    /// Stop distance from open once the first level is reached.
    #[serde(default = "default_msl_first_stop_pips")]
    pub first_stop_pips: Decimal,
    /// Width of each subsequent staircase step.
    #[serde(default = "default_msl_step_pips")]
    pub step_pips: Decimal,
    /// A new stop must improve on the current one by at least this much.
    #[serde(default = "default_msl_min_improvement_pips")]
    pub min_improvement_pips: Decimal,
    /// Take-profit written alongside each stop, beyond the new stop.
    #[serde(default = "default_msl_paired_tp_pips")]
    pub paired_take_profit_pips: Decimal,
}

impl Default for StopManagementConfig {
    fn default() -> Self {
        Self {
            min_profit_pips: default_msl_min_profit_pips(),
            first_level_pips: default_msl_first_level_pips(),
            first_stop_pips: default_msl_first_stop_pips(),
            step_pips: default_msl_step_pips(),
            min_improvement_pips: default_msl_min_improvement_pips(),
            paired_take_profit_pips: default_msl_paired_tp_pips(),
        }
    }
}

/// Loss-averaging parameters.
#[derive(Clone, Debug, Deserialize)]
pub struct LossAveragingConfig {
    /// Adverse excursion per severity level.
    #[serde(default = "default_lp_level_gap_pips")]
    pub level_gap_pips: Decimal,
    /// Minimum distance a losing order must keep from its own stop before
    /// it is averaged; closer than this it is left to resolve on its own.
    #[serde(default = "default_lp_stop_buffer_pips")]
    pub stop_buffer_pips: Decimal,
    /// Cooldown after a timed-out submission before the account may average
    /// again.
    #[serde(default = "default_lp_cooldown_secs")]
    pub cooldown_secs: u64,
}

impl Default for LossAveragingConfig {
    fn default() -> Self {
        Self {
            level_gap_pips: default_lp_level_gap_pips(),
            stop_buffer_pips: default_lp_stop_buffer_pips(),
            cooldown_secs: default_lp_cooldown_secs(),
        }
    }
}

/// Gauge sampling cadence.
#[derive(Clone, Debug, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_sample_interval_ms")]
    pub sample_interval_ms: u64,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            sample_interval_ms: default_sample_interval_ms(),
        }
    }
}

/// One account the engine should run a session for.
#[derive(Clone, Debug, Deserialize)]
pub struct AccountConfig {
    pub login: u32,
    #[serde(default)]
    pub server: String,
    /// Master accounts may receive instructions; read-only mirrors may not.
    #[serde(default = "default_true")]
    pub master: bool,
    #[serde(default)]
    pub manage_stop_loss: bool,
    #[serde(default)]
    pub average_losing_positions: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_cache_ttl_ms() -> u64 {
    2_000
}

fn default_history_path() -> PathBuf {
    PathBuf::from("./data/history.db")
}

fn default_instructions_path() -> PathBuf {
    PathBuf::from("./data/instructions.db")
}

fn default_poll_interval_ms() -> u64 {
    200
}

fn default_lookback_secs() -> u64 {
    60
}

fn default_command_timeout_ms() -> u64 {
    2_000
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_backoff_ms() -> u64 {
    200
}

fn default_quote_wait_ms() -> u64 {
    5_000
}

fn default_sweep_interval_ms() -> u64 {
    500
}

fn default_msl_min_profit_pips() -> Decimal {
    Decimal::from(10u8)
}

fn default_msl_first_level_pips() -> Decimal {
    Decimal::from(20u8)
}

fn default_msl_first_stop_pips() -> Decimal {
    Decimal::from(5u8)
}

fn default_msl_step_pips() -> Decimal {
    Decimal::from(10u8)
}

fn default_msl_min_improvement_pips() -> Decimal {
    Decimal::ONE
}

fn default_msl_paired_tp_pips() -> Decimal {
    Decimal::ONE_HUNDRED
}

fn default_lp_level_gap_pips() -> Decimal {
    Decimal::from(10u8)
}

fn default_lp_stop_buffer_pips() -> Decimal {
    Decimal::from(10u8)
}

fn default_lp_cooldown_secs() -> u64 {
    60
}

fn default_sample_interval_ms() -> u64 {
    1_000
}

fn default_true() -> bool {
    true
}

/// Loads configuration by merging files and environment variables.
///
/// Sources (lowest to highest precedence):
/// 1. `config/default.toml`
/// 2. `config/{environment}.toml` (if `environment` is Some)
/// 3. `config/local.toml` (optional, ignored in git)
/// 4. Environment variables prefixed with `FXBRIDGE_`
pub fn load_config(env: Option<&str>) -> Result<AppConfig> {
    let base_path = Path::new("config");

    let mut builder =
        Config::builder().add_source(File::from(base_path.join("default.toml")).required(false));
    if let Some(env_name) = env {
        builder = builder
            .add_source(File::from(base_path.join(format!("{env_name}.toml"))).required(false));
    }

    builder = builder.add_source(File::from(base_path.join("local.toml")).required(false));

    builder = builder.add_source(
        Environment::with_prefix("FXBRIDGE")
            .separator("__")
            .ignore_empty(true),
    );

    let config = builder.build()?;
    config
        .try_deserialize()
        .map_err(|err: ConfigError| err.into())
}
