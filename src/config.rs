// =============================================================================
// Engine Configuration — serde-defaulted settings with atomic save
// =============================================================================
//
// Every tunable of the engine core lives here. All fields carry
// `#[serde(default)]` so that adding new fields never breaks loading an
// older config file. Persistence uses an atomic tmp + rename pattern to
// prevent corruption on crash.
//
// Planner stage toggles are special: they are also persisted as a single
// row in config.db (see db::settings) so the planning batch picks up edits
// made through the settings store without a restart.
// =============================================================================

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_true() -> bool {
    true
}

fn default_workers() -> usize {
    4
}

fn default_queue_poll_interval_ms() -> u64 {
    100
}

fn default_progress_throttle_ms() -> u64 {
    500
}

fn default_lock_acquire_retry_ms() -> u64 {
    100
}

fn default_lock_dir() -> String {
    "data/locks".to_string()
}

fn default_data_dir() -> String {
    "data".to_string()
}

fn default_base_currency() -> String {
    "EUR".to_string()
}

fn default_market_status_url() -> String {
    "https://api.marketdata.example.com/markets/status".to_string()
}

fn default_market_status_cache_ttl_secs() -> u64 {
    6 * 60 * 60
}

fn default_market_status_http_timeout_secs() -> u64 {
    10
}

fn default_ws_url() -> String {
    "wss://stream.marketdata.example.com/socket".to_string()
}

fn default_ws_base_reconnect_delay_secs() -> u64 {
    5
}

fn default_ws_max_reconnect_delay_secs() -> u64 {
    5 * 60
}

fn default_ws_pong_wait_secs() -> u64 {
    60
}

fn default_ws_cache_stale_secs() -> u64 {
    5 * 60
}

fn default_limit_order_buffer_percent() -> f64 {
    0.05
}

fn default_min_trade_size() -> f64 {
    250.0
}

fn default_max_trades_per_symbol_per_day() -> u32 {
    2
}

fn default_sell_cooldown_secs() -> i64 {
    3 * 24 * 60 * 60
}

fn default_min_hold_secs() -> i64 {
    7 * 24 * 60 * 60
}

fn default_planner_max_sequences() -> usize {
    512
}

fn default_planner_result_ttl_secs() -> i64 {
    10 * 60
}

// =============================================================================
// PlannerSettings
// =============================================================================

/// Which pipeline stages the planning batch runs, in fixed stage order.
///
/// Persisted as one row in config.db so edits survive restarts and are
/// visible to the next batch without reloading the engine config file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlannerSettings {
    // Patterns
    #[serde(default = "default_true")]
    pub enable_single_buy: bool,
    #[serde(default = "default_true")]
    pub enable_rebalance_overweight: bool,
    #[serde(default = "default_true")]
    pub enable_swap_pair: bool,

    // Generators
    #[serde(default = "default_true")]
    pub enable_combine_pairs: bool,
    #[serde(default = "default_true")]
    pub enable_scale_down: bool,

    // Filters
    #[serde(default = "default_true")]
    pub enable_universe_eligibility: bool,
    #[serde(default = "default_true")]
    pub enable_symbol_diversity: bool,
    #[serde(default = "default_true")]
    pub enable_recent_trade: bool,

    /// Exploration budget per batch. Hitting the cap marks the batch
    /// partial and re-enqueues it.
    #[serde(default = "default_planner_max_sequences")]
    pub max_sequences: usize,

    /// A best result younger than this short-circuits a new batch for the
    /// same portfolio hash.
    #[serde(default = "default_planner_result_ttl_secs")]
    pub result_ttl_secs: i64,
}

impl Default for PlannerSettings {
    fn default() -> Self {
        serde_json::from_str("{}").expect("empty PlannerSettings deserialises")
    }
}

impl PlannerSettings {
    /// Enabled pattern names in registration order.
    pub fn enabled_patterns(&self) -> Vec<&'static str> {
        let mut names = Vec::new();
        if self.enable_single_buy {
            names.push("single_buy");
        }
        if self.enable_rebalance_overweight {
            names.push("rebalance_overweight");
        }
        if self.enable_swap_pair {
            names.push("swap_pair");
        }
        names
    }

    pub fn enabled_generators(&self) -> Vec<&'static str> {
        let mut names = Vec::new();
        if self.enable_combine_pairs {
            names.push("combine_pairs");
        }
        if self.enable_scale_down {
            names.push("scale_down");
        }
        names
    }

    pub fn enabled_filters(&self) -> Vec<&'static str> {
        let mut names = Vec::new();
        if self.enable_universe_eligibility {
            names.push("universe_eligibility");
        }
        if self.enable_symbol_diversity {
            names.push("symbol_diversity");
        }
        if self.enable_recent_trade {
            names.push("recent_trade");
        }
        names
    }
}

// =============================================================================
// EngineConfig
// =============================================================================

/// Top-level configuration for the engine core.
///
/// Every field has a serde default so that older JSON files missing new
/// fields will still deserialise correctly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    // --- Worker pool ---------------------------------------------------------

    /// Number of parallel job workers.
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Sleep between queue polls when the queue is empty.
    #[serde(default = "default_queue_poll_interval_ms")]
    pub queue_poll_interval_ms: u64,

    /// Minimum spacing between non-terminal progress events per reporter.
    #[serde(default = "default_progress_throttle_ms")]
    pub progress_throttle_ms: u64,

    // --- Locks ---------------------------------------------------------------

    /// Retry tick while waiting for a named lock.
    #[serde(default = "default_lock_acquire_retry_ms")]
    pub lock_acquire_retry_ms: u64,

    /// Directory holding the advisory lock files.
    #[serde(default = "default_lock_dir")]
    pub lock_dir: String,

    // --- Storage -------------------------------------------------------------

    /// Directory holding the SQLite databases.
    #[serde(default = "default_data_dir")]
    pub data_dir: String,

    /// Currency all trade-size thresholds are expressed in.
    #[serde(default = "default_base_currency")]
    pub base_currency: String,

    // --- Market status (HTTP) ------------------------------------------------

    /// Status endpoint consulted before falling back to local calendars.
    #[serde(default = "default_market_status_url")]
    pub market_status_url: String,

    #[serde(default = "default_market_status_cache_ttl_secs")]
    pub market_status_cache_ttl_secs: u64,

    #[serde(default = "default_market_status_http_timeout_secs")]
    pub market_status_http_timeout_secs: u64,

    // --- Market status (WebSocket) -------------------------------------------

    #[serde(default = "default_ws_url")]
    pub ws_url: String,

    #[serde(default = "default_ws_base_reconnect_delay_secs")]
    pub ws_base_reconnect_delay_secs: u64,

    #[serde(default = "default_ws_max_reconnect_delay_secs")]
    pub ws_max_reconnect_delay_secs: u64,

    #[serde(default = "default_ws_pong_wait_secs")]
    pub ws_pong_wait_secs: u64,

    #[serde(default = "default_ws_cache_stale_secs")]
    pub ws_cache_stale_secs: u64,

    // --- Trading gates -------------------------------------------------------

    /// Limit price buffer over the hint (0.05 = 5 % through the hint).
    #[serde(default = "default_limit_order_buffer_percent")]
    pub limit_order_buffer_percent: f64,

    /// Minimum trade size in `base_currency`.
    #[serde(default = "default_min_trade_size")]
    pub min_trade_size: f64,

    /// Per-symbol trade count cap within a rolling day.
    #[serde(default = "default_max_trades_per_symbol_per_day")]
    pub max_trades_per_symbol_per_day: u32,

    /// Buy-back cooldown after a sell of the same symbol.
    #[serde(default = "default_sell_cooldown_secs")]
    pub sell_cooldown_secs: i64,

    /// Minimum hold duration before a recently-opened position may be sold.
    #[serde(default = "default_min_hold_secs")]
    pub min_hold_secs: i64,

    // --- Planner -------------------------------------------------------------

    /// Pipeline stage toggles; also persisted in config.db.
    #[serde(default)]
    pub planner: PlannerSettings,
}

impl Default for EngineConfig {
    fn default() -> Self {
        serde_json::from_str("{}").expect("empty EngineConfig deserialises")
    }
}

impl EngineConfig {
    pub fn queue_poll_interval(&self) -> Duration {
        Duration::from_millis(self.queue_poll_interval_ms)
    }

    pub fn progress_throttle(&self) -> Duration {
        Duration::from_millis(self.progress_throttle_ms)
    }

    pub fn lock_acquire_retry(&self) -> Duration {
        Duration::from_millis(self.lock_acquire_retry_ms)
    }

    pub fn market_status_http_timeout(&self) -> Duration {
        Duration::from_secs(self.market_status_http_timeout_secs)
    }

    /// Load configuration from a JSON file at `path`.
    ///
    /// If the file does not exist, returns an error so the caller can fall
    /// back to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read engine config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse engine config from {}", path.display()))?;

        info!(
            path = %path.display(),
            workers = config.workers,
            "engine config loaded"
        );

        Ok(config)
    }

    /// Persist the current configuration to `path` using an atomic write
    /// (write to `.tmp`, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content = serde_json::to_string_pretty(self)
            .context("failed to serialise engine config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "engine config saved (atomic)");
        Ok(())
    }
}
