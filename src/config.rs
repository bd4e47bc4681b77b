// =============================================================================
// Runtime Configuration — settings recognized at startup, with atomic save
// =============================================================================
//
// All fields carry `#[serde(default = "...")]` so that adding a new field
// never breaks loading an older config file.  Persistence uses an atomic
// tmp + rename pattern to prevent corruption on crash.
// =============================================================================

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::types::{Env, TriggerMode};

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_env() -> Env {
    Env::Paper
}

fn default_symbol() -> String {
    "ETHUSDT".to_string()
}

fn default_true() -> bool {
    true
}

fn default_loop_trigger() -> TriggerMode {
    TriggerMode::Timer
}

fn default_loop_interval_sec() -> u64 {
    60
}

fn default_loop_cooldown_sec() -> u64 {
    30
}

fn default_loop_backoff_max_sec() -> u64 {
    60
}

fn default_mp_window_sec() -> i64 {
    60
}

fn default_mp_delta_pct() -> f64 {
    0.5
}

fn default_kline_range_pct() -> f64 {
    0.8
}

fn default_vol_lookback() -> usize {
    20
}

fn default_vol_mult() -> f64 {
    2.0
}

fn default_ai_conf_threshold() -> f64 {
    0.5
}

fn default_max_orders() -> u32 {
    6
}

fn default_forbidden_windows() -> Vec<String> {
    Vec::new()
}

fn default_recent_candles() -> usize {
    100
}

// =============================================================================
// RuntimeConfig
// =============================================================================

/// Recognized runtime settings and their effects. Every field has a serde
/// default so older JSON files missing new
/// fields still deserialize correctly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// `paper` selects testnet URLs; `live` selects mainnet.
    #[serde(default = "default_env")]
    pub env: Env,

    /// Target symbol. One symbol per process.
    #[serde(default = "default_symbol")]
    pub symbol: String,

    /// Skip actual order submission; log params; simulate fills.
    #[serde(default)]
    pub dry_run: bool,

    /// Run the trigger loop continuously; otherwise single-shot.
    #[serde(default = "default_true")]
    pub loop_enable: bool,

    /// Which of {timer, kline, event} selects a cycle invocation.
    #[serde(default = "default_loop_trigger")]
    pub loop_trigger: TriggerMode,

    /// Timer-mode period between cycles.
    #[serde(default = "default_loop_interval_sec")]
    pub loop_interval_sec: u64,

    /// Minimum elapsed time between two consecutive cycle invocations for
    /// the kline and event trigger modes.
    #[serde(default = "default_loop_cooldown_sec")]
    pub loop_cooldown_sec: u64,

    /// Ceiling for the exponential error back-off.
    #[serde(default = "default_loop_backoff_max_sec")]
    pub loop_backoff_max_sec: u64,

    /// Mark-price spike rule: sliding-window width.
    #[serde(default = "default_mp_window_sec")]
    pub mp_window_sec: i64,

    /// Mark-price spike rule: percent delta threshold.
    #[serde(default = "default_mp_delta_pct")]
    pub mp_delta_pct: f64,

    /// Candle range rule threshold (percent of close).
    #[serde(default = "default_kline_range_pct")]
    pub kline_range_pct: f64,

    /// Candle volume rule: rolling window length.
    #[serde(default = "default_vol_lookback")]
    pub vol_lookback: usize,

    /// Candle volume rule: multiple of the rolling mean required to fire.
    #[serde(default = "default_vol_mult")]
    pub vol_mult: f64,

    /// Use quote volume (true) or base volume (false) for the volume rule.
    #[serde(default = "default_true")]
    pub use_quote_volume: bool,

    /// Confidence gate threshold, clamped to [0, 1] at use-site.
    #[serde(default = "default_ai_conf_threshold")]
    pub ai_conf_threshold: f64,

    /// Master switch for WebSocket stream consumption.
    #[serde(default = "default_true")]
    pub ws_enable: bool,

    /// Subscribe to the user-data (order update) stream.
    #[serde(default = "default_true")]
    pub ws_user_enable: bool,

    /// Subscribe to the mark-price / kline streams.
    #[serde(default = "default_true")]
    pub ws_price_enable: bool,

    /// `HH:MM-HH:MM` UTC windows during which the cycle records a
    /// `forbidden_window` notice but still runs.
    #[serde(default = "default_forbidden_windows")]
    pub forbidden_windows: Vec<String>,

    /// Venue-level cap on concurrent open orders surfaced to the advisor
    /// as part of the market snapshot's constraints.
    #[serde(default = "default_max_orders")]
    pub max_orders: u32,

    /// Length of the recent-candle series included in each market snapshot.
    #[serde(default = "default_recent_candles")]
    pub recent_candles: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            env: default_env(),
            symbol: default_symbol(),
            dry_run: false,
            loop_enable: true,
            loop_trigger: default_loop_trigger(),
            loop_interval_sec: default_loop_interval_sec(),
            loop_cooldown_sec: default_loop_cooldown_sec(),
            loop_backoff_max_sec: default_loop_backoff_max_sec(),
            mp_window_sec: default_mp_window_sec(),
            mp_delta_pct: default_mp_delta_pct(),
            kline_range_pct: default_kline_range_pct(),
            vol_lookback: default_vol_lookback(),
            vol_mult: default_vol_mult(),
            use_quote_volume: true,
            ai_conf_threshold: default_ai_conf_threshold(),
            ws_enable: true,
            ws_user_enable: true,
            ws_price_enable: true,
            forbidden_windows: default_forbidden_windows(),
            max_orders: default_max_orders(),
            recent_candles: default_recent_candles(),
        }
    }
}

impl RuntimeConfig {
    /// Load configuration from a JSON file at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read runtime config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse runtime config from {}", path.display()))?;

        info!(
            path = %path.display(),
            symbol = %config.symbol,
            env = ?config.env,
            "runtime config loaded"
        );

        Ok(config)
    }

    /// Persist the current configuration to `path` using an atomic write
    /// (write to `.tmp`, then rename) so a crash mid-write never leaves a
    /// corrupt config file behind.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content = serde_json::to_string_pretty(self)
            .context("failed to serialise runtime config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "runtime config saved (atomic)");
        Ok(())
    }

    /// Confidence gate threshold, clamped to [0, 1].
    pub fn clamped_conf_threshold(&self) -> f64 {
        self.ai_conf_threshold.clamp(0.0, 1.0)
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_expected_values() {
        let cfg = RuntimeConfig::default();
        assert_eq!(cfg.env, Env::Paper);
        assert_eq!(cfg.symbol, "ETHUSDT");
        assert!(!cfg.dry_run);
        assert_eq!(cfg.loop_trigger, TriggerMode::Timer);
        assert!((cfg.ai_conf_threshold - 0.5).abs() < f64::EPSILON);
        assert!(cfg.ws_enable);
    }

    #[test]
    fn deserialise_empty_json_uses_defaults() {
        let cfg: RuntimeConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.symbol, "ETHUSDT");
        assert!(cfg.loop_enable);
        assert_eq!(cfg.vol_lookback, 20);
    }

    #[test]
    fn deserialise_partial_json_fills_defaults() {
        let json = r#"{ "symbol": "BTCUSDT", "loop_trigger": "kline" }"#;
        let cfg: RuntimeConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.symbol, "BTCUSDT");
        assert_eq!(cfg.loop_trigger, TriggerMode::Kline);
        assert_eq!(cfg.loop_cooldown_sec, 30);
    }

    #[test]
    fn roundtrip_serialisation() {
        let cfg = RuntimeConfig::default();
        let json = serde_json::to_string(&cfg).unwrap();
        let cfg2: RuntimeConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(cfg.symbol, cfg2.symbol);
        assert_eq!(cfg.loop_trigger, cfg2.loop_trigger);
        assert_eq!(cfg.env, cfg2.env);
    }

    #[test]
    fn threshold_clamps_out_of_range_values() {
        let mut cfg = RuntimeConfig::default();
        cfg.ai_conf_threshold = 1.7;
        assert_eq!(cfg.clamped_conf_threshold(), 1.0);
        cfg.ai_conf_threshold = -0.3;
        assert_eq!(cfg.clamped_conf_threshold(), 0.0);
    }

    #[test]
    fn save_then_load_round_trips_via_temp_file() {
        let dir = std::env::temp_dir().join(format!("rtcfg-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config.json");

        let mut cfg = RuntimeConfig::default();
        cfg.symbol = "SOLUSDT".to_string();
        cfg.save(&path).unwrap();

        let loaded = RuntimeConfig::load(&path).unwrap();
        assert_eq!(loaded.symbol, "SOLUSDT");

        std::fs::remove_dir_all(&dir).ok();
    }
}
