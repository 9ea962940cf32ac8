// =============================================================================
// Screener Configuration — tunables with atomic save
// =============================================================================
//
// Every tunable named in the spec's process-configuration section lives here.
// Fields carry `#[serde(default = "...")]` so that adding a field never
// breaks loading an older config file.
//
// Persistence uses an atomic tmp + rename pattern to prevent corruption on
// crash, matching the pattern used for user-store writes.
// =============================================================================

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

fn default_cluster_interval() -> f64 {
    0.1
}

fn default_candle_timeframe_sec() -> i64 {
    60
}

fn default_atr_period() -> usize {
    14
}

fn default_atr_multiplier() -> f64 {
    2.2
}

fn default_max_clusters() -> usize {
    150
}

fn default_impulse_min_clusters() -> usize {
    2
}

fn default_impulse_min_trades() -> u64 {
    1000
}

fn default_anti_spam_per_symbol() -> f64 {
    180.0
}

fn default_anti_spam_burst_count() -> usize {
    5
}

fn default_anti_spam_burst_window() -> f64 {
    30.0
}

fn default_anti_spam_silence() -> f64 {
    30.0
}

fn default_impulse_fixed_threshold_pct() -> f64 {
    1.5
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    9001
}

fn default_detector_queue_capacity() -> usize {
    20_000
}

fn default_chat_queue_capacity() -> usize {
    2_000
}

fn default_detector_workers() -> usize {
    2
}

/// Central, hot-reloadable tunables for the screener engine.
///
/// All fields carry a serde default so that a partial (or empty) JSON config
/// file still deserializes into sensible values.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScreenerConfig {
    /// Width in seconds of one price/volume cluster bucket.
    #[serde(default = "default_cluster_interval")]
    pub cluster_interval: f64,

    /// Width in seconds of one ATR candle (bucket = floor(ts / this)).
    #[serde(default = "default_candle_timeframe_sec")]
    pub candle_timeframe_sec: i64,

    /// Number of closed bars averaged into the ATR.
    #[serde(default = "default_atr_period")]
    pub atr_period: usize,

    /// ATR multiplier in the impulse trigger condition.
    #[serde(default = "default_atr_multiplier")]
    pub atr_multiplier: f64,

    /// Ring-buffer capacity (clusters per symbol).
    #[serde(default = "default_max_clusters")]
    pub max_clusters: usize,

    /// Minimum clusters visited before a reference price may trigger.
    #[serde(default = "default_impulse_min_clusters")]
    pub impulse_min_clusters: usize,

    /// Minimum trades between ref_cid and the current cid.
    #[serde(default = "default_impulse_min_trades")]
    pub impulse_min_trades: u64,

    /// Minimum seconds between two impulse events for the same symbol.
    #[serde(default = "default_anti_spam_per_symbol")]
    pub anti_spam_per_symbol: f64,

    /// Number of events within the burst window that triggers silence.
    #[serde(default = "default_anti_spam_burst_count")]
    pub anti_spam_burst_count: usize,

    /// Width in seconds of the burst-counting window.
    #[serde(default = "default_anti_spam_burst_window")]
    pub anti_spam_burst_window: f64,

    /// Seconds of global silence once the burst threshold trips.
    #[serde(default = "default_anti_spam_silence")]
    pub anti_spam_silence: f64,

    /// Fixed percentage threshold used when dynamic thresholding is off, or
    /// as the default for symbols absent from the universe epoch.
    #[serde(default = "default_impulse_fixed_threshold_pct")]
    pub impulse_fixed_threshold_pct: f64,

    /// Whether per-symbol thresholds come from the universe epoch (volume-
    /// scaled) instead of the fixed percentage above.
    #[serde(default)]
    pub enable_dynamic_threshold: bool,

    /// PushHub bind host.
    #[serde(default = "default_host")]
    pub host: String,

    /// PushHub bind port.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Symbols to track. Empty means "use the universe fetcher's result".
    #[serde(default)]
    pub symbols: Vec<String>,

    /// Bounded detector queue capacity (spec.md §5 backpressure).
    #[serde(default = "default_detector_queue_capacity")]
    pub detector_queue_capacity: usize,

    /// Bounded chat sink queue capacity (spec.md §5 backpressure).
    #[serde(default = "default_chat_queue_capacity")]
    pub chat_queue_capacity: usize,

    /// Number of detector worker tasks.
    #[serde(default = "default_detector_workers")]
    pub detector_workers: usize,

    /// Optional JSONL file every delivered impulse is appended to, for
    /// later offline analysis (see the `impulse_stats` binary). `None`
    /// disables logging.
    #[serde(default)]
    pub impulse_log_path: Option<String>,
}

impl Default for ScreenerConfig {
    fn default() -> Self {
        Self {
            cluster_interval: default_cluster_interval(),
            candle_timeframe_sec: default_candle_timeframe_sec(),
            atr_period: default_atr_period(),
            atr_multiplier: default_atr_multiplier(),
            max_clusters: default_max_clusters(),
            impulse_min_clusters: default_impulse_min_clusters(),
            impulse_min_trades: default_impulse_min_trades(),
            anti_spam_per_symbol: default_anti_spam_per_symbol(),
            anti_spam_burst_count: default_anti_spam_burst_count(),
            anti_spam_burst_window: default_anti_spam_burst_window(),
            anti_spam_silence: default_anti_spam_silence(),
            impulse_fixed_threshold_pct: default_impulse_fixed_threshold_pct(),
            enable_dynamic_threshold: false,
            host: default_host(),
            port: default_port(),
            symbols: Vec::new(),
            detector_queue_capacity: default_detector_queue_capacity(),
            chat_queue_capacity: default_chat_queue_capacity(),
            detector_workers: default_detector_workers(),
            impulse_log_path: None,
        }
    }
}

impl ScreenerConfig {
    /// Load configuration from a JSON file at `path`.
    ///
    /// If the file does not exist or fails to parse, returns an error so the
    /// caller can fall back to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read screener config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse screener config from {}", path.display()))?;

        info!(path = %path.display(), symbols = ?config.symbols, "screener config loaded");

        Ok(config)
    }

    /// Persist the current configuration to `path` using an atomic write
    /// (write to `.tmp`, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content = serde_json::to_string_pretty(self)
            .context("failed to serialise screener config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "screener config saved (atomic)");
        Ok(())
    }

    /// Load from `path`, falling back to [`Default`] with a warning on any
    /// failure (missing file, malformed JSON).
    pub fn load_or_default(path: impl AsRef<Path>) -> Self {
        Self::load(path).unwrap_or_else(|e| {
            warn!(error = %e, "failed to load screener config, using defaults");
            Self::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_expected_values() {
        let cfg = ScreenerConfig::default();
        assert_eq!(cfg.atr_period, 14);
        assert!((cfg.atr_multiplier - 2.2).abs() < f64::EPSILON);
        assert_eq!(cfg.impulse_min_trades, 1000);
        assert_eq!(cfg.anti_spam_burst_count, 5);
        assert!(!cfg.enable_dynamic_threshold);
    }

    #[test]
    fn deserialise_empty_json_uses_defaults() {
        let cfg: ScreenerConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.max_clusters, 150);
        assert_eq!(cfg.port, 9001);
    }

    #[test]
    fn deserialise_partial_json_fills_defaults() {
        let json = r#"{ "atr_multiplier": 3.0, "symbols": ["btcusdt"] }"#;
        let cfg: ScreenerConfig = serde_json::from_str(json).unwrap();
        assert!((cfg.atr_multiplier - 3.0).abs() < f64::EPSILON);
        assert_eq!(cfg.symbols, vec!["btcusdt"]);
        assert_eq!(cfg.atr_period, 14);
    }

    #[test]
    fn roundtrip_serialisation() {
        let cfg = ScreenerConfig::default();
        let json = serde_json::to_string(&cfg).unwrap();
        let cfg2: ScreenerConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(cfg.max_clusters, cfg2.max_clusters);
        assert!((cfg.atr_multiplier - cfg2.atr_multiplier).abs() < f64::EPSILON);
    }

    #[test]
    fn save_and_load_roundtrip() {
        let dir = std::env::temp_dir().join(format!("screener_cfg_test_{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config.json");

        let mut cfg = ScreenerConfig::default();
        cfg.symbols = vec!["ethusdt".to_string()];
        cfg.save(&path).unwrap();

        let loaded = ScreenerConfig::load(&path).unwrap();
        assert_eq!(loaded.symbols, vec!["ethusdt"]);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn load_or_default_falls_back_on_missing_file() {
        let cfg = ScreenerConfig::load_or_default("/nonexistent/path/config.json");
        assert_eq!(cfg.atr_period, default_atr_period());
    }
}
