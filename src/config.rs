//! Declarative configuration.
//!
//! A single document drives venue/symbol enablement, analytics thresholds,
//! and runtime sizing. Configuration is immutable once loaded; changing it
//! requires a restart. Loading is a straight read-the-file-then-parse:
//! turn any failure into a fatal, pre-session error — configuration errors
//! are the one fatal-at-startup class.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{IngestError, Result};
use crate::venue::Venue;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VenueConfig {
    pub enabled: bool,
    pub symbols: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SymbolThresholds {
    #[serde(default = "default_whale_notional")]
    pub whale_notional_usd: f64,
    #[serde(default = "default_wall_size")]
    pub wall_size: f64,
    #[serde(default = "default_impact_threshold")]
    pub impact_threshold_pct: f64,
}

impl Default for SymbolThresholds {
    fn default() -> Self {
        Self {
            whale_notional_usd: default_whale_notional(),
            wall_size: default_wall_size(),
            impact_threshold_pct: default_impact_threshold(),
        }
    }
}

fn default_whale_notional() -> f64 {
    100_000.0
}
fn default_wall_size() -> f64 {
    50.0
}
fn default_impact_threshold() -> f64 {
    0.05
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalyticsConfig {
    #[serde(default = "default_timeframes")]
    pub timeframes_secs: Vec<i64>,
    #[serde(default)]
    pub emit_empty_candles: bool,
    #[serde(default = "default_whale_k")]
    pub whale_confidence_k: f64,
    #[serde(default = "default_gap_small")]
    pub gap_log_max: i64,
    #[serde(default = "default_gap_medium")]
    pub gap_snapshot_max: i64,
    #[serde(default = "default_gap_timeout_secs")]
    pub gap_timeout_secs: i64,
    #[serde(default = "default_snapshot_interval_secs")]
    pub snapshot_interval_secs: u64,
    #[serde(default = "default_snapshot_retention_secs")]
    pub snapshot_retention_secs: i64,
    #[serde(default = "default_max_book_levels")]
    pub max_book_levels: usize,
}

fn default_timeframes() -> Vec<i64> {
    vec![
        1, 5, 15, 30, // seconds
        60, 180, 300, 900, 1800, // minutes: 1,3,5,15,30
        3600, 7200, 14400, 21600, 43200, // hours: 1,2,4,6,12
        86400, // 1 day
    ]
}
fn default_whale_k() -> f64 {
    1.0
}
fn default_gap_small() -> i64 {
    10
}
fn default_gap_medium() -> i64 {
    100
}
fn default_gap_timeout_secs() -> i64 {
    30
}
fn default_snapshot_interval_secs() -> u64 {
    1
}
fn default_snapshot_retention_secs() -> i64 {
    24 * 3600
}
fn default_max_book_levels() -> usize {
    1000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default = "default_publish_workers")]
    pub publish_workers: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_confirm_timeout_secs")]
    pub confirm_timeout_secs: u64,
    #[serde(default = "default_rate_limit")]
    pub rate_limit_msgs_per_sec: u32,
    #[serde(default = "default_drain_deadline_secs")]
    pub drain_deadline_secs: u64,
    #[serde(default)]
    pub redis_url: Option<String>,
}

fn default_publish_workers() -> usize {
    30
}
fn default_max_retries() -> u32 {
    3
}
fn default_confirm_timeout_secs() -> u64 {
    5
}
fn default_rate_limit() -> u32 {
    1000
}
fn default_drain_deadline_secs() -> u64 {
    5
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub venues: HashMap<String, VenueConfig>,
    #[serde(default)]
    pub symbol_thresholds: HashMap<String, SymbolThresholds>,
    #[serde(default = "SymbolThresholds::default")]
    pub default_thresholds: SymbolThresholds,
    #[serde(default)]
    pub analytics: AnalyticsConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
}

impl Default for AnalyticsConfig {
    fn default() -> Self {
        Self {
            timeframes_secs: default_timeframes(),
            emit_empty_candles: false,
            whale_confidence_k: default_whale_k(),
            gap_log_max: default_gap_small(),
            gap_snapshot_max: default_gap_medium(),
            gap_timeout_secs: default_gap_timeout_secs(),
            snapshot_interval_secs: default_snapshot_interval_secs(),
            snapshot_retention_secs: default_snapshot_retention_secs(),
            max_book_levels: default_max_book_levels(),
        }
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            publish_workers: default_publish_workers(),
            max_retries: default_max_retries(),
            confirm_timeout_secs: default_confirm_timeout_secs(),
            rate_limit_msgs_per_sec: default_rate_limit(),
            drain_deadline_secs: default_drain_deadline_secs(),
            redis_url: None,
        }
    }
}

impl PipelineConfig {
    pub fn thresholds_for(&self, symbol: &str) -> SymbolThresholds {
        self.symbol_thresholds
            .get(symbol)
            .cloned()
            .unwrap_or_else(|| self.default_thresholds.clone())
    }

    pub fn enabled_venues(&self) -> Vec<Venue> {
        Venue::ALL
            .into_iter()
            .filter(|v| {
                self.venues
                    .get(&v.to_string())
                    .map(|c| c.enabled)
                    .unwrap_or(false)
            })
            .collect()
    }

    pub fn symbols_for(&self, venue: Venue) -> Vec<String> {
        self.venues
            .get(&venue.to_string())
            .map(|c| c.symbols.clone())
            .unwrap_or_default()
    }
}

/// Reads and parses a TOML config file, fatal on any failure — the only
/// startup path that is allowed to terminate the process.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<PipelineConfig> {
    let content = fs::read_to_string(&path).map_err(|e| {
        IngestError::Config(format!(
            "cannot read config at {:?}: {e}",
            path.as_ref()
        ))
    })?;
    toml::from_str(&content).map_err(|e| IngestError::Config(format!("invalid config: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_config_with_defaults() {
        let toml_str = r#"
            [venues.binance]
            enabled = true
            symbols = ["btcusdt"]

            [venues.bybit]
            enabled = false
            symbols = []

            [venues.okx]
            enabled = false
            symbols = []
        "#;
        let cfg: PipelineConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(cfg.enabled_venues(), vec![Venue::Binance]);
        assert_eq!(cfg.analytics.gap_snapshot_max, 100);
        assert_eq!(cfg.runtime.publish_workers, 30);
        assert_eq!(cfg.default_thresholds.whale_notional_usd, 100_000.0);
    }

    #[test]
    fn missing_file_is_a_fatal_config_error() {
        let result = load_config("/nonexistent/path/does/not/exist.toml");
        assert!(matches!(result, Err(IngestError::Config(_))));
    }

    #[test]
    fn per_symbol_threshold_overrides_default() {
        let mut cfg = PipelineConfig {
            venues: HashMap::new(),
            symbol_thresholds: HashMap::new(),
            default_thresholds: SymbolThresholds::default(),
            analytics: AnalyticsConfig::default(),
            runtime: RuntimeConfig::default(),
        };
        cfg.symbol_thresholds.insert(
            "btcusdt".into(),
            SymbolThresholds {
                whale_notional_usd: 250_000.0,
                ..Default::default()
            },
        );
        assert_eq!(cfg.thresholds_for("btcusdt").whale_notional_usd, 250_000.0);
        assert_eq!(cfg.thresholds_for("ethusdt").whale_notional_usd, 100_000.0);
    }
}
