//! Configuration types for driftline.
//!
//! [`Config::load`] reads `$XDG_CONFIG_HOME/driftline/config.toml` (falling
//! back to `$HOME/.config`), creating it with hardcoded defaults if it does
//! not yet exist. [`Config::defaults`] returns the same defaults without
//! touching the filesystem (useful in tests).

use std::path::PathBuf;

use serde::Deserialize;

use crate::placement::PlacementConfig;

// ---------------------------------------------------------------------------
// Embedded defaults
// ---------------------------------------------------------------------------

const DEFAULT_CONFIG: &str = r#"
[store]
metadata_file    = "driftline_metadata.json"
checkpoint_every = 10

[backends.sql]
db_path = "driftline_ingest.db"

[backends.doc]
data_dir = "driftline_docs"

[upstream]
url                = "http://127.0.0.1:8000"
batch_size         = 100
total_batches      = 10
delay_ms           = 500
batch_timeout_secs = 30

[placement]
min_observations        = 10
confidence_threshold    = 0.65
minor_drift             = 0.10
moderate_drift          = 0.25
null_ratio_max          = 0.05
booster_promotion_count = 2
relaxed_frequency       = 0.50
relaxed_stability       = 0.75

[logging]
level = "info"
json  = false
"#;

// ---------------------------------------------------------------------------
// Public config types
// ---------------------------------------------------------------------------

/// Top-level application configuration, loaded from
/// `$XDG_CONFIG_HOME/driftline/config.toml`.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub backends: BackendsConfig,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub placement: PlacementTuning,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// `[store]` section of `config.toml`.
#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_metadata_file")]
    pub metadata_file: String,
    #[serde(default = "default_checkpoint_every")]
    pub checkpoint_every: u64,
}

fn default_metadata_file() -> String {
    "driftline_metadata.json".to_string()
}
fn default_checkpoint_every() -> u64 {
    10
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            metadata_file: default_metadata_file(),
            checkpoint_every: default_checkpoint_every(),
        }
    }
}

/// `[backends]` section of `config.toml`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BackendsConfig {
    #[serde(default)]
    pub sql: SqlBackendConfig,
    #[serde(default)]
    pub doc: DocBackendConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SqlBackendConfig {
    #[serde(default = "default_db_path")]
    pub db_path: String,
}

fn default_db_path() -> String {
    "driftline_ingest.db".to_string()
}

impl Default for SqlBackendConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DocBackendConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
}

fn default_data_dir() -> String {
    "driftline_docs".to_string()
}

impl Default for DocBackendConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
        }
    }
}

/// `[upstream]` section of `config.toml` — consumer pacing (spec §6.4).
#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamConfig {
    #[serde(default = "default_upstream_url")]
    pub url: String,
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,
    #[serde(default = "default_total_batches")]
    pub total_batches: u32,
    #[serde(default = "default_delay_ms")]
    pub delay_ms: u64,
    #[serde(default = "default_batch_timeout_secs")]
    pub batch_timeout_secs: u64,
}

fn default_upstream_url() -> String {
    "http://127.0.0.1:8000".to_string()
}
fn default_batch_size() -> u32 {
    100
}
fn default_total_batches() -> u32 {
    10
}
fn default_delay_ms() -> u64 {
    500
}
fn default_batch_timeout_secs() -> u64 {
    30
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            url: default_upstream_url(),
            batch_size: default_batch_size(),
            total_batches: default_total_batches(),
            delay_ms: default_delay_ms(),
            batch_timeout_secs: default_batch_timeout_secs(),
        }
    }
}

/// `[placement]` section of `config.toml` (spec §4.4's constants table).
#[derive(Debug, Clone, Deserialize)]
pub struct PlacementTuning {
    #[serde(default = "default_min_observations")]
    pub min_observations: u64,
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f64,
    #[serde(default = "default_minor_drift")]
    pub minor_drift: f64,
    #[serde(default = "default_moderate_drift")]
    pub moderate_drift: f64,
    #[serde(default = "default_null_ratio_max")]
    pub null_ratio_max: f64,
    #[serde(default = "default_booster_promotion_count")]
    pub booster_promotion_count: u32,
    #[serde(default = "default_relaxed_frequency")]
    pub relaxed_frequency: f64,
    #[serde(default = "default_relaxed_stability")]
    pub relaxed_stability: f64,
}

fn default_min_observations() -> u64 {
    10
}
fn default_confidence_threshold() -> f64 {
    0.65
}
fn default_minor_drift() -> f64 {
    0.10
}
fn default_moderate_drift() -> f64 {
    0.25
}
fn default_null_ratio_max() -> f64 {
    0.05
}
fn default_booster_promotion_count() -> u32 {
    2
}
fn default_relaxed_frequency() -> f64 {
    0.50
}
fn default_relaxed_stability() -> f64 {
    0.75
}

impl Default for PlacementTuning {
    fn default() -> Self {
        Self {
            min_observations: default_min_observations(),
            confidence_threshold: default_confidence_threshold(),
            minor_drift: default_minor_drift(),
            moderate_drift: default_moderate_drift(),
            null_ratio_max: default_null_ratio_max(),
            booster_promotion_count: default_booster_promotion_count(),
            relaxed_frequency: default_relaxed_frequency(),
            relaxed_stability: default_relaxed_stability(),
        }
    }
}

impl PlacementTuning {
    /// Build a [`PlacementConfig`] from this tuning, keeping the zone tables
    /// and mandatory set at their spec-defined defaults (those are not
    /// exposed as config keys — they are definitional, not tunable knobs).
    pub fn into_placement_config(self) -> PlacementConfig {
        let defaults = PlacementConfig::default();
        PlacementConfig {
            min_observations: self.min_observations,
            confidence_threshold: self.confidence_threshold,
            minor_drift: self.minor_drift,
            moderate_drift: self.moderate_drift,
            null_ratio_max: self.null_ratio_max,
            booster_promotion_count: self.booster_promotion_count,
            relaxed_frequency: self.relaxed_frequency,
            relaxed_stability: self.relaxed_stability,
            ..defaults
        }
    }
}

/// `[logging]` section of `config.toml`.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::defaults()
    }
}

impl Config {
    /// Load from `$XDG_CONFIG_HOME/driftline/config.toml`, layered on top of
    /// the built-in defaults. Creates the file with defaults if it does not
    /// exist.
    pub fn load() -> anyhow::Result<Self> {
        let path = config_path();

        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(&path, DEFAULT_CONFIG.trim_start())?;
        }

        config::Config::builder()
            .add_source(config::File::from_str(DEFAULT_CONFIG, config::FileFormat::Toml))
            .add_source(config::File::from(path.as_path()).required(false))
            .build()?
            .try_deserialize()
            .map_err(Into::into)
    }

    /// Return the built-in defaults without touching the filesystem.
    pub fn defaults() -> Self {
        config::Config::builder()
            .add_source(config::File::from_str(DEFAULT_CONFIG, config::FileFormat::Toml))
            .build()
            .expect("built-in default config must be valid TOML")
            .try_deserialize()
            .expect("built-in default config must deserialize correctly")
    }
}

// ---------------------------------------------------------------------------
// Path helpers
// ---------------------------------------------------------------------------

fn config_path() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| ".".to_string()))
                .join(".config")
        })
        .join("driftline")
        .join("config.toml")
}
