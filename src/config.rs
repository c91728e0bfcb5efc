//! YAML configuration record.
//!
//! Deserialized once at startup with `serde_yaml` and validated before the
//! classifier is constructed.

use std::fs;
use std::path::Path;

use serde::Deserialize;

use crate::error::{FirewallError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Mode {
    Simple,
    Learn,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Verbosity {
    All,
    AllowOnly,
    RejectOnly,
    None,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ModelConfig {
    pub filename: String,
    #[serde(default = "default_model_weight")]
    pub weight: u64,
}

fn default_model_weight() -> u64 {
    1
}

#[derive(Debug, Clone, Deserialize)]
pub struct TimeframeConfig {
    #[serde(default)]
    pub enabled: bool,
    pub period_secs: u64,
    pub max_queries: u64,
    #[serde(default)]
    pub penalty: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HmmConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub min_length: usize,
    #[serde(default)]
    pub bias: f64,
    #[serde(default)]
    pub weight: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EntropyConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub min_length: usize,
    #[serde(default)]
    pub bias: f64,
    #[serde(default)]
    pub weight: f64,
    /// Window widths trained/evaluated together; the trainer instantiates
    /// one `EntropyWindow` per entry, keyed by width in the model artifact.
    #[serde(default)]
    pub windows: Vec<u64>,
    #[serde(default = "default_bins")]
    pub bins: u64,
}

fn default_bins() -> u64 {
    1000
}

#[derive(Debug, Clone, Deserialize)]
pub struct LengthConfig {
    #[serde(default)]
    pub min_length: usize,
    pub max_length: u64,
    pub max_length_penalty: f64,
    /// Percentile (0,1] of cumulative domain-length mass used by the
    /// trainer to derive `query_max_length`.
    #[serde(default = "default_percentile")]
    pub percentile: f64,
}

fn default_percentile() -> f64 {
    0.99
}

#[derive(Debug, Clone, Deserialize)]
pub struct RejectConfig {
    #[serde(default)]
    pub block_period: u64,
    pub threshold: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub mode: Mode,
    #[serde(default = "default_verbosity")]
    pub verbosity: Verbosity,
    pub model: ModelConfig,
    #[serde(default)]
    pub blacklist: Option<String>,
    #[serde(default)]
    pub whitelist: Option<String>,
    #[serde(default)]
    pub timeframe: TimeframeConfig,
    pub hmm: HmmConfig,
    pub entropy: EntropyConfig,
    pub length: LengthConfig,
    pub reject: RejectConfig,
}

fn default_verbosity() -> Verbosity {
    Verbosity::RejectOnly
}

impl Default for TimeframeConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            period_secs: 60,
            max_queries: u64::MAX,
            penalty: 0.0,
        }
    }
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        let cfg: Config =
            serde_yaml::from_str(&text).map_err(|e| FirewallError::Parse(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Fatal startup validation: no classifier enabled, inconsistent
    /// thresholds, etc. are all configuration errors, not runtime ones.
    fn validate(&self) -> Result<()> {
        if !self.hmm.enabled && !self.entropy.enabled {
            return Err(FirewallError::Parse(
                "at least one of hmm.enabled or entropy.enabled must be true".into(),
            ));
        }
        if self.entropy.enabled && self.entropy.windows.is_empty() {
            return Err(FirewallError::Parse(
                "entropy.enabled is true but entropy.windows is empty".into(),
            ));
        }
        Ok(())
    }
}

/// Load a deny/allow list file: one regex fragment per line, blank lines
/// and `#`-prefixed comment lines skipped.
pub fn load_list(path: impl AsRef<Path>) -> Result<Vec<String>> {
    let text = fs::read_to_string(path)?;
    Ok(text
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect())
}
