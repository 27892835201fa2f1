use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

/// Top-level configuration for the metrond daemon.
///
/// Metric definitions arrive separately over the host surface; this
/// file only configures the engine itself.
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Logging verbosity (trace, debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Self-monitor HTTP server configuration.
    #[serde(default)]
    pub monitor: MonitorConfig,

    /// Pull scheduling limits.
    #[serde(default)]
    pub puller: PullerConfig,

    /// uid↔package table limits.
    #[serde(default)]
    pub uid_map: UidMapConfig,

    /// Aggregation guardrails shared by all metric producers.
    #[serde(default)]
    pub guardrail: GuardrailConfig,

    /// Fixed shard offset for sampled metrics. When absent, an offset
    /// is derived at startup.
    #[serde(default)]
    pub shard_offset: Option<u32>,
}

/// Self-monitor HTTP server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct MonitorConfig {
    /// Listen address for /metrics and /healthz. Default: "127.0.0.1:9464".
    #[serde(default = "default_monitor_addr")]
    pub addr: String,
}

/// Pull scheduling limits.
#[derive(Debug, Clone, Deserialize)]
pub struct PullerConfig {
    /// Floor applied to every puller's cooldown. Default: 1s.
    #[serde(default = "default_min_cool_down", with = "humantime_serde")]
    pub min_cool_down: Duration,

    /// Ceiling applied to every puller's timeout. Default: 10s.
    #[serde(default = "default_max_timeout", with = "humantime_serde")]
    pub max_timeout: Duration,
}

/// uid↔package table limits.
#[derive(Debug, Clone, Deserialize)]
pub struct UidMapConfig {
    /// Byte budget for retained change records. Default: 100KiB.
    #[serde(default = "default_uid_map_max_bytes")]
    pub max_bytes: usize,

    /// Retained deleted-app entries before eviction. Default: 500.
    #[serde(default = "default_max_deleted_apps")]
    pub max_deleted_apps: usize,
}

/// Aggregation guardrails shared by all metric producers.
#[derive(Debug, Clone, Deserialize)]
pub struct GuardrailConfig {
    /// Dimension count at which the self-monitor starts recording
    /// tuple sizes. Default: 500.
    #[serde(default = "default_dimension_soft_limit")]
    pub dimension_soft_limit: usize,

    /// Clamp range for a metric's declared max_dimensions_per_bucket.
    /// Defaults: 800..=3000.
    #[serde(default = "default_dimension_hard_limit_min")]
    pub dimension_hard_limit_min: usize,
    #[serde(default = "default_dimension_hard_limit_max")]
    pub dimension_hard_limit_max: usize,

    /// Clamp range for declared bucket sizes. Defaults: 5s..=24h.
    #[serde(default = "default_min_bucket_size", with = "humantime_serde")]
    pub min_bucket_size: Duration,
    #[serde(default = "default_max_bucket_size", with = "humantime_serde")]
    pub max_bucket_size: Duration,
}

// --- Default value functions ---

fn default_log_level() -> String {
    "info".to_string()
}

fn default_monitor_addr() -> String {
    "127.0.0.1:9464".to_string()
}

fn default_min_cool_down() -> Duration {
    Duration::from_secs(1)
}

fn default_max_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_uid_map_max_bytes() -> usize {
    100 * 1024
}

fn default_max_deleted_apps() -> usize {
    500
}

fn default_dimension_soft_limit() -> usize {
    500
}

fn default_dimension_hard_limit_min() -> usize {
    800
}

fn default_dimension_hard_limit_max() -> usize {
    3000
}

fn default_min_bucket_size() -> Duration {
    Duration::from_secs(5)
}

fn default_max_bucket_size() -> Duration {
    Duration::from_secs(24 * 3600)
}

// --- Default trait impls ---

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            monitor: MonitorConfig::default(),
            puller: PullerConfig::default(),
            uid_map: UidMapConfig::default(),
            guardrail: GuardrailConfig::default(),
            shard_offset: None,
        }
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            addr: default_monitor_addr(),
        }
    }
}

impl Default for PullerConfig {
    fn default() -> Self {
        Self {
            min_cool_down: default_min_cool_down(),
            max_timeout: default_max_timeout(),
        }
    }
}

impl Default for UidMapConfig {
    fn default() -> Self {
        Self {
            max_bytes: default_uid_map_max_bytes(),
            max_deleted_apps: default_max_deleted_apps(),
        }
    }
}

impl Default for GuardrailConfig {
    fn default() -> Self {
        Self {
            dimension_soft_limit: default_dimension_soft_limit(),
            dimension_hard_limit_min: default_dimension_hard_limit_min(),
            dimension_hard_limit_max: default_dimension_hard_limit_max(),
            min_bucket_size: default_min_bucket_size(),
            max_bucket_size: default_max_bucket_size(),
        }
    }
}

// --- Validation and loading ---

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let cfg: Config = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        cfg.validate()?;

        Ok(cfg)
    }

    /// Validate the configuration for required fields and consistency.
    pub fn validate(&self) -> Result<()> {
        if self.monitor.addr.is_empty() {
            bail!("monitor.addr is required");
        }

        if self.puller.min_cool_down.is_zero() {
            bail!("puller.min_cool_down must be positive");
        }

        if self.puller.max_timeout < self.puller.min_cool_down {
            bail!("puller.max_timeout must be at least puller.min_cool_down");
        }

        if self.uid_map.max_bytes == 0 {
            bail!("uid_map.max_bytes must be positive");
        }

        if self.guardrail.dimension_hard_limit_min > self.guardrail.dimension_hard_limit_max {
            bail!("guardrail.dimension_hard_limit_min exceeds dimension_hard_limit_max");
        }

        if self.guardrail.min_bucket_size > self.guardrail.max_bucket_size {
            bail!("guardrail.min_bucket_size exceeds max_bucket_size");
        }

        Ok(())
    }
}

impl GuardrailConfig {
    /// Clamps a metric's declared dimension limit into the allowed
    /// range. Metrics that declare nothing get the minimum.
    pub fn clamp_dimension_hard_limit(&self, declared: Option<usize>) -> usize {
        declared
            .unwrap_or(self.dimension_hard_limit_min)
            .clamp(self.dimension_hard_limit_min, self.dimension_hard_limit_max)
    }

    /// Clamps a declared bucket size into the allowed range.
    pub fn clamp_bucket_size(&self, declared: Duration) -> Duration {
        declared.clamp(self.min_bucket_size, self.max_bucket_size)
    }
}
