//! Workspace-wide configuration tree.
//!
//! One sub-struct per component, loaded from a single TOML file. Every
//! duration/threshold named in the spec has a field here with the spec's
//! default value, following the teacher's `Config`/`GatewayConfig`/... split.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::{Error, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub data_dir: PathBuf,
    #[serde(default)]
    pub audit: AuditConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub rules: RulesConfig,
    #[serde(default)]
    pub preprocessor: PreprocessorConfig,
    #[serde(default)]
    pub dedup: DedupConfig,
    #[serde(default)]
    pub filter: FilterConfig,
    #[serde(default)]
    pub analysis: AnalysisConfig,
    #[serde(default)]
    pub decision: DecisionConfig,
    #[serde(default)]
    pub snapshot: SnapshotConfig,
    #[serde(default)]
    pub syslog: SyslogConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data/ai-ops"),
            audit: AuditConfig::default(),
            metrics: MetricsConfig::default(),
            rules: RulesConfig::default(),
            preprocessor: PreprocessorConfig::default(),
            dedup: DedupConfig::default(),
            filter: FilterConfig::default(),
            analysis: AnalysisConfig::default(),
            decision: DecisionConfig::default(),
            snapshot: SnapshotConfig::default(),
            syslog: SyslogConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file, falling back to defaults for any
    /// field left unspecified.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path.as_ref())
            .map_err(|e| Error::Io(format!("reading config {}: {e}", path.as_ref().display())))?;
        toml::from_str(&contents)
            .map_err(|e| Error::Validation(format!("parsing config: {e}")))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    pub retention_days: u32,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self { retention_days: 90 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub interval_ms: u64,
    pub retention_days: u32,
    pub enabled: bool,
    pub failure_warn_threshold: u32,
    pub device_timeout_ms: u64,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            interval_ms: 60_000,
            retention_days: 7,
            enabled: true,
            failure_warn_threshold: 3,
            device_timeout_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RulesConfig {
    pub traffic_window_short_ms: u64,
    pub traffic_window_long_ms: u64,
}

impl Default for RulesConfig {
    fn default() -> Self {
        Self {
            traffic_window_short_ms: 30_000,
            traffic_window_long_ms: 120_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PreprocessorConfig {
    pub flap_window_ms: u64,
    pub flap_min_changes: u32,
    pub aggregation_window_ms: u64,
    pub device_info_ttl_ms: u64,
}

impl Default for PreprocessorConfig {
    fn default() -> Self {
        Self {
            flap_window_ms: 30_000,
            flap_min_changes: 2,
            aggregation_window_ms: 30_000,
            device_info_ttl_ms: 300_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupConfig {
    pub default_ttl_ms: u64,
    pub cleanup_interval_ms: u64,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            default_ttl_ms: 300_000,
            cleanup_interval_ms: 60_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    pub transient_window_ms: u64,
    pub transient_min_changes: u32,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            transient_window_ms: 30_000,
            transient_min_changes: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    pub correlation_window_ms: u64,
    pub similar_incident_window_days: u32,
    pub similar_incident_min_similarity: f32,
    pub cache_ttl_ms: u64,
    pub cache_capacity: usize,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            correlation_window_ms: 300_000,
            similar_incident_window_days: 30,
            similar_incident_min_similarity: 0.3,
            cache_ttl_ms: 600_000,
            cache_capacity: 512,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DecisionConfig {
    pub business_hours_start: u8,
    pub business_hours_end: u8,
    pub night_hours_end: u8,
}

impl Default for DecisionConfig {
    fn default() -> Self {
        Self {
            business_hours_start: 9,
            business_hours_end: 18,
            night_hours_end: 6,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapshotConfig {
    pub max_retained: usize,
    pub device_timeout_ms: u64,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            max_retained: 30,
            device_timeout_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyslogConfig {
    pub bind_address: String,
}

impl Default for SyslogConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:514".to_string(),
        }
    }
}
