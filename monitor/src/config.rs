//! Monitor configuration.
//!
//! Loaded from an optional TOML file, then overridden by environment
//! variables, then validated.

use crate::error::{MonitorError, MonitorResult};
use crate::features::FeatureSet;
use drift::{DistanceMeasure, DriftScorer, KolmogorovSmirnov, NormalizedWasserstein};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use telemetry::WindowSpec;

/// What to do when a batch arrives and no reference is loaded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BootstrapPolicy {
    /// The first non-empty batch becomes the reference
    FirstBatch,
    /// Never score without an explicitly supplied reference
    RequireReference,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MeasureKind {
    NormalizedWasserstein,
    KolmogorovSmirnov,
}

impl MeasureKind {
    pub fn build(self) -> Arc<dyn DistanceMeasure> {
        match self {
            MeasureKind::NormalizedWasserstein => Arc::new(NormalizedWasserstein::new()),
            MeasureKind::KolmogorovSmirnov => Arc::new(KolmogorovSmirnov),
        }
    }
}

/// Monitor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    #[serde(default)]
    pub drift: DriftConfig,
    #[serde(default)]
    pub schedule: ScheduleConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default = "default_windows")]
    pub windows: Vec<WindowSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriftConfig {
    #[serde(default = "default_threshold")]
    pub threshold: f64,
    #[serde(default = "default_measure")]
    pub measure: MeasureKind,
    /// Capacity of the current window, in feature rows
    #[serde(default = "default_window_size")]
    pub window_size: usize,
    #[serde(default = "default_bootstrap")]
    pub bootstrap: BootstrapPolicy,
    /// Rows gathered before a first-batch reference is taken
    #[serde(default = "default_min_reference_rows")]
    pub min_reference_rows: usize,
    #[serde(default)]
    pub features: FeatureSet,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleConfig {
    #[serde(default = "default_check_interval")]
    pub check_interval_seconds: u64,
    #[serde(default = "default_fetch_timeout")]
    pub fetch_timeout_seconds: u64,
    /// Readings between retrain requests; 0 disables
    #[serde(default = "default_retrain_volume")]
    pub retrain_volume_threshold: u64,
    /// Persist the current window every this many batches; 0 disables
    #[serde(default = "default_checkpoint_every")]
    pub checkpoint_every: u64,
    #[serde(default = "default_sink_buffer")]
    pub sink_buffer: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    #[serde(default = "default_store_dir")]
    pub store_dir: PathBuf,
    /// Reference to load at startup: a `.snap` file or a JSONL log of readings
    #[serde(default)]
    pub reference_path: Option<PathBuf>,
    #[serde(default = "default_reference_name")]
    pub reference_name: String,
}

// Default value functions
fn default_threshold() -> f64 { drift::DEFAULT_THRESHOLD }
fn default_measure() -> MeasureKind { MeasureKind::NormalizedWasserstein }
fn default_window_size() -> usize { 1000 }
fn default_bootstrap() -> BootstrapPolicy { BootstrapPolicy::FirstBatch }
fn default_min_reference_rows() -> usize { 1000 }
fn default_check_interval() -> u64 { 300 }
fn default_fetch_timeout() -> u64 { 30 }
fn default_retrain_volume() -> u64 { 1000 }
fn default_checkpoint_every() -> u64 { 5 }
fn default_sink_buffer() -> usize { 256 }
fn default_log_dir() -> PathBuf { PathBuf::from("logs") }
fn default_store_dir() -> PathBuf { PathBuf::from("data/snapshots") }
fn default_reference_name() -> String { String::from("baseline") }

fn default_windows() -> Vec<WindowSpec> {
    vec![WindowSpec::count("1h", 4), WindowSpec::count("24h", 24)]
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            drift: DriftConfig::default(),
            schedule: ScheduleConfig::default(),
            storage: StorageConfig::default(),
            windows: default_windows(),
        }
    }
}

impl Default for DriftConfig {
    fn default() -> Self {
        Self {
            threshold: default_threshold(),
            measure: default_measure(),
            window_size: default_window_size(),
            bootstrap: default_bootstrap(),
            min_reference_rows: default_min_reference_rows(),
            features: FeatureSet::default(),
        }
    }
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            check_interval_seconds: default_check_interval(),
            fetch_timeout_seconds: default_fetch_timeout(),
            retrain_volume_threshold: default_retrain_volume(),
            checkpoint_every: default_checkpoint_every(),
            sink_buffer: default_sink_buffer(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            log_dir: default_log_dir(),
            store_dir: default_store_dir(),
            reference_path: None,
            reference_name: default_reference_name(),
        }
    }
}

impl MonitorConfig {
    /// File (if any), then process environment, then validation
    pub fn load(path: Option<&Path>) -> MonitorResult<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> MonitorResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
            .map_err(|e| MonitorError::Config(format!("{}: {}", path.display(), e)))
    }

    pub fn from_toml(content: &str) -> MonitorResult<Self> {
        toml::from_str(content).map_err(|e| MonitorError::Config(e.to_string()))
    }

    pub fn to_toml(&self) -> MonitorResult<String> {
        toml::to_string_pretty(self).map_err(|e| MonitorError::Config(e.to_string()))
    }

    /// Override fields from environment-style variables
    pub fn apply_env<F>(&mut self, lookup: F) -> MonitorResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = parsed(&lookup, "DRIFT_THRESHOLD")? {
            self.drift.threshold = v;
        }
        if let Some(v) = parsed(&lookup, "DRIFT_WINDOW_SIZE")? {
            self.drift.window_size = v;
        }
        if let Some(v) = parsed(&lookup, "MIN_REFERENCE_ROWS")? {
            self.drift.min_reference_rows = v;
        }
        if let Some(v) = parsed(&lookup, "CHECK_INTERVAL_SECONDS")? {
            self.schedule.check_interval_seconds = v;
        }
        if let Some(v) = parsed(&lookup, "FETCH_TIMEOUT_SECONDS")? {
            self.schedule.fetch_timeout_seconds = v;
        }
        if let Some(v) = parsed(&lookup, "RETRAIN_VOLUME_THRESHOLD")? {
            self.schedule.retrain_volume_threshold = v;
        }
        if let Some(v) = parsed(&lookup, "CHECKPOINT_EVERY")? {
            self.schedule.checkpoint_every = v;
        }
        if let Some(v) = lookup("LOG_DIR") {
            self.storage.log_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("REFERENCE_DATA_PATH") {
            self.storage.reference_path = Some(PathBuf::from(v));
        }
        Ok(())
    }

    pub fn validate(&self) -> MonitorResult<()> {
        if !self.drift.threshold.is_finite() || self.drift.threshold < 0.0 {
            return Err(MonitorError::Config(format!(
                "drift threshold must be a non-negative number, got {}",
                self.drift.threshold
            )));
        }
        if self.drift.window_size == 0 {
            return Err(MonitorError::Config("window_size must be at least 1".into()));
        }
        if self.drift.min_reference_rows == 0 {
            return Err(MonitorError::Config("min_reference_rows must be at least 1".into()));
        }
        if self.schedule.check_interval_seconds == 0 {
            return Err(MonitorError::Config("check interval must be at least 1s".into()));
        }
        if self.schedule.fetch_timeout_seconds == 0 {
            return Err(MonitorError::Config("fetch timeout must be at least 1s".into()));
        }
        if self.schedule.sink_buffer == 0 {
            return Err(MonitorError::Config("sink_buffer must be at least 1".into()));
        }
        telemetry::WindowAggregator::new(self.windows.clone())
            .map(|_| ())
            .map_err(|e| MonitorError::Config(e.to_string()))
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.schedule.check_interval_seconds)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.schedule.fetch_timeout_seconds)
    }

    pub fn scorer(&self) -> DriftScorer {
        DriftScorer::with_measure(self.drift.threshold, self.drift.measure.build())
    }

    /// Alert log location inside the log directory
    pub fn alert_log_path(&self) -> PathBuf {
        self.storage.log_dir.join("drift_alerts.jsonl")
    }
}

fn parsed<T, F>(lookup: &F, key: &str) -> MonitorResult<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| MonitorError::Config(format!("{}={:?}: {}", key, raw, e))),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = MonitorConfig::default();
        assert_eq!(config.drift.threshold, 0.3);
        assert_eq!(config.drift.window_size, 1000);
        assert_eq!(config.schedule.check_interval_seconds, 300);
        assert_eq!(config.schedule.retrain_volume_threshold, 1000);
        assert_eq!(config.drift.bootstrap, BootstrapPolicy::FirstBatch);
        assert_eq!(config.drift.min_reference_rows, 1000);
        assert_eq!(config.drift.features, FeatureSet::Raw);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_env_overrides() {
        let mut config = MonitorConfig::default();
        config
            .apply_env(env(&[
                ("DRIFT_THRESHOLD", "0.5"),
                ("DRIFT_WINDOW_SIZE", "200"),
                ("MIN_REFERENCE_ROWS", "400"),
                ("CHECK_INTERVAL_SECONDS", "60"),
                ("RETRAIN_VOLUME_THRESHOLD", "50"),
                ("LOG_DIR", "/tmp/drift"),
                ("REFERENCE_DATA_PATH", "/data/reference.snap"),
            ]))
            .unwrap();

        assert_eq!(config.drift.threshold, 0.5);
        assert_eq!(config.drift.window_size, 200);
        assert_eq!(config.drift.min_reference_rows, 400);
        assert_eq!(config.schedule.check_interval_seconds, 60);
        assert_eq!(config.schedule.retrain_volume_threshold, 50);
        assert_eq!(config.alert_log_path(), PathBuf::from("/tmp/drift/drift_alerts.jsonl"));
        assert_eq!(
            config.storage.reference_path.as_deref(),
            Some(Path::new("/data/reference.snap"))
        );
    }

    #[test]
    fn test_bad_env_value() {
        let mut config = MonitorConfig::default();
        let err = config.apply_env(env(&[("DRIFT_THRESHOLD", "high")])).unwrap_err();
        assert!(matches!(err, MonitorError::Config(_)));
    }

    #[test]
    fn test_partial_toml() {
        let config = MonitorConfig::from_toml(
            r#"
            [drift]
            threshold = 0.25
            measure = "kolmogorov_smirnov"
            bootstrap = "require_reference"
            features = "windowed"

            [[windows]]
            label = "short"
            capacity = 10

            [[windows]]
            label = "long"
            capacity = 100
            "#,
        )
        .unwrap();

        assert_eq!(config.drift.threshold, 0.25);
        assert_eq!(config.drift.window_size, 1000);
        assert_eq!(config.drift.bootstrap, BootstrapPolicy::RequireReference);
        assert_eq!(config.drift.features, FeatureSet::Windowed);
        assert_eq!(config.scorer().measure_name(), "kolmogorov_smirnov");
        assert_eq!(config.windows[1].capacity, 100);
        assert_eq!(config.schedule.checkpoint_every, 5);
    }

    #[test]
    fn test_validate_rejects_bad_windows() {
        let mut config = MonitorConfig::default();
        config.windows = vec![WindowSpec::count("long", 10), WindowSpec::count("short", 2)];
        assert!(config.validate().is_err());

        let mut config = MonitorConfig::default();
        config.drift.threshold = f64::NAN;
        assert!(config.validate().is_err());

        let mut config = MonitorConfig::default();
        config.drift.min_reference_rows = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_toml_roundtrip() {
        let config = MonitorConfig::default();
        let text = config.to_toml().unwrap();
        let back = MonitorConfig::from_toml(&text).unwrap();
        assert_eq!(back.windows, config.windows);
        assert_eq!(back.storage.reference_name, "baseline");
    }
}
