//! Pipeline configuration.
//!
//! Layers are merged once at startup: defaults, then an optional JSON file,
//! then `VIGIL_*` environment variables, then runtime overrides. The result is
//! validated and handed to each component's constructor by reference.

use std::{
    fs,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    labels::{LabelCatalog, LabelConfig},
    reconcile::ReconciliationConfig,
    session::RecoveryPolicy,
};

/// Shortest accepted sample interval. Bounds worst-case classifier load.
pub const MIN_SAMPLE_INTERVAL_SECS: u64 = 10;
/// Longest configurable interval, window or grace period: one week.
pub const MAX_SPAN_SECS: u64 = 7 * 24 * 60 * 60;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("config parse error: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid value '{value}' for environment variable {var}")]
    Env { var: String, value: String },
    #[error("config validation error: {0}")]
    Validation(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct SchedulerConfig {
    pub sample_interval_secs: u64,
    /// Upper bound on one camera + screen capture.
    pub capture_timeout_secs: u64,
    /// Longest uninterrupted sleep; bounds how long a shutdown signal goes unnoticed.
    pub poll_slice_ms: u64,
    pub capture_screen: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            sample_interval_secs: 60,
            capture_timeout_secs: 10,
            poll_slice_ms: 1_000,
            capture_screen: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct QueueConfig {
    pub upload_capacity: usize,
    pub fusion_capacity: usize,
    /// Per-subscriber buffer of the event bus.
    pub event_capacity: usize,
    pub persistence_capacity: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            upload_capacity: 8,
            fusion_capacity: 16,
            event_capacity: 64,
            persistence_capacity: 256,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct WorkerConfig {
    pub pool_size: usize,
    /// Delay before each retry; its length is the retry count.
    pub backoff_secs: Vec<u64>,
    pub rate_limit_per_minute: u32,
    pub rate_limit_burst: u32,
    pub fallback_confidence: f64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            pool_size: 3,
            backoff_secs: vec![1, 5, 15],
            rate_limit_per_minute: 30,
            rate_limit_burst: 3,
            fallback_confidence: 0.2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct FusionConfig {
    /// Hysteresis window `K`.
    pub window_size: usize,
    pub debounce_span_secs: u64,
    pub partial_buffer_scale: f64,
    pub tie_confidence: f64,
    pub debounce_hold_confidence: f64,
    pub initial_confidence: f64,
    pub resume_confidence: f64,
    pub pause_confidence: f64,
    pub override_confidence: f64,
    pub override_grace_secs: u64,
    pub override_min_confidence: f64,
    pub max_future_skew_secs: u64,
    pub stale_after_secs: u64,
    /// How often the detector's time-based rules are re-checked.
    pub tick_secs: u64,
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            window_size: 3,
            debounce_span_secs: 60,
            partial_buffer_scale: 0.7,
            tie_confidence: 0.4,
            debounce_hold_confidence: 0.3,
            initial_confidence: 0.3,
            resume_confidence: 0.3,
            pause_confidence: 1.0,
            override_confidence: 1.0,
            override_grace_secs: 120,
            override_min_confidence: 0.8,
            max_future_skew_secs: 300,
            stale_after_secs: 600,
            tick_secs: 1,
        }
    }
}

impl FusionConfig {
    /// Votes one category needs to move the state: `ceil((K + 1) / 2)`.
    pub fn majority_threshold(&self) -> usize {
        self.window_size / 2 + 1
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct DetectorConfig {
    /// Time in Distracted before the sustained alert fires.
    pub sustained_grace_secs: u64,
    pub pattern_window_secs: u64,
    /// Pattern alert fires when Distracted transitions in the window exceed this.
    pub pattern_max_transitions: usize,
    pub ergonomic_window_secs: u64,
    pub ergonomic_min_samples: usize,
    /// Share of absence/fatigue samples in the window that counts as dominating.
    pub ergonomic_ratio: f64,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            sustained_grace_secs: 8,
            pattern_window_secs: 20 * 60,
            pattern_max_transitions: 3,
            ergonomic_window_secs: 10 * 60,
            ergonomic_min_samples: 3,
            ergonomic_ratio: 0.5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct PersistenceConfig {
    pub commit_attempts: u32,
    pub commit_backoff_ms: u64,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            commit_attempts: 3,
            commit_backoff_ms: 100,
        }
    }
}

/// How long to wait for the post-session emotion and pattern analyses.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct AnalysisConfig {
    /// Delay before each re-poll; its length is the number of re-polls.
    pub poll_backoff_secs: Vec<u64>,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            poll_backoff_secs: vec![5, 15, 30, 60, 120],
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct ClassifierConfig {
    pub url: Option<String>,
    pub api_key: Option<String>,
    pub request_timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct CaptureConfig {
    pub camera_dir: Option<PathBuf>,
    pub screen_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct StorageConfig {
    pub data_dir: Option<PathBuf>,
    pub recovery: RecoveryPolicy,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct VigilConfig {
    pub scheduler: SchedulerConfig,
    pub queues: QueueConfig,
    pub workers: WorkerConfig,
    pub fusion: FusionConfig,
    pub detector: DetectorConfig,
    pub reconciliation: ReconciliationConfig,
    pub analysis: AnalysisConfig,
    pub persistence: PersistenceConfig,
    pub labels: LabelConfig,
    pub classifier: ClassifierConfig,
    pub capture: CaptureConfig,
    pub storage: StorageConfig,
}

/// Highest-precedence layer, set programmatically (CLI flags, tests).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConfigOverrides {
    pub sample_interval_secs: Option<u64>,
    pub worker_pool_size: Option<usize>,
    pub window_size: Option<usize>,
    pub debounce_span_secs: Option<u64>,
    pub data_dir: Option<PathBuf>,
}

fn parse_env<T: std::str::FromStr>(var: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::Env {
        var: var.to_string(),
        value: value.to_string(),
    })
}

fn unit_interval(name: &str, value: f64) -> Result<(), ConfigError> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(ConfigError::Validation(format!("{name} must be within 0.0..=1.0, got {value}")))
    }
}

impl VigilConfig {
    /// Merge every layer and validate.
    pub fn load_layered<I>(
        file: Option<&Path>,
        env: I,
        overrides: &ConfigOverrides,
    ) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let mut config = match file {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env(env)?;
        config.apply_overrides(overrides);
        config.validate()?;
        Ok(config)
    }

    /// Defaults overlaid with a (possibly partial) JSON file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(serde_json::from_str(&contents)?)
    }

    /// Apply `VIGIL_*` variables; unrelated variables are ignored.
    pub fn apply_env<I>(&mut self, env: I) -> Result<(), ConfigError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        for (var, value) in env {
            match var.as_str() {
                "VIGIL_SAMPLE_INTERVAL_SECS" => {
                    self.scheduler.sample_interval_secs = parse_env(&var, &value)?
                }
                "VIGIL_CAPTURE_SCREEN" => self.scheduler.capture_screen = parse_env(&var, &value)?,
                "VIGIL_WORKER_POOL_SIZE" => self.workers.pool_size = parse_env(&var, &value)?,
                "VIGIL_WINDOW_SIZE" => self.fusion.window_size = parse_env(&var, &value)?,
                "VIGIL_DEBOUNCE_SPAN_SECS" => {
                    self.fusion.debounce_span_secs = parse_env(&var, &value)?
                }
                "VIGIL_UPLOAD_QUEUE_CAPACITY" => {
                    self.queues.upload_capacity = parse_env(&var, &value)?
                }
                "VIGIL_FUSION_QUEUE_CAPACITY" => {
                    self.queues.fusion_capacity = parse_env(&var, &value)?
                }
                "VIGIL_EVENT_QUEUE_CAPACITY" => {
                    self.queues.event_capacity = parse_env(&var, &value)?
                }
                "VIGIL_PERSIST_QUEUE_CAPACITY" => {
                    self.queues.persistence_capacity = parse_env(&var, &value)?
                }
                "VIGIL_BACKOFF_SECS" => {
                    self.workers.backoff_secs = value
                        .split(',')
                        .filter(|part| !part.trim().is_empty())
                        .map(|part| parse_env(&var, part))
                        .collect::<Result<_, _>>()?
                }
                "VIGIL_RATE_LIMIT_PER_MINUTE" => {
                    self.workers.rate_limit_per_minute = parse_env(&var, &value)?
                }
                "VIGIL_RATE_LIMIT_BURST" => {
                    self.workers.rate_limit_burst = parse_env(&var, &value)?
                }
                "VIGIL_CLASSIFIER_URL" => self.classifier.url = Some(value),
                "VIGIL_CLASSIFIER_API_KEY" => self.classifier.api_key = Some(value),
                "VIGIL_CAMERA_DIR" => self.capture.camera_dir = Some(PathBuf::from(value)),
                "VIGIL_SCREEN_DIR" => self.capture.screen_dir = Some(PathBuf::from(value)),
                "VIGIL_DATA_DIR" => self.storage.data_dir = Some(PathBuf::from(value)),
                "VIGIL_RECOVERY" => {
                    self.storage.recovery = match value.trim().to_ascii_lowercase().as_str() {
                        "resume" => RecoveryPolicy::Resume,
                        "discard" => RecoveryPolicy::Discard,
                        _ => {
                            return Err(ConfigError::Env {
                                var: var.clone(),
                                value: value.clone(),
                            })
                        }
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }

    pub fn apply_overrides(&mut self, overrides: &ConfigOverrides) {
        if let Some(interval) = overrides.sample_interval_secs {
            self.scheduler.sample_interval_secs = interval;
        }
        if let Some(size) = overrides.worker_pool_size {
            self.workers.pool_size = size;
        }
        if let Some(window) = overrides.window_size {
            self.fusion.window_size = window;
        }
        if let Some(span) = overrides.debounce_span_secs {
            self.fusion.debounce_span_secs = span;
        }
        if let Some(dir) = &overrides.data_dir {
            self.storage.data_dir = Some(dir.clone());
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.scheduler.sample_interval_secs < MIN_SAMPLE_INTERVAL_SECS {
            return Err(ConfigError::Validation(format!(
                "sample interval {}s is below the {}s floor",
                self.scheduler.sample_interval_secs, MIN_SAMPLE_INTERVAL_SECS
            )));
        }
        let fusion = &self.fusion;
        let detector = &self.detector;
        for (name, value) in [
            ("sample interval", self.scheduler.sample_interval_secs),
            ("capture timeout", self.scheduler.capture_timeout_secs),
            ("debounce span", fusion.debounce_span_secs),
            ("override grace", fusion.override_grace_secs),
            ("future skew", fusion.max_future_skew_secs),
            ("stale limit", fusion.stale_after_secs),
            ("fusion tick", fusion.tick_secs),
            ("sustained grace", detector.sustained_grace_secs),
            ("pattern window", detector.pattern_window_secs),
            ("ergonomic window", detector.ergonomic_window_secs),
        ] {
            if value > MAX_SPAN_SECS {
                return Err(ConfigError::Validation(format!(
                    "{name} of {value}s exceeds the {MAX_SPAN_SECS}s ceiling"
                )));
            }
        }
        if self.scheduler.poll_slice_ms == 0 {
            return Err(ConfigError::Validation("poll slice must be positive".into()));
        }
        if self.workers.pool_size == 0 {
            return Err(ConfigError::Validation("worker pool size must be at least 1".into()));
        }
        if self.workers.rate_limit_per_minute == 0 || self.workers.rate_limit_burst == 0 {
            return Err(ConfigError::Validation("rate limit budget must be positive".into()));
        }
        if self.fusion.window_size == 0 {
            return Err(ConfigError::Validation("hysteresis window must be at least 1".into()));
        }
        let queues = &self.queues;
        if queues.upload_capacity == 0
            || queues.fusion_capacity == 0
            || queues.event_capacity == 0
            || queues.persistence_capacity == 0
        {
            return Err(ConfigError::Validation("queue capacities must be at least 1".into()));
        }
        if self.persistence.commit_attempts == 0 {
            return Err(ConfigError::Validation("commit attempts must be at least 1".into()));
        }

        unit_interval("fallback confidence", self.workers.fallback_confidence)?;
        for (name, value) in [
            ("partial buffer scale", fusion.partial_buffer_scale),
            ("tie confidence", fusion.tie_confidence),
            ("debounce hold confidence", fusion.debounce_hold_confidence),
            ("initial confidence", fusion.initial_confidence),
            ("resume confidence", fusion.resume_confidence),
            ("pause confidence", fusion.pause_confidence),
            ("override confidence", fusion.override_confidence),
            ("override min confidence", fusion.override_min_confidence),
        ] {
            unit_interval(name, value)?;
        }
        unit_interval("ergonomic ratio", self.detector.ergonomic_ratio)?;

        self.reconciliation
            .validate()
            .map_err(|err| ConfigError::Validation(err.to_string()))?;
        LabelCatalog::from_config(&self.labels)
            .map_err(|err| ConfigError::Validation(err.to_string()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn env(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect()
    }

    #[test]
    fn defaults_validate() {
        let config = VigilConfig::default();
        config.validate().unwrap();
        assert_eq!(config.fusion.majority_threshold(), 2);
        assert_eq!(config.workers.backoff_secs, vec![1, 5, 15]);
    }

    #[test]
    fn majority_threshold_is_ceil_of_k_plus_one_over_two() {
        let mut fusion = FusionConfig::default();
        for (k, expected) in [(1, 1), (2, 2), (3, 2), (4, 3), (5, 3), (6, 4)] {
            fusion.window_size = k;
            assert_eq!(fusion.majority_threshold(), expected, "K = {k}");
        }
    }

    #[test]
    fn rejects_interval_below_floor() {
        let overrides = ConfigOverrides {
            sample_interval_secs: Some(5),
            ..Default::default()
        };
        let err = VigilConfig::load_layered(None, Vec::new(), &overrides).unwrap_err();
        assert!(matches!(err, ConfigError::Validation(_)));
    }

    #[test]
    fn layers_apply_in_precedence_order() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{ "scheduler": {{ "sampleIntervalSecs": 30 }}, "workers": {{ "poolSize": 5 }}, "fusion": {{ "windowSize": 5 }} }}"#
        )
        .unwrap();

        let overrides = ConfigOverrides {
            window_size: Some(7),
            ..Default::default()
        };
        let config = VigilConfig::load_layered(
            Some(file.path()),
            env(&[("VIGIL_WORKER_POOL_SIZE", "2"), ("PATH", "/usr/bin")]),
            &overrides,
        )
        .unwrap();

        assert_eq!(config.scheduler.sample_interval_secs, 30);
        assert_eq!(config.workers.pool_size, 2);
        assert_eq!(config.fusion.window_size, 7);
        assert_eq!(config.fusion.debounce_span_secs, 60);
    }

    #[test]
    fn env_backoff_list_and_recovery_parse() {
        let mut config = VigilConfig::default();
        config
            .apply_env(env(&[("VIGIL_BACKOFF_SECS", "2, 4,8"), ("VIGIL_RECOVERY", "Discard")]))
            .unwrap();
        assert_eq!(config.workers.backoff_secs, vec![2, 4, 8]);
        assert_eq!(config.storage.recovery, RecoveryPolicy::Discard);
    }

    #[test]
    fn bad_env_value_is_reported() {
        let mut config = VigilConfig::default();
        let err = config
            .apply_env(env(&[("VIGIL_WINDOW_SIZE", "three")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Env { var, .. } if var == "VIGIL_WINDOW_SIZE"));
    }

    #[test]
    fn oversized_spans_are_rejected() {
        let err = VigilConfig::load_layered(
            None,
            env(&[("VIGIL_DEBOUNCE_SPAN_SECS", "100000000000000000")]),
            &ConfigOverrides::default(),
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Validation(message) if message.contains("debounce span")));

        let mut config = VigilConfig::default();
        config.detector.pattern_window_secs = MAX_SPAN_SECS + 1;
        assert!(config.validate().is_err());
        config.detector.pattern_window_secs = MAX_SPAN_SECS;
        config.validate().unwrap();
    }

    #[test]
    fn out_of_range_confidence_is_rejected() {
        let mut config = VigilConfig::default();
        config.fusion.tie_confidence = 1.4;
        assert!(config.validate().is_err());
    }
}
