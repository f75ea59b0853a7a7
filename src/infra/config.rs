//! Configuration loading from TOML files
//!
//! Config file is selected via:
//! 1. --config <path> command line argument
//! 2. CONFIG_FILE environment variable
//! 3. Default: config/dev.toml
//!
//! A missing file falls back to built-in defaults. A file that exists but
//! cannot be read, parsed or validated is a fatal `ConfigError`.

use crate::domain::types::SensorMode;
use crate::services::aggregator::AggregationParams;
use crate::services::crossing::CrossingParams;
use crate::services::model::ModelError;
use crate::services::scorer::{NormalizationRanges, ScoreWeights};
use rustc_hash::FxHashSet;
use serde::Deserialize;
use std::env;
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },

    #[error("model artifact {path}: {source}")]
    Model {
        path: String,
        #[source]
        source: ModelError,
    },
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid { field, reason: reason.into() }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum SourceConfig {
    /// Serial port (Arduino-style board)
    Serial {
        device: String,
        #[serde(default = "default_serial_baud")]
        baud: u32,
        /// Delay before reopening the port after an error or EOF
        #[serde(default = "default_reconnect_delay_ms")]
        reconnect_delay_ms: u64,
    },
    /// Lines piped into this process
    Stdin,
    /// Spawned child process whose stdout carries the lines
    Command {
        program: String,
        #[serde(default)]
        args: Vec<String>,
    },
}

fn default_serial_baud() -> u32 {
    9600
}

fn default_reconnect_delay_ms() -> u64 {
    2000
}

#[derive(Debug, Clone, Deserialize)]
pub struct DoorwayConfig {
    /// Unique doorway identifier (e.g., "west-entrance")
    pub id: String,
    /// Room whose live documents this doorway updates; one doorway per room
    pub room_id: String,
    #[serde(default = "default_sensor_mode")]
    pub mode: SensorMode,
    pub source: SourceConfig,
}

fn default_sensor_mode() -> SensorMode {
    SensorMode::Combined
}

impl DoorwayConfig {
    fn default_doorway() -> Self {
        Self {
            id: "door-1".to_string(),
            room_id: "room01".to_string(),
            mode: SensorMode::Combined,
            source: SourceConfig::Stdin,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CrossingConfig {
    pub min_debounce_secs: f64,
    pub max_debounce_secs: f64,
    pub debounce_scale: f64,
    pub min_event_gap_secs: f64,
}

impl Default for CrossingConfig {
    fn default() -> Self {
        let p = CrossingParams::default();
        Self {
            min_debounce_secs: p.min_debounce_secs,
            max_debounce_secs: p.max_debounce_secs,
            debounce_scale: p.debounce_scale,
            min_event_gap_secs: p.min_event_gap_secs,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AggregationConfig {
    pub window_secs: u64,
    pub sample_rate_hz: f64,
    pub interval_secs: u64,
    pub min_samples: usize,
}

impl Default for AggregationConfig {
    fn default() -> Self {
        let p = AggregationParams::default();
        Self {
            window_secs: p.window_secs,
            sample_rate_hz: p.sample_rate_hz,
            interval_secs: p.interval_secs,
            min_samples: p.min_samples,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScorerStrategy {
    Weighted,
    Model,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ScorerConfig {
    pub strategy: ScorerStrategy,
    /// JSON model artifact (required for strategy = "model")
    pub model_path: Option<String>,
    pub sound_min_db: f64,
    pub sound_max_db: f64,
    pub co2_min_ppm: f64,
    pub co2_max_ppm: f64,
    pub motion_weight: f64,
    pub sound_weight: f64,
    pub co2_weight: f64,
}

impl Default for ScorerConfig {
    fn default() -> Self {
        let r = NormalizationRanges::default();
        let w = ScoreWeights::default();
        Self {
            strategy: ScorerStrategy::Weighted,
            model_path: None,
            sound_min_db: r.sound_min_db,
            sound_max_db: r.sound_max_db,
            co2_min_ppm: r.co2_min_ppm,
            co2_max_ppm: r.co2_max_ppm,
            motion_weight: w.motion,
            sound_weight: w.sound,
            co2_weight: w.co2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// Firebase-style REST document store
    Rest,
    /// Mirror writes to MQTT topics
    Mqtt,
    /// In-process document tree (dry runs)
    Memory,
}

impl StoreBackend {
    pub fn as_str(&self) -> &'static str {
        match self {
            StoreBackend::Rest => "rest",
            StoreBackend::Mqtt => "mqtt",
            StoreBackend::Memory => "memory",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    /// Base URL for the REST backend
    pub url: Option<String>,
    /// Sent as the `auth` query parameter when set
    pub auth_token: Option<String>,
    pub timeout_ms: u64,
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub mqtt_topic_prefix: String,
    pub mqtt_username: Option<String>,
    pub mqtt_password: Option<String>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Memory,
            url: None,
            auth_token: None,
            timeout_ms: 5000,
            mqtt_host: "localhost".to_string(),
            mqtt_port: 1883,
            mqtt_topic_prefix: "occupancy".to_string(),
            mqtt_username: None,
            mqtt_password: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackpressurePolicy {
    DropOldest,
    Block,
}

/// What the publish queue does when full
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backpressure {
    /// Evict the oldest queued write to make room
    DropOldest,
    /// Wait up to `timeout` for room, then drop the new write
    Block { timeout: Duration },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PublishConfig {
    pub queue_capacity: usize,
    pub backpressure: BackpressurePolicy,
    pub block_timeout_ms: u64,
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
}

impl Default for PublishConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 256,
            backpressure: BackpressurePolicy::DropOldest,
            block_timeout_ms: 250,
            max_retries: 3,
            retry_backoff_ms: 500,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub interval_secs: u64,
    /// Prometheus metrics HTTP port (0 to disable)
    pub prometheus_port: u16,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { interval_secs: 30, prometheus_port: 9100 }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct DatasetConfig {
    /// CSV file that snapshots are appended to (disabled when absent)
    #[serde(default)]
    pub file: Option<String>,
}

/// Room metadata seeded by the store-reset tool
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RoomConfig {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub building: String,
    #[serde(default)]
    pub capacity: u32,
    #[serde(default)]
    pub floor: i32,
    #[serde(rename = "type", default)]
    pub room_type: String,
    #[serde(default)]
    pub lat: Option<f64>,
    #[serde(default)]
    pub lng: Option<f64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SiteConfig {
    #[serde(default = "default_site_id")]
    pub id: String,
}

impl Default for SiteConfig {
    fn default() -> Self {
        Self { id: default_site_id() }
    }
}

fn default_site_id() -> String {
    "campus".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct TomlConfig {
    #[serde(default)]
    pub site: SiteConfig,
    #[serde(default)]
    pub doorways: Vec<DoorwayConfig>,
    #[serde(default)]
    pub crossing: CrossingConfig,
    #[serde(default)]
    pub aggregation: AggregationConfig,
    #[serde(default)]
    pub scorer: ScorerConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub publish: PublishConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub dataset: DatasetConfig,
    #[serde(default)]
    pub rooms: Vec<RoomConfig>,
}

/// Main configuration struct used throughout the application
#[derive(Debug, Clone)]
pub struct Config {
    site_id: String,
    doorways: Vec<DoorwayConfig>,
    crossing: CrossingParams,
    aggregation: AggregationParams,
    scorer_strategy: ScorerStrategy,
    model_path: Option<String>,
    ranges: NormalizationRanges,
    weights: ScoreWeights,
    store: StoreConfig,
    publish: PublishConfig,
    metrics_interval_secs: u64,
    prometheus_port: u16,
    dataset_file: Option<String>,
    rooms: Vec<RoomConfig>,
    config_file: String,
}

impl Default for Config {
    fn default() -> Self {
        let mut config = Self::from_toml(TomlConfig {
            site: SiteConfig::default(),
            doorways: Vec::new(),
            crossing: CrossingConfig::default(),
            aggregation: AggregationConfig::default(),
            scorer: ScorerConfig::default(),
            store: StoreConfig::default(),
            publish: PublishConfig::default(),
            metrics: MetricsConfig::default(),
            dataset: DatasetConfig::default(),
            rooms: Vec::new(),
        });
        config.doorways = vec![DoorwayConfig::default_doorway()];
        config.config_file = "default".to_string();
        config
    }
}

impl Config {
    /// Determine config file path from args or environment
    pub fn resolve_config_path(args: &[String]) -> String {
        // Check for --config argument
        for (i, arg) in args.iter().enumerate() {
            if arg == "--config" {
                if let Some(path) = args.get(i + 1) {
                    return path.clone();
                }
            }
            if let Some(path) = arg.strip_prefix("--config=") {
                return path.to_string();
            }
        }

        // Check CONFIG_FILE environment variable
        if let Ok(path) = env::var("CONFIG_FILE") {
            return path;
        }

        "config/dev.toml".to_string()
    }

    fn from_toml(toml_config: TomlConfig) -> Self {
        let c = toml_config.crossing;
        let a = toml_config.aggregation;
        let s = toml_config.scorer;

        Self {
            site_id: toml_config.site.id,
            doorways: toml_config.doorways,
            crossing: CrossingParams {
                min_debounce_secs: c.min_debounce_secs,
                max_debounce_secs: c.max_debounce_secs,
                debounce_scale: c.debounce_scale,
                min_event_gap_secs: c.min_event_gap_secs,
            },
            aggregation: AggregationParams {
                window_secs: a.window_secs,
                sample_rate_hz: a.sample_rate_hz,
                interval_secs: a.interval_secs,
                min_samples: a.min_samples,
            },
            scorer_strategy: s.strategy,
            model_path: s.model_path,
            ranges: NormalizationRanges {
                sound_min_db: s.sound_min_db,
                sound_max_db: s.sound_max_db,
                co2_min_ppm: s.co2_min_ppm,
                co2_max_ppm: s.co2_max_ppm,
            },
            weights: ScoreWeights { motion: s.motion_weight, sound: s.sound_weight, co2: s.co2_weight },
            store: toml_config.store,
            publish: toml_config.publish,
            metrics_interval_secs: toml_config.metrics.interval_secs,
            prometheus_port: toml_config.metrics.prometheus_port,
            dataset_file: toml_config.dataset.file,
            rooms: toml_config.rooms,
            config_file: String::new(),
        }
    }

    /// Load and validate configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let display = path.display().to_string();
        let content = fs::read_to_string(path)
            .map_err(|source| ConfigError::Read { path: display.clone(), source })?;

        Self::from_toml_str(&content, &display)
    }

    /// Parse and validate configuration from TOML text
    pub fn from_toml_str(content: &str, origin: &str) -> Result<Self, ConfigError> {
        let toml_config: TomlConfig = toml::from_str(content)
            .map_err(|source| ConfigError::Parse { path: origin.to_string(), source })?;

        let mut config = Self::from_toml(toml_config);
        config.config_file = origin.to_string();
        config.validate()?;
        Ok(config)
    }

    /// Load configuration - a missing file falls back to defaults
    pub fn load_from_path(path: &str) -> Result<Self, ConfigError> {
        if !Path::new(path).exists() {
            warn!(path = %path, "config_file_missing_using_defaults");
            let config = Self::default();
            config.validate()?;
            return Ok(config);
        }
        Self::from_file(path)
    }

    /// Reject configurations that would leave the pipeline in an undefined state
    pub fn validate(&self) -> Result<(), ConfigError> {
        let c = &self.crossing;
        if !(c.min_debounce_secs.is_finite() && c.min_debounce_secs > 0.0) {
            return Err(invalid("crossing.min_debounce_secs", "must be a positive number"));
        }
        if !c.max_debounce_secs.is_finite() || c.min_debounce_secs > c.max_debounce_secs {
            return Err(invalid(
                "crossing.max_debounce_secs",
                format!(
                    "min debounce {} exceeds max debounce {}",
                    c.min_debounce_secs, c.max_debounce_secs
                ),
            ));
        }
        if !(c.debounce_scale.is_finite() && c.debounce_scale > 0.0) {
            return Err(invalid("crossing.debounce_scale", "must be a positive number"));
        }
        if !(c.min_event_gap_secs.is_finite() && c.min_event_gap_secs >= 0.0) {
            return Err(invalid("crossing.min_event_gap_secs", "must be zero or positive"));
        }

        let a = &self.aggregation;
        if a.window_secs == 0 {
            return Err(invalid("aggregation.window_secs", "must be positive"));
        }
        if !(a.sample_rate_hz.is_finite() && a.sample_rate_hz > 0.0) {
            return Err(invalid("aggregation.sample_rate_hz", "must be a positive number"));
        }
        if a.interval_secs == 0 {
            return Err(invalid("aggregation.interval_secs", "must be positive"));
        }
        if a.min_samples > a.capacity() {
            return Err(invalid(
                "aggregation.min_samples",
                format!("{} exceeds window capacity {}", a.min_samples, a.capacity()),
            ));
        }

        let r = &self.ranges;
        if !(r.sound_min_db.is_finite() && r.sound_max_db.is_finite())
            || r.sound_min_db >= r.sound_max_db
        {
            return Err(invalid("scorer.sound_min_db", "sound range must satisfy min < max"));
        }
        if !(r.co2_min_ppm.is_finite() && r.co2_max_ppm.is_finite()) || r.co2_min_ppm >= r.co2_max_ppm
        {
            return Err(invalid("scorer.co2_min_ppm", "CO2 range must satisfy min < max"));
        }
        let w = &self.weights;
        if [w.motion, w.sound, w.co2].iter().any(|v| !v.is_finite() || *v < 0.0) {
            return Err(invalid("scorer.weights", "weights must be finite and non-negative"));
        }
        if self.scorer_strategy == ScorerStrategy::Model && self.model_path.is_none() {
            return Err(invalid("scorer.model_path", "required when strategy = \"model\""));
        }

        if self.store.backend == StoreBackend::Rest && self.store.url.is_none() {
            return Err(invalid("store.url", "required for the rest backend"));
        }
        if self.publish.queue_capacity == 0 {
            return Err(invalid("publish.queue_capacity", "must be positive"));
        }
        if self.metrics_interval_secs == 0 {
            return Err(invalid("metrics.interval_secs", "must be positive"));
        }

        if self.doorways.is_empty() {
            return Err(invalid("doorways", "at least one [[doorways]] entry is required"));
        }
        // Room documents hold one doorway's count and session, so rooms are not shared
        let mut seen = FxHashSet::default();
        let mut rooms = FxHashSet::default();
        for doorway in &self.doorways {
            if doorway.id.is_empty() || doorway.room_id.is_empty() {
                return Err(invalid("doorways", "id and room_id must be non-empty"));
            }
            if !seen.insert(doorway.id.as_str()) {
                return Err(invalid("doorways", format!("duplicate doorway id {:?}", doorway.id)));
            }
            if !rooms.insert(doorway.room_id.as_str()) {
                return Err(invalid(
                    "doorways",
                    format!(
                        "room {:?} is already served by another doorway; use mode = \"combined\" for one stream carrying both kinds",
                        doorway.room_id
                    ),
                ));
            }
        }

        Ok(())
    }

    // Getters for all config fields
    pub fn site_id(&self) -> &str {
        &self.site_id
    }

    pub fn doorways(&self) -> &[DoorwayConfig] {
        &self.doorways
    }

    pub fn crossing_params(&self) -> CrossingParams {
        self.crossing
    }

    pub fn aggregation_params(&self) -> AggregationParams {
        self.aggregation
    }

    pub fn scorer_strategy(&self) -> ScorerStrategy {
        self.scorer_strategy
    }

    pub fn model_path(&self) -> Option<&str> {
        self.model_path.as_deref()
    }

    pub fn normalization_ranges(&self) -> NormalizationRanges {
        self.ranges
    }

    pub fn score_weights(&self) -> ScoreWeights {
        self.weights
    }

    pub fn store(&self) -> &StoreConfig {
        &self.store
    }

    pub fn store_backend(&self) -> StoreBackend {
        self.store.backend
    }

    pub fn publish_queue_capacity(&self) -> usize {
        self.publish.queue_capacity
    }

    pub fn backpressure(&self) -> Backpressure {
        match self.publish.backpressure {
            BackpressurePolicy::DropOldest => Backpressure::DropOldest,
            BackpressurePolicy::Block => Backpressure::Block {
                timeout: Duration::from_millis(self.publish.block_timeout_ms),
            },
        }
    }

    pub fn publish_max_retries(&self) -> u32 {
        self.publish.max_retries
    }

    pub fn publish_retry_backoff(&self) -> Duration {
        Duration::from_millis(self.publish.retry_backoff_ms)
    }

    pub fn metrics_interval_secs(&self) -> u64 {
        self.metrics_interval_secs
    }

    pub fn prometheus_port(&self) -> u16 {
        self.prometheus_port
    }

    pub fn dataset_file(&self) -> Option<&str> {
        self.dataset_file.as_deref()
    }

    pub fn rooms(&self) -> &[RoomConfig] {
        &self.rooms
    }

    pub fn config_file(&self) -> &str {
        &self.config_file
    }

    /// Builder method for tests to select the model strategy
    #[cfg(test)]
    pub fn with_model_strategy(mut self, path: &str) -> Self {
        self.scorer_strategy = ScorerStrategy::Model;
        self.model_path = Some(path.to_string());
        self
    }

    /// Builder method for tests to override aggregation params
    #[cfg(test)]
    pub fn with_aggregation(mut self, params: AggregationParams) -> Self {
        self.aggregation = params;
        self
    }

    /// Builder method for tests to override crossing params
    #[cfg(test)]
    pub fn with_crossing(mut self, params: CrossingParams) -> Self {
        self.crossing = params;
        self
    }
}
