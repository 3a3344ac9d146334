use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::HivewatchError;

#[derive(Deserialize, Debug, Clone)]
pub struct Config {
    pub broker: Broker,
    #[serde(default)]
    pub consumer: Consumer,
    #[serde(default)]
    pub store: Store,
    #[serde(default)]
    pub masks: Masks,
    #[serde(default)]
    pub background: Background,
    #[serde(default)]
    pub detection: Detection,
    #[serde(default)]
    pub artifacts: Artifacts,
    #[serde(default)]
    pub api: Api,
}

#[derive(Deserialize, Debug, Clone)]
pub struct Broker {
    pub brokers: String,
    pub topic: String,
    #[serde(default = "default_group_id")]
    pub group_id: String,
    #[serde(default)]
    pub dead_letter_topic: Option<String>,
    #[serde(default = "default_poll_timeout_ms")]
    pub poll_timeout_ms: u64,
    #[serde(default = "default_session_timeout_ms")]
    pub session_timeout_ms: u64,
}

#[derive(Deserialize, Debug, Clone)]
pub struct Consumer {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_processing_timeout_ms")]
    pub processing_timeout_ms: u64,
    #[serde(default = "default_fetch_timeout_ms")]
    pub fetch_timeout_ms: u64,
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default)]
    pub backoff: Backoff,
}

#[derive(Deserialize, Debug, Clone)]
pub struct Backoff {
    #[serde(default = "default_backoff_initial_ms")]
    pub initial_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    pub max_ms: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub multiplier: f64,
    #[serde(default = "default_backoff_jitter")]
    pub jitter: f64,
}

#[derive(Deserialize, Debug, Clone)]
pub struct Store {
    #[serde(default = "default_store_path")]
    pub path: PathBuf,
    #[serde(default = "default_store_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_true")]
    pub store_images: bool,
}

#[derive(Deserialize, Debug, Clone)]
pub struct Masks {
    #[serde(default = "default_masks_dir")]
    pub dir: PathBuf,
    /// Hives whose masks are loaded at startup. Others are loaded on first message.
    #[serde(default)]
    pub hives: Vec<String>,
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum Cadence {
    EveryFrame,
    EveryFrames { frames: u32 },
    Interval { seconds: u64 },
}

#[derive(Deserialize, Debug, Clone)]
pub struct Background {
    #[serde(default = "default_history_size")]
    pub history_size: usize,
    #[serde(default = "default_history_size")]
    pub warmup_frames: usize,
    #[serde(default = "default_cadence")]
    pub cadence: Cadence,
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum Threshold {
    Fixed { level: u8 },
    Adaptive { floor: u8, deviations: f32 },
}

#[derive(Deserialize, Debug, Clone)]
pub struct Detection {
    #[serde(default = "default_threshold")]
    pub threshold: Threshold,
    #[serde(default = "default_opening_kernel")]
    pub opening_kernel: u32,
    #[serde(default = "default_true")]
    pub count_blobs: bool,
    /// Gaussian blur applied to frame and background before differencing. 0 disables.
    #[serde(default)]
    pub blur_sigma: f32,
    #[serde(default = "default_min_blob_area")]
    pub min_blob_area: u32,
    #[serde(default = "default_max_blob_area")]
    pub max_blob_area: Option<u32>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct Artifacts {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_artifacts_dir")]
    pub output_dir: PathBuf,
    #[serde(default = "default_true")]
    pub overlay: bool,
}

#[derive(Deserialize, Debug, Clone)]
pub struct Api {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_api_bind")]
    pub bind: String,
}

fn default_group_id() -> String {
    "hivewatch".to_string()
}
fn default_poll_timeout_ms() -> u64 {
    1000
}
fn default_session_timeout_ms() -> u64 {
    10_000
}
fn default_max_retries() -> u32 {
    3
}
fn default_processing_timeout_ms() -> u64 {
    30_000
}
fn default_fetch_timeout_ms() -> u64 {
    10_000
}
fn default_workers() -> usize {
    1
}
fn default_backoff_initial_ms() -> u64 {
    500
}
fn default_backoff_max_ms() -> u64 {
    30_000
}
fn default_backoff_multiplier() -> f64 {
    2.0
}
fn default_backoff_jitter() -> f64 {
    0.1
}
fn default_store_path() -> PathBuf {
    PathBuf::from("hivewatch.db")
}
fn default_store_timeout_ms() -> u64 {
    5_000
}
fn default_masks_dir() -> PathBuf {
    PathBuf::from("masks")
}
fn default_history_size() -> usize {
    15
}
fn default_cadence() -> Cadence {
    Cadence::EveryFrame
}
fn default_threshold() -> Threshold {
    Threshold::Fixed { level: 25 }
}
fn default_opening_kernel() -> u32 {
    3
}
fn default_min_blob_area() -> u32 {
    20
}
fn default_max_blob_area() -> Option<u32> {
    Some(8000)
}
fn default_artifacts_dir() -> PathBuf {
    PathBuf::from("output")
}
fn default_api_bind() -> String {
    "0.0.0.0:8080".to_string()
}
fn default_true() -> bool {
    true
}

impl Default for Consumer {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            processing_timeout_ms: default_processing_timeout_ms(),
            fetch_timeout_ms: default_fetch_timeout_ms(),
            workers: default_workers(),
            backoff: Backoff::default(),
        }
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial_ms: default_backoff_initial_ms(),
            max_ms: default_backoff_max_ms(),
            multiplier: default_backoff_multiplier(),
            jitter: default_backoff_jitter(),
        }
    }
}

impl Default for Store {
    fn default() -> Self {
        Self {
            path: default_store_path(),
            timeout_ms: default_store_timeout_ms(),
            store_images: true,
        }
    }
}

impl Default for Masks {
    fn default() -> Self {
        Self {
            dir: default_masks_dir(),
            hives: Vec::new(),
        }
    }
}

impl Default for Background {
    fn default() -> Self {
        Self {
            history_size: default_history_size(),
            warmup_frames: default_history_size(),
            cadence: default_cadence(),
        }
    }
}

impl Default for Detection {
    fn default() -> Self {
        Self {
            threshold: default_threshold(),
            opening_kernel: default_opening_kernel(),
            count_blobs: true,
            blur_sigma: 0.0,
            min_blob_area: default_min_blob_area(),
            max_blob_area: default_max_blob_area(),
        }
    }
}

impl Default for Artifacts {
    fn default() -> Self {
        Self {
            enabled: false,
            output_dir: default_artifacts_dir(),
            overlay: true,
        }
    }
}

impl Default for Api {
    fn default() -> Self {
        Self {
            enabled: true,
            bind: default_api_bind(),
        }
    }
}

impl Config {
    /// Read, apply environment overrides and validate.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, HivewatchError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|err| {
            HivewatchError::Configuration(format!(
                "could not read config file {}: {}",
                path.display(),
                err
            ))
        })?;
        let mut config = Self::from_toml(&contents)?;
        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(contents: &str) -> Result<Self, HivewatchError> {
        toml::from_str(contents)
            .map_err(|err| HivewatchError::Configuration(format!("invalid config: {}", err)))
    }

    /// Deployment overrides, looked up through `lookup` so tests don't touch the process env.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(brokers) = lookup("HIVEWATCH_BROKERS") {
            self.broker.brokers = brokers;
        }
        if let Some(topic) = lookup("HIVEWATCH_TOPIC") {
            self.broker.topic = topic;
        }
        if let Some(group_id) = lookup("HIVEWATCH_GROUP_ID") {
            self.broker.group_id = group_id;
        }
        if let Some(path) = lookup("HIVEWATCH_STORE_PATH") {
            self.store.path = PathBuf::from(path);
        }
        if let Some(dir) = lookup("HIVEWATCH_MASKS_DIR") {
            self.masks.dir = PathBuf::from(dir);
        }
        if let Some(bind) = lookup("HIVEWATCH_API_BIND") {
            self.api.bind = bind;
        }
    }

    pub fn validate(&self) -> Result<(), HivewatchError> {
        let fail = |msg: &str| Err(HivewatchError::Configuration(msg.to_string()));

        if self.broker.topic.is_empty() {
            return fail("broker.topic must not be empty");
        }
        if self.consumer.workers == 0 {
            return fail("consumer.workers must be at least 1");
        }
        if self.consumer.backoff.initial_ms == 0
            || self.consumer.backoff.max_ms < self.consumer.backoff.initial_ms
        {
            return fail("consumer.backoff requires 0 < initial_ms <= max_ms");
        }
        if self.consumer.backoff.multiplier < 1.0 {
            return fail("consumer.backoff.multiplier must be >= 1.0");
        }
        if !(0.0..=1.0).contains(&self.consumer.backoff.jitter) {
            return fail("consumer.backoff.jitter must be within [0, 1]");
        }
        if self.consumer.processing_timeout_ms <= self.store.timeout_ms {
            return fail("consumer.processing_timeout_ms must exceed store.timeout_ms");
        }
        if self.background.history_size == 0 {
            return fail("background.history_size must be at least 1");
        }
        if self.background.warmup_frames == 0
            || self.background.warmup_frames > self.background.history_size
        {
            return fail("background.warmup_frames must be within 1..=history_size");
        }
        match self.background.cadence {
            Cadence::EveryFrames { frames: 0 } => {
                return fail("background.cadence.frames must be at least 1")
            }
            Cadence::Interval { seconds: 0 } => {
                return fail("background.cadence.seconds must be at least 1")
            }
            _ => {}
        }
        if self.detection.opening_kernel == 0 || self.detection.opening_kernel % 2 == 0 {
            return fail("detection.opening_kernel must be an odd number >= 1");
        }
        if !(self.detection.blur_sigma.is_finite() && self.detection.blur_sigma >= 0.0) {
            return fail("detection.blur_sigma must be a non-negative number");
        }
        if let Some(max) = self.detection.max_blob_area {
            if max < self.detection.min_blob_area {
                return fail("detection.max_blob_area must be >= min_blob_area");
            }
        }
        if let Threshold::Adaptive { deviations, .. } = self.detection.threshold {
            if !(deviations.is_finite() && deviations >= 0.0) {
                return fail("detection.threshold.deviations must be a non-negative number");
            }
        }
        Ok(())
    }

    pub fn dead_letter_topic(&self) -> String {
        self.broker
            .dead_letter_topic
            .clone()
            .unwrap_or_else(|| format!("{}.dlq", self.broker.topic))
    }
}

impl Consumer {
    pub fn processing_timeout(&self) -> Duration {
        Duration::from_millis(self.processing_timeout_ms)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }
}

impl Store {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
        [broker]
        brokers = "localhost:9092"
        topic = "photo-uploads"
    "#;

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config = Config::from_toml(MINIMAL).unwrap();
        config.validate().unwrap();

        assert_eq!(config.broker.group_id, "hivewatch");
        assert_eq!(config.dead_letter_topic(), "photo-uploads.dlq");
        assert_eq!(config.consumer.max_retries, 3);
        assert_eq!(config.background.history_size, 15);
        assert_eq!(config.background.cadence, Cadence::EveryFrame);
        assert_eq!(config.detection.threshold, Threshold::Fixed { level: 25 });
        assert_eq!(config.detection.opening_kernel, 3);
        assert!(!config.artifacts.enabled);
    }

    #[test]
    fn test_tagged_sections_parse() {
        let config = Config::from_toml(
            r#"
            [broker]
            brokers = "kafka:9092"
            topic = "frames"
            dead_letter_topic = "frames-dead"

            [background]
            history_size = 10
            warmup_frames = 5
            cadence = { mode = "every_frames", frames = 4 }

            [detection]
            threshold = { mode = "adaptive", floor = 15, deviations = 3.0 }
            opening_kernel = 5
            count_blobs = false
            "#,
        )
        .unwrap();
        config.validate().unwrap();

        assert_eq!(config.dead_letter_topic(), "frames-dead");
        assert_eq!(config.background.cadence, Cadence::EveryFrames { frames: 4 });
        assert_eq!(
            config.detection.threshold,
            Threshold::Adaptive {
                floor: 15,
                deviations: 3.0
            }
        );
        assert!(!config.detection.count_blobs);
    }

    #[test]
    fn test_processing_timeout_must_outlast_store_timeout() {
        let mut config = Config::from_toml(MINIMAL).unwrap();
        config.store.timeout_ms = 5000;
        config.consumer.processing_timeout_ms = 5000;
        assert!(matches!(
            config.validate(),
            Err(HivewatchError::Configuration(_))
        ));

        config.consumer.processing_timeout_ms = 5001;
        config.validate().unwrap();
    }

    #[test]
    fn test_blob_area_bounds_are_checked() {
        let mut config = Config::from_toml(MINIMAL).unwrap();
        assert_eq!(config.detection.min_blob_area, 20);
        assert_eq!(config.detection.max_blob_area, Some(8000));
        assert_eq!(config.detection.blur_sigma, 0.0);

        config.detection.min_blob_area = 100;
        config.detection.max_blob_area = Some(50);
        assert!(config.validate().is_err());

        config.detection.max_blob_area = None;
        config.validate().unwrap();

        config.detection.blur_sigma = -1.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_even_kernel_is_rejected() {
        let mut config = Config::from_toml(MINIMAL).unwrap();
        config.detection.opening_kernel = 4;
        assert!(matches!(
            config.validate(),
            Err(HivewatchError::Configuration(_))
        ));
    }

    #[test]
    fn test_warmup_larger_than_history_is_rejected() {
        let mut config = Config::from_toml(MINIMAL).unwrap();
        config.background.warmup_frames = 20;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_environment_overrides() {
        let mut config = Config::from_toml(MINIMAL).unwrap();
        config.apply_overrides(|key| match key {
            "HIVEWATCH_BROKERS" => Some("broker-1:9092".to_string()),
            "HIVEWATCH_STORE_PATH" => Some("/data/bees.db".to_string()),
            _ => None,
        });

        assert_eq!(config.broker.brokers, "broker-1:9092");
        assert_eq!(config.store.path, PathBuf::from("/data/bees.db"));
        assert_eq!(config.broker.topic, "photo-uploads");
    }

    #[test]
    fn test_missing_broker_section_is_configuration_error() {
        assert!(matches!(
            Config::from_toml("[store]\npath = \"x.db\""),
            Err(HivewatchError::Configuration(_))
        ));
    }
}
