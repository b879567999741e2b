use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Error type for configuration loading
#[derive(Debug)]
pub enum ConfigError {
    ReadError {
        path: PathBuf,
        source: std::io::Error,
    },
    ParseError {
        path: PathBuf,
        source: toml::de::Error,
    },
    InvalidValue {
        path: PathBuf,
        field: String,
        value: String,
        valid_values: Vec<String>,
    },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::ReadError { path, source } => {
                write!(
                    f,
                    "Failed to read config file {}: {}",
                    path.display(),
                    source
                )
            }
            ConfigError::ParseError { path, source } => {
                write!(f, "Invalid TOML syntax in {}: {}", path.display(), source)
            }
            ConfigError::InvalidValue {
                path,
                field,
                value,
                valid_values,
            } => {
                write!(
                    f,
                    "Invalid value '{}' for '{}' in {}\n  Valid values: {}",
                    value,
                    field,
                    path.display(),
                    valid_values.join(", ")
                )
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::ReadError { source, .. } => Some(source),
            ConfigError::ParseError { source, .. } => Some(source),
            ConfigError::InvalidValue { .. } => None,
        }
    }
}

/// chatrelay configuration loaded from `~/.config/chatrelay/config.toml`.
///
/// Every field has a default, so an empty or missing file is valid.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub quota: QuotaConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub stream: StreamConfig,
    #[serde(default)]
    pub generation: GenerationParams,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Admission ceilings for the dispatch queue.
///
/// Example in `config.toml`:
/// ```toml
/// [quota]
/// per_second = 3
/// per_minute = 10
/// ```
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct QuotaConfig {
    #[serde(default = "default_per_second")]
    pub per_second: u32,
    #[serde(default = "default_per_minute")]
    pub per_minute: u32,
}

fn default_per_second() -> u32 {
    3
}

fn default_per_minute() -> u32 {
    10
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            per_second: default_per_second(),
            per_minute: default_per_minute(),
        }
    }
}

/// Delays used by the admission loop, in milliseconds.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// Retry delay when the per-second ceiling is the binding constraint
    #[serde(default = "default_second_backoff")]
    pub second_backoff_ms: u64,
    /// Retry delay when the per-minute ceiling is met
    #[serde(default = "default_minute_backoff")]
    pub minute_backoff_ms: u64,
    /// Re-poll interval while the queue still holds envelopes
    #[serde(default = "default_drain_interval")]
    pub drain_interval_ms: u64,
    /// Retry delay after a failed admission pass
    #[serde(default = "default_error_backoff")]
    pub error_backoff_ms: u64,
}

fn default_second_backoff() -> u64 {
    1000
}

fn default_minute_backoff() -> u64 {
    5000
}

fn default_drain_interval() -> u64 {
    50
}

fn default_error_backoff() -> u64 {
    1000
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            second_backoff_ms: default_second_backoff(),
            minute_backoff_ms: default_minute_backoff(),
            drain_interval_ms: default_drain_interval(),
            error_backoff_ms: default_error_backoff(),
        }
    }
}

impl SchedulerConfig {
    pub fn second_backoff(&self) -> Duration {
        Duration::from_millis(self.second_backoff_ms)
    }

    pub fn minute_backoff(&self) -> Duration {
        Duration::from_millis(self.minute_backoff_ms)
    }

    pub fn drain_interval(&self) -> Duration {
        Duration::from_millis(self.drain_interval_ms)
    }

    pub fn error_backoff(&self) -> Duration {
        Duration::from_millis(self.error_backoff_ms)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct StreamConfig {
    /// Consecutive frames without any delta before a stream is considered finished
    #[serde(default = "default_stall_threshold")]
    pub stall_threshold: u32,
    /// Strip surrounding whitespace from each delta before appending it
    #[serde(default = "default_trim_deltas")]
    pub trim_deltas: bool,
}

fn default_stall_threshold() -> u32 {
    5
}

fn default_trim_deltas() -> bool {
    true
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            stall_threshold: default_stall_threshold(),
            trim_deltas: default_trim_deltas(),
        }
    }
}

/// Sampling parameters sent with every chat request.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct GenerationParams {
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_top_p")]
    pub top_p: f32,
    #[serde(default = "default_top_k")]
    pub top_k: u32,
    #[serde(default = "default_frequency_penalty")]
    pub frequency_penalty: f32,
    #[serde(default = "default_n")]
    pub n: u32,
}

fn default_max_tokens() -> u32 {
    16384
}

fn default_temperature() -> f32 {
    0.7
}

fn default_top_p() -> f32 {
    1.0
}

fn default_top_k() -> u32 {
    50
}

fn default_frequency_penalty() -> f32 {
    0.5
}

fn default_n() -> u32 {
    1
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            top_p: default_top_p(),
            top_k: default_top_k(),
            frequency_penalty: default_frequency_penalty(),
            n: default_n(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct LoggingConfig {
    #[serde(default)]
    pub debug: bool,
    /// Log full request bodies for debugging
    #[serde(default)]
    pub log_requests: bool,
}

impl Config {
    pub fn dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("chatrelay")
    }

    pub fn path() -> PathBuf {
        Self::dir().join("config.toml")
    }

    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(&Self::path())
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            source: e,
        })?;
        let config: Config = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            source: e,
        })?;

        config.validate(path)?;
        Ok(config)
    }

    fn validate(&self, path: &Path) -> Result<(), ConfigError> {
        let positive = |field: &str, value: u64| {
            if value == 0 {
                Err(ConfigError::InvalidValue {
                    path: path.to_path_buf(),
                    field: field.to_string(),
                    value: value.to_string(),
                    valid_values: vec!["any integer greater than 0".to_string()],
                })
            } else {
                Ok(())
            }
        };

        positive("quota.per_second", self.quota.per_second.into())?;
        positive("quota.per_minute", self.quota.per_minute.into())?;
        positive("stream.stall_threshold", self.stream.stall_threshold.into())?;
        positive("generation.n", self.generation.n.into())?;

        if !(0.0..=2.0).contains(&self.generation.temperature) {
            return Err(ConfigError::InvalidValue {
                path: path.to_path_buf(),
                field: "generation.temperature".to_string(),
                value: self.generation.temperature.to_string(),
                valid_values: vec!["0.0 to 2.0".to_string()],
            });
        }

        if !(0.0..=1.0).contains(&self.generation.top_p) {
            return Err(ConfigError::InvalidValue {
                path: path.to_path_buf(),
                field: "generation.top_p".to_string(),
                value: self.generation.top_p.to_string(),
                valid_values: vec!["0.0 to 1.0".to_string()],
            });
        }

        Ok(())
    }

    /// Save config to the config file
    pub fn save(&self) -> Result<(), ConfigError> {
        self.save_to(&Self::path())
    }

    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::ReadError {
                path: path.to_path_buf(),
                source: e,
            })?;
        }

        let content = toml::to_string_pretty(self).map_err(|e| ConfigError::InvalidValue {
            path: path.to_path_buf(),
            field: "serialization".to_string(),
            value: e.to_string(),
            valid_values: vec![],
        })?;

        std::fs::write(path, content).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            source: e,
        })?;

        Ok(())
    }

    pub fn with_overrides(mut self, debug: bool) -> Self {
        if debug {
            self.logging.debug = true;
        }
        self
    }
}
