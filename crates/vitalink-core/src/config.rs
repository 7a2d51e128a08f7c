//! File configuration.
//!
//! ```toml
//! devices = ["omron-evolv", "contour-next-one"]
//!
//! [session]
//! connect_timeout_ms = 10000
//! idle_timeout_ms = 60000   # 0 waits forever
//! event_capacity = 32
//!
//! [pipeline]
//! reading_buffer = 16
//! scan_timeout_ms = 0       # 0 scans until cancelled
//! ```

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use vitalink_types::{DeviceDescriptor, DeviceModel};

use crate::events::DEFAULT_EVENT_CAPACITY;
use crate::pipeline::{DEFAULT_READING_BUFFER, PipelineConfig};
use crate::session::{DEFAULT_IDLE_TIMEOUT, DEFAULT_STEP_TIMEOUT, MAX_EVENT_CAPACITY, SessionConfig};

/// Upper bound on any configured duration.
const MAX_TIMEOUT_MS: u64 = 10 * 60 * 1000;

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Session budgets.
    pub session: SessionSettings,
    /// Pipeline settings.
    pub pipeline: PipelineSettings,
    /// Catalog ids of the devices to read, e.g. `omron-evolv`.
    pub devices: Vec<String>,
}

impl Config {
    /// Load configuration from a file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| ConfigError::Read {
            path: path.as_ref().to_path_buf(),
            source: e,
        })?;
        Self::from_toml_str(&content).map_err(|e| ConfigError::Parse {
            path: path.as_ref().to_path_buf(),
            source: e,
        })
    }

    /// Parse configuration from TOML text.
    pub fn from_toml_str(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Save configuration to a file.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self).map_err(ConfigError::Serialize)?;

        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::Write {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }

        std::fs::write(path.as_ref(), content).map_err(|e| ConfigError::Write {
            path: path.as_ref().to_path_buf(),
            source: e,
        })
    }

    /// Validate the configuration and return every problem found.
    ///
    /// # Example
    ///
    /// ```
    /// use vitalink_core::Config;
    ///
    /// let config = Config::default();
    /// config.validate().expect("Default config should be valid");
    /// ```
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = Vec::new();
        errors.extend(self.session.validate());
        errors.extend(self.pipeline.validate());

        let mut seen = std::collections::HashSet::new();
        for (i, device) in self.devices.iter().enumerate() {
            let field = format!("devices[{}]", i);
            match DeviceModel::from_str(device) {
                Ok(model) => {
                    if !seen.insert(model) {
                        errors.push(ValidationError {
                            field,
                            message: format!("duplicate device '{}'", device),
                        });
                    }
                }
                Err(e) => errors.push(ValidationError {
                    field,
                    message: e.to_string(),
                }),
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Validation(errors))
        }
    }

    /// Load and validate configuration from a file.
    pub fn load_validated<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config = Self::load(path)?;
        config.validate()?;
        Ok(config)
    }

    /// Catalog entries for the configured devices. Unknown ids are skipped;
    /// [`validate`](Self::validate) reports them.
    pub fn descriptors(&self) -> Vec<&'static DeviceDescriptor> {
        self.devices
            .iter()
            .filter_map(|device| DeviceModel::from_str(device).ok())
            .map(DeviceModel::descriptor)
            .collect()
    }

    pub fn session_config(&self) -> SessionConfig {
        self.session.to_config()
    }

    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            session: self.session_config(),
            reading_buffer: self.pipeline.reading_buffer,
            scan_timeout: optional_ms(self.pipeline.scan_timeout_ms),
        }
    }
}

/// Session budgets in milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    pub connect_timeout_ms: u64,
    pub discovery_timeout_ms: u64,
    pub subscribe_timeout_ms: u64,
    pub disconnect_timeout_ms: u64,
    pub operation_timeout_ms: u64,
    /// `0` disables the idle timeout.
    pub idle_timeout_ms: u64,
    pub event_capacity: usize,
}

impl Default for SessionSettings {
    fn default() -> Self {
        let step = DEFAULT_STEP_TIMEOUT.as_millis() as u64;
        Self {
            connect_timeout_ms: step,
            discovery_timeout_ms: step,
            subscribe_timeout_ms: step,
            disconnect_timeout_ms: step,
            operation_timeout_ms: step,
            idle_timeout_ms: DEFAULT_IDLE_TIMEOUT.as_millis() as u64,
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

impl SessionSettings {
    /// Validate session settings.
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        let budgets = [
            ("connect_timeout_ms", self.connect_timeout_ms),
            ("discovery_timeout_ms", self.discovery_timeout_ms),
            ("subscribe_timeout_ms", self.subscribe_timeout_ms),
            ("disconnect_timeout_ms", self.disconnect_timeout_ms),
            ("operation_timeout_ms", self.operation_timeout_ms),
        ];
        for (name, value) in budgets {
            if value == 0 || value > MAX_TIMEOUT_MS {
                errors.push(ValidationError {
                    field: format!("session.{}", name),
                    message: format!("must be between 1 and {} ms, got {}", MAX_TIMEOUT_MS, value),
                });
            }
        }
        if self.idle_timeout_ms > MAX_TIMEOUT_MS {
            errors.push(ValidationError {
                field: "session.idle_timeout_ms".to_string(),
                message: format!("must be at most {} ms (0 disables)", MAX_TIMEOUT_MS),
            });
        }
        if self.event_capacity == 0 || self.event_capacity > MAX_EVENT_CAPACITY {
            errors.push(ValidationError {
                field: "session.event_capacity".to_string(),
                message: format!(
                    "must be between 1 and {}, got {}",
                    MAX_EVENT_CAPACITY, self.event_capacity
                ),
            });
        }

        errors
    }

    pub fn to_config(&self) -> SessionConfig {
        SessionConfig {
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            discovery_timeout: Duration::from_millis(self.discovery_timeout_ms),
            subscribe_timeout: Duration::from_millis(self.subscribe_timeout_ms),
            disconnect_timeout: Duration::from_millis(self.disconnect_timeout_ms),
            operation_timeout: Duration::from_millis(self.operation_timeout_ms),
            idle_timeout: optional_ms(self.idle_timeout_ms),
            event_capacity: self.event_capacity,
        }
    }
}

/// Pipeline settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineSettings {
    /// Readings buffered ahead of the consumer.
    pub reading_buffer: usize,
    /// Discovery deadline in milliseconds. `0` scans until cancelled.
    pub scan_timeout_ms: u64,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            reading_buffer: DEFAULT_READING_BUFFER,
            scan_timeout_ms: 0,
        }
    }
}

impl PipelineSettings {
    /// Validate pipeline settings.
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();
        if self.reading_buffer == 0 {
            errors.push(ValidationError {
                field: "pipeline.reading_buffer".to_string(),
                message: "must be > 0".to_string(),
            });
        }
        if self.scan_timeout_ms > MAX_TIMEOUT_MS {
            errors.push(ValidationError {
                field: "pipeline.scan_timeout_ms".to_string(),
                message: format!("must be at most {} ms (0 disables)", MAX_TIMEOUT_MS),
            });
        }
        errors
    }
}

fn optional_ms(ms: u64) -> Option<Duration> {
    (ms > 0).then(|| Duration::from_millis(ms))
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("Failed to serialize config: {0}")]
    Serialize(toml::ser::Error),
    #[error("Failed to write config file {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Configuration validation failed:\n{}", format_validation_errors(.0))]
    Validation(Vec<ValidationError>),
}

/// A single validation error with context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    /// The field path (e.g., `session.event_capacity` or `devices[0]`).
    pub field: String,
    /// Description of the validation failure.
    pub message: String,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

fn format_validation_errors(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(|e| format!("  - {}", e))
        .collect::<Vec<_>>()
        .join("\n")
}
