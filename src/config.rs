//! Experiment configuration
//!
//! Configuration is a tree of plain serde structs. Every field has a default,
//! so a config file only needs to name what it changes. Files are layered with
//! `EPOCHAL__`-prefixed environment variables through the `config` crate.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

/// Separator used by [`flatten_config`]
pub const KEY_SEPARATOR: &str = ".";

/// Environment variable prefix for configuration overrides
pub const ENV_PREFIX: &str = "EPOCHAL";

/// Main experiment configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExperimentConfig {
    /// Experiment name, used as tracker project run name
    pub name: String,

    /// Experiment directory; checkpoints and archives are written here when set
    pub dir: Option<PathBuf>,

    /// Number of training epochs
    pub epochs: usize,

    /// Per-role iteration caps
    pub max_iters: MaxIters,

    /// Debug truncation settings
    pub debug: DebugConfig,

    /// Number of steps gradients are accumulated over before an optimizer step
    pub gradient_accumulation_steps: usize,

    /// Maximum number of checkpoint directories kept on disk
    pub checkpoint_total_limit: Option<usize>,

    /// Progress reporting settings
    pub progress: ProgressConfig,

    /// Metric sink settings
    pub tracking: TrackingConfig,

    /// Logging settings
    pub logging: LoggingConfig,

    /// Free-form experiment parameters (model, optimizer, data settings)
    pub params: serde_json::Map<String, Value>,
}

/// Iteration caps for the two loop roles
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MaxIters {
    /// Cap on iterations per training epoch
    pub train: Option<usize>,

    /// Cap on iterations per evaluation pass
    pub eval: Option<usize>,
}

/// Debug truncation configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DebugConfig {
    /// Enable epoch truncation
    pub enabled: bool,

    /// Iterations after which every epoch is ended
    pub num_iters: usize,
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            num_iters: 2000,
        }
    }
}

/// Progress bar configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProgressConfig {
    /// Render progress bars
    pub enabled: bool,

    /// Metric names shown per role; `loss` plus attached metrics when unset
    pub metric_names: BTreeMap<String, Vec<String>>,
}

impl Default for ProgressConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            metric_names: BTreeMap::new(),
        }
    }
}

/// Metric sink configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackingConfig {
    /// Append epoch metrics as JSON lines to this file
    pub jsonl: Option<PathBuf>,
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive when `RUST_LOG` is unset
    pub level: String,

    /// Emit JSON log lines
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

impl Default for ExperimentConfig {
    fn default() -> Self {
        Self {
            name: "exp".to_string(),
            dir: None,
            epochs: 1,
            max_iters: MaxIters::default(),
            debug: DebugConfig::default(),
            gradient_accumulation_steps: 1,
            checkpoint_total_limit: None,
            progress: ProgressConfig::default(),
            tracking: TrackingConfig::default(),
            logging: LoggingConfig::default(),
            params: serde_json::Map::new(),
        }
    }
}

impl ExperimentConfig {
    /// Load configuration from a file, layered with environment overrides
    ///
    /// The file format follows the extension (`.yaml`, `.json`, `.toml`).
    /// Nested keys are overridden with `EPOCHAL__SECTION__KEY=value`.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.is_file() {
            return Err(Error::config(format!(
                "configuration file not found: {}",
                path.display()
            )));
        }
        let config: Self = config::Config::builder()
            .add_source(config::File::from(path))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a YAML document without environment layering
    pub fn from_yaml_str(content: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::config("Experiment name must not be empty"));
        }
        if self.gradient_accumulation_steps == 0 {
            return Err(Error::config("gradient_accumulation_steps must be >= 1"));
        }
        if self.debug.num_iters == 0 {
            return Err(Error::config("debug.num_iters must be >= 1"));
        }
        if self.checkpoint_total_limit == Some(0) {
            return Err(Error::config("checkpoint_total_limit must be >= 1 when set"));
        }
        Ok(())
    }

    /// Flattened view used for tracker hyperparameter logging
    pub fn flattened(&self) -> Result<BTreeMap<String, Value>> {
        Ok(flatten_config(&serde_json::to_value(self)?))
    }
}

/// Flatten nested maps into `.`-joined keys
///
/// Non-map values (including arrays) are leaves. A non-map root is stored
/// under the empty key.
pub fn flatten_config(config: &Value) -> BTreeMap<String, Value> {
    fn recurse(value: &Value, path: &mut Vec<String>, out: &mut BTreeMap<String, Value>) {
        match value {
            Value::Object(map) if !map.is_empty() => {
                for (key, value) in map {
                    path.push(key.clone());
                    recurse(value, path, out);
                    path.pop();
                }
            }
            other => {
                out.insert(path.join(KEY_SEPARATOR), other.clone());
            }
        }
    }

    let mut flat = BTreeMap::new();
    recurse(config, &mut Vec::new(), &mut flat);
    flat
}
