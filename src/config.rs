//! Configuration module for sigbridge.

use serde::Deserialize;
use std::path::Path;

use crate::script::ResourceLimits;
use crate::signal::{DispatchOptions, WritebackPolicy};
use crate::{BridgeError, Result};

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Optional log file, written in addition to stdout.
    #[serde(default)]
    pub file: Option<String>,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: None,
        }
    }
}

/// Signal bridge configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BridgeConfig {
    /// Host priority for bindings made without one.
    #[serde(default)]
    pub default_priority: i32,
    /// Handling of non-integer returns for integer reference arguments.
    #[serde(default)]
    pub reference_writeback: WritebackPolicy,
}

impl BridgeConfig {
    pub fn dispatch_options(&self) -> DispatchOptions {
        DispatchOptions {
            default_priority: self.default_priority,
            writeback: self.reference_writeback,
        }
    }
}

/// Script loading configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ScriptsConfig {
    /// Directory scripts are loaded from.
    #[serde(default = "default_scripts_path")]
    pub path: String,
    /// Script files loaded at startup, relative to `path`.
    #[serde(default)]
    pub autoload: Vec<String>,
    /// Instruction budget for running a script's main chunk (0 = unlimited).
    #[serde(default = "default_max_instructions")]
    pub max_instructions: u64,
    /// Memory limit per script in megabytes (0 = unlimited).
    #[serde(default = "default_max_memory_mb")]
    pub max_memory_mb: usize,
}

fn default_scripts_path() -> String {
    "scripts".to_string()
}

fn default_max_instructions() -> u64 {
    1_000_000
}

fn default_max_memory_mb() -> usize {
    10
}

impl Default for ScriptsConfig {
    fn default() -> Self {
        Self {
            path: default_scripts_path(),
            autoload: Vec::new(),
            max_instructions: default_max_instructions(),
            max_memory_mb: default_max_memory_mb(),
        }
    }
}

impl ScriptsConfig {
    pub fn resource_limits(&self) -> ResourceLimits {
        ResourceLimits {
            max_instructions: self.max_instructions,
            max_memory: self.max_memory_mb * 1024 * 1024,
        }
    }
}

/// Main configuration structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Signal bridge configuration.
    #[serde(default)]
    pub bridge: BridgeConfig,
    /// Script configuration.
    #[serde(default)]
    pub scripts: ScriptsConfig,
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(BridgeError::Io)?;
        Self::parse(&content)
    }

    /// Load configuration from a TOML file and apply environment variable overrides.
    pub fn load_with_env<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut config = Self::load(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(s: &str) -> Result<Self> {
        toml::from_str(s).map_err(|e| BridgeError::Config(format!("config parse error: {e}")))
    }

    /// Apply environment variable overrides to the configuration.
    ///
    /// Supported environment variables:
    /// - `SIGBRIDGE_SCRIPTS_PATH`: Override the script directory
    pub fn apply_env_overrides(&mut self) {
        if let Ok(path) = std::env::var("SIGBRIDGE_SCRIPTS_PATH") {
            if !path.is_empty() {
                self.scripts.path = path;
            }
        }
    }

    /// Validate the configuration.
    ///
    /// Returns an error if:
    /// - `scripts.path` is empty
    /// - an autoload entry is empty
    pub fn validate(&self) -> Result<()> {
        if self.scripts.path.trim().is_empty() {
            return Err(BridgeError::Config("scripts.path must not be empty".to_string()));
        }
        if self.scripts.autoload.iter().any(|entry| entry.trim().is_empty()) {
            return Err(BridgeError::Config(
                "scripts.autoload contains an empty entry".to_string(),
            ));
        }
        Ok(())
    }
}
