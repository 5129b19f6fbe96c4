//! Configuration System
//!
//! Layered configuration: built-in defaults, then an optional TOML file, then `SEEDBED_*`
//! environment variables (nested keys separated by `__`, e.g.
//! `SEEDBED_MODULES__SETTLE_TIMEOUT_MS=500`).

use std::path::Path;

use config::builder::DefaultState;
use config::{Config, ConfigBuilder, ConfigError, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::ContextError;
use crate::logging::LoggingConfig;

/// Root configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SeedbedConfig {
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Module loading behaviour of registries built from this configuration
    #[serde(default)]
    pub modules: ModuleSettings,
}

/// Module loading settings, shared by a registry and every context created from it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleSettings {
    /// Fail a wait for a module to settle after this many milliseconds
    #[serde(default)]
    pub settle_timeout_ms: Option<u64>,

    /// Fail a wait for a module to become ready after this many milliseconds
    #[serde(default)]
    pub ready_timeout_ms: Option<u64>,

    /// Emit a debug event for every module status change
    #[serde(default)]
    pub trace_status: bool,
}

/// Configuration validation errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    Logging(String),
    Modules(String),
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValidationError::Logging(msg) => write!(f, "Logging: {}", msg),
            ValidationError::Modules(msg) => write!(f, "Modules: {}", msg),
        }
    }
}

impl std::error::Error for ValidationError {}

impl ModuleSettings {
    pub fn validate(&self) -> Result<(), String> {
        if self.settle_timeout_ms == Some(0) {
            return Err("settle_timeout_ms must be greater than zero".to_string());
        }
        if self.ready_timeout_ms == Some(0) {
            return Err("ready_timeout_ms must be greater than zero".to_string());
        }
        Ok(())
    }
}

impl SeedbedConfig {
    /// Validate the entire configuration
    pub fn validate(&self) -> Result<(), Vec<ValidationError>> {
        let mut errors = Vec::new();

        if let Err(e) = self.logging.validate() {
            errors.push(ValidationError::Logging(e));
        }
        if let Err(e) = self.modules.validate() {
            errors.push(ValidationError::Modules(e));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// Loads [`SeedbedConfig`] from its layered sources.
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load and validate configuration.
    ///
    /// `path`, when given, must point at an existing TOML file.
    pub fn load(path: Option<&Path>) -> Result<SeedbedConfig, ContextError> {
        let mut builder = builder_with_defaults()?;
        if let Some(path) = path {
            debug!(config_path = %path.display(), "loading configuration file");
            builder = builder.add_source(File::from(path).format(FileFormat::Toml).required(true));
        }
        builder = builder.add_source(
            Environment::with_prefix("SEEDBED")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config: SeedbedConfig = builder.build()?.try_deserialize()?;
        config.validate().map_err(|errors| {
            let error_msgs: Vec<String> = errors.iter().map(|e| e.to_string()).collect();
            ContextError::Config(format!(
                "Configuration validation failed:\n{}",
                error_msgs.join("\n")
            ))
        })?;
        Ok(config)
    }
}

fn builder_with_defaults() -> Result<ConfigBuilder<DefaultState>, ConfigError> {
    let logging = LoggingConfig::default();
    Config::builder()
        .set_default("logging.level", logging.level)?
        .set_default("logging.format", logging.format)?
        .set_default("logging.output", logging.output)?
        .set_default("logging.color", logging.color)?
        .set_default("modules.trace_status", false)
}
