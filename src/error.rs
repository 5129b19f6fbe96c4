//! Error types for seedbed contexts and modules.

use std::fmt;
use std::sync::Arc;

use thiserror::Error;

/// One dependency that failed to settle or become ready.
#[derive(Debug, Clone)]
pub struct DependencyFailure {
    /// Display name of the dependency module
    pub module: String,
    /// Why it failed
    pub reason: ContextError,
}

impl fmt::Display for DependencyFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.module, self.reason)
    }
}

/// Errors raised by contexts, registries and the module loader.
///
/// The type is `Clone` because the same failure is delivered to every
/// observer of a lease or a status stream.
#[derive(Debug, Clone, Error)]
pub enum ContextError {
    #[error("No value for key: {key}")]
    MissingValue { key: String },

    #[error("Failed to load {} module dependencies: {}", .0.len(), join_failures(.0))]
    DependencyLoad(Vec<DependencyFailure>),

    #[error("Setup of {module} failed: {reason}")]
    SetupFailed {
        module: String,
        reason: Arc<anyhow::Error>,
    },

    #[error("Initializer of {module} failed: {reason}")]
    InitFailed {
        module: String,
        reason: Arc<anyhow::Error>,
    },

    #[error("Initializer chain of {module} is closed")]
    InitChainDrained { module: String },

    #[error("{module} unloaded")]
    ModuleUnloaded { module: String },

    #[error("Context destroyed")]
    ContextDestroyed,

    #[error("Cancelled")]
    Cancelled,

    #[error("{module} did not become {phase} in time")]
    Timeout { module: String, phase: &'static str },

    #[error("Configuration error: {0}")]
    Config(String),
}

impl ContextError {
    pub(crate) fn missing(key: impl fmt::Display) -> Self {
        ContextError::MissingValue {
            key: key.to_string(),
        }
    }

    pub(crate) fn setup_failed(module: impl fmt::Display, reason: anyhow::Error) -> Self {
        ContextError::SetupFailed {
            module: module.to_string(),
            reason: Arc::new(reason),
        }
    }

    pub(crate) fn init_failed(module: impl fmt::Display, reason: anyhow::Error) -> Self {
        ContextError::InitFailed {
            module: module.to_string(),
            reason: Arc::new(reason),
        }
    }

    /// Failures carried by a dependency-load error, empty for other variants.
    pub fn dependency_failures(&self) -> &[DependencyFailure] {
        match self {
            ContextError::DependencyLoad(failures) => failures,
            _ => &[],
        }
    }
}

fn join_failures(failures: &[DependencyFailure]) -> String {
    failures
        .iter()
        .map(|failure| failure.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

impl From<config::ConfigError> for ContextError {
    fn from(err: config::ConfigError) -> Self {
        ContextError::Config(err.to_string())
    }
}
