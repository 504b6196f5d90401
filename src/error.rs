//! Crate-level error type.

use std::io;

use thiserror::Error;

use crate::config::ConfigError;

/// Errors that abort planning or orchestration.
///
/// Test failures are never reported through this type; they flow through
/// [`crate::fail_fast::FailureEvent`] instead.
#[derive(Error, Debug)]
pub enum OrchestratorError {
    /// The category dependency graph contains a cycle.
    #[error("Circular dependency detected among categories: {}", .0.join(", "))]
    CircularDependency(Vec<String>),

    /// A category was referenced that is not registered.
    #[error("Unknown category: {0}")]
    UnknownCategory(String),

    /// Invalid or unreadable configuration.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// IO error during file operations.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type for orchestration operations.
pub type Result<T> = std::result::Result<T, OrchestratorError>;

/// A string did not name any variant of a configuration enum.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid {kind} '{value}' (expected one of: {expected})")]
pub struct ParseEnumError {
    pub kind: &'static str,
    pub value: String,
    pub expected: &'static str,
}

impl ParseEnumError {
    pub(crate) fn new(kind: &'static str, value: &str, expected: &'static str) -> Self {
        Self {
            kind,
            value: value.to_string(),
            expected,
        }
    }
}
