//! Error types for registry operations

use thiserror::Error;

/// Errors that can occur during registry and routing operations
#[derive(Error, Debug)]
pub enum Error {
    /// No registered, starting or dormant variant can satisfy the request
    #[error("Service not found: {0}")]
    NotFound(String),

    /// A starting service did not register within the startup timeout
    #[error("Timed out waiting for service to start: {0}")]
    StartTimeout(String),

    /// Registration conflicts with an instance that is already present
    #[error("Conflicting registration: {0}")]
    Conflict(String),

    /// Launching a service process failed
    #[error("Failed to launch service: {0}")]
    Launch(String),

    /// Invalid configuration or service identity
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML parsing error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Result type for registry operations
pub type Result<T> = std::result::Result<T, Error>;
