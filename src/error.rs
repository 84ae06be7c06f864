//! Error handling module for gradestack
//!
//! Provides centralized error handling with proper error types using thiserror.
//! All errors in the library should use these types for consistency.

#![allow(dead_code)] // Error variants and helpers are available for future use

use thiserror::Error;

/// Main error type for gradestack
#[derive(Error, Debug)]
pub enum ProvisionError {
    /// IO errors (file operations, downloads written to disk, etc.)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Manifest errors (loading, parsing, validation)
    #[error("Manifest error: {0}")]
    Manifest(String),

    /// Command execution errors (spawn failure, non-zero exit)
    #[error("Command execution failed: {0}")]
    Command(String),

    /// Validation errors (manifest values, user input)
    #[error("Validation error: {0}")]
    Validation(String),

    /// Machine probe errors (architecture, OS family, privileges)
    #[error("Probe error: {0}")]
    Probe(String),

    /// The machine reports an architecture no installer asset exists for
    #[error("Unsupported machine architecture: {0}")]
    UnsupportedArchitecture(String),

    /// Download errors (unreachable URL, short read, bad status)
    #[error("Download error: {0}")]
    Download(String),

    /// Stage machine transition errors
    #[error("Stage transition error: {0}")]
    StageTransition(String),

    /// Environment manager errors (installer, env create, shell init)
    #[error("Environment manager error: {0}")]
    EnvManager(String),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// General errors (catch-all for edge cases)
    #[error("{0}")]
    General(String),
}

/// Result type alias for provisioning operations
pub type Result<T> = std::result::Result<T, ProvisionError>;

// Convenient error constructors
impl ProvisionError {
    /// Create a manifest error
    pub fn manifest(msg: impl Into<String>) -> Self {
        Self::Manifest(msg.into())
    }

    /// Create a command execution error
    pub fn command(msg: impl Into<String>) -> Self {
        Self::Command(msg.into())
    }

    /// Create a validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a probe error
    pub fn probe(msg: impl Into<String>) -> Self {
        Self::Probe(msg.into())
    }

    /// Create a download error
    pub fn download(msg: impl Into<String>) -> Self {
        Self::Download(msg.into())
    }

    /// Create a stage transition error
    pub fn stage_transition(msg: impl Into<String>) -> Self {
        Self::StageTransition(msg.into())
    }

    /// Create an environment manager error
    pub fn env_manager(msg: impl Into<String>) -> Self {
        Self::EnvManager(msg.into())
    }

    /// Create a general error
    pub fn general(msg: impl Into<String>) -> Self {
        Self::General(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ProvisionError::manifest("empty package list");
        assert_eq!(err.to_string(), "Manifest error: empty package list");

        let err = ProvisionError::validation("converter url must be http(s)");
        assert_eq!(
            err.to_string(),
            "Validation error: converter url must be http(s)"
        );
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: ProvisionError = io_err.into();
        assert!(matches!(err, ProvisionError::Io(_)));
    }

    #[test]
    fn test_error_constructors() {
        let err = ProvisionError::command("apt-get exited with status 100");
        assert!(matches!(err, ProvisionError::Command(_)));

        let err = ProvisionError::download("connection refused");
        assert!(matches!(err, ProvisionError::Download(_)));
    }

    #[test]
    fn test_unsupported_architecture_display() {
        let err = ProvisionError::UnsupportedArchitecture("riscv64".to_string());
        assert_eq!(err.to_string(), "Unsupported machine architecture: riscv64");
    }
}
