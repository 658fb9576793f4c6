//! Error types for metaopt-rs.
//!
//! Every failure in setup or inside a training iteration is surfaced as a
//! [`MetaOptError`] and propagated to the caller. Nothing is retried.
//!
//! # Example
//!
//! ```rust
//! use metaopt_rs::{MetaOptConfig, MetaOptError};
//!
//! match MetaOptConfig::from_preset("omniglot") {
//!     Ok(_) => println!("Loaded config"),
//!     Err(MetaOptError::Config(msg)) => eprintln!("Configuration error: {msg}"),
//!     Err(e) => eprintln!("Other error: {e}"),
//! }
//! ```

use thiserror::Error;

/// Result type alias for metaopt-rs operations.
pub type Result<T> = std::result::Result<T, MetaOptError>;

/// Errors that can occur in metaopt-rs.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum MetaOptError {
    /// Configuration error (unknown selector, invalid way, malformed schedule).
    #[error("configuration error: {0}")]
    Config(String),

    /// Invalid configuration file.
    #[error("invalid config file: {0}")]
    ConfigParse(#[from] serde_yaml::Error),

    /// Precomputed artifact missing or malformed.
    #[error("artifact error: {0}")]
    Artifact(String),

    /// Dataset error.
    #[error("dataset error: {0}")]
    Dataset(String),

    /// Checkpoint error.
    #[error("checkpoint error: {0}")]
    Checkpoint(String),

    /// Tensor shape does not match what the operation expects.
    #[error("shape mismatch: expected {expected}, got {got}")]
    ShapeMismatch {
        /// Expected shape description
        expected: String,
        /// Actual shape description
        got: String,
    },

    /// Training error.
    #[error("training error: {0}")]
    Training(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Candle error.
    #[error("candle error: {0}")]
    Candle(#[from] candle_core::Error),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// Progress bar template error.
    #[error("template error: {0}")]
    Template(String),
}

impl MetaOptError {
    /// Create a configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create an artifact error.
    pub fn artifact(msg: impl Into<String>) -> Self {
        Self::Artifact(msg.into())
    }

    /// Create a shape mismatch error.
    pub fn shape_mismatch(expected: impl Into<String>, got: impl Into<String>) -> Self {
        Self::ShapeMismatch {
            expected: expected.into(),
            got: got.into(),
        }
    }
}

impl From<indicatif::style::TemplateError> for MetaOptError {
    fn from(err: indicatif::style::TemplateError) -> Self {
        MetaOptError::Template(err.to_string())
    }
}
