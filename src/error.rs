//! Error types for U-Net training

use thiserror::Error;

/// Main error type for training operations
#[derive(Error, Debug)]
pub enum Error {
    /// Invalid combination of run parameters
    #[error("Configuration error: {0}")]
    Config(String),

    /// Checkpoint has the wrong extension or contents of the wrong shape
    #[error("Format error: {0}")]
    Format(String),

    /// Checkpoint file does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Prediction and target tensors disagree in shape
    #[error("Shape mismatch: predictions {actual:?} vs targets {expected:?}")]
    ShapeMismatch {
        /// Target shape
        expected: Vec<usize>,
        /// Prediction shape
        actual: Vec<usize>,
    },

    /// Tensor operation error
    #[error("Tensor operation error: {0}")]
    Tensor(#[from] candle_core::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// CSV export error
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// Layered settings could not be read
    #[error("Settings error: {0}")]
    Settings(#[from] config::ConfigError),

    /// Chart rendering error
    #[error("Plot error: {0}")]
    Plot(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),

    /// Other errors
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result type alias for training operations
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a checkpoint format error
    pub fn format(msg: impl Into<String>) -> Self {
        Self::Format(msg.into())
    }

    /// Create a not-found error
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    /// Create a shape mismatch error from two dimension lists
    pub fn shape_mismatch(expected: &[usize], actual: &[usize]) -> Self {
        Self::ShapeMismatch {
            expected: expected.to_vec(),
            actual: actual.to_vec(),
        }
    }

    /// Create a plotting error
    pub fn plot(msg: impl Into<String>) -> Self {
        Self::Plot(msg.into())
    }

    /// Create an invalid input error
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }
}
