//! Error Handling Module
//!
//! Defines the error type for the patch-contrastive SSL library.
//! Uses thiserror for ergonomic error definitions.

use std::path::PathBuf;

use thiserror::Error;

/// Main error type for segmentation SSL operations
#[derive(Error, Debug)]
pub enum SslError {
    /// Error loading or decoding an image or mask file
    #[error("Failed to load image at '{0}': {1}")]
    ImageLoad(PathBuf, String),

    /// Image processing error that is not tied to a file
    #[error("Image processing error: {0}")]
    Image(String),

    /// Malformed split file or inconsistent dataset
    #[error("Dataset error: {0}")]
    Dataset(String),

    /// Model construction, EMA or checkpoint errors
    #[error("Model error: {0}")]
    Model(String),

    /// Error raised inside a training stage
    #[error("Training error: {0}")]
    Training(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Tensor data could not be converted to host values
    #[error("Tensor data error: {0}")]
    TensorData(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl From<image::ImageError> for SslError {
    fn from(err: image::ImageError) -> Self {
        SslError::Image(err.to_string())
    }
}

impl From<serde_json::Error> for SslError {
    fn from(err: serde_json::Error) -> Self {
        SslError::Serialization(err.to_string())
    }
}

impl From<toml::de::Error> for SslError {
    fn from(err: toml::de::Error) -> Self {
        SslError::Config(err.to_string())
    }
}

impl From<toml::ser::Error> for SslError {
    fn from(err: toml::ser::Error) -> Self {
        SslError::Serialization(err.to_string())
    }
}

/// Convenience Result type for segmentation SSL operations
pub type Result<T> = std::result::Result<T, SslError>;
