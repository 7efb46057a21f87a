//! Error types for the fitblocks-core crate.

use thiserror::Error;

/// Top-level error type for training orchestration and model-building helpers.
#[derive(Debug, Error)]
pub enum FitError {
    /// Invalid run setup: conflicting stopping criteria, bad frequencies, etc.
    /// Raised before any training step runs.
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Duplicate key: {0}")]
    DuplicateKey(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Unrecognized kind: {0}")]
    UnrecognizedKind(String),

    #[error("Type mismatch: {0}")]
    TypeMismatch(String),

    #[error("Shape error: {0}")]
    Shape(String),

    /// A stored snapshot does not match the model it is restored into.
    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    #[error("Training error: {0}")]
    Training(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl FitError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn duplicate_key(msg: impl Into<String>) -> Self {
        Self::DuplicateKey(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn unrecognized_kind(msg: impl Into<String>) -> Self {
        Self::UnrecognizedKind(msg.into())
    }

    pub fn type_mismatch(msg: impl Into<String>) -> Self {
        Self::TypeMismatch(msg.into())
    }

    pub fn shape(msg: impl Into<String>) -> Self {
        Self::Shape(msg.into())
    }

    pub fn checkpoint(msg: impl Into<String>) -> Self {
        Self::Checkpoint(msg.into())
    }

    pub fn training(msg: impl Into<String>) -> Self {
        Self::Training(msg.into())
    }

    /// Whether this error belongs to the configuration class (fatal before training).
    pub fn is_config(&self) -> bool {
        matches!(self, Self::Config(_) | Self::DuplicateKey(_))
    }
}
