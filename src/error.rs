//! Custom error types for the amira-asr-trainer.
//!
//! This module provides a centralized error handling system using the `thiserror` crate
//! to define structured, typed errors with clear messages and proper error conversion.
//! Every failure in the training run is fatal; the variants exist so the operator sees
//! which stage broke, not to drive recovery.

use std::io;
use thiserror::Error;

/// Primary error type for the trainer, covering all possible error cases.
#[derive(Debug, Error)]
pub enum AppError {
    /// Errors from invalid configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Missing or malformed vocabulary file.
    #[error("Vocabulary error: {0}")]
    Vocabulary(String),

    /// Missing or malformed manifest file.
    #[error("Manifest error: {0}")]
    Manifest(String),

    /// Errors related to audio loading and feature extraction.
    #[error("Audio processing error: {0}")]
    Audio(String),

    /// Malformed batches, length-sum mismatches and invalid references.
    #[error("Data error: {0}")]
    Data(String),

    /// Errors occurring inside the encoder, loss or decoder.
    #[error("Model error: {0}")]
    Model(String),

    /// Errors writing or reading checkpoints.
    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    /// Errors exporting metrics.
    #[error("Metrics error: {0}")]
    Metrics(String),

    /// Errors from the underlying IO system.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON serialization/deserialization errors.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// WAV decoding errors.
    #[error("WAV error: {0}")]
    Wav(#[from] hound::Error),

    /// Internal errors.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Convenience type alias for Results with AppError.
pub type Result<T> = std::result::Result<T, AppError>;

/// Extension trait for adding context to errors.
pub trait ErrorContext<T> {
    /// Add context to the error.
    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String;
}

impl<T, E> ErrorContext<T> for std::result::Result<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| AppError::Internal(format!("{}: {}", f(), e)))
    }
}
