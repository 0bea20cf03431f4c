//! # Error Types
//!
//! This module defines error types used throughout the diploma engine.
//!
//! Nothing here is fatal to the process: field-level errors are collected
//! into reports and the offending field renders empty.

use std::fmt;

use thiserror::Error;

use crate::model::FieldKey;

/// Main error type for diploma operations
#[derive(Debug, Error)]
pub enum DiplomaError {
    /// Unknown field type or malformed template data
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Payload is neither a decodable image nor a PDF
    #[error("Decode error: {0}")]
    Decode(String),

    /// Template load/save failure
    #[error("Transport error: {0}")]
    Transport(String),

    /// Raster extraction or encoding error
    #[error("Image error: {0}")]
    Image(String),

    /// A recipient export failed
    #[error("Export error: {0}")]
    Export(String),

    /// I/O error wrapper
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error wrapper
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// An error attributed to a single field of a template.
#[derive(Debug)]
pub struct FieldError {
    pub key: FieldKey,
    pub error: DiplomaError,
}

impl FieldError {
    pub fn new(key: FieldKey, error: DiplomaError) -> Self {
        Self { key, error }
    }
}

impl fmt::Display for FieldError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.key, self.error)
    }
}

impl From<reqwest::Error> for DiplomaError {
    fn from(e: reqwest::Error) -> Self {
        DiplomaError::Transport(e.to_string())
    }
}

impl From<image::ImageError> for DiplomaError {
    fn from(e: image::ImageError) -> Self {
        DiplomaError::Image(e.to_string())
    }
}
