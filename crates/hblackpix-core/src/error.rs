//! Error types for the HBLACKPIX client infrastructure.
//!
//! Infrastructure failures (storage, metrics) are mostly logged and swallowed by
//! the services themselves; the variants here are what escapes to callers.

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for the core library.
#[derive(Debug, Error)]
pub enum CoreError {
    // Storage errors
    #[error("Storage quota exceeded in '{namespace}': need {needed} bytes, {available} available")]
    QuotaExceeded {
        namespace: String,
        needed: u64,
        available: u64,
    },

    #[error("Database error: {message}")]
    Database {
        message: String,
        #[source]
        source: Option<rusqlite::Error>,
    },

    #[error("IO error at {path:?}: {message}")]
    Io {
        message: String,
        path: Option<PathBuf>,
        #[source]
        source: Option<std::io::Error>,
    },

    // Serialization errors
    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    // Cache errors
    #[error("Fetch for cache key '{key}' failed: {message}")]
    Fetch { key: String, message: String },

    // Realtime errors
    #[error("Realtime channel '{channel}' failed: {message}")]
    Channel { channel: String, message: String },

    #[error("Invalid row filter '{0}', expected column=eq.value")]
    InvalidFilter(String),

    // Offline replay errors
    #[error("No handler registered for offline action type '{action_type}'")]
    HandlerMissing { action_type: String },

    #[error("Offline action handler failed: {message}")]
    Handler { message: String },

    // Configuration errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Validation error for {field}: {message}")]
    Validation { field: String, message: String },
}

/// Result type alias for core operations.
pub type Result<T> = std::result::Result<T, CoreError>;

impl From<std::io::Error> for CoreError {
    fn from(err: std::io::Error) -> Self {
        CoreError::Io {
            message: err.to_string(),
            path: None,
            source: Some(err),
        }
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::Json {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<rusqlite::Error> for CoreError {
    fn from(err: rusqlite::Error) -> Self {
        CoreError::Database {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl CoreError {
    /// Create an IO error with path context.
    pub fn io_with_path(err: std::io::Error, path: impl Into<PathBuf>) -> Self {
        CoreError::Io {
            message: err.to_string(),
            path: Some(path.into()),
            source: Some(err),
        }
    }

    /// Convenience constructor for offline action handlers.
    pub fn handler(message: impl Into<String>) -> Self {
        CoreError::Handler {
            message: message.into(),
        }
    }
}
