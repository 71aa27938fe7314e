//! Log Collector Error System
//!
//! Error handling for ingestion, storage and aggregation. Errors are split into
//! a transport class (source backends), a storage class (retryable) and
//! record-level classes that are recovered locally by the caller.

use thiserror::Error;

/// Result type for all collector operations
pub type CollectorResult<T> = Result<T, CollectorError>;

/// Main error type for collector operations
#[derive(Error, Debug)]
pub enum CollectorError {
    /// Source backend errors (missing directory, unreachable bucket, bad credentials)
    #[error("Source backend '{backend}' failed: {reason}")]
    Source {
        /// Backend that failed
        backend: String,
        /// Reason for failure
        reason: String,
    },

    /// Configuration errors
    #[error("Configuration error: {message}")]
    Configuration {
        /// Error message
        message: String,
    },

    /// Database operation errors
    #[error("Database operation failed: {operation} - {reason}")]
    Database {
        /// Operation that failed
        operation: String,
        /// Reason for failure
        reason: String,
    },

    /// Pipeline operation errors
    #[error("Pipeline operation failed: {stage} - {reason}")]
    Pipeline {
        /// Pipeline stage that failed
        stage: String,
        /// Reason for failure
        reason: String,
    },

    /// Validation errors
    #[error("Validation failed for field '{field}': {reason}")]
    Validation {
        /// Field that failed validation
        field: String,
        /// Reason for validation failure
        reason: String,
    },

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Object store errors
    #[error("Object store error: {0}")]
    ObjectStore(#[from] object_store::Error),

    /// Generic internal error (use sparingly)
    #[error("Internal error: {message}")]
    Internal {
        /// Error message
        message: String,
    },
}

impl CollectorError {
    /// Create source backend error
    pub fn source(backend: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Source {
            backend: backend.into(),
            reason: reason.into(),
        }
    }

    /// Create configuration error
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create database error
    pub fn database(operation: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Database {
            operation: operation.into(),
            reason: reason.into(),
        }
    }

    /// Create pipeline error
    pub fn pipeline(stage: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Pipeline {
            stage: stage.into(),
            reason: reason.into(),
        }
    }

    /// Create validation error
    pub fn validation(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Create internal error (use sparingly)
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Check if error belongs to the transport class
    ///
    /// Transport errors are fatal to the current run and are surfaced to the
    /// caller; retrying them is the scheduler's job.
    #[must_use]
    pub const fn is_transport(&self) -> bool {
        matches!(self, Self::Source { .. } | Self::ObjectStore(_))
    }

    /// Check if error is retryable
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Source { .. } => false,
            Self::Configuration { .. } => false,
            Self::Validation { .. } => false,
            Self::Database { .. } => true,
            Self::Pipeline { .. } => true,
            Self::Serialization(_) => false,
            Self::Io(_) => true,
            Self::ObjectStore(_) => false,
            Self::Internal { .. } => false,
        }
    }
}

impl From<config::ConfigError> for CollectorError {
    fn from(e: config::ConfigError) -> Self {
        Self::configuration(e.to_string())
    }
}
