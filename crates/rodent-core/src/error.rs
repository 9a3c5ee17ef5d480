//! Error types for rodent

use std::collections::BTreeMap;
use thiserror::Error;

/// Structured metadata attached to an error (schedule index, dataset, ...)
pub type Metadata = BTreeMap<String, String>;

/// Main error type for rodent operations
#[derive(Error, Debug)]
pub enum Error {
    #[error("Validation error: {message}")]
    Validation { message: String, metadata: Metadata },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Scheduler error: {0}")]
    Scheduler(String),

    #[error("Gateway error: {operation} on {dataset}: {message}")]
    Gateway {
        operation: String,
        dataset: String,
        message: String,
    },

    #[error("Cancelled: {0}")]
    Cancelled(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Config format error: {0}")]
    ConfigFormat(#[from] serde_yaml::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create a validation error without metadata
    pub fn validation(msg: impl Into<String>) -> Self {
        Error::Validation {
            message: msg.into(),
            metadata: Metadata::new(),
        }
    }

    /// Create a validation error carrying structured metadata
    pub fn validation_with(
        msg: impl Into<String>,
        metadata: impl IntoIterator<Item = (String, String)>,
    ) -> Self {
        Error::Validation {
            message: msg.into(),
            metadata: metadata.into_iter().collect(),
        }
    }

    /// Create a not found error
    pub fn not_found(msg: impl Into<String>) -> Self {
        Error::NotFound(msg.into())
    }

    /// Create a persistence error
    pub fn persistence(msg: impl Into<String>) -> Self {
        Error::Persistence(msg.into())
    }

    /// Create a scheduler error
    pub fn scheduler(msg: impl Into<String>) -> Self {
        Error::Scheduler(msg.into())
    }

    /// Create a gateway error tagged with the failed operation and dataset
    pub fn gateway(
        operation: impl Into<String>,
        dataset: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Error::Gateway {
            operation: operation.into(),
            dataset: dataset.into(),
            message: msg.into(),
        }
    }

    /// Create a cancelled error
    pub fn cancelled(msg: impl Into<String>) -> Self {
        Error::Cancelled(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Error::Internal(msg.into())
    }

    /// Stable machine-readable code for the error kind
    pub fn code(&self) -> &'static str {
        match self {
            Error::Validation { .. } => "VALIDATION",
            Error::NotFound(_) => "NOT_FOUND",
            Error::Persistence(_) => "PERSISTENCE",
            Error::Scheduler(_) => "SCHEDULER",
            Error::Gateway { .. } => "GATEWAY",
            Error::Cancelled(_) => "CANCELLED",
            Error::Serialization(_) => "SERIALIZATION",
            Error::ConfigFormat(_) => "CONFIG_FORMAT",
            Error::Io(_) => "IO",
            Error::Internal(_) => "INTERNAL",
        }
    }

    /// Structured metadata carried by the error, if any
    pub fn metadata(&self) -> Metadata {
        match self {
            Error::Validation { metadata, .. } => metadata.clone(),
            Error::Gateway {
                operation, dataset, ..
            } => Metadata::from([
                ("operation".to_string(), operation.clone()),
                ("dataset".to_string(), dataset.clone()),
            ]),
            _ => Metadata::new(),
        }
    }
}

impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Error::Internal(err.to_string())
    }
}
