//! Unified error handling for the tracker crate
//!
//! Every subsystem has its own `thiserror` enum. [`Error`] wraps them so the
//! binary and the tracker lifecycle can handle failures from any layer in one
//! place, while library callers keep using the domain-specific types.
//!
//! - [`ErrorCategory`] - classification used for log fields and retry decisions
//! - [`Error`] - unified error enum wrapping all domain-specific errors
//!
//! # Usage
//!
//! ```rust,ignore
//! use coc_tracker::error::{Error, ErrorCategory};
//!
//! fn handle_error(err: Error) {
//!     if err.is_recoverable() {
//!         tracing::warn!(category = %err.category(), "Retrying: {err}");
//!     } else {
//!         tracing::error!("Fatal error: {err}");
//!     }
//! }
//! ```

use std::fmt;
use std::io;
use thiserror::Error;

pub use crate::jobs::error::{JobError, ProviderFailure};
pub use crate::storage::StorageError;
pub use crate::tracker::client::ClientError;
pub use crate::tracker::keys::KeyPoolError;

/// Classification of errors for handling strategies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// HTTP and remote API failures
    Network,
    /// Key pool exhaustion or key file problems
    Keys,
    /// Database and migration failures
    Storage,
    /// Job payload and execution failures
    Job,
    /// Configuration and validation errors
    Config,
    /// Cooperative shutdown
    Cancelled,
    /// Other/unknown errors
    Other,
}

impl ErrorCategory {
    /// Short label used in structured logs
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Network => "network",
            Self::Keys => "keys",
            Self::Storage => "storage",
            Self::Job => "job",
            Self::Config => "config",
            Self::Cancelled => "cancelled",
            Self::Other => "other",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unified error type for the tracker crate
#[derive(Error, Debug)]
pub enum Error {
    /// Key pool errors
    #[error("Key pool error: {0}")]
    Keys(#[from] KeyPoolError),

    /// HTTP client errors
    #[error("Client error: {0}")]
    Client(#[from] ClientError),

    /// Job store errors
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Job scheduling and execution errors
    #[error("Job error: {0}")]
    Job(#[from] JobError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Configuration errors
    #[error("Config error: {0}")]
    Config(String),

    /// Generic error with context
    #[error("{context}")]
    Other {
        context: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl Error {
    /// Check if this error is recoverable (can be retried)
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Keys(e) => e.is_recoverable(),
            Self::Client(e) => e.is_recoverable(),
            Self::Storage(e) => e.is_recoverable(),
            Self::Job(e) => e.is_recoverable(),
            Self::Io(_) => true,
            Self::Config(_) => false,
            Self::Other { .. } => false,
        }
    }

    /// Get the error category for handling strategies
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Keys(KeyPoolError::Cancelled)
            | Self::Client(ClientError::Cancelled)
            | Self::Job(JobError::Cancelled) => ErrorCategory::Cancelled,
            Self::Keys(_) => ErrorCategory::Keys,
            Self::Client(ClientError::Key(_)) => ErrorCategory::Keys,
            Self::Client(_) => ErrorCategory::Network,
            Self::Storage(_) | Self::Io(_) => ErrorCategory::Storage,
            Self::Job(JobError::Storage(_)) => ErrorCategory::Storage,
            Self::Job(JobError::Client(_)) => ErrorCategory::Network,
            Self::Job(_) => ErrorCategory::Job,
            Self::Config(_) => ErrorCategory::Config,
            Self::Other { .. } => ErrorCategory::Other,
        }
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a generic error with context and source
    pub fn with_source(
        context: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Other {
            context: context.into(),
            source: Some(Box::new(source)),
        }
    }
}

// Conversion from anyhow::Error
impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Self::Other {
            context: format!("{err:#}"),
            source: None,
        }
    }
}

/// Result type alias using the unified Error type
pub type Result<T> = std::result::Result<T, Error>;
