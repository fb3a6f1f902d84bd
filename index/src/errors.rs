//! Index error types
//!
//! Every failure carries a category so callers can decide between
//! propagating (validation), logging and discarding (transient fetches,
//! aborted write groups) or retrying (migration batches).

use thiserror::Error;

/// Error category for structured logging and behavior mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// `pagetrail.toml` or env misconfigured
    ConfigError,
    /// Malformed input rejected before touching the store
    ValidationError,
    /// A write addressed a page that does not exist
    NotFoundError,
    /// An atomic write group was rolled back
    TransactionAbortError,
    /// Favicon retrieval or decoding failed
    TransientFetchError,
    /// Errors creating/connecting/querying the SQLite store
    StoreError,
    /// Failures reading or transforming legacy records
    MigrationError,
    /// Unexpected logic bugs (poisoned locks and the like)
    InternalError,
}

impl ErrorCategory {
    /// Machine-readable code for logging
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ConfigError => "CONFIG_ERROR",
            Self::ValidationError => "VALIDATION_ERROR",
            Self::NotFoundError => "NOT_FOUND_ERROR",
            Self::TransactionAbortError => "TRANSACTION_ABORT_ERROR",
            Self::TransientFetchError => "TRANSIENT_FETCH_ERROR",
            Self::StoreError => "STORE_ERROR",
            Self::MigrationError => "MIGRATION_ERROR",
            Self::InternalError => "INTERNAL_ERROR",
        }
    }

    /// Whether repeating the same operation later may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::TransactionAbortError | Self::StoreError | Self::MigrationError
        )
    }
}

/// Index error with category and context
#[derive(Debug, Error)]
pub enum IndexError {
    #[error("config error: {message}")]
    Config {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("validation error: {message}")]
    Validation { message: String },

    #[error("not found: {message}")]
    NotFound { message: String },

    #[error("transaction aborted: {message}")]
    TransactionAbort {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("fetch error: {message}")]
    TransientFetch {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("store error: {message}")]
    Store {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("migration error: {message}")]
    Migration {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("internal error: {message}")]
    Internal { message: String },
}

impl IndexError {
    /// Get the error category
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Config { .. } => ErrorCategory::ConfigError,
            Self::Validation { .. } => ErrorCategory::ValidationError,
            Self::NotFound { .. } => ErrorCategory::NotFoundError,
            Self::TransactionAbort { .. } => ErrorCategory::TransactionAbortError,
            Self::TransientFetch { .. } => ErrorCategory::TransientFetchError,
            Self::Store { .. } => ErrorCategory::StoreError,
            Self::Migration { .. } => ErrorCategory::MigrationError,
            Self::Internal { .. } => ErrorCategory::InternalError,
        }
    }

    /// Create a config error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
            source: None,
        }
    }

    /// Create a config error with source
    pub fn config_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Config {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound {
            message: message.into(),
        }
    }

    /// Wrap a failure that rolled back an atomic write group
    pub fn transaction_abort(source: IndexError) -> Self {
        Self::TransactionAbort {
            message: source.to_string(),
            source: Some(Box::new(source)),
        }
    }

    pub fn transient_fetch(message: impl Into<String>) -> Self {
        Self::TransientFetch {
            message: message.into(),
            source: None,
        }
    }

    pub fn transient_fetch_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::TransientFetch {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a store error
    pub fn store(message: impl Into<String>) -> Self {
        Self::Store {
            message: message.into(),
            source: None,
        }
    }

    /// Create a store error with source
    pub fn store_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Store {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn migration_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Migration {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }
}

/// Result type for index operations
pub type Result<T> = std::result::Result<T, IndexError>;
