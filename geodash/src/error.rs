//! Error types surfaced to GeoDash callers
//!
//! Each layer keeps its own `thiserror` enum (`StoreError`, `PoolError`,
//! `IndexerError`, `ConfigError`, `ImportError`). At the service boundary they
//! collapse into [`GeoDashError`], which is `Clone` so one failed resolution can
//! be handed to every caller that was waiting on it.

use thiserror::Error;

use crate::config::ConfigError;
use crate::importer::ImportError;
use crate::pool::PoolError;
use crate::store::StoreError;

/// Request rejected before any work was done.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("query text is empty")]
    EmptyQuery,
    #[error("query is {chars} characters long; the maximum is {max}")]
    QueryTooLong { chars: usize, max: usize },
    #[error("limit must be at least 1")]
    ZeroLimit,
    #[error("limit {requested} exceeds the maximum of {max}")]
    LimitTooLarge { requested: usize, max: usize },
    #[error("threshold {0} is outside 0-100")]
    ThresholdOutOfRange(u8),
    #[error("invalid coordinates ({lat}, {lon})")]
    InvalidLocation { lat: f64, lon: f64 },
}

/// Error type for GeoDash operations
#[derive(Debug, Clone, PartialEq, Error)]
pub enum GeoDashError {
    #[error("Invalid request: {0}")]
    Validation(#[from] ValidationError),
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),
    #[error("Timed out after {waited_ms} ms waiting for a store connection")]
    PoolTimeout { waited_ms: u64 },
    #[error("Unsupported: {0}")]
    Unsupported(String),
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("Import failed: {0}")]
    Import(String),
    #[error("Operation cancelled")]
    Cancelled,
    #[error("Internal error: {0}")]
    Internal(String),
}

pub type GeoDashResult<T> = Result<T, GeoDashError>;

impl GeoDashError {
    /// Whether retrying the same request later could succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            GeoDashError::StoreUnavailable(_) | GeoDashError::PoolTimeout { .. }
        )
    }
}

impl From<StoreError> for GeoDashError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Pool(PoolError::Timeout { waited, .. }) => GeoDashError::PoolTimeout {
                waited_ms: waited.as_millis() as u64,
            },
            StoreError::Unsupported(backend, op) => {
                GeoDashError::Unsupported(format!("{op} is not available on the {backend} store"))
            }
            other => GeoDashError::StoreUnavailable(other.to_string()),
        }
    }
}

impl From<PoolError> for GeoDashError {
    fn from(e: PoolError) -> Self {
        StoreError::Pool(e).into()
    }
}

impl From<ConfigError> for GeoDashError {
    fn from(e: ConfigError) -> Self {
        GeoDashError::Config(e.to_string())
    }
}

impl From<ImportError> for GeoDashError {
    fn from(e: ImportError) -> Self {
        match e {
            ImportError::Store(store) => store.into(),
            other => GeoDashError::Import(other.to_string()),
        }
    }
}
