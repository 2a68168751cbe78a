//! Record stores
//!
//! [`RecordStore`] is the one capability interface the resolver talks to.
//! The backend is picked once, from configuration, by [`open_store`]:
//!
//! - [`SqliteStore`]: single-file embedded store with an R*Tree spatial index
//!   and a tantivy name index
//! - `PostgresStore` (feature `postgres`): PostGIS + pg_trgm over a pooled
//!   connection set
//!
//! Candidate retrieval returns records in no particular order; ranking is the
//! resolver's job.

pub mod indexer;
#[cfg(feature = "postgres")]
pub mod postgres;
pub mod sqlite;

use std::sync::Arc;
use thiserror::Error;

use crate::config::{DatabaseConfig, GeoDashConfig};
use crate::models::{
    CountrySummary, GeoPoint, NearbyPlace, PlaceId, PlaceRecord, StateSummary, StoreStats,
};
use crate::pool::PoolError;

#[cfg(feature = "postgres")]
pub use postgres::PostgresStore;
pub use sqlite::SqliteStore;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("PostgreSQL error: {0}")]
    Postgres(String),
    #[error(transparent)]
    Pool(#[from] PoolError),
    #[error("Index error: {0}")]
    Index(#[from] indexer::IndexerError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// (backend, operation)
    #[error("{1} is not supported by the {0} store")]
    Unsupported(&'static str, &'static str),
    #[error("{0}")]
    Backend(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

#[cfg(feature = "postgres")]
impl From<::postgres::Error> for StoreError {
    fn from(e: ::postgres::Error) -> Self {
        StoreError::Postgres(e.to_string())
    }
}

/// Coarse retrieval request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateQuery {
    /// Folded query text
    pub text: String,
    /// Upper-cased ISO2 country restriction
    pub country: Option<String>,
    /// Upper bound on records returned
    pub limit: usize,
    /// Whether callers will score with edit distance (wider recall) or by prefix
    pub fuzzy: bool,
}

/// Result of a bulk load: rows written plus rows rejected with the reason.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadOutcome {
    pub loaded: usize,
    pub failed: Vec<(PlaceId, String)>,
}

/// Storage backend contract. Implementations are blocking and thread-safe;
/// the resolver calls them from blocking worker threads.
pub trait RecordStore: Send + Sync {
    /// Short backend name for logs and stats
    fn backend(&self) -> &'static str;

    /// Index-assisted narrowing for a text query, at most `query.limit` records.
    fn candidates(&self, query: &CandidateQuery) -> StoreResult<Vec<PlaceRecord>>;

    /// Records within `radius_km` of `center`, nearest first, at most `limit`.
    fn nearby(&self, center: GeoPoint, radius_km: f64, limit: usize)
        -> StoreResult<Vec<NearbyPlace>>;

    fn get(&self, id: PlaceId) -> StoreResult<Option<PlaceRecord>>;

    /// Countries with their record counts, sorted by name
    fn countries(&self) -> StoreResult<Vec<CountrySummary>>;

    /// States of a country (matched by code or name), sorted by name
    fn states(&self, country: &str) -> StoreResult<Vec<StateSummary>>;

    /// Places in a state (code or name) of a country (code or name), sorted by name
    fn cities_in_state(&self, state: &str, country: &str) -> StoreResult<Vec<PlaceRecord>>;

    fn stats(&self) -> StoreResult<StoreStats>;

    /// Upsert rows by id. Rows that fail are reported, not fatal.
    fn bulk_load(&self, rows: &[PlaceRecord]) -> StoreResult<LoadOutcome>;

    /// Whether [`nearby`](Self::nearby) is available
    fn supports_spatial(&self) -> bool;
}

/// Row checks shared by every backend's bulk load.
pub(crate) fn check_row(row: &PlaceRecord) -> Result<(), String> {
    if row.name.trim().is_empty() {
        return Err("empty name".into());
    }
    if row.country_code.trim().len() != 2 {
        return Err(format!("bad country code {:?}", row.country_code));
    }
    if !row.location().is_valid() {
        return Err(format!(
            "invalid coordinates ({}, {})",
            row.latitude, row.longitude
        ));
    }
    Ok(())
}

/// Open the backend named by the configuration.
pub fn open_store(config: &GeoDashConfig) -> StoreResult<Arc<dyn RecordStore>> {
    match &config.database {
        DatabaseConfig::Sqlite { .. } => Ok(Arc::new(SqliteStore::open(config)?)),
        #[cfg(feature = "postgres")]
        DatabaseConfig::Postgres { .. } => Ok(Arc::new(PostgresStore::open(config)?)),
        #[cfg(not(feature = "postgres"))]
        DatabaseConfig::Postgres { .. } => Err(StoreError::Unsupported("postgres", "open")),
    }
}
