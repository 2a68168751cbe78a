//! GeoDash - city-name resolution over a geographic gazetteer
//!
//! Free-text place names are resolved to ranked records using edit-distance
//! matching, great-circle proximity to the caller and a same-country boost.
//! Records live in an embedded SQLite store (R*Tree + tantivy text index) or,
//! with the `postgres` feature, in PostGIS with pg_trgm.
//!
//! Repeated queries are served from a TTL'd LRU cache, and concurrent misses
//! for the same query share a single pipeline run.

pub mod cache;
pub mod config;
pub mod error;
pub mod fuzzy;
pub mod importer;
pub mod models;
pub mod pool;
pub mod proximity;
pub mod ranking;
pub mod resolver;
mod service;
pub mod store;
pub mod text;

pub use config::{GeoDashConfig, Mode};
pub use error::{GeoDashError, GeoDashResult, ValidationError};
pub use importer::{CsvImporter, ImportOptions, ImportReport, RowFailure};
pub use models::*;
pub use service::GeoDash;
pub use store::{open_store, CandidateQuery, LoadOutcome, RecordStore, StoreError, StoreResult};
