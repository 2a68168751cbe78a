//! Configuration for GeoDash
//!
//! The configuration is deserialised from TOML, then [`GeoDashConfig::resolve`]
//! applies the operating mode and validates every range once at startup. The
//! resolved struct is shared immutably (`Arc<GeoDashConfig>`) with every
//! component; nothing reads feature toggles from global state.
//!
//! ```toml
//! mode = "advanced"
//!
//! [database]
//! backend = "sqlite"
//! path = "/var/lib/geodash/cities.db"
//!
//! [search]
//! fuzzy_threshold = 70
//! country_boost = 25000.0
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid TOML: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("{field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.into(),
    }
}

/// Operating mode. `Simple` switches off fuzzy search, shared memory and
/// advanced indexing regardless of the feature flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Simple,
    #[default]
    Advanced,
}

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GeoDashConfig {
    pub mode: Mode,
    pub features: FeatureFlags,
    pub database: DatabaseConfig,
    pub pool: PoolConfig,
    pub search: SearchConfig,
    pub cache: CacheConfig,
    pub limits: LimitsConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeatureFlags {
    /// Edit-distance matching; off means prefix matching only
    pub fuzzy_search: bool,
    /// Proximity scoring and country inference from the caller's location
    pub location_aware: bool,
    /// Memory-mapped reads on the embedded store
    pub shared_memory: bool,
    /// Spatial and full-text indexes on the embedded store
    pub advanced_indexing: bool,
    pub result_cache: bool,
}

impl Default for FeatureFlags {
    fn default() -> Self {
        Self {
            fuzzy_search: true,
            location_aware: true,
            shared_memory: true,
            advanced_indexing: true,
            result_cache: true,
        }
    }
}

/// Backend selection and connection parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum DatabaseConfig {
    Sqlite {
        /// Database file; in-memory when absent
        #[serde(default)]
        path: Option<PathBuf>,
        /// Text index directory; defaults to `<path>.index`, in RAM for an
        /// in-memory database
        #[serde(default)]
        index_dir: Option<PathBuf>,
    },
    Postgres {
        url: String,
    },
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        DatabaseConfig::Sqlite {
            path: None,
            index_dir: None,
        }
    }
}

impl DatabaseConfig {
    pub fn backend_name(&self) -> &'static str {
        match self {
            DatabaseConfig::Sqlite { .. } => "sqlite",
            DatabaseConfig::Postgres { .. } => "postgres",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub min_size: u32,
    pub max_size: u32,
    pub acquire_timeout_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_size: 1,
            max_size: 8,
            acquire_timeout_ms: 5_000,
        }
    }
}

impl PoolConfig {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    /// Minimum fuzzy score (0-100) a candidate needs to be returned
    pub fuzzy_threshold: u8,
    /// Weight of the proximity signal, 0-1
    pub distance_weight: f64,
    /// Additive bonus for candidates in the caller's country
    pub country_boost: f64,
    /// Multiplier bringing proximity onto the fuzzy score's scale
    pub proximity_scale: f64,
    /// Distance at and beyond which proximity is 0
    pub max_relevant_distance_km: f64,
    /// Upper bound on candidates handed to the fuzzy matcher per query
    pub candidate_limit: usize,
    pub country_inference_radius_km: f64,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            fuzzy_threshold: 70,
            distance_weight: 0.3,
            country_boost: 25_000.0,
            proximity_scale: 100.0,
            max_relevant_distance_km: 1_000.0,
            candidate_limit: 1_000,
            country_inference_radius_km: 50.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub capacity: usize,
    pub ttl_secs: u64,
    /// Caller locations are bucketed to this grid before keying
    pub location_grid_degrees: f64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: 5_000,
            ttl_secs: 300,
            location_grid_degrees: 0.05,
        }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    pub default_results: usize,
    pub max_results: usize,
    /// Longest accepted query, in characters after folding
    pub max_query_chars: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            default_results: 10,
            max_results: 100,
            max_query_chars: 200,
        }
    }
}

impl GeoDashConfig {
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(s)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&raw)
    }

    /// In-memory SQLite with default tuning. Handy for tests and tools.
    pub fn in_memory() -> Self {
        Self::default()
    }

    pub fn with_sqlite_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.database = DatabaseConfig::Sqlite {
            path: Some(path.into()),
            index_dir: None,
        };
        self
    }

    /// Apply the operating mode and validate. Call once before handing the
    /// configuration to any component.
    pub fn resolve(mut self) -> Result<Self, ConfigError> {
        if self.mode == Mode::Simple {
            self.features.fuzzy_search = false;
            self.features.shared_memory = false;
            self.features.advanced_indexing = false;
        }
        self.validate()?;
        Ok(self)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let search = &self.search;
        if search.fuzzy_threshold > 100 {
            return Err(invalid("search.fuzzy_threshold", "must be within 0-100"));
        }
        if !(0.0..=1.0).contains(&search.distance_weight) {
            return Err(invalid("search.distance_weight", "must be within 0-1"));
        }
        if !search.country_boost.is_finite() || search.country_boost < 0.0 {
            return Err(invalid("search.country_boost", "must be a non-negative number"));
        }
        if !search.proximity_scale.is_finite() || search.proximity_scale < 0.0 {
            return Err(invalid("search.proximity_scale", "must be a non-negative number"));
        }
        if !(search.max_relevant_distance_km > 0.0) {
            return Err(invalid("search.max_relevant_distance_km", "must be positive"));
        }
        if search.candidate_limit == 0 {
            return Err(invalid("search.candidate_limit", "must be at least 1"));
        }
        if !(search.country_inference_radius_km >= 0.0) {
            return Err(invalid("search.country_inference_radius_km", "must not be negative"));
        }

        let limits = &self.limits;
        if limits.default_results == 0 {
            return Err(invalid("limits.default_results", "must be at least 1"));
        }
        if limits.default_results > limits.max_results {
            return Err(invalid(
                "limits.default_results",
                format!("{} exceeds max_results {}", limits.default_results, limits.max_results),
            ));
        }

        if limits.max_query_chars == 0 {
            return Err(invalid("limits.max_query_chars", "must be at least 1"));
        }

        if self.pool.max_size == 0 {
            return Err(invalid("pool.max_size", "must be at least 1"));
        }
        if self.pool.min_size > self.pool.max_size {
            return Err(invalid(
                "pool.min_size",
                format!("{} exceeds max_size {}", self.pool.min_size, self.pool.max_size),
            ));
        }

        if self.features.result_cache {
            if self.cache.capacity == 0 {
                return Err(invalid("cache.capacity", "must be at least 1 when caching is on"));
            }
            if self.cache.ttl_secs == 0 {
                return Err(invalid("cache.ttl_secs", "must be positive when caching is on"));
            }
        }
        if !(self.cache.location_grid_degrees > 0.0) {
            return Err(invalid("cache.location_grid_degrees", "must be positive"));
        }

        if let DatabaseConfig::Postgres { url } = &self.database {
            if url.trim().is_empty() {
                return Err(invalid("database.url", "must not be empty"));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = GeoDashConfig::default().resolve().unwrap();
        assert_eq!(config.mode, Mode::Advanced);
        assert!(config.features.fuzzy_search);
        assert_eq!(config.search.fuzzy_threshold, 70);
        assert_eq!(config.search.country_boost, 25_000.0);
        assert_eq!(config.limits.max_results, 100);
        assert_eq!(config.limits.max_query_chars, 200);
        assert_eq!(config.pool.acquire_timeout(), Duration::from_secs(5));
        assert_eq!(
            config.database,
            DatabaseConfig::Sqlite {
                path: None,
                index_dir: None
            }
        );
    }

    #[test]
    fn test_simple_mode_forces_features_off() {
        let config = GeoDashConfig::from_toml_str(
            r#"
            mode = "simple"

            [features]
            fuzzy_search = true
            shared_memory = true
            advanced_indexing = true
            "#,
        )
        .unwrap()
        .resolve()
        .unwrap();

        assert!(!config.features.fuzzy_search);
        assert!(!config.features.shared_memory);
        assert!(!config.features.advanced_indexing);
        assert!(config.features.location_aware);
        assert!(config.features.result_cache);
    }

    #[test]
    fn test_postgres_backend() {
        let config = GeoDashConfig::from_toml_str(
            r#"
            [database]
            backend = "postgres"
            url = "postgres://geo@localhost/geodash"

            [pool]
            max_size = 16
            "#,
        )
        .unwrap()
        .resolve()
        .unwrap();

        assert_eq!(config.database.backend_name(), "postgres");
        assert_eq!(config.pool.max_size, 16);
        assert_eq!(config.pool.min_size, 1);
    }

    #[test]
    fn test_partial_sections_keep_defaults() {
        let config = GeoDashConfig::from_toml_str(
            r#"
            [search]
            fuzzy_threshold = 85
            "#,
        )
        .unwrap();
        assert_eq!(config.search.fuzzy_threshold, 85);
        assert_eq!(config.search.distance_weight, 0.3);
        assert_eq!(config.cache.capacity, 5_000);
    }

    #[test]
    fn test_rejects_zero_query_length() {
        let mut config = GeoDashConfig::default();
        config.limits.max_query_chars = 0;
        assert!(matches!(
            config.resolve(),
            Err(ConfigError::Invalid { field: "limits.max_query_chars", .. })
        ));
    }

    #[test]
    fn test_rejects_out_of_range_values() {
        let mut config = GeoDashConfig::default();
        config.search.fuzzy_threshold = 101;
        assert!(matches!(
            config.resolve(),
            Err(ConfigError::Invalid { field: "search.fuzzy_threshold", .. })
        ));

        let mut config = GeoDashConfig::default();
        config.limits.default_results = 500;
        assert!(config.resolve().is_err());

        let mut config = GeoDashConfig::default();
        config.pool.min_size = 10;
        assert!(config.resolve().is_err());

        let mut config = GeoDashConfig::default();
        config.search.distance_weight = 1.5;
        assert!(config.resolve().is_err());
    }

    #[test]
    fn test_zero_cache_capacity_allowed_when_disabled() {
        let mut config = GeoDashConfig::default();
        config.cache.capacity = 0;
        assert!(config.clone().resolve().is_err());
        config.features.result_cache = false;
        assert!(config.resolve().is_ok());
    }

    #[test]
    fn test_load_missing_file() {
        let err = GeoDashConfig::load("/nonexistent/geodash.toml").unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
