//! GeoDash - the service facade
//!
//! Owns the resolved configuration, the record store, the result cache and
//! the resolver. Text queries go through the resolver (cached, single-flight);
//! lookups and listings go straight to the store.
//!
//! Store calls are blocking. `search` is async; `search_blocking` drives it on
//! the caller's thread and must not be called from inside an async task.

use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument};

use crate::cache::ResultCache;
use crate::config::GeoDashConfig;
use crate::error::{GeoDashError, GeoDashResult, ValidationError};
use crate::importer::{CsvImporter, ImportOptions, ImportReport};
use crate::models::{
    CountrySummary, GeoPoint, NearbyPlace, PlaceId, PlaceRecord, QueryRequest, Resolution,
    StateSummary, StoreStats,
};
use crate::ranking::by_distance;
use crate::resolver::Resolver;
use crate::store::{open_store, RecordStore};

pub struct GeoDash {
    config: Arc<GeoDashConfig>,
    store: Arc<dyn RecordStore>,
    cache: Arc<ResultCache>,
    resolver: Resolver,
    shutdown: CancellationToken,
}

impl GeoDash {
    /// Resolve `config` and open the backend it names.
    pub fn open(config: GeoDashConfig) -> GeoDashResult<Self> {
        let config = config.resolve()?;
        let store = open_store(&config)?;
        info!(
            backend = store.backend(),
            mode = ?config.mode,
            "Opened GeoDash"
        );
        Self::build(config, store)
    }

    /// Use an already opened store.
    pub fn with_store(config: GeoDashConfig, store: Arc<dyn RecordStore>) -> GeoDashResult<Self> {
        Self::build(config.resolve()?, store)
    }

    fn build(config: GeoDashConfig, store: Arc<dyn RecordStore>) -> GeoDashResult<Self> {
        let config = Arc::new(config);
        let cache = Arc::new(if config.features.result_cache {
            ResultCache::new(config.cache.capacity, config.cache.ttl())
        } else {
            ResultCache::disabled()
        });
        let shutdown = CancellationToken::new();
        let resolver = Resolver::new(
            Arc::clone(&config),
            Arc::clone(&store),
            Arc::clone(&cache),
            shutdown.clone(),
        );
        Ok(Self {
            config,
            store,
            cache,
            resolver,
            shutdown,
        })
    }

    pub fn config(&self) -> &GeoDashConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn RecordStore> {
        &self.store
    }

    pub async fn search(&self, request: QueryRequest) -> GeoDashResult<Resolution> {
        self.resolver.resolve(request).await
    }

    pub fn search_blocking(&self, request: QueryRequest) -> GeoDashResult<Resolution> {
        futures::executor::block_on(self.search(request))
    }

    pub fn city(&self, id: PlaceId) -> GeoDashResult<Option<PlaceRecord>> {
        Ok(self.store.get(id)?)
    }

    /// Places within `radius_km` of `center`, nearest first.
    pub fn nearby(
        &self,
        center: GeoPoint,
        radius_km: f64,
        limit: usize,
    ) -> GeoDashResult<Vec<NearbyPlace>> {
        if !center.is_valid() {
            return Err(ValidationError::InvalidLocation {
                lat: center.lat,
                lon: center.lon,
            }
            .into());
        }
        if limit == 0 {
            return Err(ValidationError::ZeroLimit.into());
        }
        if !(radius_km.is_finite() && radius_km > 0.0) {
            return Err(GeoDashError::Unsupported(format!(
                "radius must be a positive distance, got {radius_km}"
            )));
        }
        let mut places = self.store.nearby(center, radius_km, limit)?;
        places.sort_by(by_distance);
        places.truncate(limit);
        Ok(places)
    }

    pub fn countries(&self) -> GeoDashResult<Vec<CountrySummary>> {
        Ok(self.store.countries()?)
    }

    pub fn states(&self, country: &str) -> GeoDashResult<Vec<StateSummary>> {
        Ok(self.store.states(country.trim())?)
    }

    pub fn cities_in_state(&self, state: &str, country: &str) -> GeoDashResult<Vec<PlaceRecord>> {
        Ok(self.store.cities_in_state(state.trim(), country.trim())?)
    }

    pub fn stats(&self) -> GeoDashResult<StoreStats> {
        Ok(self.store.stats()?)
    }

    pub fn import_csv(&self, path: &Path, options: ImportOptions) -> GeoDashResult<ImportReport> {
        self.import_csv_with_progress(path, options, |_| {})
    }

    /// Import and report progress after each batch. Cached results are dropped
    /// once the import finishes, even when it fails part way.
    #[instrument(skip(self, options, on_batch), fields(path = %path.display()))]
    pub fn import_csv_with_progress<F>(
        &self,
        path: &Path,
        options: ImportOptions,
        on_batch: F,
    ) -> GeoDashResult<ImportReport>
    where
        F: FnMut(&ImportReport),
    {
        let outcome =
            CsvImporter::new(options).import_path_with_progress(path, self.store.as_ref(), on_batch);
        self.resolver.invalidate();
        Ok(outcome?)
    }

    /// Import only into an empty store. `None` when records already exist.
    pub fn import_if_empty(
        &self,
        path: &Path,
        options: ImportOptions,
    ) -> GeoDashResult<Option<ImportReport>> {
        let existing = self.store.stats()?.places;
        if existing > 0 {
            info!(existing, "Store already populated, skipping import");
            return Ok(None);
        }
        self.import_csv(path, options).map(Some)
    }

    pub fn cache_len(&self) -> usize {
        self.cache.len()
    }

    pub fn clear_cache(&self) {
        self.resolver.invalidate();
    }

    /// Resolutions currently running
    pub fn in_flight(&self) -> usize {
        self.resolver.in_flight()
    }

    /// Cancel running resolutions at their next stage boundary and refuse new ones.
    pub fn shutdown(&self) {
        info!("Shutting down GeoDash");
        self.shutdown.cancel();
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}

impl Drop for GeoDash {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
