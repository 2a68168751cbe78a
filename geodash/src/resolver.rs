//! Query resolution
//!
//! A resolution walks a fixed sequence of stages:
//!
//! ```text
//! Validating -> CacheLookup -> Done                                  (hit)
//!                          \-> Retrieving -> Scoring -> RankingAndTrimming
//!                                -> CachePopulate -> Done            (miss)
//! any stage -> Failed
//! ```
//!
//! Misses for the same [`CacheKey`] share one pipeline run (single-flight).
//! The pipeline runs on a blocking thread inside a spawned task, so a caller
//! that stops waiting never strands the others; the service's shutdown token
//! is checked between stages.

use once_cell::sync::Lazy;
use rayon::prelude::*;
use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::cache::{CacheKey, CachedResults, ResultCache, SingleFlight};
use crate::config::GeoDashConfig;
use crate::error::{GeoDashError, GeoDashResult, ValidationError};
use crate::fuzzy::{FuzzyMatcher, MIN_RECOMMENDED_THRESHOLD};
use crate::models::{GeoPoint, PlaceRecord, QueryRequest, Resolution, ScoredPlace};
use crate::proximity::ProximityScorer;
use crate::ranking::{rank_and_trim, FusionWeights};
use crate::store::{CandidateQuery, RecordStore};
use crate::text;

/// Global fallback Tokio runtime for resolutions polled outside any runtime.
/// Shared by every resolver and never dropped.
static FALLBACK_RUNTIME: Lazy<tokio::runtime::Runtime> = Lazy::new(|| {
    tokio::runtime::Builder::new_multi_thread()
        .thread_name("geodash-fallback")
        .enable_all()
        .build()
        .expect("Failed to create fallback tokio runtime")
});

pub(crate) fn runtime_handle() -> tokio::runtime::Handle {
    tokio::runtime::Handle::try_current().unwrap_or_else(|_| FALLBACK_RUNTIME.handle().clone())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolveStage {
    Validating,
    CacheLookup,
    Retrieving,
    Scoring,
    RankingAndTrimming,
    CachePopulate,
    Done,
    Failed,
}

impl fmt::Display for ResolveStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// A candidate could not be scored; it is dropped from the result.
#[derive(Debug, thiserror::Error)]
enum ScoringError {
    #[error("record {id} has invalid coordinates ({lat}, {lon})")]
    InvalidCoordinates { id: i64, lat: f64, lon: f64 },
}

/// A request after validation and defaulting.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedQuery {
    pub key: CacheKey,
    pub folded: String,
    pub location: Option<GeoPoint>,
    /// Centre of the caller's cache cell; caller-country inference runs from
    /// here so it agrees for every request sharing the cache key.
    pub inference_point: Option<GeoPoint>,
    pub country: Option<String>,
    pub caller_country: Option<String>,
    pub limit: usize,
    pub threshold: u8,
}

/// The stateless part of a resolution: everything the pipeline needs on a
/// blocking thread.
struct Engine {
    config: Arc<GeoDashConfig>,
    store: Arc<dyn RecordStore>,
    cache: Arc<ResultCache>,
    matcher: FuzzyMatcher,
    proximity: ProximityScorer,
    weights: FusionWeights,
}

pub struct Resolver {
    engine: Arc<Engine>,
    flights: Arc<SingleFlight>,
    shutdown: CancellationToken,
}

fn enter(stage: ResolveStage) {
    debug!(%stage, "Resolver stage");
}

fn check_cancelled(token: &CancellationToken) -> GeoDashResult<()> {
    if token.is_cancelled() {
        Err(GeoDashError::Cancelled)
    } else {
        Ok(())
    }
}

/// Centre of a cache grid cell, clamped to valid coordinates.
fn bucket_centre((lat, lon): (i64, i64), grid_degrees: f64) -> GeoPoint {
    GeoPoint {
        lat: ((lat as f64 + 0.5) * grid_degrees).clamp(-90.0, 90.0),
        lon: ((lon as f64 + 0.5) * grid_degrees).clamp(-180.0, 180.0),
    }
}

fn non_empty_country(code: Option<&str>) -> Option<String> {
    code.map(text::normalize_country).filter(|c| !c.is_empty())
}

impl Resolver {
    pub fn new(
        config: Arc<GeoDashConfig>,
        store: Arc<dyn RecordStore>,
        cache: Arc<ResultCache>,
        shutdown: CancellationToken,
    ) -> Self {
        let engine = Engine {
            matcher: FuzzyMatcher::new(config.features.fuzzy_search),
            proximity: ProximityScorer::new(config.search.max_relevant_distance_km),
            weights: FusionWeights::from(&config.search),
            config,
            store,
            cache,
        };
        Self {
            engine: Arc::new(engine),
            flights: SingleFlight::new(),
            shutdown,
        }
    }

    /// Resolutions currently running
    pub fn in_flight(&self) -> usize {
        self.flights.len()
    }

    /// Forget cached results after the store changed. Resolutions already
    /// running finish for their current callers but cannot repopulate the
    /// cache, and new callers start fresh.
    pub fn invalidate(&self) {
        self.engine.cache.clear();
        self.flights.forget_all();
    }

    pub fn validate(&self, req: &QueryRequest) -> Result<ValidatedQuery, ValidationError> {
        let config = &self.engine.config;

        let folded = text::fold(&req.text);
        if folded.is_empty() {
            return Err(ValidationError::EmptyQuery);
        }
        let chars = folded.chars().count();
        if chars > config.limits.max_query_chars {
            return Err(ValidationError::QueryTooLong {
                chars,
                max: config.limits.max_query_chars,
            });
        }

        let limit = req.limit.unwrap_or(config.limits.default_results);
        if limit == 0 {
            return Err(ValidationError::ZeroLimit);
        }
        if limit > config.limits.max_results {
            return Err(ValidationError::LimitTooLarge {
                requested: limit,
                max: config.limits.max_results,
            });
        }

        let threshold = req.threshold.unwrap_or(config.search.fuzzy_threshold);
        if threshold > 100 {
            return Err(ValidationError::ThresholdOutOfRange(threshold));
        }
        if threshold < MIN_RECOMMENDED_THRESHOLD {
            debug!(threshold, "Threshold below recommended minimum");
        }

        if let Some(loc) = req.location {
            if !loc.is_valid() {
                return Err(ValidationError::InvalidLocation {
                    lat: loc.lat,
                    lon: loc.lon,
                });
            }
        }
        let location = req.location.filter(|_| config.features.location_aware);
        let grid = config.cache.location_grid_degrees;
        let location_bucket = location.map(|loc| CacheKey::bucket(loc, grid));
        let inference_point = location_bucket.map(|bucket| bucket_centre(bucket, grid));

        let country = non_empty_country(req.country.as_deref());
        let caller_country = non_empty_country(req.caller_country.as_deref());

        let key = CacheKey {
            text: folded.clone(),
            location_bucket,
            country: country.clone(),
            caller_country: caller_country.clone(),
            limit,
            threshold,
        };

        Ok(ValidatedQuery {
            key,
            folded,
            location,
            inference_point,
            country,
            caller_country,
            limit,
            threshold,
        })
    }

    #[instrument(skip_all, fields(text = %req.text))]
    pub async fn resolve(&self, req: QueryRequest) -> GeoDashResult<Resolution> {
        let outcome = self.resolve_inner(req).await;
        match &outcome {
            Ok(resolution) => {
                enter(ResolveStage::Done);
                debug!(
                    results = resolution.len(),
                    cache_hit = resolution.cache_hit,
                    "Resolved query"
                );
            }
            Err(e) => {
                enter(ResolveStage::Failed);
                debug!("Resolution failed: {}", e);
            }
        }
        outcome
    }

    async fn resolve_inner(&self, req: QueryRequest) -> GeoDashResult<Resolution> {
        check_cancelled(&self.shutdown)?;

        enter(ResolveStage::Validating);
        let query = self.validate(&req)?;

        enter(ResolveStage::CacheLookup);
        if let Some(results) = self.engine.cache.get(&query.key) {
            return Ok(Resolution {
                results,
                cache_hit: true,
            });
        }

        let engine = Arc::clone(&self.engine);
        let token = self.shutdown.clone();
        let (flight, leader) =
            self.flights
                .join_or_start(query.key.clone(), &runtime_handle(), move || async move {
                    tokio::task::spawn_blocking(move || engine.run(&query, &token))
                        .await
                        .map_err(|e| {
                            if e.is_cancelled() {
                                GeoDashError::Cancelled
                            } else {
                                warn!("Resolution pipeline panicked: {}", e);
                                GeoDashError::Internal("resolution pipeline panicked".into())
                            }
                        })?
                });
        if !leader {
            debug!("Joined in-flight resolution");
        }

        let results = flight.await?;
        Ok(Resolution {
            results,
            cache_hit: false,
        })
    }
}

impl Engine {
    /// Retrieving through CachePopulate. Blocking.
    fn run(&self, query: &ValidatedQuery, token: &CancellationToken) -> GeoDashResult<CachedResults> {
        check_cancelled(token)?;
        // a flight that just landed may have filled the cache since our lookup
        let generation = self.cache.generation();
        if let Some(results) = self.cache.get(&query.key) {
            return Ok(results);
        }

        enter(ResolveStage::Retrieving);
        let caller_country = query
            .caller_country
            .clone()
            .or_else(|| self.infer_caller_country(query.inference_point));
        let candidates = self.store.candidates(&CandidateQuery {
            text: query.folded.clone(),
            country: query.country.clone(),
            limit: self.config.search.candidate_limit,
            fuzzy: self.config.features.fuzzy_search,
        })?;

        check_cancelled(token)?;
        enter(ResolveStage::Scoring);
        let scored = self.score(query, caller_country.as_deref(), candidates);

        check_cancelled(token)?;
        enter(ResolveStage::RankingAndTrimming);
        let ranked = Arc::new(rank_and_trim(scored, query.limit));

        check_cancelled(token)?;
        enter(ResolveStage::CachePopulate);
        self.cache
            .put_if_current(query.key.clone(), Arc::clone(&ranked), generation);
        Ok(ranked)
    }

    /// Country of the nearest record to the caller, if the store can tell.
    fn infer_caller_country(&self, location: Option<GeoPoint>) -> Option<String> {
        let location = location?;
        if !self.store.supports_spatial() {
            return None;
        }
        let radius = self.config.search.country_inference_radius_km;
        match self.store.nearby(location, radius, 1) {
            Ok(nearest) => {
                let country = nearest
                    .into_iter()
                    .next()
                    .map(|n| text::normalize_country(&n.place.country_code));
                debug!(?country, "Inferred caller country");
                country
            }
            Err(e) => {
                debug!("Caller country inference failed: {}", e);
                None
            }
        }
    }

    fn score(
        &self,
        query: &ValidatedQuery,
        caller_country: Option<&str>,
        candidates: Vec<PlaceRecord>,
    ) -> Vec<ScoredPlace> {
        candidates
            .into_par_iter()
            .filter_map(|place| match self.score_one(query, caller_country, place) {
                Ok(scored) => scored,
                Err(e) => {
                    warn!("Dropping candidate: {}", e);
                    None
                }
            })
            .collect()
    }

    fn score_one(
        &self,
        query: &ValidatedQuery,
        caller_country: Option<&str>,
        place: PlaceRecord,
    ) -> Result<Option<ScoredPlace>, ScoringError> {
        if !place.location().is_valid() {
            return Err(ScoringError::InvalidCoordinates {
                id: place.id.0,
                lat: place.latitude,
                lon: place.longitude,
            });
        }
        if let Some(country) = &query.country {
            if !place.country_code.eq_ignore_ascii_case(country) {
                return Ok(None);
            }
        }

        let fuzzy_score = self.matcher.score_record(&query.folded, &place);
        if fuzzy_score < query.threshold {
            return Ok(None);
        }

        let (distance_km, proximity_score) = match query.location {
            Some(caller) => {
                let (distance, proximity) = self.proximity.score(caller, place.location());
                (Some(distance), proximity)
            }
            None => (None, 0.0),
        };
        let country_boosted =
            caller_country.is_some_and(|c| place.country_code.eq_ignore_ascii_case(c));
        let fused_score = self
            .weights
            .fuse(fuzzy_score, proximity_score, country_boosted);

        Ok(Some(ScoredPlace {
            place,
            fuzzy_score,
            proximity_score,
            distance_km,
            country_boosted,
            fused_score,
        }))
    }
}
