//! Result cache and single-flight de-duplication.
//!
//! [`ResultCache`] is a capacity-bounded LRU whose entries expire a fixed TTL
//! after insertion. [`SingleFlight`] makes concurrent identical misses share
//! one resolution: the first caller spawns the work as a task and every caller
//! (the first included) awaits a shared handle to it, so dropping any of them
//! leaves the work and the other waiters untouched.
//!
//! Invalidation is generational: [`ResultCache::clear`] bumps a generation
//! counter, and a resolution that read the store under an older generation
//! has its insert dropped.

use futures::future::{BoxFuture, FutureExt, Shared};
use lru::LruCache;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::error::GeoDashError;
use crate::models::{GeoPoint, ScoredPlace};

pub type CachedResults = Arc<Vec<ScoredPlace>>;

// ─────────────────────────────────────────────────────────────────────────────
// KEY
// ─────────────────────────────────────────────────────────────────────────────

/// Canonical identity of a logical query. Two requests that must produce the
/// same results build equal keys regardless of field spelling or call order.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub text: String,
    /// Caller location snapped to the cache grid
    pub location_bucket: Option<(i64, i64)>,
    pub country: Option<String>,
    pub caller_country: Option<String>,
    pub limit: usize,
    pub threshold: u8,
}

impl CacheKey {
    pub fn bucket(location: GeoPoint, grid_degrees: f64) -> (i64, i64) {
        (
            (location.lat / grid_degrees).floor() as i64,
            (location.lon / grid_degrees).floor() as i64,
        )
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// RESULT CACHE
// ─────────────────────────────────────────────────────────────────────────────

struct CacheEntry {
    results: CachedResults,
    expires_at: Instant,
}

/// LRU + TTL result cache. A disabled cache misses every lookup and drops
/// every insert.
pub struct ResultCache {
    entries: Option<Mutex<LruCache<CacheKey, CacheEntry>>>,
    ttl: Duration,
    generation: AtomicU64,
}

impl ResultCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        let entries = NonZeroUsize::new(capacity).map(|cap| Mutex::new(LruCache::new(cap)));
        Self {
            entries,
            ttl,
            generation: AtomicU64::new(0),
        }
    }

    pub fn disabled() -> Self {
        Self {
            entries: None,
            ttl: Duration::ZERO,
            generation: AtomicU64::new(0),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.entries.is_some()
    }

    pub fn get(&self, key: &CacheKey) -> Option<CachedResults> {
        self.get_at(key, Instant::now())
    }

    pub fn put(&self, key: CacheKey, results: CachedResults) {
        self.put_at(key, results, Instant::now(), None);
    }

    /// Current invalidation generation. Capture it before reading the store.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Insert only if no [`clear`](Self::clear) happened since `generation`
    /// was captured. Returns whether the entry was stored.
    pub fn put_if_current(&self, key: CacheKey, results: CachedResults, generation: u64) -> bool {
        self.put_at(key, results, Instant::now(), Some(generation))
    }

    fn get_at(&self, key: &CacheKey, now: Instant) -> Option<CachedResults> {
        let mut entries = self.entries.as_ref()?.lock();
        let expired = match entries.get(key) {
            Some(entry) if now < entry.expires_at => return Some(Arc::clone(&entry.results)),
            Some(_) => true,
            None => false,
        };
        if expired {
            entries.pop(key);
        }
        None
    }

    fn put_at(
        &self,
        key: CacheKey,
        results: CachedResults,
        now: Instant,
        generation: Option<u64>,
    ) -> bool {
        let Some(entries) = &self.entries else {
            return false;
        };
        let entry = CacheEntry {
            results,
            expires_at: now + self.ttl,
        };
        // generation is compared under the same lock clear() takes
        let mut entries = entries.lock();
        if generation.is_some_and(|g| g != self.generation()) {
            debug!(query = %key.text, "Dropping results read before invalidation");
            return false;
        }
        if let Some((evicted, _)) = entries.push(key, entry) {
            debug!(query = %evicted.text, "Evicted least recently used cache entry");
        }
        true
    }

    /// Drop every entry and invalidate results still being computed.
    pub fn clear(&self) {
        match &self.entries {
            Some(entries) => {
                let mut entries = entries.lock();
                self.generation.fetch_add(1, Ordering::AcqRel);
                entries.clear();
            }
            None => {
                self.generation.fetch_add(1, Ordering::AcqRel);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.as_ref().map_or(0, |e| e.lock().len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// SINGLE-FLIGHT
// ─────────────────────────────────────────────────────────────────────────────

pub type FlightResult = Result<CachedResults, GeoDashError>;
pub type Flight = Shared<BoxFuture<'static, FlightResult>>;

/// Table of in-flight resolutions keyed by [`CacheKey`].
#[derive(Default)]
pub struct SingleFlight {
    inflight: Mutex<HashMap<CacheKey, (u64, Flight)>>,
    next_id: AtomicU64,
}

/// Removes the flight's table entry when the spawned work ends, however it
/// ends. A newer flight registered under the same key is left alone.
struct FlightGuard {
    flights: Arc<SingleFlight>,
    key: CacheKey,
    id: u64,
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        let mut inflight = self.flights.inflight.lock();
        if inflight.get(&self.key).is_some_and(|(id, _)| *id == self.id) {
            inflight.remove(&self.key);
        }
    }
}

impl SingleFlight {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Join the flight for `key`, or start one by spawning `start()` on
    /// `runtime`. Returns the shared handle and whether this call started it.
    pub fn join_or_start<F, Fut>(
        self: &Arc<Self>,
        key: CacheKey,
        runtime: &tokio::runtime::Handle,
        start: F,
    ) -> (Flight, bool)
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = FlightResult> + Send + 'static,
    {
        let mut inflight = self.inflight.lock();
        if let Some((_, flight)) = inflight.get(&key) {
            return (flight.clone(), false);
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let guard = FlightGuard {
            flights: Arc::clone(self),
            key: key.clone(),
            id,
        };
        let work = start();
        let task = runtime.spawn(async move {
            let _guard = guard;
            work.await
        });
        let flight = async move {
            match task.await {
                Ok(result) => result,
                Err(e) if e.is_cancelled() => Err(GeoDashError::Cancelled),
                Err(e) => {
                    warn!("Resolution task failed: {}", e);
                    Err(GeoDashError::Internal("resolution task panicked".into()))
                }
            }
        }
        .boxed()
        .shared();

        inflight.insert(key, (id, flight.clone()));
        (flight, true)
    }

    /// Stop routing new callers to running flights. The work itself keeps
    /// going and its current waiters still get its result.
    pub fn forget_all(&self) {
        let mut inflight = self.inflight.lock();
        if !inflight.is_empty() {
            debug!(flights = inflight.len(), "Detaching in-flight resolutions");
            inflight.clear();
        }
    }

    /// Number of resolutions currently in flight.
    pub fn len(&self) -> usize {
        self.inflight.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn key(text: &str) -> CacheKey {
        CacheKey {
            text: text.into(),
            location_bucket: None,
            country: None,
            caller_country: None,
            limit: 10,
            threshold: 70,
        }
    }

    fn results(n: usize) -> CachedResults {
        Arc::new(Vec::with_capacity(n))
    }

    #[test]
    fn test_round_trip() {
        let cache = ResultCache::new(8, Duration::from_secs(60));
        let value = results(0);
        cache.put(key("london"), Arc::clone(&value));
        let hit = cache.get(&key("london")).unwrap();
        assert!(Arc::ptr_eq(&hit, &value));
        assert!(cache.get(&key("paris")).is_none());
    }

    #[test]
    fn test_expired_entry_is_a_miss() {
        let cache = ResultCache::new(8, Duration::from_secs(60));
        let start = Instant::now();
        cache.put_at(key("london"), results(0), start, None);

        assert!(cache.get_at(&key("london"), start + Duration::from_secs(59)).is_some());
        assert!(cache.get_at(&key("london"), start + Duration::from_secs(60)).is_none());
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn test_lru_eviction() {
        let cache = ResultCache::new(2, Duration::from_secs(60));
        cache.put(key("a"), results(0));
        cache.put(key("b"), results(0));
        // touch "a" so "b" is least recently used
        assert!(cache.get(&key("a")).is_some());
        cache.put(key("c"), results(0));

        assert!(cache.get(&key("a")).is_some());
        assert!(cache.get(&key("b")).is_none());
        assert!(cache.get(&key("c")).is_some());
    }

    #[test]
    fn test_disabled_cache() {
        let cache = ResultCache::disabled();
        cache.put(key("london"), results(0));
        assert!(cache.get(&key("london")).is_none());
        assert!(!cache.is_enabled());
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn test_clear() {
        let cache = ResultCache::new(8, Duration::from_secs(60));
        cache.put(key("a"), results(0));
        cache.put(key("b"), results(0));
        cache.clear();
        assert!(cache.is_empty());
    }

    #[test]
    fn test_clear_rejects_results_read_before_it() {
        let cache = ResultCache::new(8, Duration::from_secs(60));
        let before = cache.generation();
        cache.clear();

        assert!(!cache.put_if_current(key("londres"), results(0), before));
        assert!(cache.get(&key("londres")).is_none());

        assert!(cache.put_if_current(key("londres"), results(0), cache.generation()));
        assert!(cache.get(&key("londres")).is_some());
    }

    #[test]
    fn test_disabled_cache_still_tracks_generation() {
        let cache = ResultCache::disabled();
        let before = cache.generation();
        cache.clear();
        assert_ne!(cache.generation(), before);
    }

    #[test]
    fn test_location_bucket() {
        let a = CacheKey::bucket(GeoPoint { lat: 48.851, lon: 2.351 }, 0.05);
        let b = CacheKey::bucket(GeoPoint { lat: 48.859, lon: 2.349 }, 0.05);
        let c = CacheKey::bucket(GeoPoint { lat: 48.95, lon: 2.35 }, 0.05);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_single_flight_collapses_concurrent_work() {
        let flights = SingleFlight::new();
        let runs = Arc::new(AtomicUsize::new(0));
        let handle = tokio::runtime::Handle::current();

        let mut waiters = Vec::new();
        let mut leaders = 0;
        for _ in 0..8 {
            let runs = Arc::clone(&runs);
            let (flight, leader) = flights.join_or_start(key("london"), &handle, move || async move {
                runs.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(50)).await;
                Ok(results(0))
            });
            leaders += usize::from(leader);
            waiters.push(flight);
        }

        for result in futures::future::join_all(waiters).await {
            assert!(result.is_ok());
        }
        assert_eq!(leaders, 1);
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert!(flights.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_dropped_leader_does_not_strand_followers() {
        let flights = SingleFlight::new();
        let handle = tokio::runtime::Handle::current();

        let (leader, started) = flights.join_or_start(key("paris"), &handle, || async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok(results(0))
        });
        assert!(started);
        let (follower, started) = flights.join_or_start(key("paris"), &handle, || async {
            Err(GeoDashError::Internal("follower started work".into()))
        });
        assert!(!started);

        drop(leader);
        let result = tokio::time::timeout(Duration::from_secs(5), follower).await;
        assert!(matches!(result, Ok(Ok(_))));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_failed_flight_is_shared_then_forgotten() {
        let flights = SingleFlight::new();
        let handle = tokio::runtime::Handle::current();

        let (flight, _) = flights.join_or_start(key("rome"), &handle, || async {
            Err(GeoDashError::StoreUnavailable("down".into()))
        });
        assert_eq!(
            flight.await.unwrap_err(),
            GeoDashError::StoreUnavailable("down".into())
        );

        assert!(flights.is_empty());
        let (_, started) = flights.join_or_start(key("rome"), &handle, || async { Ok(results(0)) });
        assert!(started);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_forgotten_flight_does_not_evict_its_successor() {
        let flights = SingleFlight::new();
        let handle = tokio::runtime::Handle::current();

        let (old, _) = flights.join_or_start(key("lyon"), &handle, || async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok(results(0))
        });
        flights.forget_all();
        assert!(flights.is_empty());

        let (new, started) = flights.join_or_start(key("lyon"), &handle, || async {
            tokio::time::sleep(Duration::from_millis(300)).await;
            Ok(results(1))
        });
        assert!(started);

        old.await.unwrap();
        // the old flight's guard ran; the new entry must survive it
        assert_eq!(flights.len(), 1);
        let (_, started) = flights.join_or_start(key("lyon"), &handle, || async {
            Err(GeoDashError::Internal("joined flight started work".into()))
        });
        assert!(!started);

        new.await.unwrap();
        assert!(flights.is_empty());
    }
}
