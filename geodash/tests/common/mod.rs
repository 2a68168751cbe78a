#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use geodash::store::SqliteStore;
use geodash::{
    CandidateQuery, CountrySummary, GeoDash, GeoDashConfig, GeoPoint, LoadOutcome, NearbyPlace,
    PlaceId, PlaceRecord, RecordStore, StateSummary, StoreResult, StoreStats,
};

pub const PARIS_FR: (f64, f64) = (48.85341, 2.3488);

pub fn place(
    id: i64,
    name: &str,
    country: (&str, &str),
    state: (&str, &str),
    lat: f64,
    lon: f64,
    population: i64,
) -> PlaceRecord {
    PlaceRecord {
        id: PlaceId(id),
        name: name.to_string(),
        ascii_name: deunicode::deunicode(name),
        country_code: country.0.to_string(),
        country_name: Some(country.1.to_string()),
        state_code: Some(state.0.to_string()),
        state_name: Some(state.1.to_string()),
        latitude: lat,
        longitude: lon,
        population: Some(population),
        search_rank: None,
    }
}

const GB: (&str, &str) = ("GB", "United Kingdom");
const FR: (&str, &str) = ("FR", "France");
const US: (&str, &str) = ("US", "United States");
const CA: (&str, &str) = ("CA", "Canada");
const DE: (&str, &str) = ("DE", "Germany");
const BR: (&str, &str) = ("BR", "Brazil");

/// A small gazetteer with a few same-named cities across countries.
pub fn gazetteer() -> Vec<PlaceRecord> {
    vec![
        place(1, "London", GB, ("ENG", "England"), 51.50853, -0.12574, 8_961_989),
        place(2, "London", CA, ("ON", "Ontario"), 42.98339, -81.23304, 383_822),
        place(3, "Paris", FR, ("IDF", "Île-de-France"), PARIS_FR.0, PARIS_FR.1, 2_138_551),
        place(4, "Paris", US, ("TX", "Texas"), 33.66094, -95.55551, 24_782),
        place(5, "Manchester", GB, ("ENG", "England"), 53.48095, -2.23743, 547_627),
        place(6, "Luton", GB, ("ENG", "England"), 51.87967, -0.41748, 213_052),
        place(7, "Berlin", DE, ("BE", "Berlin"), 52.52437, 13.41053, 3_426_354),
        place(8, "São Paulo", BR, ("SP", "São Paulo"), -23.5475, -46.63611, 10_021_295),
        place(9, "Springfield", US, ("IL", "Illinois"), 39.80172, -89.64371, 116_565),
        place(10, "Springfield", US, ("MA", "Massachusetts"), 42.10148, -72.58981, 153_060),
        place(11, "Versailles", FR, ("IDF", "Île-de-France"), 48.80359, 2.13424, 85_416),
    ]
}

pub fn service_with(config: GeoDashConfig) -> GeoDash {
    let geo = GeoDash::open(config).unwrap();
    let outcome = geo.store().bulk_load(&gazetteer()).unwrap();
    assert!(outcome.failed.is_empty(), "{:?}", outcome.failed);
    geo
}

pub fn service() -> GeoDash {
    service_with(GeoDashConfig::in_memory())
}

/// Wraps a store, counting coarse retrievals and holding each result for
/// `delay` after reading it so concurrent callers overlap.
pub struct CountingStore {
    inner: SqliteStore,
    delay: Duration,
    pub candidate_calls: AtomicUsize,
}

impl CountingStore {
    pub fn new(delay: Duration) -> Arc<Self> {
        let inner = SqliteStore::open_in_memory().unwrap();
        inner.bulk_load(&gazetteer()).unwrap();
        Arc::new(Self {
            inner,
            delay,
            candidate_calls: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.candidate_calls.load(Ordering::SeqCst)
    }
}

impl RecordStore for CountingStore {
    fn backend(&self) -> &'static str {
        "counting"
    }

    fn candidates(&self, query: &CandidateQuery) -> StoreResult<Vec<PlaceRecord>> {
        self.candidate_calls.fetch_add(1, Ordering::SeqCst);
        let found = self.inner.candidates(query);
        std::thread::sleep(self.delay);
        found
    }

    fn nearby(&self, center: GeoPoint, radius_km: f64, limit: usize) -> StoreResult<Vec<NearbyPlace>> {
        self.inner.nearby(center, radius_km, limit)
    }

    fn get(&self, id: PlaceId) -> StoreResult<Option<PlaceRecord>> {
        self.inner.get(id)
    }

    fn countries(&self) -> StoreResult<Vec<CountrySummary>> {
        self.inner.countries()
    }

    fn states(&self, country: &str) -> StoreResult<Vec<StateSummary>> {
        self.inner.states(country)
    }

    fn cities_in_state(&self, state: &str, country: &str) -> StoreResult<Vec<PlaceRecord>> {
        self.inner.cities_in_state(state, country)
    }

    fn stats(&self) -> StoreResult<StoreStats> {
        self.inner.stats()
    }

    fn bulk_load(&self, rows: &[PlaceRecord]) -> StoreResult<LoadOutcome> {
        self.inner.bulk_load(rows)
    }

    fn supports_spatial(&self) -> bool {
        self.inner.supports_spatial()
    }
}

pub const CITIES_CSV_HEADER: &str = "id,name,state_id,state_code,state_name,country_id,country_code,country_name,latitude,longitude,wikiDataId";
