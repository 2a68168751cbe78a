//! Core data models for GeoDash
//!
//! Place records are immutable once loaded and owned by the record store.
//! Everything else here is an ephemeral value that lives for one resolution.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use crate::error::ValidationError;

// ─────────────────────────────────────────────────────────────────────────────
// PLACES
// ─────────────────────────────────────────────────────────────────────────────

/// Stable record identifier. Ordering is the numeric order of the key and is
/// the final tie-break when ranking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PlaceId(pub i64);

impl fmt::Display for PlaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A WGS84 coordinate pair in decimal degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lon: f64,
}

impl GeoPoint {
    /// Build a point, rejecting non-finite or out-of-range coordinates.
    pub fn new(lat: f64, lon: f64) -> Result<Self, ValidationError> {
        let point = Self { lat, lon };
        if point.is_valid() {
            Ok(point)
        } else {
            Err(ValidationError::InvalidLocation { lat, lon })
        }
    }

    pub fn is_valid(&self) -> bool {
        self.lat.is_finite()
            && self.lon.is_finite()
            && (-90.0..=90.0).contains(&self.lat)
            && (-180.0..=180.0).contains(&self.lon)
    }
}

/// One gazetteer row: a city with its country and state context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlaceRecord {
    pub id: PlaceId,
    pub name: String,
    /// ASCII rendering of `name` as shipped by the dataset (or derived on import)
    pub ascii_name: String,
    /// ISO 3166-1 alpha-2, upper-case
    pub country_code: String,
    pub country_name: Option<String>,
    pub state_code: Option<String>,
    pub state_name: Option<String>,
    pub latitude: f64,
    pub longitude: f64,
    pub population: Option<i64>,
    /// Optional dataset-provided ranking hint (higher = more prominent)
    pub search_rank: Option<f64>,
}

impl PlaceRecord {
    pub fn location(&self) -> GeoPoint {
        GeoPoint {
            lat: self.latitude,
            lon: self.longitude,
        }
    }

    /// Name variants the matcher scores against.
    pub fn names(&self) -> [&str; 2] {
        [self.name.as_str(), self.ascii_name.as_str()]
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// QUERIES & RESULTS
// ─────────────────────────────────────────────────────────────────────────────

/// A caller's search request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryRequest {
    pub text: String,
    pub location: Option<GeoPoint>,
    /// Restrict results to this country (ISO2)
    pub country: Option<String>,
    /// The caller's own country (ISO2), used for the same-country boost
    pub caller_country: Option<String>,
    /// Requested number of results; `None` uses the configured default
    pub limit: Option<usize>,
    /// Minimum fuzzy score override
    pub threshold: Option<u8>,
}

impl QueryRequest {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Default::default()
        }
    }

    pub fn near(mut self, lat: f64, lon: f64) -> Self {
        self.location = Some(GeoPoint { lat, lon });
        self
    }

    pub fn in_country(mut self, code: impl Into<String>) -> Self {
        self.country = Some(code.into());
        self
    }

    pub fn from_country(mut self, code: impl Into<String>) -> Self {
        self.caller_country = Some(code.into());
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn threshold(mut self, threshold: u8) -> Self {
        self.threshold = Some(threshold);
        self
    }
}

/// A candidate that survived scoring, with every signal that went into its rank.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredPlace {
    pub place: PlaceRecord,
    /// 0-100 text similarity
    pub fuzzy_score: u8,
    /// 0-1 closeness to the caller; 0 when no caller location was given
    pub proximity_score: f64,
    /// Great-circle distance to the caller in km, when known
    pub distance_km: Option<f64>,
    pub country_boosted: bool,
    pub fused_score: f64,
}

/// Outcome of a successful resolution.
#[derive(Debug, Clone)]
pub struct Resolution {
    pub results: Arc<Vec<ScoredPlace>>,
    pub cache_hit: bool,
}

impl Resolution {
    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    pub fn names(&self) -> Vec<&str> {
        self.results.iter().map(|s| s.place.name.as_str()).collect()
    }
}

/// A record returned by a radius search, with its distance from the center.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NearbyPlace {
    pub place: PlaceRecord,
    pub distance_km: f64,
}

// ─────────────────────────────────────────────────────────────────────────────
// LISTINGS
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CountrySummary {
    pub code: String,
    pub name: Option<String>,
    pub places: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateSummary {
    pub code: Option<String>,
    pub name: Option<String>,
    pub places: u64,
}

/// Row counts and index availability for a store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreStats {
    pub backend: String,
    pub places: u64,
    pub countries: u64,
    pub spatial_index: bool,
    pub text_index: bool,
}
