//! Great-circle distance and the normalised proximity signal.

use crate::models::GeoPoint;

/// Mean Earth radius (IUGG), km.
pub const EARTH_RADIUS_KM: f64 = 6371.0088;

/// Haversine distance between two points, km.
pub fn haversine_km(a: GeoPoint, b: GeoPoint) -> f64 {
    let (lat1, lat2) = (a.lat.to_radians(), b.lat.to_radians());
    let d_lat = (b.lat - a.lat).to_radians();
    let d_lon = (b.lon - a.lon).to_radians();

    let h = (d_lat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (d_lon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_KM * h.sqrt().min(1.0).asin()
}

#[derive(Debug, Clone, Copy)]
pub struct ProximityScorer {
    max_relevant_distance_km: f64,
}

impl ProximityScorer {
    pub fn new(max_relevant_distance_km: f64) -> Self {
        Self {
            max_relevant_distance_km,
        }
    }

    /// 1.0 at zero distance falling linearly to 0.0 at the cutoff.
    pub fn proximity(&self, distance_km: f64) -> f64 {
        1.0 - (distance_km / self.max_relevant_distance_km).min(1.0)
    }

    /// Distance and proximity from `caller` to `target`.
    pub fn score(&self, caller: GeoPoint, target: GeoPoint) -> (f64, f64) {
        let distance = haversine_km(caller, target);
        (distance, self.proximity(distance))
    }
}

/// Latitude/longitude envelope around a center, split in two when it crosses
/// the antimeridian.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox {
    pub min_lat: f64,
    pub max_lat: f64,
    pub min_lon: f64,
    pub max_lon: f64,
}

impl BoundingBox {
    pub fn around(center: GeoPoint, radius_km: f64) -> Vec<BoundingBox> {
        let d_lat = (radius_km / EARTH_RADIUS_KM).to_degrees();
        let min_lat = (center.lat - d_lat).max(-90.0);
        let max_lat = (center.lat + d_lat).min(90.0);

        let cos_lat = center.lat.to_radians().cos();
        if min_lat <= -90.0 || max_lat >= 90.0 || cos_lat < 1e-9 {
            return vec![BoundingBox {
                min_lat,
                max_lat,
                min_lon: -180.0,
                max_lon: 180.0,
            }];
        }

        let d_lon = (radius_km / (EARTH_RADIUS_KM * cos_lat)).to_degrees();
        if d_lon >= 180.0 {
            return vec![BoundingBox {
                min_lat,
                max_lat,
                min_lon: -180.0,
                max_lon: 180.0,
            }];
        }

        let min_lon = center.lon - d_lon;
        let max_lon = center.lon + d_lon;
        if min_lon < -180.0 {
            vec![
                BoundingBox { min_lat, max_lat, min_lon: min_lon + 360.0, max_lon: 180.0 },
                BoundingBox { min_lat, max_lat, min_lon: -180.0, max_lon },
            ]
        } else if max_lon > 180.0 {
            vec![
                BoundingBox { min_lat, max_lat, min_lon, max_lon: 180.0 },
                BoundingBox { min_lat, max_lat, min_lon: -180.0, max_lon: max_lon - 360.0 },
            ]
        } else {
            vec![BoundingBox { min_lat, max_lat, min_lon, max_lon }]
        }
    }
}
