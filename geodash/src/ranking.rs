//! Rank fusion for scored candidates.
//!
//! Ordering is a strict total order, most to least important:
//! 1. fused score, descending
//! 2. raw fuzzy score, descending
//! 3. distance to the caller, ascending (unknown distance last)
//! 4. record id, ascending

use std::cmp::Ordering;

use crate::config::SearchConfig;
use crate::models::{NearbyPlace, ScoredPlace};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FusionWeights {
    pub distance_weight: f64,
    pub proximity_scale: f64,
    pub country_boost: f64,
}

impl From<&SearchConfig> for FusionWeights {
    fn from(search: &SearchConfig) -> Self {
        Self {
            distance_weight: search.distance_weight,
            proximity_scale: search.proximity_scale,
            country_boost: search.country_boost,
        }
    }
}

impl FusionWeights {
    pub fn fuse(&self, fuzzy_score: u8, proximity: f64, same_country: bool) -> f64 {
        let boost = if same_country { self.country_boost } else { 0.0 };
        f64::from(fuzzy_score) + self.distance_weight * proximity * self.proximity_scale + boost
    }
}

pub fn compare(a: &ScoredPlace, b: &ScoredPlace) -> Ordering {
    b.fused_score
        .total_cmp(&a.fused_score)
        .then_with(|| b.fuzzy_score.cmp(&a.fuzzy_score))
        .then_with(|| compare_distance(a.distance_km, b.distance_km))
        .then_with(|| a.place.id.cmp(&b.place.id))
}

fn compare_distance(a: Option<f64>, b: Option<f64>) -> Ordering {
    match (a, b) {
        (Some(a), Some(b)) => a.total_cmp(&b),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

/// Nearest first, ties by id.
pub fn by_distance(a: &NearbyPlace, b: &NearbyPlace) -> Ordering {
    a.distance_km
        .total_cmp(&b.distance_km)
        .then_with(|| a.place.id.cmp(&b.place.id))
}

/// Sort into final order and keep the first `limit`.
pub fn rank_and_trim(mut scored: Vec<ScoredPlace>, limit: usize) -> Vec<ScoredPlace> {
    scored.sort_unstable_by(compare);
    scored.truncate(limit);
    scored
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{PlaceId, PlaceRecord};

    fn scored(id: i64, fused: f64, fuzzy: u8, distance: Option<f64>) -> ScoredPlace {
        ScoredPlace {
            place: PlaceRecord {
                id: PlaceId(id),
                name: format!("City {id}"),
                ascii_name: format!("City {id}"),
                country_code: "GB".into(),
                country_name: None,
                state_code: None,
                state_name: None,
                latitude: 0.0,
                longitude: 0.0,
                population: None,
                search_rank: None,
            },
            fuzzy_score: fuzzy,
            proximity_score: 0.0,
            distance_km: distance,
            country_boosted: false,
            fused_score: fused,
        }
    }

    fn ids(places: &[ScoredPlace]) -> Vec<i64> {
        places.iter().map(|s| s.place.id.0).collect()
    }

    #[test]
    fn test_fuse() {
        let weights = FusionWeights {
            distance_weight: 0.3,
            proximity_scale: 100.0,
            country_boost: 25_000.0,
        };
        assert_eq!(weights.fuse(80, 0.0, false), 80.0);
        assert!((weights.fuse(80, 0.5, false) - 95.0).abs() < 1e-9);
        assert!((weights.fuse(80, 0.5, true) - 25_095.0).abs() < 1e-9);
    }

    #[test]
    fn test_fused_score_dominates() {
        let ranked = rank_and_trim(vec![scored(1, 80.0, 100, None), scored(2, 90.0, 70, None)], 10);
        assert_eq!(ids(&ranked), vec![2, 1]);
    }

    #[test]
    fn test_tie_break_chain() {
        let ranked = rank_and_trim(
            vec![
                scored(5, 90.0, 80, None),
                scored(4, 90.0, 80, Some(10.0)),
                scored(3, 90.0, 80, Some(5.0)),
                scored(2, 90.0, 90, Some(500.0)),
                scored(1, 90.0, 80, Some(5.0)),
            ],
            10,
        );
        assert_eq!(ids(&ranked), vec![2, 1, 3, 4, 5]);
    }

    #[test]
    fn test_order_is_independent_of_input_order() {
        let input = vec![
            scored(7, 100.0, 100, Some(3.0)),
            scored(3, 100.0, 100, Some(3.0)),
            scored(9, 100.0, 100, None),
            scored(1, 120.0, 90, None),
        ];
        let mut reversed = input.clone();
        reversed.reverse();
        assert_eq!(ids(&rank_and_trim(input, 10)), ids(&rank_and_trim(reversed, 10)));
    }

    #[test]
    fn test_trim() {
        let ranked = rank_and_trim((1..=20).map(|i| scored(i, i as f64, 50, None)).collect(), 3);
        assert_eq!(ids(&ranked), vec![20, 19, 18]);
    }
}
