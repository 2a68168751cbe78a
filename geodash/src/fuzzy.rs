//! Fuzzy name matching.
//!
//! Scores are `floor(100 * (|q| - min(d, |q|)) / |q|)` where `d` is the
//! optimal-string-alignment distance between the folded query `q` and the
//! folded candidate. For a fixed query the score only falls as `d` grows, and
//! only an exact folded match reaches 100.

use crate::models::PlaceRecord;
use crate::text;

/// Thresholds below this let through mostly noise.
pub const MIN_RECOMMENDED_THRESHOLD: u8 = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchMode {
    /// Edit-distance similarity
    Fuzzy,
    /// 100 when the candidate starts with the query, 0 otherwise
    Prefix,
}

#[derive(Debug, Clone, Copy)]
pub struct FuzzyMatcher {
    mode: MatchMode,
}

impl FuzzyMatcher {
    pub fn new(fuzzy_search: bool) -> Self {
        let mode = if fuzzy_search {
            MatchMode::Fuzzy
        } else {
            MatchMode::Prefix
        };
        Self { mode }
    }

    pub fn mode(&self) -> MatchMode {
        self.mode
    }

    /// Score an already-folded query against a raw candidate name.
    pub fn score(&self, folded_query: &str, candidate: &str) -> u8 {
        let folded = text::fold(candidate);
        match self.mode {
            MatchMode::Fuzzy => similarity(folded_query, &folded),
            MatchMode::Prefix => {
                if !folded_query.is_empty() && folded.starts_with(folded_query) {
                    100
                } else {
                    0
                }
            }
        }
    }

    /// Best score over the record's name variants.
    pub fn score_record(&self, folded_query: &str, record: &PlaceRecord) -> u8 {
        record
            .names()
            .iter()
            .map(|name| self.score(folded_query, name))
            .max()
            .unwrap_or(0)
    }
}

/// Length-normalised similarity between two folded strings, 0-100.
pub fn similarity(query: &str, candidate: &str) -> u8 {
    let q_len = query.chars().count();
    if q_len == 0 {
        return if candidate.is_empty() { 100 } else { 0 };
    }
    match edit_distance_bounded(query, candidate, q_len) {
        Some(d) => ((100 * (q_len - d)) / q_len) as u8,
        None => 0,
    }
}

/// Damerau-Levenshtein edit distance (optimal string alignment) with threshold pruning.
/// Counts insertions, deletions, substitutions, and adjacent transpositions each as 1 edit.
/// Returns `Some(distance)` if distance <= max_dist, `None` otherwise.
pub fn edit_distance_bounded(a: &str, b: &str, max_dist: usize) -> Option<usize> {
    let a_chars: Vec<char> = a.chars().collect();
    let b_chars: Vec<char> = b.chars().collect();
    let m = a_chars.len();
    let n = b_chars.len();

    if m.abs_diff(n) > max_dist {
        return None;
    }

    let mut prev2 = vec![0usize; n + 1];
    let mut prev: Vec<usize> = (0..=n).collect();
    let mut curr = vec![0usize; n + 1];

    for i in 1..=m {
        curr[0] = i;
        let mut row_min = curr[0];

        for j in 1..=n {
            let cost = usize::from(a_chars[i - 1] != b_chars[j - 1]);
            curr[j] = (prev[j] + 1).min(curr[j - 1] + 1).min(prev[j - 1] + cost);

            if i >= 2
                && j >= 2
                && a_chars[i - 1] == b_chars[j - 2]
                && a_chars[i - 2] == b_chars[j - 1]
            {
                curr[j] = curr[j].min(prev2[j - 2] + 1);
            }

            row_min = row_min.min(curr[j]);
        }

        if row_min > max_dist {
            return None;
        }

        std::mem::swap(&mut prev2, &mut prev);
        std::mem::swap(&mut prev, &mut curr);
    }

    let result = prev[n];
    (result <= max_dist).then_some(result)
}
