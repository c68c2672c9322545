//! Recommendation scoring over the collection graph.
//!
//! Candidates are items the user does not own, reachable through a collector
//! who shares at least one item with them. Each candidate blends global
//! popularity (`also_collected_count`) with personalized affinity (how many
//! sharing collectors also collected it); `boost` tilts the blend between
//! the two. The listing-derived popularity is a lower bound (Bandcamp
//! samples "also collected by" pages), so it is treated as relative, never
//! exact.

use std::collections::{HashMap, HashSet};

use cratedig_common::{CrateDigError, Recommendation, Result};

use crate::store::GraphStore;

pub const MIN_BOOST: f64 = 1.0;
pub const MAX_BOOST: f64 = 5.0;
pub const DEFAULT_BOOST: f64 = 2.0;

/// Responses are capped at the strongest candidates.
const MAX_RESULTS: usize = 50;

/// Map the UI's linear 0-100 slider onto the boost range through an
/// exponential curve: position 0 → 1, position 100 → 5.
pub fn boost_from_slider(position: f64) -> f64 {
    (MAX_BOOST.ln() / 100.0 * position.clamp(0.0, 100.0)).exp()
}

/// Blend popularity and affinity. Strictly increasing in both inputs;
/// raising `boost` raises the affinity exponent and lowers the popularity
/// exponent. The +1 keeps zero-popularity candidates ordered by affinity
/// instead of collapsing to zero.
fn blend_score(popularity: i64, affinity: u32, boost: f64) -> f64 {
    (popularity as f64 + 1.0).powf(1.0 / boost) * (affinity as f64).powf(boost)
}

struct Candidate {
    item_id: i64,
    popularity: i64,
    score: f64,
}

/// Rank candidates: score descending, then popularity descending, then item
/// id ascending so equal scores order deterministically.
fn rank(affinity: &HashMap<i64, u32>, popularity: &HashMap<i64, i64>, boost: f64) -> Vec<Candidate> {
    let mut candidates: Vec<Candidate> = affinity
        .iter()
        .map(|(&item_id, &affinity)| {
            let popularity = popularity.get(&item_id).copied().unwrap_or(0);
            Candidate {
                item_id,
                popularity,
                score: blend_score(popularity, affinity, boost),
            }
        })
        .collect();
    candidates.sort_unstable_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(b.popularity.cmp(&a.popularity))
            .then(a.item_id.cmp(&b.item_id))
    });
    candidates
}

/// Score and rank uncollected items for a fully-crawled user.
pub async fn recommendations_for(
    store: &GraphStore,
    username: &str,
    boost: f64,
) -> Result<Vec<Recommendation>> {
    let boost = boost.clamp(MIN_BOOST, MAX_BOOST);
    let fan_id = store
        .fan_id_for_username(username)
        .await?
        .ok_or_else(|| CrateDigError::UnknownUser(username.to_string()))?;

    let owned: HashSet<i64> = store.user_item_ids(fan_id).await?.into_iter().collect();
    if owned.is_empty() {
        return Ok(Vec::new());
    }

    // Group neighbor edges per collector; every collector returned shares at
    // least one item with the user.
    let mut by_fan: HashMap<i64, HashSet<i64>> = HashMap::new();
    for (neighbor, item_id) in store.neighbor_edges(fan_id).await? {
        by_fan.entry(neighbor).or_default().insert(item_id);
    }

    // Affinity: for each candidate, the number of distinct sharing collectors
    // who collected it.
    let mut affinity: HashMap<i64, u32> = HashMap::new();
    for items in by_fan.values() {
        for item_id in items {
            if !owned.contains(item_id) {
                *affinity.entry(*item_id).or_default() += 1;
            }
        }
    }
    if affinity.is_empty() {
        return Ok(Vec::new());
    }

    let candidate_ids: Vec<i64> = affinity.keys().copied().collect();
    let rows = store.items_by_ids(&candidate_ids).await?;
    let popularity: HashMap<i64, i64> = rows
        .iter()
        .map(|item| (item.item_id, item.also_collected_count))
        .collect();
    let by_id: HashMap<i64, _> = rows.into_iter().map(|item| (item.item_id, item)).collect();

    let recommendations = rank(&affinity, &popularity, boost)
        .into_iter()
        .filter_map(|candidate| {
            let item = by_id.get(&candidate.item_id)?;
            Some(Recommendation {
                item_title: item.item_title.clone(),
                item_url: item.item_url.clone(),
                band_name: item.band_name.clone(),
                also_collected_count: item.also_collected_count,
                score: candidate.score.floor() as i64,
            })
        })
        .take(MAX_RESULTS)
        .collect();

    Ok(recommendations)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slider_endpoints_and_midpoint() {
        assert!((boost_from_slider(0.0) - 1.0).abs() < 1e-9);
        assert!((boost_from_slider(100.0) - 5.0).abs() < 1e-9);
        assert!((boost_from_slider(50.0) - 5.0_f64.sqrt()).abs() < 1e-9);
    }

    #[test]
    fn slider_clamps_out_of_range_positions() {
        assert!((boost_from_slider(-10.0) - 1.0).abs() < 1e-9);
        assert!((boost_from_slider(250.0) - 5.0).abs() < 1e-9);
    }

    #[test]
    fn score_increases_in_popularity_and_affinity() {
        for boost in [1.0, 2.0, 5.0] {
            assert!(blend_score(10, 3, boost) > blend_score(9, 3, boost));
            assert!(blend_score(10, 4, boost) > blend_score(10, 3, boost));
        }
    }

    #[test]
    fn zero_popularity_candidates_still_rank_by_affinity() {
        assert!(blend_score(0, 4, 2.0) > blend_score(0, 2, 2.0));
        assert!(blend_score(0, 1, 2.0) > 0.0);
    }

    #[test]
    fn higher_boost_favors_affinity_over_popularity() {
        // Low boost: the popular candidate wins. High boost: the high-affinity
        // candidate overtakes it.
        let popular = (1000, 2);
        let similar = (10, 6);
        assert!(blend_score(popular.0, popular.1, 1.0) > blend_score(similar.0, similar.1, 1.0));
        assert!(blend_score(similar.0, similar.1, 5.0) > blend_score(popular.0, popular.1, 5.0));
    }

    #[test]
    fn boost_never_demotes_higher_affinity_at_equal_popularity() {
        for boost in [1.0, 1.5, 2.0, 3.0, 5.0] {
            assert!(blend_score(50, 5, boost) > blend_score(50, 2, boost));
        }
    }

    #[test]
    fn rank_is_deterministic_and_breaks_ties_by_popularity_then_id() {
        let affinity = HashMap::from([(1, 2), (2, 2), (3, 2)]);
        // Items 1 and 3 tie on score inputs entirely; 2 is more popular.
        let popularity = HashMap::from([(1, 7), (2, 9), (3, 7)]);
        let first = rank(&affinity, &popularity, 2.0);
        let second = rank(&affinity, &popularity, 2.0);
        let order: Vec<i64> = first.iter().map(|c| c.item_id).collect();
        assert_eq!(order, vec![2, 1, 3]);
        assert_eq!(
            order,
            second.iter().map(|c| c.item_id).collect::<Vec<i64>>()
        );
    }
}
