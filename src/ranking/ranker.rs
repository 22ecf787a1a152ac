//! Dense rank assignment
//!
//! Sorts scored entities by their ranking key, highest first, and numbers
//! them `1..=N`. Equal keys are ordered by `entity_id` ascending so the same
//! inputs always produce the same ranks.

use chrono::{DateTime, Utc};
use std::cmp::Ordering;

use super::scorer::ScoredEntity;
use super::types::{RankingRecord, ScopeKey};

/// Ordering used for ranking: key descending, NaN last, then id ascending
pub fn compare_scored(a: &ScoredEntity, b: &ScoredEntity) -> Ordering {
    let (ka, kb) = (a.breakdown.overall, b.breakdown.overall);
    match (ka.is_nan(), kb.is_nan()) {
        (true, false) => Ordering::Greater,
        (false, true) => Ordering::Less,
        _ => kb.partial_cmp(&ka).unwrap_or(Ordering::Equal),
    }
    .then_with(|| a.entity_id.cmp(&b.entity_id))
}

/// Assign dense 1-based ranks and build the records for one scope
pub fn assign_ranks(
    key: &ScopeKey,
    mut scored: Vec<ScoredEntity>,
    calculated_at: DateTime<Utc>,
) -> Vec<RankingRecord> {
    scored.sort_by(compare_scored);

    scored
        .into_iter()
        .enumerate()
        .map(|(idx, entity)| RankingRecord {
            entity_type: key.entity_type,
            entity_id: entity.entity_id,
            related_id: entity.related_id,
            time_window: key.time_window,
            category_scope: key.category_scope,
            rank: (idx + 1) as u32,
            overall_score: entity.breakdown.overall,
            sales_score: entity.breakdown.sales_score,
            popularity_score: entity.breakdown.popularity_score,
            metrics: entity.breakdown.metrics,
            calculated_at,
        })
        .collect()
}
