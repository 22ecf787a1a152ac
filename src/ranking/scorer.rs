//! Weighted scoring
//!
//! Turns a batch of metric snapshots into scores:
//! - **Weighted**: `overall = Σ weight[m] · normalize(raw[m])` plus two fixed
//!   sub-scores (sales, popularity) on a 0–100 scale
//! - **Count**: taxonomy terms rank by their association count alone

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use super::normalizer::Normalizer;
use super::types::{EntityType, MetricName, MetricSnapshot, Metrics};
use super::weights::WeightVector;

/// Scores computed for one entity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreBreakdown {
    pub overall: f64,
    pub sales_score: f64,
    pub popularity_score: f64,
    pub metrics: Metrics,
}

/// A snapshot together with its scores, ready for ranking
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredEntity {
    pub entity_id: i64,
    pub related_id: Option<i64>,
    pub breakdown: ScoreBreakdown,
}

/// Fixed linear combinations behind the sales and popularity sub-scores
#[derive(Debug, Clone, Copy)]
pub struct SubScoreRatios {
    pub sales: &'static [(MetricName, f64)],
    pub popularity: &'static [(MetricName, f64)],
}

const SALES_RATIOS: &[(MetricName, f64)] = &[
    (MetricName::SalesCount, 0.6),
    (MetricName::SalesRevenue, 0.4),
];

const ARTIST_POPULARITY: &[(MetricName, f64)] =
    &[(MetricName::ViewCount, 0.7), (MetricName::AvgRating, 0.3)];

const ARTWORK_POPULARITY: &[(MetricName, f64)] = &[
    (MetricName::ViewCount, 0.5),
    (MetricName::LikeCount, 0.3),
    (MetricName::ShareCount, 0.2),
];

const CATEGORY_POPULARITY: &[(MetricName, f64)] = &[(MetricName::ViewCount, 1.0)];

/// Sub-score ratios for an entity type, `None` for count-only taxonomies
pub fn sub_score_ratios(entity_type: EntityType) -> Option<SubScoreRatios> {
    match entity_type {
        EntityType::Artist => Some(SubScoreRatios {
            sales: SALES_RATIOS,
            popularity: ARTIST_POPULARITY,
        }),
        EntityType::Artwork => Some(SubScoreRatios {
            sales: SALES_RATIOS,
            popularity: ARTWORK_POPULARITY,
        }),
        EntityType::Category => Some(SubScoreRatios {
            sales: SALES_RATIOS,
            popularity: CATEGORY_POPULARITY,
        }),
        EntityType::Tag | EntityType::Model => None,
    }
}

/// How a batch is scored
#[derive(Debug, Clone, PartialEq)]
pub enum ScoringStrategy {
    Weighted(WeightVector),
    Count,
}

/// Weighted scorer for one batch
pub struct WeightedScorer<'a> {
    entity_type: EntityType,
    weights: &'a WeightVector,
    normalizer: &'a Normalizer,
}

impl<'a> WeightedScorer<'a> {
    pub fn new(entity_type: EntityType, weights: &'a WeightVector, normalizer: &'a Normalizer) -> Self {
        Self {
            entity_type,
            weights,
            normalizer,
        }
    }

    pub fn score(&self, snapshot: &MetricSnapshot) -> ScoreBreakdown {
        let overall = self
            .weights
            .iter()
            .map(|(metric, weight)| weight * self.normalizer.normalized(snapshot, metric))
            .sum();

        let (sales_score, popularity_score) = match sub_score_ratios(self.entity_type) {
            Some(ratios) => (
                self.combine(snapshot, ratios.sales),
                self.combine(snapshot, ratios.popularity),
            ),
            None => (0.0, 0.0),
        };

        ScoreBreakdown {
            overall,
            sales_score,
            popularity_score,
            metrics: snapshot.metrics.clone(),
        }
    }

    fn combine(&self, snapshot: &MetricSnapshot, ratios: &[(MetricName, f64)]) -> f64 {
        ratios
            .iter()
            .map(|(metric, ratio)| ratio * self.normalizer.normalized(snapshot, *metric))
            .sum::<f64>()
            * 100.0
    }
}

/// Ranks by the number of qualifying associations; no normalization
pub struct CountRanker;

impl CountRanker {
    pub fn score(snapshot: &MetricSnapshot) -> ScoreBreakdown {
        let count = snapshot.value(MetricName::AssociationCount);
        ScoreBreakdown {
            overall: if count.is_finite() { count.max(0.0) } else { 0.0 },
            sales_score: 0.0,
            popularity_score: 0.0,
            metrics: snapshot.metrics.clone(),
        }
    }
}

/// Score a whole batch in parallel
///
/// The normalizer is built from the full batch first, so every entity is
/// measured against the same maxima.
pub fn score_batch(
    entity_type: EntityType,
    strategy: &ScoringStrategy,
    snapshots: &[MetricSnapshot],
    rating_scale: f64,
) -> Vec<ScoredEntity> {
    match strategy {
        ScoringStrategy::Weighted(weights) => {
            let normalizer = Normalizer::from_snapshots(snapshots, rating_scale);
            let scorer = WeightedScorer::new(entity_type, weights, &normalizer);
            snapshots
                .par_iter()
                .map(|s| ScoredEntity {
                    entity_id: s.entity_id,
                    related_id: s.related_id,
                    breakdown: scorer.score(s),
                })
                .collect()
        }
        ScoringStrategy::Count => snapshots
            .par_iter()
            .map(|s| ScoredEntity {
                entity_id: s.entity_id,
                related_id: s.related_id,
                breakdown: CountRanker::score(s),
            })
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ranking::normalizer::DEFAULT_RATING_SCALE;
    use crate::ranking::types::{EntityRef, ScopeKey, TimeWindow};
    use crate::ranking::weights::WeightConfig;

    fn artist(id: i64, sales: f64, revenue: f64, artworks: f64, views: f64, rating: f64) -> MetricSnapshot {
        let key = ScopeKey::global(EntityType::Artist, TimeWindow::Month);
        let metrics: Metrics = [
            (MetricName::SalesCount, sales),
            (MetricName::SalesRevenue, revenue),
            (MetricName::ArtworkCount, artworks),
            (MetricName::ViewCount, views),
            (MetricName::AvgRating, rating),
        ]
        .into_iter()
        .collect();
        MetricSnapshot::new(&key, EntityRef::new(id, None), metrics)
    }

    fn overall_of(scored: &[ScoredEntity], id: i64) -> f64 {
        scored
            .iter()
            .find(|s| s.entity_id == id)
            .map(|s| s.breakdown.overall)
            .unwrap()
    }

    #[test]
    fn test_artist_worked_scenario() {
        let batch = vec![
            artist(1, 10.0, 1000.0, 5.0, 200.0, 4.5),
            artist(2, 20.0, 500.0, 2.0, 500.0, 3.0),
            artist(3, 5.0, 2000.0, 10.0, 100.0, 5.0),
        ];
        let strategy = ScoringStrategy::Weighted(WeightConfig::default().artist);
        let scored = score_batch(EntityType::Artist, &strategy, &batch, DEFAULT_RATING_SCALE);

        assert!((overall_of(&scored, 1) - 52.5).abs() < 1e-9);
        assert!((overall_of(&scored, 2) - 65.5).abs() < 1e-9);
        assert!((overall_of(&scored, 3) - 61.75).abs() < 1e-9);
    }

    #[test]
    fn test_artist_sub_scores() {
        let batch = vec![
            artist(1, 10.0, 1000.0, 5.0, 200.0, 4.5),
            artist(2, 20.0, 500.0, 2.0, 500.0, 3.0),
            artist(3, 5.0, 2000.0, 10.0, 100.0, 5.0),
        ];
        let strategy = ScoringStrategy::Weighted(WeightConfig::default().artist);
        let scored = score_batch(EntityType::Artist, &strategy, &batch, DEFAULT_RATING_SCALE);
        let a = scored.iter().find(|s| s.entity_id == 1).unwrap();

        // 0.6·0.5 + 0.4·0.5 = 0.5
        assert!((a.breakdown.sales_score - 50.0).abs() < 1e-9);
        // 0.7·0.4 + 0.3·0.9 = 0.55
        assert!((a.breakdown.popularity_score - 55.0).abs() < 1e-9);
    }

    #[test]
    fn test_unweighted_metrics_do_not_contribute() {
        let key = ScopeKey::global(EntityType::Artist, TimeWindow::Week);
        let mut metrics = Metrics::new();
        metrics.insert(MetricName::FollowerCount, 1_000.0);
        let batch = vec![MetricSnapshot::new(&key, EntityRef::new(1, None), metrics)];

        let strategy = ScoringStrategy::Weighted(WeightConfig::default().artist);
        let scored = score_batch(EntityType::Artist, &strategy, &batch, DEFAULT_RATING_SCALE);
        assert_eq!(scored[0].breakdown.overall, 0.0);
    }

    #[test]
    fn test_count_ranker_uses_association_count() {
        let key = ScopeKey::global(EntityType::Tag, TimeWindow::Year);
        let mut metrics = Metrics::new();
        metrics.insert(MetricName::AssociationCount, 17.0);
        let batch = vec![MetricSnapshot::new(&key, EntityRef::new(9, None), metrics)];

        let scored = score_batch(EntityType::Tag, &ScoringStrategy::Count, &batch, 5.0);
        assert_eq!(scored[0].breakdown.overall, 17.0);
        assert_eq!(scored[0].breakdown.sales_score, 0.0);
        assert_eq!(scored[0].breakdown.popularity_score, 0.0);
    }

    #[test]
    fn test_monotonic_in_positively_weighted_metric() {
        let strategy = ScoringStrategy::Weighted(WeightConfig::default().artist);
        let mut previous = f64::MIN;
        for sales in [0.0, 4.0, 10.0, 19.0, 25.0, 100.0] {
            let batch = vec![
                artist(1, sales, 1000.0, 5.0, 200.0, 4.5),
                artist(2, 20.0, 500.0, 2.0, 500.0, 3.0),
                artist(3, 5.0, 2000.0, 10.0, 100.0, 5.0),
            ];
            let scored = score_batch(EntityType::Artist, &strategy, &batch, DEFAULT_RATING_SCALE);
            let current = overall_of(&scored, 1);
            assert!(current >= previous);
            previous = current;
        }
    }
}
