//! Metric normalization
//!
//! Scales raw metric values to `[0, 1]` relative to the largest value observed
//! for the same metric among all eligible entities of one batch (one entity
//! type, one time window, one category scope). Ratings use the fixed rating
//! scale instead of the observed maximum.

use std::collections::HashMap;

use super::types::{MetricName, MetricSnapshot};

/// Default upper bound of the rating scale
pub const DEFAULT_RATING_SCALE: f64 = 5.0;

/// Per-batch normalizer holding the observed maximum of every metric
#[derive(Debug, Clone)]
pub struct Normalizer {
    maxima: HashMap<MetricName, f64>,
    rating_scale: f64,
}

impl Normalizer {
    /// Build from every snapshot in the batch
    pub fn from_snapshots<'a>(
        snapshots: impl IntoIterator<Item = &'a MetricSnapshot>,
        rating_scale: f64,
    ) -> Self {
        let mut maxima: HashMap<MetricName, f64> = HashMap::new();
        for snapshot in snapshots {
            for (metric, value) in &snapshot.metrics {
                let value = sanitize(*value);
                let max = maxima.entry(*metric).or_insert(0.0);
                if value > *max {
                    *max = value;
                }
            }
        }

        Self {
            maxima,
            rating_scale: if rating_scale.is_finite() && rating_scale > 0.0 {
                rating_scale
            } else {
                DEFAULT_RATING_SCALE
            },
        }
    }

    /// Largest observed raw value of a metric (0 when never seen)
    pub fn max_value(&self, metric: MetricName) -> f64 {
        self.maxima.get(&metric).copied().unwrap_or(0.0)
    }

    /// Normalize a raw value of `metric` to `[0, 1]`
    pub fn normalize(&self, value: f64, metric: MetricName) -> f64 {
        let value = sanitize(value);
        let denominator = if metric.is_rating() {
            self.rating_scale
        } else {
            self.max_value(metric)
        };

        if denominator <= 0.0 {
            return 0.0;
        }
        (value / denominator).clamp(0.0, 1.0)
    }

    /// Normalized value of `metric` for one snapshot
    pub fn normalized(&self, snapshot: &MetricSnapshot, metric: MetricName) -> f64 {
        self.normalize(snapshot.value(metric), metric)
    }
}

/// Negative and non-finite values count as zero
fn sanitize(value: f64) -> f64 {
    if value.is_finite() && value > 0.0 {
        value
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ranking::types::{EntityRef, EntityType, Metrics, ScopeKey, TimeWindow};

    fn snapshot(id: i64, values: &[(MetricName, f64)]) -> MetricSnapshot {
        let key = ScopeKey::global(EntityType::Artist, TimeWindow::Month);
        let metrics: Metrics = values.iter().copied().collect();
        MetricSnapshot::new(&key, EntityRef::new(id, None), metrics)
    }

    #[test]
    fn test_normalize_against_observed_max() {
        let batch = vec![
            snapshot(1, &[(MetricName::SalesCount, 10.0)]),
            snapshot(2, &[(MetricName::SalesCount, 20.0)]),
            snapshot(3, &[]),
        ];
        let normalizer = Normalizer::from_snapshots(&batch, DEFAULT_RATING_SCALE);

        assert_eq!(normalizer.max_value(MetricName::SalesCount), 20.0);
        assert_eq!(normalizer.normalized(&batch[0], MetricName::SalesCount), 0.5);
        assert_eq!(normalizer.normalized(&batch[1], MetricName::SalesCount), 1.0);
        assert_eq!(normalizer.normalized(&batch[2], MetricName::SalesCount), 0.0);
    }

    #[test]
    fn test_zero_max_guard() {
        let batch = vec![
            snapshot(1, &[(MetricName::ViewCount, 0.0)]),
            snapshot(2, &[(MetricName::ViewCount, 0.0)]),
        ];
        let normalizer = Normalizer::from_snapshots(&batch, DEFAULT_RATING_SCALE);
        for s in &batch {
            let v = normalizer.normalized(s, MetricName::ViewCount);
            assert_eq!(v, 0.0);
            assert!(!v.is_nan());
        }
    }

    #[test]
    fn test_rating_uses_fixed_scale() {
        let batch = vec![
            snapshot(1, &[(MetricName::AvgRating, 3.0)]),
            snapshot(2, &[(MetricName::AvgRating, 4.0)]),
        ];
        let normalizer = Normalizer::from_snapshots(&batch, 5.0);
        assert!((normalizer.normalized(&batch[0], MetricName::AvgRating) - 0.6).abs() < 1e-12);
        assert!((normalizer.normalized(&batch[1], MetricName::AvgRating) - 0.8).abs() < 1e-12);
    }

    #[test]
    fn test_bad_inputs_are_zero_and_results_bounded() {
        let batch = vec![snapshot(1, &[(MetricName::LikeCount, 4.0)])];
        let normalizer = Normalizer::from_snapshots(&batch, 0.0);

        assert_eq!(normalizer.normalize(-3.0, MetricName::LikeCount), 0.0);
        assert_eq!(normalizer.normalize(f64::NAN, MetricName::LikeCount), 0.0);
        // values from outside the batch never exceed 1
        assert_eq!(normalizer.normalize(40.0, MetricName::LikeCount), 1.0);
        // invalid rating scale falls back to the default
        assert_eq!(normalizer.normalize(5.0, MetricName::AvgRating), 1.0);
    }

    #[test]
    fn test_raising_a_value_never_lowers_its_normalized_value() {
        let others = [3.0, 7.0, 11.0];
        let mut previous = 0.0;
        for raw in [0.0, 1.0, 5.0, 11.0, 12.0, 50.0] {
            let mut batch: Vec<MetricSnapshot> = others
                .iter()
                .enumerate()
                .map(|(i, v)| snapshot(i as i64 + 10, &[(MetricName::ViewCount, *v)]))
                .collect();
            batch.push(snapshot(1, &[(MetricName::ViewCount, raw)]));

            let normalizer = Normalizer::from_snapshots(&batch, DEFAULT_RATING_SCALE);
            let current = normalizer.normalized(batch.last().unwrap(), MetricName::ViewCount);
            assert!(current >= previous, "{} < {} at raw {}", current, previous, raw);
            previous = current;
        }
    }
}
