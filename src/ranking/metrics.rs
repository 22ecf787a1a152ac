//! Engine instrumentation
//!
//! Thin wrappers over the `metrics` facade so call sites stay one line, plus a
//! timer that logs slow operations. Nothing is recorded unless an exporter is
//! installed (see the `prometheus` feature).

use std::time::{Duration, Instant};

use super::types::ScopeKey;

pub fn record_recompute(key: &ScopeKey, outcome: &'static str, duration: Duration) {
    metrics::counter!(
        "rankings_recompute_total",
        "entity_type" => key.entity_type.as_str(),
        "time_window" => key.time_window.as_str(),
        "outcome" => outcome
    )
    .increment(1);
    metrics::histogram!(
        "rankings_recompute_duration_seconds",
        "entity_type" => key.entity_type.as_str()
    )
    .record(duration.as_secs_f64());
}

pub fn record_ranked(key: &ScopeKey, ranked: usize, zero_filled: usize) {
    metrics::gauge!(
        "rankings_set_size",
        "entity_type" => key.entity_type.as_str(),
        "time_window" => key.time_window.as_str()
    )
    .set(ranked as f64);
    if zero_filled > 0 {
        metrics::counter!(
            "rankings_zero_filled_total",
            "entity_type" => key.entity_type.as_str()
        )
        .increment(zero_filled as u64);
    }
}

pub fn record_cache_lookup(hit: bool) {
    let outcome = if hit { "hit" } else { "miss" };
    metrics::counter!("rankings_cache_lookups_total", "outcome" => outcome).increment(1);
}

pub fn record_cache_invalidation(scope: &'static str, removed: usize) {
    metrics::counter!("rankings_cache_invalidations_total", "scope" => scope).increment(1);
    metrics::counter!("rankings_cache_evicted_total").increment(removed as u64);
}

pub fn record_sale_event() {
    metrics::counter!("rankings_sale_events_total").increment(1);
}

/// Measures an operation and logs it on drop
pub struct PerformanceTimer {
    start: Instant,
    label: String,
}

impl PerformanceTimer {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            start: Instant::now(),
            label: label.into(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }

    pub fn log_if_slow(&self, threshold_ms: u64) {
        let elapsed = self.elapsed_ms();
        if elapsed > threshold_ms {
            tracing::warn!(
                "⚠️ Slow operation: {} took {}ms (threshold: {}ms)",
                self.label,
                elapsed,
                threshold_ms
            );
        }
    }
}

impl Drop for PerformanceTimer {
    fn drop(&mut self) {
        tracing::debug!("⏱️ {} completed in {}ms", self.label, self.elapsed_ms());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ranking::types::{EntityType, TimeWindow};

    #[test]
    fn test_timer_measures_elapsed() {
        let timer = PerformanceTimer::new("noop");
        std::thread::sleep(Duration::from_millis(2));
        assert!(timer.elapsed() >= Duration::from_millis(2));
        timer.log_if_slow(10_000);
    }

    #[test]
    fn test_recording_without_exporter_is_noop() {
        let key = ScopeKey::global(EntityType::Tag, TimeWindow::Day);
        record_recompute(&key, "ok", Duration::from_millis(5));
        record_ranked(&key, 3, 1);
        record_cache_lookup(true);
        record_cache_invalidation("scope", 4);
    }
}
