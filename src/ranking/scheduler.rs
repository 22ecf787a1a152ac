//! Periodic recompute triggers
//!
//! One task per pass kind: the daily pass refreshes every window, the
//! trending pass refreshes the short windows more often. Both stop on the
//! shared shutdown broadcast.

use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

use super::orchestrator::{PassKind, RecomputeOrchestrator};

/// When and how often one pass kind runs
#[derive(Debug, Clone, Copy)]
pub struct Schedule {
    pub kind: PassKind,
    pub every: Duration,
    /// Run once immediately instead of waiting a full period
    pub run_on_start: bool,
}

impl Schedule {
    pub fn daily(every: Duration) -> Self {
        Self {
            kind: PassKind::Daily,
            every,
            run_on_start: false,
        }
    }

    pub fn trending(every: Duration) -> Self {
        Self {
            kind: PassKind::Trending,
            every,
            run_on_start: false,
        }
    }

    pub fn run_on_start(mut self, run: bool) -> Self {
        self.run_on_start = run;
        self
    }
}

/// Spawn the loop driving one schedule
pub fn spawn_scheduler(
    orchestrator: RecomputeOrchestrator,
    schedule: Schedule,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(schedule.every);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        // First tick completes immediately
        if !schedule.run_on_start {
            interval.tick().await;
        }

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    info!("📊 Running scheduled {:?} ranking pass...", schedule.kind);
                    let summary = orchestrator.run_scheduled_pass(schedule.kind).await;
                    if summary.failed() > 0 {
                        warn!(
                            "⚠️ {:?} pass left {} ranking sets stale",
                            schedule.kind,
                            summary.failed()
                        );
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("{:?} ranking scheduler shutting down", schedule.kind);
                    break;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ranking::cache::RankingCache;
    use crate::ranking::orchestrator::EngineSettings;
    use crate::ranking::source::MemoryMetricSource;
    use crate::ranking::store::{MemoryRankingStore, RankingStore};
    use crate::ranking::types::{EntityType, ScopeKey, TimeWindow};
    use crate::ranking::weights::StaticWeightSource;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_run_on_start_then_shutdown() {
        let store = Arc::new(MemoryRankingStore::new());
        let orchestrator = RecomputeOrchestrator::new(
            Arc::new(MemoryMetricSource::new()),
            store.clone(),
            Arc::new(RankingCache::default()),
            Arc::new(StaticWeightSource::default()),
            EngineSettings::default(),
        )
        .await
        .unwrap();

        let (tx, rx) = broadcast::channel(1);
        let handle = spawn_scheduler(
            orchestrator,
            Schedule::trending(Duration::from_secs(3600)).run_on_start(true),
            rx,
        );

        let key = ScopeKey::global(EntityType::Artist, TimeWindow::Week);
        for _ in 0..100 {
            if store.current_generation(&key).await.unwrap().is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(store.current_generation(&key).await.unwrap().is_some());
        // trending pass does not touch the daily-only windows
        let day = ScopeKey::global(EntityType::Artist, TimeWindow::Day);
        assert!(store.current_generation(&day).await.unwrap().is_none());

        tx.send(()).unwrap();
        handle.await.unwrap();
    }
}
