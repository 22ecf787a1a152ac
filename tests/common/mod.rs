#![allow(dead_code)]

use market_rankings::ranking::types::{MetricName, Metrics};
use market_rankings::ranking::{
    EngineSettings, MemoryMetricSource, MemoryRankingStore, RankingCache, RecomputeOrchestrator,
    StaticWeightSource,
};
use market_rankings::ranking::{EntityType, TimeWindow};
use std::sync::Arc;
use std::time::Duration;

pub const ARTIST_A: i64 = 1;
pub const ARTIST_B: i64 = 2;
pub const ARTIST_C: i64 = 3;

pub struct Engine {
    pub source: Arc<MemoryMetricSource>,
    pub store: Arc<MemoryRankingStore>,
    pub cache: Arc<RankingCache>,
    pub orchestrator: RecomputeOrchestrator,
}

pub fn artist_metrics(sales: f64, revenue: f64, artworks: f64, views: f64, rating: f64) -> Metrics {
    [
        (MetricName::SalesCount, sales),
        (MetricName::SalesRevenue, revenue),
        (MetricName::ArtworkCount, artworks),
        (MetricName::ViewCount, views),
        (MetricName::AvgRating, rating),
    ]
    .into_iter()
    .collect()
}

/// Three artists with monthly metrics; expected order B, C, A
pub async fn seed_artists(source: &MemoryMetricSource) {
    let month = TimeWindow::Month;
    source
        .set_metrics(EntityType::Artist, ARTIST_A, month, artist_metrics(10.0, 1000.0, 5.0, 200.0, 4.5))
        .await;
    source
        .set_metrics(EntityType::Artist, ARTIST_B, month, artist_metrics(20.0, 500.0, 2.0, 500.0, 3.0))
        .await;
    source
        .set_metrics(EntityType::Artist, ARTIST_C, month, artist_metrics(5.0, 2000.0, 10.0, 100.0, 5.0))
        .await;
}

pub async fn engine_with_store(store: MemoryRankingStore) -> Engine {
    let source = Arc::new(MemoryMetricSource::new());
    let store = Arc::new(store);
    let cache = Arc::new(RankingCache::default());
    let orchestrator = RecomputeOrchestrator::new(
        source.clone(),
        store.clone(),
        cache.clone(),
        Arc::new(StaticWeightSource::default()),
        EngineSettings {
            deferred_delay: Duration::from_millis(20),
            deferred_jitter: Duration::from_millis(5),
            ..EngineSettings::default()
        },
    )
    .await
    .expect("orchestrator");

    Engine {
        source,
        store,
        cache,
        orchestrator,
    }
}

pub async fn engine() -> Engine {
    engine_with_store(MemoryRankingStore::new()).await
}
