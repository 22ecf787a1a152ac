//! Ranking engine
//!
//! A recompute pass for one scope key (entity type, time window, category)
//! reads metrics from a [`MetricSource`], normalizes and scores them,
//! assigns dense ranks and publishes the whole set through a
//! [`RankingStore`] in one step. Readers go through [`RankingService`],
//! which caches pages in a [`RankingCache`] invalidated on every publish.
//!
//! Passes are triggered by the [`scheduler`] (daily and trending) and by
//! completed sales, which mark keys dirty for a deferred recompute.

pub mod cache;
pub mod metrics;
pub mod normalizer;
pub mod orchestrator;
pub mod ranker;
pub mod scheduler;
pub mod scorer;
pub mod service;
pub mod source;
pub mod store;
pub mod types;
pub mod weights;

pub use cache::RankingCache;
pub use orchestrator::{EngineSettings, PassKind, RecomputeOrchestrator};
pub use service::{RankingQuery, RankingService};
pub use source::{MemoryMetricSource, MetricSource, PgMetricSource};
pub use store::{MemoryRankingStore, PgRankingStore, RankingStore};
pub use types::{EntityType, RankingPage, RankingRecord, ScopeKey, TimeWindow};
pub use weights::{FileWeightSource, StaticWeightSource, WeightConfig, WeightSource, WeightVector};
