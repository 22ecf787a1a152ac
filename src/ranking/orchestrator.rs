//! Recompute orchestration
//!
//! A pass for one [`ScopeKey`] runs through these steps:
//!
//! 1. enumerate eligible entities from the [`MetricSource`]
//! 2. fetch metrics concurrently; failed fetches are zero-filled and reported
//! 3. normalize, score and rank on the blocking pool (rayon)
//! 4. swap the new generation into the [`RankingStore`]
//! 5. invalidate the cached pages of the key
//!
//! Passes are serialized per key. Sale events never recompute inline: they
//! mark keys dirty and schedule a single deferred flush.

use chrono::Utc;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::cache::RankingCache;
use super::metrics::{record_ranked, record_recompute, record_sale_event, PerformanceTimer};
use super::normalizer::DEFAULT_RATING_SCALE;
use super::ranker::assign_ranks;
use super::scorer::{score_batch, ScoringStrategy};
use super::source::MetricSource;
use super::store::RankingStore;
use super::types::{EntityRef, EntityType, MetricSnapshot, ScopeKey, TimeWindow, GLOBAL_SCOPE};
use super::weights::{WeightConfig, WeightSource, WeightVector};
use crate::error::{Error, Result};

/// Concurrent metric fetches per pass
pub const DEFAULT_FETCH_CONCURRENCY: usize = 16;

/// Scope keys recomputed at the same time during a batch pass
const KEY_CONCURRENCY: usize = 4;

/// How category rankings are computed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CategoryScoring {
    /// Rank by number of associated artworks in the window
    #[default]
    Count,
    /// Rank by the weighted category score
    Weighted,
}

impl FromStr for CategoryScoring {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "count" => Ok(CategoryScoring::Count),
            "weighted" => Ok(CategoryScoring::Weighted),
            _ => Err(Error::invalid_parameter("category_scoring", s)),
        }
    }
}

/// Tunables of the orchestrator
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub rating_scale: f64,
    pub category_scoring: CategoryScoring,
    pub fetch_concurrency: usize,
    pub deferred_delay: Duration,
    pub deferred_jitter: Duration,
    pub trending_windows: Vec<TimeWindow>,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            rating_scale: DEFAULT_RATING_SCALE,
            category_scoring: CategoryScoring::Count,
            fetch_concurrency: DEFAULT_FETCH_CONCURRENCY,
            deferred_delay: Duration::from_secs(60),
            deferred_jitter: Duration::from_secs(10),
            trending_windows: vec![TimeWindow::Week, TimeWindow::Month],
        }
    }
}

/// Lifecycle of a scope key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PassState {
    Idle,
    Computing,
    Persisting,
}

impl fmt::Display for PassState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PassState::Idle => "idle",
            PassState::Computing => "computing",
            PassState::Persisting => "persisting",
        };
        f.write_str(s)
    }
}

/// Scheduled pass flavours
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PassKind {
    /// Every entity type across every window
    Daily,
    /// Every entity type across the trending windows
    Trending,
}

/// An entity whose metrics could not be read and were zero-filled
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityFailure {
    pub entity_id: i64,
    pub reason: String,
}

/// Outcome of one recompute pass
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecomputeReport {
    pub run_id: Uuid,
    pub key: ScopeKey,
    pub generation: u64,
    pub ranked: usize,
    pub succeeded: usize,
    pub zero_filled: Vec<EntityFailure>,
    pub duration_ms: u64,
}

/// A scope key whose pass failed
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyFailure {
    pub key: ScopeKey,
    pub reason: String,
}

/// Outcome of a batch of passes
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PassSummary {
    pub reports: Vec<RecomputeReport>,
    pub failures: Vec<KeyFailure>,
    pub duration_ms: u64,
}

impl PassSummary {
    pub fn succeeded(&self) -> usize {
        self.reports.len()
    }

    pub fn failed(&self) -> usize {
        self.failures.len()
    }

    pub fn report(&self, key: &ScopeKey) -> Option<&RecomputeReport> {
        self.reports.iter().find(|r| r.key == *key)
    }
}

struct Inner {
    source: Arc<dyn MetricSource>,
    store: Arc<dyn RankingStore>,
    cache: Arc<RankingCache>,
    weight_source: Arc<dyn WeightSource>,
    /// Last loaded weights with API overrides applied
    weights: RwLock<WeightConfig>,
    overrides: RwLock<HashMap<EntityType, WeightVector>>,
    settings: EngineSettings,
    key_locks: Mutex<HashMap<ScopeKey, Arc<Mutex<()>>>>,
    states: RwLock<HashMap<ScopeKey, PassState>>,
    /// Scoped keys that have been computed at least once
    known_keys: RwLock<BTreeSet<ScopeKey>>,
    dirty: Mutex<BTreeSet<ScopeKey>>,
    flush_scheduled: AtomicBool,
    tracker: TaskTracker,
    cancel: CancellationToken,
}

/// Drives recompute passes; cheap to clone
#[derive(Clone)]
pub struct RecomputeOrchestrator {
    inner: Arc<Inner>,
}

impl RecomputeOrchestrator {
    /// Build the orchestrator and load the initial weights
    pub async fn new(
        source: Arc<dyn MetricSource>,
        store: Arc<dyn RankingStore>,
        cache: Arc<RankingCache>,
        weight_source: Arc<dyn WeightSource>,
        settings: EngineSettings,
    ) -> Result<Self> {
        let weights = weight_source.load().await?;

        Ok(Self {
            inner: Arc::new(Inner {
                source,
                store,
                cache,
                weight_source,
                weights: RwLock::new(weights),
                overrides: RwLock::new(HashMap::new()),
                settings,
                key_locks: Mutex::new(HashMap::new()),
                states: RwLock::new(HashMap::new()),
                known_keys: RwLock::new(BTreeSet::new()),
                dirty: Mutex::new(BTreeSet::new()),
                flush_scheduled: AtomicBool::new(false),
                tracker: TaskTracker::new(),
                cancel: CancellationToken::new(),
            }),
        })
    }

    pub fn store(&self) -> Arc<dyn RankingStore> {
        self.inner.store.clone()
    }

    pub fn cache(&self) -> Arc<RankingCache> {
        self.inner.cache.clone()
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.inner.settings
    }

    // ========================================================================
    // Recompute
    // ========================================================================

    /// Recompute one scope key and publish the new set
    pub async fn recompute(
        &self,
        entity_type: EntityType,
        time_window: TimeWindow,
        category_scope: i64,
    ) -> Result<RecomputeReport> {
        self.recompute_key(ScopeKey::new(entity_type, time_window, category_scope))
            .await
    }

    #[instrument(skip(self, key), fields(key = %key))]
    pub async fn recompute_key(&self, key: ScopeKey) -> Result<RecomputeReport> {
        let lock = self.key_lock(&key).await;
        let _guard = lock.lock().await;

        // Sales arriving from here on mark the key dirty again
        self.inner.dirty.lock().await.remove(&key);

        let timer = PerformanceTimer::new(format!("recompute {}", key));
        let run_id = Uuid::new_v4();
        self.set_state(key, PassState::Computing).await;

        let result = self.run_pass(key, run_id, &timer).await;
        self.set_state(key, PassState::Idle).await;

        match result {
            Ok(report) => {
                record_recompute(&key, "ok", timer.elapsed());
                record_ranked(&key, report.ranked, report.zero_filled.len());
                if key.category_scope != GLOBAL_SCOPE {
                    self.inner.known_keys.write().await.insert(key);
                }
                timer.log_if_slow(30_000);
                info!(
                    "✅ Ranked {} {} (generation {}, {} zero-filled) in {}ms",
                    report.ranked,
                    key,
                    report.generation,
                    report.zero_filled.len(),
                    report.duration_ms
                );
                Ok(report)
            }
            Err(e) => {
                record_recompute(&key, "error", timer.elapsed());
                self.inner.dirty.lock().await.insert(key);
                error!("❌ Recompute of {} failed, keeping previous generation: {}", key, e);
                Err(e)
            }
        }
    }

    async fn run_pass(
        &self,
        key: ScopeKey,
        run_id: Uuid,
        timer: &PerformanceTimer,
    ) -> Result<RecomputeReport> {
        let entities = self
            .inner
            .source
            .eligible_entities(key.entity_type, key.time_window, key.category_scope)
            .await?;
        debug!("Run {}: {} eligible entities for {}", run_id, entities.len(), key);

        let (snapshots, zero_filled) = self.fetch_snapshots(&key, entities).await?;
        for failure in &zero_filled {
            warn!(
                "⚠️ Metrics unavailable for {} {} in {}, zero-filled: {}",
                key.entity_type, failure.entity_id, key, failure.reason
            );
        }

        let strategy = self.strategy_for(key.entity_type).await;
        let rating_scale = self.inner.settings.rating_scale;
        let calculated_at = Utc::now();

        let records = tokio::task::spawn_blocking(move || {
            let scored = score_batch(key.entity_type, &strategy, &snapshots, rating_scale);
            assign_ranks(&key, scored, calculated_at)
        })
        .await
        .map_err(|e| Error::Internal {
            source: Some(Box::new(e)),
        })?;
        let ranked = records.len();

        self.set_state(key, PassState::Persisting).await;
        let generation = self
            .inner
            .store
            .replace_set(&key, records, calculated_at)
            .await
            .map_err(|e| match e {
                Error::PersistenceFailure { .. } => e,
                other => Error::persistence(key.to_string(), other),
            })?;

        self.inner.cache.invalidate_scope(&key).await;

        Ok(RecomputeReport {
            run_id,
            key,
            generation,
            ranked,
            succeeded: ranked - zero_filled.len(),
            zero_filled,
            duration_ms: timer.elapsed_ms(),
        })
    }

    /// Fetch every entity's metrics with bounded concurrency
    async fn fetch_snapshots(
        &self,
        key: &ScopeKey,
        entities: Vec<EntityRef>,
    ) -> Result<(Vec<MetricSnapshot>, Vec<EntityFailure>)> {
        let semaphore = Arc::new(Semaphore::new(self.inner.settings.fetch_concurrency.max(1)));
        let mut set = JoinSet::new();

        for entity in entities.iter().copied() {
            let permit = semaphore.clone().acquire_owned().await.map_err(|e| Error::Internal {
                source: Some(Box::new(e)),
            })?;
            let source = self.inner.source.clone();
            let key = *key;

            set.spawn(async move {
                let _permit = permit;
                let result = source
                    .fetch_metrics(key.entity_type, entity, key.time_window, key.category_scope)
                    .await;
                (entity, result)
            });
        }

        let mut fetched: HashMap<i64, MetricSnapshot> = HashMap::with_capacity(entities.len());
        let mut failures: HashMap<i64, String> = HashMap::new();

        while let Some(res) = set.join_next().await {
            match res {
                Ok((entity, Ok(metrics))) => {
                    fetched.insert(entity.entity_id, MetricSnapshot::new(key, entity, metrics));
                }
                Ok((entity, Err(e))) => {
                    failures.insert(entity.entity_id, e.to_string());
                }
                Err(e) => error!("Metric fetch task join error: {}", e),
            }
        }

        // Every eligible entity gets a snapshot; failed ones count as all zeros
        let mut snapshots = Vec::with_capacity(entities.len());
        let mut zero_filled = Vec::new();
        for entity in entities {
            match fetched.remove(&entity.entity_id) {
                Some(snapshot) => snapshots.push(snapshot),
                None => {
                    let reason = failures
                        .remove(&entity.entity_id)
                        .unwrap_or_else(|| "metric fetch task aborted".to_string());
                    zero_filled.push(EntityFailure {
                        entity_id: entity.entity_id,
                        reason,
                    });
                    snapshots.push(MetricSnapshot::zeroed(key, entity));
                }
            }
        }
        zero_filled.sort_by_key(|f| f.entity_id);

        Ok((snapshots, zero_filled))
    }

    async fn strategy_for(&self, entity_type: EntityType) -> ScoringStrategy {
        let weighted_category = entity_type == EntityType::Category
            && self.inner.settings.category_scoring == CategoryScoring::Weighted;
        if entity_type.is_taxonomy() && !weighted_category {
            return ScoringStrategy::Count;
        }

        let weights = self.inner.weights.read().await;
        weights
            .for_entity(entity_type)
            .cloned()
            .map(ScoringStrategy::Weighted)
            .unwrap_or(ScoringStrategy::Count)
    }

    /// Recompute every entity type for `windows`, plus scoped and dirty keys in those windows
    pub async fn recompute_all(&self, windows: &[TimeWindow]) -> PassSummary {
        let keys = self.pass_keys(windows).await;
        info!("🔄 Recomputing {} ranking sets", keys.len());
        let summary = self.recompute_keys(keys).await;
        info!(
            "✅ Pass finished: {} succeeded, {} failed in {}ms",
            summary.succeeded(),
            summary.failed(),
            summary.duration_ms
        );
        summary
    }

    async fn pass_keys(&self, windows: &[TimeWindow]) -> Vec<ScopeKey> {
        let mut keys: BTreeSet<ScopeKey> = EntityType::ALL
            .iter()
            .flat_map(|et| windows.iter().map(move |w| ScopeKey::global(*et, *w)))
            .collect();

        let in_windows = |k: &&ScopeKey| windows.contains(&k.time_window);
        keys.extend(self.inner.known_keys.read().await.iter().filter(in_windows));
        keys.extend(self.inner.dirty.lock().await.iter().filter(in_windows));
        keys.into_iter().collect()
    }

    /// Recompute `keys` concurrently; one failing key does not stop the others
    pub async fn recompute_keys(&self, keys: Vec<ScopeKey>) -> PassSummary {
        let started = Instant::now();
        let semaphore = Arc::new(Semaphore::new(KEY_CONCURRENCY));
        let mut set = JoinSet::new();

        for key in keys {
            let this = self.clone();
            let semaphore = semaphore.clone();
            set.spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok();
                (key, this.recompute_key(key).await)
            });
        }

        let mut summary = PassSummary::default();
        while let Some(res) = set.join_next().await {
            match res {
                Ok((_, Ok(report))) => summary.reports.push(report),
                Ok((key, Err(e))) => summary.failures.push(KeyFailure {
                    key,
                    reason: e.to_string(),
                }),
                Err(e) => error!("Recompute task join error: {}", e),
            }
        }

        summary.reports.sort_by_key(|r| r.key);
        summary.failures.sort_by_key(|f| f.key);
        summary.duration_ms = started.elapsed().as_millis() as u64;
        summary
    }

    /// Reload weights, then run the pass
    pub async fn run_scheduled_pass(&self, kind: PassKind) -> PassSummary {
        if let Err(e) = self.reload_weights().await {
            warn!("⚠️ Weight reload failed, keeping current weights: {}", e);
        }

        let windows = match kind {
            PassKind::Daily => TimeWindow::ALL.to_vec(),
            PassKind::Trending => self.inner.settings.trending_windows.clone(),
        };
        info!("📅 Starting {:?} pass over {:?}", kind, windows);
        self.recompute_all(&windows).await
    }

    // ========================================================================
    // Sale events
    // ========================================================================

    /// Mark every ranking a completed sale can move as dirty and schedule a flush
    #[instrument(skip(self))]
    pub async fn on_sale_completed(
        &self,
        artwork_id: i64,
        amount: f64,
        buyer_id: i64,
    ) -> Result<Vec<ScopeKey>> {
        if !amount.is_finite() || amount < 0.0 {
            return Err(Error::bad_request(format!("invalid sale amount {}", amount)));
        }
        record_sale_event();

        let categories = match self.inner.source.artwork_context(artwork_id).await {
            Ok(Some(ctx)) => ctx.category_ids,
            Ok(None) => {
                warn!("Sale for unknown artwork {}, marking global rankings only", artwork_id);
                Vec::new()
            }
            Err(e) => {
                warn!(
                    "⚠️ Context lookup for artwork {} failed, marking global rankings only: {}",
                    artwork_id, e
                );
                Vec::new()
            }
        };

        let mut keys = BTreeSet::new();
        for window in TimeWindow::ALL {
            keys.insert(ScopeKey::global(EntityType::Artwork, window));
            keys.insert(ScopeKey::global(EntityType::Artist, window));
            if !categories.is_empty() {
                keys.insert(ScopeKey::global(EntityType::Category, window));
            }
            for category in &categories {
                keys.insert(ScopeKey::new(EntityType::Artwork, window, *category));
                keys.insert(ScopeKey::new(EntityType::Artist, window, *category));
            }
        }

        self.inner.dirty.lock().await.extend(keys.iter().copied());
        debug!(
            "💰 Sale of artwork {} (buyer {}, amount {}) marked {} keys dirty",
            artwork_id,
            buyer_id,
            amount,
            keys.len()
        );

        self.schedule_flush();
        Ok(keys.into_iter().collect())
    }

    /// Schedule one deferred flush; no-op while one is pending
    pub fn schedule_flush(&self) {
        if self.inner.flush_scheduled.swap(true, Ordering::SeqCst) {
            return;
        }

        let settings = &self.inner.settings;
        let jitter_ms = settings.deferred_jitter.as_millis() as u64;
        let jitter = if jitter_ms > 0 {
            Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
        } else {
            Duration::ZERO
        };
        let delay = settings.deferred_delay + jitter;
        debug!("Deferred recompute scheduled in {:?}", delay);

        let this = self.clone();
        self.inner.tracker.spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {
                    this.inner.flush_scheduled.store(false, Ordering::SeqCst);
                    this.flush_dirty().await;
                }
                _ = this.inner.cancel.cancelled() => {
                    debug!("Deferred recompute cancelled by shutdown");
                }
            }
        });
    }

    /// Recompute every dirty key now
    pub async fn flush_dirty(&self) -> PassSummary {
        let keys: Vec<ScopeKey> = std::mem::take(&mut *self.inner.dirty.lock().await)
            .into_iter()
            .collect();
        if keys.is_empty() {
            return PassSummary::default();
        }

        info!("🔄 Flushing {} dirty ranking sets", keys.len());
        self.recompute_keys(keys).await
    }

    pub async fn dirty_keys(&self) -> Vec<ScopeKey> {
        self.inner.dirty.lock().await.iter().copied().collect()
    }

    // ========================================================================
    // Weights
    // ========================================================================

    pub async fn weights(&self) -> WeightConfig {
        self.inner.weights.read().await.clone()
    }

    /// Override one entity type's weights until restart
    pub async fn set_weights(&self, entity_type: EntityType, weights: WeightVector) -> Result<()> {
        let changed = {
            let mut current = self.inner.weights.write().await;
            let mut updated = current.clone();
            updated.set(entity_type, weights.clone())?;
            self.inner.overrides.write().await.insert(entity_type, weights);
            let changed = current.changed_entities(&updated);
            *current = updated;
            changed
        };
        self.weights_changed(&changed).await;
        Ok(())
    }

    /// Re-read the weight source and return the entity types whose weights changed
    pub async fn reload_weights(&self) -> Result<Vec<EntityType>> {
        let mut loaded = self.inner.weight_source.load().await?;
        let changed = {
            let mut current = self.inner.weights.write().await;
            for (entity_type, vector) in self.inner.overrides.read().await.iter() {
                loaded.set(*entity_type, vector.clone())?;
            }
            let changed = current.changed_entities(&loaded);
            *current = loaded;
            changed
        };
        self.weights_changed(&changed).await;
        Ok(changed)
    }

    /// Stored sets of a changed type were scored with the old weights: drop
    /// their pages and recompute every key of that type
    async fn weights_changed(&self, changed: &[EntityType]) {
        if changed.is_empty() {
            return;
        }

        let known = self.inner.known_keys.read().await.clone();
        let mut dirty = self.inner.dirty.lock().await;
        for entity_type in changed {
            info!("⚖️ Weights changed for {}, scheduling recompute", entity_type);
            self.inner.cache.invalidate_entity_type(*entity_type).await;
            dirty.extend(TimeWindow::ALL.iter().map(|w| ScopeKey::global(*entity_type, *w)));
            dirty.extend(known.iter().filter(|k| k.entity_type == *entity_type));
        }
        drop(dirty);

        self.schedule_flush();
    }

    // ========================================================================
    // State
    // ========================================================================

    async fn key_lock(&self, key: &ScopeKey) -> Arc<Mutex<()>> {
        self.inner
            .key_locks
            .lock()
            .await
            .entry(*key)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    async fn set_state(&self, key: ScopeKey, state: PassState) {
        let mut states = self.inner.states.write().await;
        if state == PassState::Idle {
            states.remove(&key);
        } else {
            states.insert(key, state);
        }
    }

    pub async fn state(&self, key: &ScopeKey) -> PassState {
        self.inner
            .states
            .read()
            .await
            .get(key)
            .copied()
            .unwrap_or(PassState::Idle)
    }

    /// Most advanced state across all keys of an entity type
    pub async fn entity_state(&self, entity_type: EntityType) -> PassState {
        let states = self.inner.states.read().await;
        let mut summary = PassState::Idle;
        for (key, state) in states.iter() {
            if key.entity_type != entity_type {
                continue;
            }
            match state {
                PassState::Persisting => return PassState::Persisting,
                PassState::Computing => summary = PassState::Computing,
                PassState::Idle => {}
            }
        }
        summary
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Wait for pending deferred flushes to finish
    pub async fn drain(&self) {
        self.inner.tracker.close();
        self.inner.tracker.wait().await;
        self.inner.tracker.reopen();
    }

    /// Cancel pending flushes and wait for running ones
    pub async fn shutdown(&self) {
        self.inner.cancel.cancel();
        self.inner.tracker.close();
        self.inner.tracker.wait().await;
        let dirty = self.inner.dirty.lock().await.len();
        if dirty > 0 {
            warn!("{} ranking sets still dirty at shutdown", dirty);
        }
    }
}
