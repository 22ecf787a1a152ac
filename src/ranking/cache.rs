//! Read-through cache of ranking pages
//!
//! Entries are keyed by the full query (scope, limit, offset, sort field) and
//! expire after a TTL. Each scope key and entity type carries an epoch that is
//! bumped on invalidation. A reader takes an [`EpochToken`] before going to
//! the store and may only insert if the epochs are unchanged, so a slow read
//! that started before a recompute cannot put the old generation back.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::debug;

use super::metrics::{record_cache_invalidation, record_cache_lookup};
use super::types::{EntityType, RankingPage, ScopeKey, SortField};

/// Default time-to-live of a cached page
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(6 * 60 * 60);

/// Default cap on the number of cached pages
pub const DEFAULT_MAX_ENTRIES: usize = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub scope: ScopeKey,
    pub limit: usize,
    pub offset: usize,
    pub sort_field: SortField,
}

impl CacheKey {
    pub fn new(scope: ScopeKey, limit: usize, offset: usize, sort_field: SortField) -> Self {
        Self {
            scope,
            limit,
            offset,
            sort_field,
        }
    }
}

/// Epochs observed before a store read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EpochToken {
    scope_epoch: u64,
    type_epoch: u64,
}

#[derive(Debug, Clone)]
struct CacheEntry {
    page: RankingPage,
    inserted_at: Instant,
}

impl CacheEntry {
    fn is_expired(&self, ttl: Duration) -> bool {
        self.inserted_at.elapsed() >= ttl
    }
}

#[derive(Debug, Default)]
struct CacheState {
    entries: HashMap<CacheKey, CacheEntry>,
    scope_epochs: HashMap<ScopeKey, u64>,
    type_epochs: HashMap<EntityType, u64>,
}

impl CacheState {
    fn token(&self, scope: &ScopeKey) -> EpochToken {
        EpochToken {
            scope_epoch: self.scope_epochs.get(scope).copied().unwrap_or(0),
            type_epoch: self.type_epochs.get(&scope.entity_type).copied().unwrap_or(0),
        }
    }
}

/// Cache statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
    pub evictions: u64,
    pub invalidations: u64,
    /// Inserts refused because the scope was invalidated mid-read
    pub stale_inserts: u64,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

pub struct RankingCache {
    ttl: Duration,
    max_entries: usize,
    state: RwLock<CacheState>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    invalidations: AtomicU64,
    stale_inserts: AtomicU64,
}

impl Default for RankingCache {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_TTL, DEFAULT_MAX_ENTRIES)
    }
}

impl RankingCache {
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        Self {
            ttl,
            max_entries: max_entries.max(1),
            state: RwLock::new(CacheState::default()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            invalidations: AtomicU64::new(0),
            stale_inserts: AtomicU64::new(0),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Cached page for `key`, if present and not expired
    pub async fn get(&self, key: &CacheKey) -> Option<RankingPage> {
        let page = {
            let state = self.state.read().await;
            state
                .entries
                .get(key)
                .filter(|entry| !entry.is_expired(self.ttl))
                .map(|entry| entry.page.clone())
        };

        let counter = if page.is_some() { &self.hits } else { &self.misses };
        counter.fetch_add(1, Ordering::Relaxed);
        record_cache_lookup(page.is_some());
        page
    }

    /// Current epochs of a scope; take this before reading the store
    pub async fn token(&self, scope: &ScopeKey) -> EpochToken {
        self.state.read().await.token(scope)
    }

    /// Insert unless the scope or its entity type was invalidated since `token`
    pub async fn insert_if_current(&self, key: CacheKey, page: RankingPage, token: EpochToken) -> bool {
        let mut state = self.state.write().await;
        if state.token(&key.scope) != token {
            self.stale_inserts.fetch_add(1, Ordering::Relaxed);
            debug!("Skipped cache insert for {}: scope invalidated during read", key.scope);
            return false;
        }

        if state.entries.len() >= self.max_entries && !state.entries.contains_key(&key) {
            self.evict(&mut state);
        }

        state.entries.insert(
            key,
            CacheEntry {
                page,
                inserted_at: Instant::now(),
            },
        );
        true
    }

    /// Drop expired entries first, then the oldest one if still full
    fn evict(&self, state: &mut CacheState) {
        let ttl = self.ttl;
        let before = state.entries.len();
        state.entries.retain(|_, entry| !entry.is_expired(ttl));
        let mut evicted = before - state.entries.len();

        if state.entries.len() >= self.max_entries {
            let oldest = state
                .entries
                .iter()
                .min_by_key(|(_, entry)| entry.inserted_at)
                .map(|(key, _)| *key);
            if let Some(oldest) = oldest {
                state.entries.remove(&oldest);
                evicted += 1;
            }
        }
        self.evictions.fetch_add(evicted as u64, Ordering::Relaxed);
    }

    /// Remove every page of one scope key
    pub async fn invalidate_scope(&self, scope: &ScopeKey) -> usize {
        let mut state = self.state.write().await;
        *state.scope_epochs.entry(*scope).or_insert(0) += 1;
        let before = state.entries.len();
        state.entries.retain(|key, _| key.scope != *scope);
        let removed = before - state.entries.len();
        drop(state);

        self.invalidations.fetch_add(1, Ordering::Relaxed);
        record_cache_invalidation("scope", removed);
        debug!("Invalidated {} cached pages for {}", removed, scope);
        removed
    }

    /// Remove every page of one entity type, across windows and scopes
    pub async fn invalidate_entity_type(&self, entity_type: EntityType) -> usize {
        let mut state = self.state.write().await;
        *state.type_epochs.entry(entity_type).or_insert(0) += 1;
        let before = state.entries.len();
        state
            .entries
            .retain(|key, _| key.scope.entity_type != entity_type);
        let removed = before - state.entries.len();
        drop(state);

        self.invalidations.fetch_add(1, Ordering::Relaxed);
        record_cache_invalidation("entity_type", removed);
        debug!("Invalidated {} cached pages for entity type {}", removed, entity_type);
        removed
    }

    pub async fn purge_expired(&self) -> usize {
        let ttl = self.ttl;
        let mut state = self.state.write().await;
        let before = state.entries.len();
        state.entries.retain(|_, entry| !entry.is_expired(ttl));
        let removed = before - state.entries.len();
        self.evictions.fetch_add(removed as u64, Ordering::Relaxed);
        removed
    }

    pub async fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries: self.state.read().await.entries.len(),
            evictions: self.evictions.load(Ordering::Relaxed),
            invalidations: self.invalidations.load(Ordering::Relaxed),
            stale_inserts: self.stale_inserts.load(Ordering::Relaxed),
        }
    }

    pub async fn clear(&self) {
        let mut state = self.state.write().await;
        let removed = state.entries.len();
        state.entries.clear();
        self.evictions.fetch_add(removed as u64, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ranking::types::TimeWindow;

    fn scope(entity_type: EntityType, window: TimeWindow) -> ScopeKey {
        ScopeKey::global(entity_type, window)
    }

    fn key(scope: ScopeKey, offset: usize) -> CacheKey {
        CacheKey::new(scope, 10, offset, SortField::OverallScore)
    }

    fn page(scope: &ScopeKey, total: usize) -> RankingPage {
        let mut page = RankingPage::empty(scope, SortField::OverallScore);
        page.total = total;
        page
    }

    #[tokio::test]
    async fn test_insert_then_hit() {
        let cache = RankingCache::default();
        let s = scope(EntityType::Artist, TimeWindow::Week);
        let token = cache.token(&s).await;

        assert!(cache.get(&key(s, 0)).await.is_none());
        assert!(cache.insert_if_current(key(s, 0), page(&s, 3), token).await);
        assert_eq!(cache.get(&key(s, 0)).await.unwrap().total, 3);

        let stats = cache.stats().await;
        assert_eq!((stats.hits, stats.misses, stats.entries), (1, 1, 1));
        assert_eq!(stats.hit_rate(), 0.5);
    }

    #[tokio::test]
    async fn test_expired_entries_miss() {
        let cache = RankingCache::new(Duration::from_millis(0), 10);
        let s = scope(EntityType::Artist, TimeWindow::Day);
        let token = cache.token(&s).await;
        cache.insert_if_current(key(s, 0), page(&s, 1), token).await;
        assert!(cache.get(&key(s, 0)).await.is_none());
        assert_eq!(cache.purge_expired().await, 1);
    }

    #[tokio::test]
    async fn test_invalidate_scope_only_touches_that_scope() {
        let cache = RankingCache::default();
        let week = scope(EntityType::Artist, TimeWindow::Week);
        let month = scope(EntityType::Artist, TimeWindow::Month);
        for s in [week, month] {
            let token = cache.token(&s).await;
            cache.insert_if_current(key(s, 0), page(&s, 1), token).await;
            let token = cache.token(&s).await;
            cache.insert_if_current(key(s, 10), page(&s, 1), token).await;
        }

        assert_eq!(cache.invalidate_scope(&week).await, 2);
        assert!(cache.get(&key(week, 0)).await.is_none());
        assert!(cache.get(&key(month, 0)).await.is_some());
    }

    #[tokio::test]
    async fn test_stale_reader_cannot_repopulate() {
        let cache = RankingCache::default();
        let s = scope(EntityType::Artwork, TimeWindow::Week);

        let token = cache.token(&s).await;
        // a recompute lands while the reader is at the store
        cache.invalidate_scope(&s).await;
        assert!(!cache.insert_if_current(key(s, 0), page(&s, 1), token).await);
        assert!(cache.get(&key(s, 0)).await.is_none());
        assert_eq!(cache.stats().await.stale_inserts, 1);

        let token = cache.token(&s).await;
        cache.invalidate_entity_type(EntityType::Artwork).await;
        assert!(!cache.insert_if_current(key(s, 0), page(&s, 1), token).await);
    }

    #[tokio::test]
    async fn test_invalidate_entity_type_spans_windows_and_scopes() {
        let cache = RankingCache::default();
        let scoped = ScopeKey::new(EntityType::Category, TimeWindow::Year, 4);
        let global = scope(EntityType::Category, TimeWindow::Day);
        let other = scope(EntityType::Tag, TimeWindow::Day);
        for s in [scoped, global, other] {
            let token = cache.token(&s).await;
            cache.insert_if_current(key(s, 0), page(&s, 1), token).await;
        }

        assert_eq!(cache.invalidate_entity_type(EntityType::Category).await, 2);
        assert_eq!(cache.stats().await.entries, 1);
    }

    #[tokio::test]
    async fn test_capacity_evicts_oldest() {
        let cache = RankingCache::new(DEFAULT_CACHE_TTL, 2);
        let s = scope(EntityType::Model, TimeWindow::All);
        for offset in [0, 10, 20] {
            let token = cache.token(&s).await;
            cache.insert_if_current(key(s, offset), page(&s, 1), token).await;
            tokio::time::sleep(Duration::from_millis(2)).await;
        }

        assert_eq!(cache.stats().await.entries, 2);
        assert!(cache.get(&key(s, 0)).await.is_none());
        assert!(cache.get(&key(s, 20)).await.is_some());
        assert_eq!(cache.stats().await.evictions, 1);
    }
}
