//! Read path
//!
//! Serves ranking pages through the cache. Reads never fail: bad parameters
//! fall back to defaults and store errors degrade to an empty page.

use serde::Deserialize;
use std::sync::Arc;
use tracing::warn;

use super::cache::{CacheKey, RankingCache};
use super::store::RankingStore;
use super::types::{
    EntityType, RankingPage, RankingRecord, ScopeKey, SortField, TimeWindow, GLOBAL_SCOPE,
};
use crate::error::Result;

pub const DEFAULT_LIMIT: usize = 10;
pub const DEFAULT_MAX_PAGE_SIZE: usize = 100;
pub const DEFAULT_ENTITY_TYPE: EntityType = EntityType::Artist;
pub const DEFAULT_TIME_WINDOW: TimeWindow = TimeWindow::Month;

/// Raw query parameters as received from callers
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RankingParams {
    pub time_window: Option<String>,
    pub limit: Option<String>,
    pub offset: Option<String>,
    pub sort: Option<String>,
    pub category: Option<String>,
}

/// A validated ranking read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RankingQuery {
    pub entity_type: EntityType,
    pub time_window: TimeWindow,
    pub limit: usize,
    pub offset: usize,
    pub sort_field: SortField,
    pub category_scope: i64,
}

impl RankingQuery {
    pub fn new(entity_type: EntityType, time_window: TimeWindow) -> Self {
        Self {
            entity_type,
            time_window,
            limit: DEFAULT_LIMIT,
            offset: 0,
            sort_field: SortField::OverallScore,
            category_scope: GLOBAL_SCOPE,
        }
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }

    pub fn sort(mut self, sort_field: SortField) -> Self {
        self.sort_field = sort_field;
        self
    }

    pub fn category(mut self, category_scope: i64) -> Self {
        self.category_scope = category_scope.max(GLOBAL_SCOPE);
        self
    }

    /// Resolve raw parameters, substituting defaults for anything invalid
    pub fn from_params(entity_type: &str, params: &RankingParams) -> Self {
        let entity_type = entity_type.parse().unwrap_or(DEFAULT_ENTITY_TYPE);
        let time_window = params
            .time_window
            .as_deref()
            .and_then(|w| w.parse().ok())
            .unwrap_or(DEFAULT_TIME_WINDOW);
        let limit = params
            .limit
            .as_deref()
            .and_then(|l| l.trim().parse::<i64>().ok())
            .map(|l| l.max(1) as usize)
            .unwrap_or(DEFAULT_LIMIT);
        let offset = params
            .offset
            .as_deref()
            .and_then(|o| o.trim().parse::<i64>().ok())
            .map(|o| o.max(0) as usize)
            .unwrap_or(0);
        let category = params
            .category
            .as_deref()
            .and_then(|c| c.trim().parse::<i64>().ok())
            .unwrap_or(GLOBAL_SCOPE);

        Self::new(entity_type, time_window)
            .limit(limit)
            .offset(offset)
            .sort(SortField::resolve(entity_type, params.sort.as_deref()))
            .category(category)
    }

    pub fn scope(&self) -> ScopeKey {
        ScopeKey::new(self.entity_type, self.time_window, self.category_scope)
    }
}

/// Cached read access to rankings
#[derive(Clone)]
pub struct RankingService {
    store: Arc<dyn RankingStore>,
    cache: Arc<RankingCache>,
    max_page_size: usize,
}

impl RankingService {
    pub fn new(store: Arc<dyn RankingStore>, cache: Arc<RankingCache>) -> Self {
        Self {
            store,
            cache,
            max_page_size: DEFAULT_MAX_PAGE_SIZE,
        }
    }

    pub fn with_max_page_size(mut self, max_page_size: usize) -> Self {
        self.max_page_size = max_page_size.max(1);
        self
    }

    /// One page of rankings; empty when nothing has been computed yet
    pub async fn get_rankings(&self, query: &RankingQuery) -> RankingPage {
        let scope = query.scope();
        let limit = query.limit.clamp(1, self.max_page_size);
        let key = CacheKey::new(scope, limit, query.offset, query.sort_field);

        if let Some(page) = self.cache.get(&key).await {
            return page;
        }

        // Taken before the read so a concurrent recompute voids this insert
        let token = self.cache.token(&scope).await;
        match self
            .store
            .fetch_page(&scope, query.sort_field, limit, query.offset)
            .await
        {
            Ok(page) => {
                self.cache.insert_if_current(key, page.clone(), token).await;
                page
            }
            Err(e) => {
                warn!("⚠️ Ranking read for {} failed, serving empty page: {}", scope, e);
                RankingPage::empty(&scope, query.sort_field)
            }
        }
    }

    /// Current rank of one entity
    pub async fn entity_rank(
        &self,
        entity_type: EntityType,
        entity_id: i64,
        time_window: TimeWindow,
        category_scope: i64,
    ) -> Result<Option<RankingRecord>> {
        let scope = ScopeKey::new(entity_type, time_window, category_scope);
        self.store.entity_rank(&scope, entity_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ranking::store::MemoryRankingStore;
    use crate::ranking::types::{MetricName, Metrics};
    use chrono::Utc;

    fn params(pairs: &[(&str, &str)]) -> RankingParams {
        let mut p = RankingParams::default();
        for (k, v) in pairs {
            let v = Some(v.to_string());
            match *k {
                "time_window" => p.time_window = v,
                "limit" => p.limit = v,
                "offset" => p.offset = v,
                "sort" => p.sort = v,
                "category" => p.category = v,
                _ => {}
            }
        }
        p
    }

    #[test]
    fn test_invalid_params_fall_back() {
        let q = RankingQuery::from_params(
            "galleries",
            &params(&[
                ("time_window", "decade"),
                ("limit", "many"),
                ("offset", "-4"),
                ("sort", "bogus"),
                ("category", "x"),
            ]),
        );
        assert_eq!(q.entity_type, EntityType::Artist);
        assert_eq!(q.time_window, TimeWindow::Month);
        assert_eq!(q.limit, DEFAULT_LIMIT);
        assert_eq!(q.offset, 0);
        assert_eq!(q.sort_field, SortField::OverallScore);
        assert_eq!(q.category_scope, GLOBAL_SCOPE);
    }

    #[test]
    fn test_valid_params() {
        let q = RankingQuery::from_params(
            "artworks",
            &params(&[("time_window", "week"), ("limit", "0"), ("sort", "likes"), ("category", "12")]),
        );
        assert_eq!(q.entity_type, EntityType::Artwork);
        assert_eq!(q.time_window, TimeWindow::Week);
        assert_eq!(q.limit, 1);
        assert_eq!(q.sort_field, SortField::Metric(MetricName::LikeCount));
        assert_eq!(q.category_scope, 12);
    }

    #[tokio::test]
    async fn test_limit_clamped_and_total_independent_of_page() {
        let store = Arc::new(MemoryRankingStore::new());
        let scope = ScopeKey::global(EntityType::Artist, TimeWindow::Month);
        let records = (1..=150)
            .map(|i| RankingRecord {
                entity_type: scope.entity_type,
                entity_id: i,
                related_id: None,
                time_window: scope.time_window,
                category_scope: 0,
                rank: i as u32,
                overall_score: 1000.0 - i as f64,
                sales_score: 0.0,
                popularity_score: 0.0,
                metrics: Metrics::new(),
                calculated_at: Utc::now(),
            })
            .collect();
        store.replace_set(&scope, records, Utc::now()).await.unwrap();

        let service = RankingService::new(store, Arc::new(RankingCache::default()));
        let page = service
            .get_rankings(&RankingQuery::new(EntityType::Artist, TimeWindow::Month).limit(500))
            .await;
        assert_eq!(page.items.len(), DEFAULT_MAX_PAGE_SIZE);
        assert_eq!(page.total, 150);

        let page = service
            .get_rankings(&RankingQuery::new(EntityType::Artist, TimeWindow::Month).offset(145))
            .await;
        assert_eq!(page.items.len(), 5);
        assert_eq!(page.total, 150);
        assert_eq!(page.items[0].rank, 146);
    }

    #[tokio::test]
    async fn test_unknown_scope_is_empty() {
        let service = RankingService::new(
            Arc::new(MemoryRankingStore::new()),
            Arc::new(RankingCache::default()),
        );
        let page = service
            .get_rankings(&RankingQuery::new(EntityType::Tag, TimeWindow::Year).category(99))
            .await;
        assert_eq!(page.total, 0);
        assert!(page.items.is_empty());
        assert_eq!(page.category_scope, 99);
    }
}
