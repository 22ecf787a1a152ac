//! Metric source adapters
//!
//! The engine does not collect metrics itself. A [`MetricSource`] enumerates
//! the active entities of a scope and reports raw counters for each of them.
//! Two adapters ship with the crate: [`PgMetricSource`] reads the marketplace
//! tables directly, [`MemoryMetricSource`] backs tests and local runs.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use std::collections::{BTreeMap, HashMap};
use tokio::sync::RwLock;

use super::types::{EntityRef, EntityType, MetricName, Metrics, TimeWindow, GLOBAL_SCOPE};
use crate::error::{Error, Result};

/// Ownership and taxonomy of an artwork, used to fan out sale events
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtworkContext {
    pub artwork_id: i64,
    pub artist_id: Option<i64>,
    pub category_ids: Vec<i64>,
}

/// Supplies eligible entities and their raw metrics
#[async_trait]
pub trait MetricSource: Send + Sync {
    /// Active entities of `entity_type` within `category_scope` (0 = all)
    async fn eligible_entities(
        &self,
        entity_type: EntityType,
        time_window: TimeWindow,
        category_scope: i64,
    ) -> Result<Vec<EntityRef>>;

    /// Raw metrics for one entity; missing metrics read as zero
    async fn fetch_metrics(
        &self,
        entity_type: EntityType,
        entity: EntityRef,
        time_window: TimeWindow,
        category_scope: i64,
    ) -> Result<Metrics>;

    /// Owner and categories of an artwork, `None` if unknown
    async fn artwork_context(&self, artwork_id: i64) -> Result<Option<ArtworkContext>>;
}

// ============================================================================
// In-memory source
// ============================================================================

#[derive(Debug, Clone)]
struct MemoryEntity {
    related_id: Option<i64>,
    active: bool,
    unavailable: bool,
    categories: Vec<i64>,
    metrics: HashMap<TimeWindow, Metrics>,
}

/// Metric source backed by a map, for tests and local runs
///
/// Metrics are stored per window and are not narrowed by category scope;
/// scope only filters which entities are eligible.
#[derive(Debug, Default)]
pub struct MemoryMetricSource {
    entities: RwLock<BTreeMap<(EntityType, i64), MemoryEntity>>,
}

impl MemoryMetricSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an active entity (no-op for the metrics of an existing one)
    pub async fn insert(&self, entity_type: EntityType, entity_id: i64, related_id: Option<i64>) {
        let mut entities = self.entities.write().await;
        entities
            .entry((entity_type, entity_id))
            .and_modify(|e| e.related_id = related_id)
            .or_insert_with(|| MemoryEntity {
                related_id,
                active: true,
                unavailable: false,
                categories: Vec::new(),
                metrics: HashMap::new(),
            });
    }

    /// Replace all metrics of an entity for one window
    pub async fn set_metrics(
        &self,
        entity_type: EntityType,
        entity_id: i64,
        time_window: TimeWindow,
        metrics: Metrics,
    ) {
        self.insert_if_missing(entity_type, entity_id).await;
        if let Some(entity) = self.entities.write().await.get_mut(&(entity_type, entity_id)) {
            entity.metrics.insert(time_window, metrics);
        }
    }

    /// Set a single metric of an entity for one window
    pub async fn set_metric(
        &self,
        entity_type: EntityType,
        entity_id: i64,
        time_window: TimeWindow,
        metric: MetricName,
        value: f64,
    ) {
        self.insert_if_missing(entity_type, entity_id).await;
        if let Some(entity) = self.entities.write().await.get_mut(&(entity_type, entity_id)) {
            entity
                .metrics
                .entry(time_window)
                .or_default()
                .insert(metric, value);
        }
    }

    pub async fn set_categories(&self, artwork_id: i64, categories: Vec<i64>) {
        self.insert_if_missing(EntityType::Artwork, artwork_id).await;
        if let Some(entity) = self
            .entities
            .write()
            .await
            .get_mut(&(EntityType::Artwork, artwork_id))
        {
            entity.categories = categories;
        }
    }

    pub async fn set_active(&self, entity_type: EntityType, entity_id: i64, active: bool) {
        if let Some(entity) = self.entities.write().await.get_mut(&(entity_type, entity_id)) {
            entity.active = active;
        }
    }

    /// Make metric fetches for an entity fail
    pub async fn set_unavailable(&self, entity_type: EntityType, entity_id: i64, unavailable: bool) {
        if let Some(entity) = self.entities.write().await.get_mut(&(entity_type, entity_id)) {
            entity.unavailable = unavailable;
        }
    }

    async fn insert_if_missing(&self, entity_type: EntityType, entity_id: i64) {
        let exists = self
            .entities
            .read()
            .await
            .contains_key(&(entity_type, entity_id));
        if !exists {
            self.insert(entity_type, entity_id, None).await;
        }
    }

    fn in_scope(
        entities: &BTreeMap<(EntityType, i64), MemoryEntity>,
        entity_type: EntityType,
        entity_id: i64,
        entity: &MemoryEntity,
        category_scope: i64,
    ) -> bool {
        if category_scope == GLOBAL_SCOPE {
            return true;
        }
        match entity_type {
            EntityType::Artwork => entity.categories.contains(&category_scope),
            EntityType::Artist => entities.iter().any(|((et, _), artwork)| {
                *et == EntityType::Artwork
                    && artwork.active
                    && artwork.related_id == Some(entity_id)
                    && artwork.categories.contains(&category_scope)
            }),
            _ => entity.related_id == Some(category_scope),
        }
    }
}

#[async_trait]
impl MetricSource for MemoryMetricSource {
    async fn eligible_entities(
        &self,
        entity_type: EntityType,
        _time_window: TimeWindow,
        category_scope: i64,
    ) -> Result<Vec<EntityRef>> {
        let entities = self.entities.read().await;
        Ok(entities
            .iter()
            .filter(|((et, _), e)| *et == entity_type && e.active)
            .filter(|((et, id), e)| Self::in_scope(&entities, *et, *id, e, category_scope))
            .map(|((_, id), e)| EntityRef::new(*id, e.related_id))
            .collect())
    }

    async fn fetch_metrics(
        &self,
        entity_type: EntityType,
        entity: EntityRef,
        time_window: TimeWindow,
        _category_scope: i64,
    ) -> Result<Metrics> {
        let entities = self.entities.read().await;
        match entities.get(&(entity_type, entity.entity_id)) {
            Some(e) if e.unavailable => Err(Error::metric_unavailable(
                entity.entity_id,
                "metric source unavailable",
            )),
            Some(e) => Ok(e.metrics.get(&time_window).cloned().unwrap_or_default()),
            None => Ok(Metrics::new()),
        }
    }

    async fn artwork_context(&self, artwork_id: i64) -> Result<Option<ArtworkContext>> {
        let entities = self.entities.read().await;
        Ok(entities
            .get(&(EntityType::Artwork, artwork_id))
            .map(|e| ArtworkContext {
                artwork_id,
                artist_id: e.related_id,
                category_ids: e.categories.clone(),
            }))
    }
}

// ============================================================================
// PostgreSQL source
// ============================================================================

const ELIGIBLE_ARTISTS: &str = r#"
    SELECT a.id AS entity_id, NULL::bigint AS related_id
    FROM artists a
    WHERE a.status = 'active'
    AND ($1 = 0 OR EXISTS (
        SELECT 1 FROM artworks w
        JOIN artwork_terms t ON t.artwork_id = w.id
        WHERE w.artist_id = a.id
        AND w.status = 'active'
        AND t.taxonomy = 'category'
        AND t.term_id = $1
    ))
    ORDER BY a.id
"#;

const ELIGIBLE_ARTWORKS: &str = r#"
    SELECT w.id AS entity_id, w.artist_id AS related_id
    FROM artworks w
    WHERE w.status = 'active'
    AND ($1 = 0 OR EXISTS (
        SELECT 1 FROM artwork_terms t
        WHERE t.artwork_id = w.id
        AND t.taxonomy = 'category'
        AND t.term_id = $1
    ))
    ORDER BY w.id
"#;

const ELIGIBLE_TERMS: &str = r#"
    SELECT t.id AS entity_id, t.parent_id AS related_id
    FROM terms t
    WHERE t.taxonomy = $1
    AND t.status = 'active'
    AND ($2 = 0 OR t.parent_id = $2)
    ORDER BY t.id
"#;

const ARTIST_METRICS: &str = r#"
    WITH scoped AS (
        SELECT w.id FROM artworks w
        WHERE w.artist_id = $1
        AND w.status = 'active'
        AND ($3 = 0 OR EXISTS (
            SELECT 1 FROM artwork_terms t
            WHERE t.artwork_id = w.id AND t.taxonomy = 'category' AND t.term_id = $3
        ))
    ),
    window_sales AS (
        SELECT s.amount FROM sales s
        WHERE s.artwork_id IN (SELECT id FROM scoped)
        AND s.status = 'completed'
        AND ($2::timestamptz IS NULL OR s.completed_at >= $2)
    )
    SELECT
        (SELECT COUNT(*) FROM window_sales)::float8 AS sales_count,
        (SELECT COALESCE(SUM(amount), 0) FROM window_sales)::float8 AS sales_revenue,
        (SELECT COUNT(*) FROM scoped)::float8 AS artwork_count,
        (SELECT COUNT(*) FROM artwork_views v
            WHERE v.artwork_id IN (SELECT id FROM scoped)
            AND ($2::timestamptz IS NULL OR v.viewed_at >= $2))::float8 AS view_count,
        (SELECT COUNT(*) FROM artist_followers f
            WHERE f.artist_id = $1
            AND ($2::timestamptz IS NULL OR f.created_at >= $2))::float8 AS follower_count,
        (SELECT COALESCE(AVG(r.rating), 0) FROM artwork_ratings r
            WHERE r.artwork_id IN (SELECT id FROM scoped)
            AND ($2::timestamptz IS NULL OR r.created_at >= $2))::float8 AS avg_rating
"#;

const ARTWORK_METRICS: &str = r#"
    WITH window_sales AS (
        SELECT s.amount FROM sales s
        WHERE s.artwork_id = $1
        AND s.status = 'completed'
        AND ($2::timestamptz IS NULL OR s.completed_at >= $2)
    )
    SELECT
        (SELECT COUNT(*) FROM window_sales)::float8 AS sales_count,
        (SELECT COALESCE(SUM(amount), 0) FROM window_sales)::float8 AS sales_revenue,
        (SELECT COUNT(*) FROM artwork_views v
            WHERE v.artwork_id = $1
            AND ($2::timestamptz IS NULL OR v.viewed_at >= $2))::float8 AS view_count,
        (SELECT COUNT(*) FROM artwork_likes l
            WHERE l.artwork_id = $1
            AND ($2::timestamptz IS NULL OR l.created_at >= $2))::float8 AS like_count,
        (SELECT COUNT(*) FROM artwork_shares sh
            WHERE sh.artwork_id = $1
            AND ($2::timestamptz IS NULL OR sh.created_at >= $2))::float8 AS share_count,
        (SELECT COALESCE(AVG(r.rating), 0) FROM artwork_ratings r
            WHERE r.artwork_id = $1
            AND ($2::timestamptz IS NULL OR r.created_at >= $2))::float8 AS avg_rating
"#;

const TERM_METRICS: &str = r#"
    WITH members AS (
        SELECT w.id, t.created_at AS associated_at
        FROM artwork_terms t
        JOIN artworks w ON w.id = t.artwork_id
        WHERE t.term_id = $1
        AND t.taxonomy = $3
        AND w.status = 'active'
    ),
    window_sales AS (
        SELECT s.amount FROM sales s
        WHERE s.artwork_id IN (SELECT id FROM members)
        AND s.status = 'completed'
        AND ($2::timestamptz IS NULL OR s.completed_at >= $2)
    )
    SELECT
        (SELECT COUNT(*) FROM members
            WHERE ($2::timestamptz IS NULL OR associated_at >= $2))::float8 AS association_count,
        (SELECT COUNT(*) FROM members)::float8 AS artwork_count,
        (SELECT COUNT(*) FROM window_sales)::float8 AS sales_count,
        (SELECT COALESCE(SUM(amount), 0) FROM window_sales)::float8 AS sales_revenue,
        (SELECT COUNT(*) FROM artwork_views v
            WHERE v.artwork_id IN (SELECT id FROM members)
            AND ($2::timestamptz IS NULL OR v.viewed_at >= $2))::float8 AS view_count
"#;

const ARTWORK_CONTEXT: &str = r#"
    SELECT w.artist_id,
           COALESCE(ARRAY_AGG(t.term_id) FILTER (WHERE t.term_id IS NOT NULL), '{}') AS category_ids
    FROM artworks w
    LEFT JOIN artwork_terms t ON t.artwork_id = w.id AND t.taxonomy = 'category'
    WHERE w.id = $1
    GROUP BY w.artist_id
"#;

#[derive(Debug, sqlx::FromRow)]
struct EntityRow {
    entity_id: i64,
    related_id: Option<i64>,
}

#[derive(Debug, sqlx::FromRow)]
struct ArtistMetricsRow {
    sales_count: f64,
    sales_revenue: f64,
    artwork_count: f64,
    view_count: f64,
    follower_count: f64,
    avg_rating: f64,
}

#[derive(Debug, sqlx::FromRow)]
struct ArtworkMetricsRow {
    sales_count: f64,
    sales_revenue: f64,
    view_count: f64,
    like_count: f64,
    share_count: f64,
    avg_rating: f64,
}

#[derive(Debug, sqlx::FromRow)]
struct TermMetricsRow {
    association_count: f64,
    artwork_count: f64,
    sales_count: f64,
    sales_revenue: f64,
    view_count: f64,
}

#[derive(Debug, sqlx::FromRow)]
struct ArtworkContextRow {
    artist_id: Option<i64>,
    category_ids: Vec<i64>,
}

/// Metric source reading the marketplace tables
#[derive(Clone)]
pub struct PgMetricSource {
    pool: PgPool,
}

impl PgMetricSource {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn window_start(time_window: TimeWindow) -> Option<DateTime<Utc>> {
        time_window.start(Utc::now())
    }
}

#[async_trait]
impl MetricSource for PgMetricSource {
    async fn eligible_entities(
        &self,
        entity_type: EntityType,
        _time_window: TimeWindow,
        category_scope: i64,
    ) -> Result<Vec<EntityRef>> {
        let rows: Vec<EntityRow> = match entity_type {
            EntityType::Artist => {
                sqlx::query_as::<_, EntityRow>(ELIGIBLE_ARTISTS)
                    .bind(category_scope)
                    .fetch_all(&self.pool)
                    .await?
            }
            EntityType::Artwork => {
                sqlx::query_as::<_, EntityRow>(ELIGIBLE_ARTWORKS)
                    .bind(category_scope)
                    .fetch_all(&self.pool)
                    .await?
            }
            taxonomy => {
                sqlx::query_as::<_, EntityRow>(ELIGIBLE_TERMS)
                    .bind(taxonomy.as_str())
                    .bind(category_scope)
                    .fetch_all(&self.pool)
                    .await?
            }
        };

        Ok(rows
            .into_iter()
            .map(|row| EntityRef::new(row.entity_id, row.related_id))
            .collect())
    }

    async fn fetch_metrics(
        &self,
        entity_type: EntityType,
        entity: EntityRef,
        time_window: TimeWindow,
        category_scope: i64,
    ) -> Result<Metrics> {
        let start = Self::window_start(time_window);
        let unavailable =
            |e: sqlx::Error| Error::metric_unavailable(entity.entity_id, e.to_string());

        let mut metrics: Metrics = match entity_type {
            EntityType::Artist => {
                let row = sqlx::query_as::<_, ArtistMetricsRow>(ARTIST_METRICS)
                    .bind(entity.entity_id)
                    .bind(start)
                    .bind(category_scope)
                    .fetch_one(&self.pool)
                    .await
                    .map_err(unavailable)?;
                [
                    (MetricName::SalesCount, row.sales_count),
                    (MetricName::SalesRevenue, row.sales_revenue),
                    (MetricName::ArtworkCount, row.artwork_count),
                    (MetricName::ViewCount, row.view_count),
                    (MetricName::FollowerCount, row.follower_count),
                    (MetricName::AvgRating, row.avg_rating),
                ]
                .into_iter()
                .collect()
            }
            EntityType::Artwork => {
                let row = sqlx::query_as::<_, ArtworkMetricsRow>(ARTWORK_METRICS)
                    .bind(entity.entity_id)
                    .bind(start)
                    .fetch_one(&self.pool)
                    .await
                    .map_err(unavailable)?;
                [
                    (MetricName::SalesCount, row.sales_count),
                    (MetricName::SalesRevenue, row.sales_revenue),
                    (MetricName::ViewCount, row.view_count),
                    (MetricName::LikeCount, row.like_count),
                    (MetricName::ShareCount, row.share_count),
                    (MetricName::AvgRating, row.avg_rating),
                ]
                .into_iter()
                .collect()
            }
            taxonomy => {
                let row = sqlx::query_as::<_, TermMetricsRow>(TERM_METRICS)
                    .bind(entity.entity_id)
                    .bind(start)
                    .bind(taxonomy.as_str())
                    .fetch_one(&self.pool)
                    .await
                    .map_err(unavailable)?;
                [
                    (MetricName::AssociationCount, row.association_count),
                    (MetricName::ArtworkCount, row.artwork_count),
                    (MetricName::SalesCount, row.sales_count),
                    (MetricName::SalesRevenue, row.sales_revenue),
                    (MetricName::ViewCount, row.view_count),
                ]
                .into_iter()
                .collect()
            }
        };

        metrics.retain(|metric, _| entity_type.metrics().contains(metric));
        Ok(metrics)
    }

    async fn artwork_context(&self, artwork_id: i64) -> Result<Option<ArtworkContext>> {
        let row = sqlx::query_as::<_, ArtworkContextRow>(ARTWORK_CONTEXT)
            .bind(artwork_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|row| ArtworkContext {
            artwork_id,
            artist_id: row.artist_id,
            category_ids: row.category_ids,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn seeded() -> MemoryMetricSource {
        let source = MemoryMetricSource::new();
        source.insert(EntityType::Artist, 1, None).await;
        source.insert(EntityType::Artist, 2, None).await;
        source.insert(EntityType::Artwork, 10, Some(1)).await;
        source.insert(EntityType::Artwork, 11, Some(2)).await;
        source.set_categories(10, vec![100]).await;
        source.set_categories(11, vec![200]).await;
        source.insert(EntityType::Category, 100, None).await;
        source.insert(EntityType::Category, 101, Some(100)).await;
        source
    }

    #[tokio::test]
    async fn test_memory_scope_filters() {
        let source = seeded().await;

        let artists = source
            .eligible_entities(EntityType::Artist, TimeWindow::Week, 100)
            .await
            .unwrap();
        assert_eq!(artists, vec![EntityRef::new(1, None)]);

        let artworks = source
            .eligible_entities(EntityType::Artwork, TimeWindow::Week, 200)
            .await
            .unwrap();
        assert_eq!(artworks, vec![EntityRef::new(11, Some(2))]);

        let subcategories = source
            .eligible_entities(EntityType::Category, TimeWindow::Week, 100)
            .await
            .unwrap();
        assert_eq!(subcategories, vec![EntityRef::new(101, Some(100))]);

        let all = source
            .eligible_entities(EntityType::Artwork, TimeWindow::Week, GLOBAL_SCOPE)
            .await
            .unwrap();
        assert_eq!(all.len(), 2);
    }

    #[tokio::test]
    async fn test_memory_inactive_entities_are_not_eligible() {
        let source = seeded().await;
        source.set_active(EntityType::Artist, 2, false).await;
        let artists = source
            .eligible_entities(EntityType::Artist, TimeWindow::Day, GLOBAL_SCOPE)
            .await
            .unwrap();
        assert_eq!(artists, vec![EntityRef::new(1, None)]);
    }

    #[tokio::test]
    async fn test_memory_missing_window_reads_as_empty() {
        let source = seeded().await;
        source
            .set_metric(EntityType::Artist, 1, TimeWindow::Year, MetricName::SalesCount, 3.0)
            .await;

        let year = source
            .fetch_metrics(EntityType::Artist, EntityRef::new(1, None), TimeWindow::Year, 0)
            .await
            .unwrap();
        assert_eq!(year.get(&MetricName::SalesCount), Some(&3.0));

        let day = source
            .fetch_metrics(EntityType::Artist, EntityRef::new(1, None), TimeWindow::Day, 0)
            .await
            .unwrap();
        assert!(day.is_empty());
    }

    #[tokio::test]
    async fn test_memory_unavailable_entity_errors() {
        let source = seeded().await;
        source.set_unavailable(EntityType::Artist, 2, true).await;
        let err = source
            .fetch_metrics(EntityType::Artist, EntityRef::new(2, None), TimeWindow::Day, 0)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::MetricUnavailable { entity_id: 2, .. }));
    }

    #[tokio::test]
    async fn test_memory_artwork_context() {
        let source = seeded().await;
        let ctx = source.artwork_context(10).await.unwrap().unwrap();
        assert_eq!(ctx.artist_id, Some(1));
        assert_eq!(ctx.category_ids, vec![100]);
        assert!(source.artwork_context(999).await.unwrap().is_none());
    }
}
