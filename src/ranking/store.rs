//! Ranking persistence
//!
//! A [`RankingStore`] holds one current [`RankingSet`] per scope key. Writers
//! build a complete new generation and swap the pointer in one step, so a
//! reader sees either the previous set or the new one, never a mix.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgExecutor, PgPool, Postgres, Transaction};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, instrument};

use super::types::{MetricName, Metrics, RankingPage, RankingRecord, RankingSet, ScopeKey, SortField};
use crate::error::{Error, Result};

/// Storage for ranking sets
#[async_trait]
pub trait RankingStore: Send + Sync {
    /// Replace the set for `key` and return the new generation
    async fn replace_set(
        &self,
        key: &ScopeKey,
        records: Vec<RankingRecord>,
        calculated_at: DateTime<Utc>,
    ) -> Result<u64>;

    /// One page of the current set; an absent set yields an empty page
    async fn fetch_page(
        &self,
        key: &ScopeKey,
        sort_field: SortField,
        limit: usize,
        offset: usize,
    ) -> Result<RankingPage>;

    /// Current record of one entity within a scope
    async fn entity_rank(&self, key: &ScopeKey, entity_id: i64) -> Result<Option<RankingRecord>>;

    /// The full current set, if any
    async fn load_set(&self, key: &ScopeKey) -> Result<Option<RankingSet>>;

    async fn current_generation(&self, key: &ScopeKey) -> Result<Option<u64>>;
}

fn page_from_set(set: &RankingSet, sort_field: SortField, limit: usize, offset: usize) -> RankingPage {
    RankingPage {
        entity_type: set.key.entity_type,
        time_window: set.key.time_window,
        category_scope: set.key.category_scope,
        sort_field,
        total: set.len(),
        items: set.page(sort_field, limit, offset),
    }
}

// ============================================================================
// In-memory store
// ============================================================================

#[derive(Debug)]
struct StoredSet {
    set: RankingSet,
    positions: HashMap<i64, usize>,
}

impl StoredSet {
    fn new(set: RankingSet) -> Self {
        let positions = set
            .records
            .iter()
            .enumerate()
            .map(|(idx, r)| (r.entity_id, idx))
            .collect();
        Self { set, positions }
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    next_generation: u64,
    current: HashMap<ScopeKey, Arc<StoredSet>>,
}

/// Store keeping every current set in process memory
#[derive(Debug, Default)]
pub struct MemoryRankingStore {
    state: RwLock<MemoryState>,
    failing_writes: AtomicUsize,
    writes: AtomicU64,
    write_delay: Option<Duration>,
}

impl MemoryRankingStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleep before each write, holding nothing; used to widen race windows
    pub fn with_write_delay(mut self, delay: Duration) -> Self {
        self.write_delay = Some(delay);
        self
    }

    /// Make the next `count` writes fail
    pub fn fail_next_writes(&self, count: usize) {
        self.failing_writes.store(count, Ordering::SeqCst);
    }

    /// Number of successful writes so far
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    async fn current(&self, key: &ScopeKey) -> Option<Arc<StoredSet>> {
        self.state.read().await.current.get(key).cloned()
    }
}

#[async_trait]
impl RankingStore for MemoryRankingStore {
    async fn replace_set(
        &self,
        key: &ScopeKey,
        records: Vec<RankingRecord>,
        calculated_at: DateTime<Utc>,
    ) -> Result<u64> {
        if let Some(delay) = self.write_delay {
            tokio::time::sleep(delay).await;
        }

        let fail = self
            .failing_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if fail {
            return Err(Error::PersistenceFailure {
                key: key.to_string(),
                message: "write rejected by store".into(),
                source: None,
            });
        }

        // The new set is fully built before the pointer moves
        let mut state = self.state.write().await;
        state.next_generation += 1;
        let generation = state.next_generation;
        let stored = StoredSet::new(RankingSet {
            key: *key,
            generation,
            calculated_at,
            records,
        });
        state.current.insert(*key, Arc::new(stored));
        drop(state);

        self.writes.fetch_add(1, Ordering::SeqCst);
        debug!("Swapped {} to generation {}", key, generation);
        Ok(generation)
    }

    async fn fetch_page(
        &self,
        key: &ScopeKey,
        sort_field: SortField,
        limit: usize,
        offset: usize,
    ) -> Result<RankingPage> {
        Ok(match self.current(key).await {
            Some(stored) => page_from_set(&stored.set, sort_field, limit, offset),
            None => RankingPage::empty(key, sort_field),
        })
    }

    async fn entity_rank(&self, key: &ScopeKey, entity_id: i64) -> Result<Option<RankingRecord>> {
        Ok(self.current(key).await.and_then(|stored| {
            stored
                .positions
                .get(&entity_id)
                .and_then(|idx| stored.set.records.get(*idx))
                .cloned()
        }))
    }

    async fn load_set(&self, key: &ScopeKey) -> Result<Option<RankingSet>> {
        Ok(self.current(key).await.map(|stored| stored.set.clone()))
    }

    async fn current_generation(&self, key: &ScopeKey) -> Result<Option<u64>> {
        Ok(self.current(key).await.map(|stored| stored.set.generation))
    }
}

// ============================================================================
// PostgreSQL store
// ============================================================================

#[derive(Debug, sqlx::FromRow)]
struct RecordRow {
    entity_id: i64,
    related_id: Option<i64>,
    rank: i32,
    overall_score: f64,
    sales_score: f64,
    popularity_score: f64,
    metrics: serde_json::Value,
    calculated_at: DateTime<Utc>,
}

impl RecordRow {
    fn into_record(self, key: &ScopeKey) -> RankingRecord {
        RankingRecord {
            entity_type: key.entity_type,
            entity_id: self.entity_id,
            related_id: self.related_id,
            time_window: key.time_window,
            category_scope: key.category_scope,
            rank: self.rank.max(0) as u32,
            overall_score: self.overall_score,
            sales_score: self.sales_score,
            popularity_score: self.popularity_score,
            metrics: decode_metrics(self.metrics),
            calculated_at: self.calculated_at,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct GenerationRow {
    generation: i64,
    calculated_at: DateTime<Utc>,
}

/// Unknown metric names in stored JSON are skipped
fn decode_metrics(value: serde_json::Value) -> Metrics {
    match value {
        serde_json::Value::Object(map) => map
            .into_iter()
            .filter_map(|(name, v)| Some((name.parse::<MetricName>().ok()?, v.as_f64()?)))
            .collect(),
        _ => Metrics::new(),
    }
}

fn order_clause(sort_field: SortField) -> String {
    match sort_field {
        SortField::Rank | SortField::OverallScore => "rank ASC".to_string(),
        SortField::SalesScore => "sales_score DESC, rank ASC".to_string(),
        SortField::PopularityScore => "popularity_score DESC, rank ASC".to_string(),
        // metric names come from a closed enum, never from caller input
        SortField::Metric(metric) => format!(
            "COALESCE((metrics->>'{}')::float8, 0) DESC, rank ASC",
            metric.as_str()
        ),
    }
}

const SELECT_RECORDS: &str = r#"
    SELECT r.entity_id, r.related_id, r.rank, r.overall_score, r.sales_score,
           r.popularity_score, r.metrics, r.calculated_at
    FROM ranking_records r
    JOIN ranking_generations g ON g.generation = r.generation
    WHERE g.entity_type = $1 AND g.time_window = $2 AND g.category_scope = $3
"#;

/// Store backed by the `ranking_*` tables
#[derive(Clone)]
pub struct PgRankingStore {
    pool: PgPool,
}

impl PgRankingStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Read-only transaction over one snapshot; the pointer and the rows it
    /// names stay consistent even if a writer swaps generations meanwhile
    async fn begin_snapshot(&self) -> Result<Transaction<'static, Postgres>> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ, READ ONLY")
            .execute(&mut *tx)
            .await?;
        Ok(tx)
    }

    async fn generation_row<'e>(
        executor: impl PgExecutor<'e>,
        key: &ScopeKey,
    ) -> Result<Option<GenerationRow>> {
        let row = sqlx::query_as::<_, GenerationRow>(
            r#"
            SELECT generation, calculated_at FROM ranking_generations
            WHERE entity_type = $1 AND time_window = $2 AND category_scope = $3
            "#,
        )
        .bind(key.entity_type.as_str())
        .bind(key.time_window.as_str())
        .bind(key.category_scope)
        .fetch_optional(executor)
        .await?;
        Ok(row)
    }

    async fn write_set(
        &self,
        key: &ScopeKey,
        records: &[RankingRecord],
        calculated_at: DateTime<Utc>,
    ) -> std::result::Result<i64, sqlx::Error> {
        let mut tx = self.pool.begin().await?;

        // Serializes writers of one key across processes
        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
            .bind(key.to_string())
            .execute(&mut *tx)
            .await?;

        let generation: i64 = sqlx::query_scalar("SELECT nextval('ranking_generation_seq')")
            .fetch_one(&mut *tx)
            .await?;

        let entity_ids: Vec<i64> = records.iter().map(|r| r.entity_id).collect();
        let related_ids: Vec<Option<i64>> = records.iter().map(|r| r.related_id).collect();
        let ranks: Vec<i32> = records.iter().map(|r| r.rank as i32).collect();
        let overall: Vec<f64> = records.iter().map(|r| r.overall_score).collect();
        let sales: Vec<f64> = records.iter().map(|r| r.sales_score).collect();
        let popularity: Vec<f64> = records.iter().map(|r| r.popularity_score).collect();
        let metrics: Vec<serde_json::Value> = records
            .iter()
            .map(|r| serde_json::to_value(&r.metrics).unwrap_or_default())
            .collect();

        sqlx::query(
            r#"
            INSERT INTO ranking_records
                (generation, entity_id, related_id, rank, overall_score,
                 sales_score, popularity_score, metrics, calculated_at)
            SELECT $1::bigint, u.*, $9::timestamptz FROM UNNEST(
                $2::bigint[], $3::bigint[], $4::int[], $5::float8[],
                $6::float8[], $7::float8[], $8::jsonb[]
            ) AS u
            "#,
        )
        .bind(generation)
        .bind(&entity_ids)
        .bind(&related_ids)
        .bind(&ranks)
        .bind(&overall)
        .bind(&sales)
        .bind(&popularity)
        .bind(&metrics)
        .bind(calculated_at)
        .execute(&mut *tx)
        .await?;

        let previous: Option<i64> = sqlx::query_scalar(
            r#"
            SELECT generation FROM ranking_generations
            WHERE entity_type = $1 AND time_window = $2 AND category_scope = $3
            "#,
        )
        .bind(key.entity_type.as_str())
        .bind(key.time_window.as_str())
        .bind(key.category_scope)
        .fetch_optional(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO ranking_generations
                (entity_type, time_window, category_scope, generation, calculated_at, entity_count)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (entity_type, time_window, category_scope)
            DO UPDATE SET generation = EXCLUDED.generation,
                          calculated_at = EXCLUDED.calculated_at,
                          entity_count = EXCLUDED.entity_count
            "#,
        )
        .bind(key.entity_type.as_str())
        .bind(key.time_window.as_str())
        .bind(key.category_scope)
        .bind(generation)
        .bind(calculated_at)
        .bind(records.len() as i32)
        .execute(&mut *tx)
        .await?;

        if let Some(previous) = previous {
            sqlx::query("DELETE FROM ranking_records WHERE generation = $1")
                .bind(previous)
                .execute(&mut *tx)
                .await?;
        }

        sqlx::query(
            r#"
            DELETE FROM entity_rankings
            WHERE entity_type = $1 AND time_window = $2 AND category_scope = $3
            "#,
        )
        .bind(key.entity_type.as_str())
        .bind(key.time_window.as_str())
        .bind(key.category_scope)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO entity_rankings
                (entity_type, entity_id, time_window, category_scope, rank, overall_score, generation)
            SELECT $1, entity_id, $2, $3, rank, overall_score, generation
            FROM ranking_records WHERE generation = $4
            "#,
        )
        .bind(key.entity_type.as_str())
        .bind(key.time_window.as_str())
        .bind(key.category_scope)
        .bind(generation)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(generation)
    }
}

#[async_trait]
impl RankingStore for PgRankingStore {
    #[instrument(skip(self, records), fields(key = %key, count = records.len()))]
    async fn replace_set(
        &self,
        key: &ScopeKey,
        records: Vec<RankingRecord>,
        calculated_at: DateTime<Utc>,
    ) -> Result<u64> {
        let generation = self
            .write_set(key, &records, calculated_at)
            .await
            .map_err(|e| Error::persistence(key.to_string(), e))?;
        debug!("Swapped {} to generation {}", key, generation);
        Ok(generation as u64)
    }

    async fn fetch_page(
        &self,
        key: &ScopeKey,
        sort_field: SortField,
        limit: usize,
        offset: usize,
    ) -> Result<RankingPage> {
        let mut tx = self.begin_snapshot().await?;
        let Some(current) = Self::generation_row(&mut *tx, key).await? else {
            return Ok(RankingPage::empty(key, sort_field));
        };

        let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM ranking_records WHERE generation = $1")
            .bind(current.generation)
            .fetch_one(&mut *tx)
            .await?;

        let sql = format!(
            "{} AND r.generation = $4 ORDER BY {} LIMIT $5 OFFSET $6",
            SELECT_RECORDS,
            order_clause(sort_field)
        );
        let rows = sqlx::query_as::<_, RecordRow>(&sql)
            .bind(key.entity_type.as_str())
            .bind(key.time_window.as_str())
            .bind(key.category_scope)
            .bind(current.generation)
            .bind(limit as i64)
            .bind(offset as i64)
            .fetch_all(&mut *tx)
            .await?;
        tx.commit().await?;

        Ok(RankingPage {
            entity_type: key.entity_type,
            time_window: key.time_window,
            category_scope: key.category_scope,
            sort_field,
            total: total.max(0) as usize,
            items: rows.into_iter().map(|row| row.into_record(key)).collect(),
        })
    }

    async fn entity_rank(&self, key: &ScopeKey, entity_id: i64) -> Result<Option<RankingRecord>> {
        let sql = format!(
            r#"{} AND r.generation = (
                SELECT generation FROM entity_rankings
                WHERE entity_type = $1 AND time_window = $2 AND category_scope = $3
                AND entity_id = $4
            ) AND r.entity_id = $4"#,
            SELECT_RECORDS
        );
        let row = sqlx::query_as::<_, RecordRow>(&sql)
            .bind(key.entity_type.as_str())
            .bind(key.time_window.as_str())
            .bind(key.category_scope)
            .bind(entity_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|row| row.into_record(key)))
    }

    async fn load_set(&self, key: &ScopeKey) -> Result<Option<RankingSet>> {
        let mut tx = self.begin_snapshot().await?;
        let Some(current) = Self::generation_row(&mut *tx, key).await? else {
            return Ok(None);
        };

        let sql = format!("{} AND r.generation = $4 ORDER BY rank ASC", SELECT_RECORDS);
        let rows = sqlx::query_as::<_, RecordRow>(&sql)
            .bind(key.entity_type.as_str())
            .bind(key.time_window.as_str())
            .bind(key.category_scope)
            .bind(current.generation)
            .fetch_all(&mut *tx)
            .await?;
        tx.commit().await?;

        Ok(Some(RankingSet {
            key: *key,
            generation: current.generation as u64,
            calculated_at: current.calculated_at,
            records: rows.into_iter().map(|row| row.into_record(key)).collect(),
        }))
    }

    async fn current_generation(&self, key: &ScopeKey) -> Result<Option<u64>> {
        Ok(Self::generation_row(&self.pool, key)
            .await?
            .map(|row| row.generation as u64))
    }
}
