//! Ranking store against a live PostgreSQL
//!
//! Run with `DATABASE_URL=postgres://... cargo test -- --ignored`.

use chrono::Utc;
use market_rankings::config::DatabaseConfig;
use market_rankings::database::{run_migrations, Database};
use market_rankings::ranking::types::{MetricName, Metrics, RankingRecord, ScopeKey, SortField};
use market_rankings::ranking::{EntityType, PgRankingStore, RankingStore, TimeWindow};
use std::time::Duration;

fn record(key: &ScopeKey, entity_id: i64, rank: u32, score: f64) -> RankingRecord {
    let mut metrics = Metrics::new();
    metrics.insert(MetricName::LikeCount, (100 - entity_id) as f64);
    RankingRecord {
        entity_type: key.entity_type,
        entity_id,
        related_id: Some(entity_id * 10),
        time_window: key.time_window,
        category_scope: key.category_scope,
        rank,
        overall_score: score,
        sales_score: score / 2.0,
        popularity_score: score / 2.0,
        metrics,
        calculated_at: Utc::now(),
    }
}

async fn connect() -> Option<Database> {
    let url = std::env::var("DATABASE_URL").ok()?;
    let db = Database::new(&DatabaseConfig {
        url,
        max_connections: 4,
        min_connections: 1,
        connect_timeout: Duration::from_secs(5),
        idle_timeout: Duration::from_secs(60),
        max_lifetime: Duration::from_secs(300),
        statement_cache_size: 10,
    })
    .await
    .unwrap();
    run_migrations(db.pool()).await.unwrap();
    Some(db)
}

fn records(key: &ScopeKey, count: i64) -> Vec<RankingRecord> {
    (1..=count)
        .map(|id| record(key, id, id as u32, 100.0 - id as f64))
        .collect()
}

#[tokio::test]
#[ignore = "requires DATABASE_URL"]
async fn generations_replace_atomically() {
    let Some(db) = connect().await else {
        return;
    };

    let store = PgRankingStore::new(db.pool().clone());
    // a scope no real data uses
    let key = ScopeKey::new(EntityType::Artwork, TimeWindow::Year, 987_654_321);

    let first = store
        .replace_set(&key, vec![record(&key, 1, 1, 90.0), record(&key, 2, 2, 80.0)], Utc::now())
        .await
        .unwrap();
    let second = store
        .replace_set(
            &key,
            vec![
                record(&key, 2, 1, 95.0),
                record(&key, 1, 2, 85.0),
                record(&key, 3, 3, 10.0),
            ],
            Utc::now(),
        )
        .await
        .unwrap();
    assert!(second > first);
    assert_eq!(store.current_generation(&key).await.unwrap(), Some(second));

    let page = store
        .fetch_page(&key, SortField::OverallScore, 2, 0)
        .await
        .unwrap();
    assert_eq!(page.total, 3);
    let ids: Vec<i64> = page.items.iter().map(|r| r.entity_id).collect();
    assert_eq!(ids, vec![2, 1]);
    assert_eq!(page.items[0].metrics.get(&MetricName::LikeCount), Some(&98.0));

    let by_likes = store
        .fetch_page(&key, SortField::Metric(MetricName::LikeCount), 3, 0)
        .await
        .unwrap();
    assert_eq!(by_likes.items[0].entity_id, 1);

    let rank = store.entity_rank(&key, 3).await.unwrap().unwrap();
    assert_eq!(rank.rank, 3);
    assert!(store.entity_rank(&key, 42).await.unwrap().is_none());

    store.replace_set(&key, Vec::new(), Utc::now()).await.unwrap();
    let empty = store
        .fetch_page(&key, SortField::OverallScore, 10, 0)
        .await
        .unwrap();
    assert_eq!(empty.total, 0);

    db.close().await;
}

#[tokio::test]
#[ignore = "requires DATABASE_URL"]
async fn reads_during_swaps_see_one_whole_generation() {
    let Some(db) = connect().await else {
        return;
    };
    let store = PgRankingStore::new(db.pool().clone());
    let key = ScopeKey::new(EntityType::Artist, TimeWindow::Year, 987_654_322);
    store.replace_set(&key, records(&key, 3), Utc::now()).await.unwrap();

    let writer = {
        let store = store.clone();
        tokio::spawn(async move {
            for i in 0..40 {
                let count = if i % 2 == 0 { 5 } else { 3 };
                store.replace_set(&key, records(&key, count), Utc::now()).await.unwrap();
            }
        })
    };

    for _ in 0..200 {
        let page = store
            .fetch_page(&key, SortField::OverallScore, 10, 0)
            .await
            .unwrap();
        assert!(page.total == 3 || page.total == 5, "total {}", page.total);
        assert_eq!(page.items.len(), page.total);

        let set = store.load_set(&key).await.unwrap().unwrap();
        assert!(set.records.len() == 3 || set.records.len() == 5);
    }

    writer.await.unwrap();
    db.close().await;
}
