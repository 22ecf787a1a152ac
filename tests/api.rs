//! HTTP surface exercised through `tower::ServiceExt::oneshot`

mod common;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use common::*;
use market_rankings::api::{router, AppState};
use market_rankings::ranking::{EntityType, TimeWindow};
use serde_json::{json, Value};
use std::sync::Arc;
use tower::ServiceExt;

async fn app() -> (Router, Engine) {
    let engine = engine().await;
    seed_artists(&engine.source).await;
    engine
        .orchestrator
        .recompute(EntityType::Artist, TimeWindow::Month, 0)
        .await
        .unwrap();
    let state = Arc::new(AppState::new(engine.orchestrator.clone(), 100));
    (router(state), engine)
}

async fn send(app: Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, body)
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn with_json(method: &str, uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn item_ids(page: &Value) -> Vec<i64> {
    page["items"]
        .as_array()
        .unwrap()
        .iter()
        .map(|i| i["entity_id"].as_i64().unwrap())
        .collect()
}

#[tokio::test]
async fn health_reports_version() {
    let (app, _) = app().await;
    let (status, body) = send(app, get("/health")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
}

#[tokio::test]
async fn rankings_page_in_rank_order() {
    let (app, _) = app().await;
    let (status, body) = send(app, get("/api/v1/rankings/artists?time_window=month&limit=2")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["total"], 3);
    assert_eq!(item_ids(&body), vec![ARTIST_B, ARTIST_C]);
}

#[tokio::test]
async fn invalid_read_parameters_fall_back_to_defaults() {
    let (app, _) = app().await;
    let (status, body) = send(
        app,
        get("/api/v1/rankings/galleries?time_window=decade&limit=abc&sort=nope"),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["entity_type"], "artist");
    assert_eq!(body["time_window"], "month");
    assert_eq!(body["sort_field"], "overall_score");
    assert_eq!(item_ids(&body), vec![ARTIST_B, ARTIST_C, ARTIST_A]);
}

#[tokio::test]
async fn sort_by_metric() {
    let (app, _) = app().await;
    let (_, body) = send(app, get("/api/v1/rankings/artist?sort=revenue")).await;
    assert_eq!(body["sort_field"], "sales_revenue");
    assert_eq!(item_ids(&body), vec![ARTIST_C, ARTIST_A, ARTIST_B]);
}

#[tokio::test]
async fn entity_rank_lookup() {
    let (app, _) = app().await;
    let (status, body) = send(app.clone(), get("/api/v1/rankings/artist/3?time_window=month")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["rank"], 2);
    assert_eq!(body["state"], "idle");

    let (status, _) = send(app.clone(), get("/api/v1/rankings/artist/999")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = send(app, get("/api/v1/rankings/gallery/3")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn manual_recompute() {
    let (app, engine) = app().await;
    let (status, body) = send(
        app.clone(),
        with_json("POST", "/api/v1/rankings/artist/recompute", json!({"time_window": "week"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["reports"].as_array().unwrap().len(), 1);
    assert_eq!(body["reports"][0]["ranked"], 3);
    assert!(body["failures"].as_array().unwrap().is_empty());

    let (status, _) = send(
        app,
        with_json("POST", "/api/v1/rankings/artist/recompute", json!({"time_window": "fortnight"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    drop(engine);
}

#[tokio::test]
async fn recompute_of_all_windows_reports_each_outcome() {
    let (app, engine) = app().await;
    engine.store.fail_next_writes(1);

    let (status, body) = send(
        app,
        with_json("POST", "/api/v1/rankings/artist/recompute", json!({})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["failures"].as_array().unwrap().len(), 1);
    assert_eq!(
        body["reports"].as_array().unwrap().len(),
        TimeWindow::ALL.len() - 1
    );
}

#[tokio::test]
async fn sale_endpoint_marks_keys_dirty() {
    let (app, engine) = app().await;
    engine.source.insert(EntityType::Artwork, 10, Some(ARTIST_A)).await;

    let (status, body) = send(
        app.clone(),
        with_json("POST", "/api/v1/sales", json!({"artwork_id": 10, "amount": 99.0, "buyer_id": 4})),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["dirty_keys"].as_array().unwrap().len(), TimeWindow::ALL.len() * 2);

    let (status, _) = send(
        app,
        with_json("POST", "/api/v1/sales", json!({"artwork_id": 10, "amount": -1.0, "buyer_id": 4})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    engine.orchestrator.drain().await;
}

#[tokio::test]
async fn weights_update_and_validation() {
    let (app, _) = app().await;

    let (status, body) = send(app.clone(), get("/api/v1/weights")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["artist"]["sales_count"], 35.0);

    let (status, body) = send(
        app.clone(),
        with_json("PUT", "/api/v1/weights/artist", json!({"view_count": 100.0})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["artist"], json!({"view_count": 100.0}));

    let (status, _) = send(
        app.clone(),
        with_json("PUT", "/api/v1/weights/artist", json!({"view_count": -3.0})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = send(
        app,
        with_json("PUT", "/api/v1/weights/tag", json!({"view_count": 1.0})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}
