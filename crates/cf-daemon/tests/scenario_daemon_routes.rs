//! In-process scenario tests for cf-daemon HTTP endpoints.
//!
//! These are DB-backed (every handler touches Postgres) and skip cleanly
//! when `CF_TEST_DATABASE_URL` is not set, mirroring cf-db's own tests.
//! Each test drives the bare router via `tower::ServiceExt::oneshot` — no
//! TCP socket is bound.

use std::sync::Arc;

use axum::http::{Request, StatusCode};
use cf_daemon::{routes, state::AppState};
use http_body_util::BodyExt;
use tower::ServiceExt;

async fn make_state() -> Option<Arc<AppState>> {
    if std::env::var(cf_testkit::ENV_TEST_DATABASE_URL).is_err() {
        eprintln!("SKIP: {} not set", cf_testkit::ENV_TEST_DATABASE_URL);
        return None;
    }

    std::env::set_var("CF_DATABASE_URL", "postgres://unused/unused");
    std::env::set_var("CF_ENCRYPTION_KEY", "a".repeat(32));
    std::env::set_var("CF_WEBHOOK_SECRET", "b".repeat(32));
    let config = cf_config::Config::from_env().expect("env vars set above satisfy from_env");

    let pool = cf_testkit::connect().await.expect("connect to test database");
    cf_testkit::truncate_all(&pool).await.expect("truncate fixtures");

    let (updates, _) = tokio::sync::broadcast::channel(16);
    let state = AppState::new(&config, pool, updates).expect("AppState::new");
    Some(Arc::new(state))
}

async fn call(router: axum::Router, req: Request<axum::body::Body>) -> (StatusCode, bytes::Bytes) {
    let resp = router.oneshot(req).await.expect("oneshot failed");
    let status = resp.status();
    let body = resp.into_body().collect().await.expect("body collect failed").to_bytes();
    (status, body)
}

fn parse_json(b: bytes::Bytes) -> serde_json::Value {
    serde_json::from_slice(&b).expect("body is not valid JSON")
}

#[tokio::test]
async fn health_returns_200_ok_true() {
    let Some(st) = make_state().await else { return };
    let router = routes::build_router(st);
    let req = Request::builder().method("GET").uri("/health").body(axum::body::Body::empty()).unwrap();

    let (status, body) = call(router, req).await;
    assert_eq!(status, StatusCode::OK);
    let json = parse_json(body);
    assert_eq!(json["ok"], true);
    assert_eq!(json["service"], "cf-daemon");
}

#[tokio::test]
async fn unknown_route_returns_404() {
    let Some(st) = make_state().await else { return };
    let router = routes::build_router(st);
    let req = Request::builder().method("GET").uri("/does-not-exist").body(axum::body::Body::empty()).unwrap();

    let (status, _) = call(router, req).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn create_then_get_application_round_trips_decrypted_pii() {
    let Some(st) = make_state().await else { return };
    let pool = st.pool.clone();

    let body = serde_json::json!({
        "country": "ES",
        "full_name": "Ana Garcia",
        "identity_document": format!("12345678Z-{}", uuid::Uuid::new_v4()),
        "requested_amount": "5000.00",
        "monthly_income": "2200.00",
        "currency": "EUR",
    });

    let req = Request::builder()
        .method("POST")
        .uri("/applications")
        .header("content-type", "application/json")
        .body(axum::body::Body::from(body.to_string()))
        .unwrap();
    let (status, resp_body) = call(routes::build_router(Arc::clone(&st)), req).await;
    assert_eq!(status, StatusCode::CREATED);

    let created = parse_json(resp_body);
    let id = created["id"].as_str().unwrap().to_string();
    assert_eq!(created["status"], "PENDING");

    let req = Request::builder()
        .method("GET")
        .uri(format!("/applications/{id}"))
        .body(axum::body::Body::empty())
        .unwrap();
    let (status, resp_body) = call(routes::build_router(Arc::clone(&st)), req).await;
    assert_eq!(status, StatusCode::OK);
    let fetched = parse_json(resp_body);
    assert_eq!(fetched["full_name"], "Ana Garcia");

    cf_testkit::truncate_all(&pool).await.unwrap();
}

#[tokio::test]
async fn duplicate_active_application_returns_409() {
    let Some(st) = make_state().await else { return };
    let pool = st.pool.clone();

    let doc = format!("99887766X-{}", uuid::Uuid::new_v4());
    let body = serde_json::json!({
        "country": "ES",
        "full_name": "Jose Ruiz",
        "identity_document": doc,
        "requested_amount": "1000.00",
        "monthly_income": "1500.00",
        "currency": "EUR",
    });

    let req = Request::builder()
        .method("POST")
        .uri("/applications")
        .header("content-type", "application/json")
        .body(axum::body::Body::from(body.to_string()))
        .unwrap();
    let (status, _) = call(routes::build_router(Arc::clone(&st)), req).await;
    assert_eq!(status, StatusCode::CREATED);

    let req = Request::builder()
        .method("POST")
        .uri("/applications")
        .header("content-type", "application/json")
        .body(axum::body::Body::from(body.to_string()))
        .unwrap();
    let (status, _) = call(routes::build_router(Arc::clone(&st)), req).await;
    assert_eq!(status, StatusCode::CONFLICT);

    cf_testkit::truncate_all(&pool).await.unwrap();
}

#[tokio::test]
async fn repeat_idempotency_key_returns_201_with_existing_id() {
    let Some(st) = make_state().await else { return };
    let pool = st.pool.clone();

    let body = serde_json::json!({
        "country": "MX",
        "full_name": "Carlos Mendez",
        "identity_document": format!("CURP-{}", uuid::Uuid::new_v4()),
        "requested_amount": "3000.00",
        "monthly_income": "4500.00",
        "currency": "MXN",
        "idempotency_key": "k1",
    });

    let req = Request::builder()
        .method("POST")
        .uri("/applications")
        .header("content-type", "application/json")
        .body(axum::body::Body::from(body.to_string()))
        .unwrap();
    let (status, resp_body) = call(routes::build_router(Arc::clone(&st)), req).await;
    assert_eq!(status, StatusCode::CREATED);
    let first_id = parse_json(resp_body)["id"].as_str().unwrap().to_string();

    let req = Request::builder()
        .method("POST")
        .uri("/applications")
        .header("content-type", "application/json")
        .body(axum::body::Body::from(body.to_string()))
        .unwrap();
    let (status, resp_body) = call(routes::build_router(Arc::clone(&st)), req).await;
    assert_eq!(status, StatusCode::CREATED);
    let second_id = parse_json(resp_body)["id"].as_str().unwrap().to_string();

    assert_eq!(first_id, second_id, "repeat idempotency key must return the same application");

    cf_testkit::truncate_all(&pool).await.unwrap();
}

#[tokio::test]
async fn bank_confirmation_webhook_rejects_missing_signature() {
    let Some(st) = make_state().await else { return };
    let router = routes::build_router(st);

    let req = Request::builder()
        .method("POST")
        .uri("/webhooks/bank-confirmation")
        .header("content-type", "application/json")
        .body(axum::body::Body::from("{}"))
        .unwrap();
    let (status, _) = call(router, req).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn admin_circuit_breaker_snapshot_starts_empty() {
    let Some(st) = make_state().await else { return };
    let router = routes::build_router(st);

    let req = Request::builder()
        .method("GET")
        .uri("/admin/circuit-breakers")
        .body(axum::body::Body::empty())
        .unwrap();
    let (status, body) = call(router, req).await;
    assert_eq!(status, StatusCode::OK);
    let json = parse_json(body);
    assert!(json["breakers"].as_array().unwrap().is_empty());
}
