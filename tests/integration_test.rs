use axum::http::StatusCode;
use binmatrix::api::{self, AppState};
use binmatrix::config::Config;
use binmatrix::db::init_db;
use binmatrix::engine::EngineConfig;
use binmatrix::{Journal, MatrixService, MemberId, Money, Repository};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tower::util::ServiceExt;

async fn setup_test_app(engine: EngineConfig) -> (axum::Router, TempDir) {
    let temp_dir = TempDir::new().unwrap();
    let db_path = temp_dir
        .path()
        .join("test.db")
        .to_string_lossy()
        .to_string();

    let pool = init_db(&db_path).await.expect("init_db failed");
    let journal: Arc<dyn Journal> = Arc::new(Repository::new(pool));

    let config = Config {
        port: 0,
        database_path: db_path,
        engine: engine.clone(),
        contention_budget: Duration::from_millis(500),
        overflow_sweep: None,
    };
    let service = MatrixService::open(engine, journal, config.contention_budget)
        .await
        .expect("open failed");

    (
        api::create_router(AppState::new(service, config)),
        temp_dir,
    )
}

async fn send(app: &axum::Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let builder = axum::http::Request::builder().method(method).uri(uri);
    let request = match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(axum::body::Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(axum::body::Body::empty()).unwrap(),
    };

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let json = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, json)
}

fn money(value: &Value) -> Money {
    Money::from_str_canonical(value.as_str().expect("money is a string")).unwrap()
}

async fn place(app: &axum::Router, member: MemberId, upline: Option<MemberId>) -> (StatusCode, Value) {
    let mut body = json!({ "memberId": member.to_string() });
    if let Some(upline) = upline {
        body["uplineMemberId"] = json!(upline.to_string());
    }
    send(app, "POST", "/v1/placements", Some(body)).await
}

#[tokio::test]
async fn test_health_endpoint() {
    let (app, _temp) = setup_test_app(EngineConfig::default()).await;
    let (status, body) = send(&app, "GET", "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");

    let (status, body) = send(&app, "GET", "/ready", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ready");
}

#[tokio::test]
async fn test_place_and_fetch_position() {
    let (app, _temp) = setup_test_app(EngineConfig::default()).await;
    let root = MemberId::random();
    let child = MemberId::random();

    let (status, body) = place(&app, root, None).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["status"], "placed");
    assert_eq!(body["position"]["level"], 0);

    let (status, body) = place(&app, child, Some(root)).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["position"]["leg"], "left");

    let (status, body) = send(
        &app,
        "GET",
        &format!("/v1/members/{}/position", child),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["memberId"], child.to_string());
    assert_eq!(body["level"], 1);
}

#[tokio::test]
async fn test_volume_stats_and_matching_commission() {
    let (app, _temp) = setup_test_app(EngineConfig::default()).await;
    let (root, m2, m3) = (MemberId::random(), MemberId::random(), MemberId::random());
    place(&app, root, None).await;
    place(&app, m2, Some(root)).await;
    place(&app, m3, Some(root)).await;

    for (member, amount) in [(m2, "1000"), (m3, "400")] {
        let (status, body) = send(
            &app,
            "POST",
            "/v1/volume",
            Some(json!({ "memberId": member.to_string(), "amount": amount })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(money(&body["entry"]["amount"]), Money::from_str_canonical(amount).unwrap());
    }

    let (status, stats) = send(&app, "GET", &format!("/v1/members/{}/stats", root), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(money(&stats["leftVolume"]), Money::from_units(1000));
    assert_eq!(money(&stats["rightVolume"]), Money::from_units(400));
    assert_eq!(stats["weakerLeg"], "right");
    assert_eq!(money(&stats["totalVolume"]), Money::from_units(1400));

    let (status, matching) = send(
        &app,
        "GET",
        &format!("/v1/members/{}/commission/matching", root),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(money(&matching["commission"]), Money::from_units(40));

    let (status, settled) = send(
        &app,
        "POST",
        &format!("/v1/members/{}/commission/settle", root),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(money(&settled["settled"]["amount"]), Money::from_units(40));

    let (_, history) = send(
        &app,
        "GET",
        &format!("/v1/members/{}/commissions", root),
        None,
    )
    .await;
    let kinds: Vec<&str> = history
        .as_array()
        .unwrap()
        .iter()
        .map(|c| c["kind"]["type"].as_str().unwrap())
        .collect();
    assert!(kinds.contains(&"matching"));
    assert!(kinds.contains(&"level"));
}

#[tokio::test]
async fn test_error_statuses() {
    let (app, _temp) = setup_test_app(EngineConfig::default()).await;
    let root = MemberId::random();
    place(&app, root, None).await;

    let (status, body) = send(&app, "GET", "/v1/members/not-a-uuid/position", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("Invalid member id"));

    let (status, _) = send(
        &app,
        "GET",
        &format!("/v1/members/{}/stats", MemberId::random()),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = place(&app, root, None).await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, _) = place(&app, MemberId::random(), Some(MemberId::random())).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = send(
        &app,
        "POST",
        "/v1/volume",
        Some(json!({ "memberId": root.to_string(), "amount": "-3" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = send(&app, "DELETE", &format!("/v1/members/{}", root), None).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_deferred_placement_and_overflow_resolution() {
    let (app, _temp) = setup_test_app(EngineConfig {
        max_search_depth: 1,
        ..EngineConfig::default()
    })
    .await;
    let (root, left) = (MemberId::random(), MemberId::random());
    place(&app, root, None).await;
    place(&app, left, Some(root)).await;
    place(&app, MemberId::random(), Some(root)).await;

    let late = MemberId::random();
    let (status, body) = place(&app, late, Some(root)).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["status"], "deferred");
    let overflow_id = body["overflowId"].as_u64().unwrap();

    let (_, pending) = send(&app, "GET", &format!("/v1/members/{}/overflow", root), None).await;
    assert_eq!(pending.as_array().unwrap().len(), 1);
    assert_eq!(pending[0]["status"], "pending");

    let (status, body) = send(&app, "POST", &format!("/v1/overflow/{}/resolve", overflow_id), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "stillDeferred");

    let (status, _) = send(&app, "DELETE", &format!("/v1/members/{}", left), None).await;
    assert_eq!(status, StatusCode::OK);

    let (status, report) = send(&app, "POST", "/v1/overflow/resolve-all", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(report["placed"], json!([overflow_id]));

    let (status, _) = send(&app, "GET", &format!("/v1/members/{}/position", late), None).await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = send(&app, "POST", &format!("/v1/overflow/{}/resolve", overflow_id), None).await;
    assert_eq!(status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn test_subtree_pagination_and_audit() {
    let (app, _temp) = setup_test_app(EngineConfig::default()).await;
    let root = MemberId::random();
    place(&app, root, None).await;
    for _ in 0..5 {
        place(&app, MemberId::random(), Some(root)).await;
    }

    let (status, first) = send(
        &app,
        "GET",
        &format!("/v1/members/{}/subtree?limit=4", root),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(first["positions"].as_array().unwrap().len(), 4);
    let cursor = first["nextCursor"].as_u64().unwrap();

    let (_, second) = send(
        &app,
        "GET",
        &format!("/v1/members/{}/subtree?limit=4&after={}", root, cursor),
        None,
    )
    .await;
    assert_eq!(second["positions"].as_array().unwrap().len(), 2);
    assert!(second["nextCursor"].is_null());

    let (status, _) = send(
        &app,
        "GET",
        &format!("/v1/members/{}/subtree?limit=0", root),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, audit) = send(&app, "GET", "/v1/audit/invariants", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(audit["positions"], 6);
    assert_eq!(audit["violations"], json!([]));

    let (status, perf) = send(
        &app,
        "GET",
        &format!("/v1/members/{}/performance", root),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(perf["totalMembers"], 5);
}

#[tokio::test]
async fn test_rebalance_endpoint_reports_nothing_on_empty_tree() {
    let (app, _temp) = setup_test_app(EngineConfig::default()).await;
    let root = MemberId::random();
    place(&app, root, None).await;

    let (status, body) = send(
        &app,
        "POST",
        "/v1/rebalance",
        Some(json!({ "memberId": root.to_string() })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "nothingToRebalance");

    let (status, history) = send(
        &app,
        "GET",
        &format!("/v1/members/{}/rebalances", root),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(history, json!([]));
}
