use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use axum::Router;
use chrono::Utc;
use gcpt_adapters::FixtureSource;
use gcpt_core::ExternalListing;
use gcpt_lifecycle::PipelineService;
use gcpt_storage::{ExternalFilter, MemoryStore, PipelineStore};
use gcpt_sync::{SyncConfig, SyncManager, SyncPipeline};
use gcpt_web::{app, AppState};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt;

fn fixtures_dir() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../../fixtures/sam-gov")
}

fn test_app() -> (Arc<MemoryStore>, Router) {
    let store = Arc::new(MemoryStore::new());
    let source = Arc::new(FixtureSource::from_dir(fixtures_dir()).expect("fixtures load"));
    let config = SyncConfig {
        request_delay: Duration::ZERO,
        defaults_path: PathBuf::from("/nonexistent/sync.yaml"),
        ..Default::default()
    };
    let pipeline = SyncPipeline::new(source, store.clone(), config);
    let state = AppState::new(
        PipelineService::with_store(store.clone()),
        SyncManager::new(pipeline),
    );
    (store, app(state))
}

enum Who {
    Anonymous,
    User,
    Admin,
}

async fn call(app: &Router, method: Method, uri: &str, who: Who, body: Option<Value>) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    match who {
        Who::Anonymous => {}
        Who::User => {
            builder = builder
                .header("x-user-id", "u-1")
                .header("x-organization-id", "org-1");
        }
        Who::Admin => {
            builder = builder
                .header("x-user-id", "admin-1")
                .header("x-organization-id", "org-1")
                .header("x-user-role", "admin");
        }
    }
    let request = match body {
        Some(value) => builder
            .header("content-type", "application/json")
            .body(Body::from(value.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

async fn seed_external(store: &MemoryStore, notice_id: &str, title: &str) -> String {
    store
        .upsert_external(ExternalListing::new(notice_id, title), Utc::now())
        .await
        .unwrap();
    store
        .list_external(&ExternalFilter::default())
        .await
        .unwrap()
        .into_iter()
        .find(|e| e.listing.notice_id == notice_id)
        .unwrap()
        .id
        .to_string()
}

async fn create_opportunity(app: &Router, title: &str) -> String {
    let (status, body) = call(
        app,
        Method::POST,
        "/opportunities",
        Who::User,
        Some(json!({ "title": title, "estimatedValue": 50000.0 })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    body["id"].as_str().unwrap().to_string()
}

#[tokio::test]
async fn health_reports_ok() {
    let (_, app) = test_app();
    let (status, body) = call(&app, Method::GET, "/health", Who::Anonymous, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert!(body["timestamp"].is_string());
}

#[tokio::test]
async fn mutations_require_identity_headers() {
    let (_, app) = test_app();
    let (status, body) = call(
        &app,
        Method::POST,
        "/opportunities",
        Who::Anonymous,
        Some(json!({ "title": "Anything" })),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["code"], "UNAUTHORIZED");
}

#[tokio::test]
async fn promote_external_listing_then_conflict_on_repeat() {
    let (store, app) = test_app();
    let ext_id = seed_external(&store, "EXT-1", "Widget RFP").await;
    let uri = format!("/external-opportunities/{ext_id}/add-to-pipeline");

    let (status, body) = call(
        &app,
        Method::POST,
        &uri,
        Who::User,
        Some(json!({ "organizationId": "org-1" })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["title"], "Widget RFP");
    assert_eq!(body["stage"], "identified");
    assert_eq!(body["status"], "active");
    assert_eq!(body["probability"], 50);
    assert_eq!(body["stageProgress"], 0);

    let (status, body) = call(
        &app,
        Method::POST,
        &uri,
        Who::User,
        Some(json!({ "organizationId": "org-1" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "CONFLICT");

    let (_, ext) = call(&app, Method::GET, &format!("/external-opportunities/{ext_id}"), Who::Anonymous, None).await;
    assert_eq!(ext["addedToPipeline"], true);
}

#[tokio::test]
async fn mark_won_returns_opportunity_and_contract() {
    let (_, app) = test_app();
    let id = create_opportunity(&app, "Data platform").await;

    let (status, body) = call(
        &app,
        Method::POST,
        &format!("/opportunities/{id}/mark-won"),
        Who::User,
        Some(json!({ "contractNumber": "C-100" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["opportunity"]["status"], "won");
    assert_eq!(body["contract"]["contractNumber"], "C-100");
    assert_eq!(body["contract"]["totalValue"], 50000.0);

    let (status, _) = call(
        &app,
        Method::POST,
        &format!("/opportunities/{id}/mark-won"),
        Who::User,
        Some(json!({ "contractNumber": "C-101" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (_, contracts) = call(&app, Method::GET, "/contracts", Who::Anonymous, None).await;
    assert_eq!(contracts.as_array().unwrap().len(), 1);

    // Default listing is active-only.
    let (_, active) = call(&app, Method::GET, "/opportunities", Who::Anonymous, None).await;
    assert!(active.as_array().unwrap().is_empty());
    let (_, all) = call(&app, Method::GET, "/opportunities?status=all", Who::Anonymous, None).await;
    assert_eq!(all.as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn invalid_stage_is_rejected_without_change() {
    let (_, app) = test_app();
    let id = create_opportunity(&app, "Stage check").await;

    let (status, body) = call(
        &app,
        Method::POST,
        &format!("/opportunities/{id}/stage"),
        Who::User,
        Some(json!({ "stage": "NotAStage" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "VALIDATION_ERROR");

    let (_, opp) = call(&app, Method::GET, &format!("/opportunities/{id}"), Who::Anonymous, None).await;
    assert_eq!(opp["stage"], "identified");
}

#[tokio::test]
async fn unknown_body_fields_are_rejected_with_details() {
    let (_, app) = test_app();
    let (status, body) = call(
        &app,
        Method::POST,
        "/opportunities",
        Who::User,
        Some(json!({ "title": "X", "bogus": true })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "VALIDATION_ERROR");
    let details = body["details"].as_array().unwrap();
    assert!(details[0].as_str().unwrap().contains("bogus"));
}

#[tokio::test]
async fn malformed_id_and_missing_record() {
    let (_, app) = test_app();
    let (status, _) = call(&app, Method::GET, "/opportunities/not-a-uuid", Who::Anonymous, None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let missing = uuid::Uuid::new_v4();
    let (status, body) = call(&app, Method::GET, &format!("/contracts/{missing}"), Who::Anonymous, None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "NOT_FOUND");
}

#[tokio::test]
async fn contract_revert_requires_admin() {
    let (_, app) = test_app();
    let id = create_opportunity(&app, "Revert me").await;
    let (_, won) = call(
        &app,
        Method::POST,
        &format!("/opportunities/{id}/mark-won"),
        Who::User,
        Some(json!({ "contractNumber": "C-200" })),
    )
    .await;
    let contract_id = won["contract"]["id"].as_str().unwrap().to_string();
    let uri = format!("/contracts/{contract_id}/revert");

    let (status, body) = call(&app, Method::POST, &uri, Who::User, None).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["code"], "FORBIDDEN");

    let (status, body) = call(&app, Method::POST, &uri, Who::Admin, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["opportunity"]["stage"], "submitted");
    assert_eq!(body["opportunity"]["status"], "active");
}

#[tokio::test]
async fn remove_returns_success_envelope() {
    let (_, app) = test_app();
    let id = create_opportunity(&app, "Short lived").await;
    let (status, body) = call(&app, Method::POST, &format!("/opportunities/{id}/remove"), Who::User, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({ "success": true, "id": id }));

    let (status, _) = call(&app, Method::DELETE, &format!("/opportunities/{id}"), Who::User, None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn sync_imports_fixture_listings_and_records_the_job() {
    let (_, app) = test_app();
    let request = json!({
        "naicsCodes": ["541511"],
        "postedFrom": "2000-01-01",
        "postedTo": "2100-01-01"
    });

    let (status, report) = call(&app, Method::POST, "/sync", Who::User, Some(request.clone())).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(report["imported"], 3);
    assert_eq!(report["errors"], 0);
    assert_eq!(report["cancelled"], false);

    let (_, stats) = call(&app, Method::GET, "/external-opportunities/stats", Who::Anonymous, None).await;
    assert_eq!(stats["total"], 3);
    assert_eq!(stats["inPipeline"], 0);

    let (status, started) = call(&app, Method::POST, "/sync/jobs", Who::User, Some(request)).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let job_id = started["jobId"].as_str().unwrap().to_string();

    let mut state = Value::Null;
    for _ in 0..50 {
        let (status, job) = call(&app, Method::GET, &format!("/sync/jobs/{job_id}"), Who::Anonymous, None).await;
        assert_eq!(status, StatusCode::OK);
        state = job["state"].clone();
        if state != "running" {
            assert_eq!(job["report"]["imported"], 0);
            assert_eq!(job["report"]["updated"], 3);
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(state, "completed");

    let (_, jobs) = call(&app, Method::GET, "/sync/jobs", Who::Anonymous, None).await;
    assert_eq!(jobs.as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn sync_rejects_out_of_range_limit() {
    let (_, app) = test_app();
    let (status, body) = call(&app, Method::POST, "/sync", Who::User, Some(json!({ "limit": 5000 }))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "VALIDATION_ERROR");
}

#[tokio::test]
async fn activity_feed_and_outbox() {
    let (_, app) = test_app();
    let id = create_opportunity(&app, "Audited").await;
    call(
        &app,
        Method::POST,
        &format!("/opportunities/{id}/stage"),
        Who::User,
        Some(json!({ "stage": "capture" })),
    )
    .await;

    let (status, feed) = call(&app, Method::GET, &format!("/opportunities/{id}/activities"), Who::Anonymous, None).await;
    assert_eq!(status, StatusCode::OK);
    let types: Vec<&str> = feed
        .as_array()
        .unwrap()
        .iter()
        .map(|a| a["activityType"].as_str().unwrap())
        .collect();
    assert!(types.contains(&"stage_change"));
    assert!(types.contains(&"created"));

    let (status, outbox) = call(&app, Method::GET, "/activities/outbox", Who::Anonymous, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(outbox["pending"], 0);
}
