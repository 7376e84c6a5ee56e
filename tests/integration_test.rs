mod util;

use actix_web::http::StatusCode;
use actix_web::test;
use chrono::Duration;
use serde_json::{json, Value};
use util::common::{self, Fleet, API_KEY};

use backup_orchestrator::adapters::TaskScheduler;
use backup_orchestrator::clock::Clock;
use backup_orchestrator::types::DatabaseKind;
use backup_orchestrator::worker::simulated::SimulatedHost;

fn authed(req: test::TestRequest) -> test::TestRequest {
    req.insert_header(("x-api-key", API_KEY))
}

#[actix_web::test]
async fn test_health_endpoints() {
    let fleet = Fleet::new();
    let app = common::get_test_app(&fleet).await;

    let req = test::TestRequest::get().uri("/health/ready").to_request();
    let resp = test::call_service(&app, req).await;
    assert!(resp.status().is_success());

    let req = test::TestRequest::get().uri("/health/lively").to_request();
    let resp = test::call_service(&app, req).await;
    assert!(resp.status().is_success());

    let req = test::TestRequest::get().uri("/notapath").to_request();
    let resp = test::call_service(&app, req).await;
    assert!(resp.status().is_client_error());
}

#[actix_web::test]
async fn test_backup_routes_require_api_key() {
    let fleet = Fleet::new();
    let app = common::get_test_app(&fleet).await;

    let req = test::TestRequest::post().uri("/backup/postgres").to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["success"], false);
    assert!(body["message"].as_str().unwrap().contains("x-api-key"));

    let req = test::TestRequest::get()
        .uri("/backup/tasks")
        .insert_header(("x-api-key", "not-the-key"))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

    // nothing reached the queue
    assert!(fleet.queue.published("postgres-backup-trigger").is_empty());
}

#[actix_web::test]
async fn test_invalid_requests_are_bad_requests() {
    let fleet = Fleet::new();
    let app = common::get_test_app(&fleet).await;

    let req = authed(test::TestRequest::post().uri("/backup/mysql")).to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["success"], false);
    assert!(body["message"].as_str().unwrap().contains("mysql"));

    for body in [json!({"delayMinutes": 0}), json!({"delayMinutes": 43_201}), json!({})] {
        let req = authed(test::TestRequest::post().uri("/backup/mongodb/schedule"))
            .set_json(&body)
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST, "{body}");
    }

    let req = authed(test::TestRequest::post().uri("/backup/mongodb/schedule"))
        .set_json(json!({"delayMinutes": "soon"}))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    let req = authed(test::TestRequest::get().uri("/backup/download")).to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    let req = authed(test::TestRequest::delete().uri("/backup/delete?fileName=../etc/passwd"))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    let req = authed(test::TestRequest::get().uri("/backup/tasks/not-a-task-id")).to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    assert!(fleet.scheduler.list_tasks().await.unwrap().is_empty());
}

#[actix_web::test]
async fn test_triggered_backup_lands_in_storage() {
    let fleet = Fleet::new();
    let app = common::get_test_app(&fleet).await;
    let host = SimulatedHost::new("10.0.0.5:22");
    let consumer = fleet.consumer(DatabaseKind::Postgres, &host);

    let req = authed(test::TestRequest::post().uri("/backup/postgres")).to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::OK);
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["success"], true);
    assert!(body["messageId"].as_str().is_some());
    assert_eq!(fleet.queue.pending("postgres-backup-trigger"), 1);

    assert_eq!(consumer.poll_once().await.unwrap(), 1);
    assert_eq!(fleet.queue.pending("postgres-backup-trigger"), 0);
    assert_eq!(fleet.queue.in_flight(), 0);
    assert!(host.files().is_empty());

    // a second run a minute later sorts first
    fleet.clock.advance(Duration::minutes(1));
    let req = authed(test::TestRequest::post().uri("/backup/postgres")).to_request();
    test::call_service(&app, req).await;
    assert_eq!(consumer.poll_once().await.unwrap(), 1);

    let req = authed(test::TestRequest::get().uri("/backup/postgres/list")).to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::OK);
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["count"], 2);
    assert_eq!(body["message"], "2 postgres backup(s)");
    let newest = &body["data"][0];
    let oldest = &body["data"][1];
    assert!(newest["created"].as_str() > oldest["created"].as_str());
    assert_eq!(newest["database"], "postgres");
    assert_eq!(newest["metadata"]["triggeredBy"], "manual");
    let name = newest["name"].as_str().unwrap().to_string();
    assert!(name.starts_with("postgres/"));
    assert!(name.ends_with(".sql.gz"));

    // other kinds see nothing
    let req = authed(test::TestRequest::get().uri("/backup/mongodb/list")).to_request();
    let body: Value = test::read_body_json(test::call_service(&app, req).await).await;
    assert_eq!(body["count"], 0);

    let req = authed(test::TestRequest::get().uri(&format!(
        "/backup/download?fileName={name}&expiresInMinutes=15"
    )))
    .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::OK);
    let body: Value = test::read_body_json(resp).await;
    assert!(body["signedUrl"].as_str().unwrap().contains(&name));
    let expires_at = (common::start() + Duration::minutes(16)).to_rfc3339_opts(
        chrono::SecondsFormat::Secs,
        true,
    );
    assert_eq!(body["expiresAt"], expires_at);

    let req = authed(test::TestRequest::delete().uri(&format!("/backup/delete?fileName={name}")))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(fleet.blobs.object_count(), 1);

    // gone now
    let req = authed(test::TestRequest::get().uri(&format!("/backup/download?fileName={name}")))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    let req = authed(test::TestRequest::delete().uri(&format!("/backup/delete?fileName={name}")))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

#[actix_web::test]
async fn test_scheduled_backup_lifecycle() {
    let fleet = Fleet::new();
    let app = common::get_test_app(&fleet).await;

    let req = authed(test::TestRequest::post().uri("/backup/mongodb/schedule"))
        .set_json(json!({"delayMinutes": 5}))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::OK);
    let body: Value = test::read_body_json(resp).await;
    let task_id = body["taskId"].as_str().unwrap().to_string();
    assert!(task_id.starts_with("mongodb-backup-"));
    assert!(body["taskName"]
        .as_str()
        .unwrap()
        .ends_with(&format!("/tasks/{task_id}")));
    // nothing is published until the task fires
    assert!(fleet.queue.published("mongodb-backup-trigger").is_empty());

    let req = authed(test::TestRequest::get().uri("/backup/tasks")).to_request();
    let body: Value = test::read_body_json(test::call_service(&app, req).await).await;
    assert_eq!(body["count"], 1);
    assert_eq!(body["data"][0]["taskId"], task_id.as_str());
    assert_eq!(body["data"][0]["database"], "mongodb");
    assert_eq!(body["data"][0]["state"], "pending");

    let req = authed(test::TestRequest::get().uri(&format!("/backup/tasks/{task_id}"))).to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::OK);
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["data"]["detail"]["payload"]["database"], "mongodb");
    assert_eq!(body["data"]["detail"]["payload"]["triggeredBy"], "scheduled-task");

    let req =
        authed(test::TestRequest::delete().uri(&format!("/backup/tasks/{task_id}"))).to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::OK);

    let req = authed(test::TestRequest::get().uri(&format!("/backup/tasks/{task_id}"))).to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    let req =
        authed(test::TestRequest::delete().uri(&format!("/backup/tasks/{task_id}"))).to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);

    // a cancelled task never fires
    fleet.clock.advance(Duration::minutes(10));
    assert_eq!(
        fleet
            .scheduler
            .fire_due(fleet.clock.now(), fleet.queue.as_ref())
            .await,
        0
    );
}

#[actix_web::test]
async fn test_scheduled_backup_fires_into_worker() {
    let fleet = Fleet::new();
    let app = common::get_test_app(&fleet).await;
    let host = SimulatedHost::new("10.0.0.5:22");
    let consumer = fleet.consumer(DatabaseKind::Qdrantdb, &host);

    let req = authed(test::TestRequest::post().uri("/backup/qdrantdb/schedule"))
        .set_json(json!({"delayMinutes": 30}))
        .to_request();
    let body: Value = test::read_body_json(test::call_service(&app, req).await).await;
    let task_id = body["taskId"].as_str().unwrap().to_string();

    // not due yet
    fleet.clock.advance(Duration::minutes(29));
    assert_eq!(
        fleet
            .scheduler
            .fire_due(fleet.clock.now(), fleet.queue.as_ref())
            .await,
        0
    );
    assert_eq!(consumer.poll_once().await.unwrap(), 0);

    fleet.clock.advance(Duration::minutes(1));
    assert_eq!(
        fleet
            .scheduler
            .fire_due(fleet.clock.now(), fleet.queue.as_ref())
            .await,
        1
    );
    assert_eq!(consumer.poll_once().await.unwrap(), 1);

    // fired tasks are deleted by the scheduler
    let req = authed(test::TestRequest::get().uri(&format!("/backup/tasks/{task_id}"))).to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);

    let req = authed(test::TestRequest::get().uri("/backup/qdrantdb/list")).to_request();
    let body: Value = test::read_body_json(test::call_service(&app, req).await).await;
    assert_eq!(body["count"], 1);
    let artifact = &body["data"][0];
    assert_eq!(artifact["metadata"]["triggeredBy"], "scheduled-task");
    assert!(artifact["metadata"]["snapshotName"].as_str().is_some());
    assert!(artifact["storageUrl"]
        .as_str()
        .unwrap()
        .starts_with("memory://backups/qdrantdb/"));
    assert!(host.files().is_empty());
    assert_eq!(host.open_sessions(), 0);
}
