//! Login, purchases and task completion through the household client.

mod support;

use hearth_sync::gateway::IDEMPOTENCY_KEY_HEADER;
use hearth_sync::{HouseholdClient, SyncError};
use hearth_test_utils::fixtures;
use serde_json::json;
use std::sync::Arc;
use support::{client, FakePushTransport, Reply, ScriptedTransport};

async fn signed_in(child_points: i64) -> (Arc<ScriptedTransport>, Arc<HouseholdClient>) {
    let http = ScriptedTransport::new();
    http.serve_household(child_points);
    http.serve_login("T1");
    let client = client(&http, &FakePushTransport::new());
    client.login("pat@example.com", "hunter2").await.unwrap();
    (http, client)
}

#[tokio::test(start_paused = true)]
async fn test_login_authenticates_and_loads() {
    let http = ScriptedTransport::new();
    http.serve_household(40);
    http.serve_login("T1");
    let client = client(&http, &FakePushTransport::new());

    let report = client.login("pat@example.com", "hunter2").await.unwrap();
    assert!(report.is_some_and(|r| r.committed));

    let session = client.session().current().unwrap();
    assert_eq!(session.token, "T1");
    assert_eq!(session.user.id.as_str(), fixtures::PARENT_ID);
    assert_eq!(session.household_id.unwrap().as_str(), fixtures::HOUSEHOLD_ID);

    // The cold-start probe goes first and never carries credentials.
    let requests = http.requests();
    assert!(requests[0].url.ends_with("/health"));
    assert!(requests[0].header("authorization").is_none());
    let login = http.last_to("/auth/login").unwrap();
    assert_eq!(login.body, Some(json!({"email": "pat@example.com", "password": "hunter2"})));
    assert!(login.header(IDEMPOTENCY_KEY_HEADER).is_some());
    assert_eq!(client.cache().member_points(fixtures::CHILD_ID), Some(40));
}

#[tokio::test(start_paused = true)]
async fn test_login_survives_failed_wake_up() {
    let http = ScriptedTransport::new();
    http.serve_household(40);
    http.serve_login("T1");
    http.route("/health", Reply::Hang);
    let client = client(&http, &FakePushTransport::new());

    assert!(client.login("pat@example.com", "hunter2").await.is_ok());
    assert!(client.session().is_authenticated());
}

#[tokio::test(start_paused = true)]
async fn test_login_rejection_leaves_session_empty() {
    let http = ScriptedTransport::new();
    http.route("/health", Reply::Json(200, json!({})));
    http.route(
        "/auth/login",
        Reply::Json(400, fixtures::error_body("Invalid email or password")),
    );
    let client = client(&http, &FakePushTransport::new());

    let err = client.login("pat@example.com", "wrong").await.unwrap_err();
    assert_eq!(err.to_string(), "Invalid email or password");
    assert!(!client.session().is_authenticated());
}

#[tokio::test(start_paused = true)]
async fn test_purchase_with_insufficient_points_never_applies() {
    let (http, client) = signed_in(40).await;

    let err = client
        .purchase_item(fixtures::CHILD_ID, "s1")
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        SyncError::InsufficientPoints {
            needed: 50,
            available: 40
        }
    ));
    assert_eq!(client.cache().member_points(fixtures::CHILD_ID), Some(40));
    assert_eq!(http.count("/store/s1/purchase"), 0);
}

#[tokio::test(start_paused = true)]
async fn test_purchase_takes_server_confirmed_total() {
    let (http, client) = signed_in(100).await;
    http.route(
        "/store/s1/purchase",
        Reply::Json(200, fixtures::envelope(json!({"newPointsTotal": 50}))),
    );

    let balance = client.purchase_item(fixtures::CHILD_ID, "s1").await.unwrap();
    assert_eq!(balance, 50);
    assert_eq!(client.cache().member_points(fixtures::CHILD_ID), Some(50));

    let purchase = http.last_to("/store/s1/purchase").unwrap();
    assert_eq!(purchase.body, Some(json!({"memberId": fixtures::CHILD_ID})));
}

#[tokio::test(start_paused = true)]
async fn test_server_total_overrides_optimistic_guess() {
    let (http, client) = signed_in(100).await;
    // A bonus landed server-side between load and purchase.
    http.route(
        "/store/s1/purchase",
        Reply::Json(200, fixtures::envelope(json!({"newPointsTotal": 65}))),
    );

    let balance = client.purchase_item("legacy-m1", "s1").await.unwrap();
    assert_eq!(balance, 65);
}

#[tokio::test(start_paused = true)]
async fn test_failed_purchase_rolls_back() {
    let (http, client) = signed_in(100).await;
    http.route(
        "/store/s1/purchase",
        Reply::Json(409, fixtures::error_body("Item sold out")),
    );

    let err = client
        .purchase_item(fixtures::CHILD_ID, "s1")
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "Item sold out");
    assert_eq!(client.cache().member_points(fixtures::CHILD_ID), Some(100));
}

#[tokio::test(start_paused = true)]
async fn test_purchase_of_unknown_item() {
    let (_http, client) = signed_in(100).await;
    let err = client
        .purchase_item(fixtures::CHILD_ID, "missing")
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::NotCached { .. }));
}

#[tokio::test(start_paused = true)]
async fn test_complete_task_merges_server_fields() {
    let (http, client) = signed_in(40).await;
    http.route(
        "/tasks/t1/complete",
        Reply::Json(
            200,
            fixtures::envelope(json!({"task": {"_id": "t1", "completed": true, "points": 15}})),
        ),
    );

    let task = client.complete_task("t1").await.unwrap();
    assert!(task.completed);
    assert_eq!(task.points, 15);
    assert!(client
        .cache()
        .select(|s| s.tasks.get("t1").is_some_and(|t| t.completed)));
}

#[tokio::test(start_paused = true)]
async fn test_complete_task_with_expanded_reference_still_succeeds() {
    let (http, client) = signed_in(40).await;
    http.route(
        "/tasks/t1/complete",
        Reply::Json(
            200,
            fixtures::envelope(json!({"task": {
                "_id": "t1",
                "completed": true,
                "points": 12,
                "assignedTo": {"_id": "m1", "name": "Kid"}
            }})),
        ),
    );

    let task = client.complete_task("t1").await.unwrap();
    assert!(task.completed);
    // Fields that fit are still merged; the expanded reference is skipped.
    assert_eq!(task.points, 12);
    assert_eq!(task.assigned_to.as_ref().map(|id| id.as_str()), Some(fixtures::CHILD_ID));
    assert!(client
        .cache()
        .select(|s| s.tasks.get("t1").is_some_and(|t| t.completed)));
    assert_eq!(http.count("/tasks/t1/complete"), 1);
}

#[tokio::test(start_paused = true)]
async fn test_complete_task_rolls_back_on_failure() {
    let (http, client) = signed_in(40).await;
    http.route(
        "/tasks/t2/complete",
        Reply::Json(500, fixtures::error_body("database unavailable")),
    );

    let err = client.complete_task("t2").await.unwrap_err();
    assert!(matches!(err, SyncError::Gateway(_)));
    let task = client.cache().select(|s| s.tasks.get("t2").cloned()).unwrap();
    assert!(!task.completed);
}

#[tokio::test(start_paused = true)]
async fn test_expired_token_clears_session_and_cache() {
    let (http, client) = signed_in(40).await;
    let _tasks = client.start();
    http.route(
        "/tasks/t1/complete",
        Reply::Json(500, fixtures::error_body("TokenExpiredError: jwt expired")),
    );

    let err = client.complete_task("t1").await.unwrap_err();
    assert!(err.is_auth_expired());
    assert!(!client.session().is_authenticated());
    support::eventually("cache cleared", || client.cache().select(|s| s.is_empty())).await;
}

#[tokio::test(start_paused = true)]
async fn test_logout_clears_everything() {
    let (_http, client) = signed_in(40).await;
    assert!(client.logout());
    assert!(!client.session().is_authenticated());
    assert!(client.cache().select(|s| s.is_empty()));
    assert!(!client.logout());
}
