
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use serde_json::Value;
use tower::ServiceExt;

use queuectl::dashboard::{router, DashboardState};
use queuectl::store::{JobState, Resolution};
use test_harness::{new_job, test_store};

async fn get_jobs(app: axum::Router) -> (StatusCode, Value) {
    let response = app
        .oneshot(
            Request::builder()
                .uri("/api/jobs")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let json = serde_json::from_slice(&bytes).unwrap();
    (status, json)
}

#[tokio::test]
async fn empty_store_returns_empty_summary_and_jobs() {
    let (store, _dir) = test_store().await;
    let app = router(DashboardState { store });

    let (status, body) = get_jobs(app).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["summary"], serde_json::json!([]));
    assert_eq!(body["jobs"], serde_json::json!([]));
}

#[tokio::test]
async fn jobs_endpoint_reports_summary_and_full_rows() {
    let (store, _dir) = test_store().await;

    store.enqueue(new_job("job-1", "echo one")).await.unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;
    store.enqueue(new_job("job-2", "echo two")).await.unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;

    store
        .claim_next("worker-a", Duration::from_secs(60))
        .await
        .unwrap()
        .unwrap();
    store
        .resolve(
            "job-1",
            Resolution {
                state: JobState::Completed,
                attempts: 1,
                stdout: "one".to_string(),
                stderr: String::new(),
                run_at: None,
            },
        )
        .await
        .unwrap();

    let app = router(DashboardState {
        store: std::sync::Arc::clone(&store),
    });
    let (status, body) = get_jobs(app).await;
    assert_eq!(status, StatusCode::OK);

    let summary = body["summary"].as_array().unwrap();
    let mut counts: Vec<(String, i64)> = summary
        .iter()
        .map(|entry| {
            (
                entry["state"].as_str().unwrap().to_string(),
                entry["count"].as_i64().unwrap(),
            )
        })
        .collect();
    counts.sort();
    assert_eq!(
        counts,
        vec![
            ("completed".to_string(), 1),
            ("pending".to_string(), 1),
        ]
    );

    let jobs = body["jobs"].as_array().unwrap();
    assert_eq!(jobs.len(), 2);
    // Most recently updated first.
    assert_eq!(jobs[0]["id"], "job-1");
    assert_eq!(jobs[0]["state"], "completed");
    assert_eq!(jobs[0]["stdout"], "one");
    assert_eq!(jobs[1]["id"], "job-2");
    assert_eq!(jobs[1]["state"], "pending");
    assert_eq!(jobs[1]["command"], "echo two");
}
