//! HTTP API application wiring (Axum router + service wiring).
//!
//! - `services.rs`: queue wiring (store, worker registry, dispatcher, reaper)
//! - `routes/`: HTTP routes + handlers (one file per area)
//! - `dto.rs`: request DTOs and query-string mapping
//! - `errors.rs`: consistent error responses

use std::sync::Arc;

use axum::{Extension, Router, routing::get};
use tower::ServiceBuilder;

pub mod dto;
pub mod errors;
pub mod routes;
pub mod services;

/// Build the full HTTP router (public entrypoint used by `main.rs`).
pub fn build_app(services: Arc<services::AppServices>) -> Router {
    Router::new()
        .route("/health", get(routes::system::health))
        .merge(routes::router())
        .layer(ServiceBuilder::new().layer(Extension(services)))
}

#[cfg(test)]
mod tests {
    use super::*;

    use axum::body::{Body, to_bytes};
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    use ispadmin_infra::config::QueueConfig;

    fn app() -> Router {
        build_app(Arc::new(services::AppServices::new(QueueConfig::default())))
    }

    async fn send(app: &Router, req: Request<Body>) -> (StatusCode, serde_json::Value) {
        let res = app.clone().oneshot(req).await.unwrap();
        let status = res.status();
        let bytes = to_bytes(res.into_body(), usize::MAX).await.unwrap();
        let body = if bytes.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, body)
    }

    fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::post(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn health_is_ok() {
        let (status, _) = send(&app(), Request::get("/health").body(Body::empty()).unwrap()).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn enqueue_validation_is_a_bad_request() {
        let app = app();
        let (status, body) = send(
            &app,
            post_json(
                "/jobs",
                serde_json::json!({
                    "service_id": "svc-1",
                    "service_type": "satellite",
                    "customer_id": "cust-1",
                }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "validation_error");
    }

    #[tokio::test]
    async fn unknown_job_is_not_found_and_bad_id_is_rejected() {
        let app = app();
        let missing = ispadmin_core::JobId::new();
        let (status, _) = send(
            &app,
            Request::get(format!("/jobs/{missing}")).body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, body) = send(
            &app,
            Request::get("/jobs/not-a-uuid").body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "invalid_id");
    }

    #[tokio::test]
    async fn list_rejects_unknown_status() {
        let (status, body) = send(
            &app(),
            Request::get("/jobs?status=paused").body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "invalid_input");
    }

    #[tokio::test]
    async fn claim_for_unregistered_worker_is_not_found() {
        let (status, _) = send(
            &app(),
            post_json("/workers/ghost/claim", serde_json::json!({})),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn cancel_records_the_calling_identity() {
        let app = app();
        let (status, body) = send(
            &app,
            post_json(
                "/jobs",
                serde_json::json!({
                    "service_id": "svc-7",
                    "service_type": "voice",
                    "customer_id": "cust-7",
                }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        let job_id = body["job_id"].as_str().unwrap().to_string();

        let req = Request::post(format!("/jobs/{job_id}/cancel"))
            .header(routes::jobs::CALLER_HEADER, "noc-admin")
            .body(Body::empty())
            .unwrap();
        let (status, body) = send(&app, req).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "cancelled");

        let (_, history) = send(
            &app,
            Request::get(format!("/jobs/{job_id}/history")).body(Body::empty()).unwrap(),
        )
        .await;
        let last = history.as_array().unwrap().last().unwrap().clone();
        assert_eq!(last["created_by"], "noc-admin");
        assert_eq!(last["new_status"], "cancelled");
    }

    #[tokio::test]
    async fn malformed_bodies_are_validation_errors() {
        let app = app();
        let (status, body) = send(
            &app,
            post_json(
                "/jobs",
                serde_json::json!({ "service_id": "svc-1", "service_type": "voice" }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "validation_error");

        let (status, body) = send(
            &app,
            post_json(
                "/jobs",
                serde_json::json!({
                    "service_id": "svc-1",
                    "service_type": "voice",
                    "customer_id": "cust-1",
                    "max_retries": "two",
                }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "validation_error");

        let (status, body) = send(
            &app,
            post_json("/workers", serde_json::json!({ "worker_id": "edge-1" })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "validation_error");

        let job_id = ispadmin_core::JobId::new();
        let (status, body) = send(
            &app,
            post_json(&format!("/jobs/{job_id}/fail"), serde_json::json!({ "worker_id": "edge-1" })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "validation_error");

        let (status, body) = send(
            &app,
            post_json(&format!("/jobs/{job_id}/complete"), serde_json::json!({ "result_data": {} })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "validation_error");
    }

    #[tokio::test]
    async fn claim_body_must_be_well_formed_when_present() {
        let app = app();
        let (status, _) = send(
            &app,
            post_json(
                "/workers",
                serde_json::json!({
                    "worker_id": "edge-2",
                    "supported_service_types": ["internet"],
                }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);

        let (status, body) = send(
            &app,
            post_json("/workers/edge-2/claim", serde_json::json!({ "capacity": "x" })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "validation_error");

        let req = Request::post("/workers/edge-2/claim")
            .header("content-type", "application/json")
            .body(Body::from("{not json"))
            .unwrap();
        let (status, body) = send(&app, req).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "validation_error");

        let (status, _) = send(
            &app,
            Request::post("/workers/edge-2/claim").body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::NO_CONTENT);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn postgres_backed_services_report_storage_errors() {
        use std::time::Duration;

        use ispadmin_infra::clock::SystemClock;
        use ispadmin_infra::jobs::{BlockingPostgresStore, PostgresJobQueueStore};
        use sqlx::postgres::PgPoolOptions;

        let config = QueueConfig::default();
        // Nothing listens on port 1.
        let pool = PgPoolOptions::new()
            .acquire_timeout(Duration::from_millis(200))
            .connect_lazy("postgres://ispadmin@127.0.0.1:1/ispadmin")
            .unwrap();
        let store: services::Store = Arc::new(BlockingPostgresStore::new(
            PostgresJobQueueStore::new(pool, &config),
            tokio::runtime::Handle::current(),
        ));
        let app = build_app(Arc::new(services::AppServices::with_store(
            config,
            store,
            Arc::new(SystemClock),
        )));

        let (status, body) = send(&app, Request::get("/jobs/stats").body(Body::empty()).unwrap()).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["error"], "storage_error");
    }
}
