use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, Extension, Path, Query},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde_json::Value;

use ispadmin_core::JobId;
use ispadmin_infra::jobs::JobQueueStore;
use ispadmin_provisioning::{Actor, EnqueueRequest, JobFilter};

use crate::app::{dto, errors};
use crate::app::services::AppServices;

/// Identifies the admin user or upstream service on cancel requests.
pub const CALLER_HEADER: &str = "x-caller-id";
const DEFAULT_CALLER: &str = "api";

pub fn router() -> Router {
    Router::new()
        .route("/", post(enqueue).get(list_jobs))
        .route("/stats", get(stats))
        .route("/:job_id", get(get_job))
        .route("/:job_id/history", get(get_history))
        .route("/:job_id/cancel", post(cancel_job))
        .route("/:job_id/complete", post(complete_job))
        .route("/:job_id/fail", post(fail_job))
}

fn parse_job_id(raw: &str) -> Result<JobId, axum::response::Response> {
    raw.parse::<JobId>()
        .map_err(|_| errors::json_error(StatusCode::BAD_REQUEST, "invalid_id", "invalid job id"))
}

pub async fn enqueue(
    Extension(services): Extension<Arc<AppServices>>,
    payload: Result<Json<EnqueueRequest>, JsonRejection>,
) -> axum::response::Response {
    let Json(body) = match payload {
        Ok(body) => body,
        Err(rejection) => return errors::json_rejection(rejection),
    };
    match services.store().enqueue(body) {
        Ok(job_id) => (
            StatusCode::CREATED,
            Json(serde_json::json!({ "job_id": job_id.to_string() })),
        )
            .into_response(),
        Err(e) => errors::queue_error_to_response(e),
    }
}

pub async fn list_jobs(
    Extension(services): Extension<Arc<AppServices>>,
    Query(query): Query<dto::ListJobsQuery>,
) -> axum::response::Response {
    let filter = match JobFilter::try_from(query) {
        Ok(f) => f,
        Err(e) => return errors::invalid_input(e),
    };

    match services.store().list(&filter) {
        Ok(jobs) => Json(jobs).into_response(),
        Err(e) => errors::queue_error_to_response(e),
    }
}

pub async fn stats(Extension(services): Extension<Arc<AppServices>>) -> axum::response::Response {
    match services.store().stats() {
        Ok(stats) => {
            let total = stats.total();
            Json(serde_json::json!({
                "queued": stats.queued,
                "processing": stats.processing,
                "completed": stats.completed,
                "failed": stats.failed,
                "cancelled": stats.cancelled,
                "total": total,
            }))
            .into_response()
        }
        Err(e) => errors::queue_error_to_response(e),
    }
}

pub async fn get_job(
    Extension(services): Extension<Arc<AppServices>>,
    Path(job_id): Path<String>,
) -> axum::response::Response {
    let job_id = match parse_job_id(&job_id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    match services.store().get(job_id) {
        Ok(job) => Json(job).into_response(),
        Err(e) => errors::queue_error_to_response(e),
    }
}

pub async fn get_history(
    Extension(services): Extension<Arc<AppServices>>,
    Path(job_id): Path<String>,
) -> axum::response::Response {
    let job_id = match parse_job_id(&job_id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    match services.store().history(job_id) {
        Ok(entries) => Json(entries).into_response(),
        Err(e) => errors::queue_error_to_response(e),
    }
}

pub async fn cancel_job(
    Extension(services): Extension<Arc<AppServices>>,
    headers: HeaderMap,
    Path(job_id): Path<String>,
) -> axum::response::Response {
    let job_id = match parse_job_id(&job_id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    let caller = headers
        .get(CALLER_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .unwrap_or(DEFAULT_CALLER);

    match services.dispatcher().cancel(job_id, &Actor::caller(caller)) {
        Ok(job) => Json(job).into_response(),
        Err(e) => errors::queue_error_to_response(e),
    }
}

pub async fn complete_job(
    Extension(services): Extension<Arc<AppServices>>,
    Path(job_id): Path<String>,
    payload: Result<Json<dto::CompleteJobRequest>, JsonRejection>,
) -> axum::response::Response {
    let job_id = match parse_job_id(&job_id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    let Json(body) = match payload {
        Ok(body) => body,
        Err(rejection) => return errors::json_rejection(rejection),
    };

    let result_data = body.result_data.unwrap_or(Value::Object(Default::default()));
    match services.dispatcher().complete(&body.worker_id, job_id, result_data) {
        Ok(job) => Json(job).into_response(),
        Err(e) => errors::queue_error_to_response(e),
    }
}

pub async fn fail_job(
    Extension(services): Extension<Arc<AppServices>>,
    Path(job_id): Path<String>,
    payload: Result<Json<dto::FailJobRequest>, JsonRejection>,
) -> axum::response::Response {
    let job_id = match parse_job_id(&job_id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    let Json(body) = match payload {
        Ok(body) => body,
        Err(rejection) => return errors::json_rejection(rejection),
    };

    match services.dispatcher().fail(&body.worker_id, job_id, &body.error) {
        Ok(job) => Json(job).into_response(),
        Err(e) => errors::queue_error_to_response(e),
    }
}
