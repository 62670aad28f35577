use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{rejection::JsonRejection, Extension, Path},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};

use ispadmin_core::WorkerId;
use ispadmin_provisioning::WorkerRegistration;

use crate::app::{dto, errors};
use crate::app::services::AppServices;

pub fn router() -> Router {
    Router::new()
        .route("/", get(list_workers).post(register_worker))
        .route("/:worker_id", get(get_worker).delete(deregister_worker))
        .route("/:worker_id/heartbeat", post(heartbeat))
        .route("/:worker_id/claim", post(claim_next))
}

fn parse_worker_id(raw: String) -> Result<WorkerId, axum::response::Response> {
    WorkerId::parse(raw).map_err(errors::invalid_input)
}

pub async fn list_workers(
    Extension(services): Extension<Arc<AppServices>>,
) -> axum::response::Response {
    match services.registry().list() {
        Ok(workers) => Json(workers).into_response(),
        Err(e) => errors::queue_error_to_response(e),
    }
}

pub async fn register_worker(
    Extension(services): Extension<Arc<AppServices>>,
    payload: Result<Json<dto::RegisterWorkerRequest>, JsonRejection>,
) -> axum::response::Response {
    let Json(body) = match payload {
        Ok(body) => body,
        Err(rejection) => return errors::json_rejection(rejection),
    };
    let registration = WorkerRegistration::from(body);
    match services.registry().register(registration) {
        Ok(status) => (StatusCode::CREATED, Json(status)).into_response(),
        Err(e) => errors::queue_error_to_response(e),
    }
}

pub async fn get_worker(
    Extension(services): Extension<Arc<AppServices>>,
    Path(worker_id): Path<String>,
) -> axum::response::Response {
    let worker_id = match parse_worker_id(worker_id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    match services.registry().get(&worker_id) {
        Ok(status) => Json(status).into_response(),
        Err(e) => errors::queue_error_to_response(e),
    }
}

pub async fn deregister_worker(
    Extension(services): Extension<Arc<AppServices>>,
    Path(worker_id): Path<String>,
) -> axum::response::Response {
    let worker_id = match parse_worker_id(worker_id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    match services.registry().deregister(&worker_id) {
        Ok(status) => Json(status).into_response(),
        Err(e) => errors::queue_error_to_response(e),
    }
}

pub async fn heartbeat(
    Extension(services): Extension<Arc<AppServices>>,
    Path(worker_id): Path<String>,
) -> axum::response::Response {
    let worker_id = match parse_worker_id(worker_id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    match services.dispatcher().heartbeat(&worker_id) {
        Ok(status) => Json(status).into_response(),
        Err(e) => errors::queue_error_to_response(e),
    }
}

/// An empty body claims with the worker's registered types and capacity.
fn parse_claim_body(body: &[u8]) -> Result<dto::ClaimRequest, axum::response::Response> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(dto::ClaimRequest::default());
    }
    serde_json::from_slice(body).map_err(|e| {
        errors::json_error(
            StatusCode::BAD_REQUEST,
            "validation_error",
            format!("invalid claim body: {e}"),
        )
    })
}

/// 200 with the claimed job, 204 when nothing is eligible.
pub async fn claim_next(
    Extension(services): Extension<Arc<AppServices>>,
    Path(worker_id): Path<String>,
    body: Bytes,
) -> axum::response::Response {
    let worker_id = match parse_worker_id(worker_id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    let request = match parse_claim_body(&body) {
        Ok(request) => request,
        Err(resp) => return resp,
    };

    let worker = match services.registry().get(&worker_id) {
        Ok(w) => w,
        Err(e) => return errors::queue_error_to_response(e),
    };
    let service_types = request
        .service_types
        .unwrap_or_else(|| worker.supported_service_types.clone());
    let capacity = request.capacity.unwrap_or(worker.max_concurrent_jobs);

    match services
        .dispatcher()
        .claim_next(&worker_id, &service_types, capacity)
    {
        Ok(Some(job)) => Json(job).into_response(),
        Ok(None) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => errors::queue_error_to_response(e),
    }
}
