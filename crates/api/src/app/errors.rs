use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;

use ispadmin_core::DomainError;
use ispadmin_infra::jobs::QueueError;

pub fn queue_error_to_response(err: QueueError) -> axum::response::Response {
    match err {
        QueueError::Validation(msg) => json_error(StatusCode::BAD_REQUEST, "validation_error", msg),
        QueueError::NotFound(msg) => json_error(StatusCode::NOT_FOUND, "not_found", msg),
        QueueError::Conflict(msg) => json_error(StatusCode::CONFLICT, "conflict", msg),
        QueueError::Storage(msg) => {
            tracing::error!(error = %msg, "queue storage failure");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "storage_error", msg)
        }
    }
}

/// Path/query parsing failures are always the caller's fault.
pub fn invalid_input(err: DomainError) -> axum::response::Response {
    json_error(StatusCode::BAD_REQUEST, "invalid_input", err.to_string())
}

/// Malformed or mistyped request bodies share the enqueue validation code.
pub fn json_rejection(rejection: JsonRejection) -> axum::response::Response {
    json_error(StatusCode::BAD_REQUEST, "validation_error", rejection.body_text())
}

pub fn json_error(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> axum::response::Response {
    (
        status,
        axum::Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}
