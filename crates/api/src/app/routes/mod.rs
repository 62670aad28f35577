use axum::Router;

pub mod jobs;
pub mod system;
pub mod workers;

/// Router for every endpoint except `/health`.
pub fn router() -> Router {
    Router::new()
        .nest("/jobs", jobs::router())
        .nest("/workers", workers::router())
}
