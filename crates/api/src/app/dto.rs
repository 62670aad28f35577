use std::collections::BTreeSet;

use serde::Deserialize;
use serde_json::Value;

use ispadmin_core::{CustomerId, DomainError, WorkerId};
use ispadmin_provisioning::{ExecutorError, JobFilter, ServiceType, WorkerRegistration};

// -------------------------
// Request DTOs
// -------------------------

/// `GET /jobs` query string. Enum values arrive as raw strings so a typo is a
/// 400 with a useful message rather than axum's generic rejection.
#[derive(Debug, Default, Deserialize)]
pub struct ListJobsQuery {
    pub status: Option<String>,
    pub service_type: Option<String>,
    pub customer_id: Option<String>,
    pub priority: Option<String>,
    pub offset: Option<usize>,
    pub limit: Option<usize>,
}

impl TryFrom<ListJobsQuery> for JobFilter {
    type Error = DomainError;

    fn try_from(q: ListJobsQuery) -> Result<Self, Self::Error> {
        Ok(JobFilter {
            status: q.status.as_deref().map(str::parse).transpose()?,
            service_type: q.service_type.as_deref().map(str::parse).transpose()?,
            customer_id: q.customer_id.map(CustomerId::parse).transpose()?,
            priority: q.priority.as_deref().map(str::parse).transpose()?,
            offset: q.offset.unwrap_or(0),
            limit: q.limit,
        })
    }
}

#[derive(Debug, Deserialize)]
pub struct RegisterWorkerRequest {
    pub worker_id: WorkerId,
    pub worker_name: Option<String>,
    pub supported_service_types: BTreeSet<ServiceType>,
    pub max_concurrent_jobs: Option<u32>,
}

impl From<RegisterWorkerRequest> for WorkerRegistration {
    fn from(r: RegisterWorkerRequest) -> Self {
        let name = r.worker_name.unwrap_or_else(|| r.worker_id.to_string());
        WorkerRegistration::new(
            r.worker_id,
            name,
            r.supported_service_types,
            r.max_concurrent_jobs.unwrap_or(1),
        )
    }
}

/// Body of `POST /workers/:worker_id/claim`. Omitted fields fall back to the
/// worker's registration.
#[derive(Debug, Default, Deserialize)]
pub struct ClaimRequest {
    pub service_types: Option<BTreeSet<ServiceType>>,
    pub capacity: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct CompleteJobRequest {
    pub worker_id: WorkerId,
    #[serde(default)]
    pub result_data: Option<Value>,
}

/// `{worker_id, message, details?, retryable}`
#[derive(Debug, Deserialize)]
pub struct FailJobRequest {
    pub worker_id: WorkerId,
    #[serde(flatten)]
    pub error: ExecutorError,
}

#[cfg(test)]
mod tests {
    use super::*;
    use ispadmin_provisioning::{JobStatus, Priority};

    #[test]
    fn list_query_maps_to_filter() {
        let q = ListJobsQuery {
            status: Some("queued".into()),
            service_type: Some("voice".into()),
            customer_id: Some("cust-9".into()),
            priority: Some("urgent".into()),
            offset: Some(5),
            limit: Some(10),
        };
        let filter = JobFilter::try_from(q).unwrap();
        assert_eq!(filter.status, Some(JobStatus::Queued));
        assert_eq!(filter.service_type, Some(ServiceType::Voice));
        assert_eq!(filter.customer_id.unwrap().as_str(), "cust-9");
        assert_eq!(filter.priority, Some(Priority::Urgent));
        assert_eq!((filter.offset, filter.limit), (5, Some(10)));
    }

    #[test]
    fn unknown_status_is_rejected() {
        let q = ListJobsQuery {
            status: Some("paused".into()),
            ..Default::default()
        };
        assert!(JobFilter::try_from(q).is_err());
    }

    #[test]
    fn fail_request_flattens_executor_error() {
        let body = serde_json::json!({
            "worker_id": "edge-1",
            "message": "radius timeout",
            "retryable": true,
        });
        let req: FailJobRequest = serde_json::from_value(body).unwrap();
        assert_eq!(req.worker_id.as_str(), "edge-1");
        assert!(req.error.retryable);
        assert_eq!(req.error.message, "radius timeout");
    }
}
