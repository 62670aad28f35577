//! Transition records for the append-only job history ledger.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use ispadmin_core::{JobId, WorkerId};

use crate::job::JobStatus;

/// Who performed a transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "id")]
pub enum Actor {
    /// A worker daemon reporting on a job it holds.
    Worker(WorkerId),
    /// An API caller (admin user, upstream service).
    Caller(String),
    /// The heartbeat reaper.
    Reaper,
}

impl Actor {
    pub fn caller(id: impl Into<String>) -> Self {
        Self::Caller(id.into())
    }

    /// Value stored in `JobHistoryEntry::created_by`.
    pub fn created_by(&self) -> String {
        match self {
            Actor::Worker(id) => id.to_string(),
            Actor::Caller(id) => id.clone(),
            Actor::Reaper => "reaper".to_string(),
        }
    }
}

/// A status change produced by one of the `ProvisioningJob` transition methods.
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub job_id: JobId,
    pub from: JobStatus,
    pub to: JobStatus,
    pub message: String,
    pub details: Option<Value>,
}

impl Transition {
    /// Stamp the transition into a ledger row.
    pub fn into_entry(self, id: u64, actor: &Actor, at: DateTime<Utc>) -> JobHistoryEntry {
        JobHistoryEntry {
            id,
            job_id: self.job_id,
            old_status: self.from,
            new_status: self.to,
            message: self.message,
            details: self.details,
            created_at: at,
            created_by: actor.created_by(),
        }
    }
}

/// One row per status transition. Never updated or deleted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobHistoryEntry {
    /// Ledger sequence number (global append order)
    pub id: u64,
    pub job_id: JobId,
    pub old_status: JobStatus,
    pub new_status: JobStatus,
    pub message: String,
    pub details: Option<Value>,
    pub created_at: DateTime<Utc>,
    pub created_by: String,
}

/// Check that a job's entries form an unbroken chain starting at `queued`.
pub fn is_consistent_chain(entries: &[JobHistoryEntry]) -> bool {
    let mut expected = JobStatus::Queued;
    for entry in entries {
        if entry.old_status != expected || !entry.old_status.can_transition_to(entry.new_status) {
            return false;
        }
        expected = entry.new_status;
    }
    true
}
