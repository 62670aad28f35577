//! In-memory append-only transition ledger.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};

use ispadmin_core::JobId;
use ispadmin_provisioning::{Actor, JobHistoryEntry, Transition};

use super::store::{QueueError, poisoned};

#[derive(Debug, Default)]
struct Ledger {
    entries: Vec<JobHistoryEntry>,
    by_job: HashMap<JobId, Vec<usize>>,
}

/// Append-only history of job status transitions.
///
/// Only `append` mutates; there is no update or delete.
#[derive(Debug, Default)]
pub struct JobHistoryLog {
    ledger: Mutex<Ledger>,
}

impl JobHistoryLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a transition and return the stored row.
    pub fn append(
        &self,
        transition: Transition,
        actor: &Actor,
        at: DateTime<Utc>,
    ) -> Result<JobHistoryEntry, QueueError> {
        let mut ledger = self.ledger.lock().map_err(poisoned)?;
        let position = ledger.entries.len();
        let entry = transition.into_entry(position as u64 + 1, actor, at);

        ledger.by_job.entry(entry.job_id).or_default().push(position);
        ledger.entries.push(entry.clone());
        Ok(entry)
    }

    /// Entries for one job in append order.
    pub fn for_job(&self, job_id: JobId) -> Result<Vec<JobHistoryEntry>, QueueError> {
        let ledger = self.ledger.lock().map_err(poisoned)?;
        Ok(ledger
            .by_job
            .get(&job_id)
            .map(|positions| {
                positions
                    .iter()
                    .map(|&i| ledger.entries[i].clone())
                    .collect()
            })
            .unwrap_or_default())
    }

    pub fn len(&self) -> Result<usize, QueueError> {
        Ok(self.ledger.lock().map_err(poisoned)?.entries.len())
    }

    pub fn is_empty(&self) -> Result<bool, QueueError> {
        Ok(self.len()? == 0)
    }
}
