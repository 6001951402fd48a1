//! Stuck-job detection and status counts.
//!
//! A job is stuck when it has sat in `PENDING` or `RUNNING` longer than a
//! threshold, e.g. after its request was dead-lettered.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use annoflow_core::{Job, JobStatus};

use crate::metadata::{MetadataStore, StoreError};

/// Unfinished jobs submitted more than `older_than` before `now`, oldest first.
pub fn find_stuck_jobs<M: MetadataStore + ?Sized>(
    store: &M,
    older_than: Duration,
    now: DateTime<Utc>,
) -> Result<Vec<Job>, StoreError> {
    let threshold = chrono::Duration::from_std(older_than)
        .map(|age| (now - age).timestamp())
        .unwrap_or(i64::MIN);

    let mut stuck = Vec::new();
    for status in [JobStatus::Pending, JobStatus::Running] {
        stuck.extend(
            store
                .list_by_status(status, usize::MAX)?
                .into_iter()
                .filter(|j| j.submit_time <= threshold),
        );
    }
    stuck.sort_by_key(|j| j.submit_time);

    for job in &stuck {
        tracing::warn!(
            job_id = %job.job_id,
            user_id = %job.user_id,
            status = %job.status,
            submit_time = job.submit_time,
            "job appears stuck"
        );
    }
    Ok(stuck)
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct JobStats {
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    /// Completed jobs whose result lives in the cold tier.
    pub archived: usize,
}

pub fn job_stats<M: MetadataStore + ?Sized>(store: &M) -> Result<JobStats, StoreError> {
    let completed = store.list_by_status(JobStatus::Completed, usize::MAX)?;
    Ok(JobStats {
        pending: store.list_by_status(JobStatus::Pending, usize::MAX)?.len(),
        running: store.list_by_status(JobStatus::Running, usize::MAX)?.len(),
        archived: completed.iter().filter(|j| j.archived).count(),
        completed: completed.len(),
    })
}
