//! Job metadata store.
//!
//! One record per job, keyed by job id, with a secondary index on user id.
//! Every lifecycle change goes through [`MetadataStore::conditional_update`],
//! which evaluates the update's conditions against the *current* record and
//! applies its mutations atomically. This is the only cross-worker
//! coordination point in the pipeline.

use std::sync::Arc;

use annoflow_core::{ConditionalUpdate, DomainError, Job, JobId, JobStatus, Transition, UserId};

pub mod in_memory;
pub mod postgres;

pub use in_memory::InMemoryMetadataStore;
pub use postgres::PostgresMetadataStore;

#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),

    #[error("job already exists: {0}")]
    AlreadyExists(JobId),

    /// A conditional update's precondition did not hold; nothing was written.
    #[error("condition failed for job {job_id}: {reason}")]
    ConditionFailed { job_id: JobId, reason: String },

    /// The update would leave the record violating its invariants.
    #[error("invalid update for job {job_id}: {reason}")]
    Invalid { job_id: JobId, reason: String },

    #[error("storage error: {0}")]
    Storage(String),
}

impl StoreError {
    /// A precondition fault: benign under at-least-once delivery.
    pub fn is_condition_failed(&self) -> bool {
        matches!(self, StoreError::ConditionFailed { .. })
    }

    /// Map a failed `ConditionalUpdate::apply` for `job_id`.
    pub(crate) fn from_domain(job_id: &JobId, err: DomainError) -> Self {
        match err {
            DomainError::Conflict(reason) => StoreError::ConditionFailed {
                job_id: job_id.clone(),
                reason,
            },
            other => StoreError::Invalid {
                job_id: job_id.clone(),
                reason: other.to_string(),
            },
        }
    }
}

/// Job metadata store abstraction.
pub trait MetadataStore: Send + Sync {
    /// Insert a new record (put-if-absent).
    fn create(&self, job: &Job) -> Result<(), StoreError>;

    fn get(&self, job_id: &JobId) -> Result<Option<Job>, StoreError>;

    /// All jobs owned by a user (secondary index).
    fn jobs_for_user(&self, user_id: &UserId) -> Result<Vec<Job>, StoreError>;

    /// Atomically check `update.conditions` and apply `update.mutations`.
    ///
    /// Returns the record as written. On a failed condition nothing is written
    /// and [`StoreError::ConditionFailed`] is returned.
    fn conditional_update(&self, job_id: &JobId, update: &ConditionalUpdate) -> Result<Job, StoreError>;

    /// Jobs currently in `status`, oldest submission first.
    fn list_by_status(&self, status: JobStatus, limit: usize) -> Result<Vec<Job>, StoreError>;

    /// Apply a lifecycle transition.
    fn transition(&self, job_id: &JobId, transition: &Transition) -> Result<Job, StoreError> {
        let job = self.conditional_update(job_id, &transition.update())?;
        tracing::info!(
            job_id = %job_id,
            transition = transition.name(),
            status = %job.status,
            archived = job.archived,
            "job transitioned"
        );
        Ok(job)
    }

    /// Fetch a record that must exist.
    fn require(&self, job_id: &JobId) -> Result<Job, StoreError> {
        self.get(job_id)?.ok_or_else(|| StoreError::NotFound(job_id.clone()))
    }
}

impl<S> MetadataStore for Arc<S>
where
    S: MetadataStore + ?Sized,
{
    fn create(&self, job: &Job) -> Result<(), StoreError> {
        (**self).create(job)
    }

    fn get(&self, job_id: &JobId) -> Result<Option<Job>, StoreError> {
        (**self).get(job_id)
    }

    fn jobs_for_user(&self, user_id: &UserId) -> Result<Vec<Job>, StoreError> {
        (**self).jobs_for_user(user_id)
    }

    fn conditional_update(&self, job_id: &JobId, update: &ConditionalUpdate) -> Result<Job, StoreError> {
        (**self).conditional_update(job_id, update)
    }

    fn list_by_status(&self, status: JobStatus, limit: usize) -> Result<Vec<Job>, StoreError> {
        (**self).list_by_status(status, limit)
    }
}
