//! Job submission: the two writes the front end performs for a new job.
//!
//! 1. put the `PENDING` record (put-if-absent)
//! 2. publish the job request
//!
//! The input object is expected to be in the hot tier already; [`stage_input`]
//! uploads one for callers that hold the file locally.

use std::path::Path;

use bytes::Bytes;
use chrono::Utc;

use annoflow_core::{Job, JobId, JobStatus, ObjectRef, UserId};
use annoflow_events::{BusError, JobRequested, NotificationBus, NotificationBusExt};

use crate::metadata::{MetadataStore, StoreError};
use crate::storage::{HotStore, HotStoreError};

/// Object key layout shared by inputs and results: `<prefix>/<user>/<job>~<file>`.
pub fn object_key(prefix: &str, user_id: &UserId, job_id: &JobId, file_name: &str) -> String {
    let prefix = prefix.trim_matches('/');
    if prefix.is_empty() {
        format!("{user_id}/{job_id}~{file_name}")
    } else {
        format!("{prefix}/{user_id}/{job_id}~{file_name}")
    }
}

#[derive(Debug, Clone)]
pub struct SubmitRequest {
    pub job_id: JobId,
    pub user_id: UserId,
    pub owner_email: String,
    pub input_file_name: String,
    pub input: ObjectRef,
}

#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("failed to publish job request: {0}")]
    Publish(#[from] BusError),

    #[error("failed to stage input: {0}")]
    Stage(#[from] HotStoreError),

    /// A different job already uses this id.
    #[error("job id {0} is already taken")]
    Conflict(JobId),
}

/// Upload a local input file to `<inputs_bucket>/<prefix>/<user>/<job>~<file>`.
pub fn stage_input<H: HotStore + ?Sized>(
    hot: &H,
    inputs_bucket: &str,
    key_prefix: &str,
    user_id: &UserId,
    job_id: &JobId,
    file_name: &str,
    data: Bytes,
) -> Result<ObjectRef, SubmitError> {
    let file_name = Path::new(file_name)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(file_name);
    let target = ObjectRef::new(inputs_bucket, object_key(key_prefix, user_id, job_id, file_name));
    hot.put(&target, data)?;
    Ok(target)
}

/// Record a new job and request its processing.
///
/// Resubmitting the same job while it is still `PENDING` republishes the
/// request, so a submit that failed after the write can be retried.
pub fn submit_job<M, B>(metadata: &M, bus: &B, request: SubmitRequest) -> Result<Job, SubmitError>
where
    M: MetadataStore + ?Sized,
    B: NotificationBus + ?Sized,
{
    let job = Job::pending(
        request.job_id.clone(),
        request.user_id.clone(),
        request.input.clone(),
        request.input_file_name.clone(),
        Utc::now().timestamp(),
    );

    let job = match metadata.create(&job) {
        Ok(()) => job,
        Err(StoreError::AlreadyExists(_)) => {
            let existing = metadata.require(&request.job_id)?;
            if existing.user_id != request.user_id || existing.input != request.input {
                return Err(SubmitError::Conflict(request.job_id));
            }
            if existing.status != JobStatus::Pending {
                tracing::info!(job_id = %existing.job_id, status = %existing.status, "job already underway; not resubmitted");
                return Ok(existing);
            }
            existing
        }
        Err(e) => return Err(e.into()),
    };

    let message_id = bus.publish_event(&JobRequested {
        job_id: job.job_id.clone(),
        user_id: job.user_id.clone(),
        input_bucket: job.input.bucket.clone(),
        input_key: job.input.key.clone(),
        owner_email: request.owner_email,
    })?;

    tracing::info!(
        job_id = %job.job_id,
        user_id = %job.user_id,
        input = %job.input,
        message_id = %message_id,
        "job submitted"
    );
    Ok(job)
}
