//! The job record: one per submitted annotation job, retained forever as an
//! audit record.

use core::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::DomainError;
use crate::id::{ArchiveId, JobId, UserId};

/// Primary lifecycle status of a job.
///
/// The order is strictly `Pending → Running → Completed`; archival is an
/// orthogonal flag on completed jobs.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
}

impl JobStatus {
    pub const ALL: [JobStatus; 3] = [JobStatus::Pending, JobStatus::Running, JobStatus::Completed];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "PENDING",
            JobStatus::Running => "RUNNING",
            JobStatus::Completed => "COMPLETED",
        }
    }

    fn rank(&self) -> u8 {
        match self {
            JobStatus::Pending => 0,
            JobStatus::Running => 1,
            JobStatus::Completed => 2,
        }
    }

    /// Whether moving from `self` to `next` is a single forward step.
    pub fn can_advance_to(&self, next: JobStatus) -> bool {
        next.rank() == self.rank() + 1
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed)
    }
}

impl core::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(JobStatus::Pending),
            "RUNNING" => Ok(JobStatus::Running),
            "COMPLETED" => Ok(JobStatus::Completed),
            other => Err(DomainError::validation(format!("unknown job status: {other}"))),
        }
    }
}

/// Location of an object in the hot tier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectRef {
    pub bucket: String,
    pub key: String,
}

impl ObjectRef {
    pub fn new(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
        }
    }

    /// Last path segment of the key.
    pub fn file_name(&self) -> &str {
        self.key.rsplit('/').next().unwrap_or(&self.key)
    }
}

impl core::fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}/{}", self.bucket, self.key)
    }
}

/// A job record as held by the metadata store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub job_id: JobId,
    pub user_id: UserId,
    pub input_file_name: String,
    pub input: ObjectRef,
    /// Epoch seconds.
    pub submit_time: i64,
    pub status: JobStatus,
    pub result: Option<ObjectRef>,
    pub log: Option<ObjectRef>,
    /// Epoch seconds; set by the `Complete` transition.
    pub complete_time: Option<i64>,
    pub archived: bool,
    pub result_archive_id: Option<ArchiveId>,
}

impl Job {
    /// A freshly submitted job: `PENDING`, not archived, no outputs yet.
    pub fn pending(
        job_id: JobId,
        user_id: UserId,
        input: ObjectRef,
        input_file_name: impl Into<String>,
        submit_time: i64,
    ) -> Self {
        Self {
            job_id,
            user_id,
            input_file_name: input_file_name.into(),
            input,
            submit_time,
            status: JobStatus::Pending,
            result: None,
            log: None,
            complete_time: None,
            archived: false,
            result_archive_id: None,
        }
    }

    /// Result file is currently readable from the hot tier.
    pub fn is_downloadable(&self) -> bool {
        self.status == JobStatus::Completed && self.result_archive_id.is_none()
    }

    /// Verify the record-level invariants.
    pub fn check_invariants(&self) -> Result<(), DomainError> {
        if self.result_archive_id.is_some() && !self.archived {
            return Err(DomainError::invariant(format!(
                "job {}: archive handle present but archived=false",
                self.job_id
            )));
        }
        if self.archived && self.result_archive_id.is_none() {
            return Err(DomainError::invariant(format!(
                "job {}: archived=true without an archive handle",
                self.job_id
            )));
        }
        if self.archived && self.status != JobStatus::Completed {
            return Err(DomainError::invariant(format!(
                "job {}: archived while {}",
                self.job_id, self.status
            )));
        }
        if self.status == JobStatus::Completed && (self.result.is_none() || self.complete_time.is_none())
        {
            return Err(DomainError::invariant(format!(
                "job {}: COMPLETED without result reference or completion time",
                self.job_id
            )));
        }
        Ok(())
    }
}
