//! Job lifecycle state machine.
//!
//! ```text
//! PENDING --Start--> RUNNING --Complete--> COMPLETED(archived=false)
//!                                             |  ^
//!                                     Archive |  | Restore
//!                                             v  |
//!                                         COMPLETED(archived=true)
//! ```
//!
//! Every transition is expressed as a [`ConditionalUpdate`]: a set of
//! conditions on the stored record plus the mutations to apply when all of them
//! hold. Stores must evaluate the conditions and apply the mutations as one
//! atomic read-modify-write; this is the only concurrency control in the
//! pipeline. A rejected condition means another worker already advanced the
//! job and is not an error for the caller.

use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};
use crate::id::ArchiveId;
use crate::job::{Job, JobStatus, ObjectRef};

/// Precondition on a single field of the stored record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Condition {
    StatusIs(JobStatus),
    ArchivedIs(bool),
}

impl Condition {
    pub fn holds(&self, job: &Job) -> bool {
        match self {
            Condition::StatusIs(status) => job.status == *status,
            Condition::ArchivedIs(archived) => job.archived == *archived,
        }
    }

    pub fn check(&self, job: &Job) -> DomainResult<()> {
        if self.holds(job) {
            return Ok(());
        }
        let found = match self {
            Condition::StatusIs(_) => format!("job_status={}", job.status),
            Condition::ArchivedIs(_) => format!("archived={}", job.archived),
        };
        Err(DomainError::conflict(format!(
            "job {}: expected {self}, found {found}",
            job.job_id
        )))
    }
}

impl core::fmt::Display for Condition {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Condition::StatusIs(s) => write!(f, "job_status={s}"),
            Condition::ArchivedIs(a) => write!(f, "archived={a}"),
        }
    }
}

/// Field change applied once all conditions hold.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mutation {
    SetStatus(JobStatus),
    SetOutputs {
        result: ObjectRef,
        log: ObjectRef,
        complete_time: i64,
    },
    SetArchive(ArchiveId),
    ClearArchive,
}

impl Mutation {
    fn apply(&self, job: &mut Job) -> DomainResult<()> {
        match self {
            Mutation::SetStatus(next) => {
                if !job.status.can_advance_to(*next) {
                    return Err(DomainError::invariant(format!(
                        "job {}: illegal status change {} -> {}",
                        job.job_id, job.status, next
                    )));
                }
                job.status = *next;
            }
            Mutation::SetOutputs {
                result,
                log,
                complete_time,
            } => {
                job.result = Some(result.clone());
                job.log = Some(log.clone());
                job.complete_time = Some(*complete_time);
            }
            Mutation::SetArchive(archive_id) => {
                job.result_archive_id = Some(archive_id.clone());
                job.archived = true;
            }
            Mutation::ClearArchive => {
                job.result_archive_id = None;
                job.archived = false;
            }
        }
        Ok(())
    }
}

/// Compare-and-swap style update of one job record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConditionalUpdate {
    pub conditions: Vec<Condition>,
    pub mutations: Vec<Mutation>,
}

impl ConditionalUpdate {
    /// Check all conditions, then apply all mutations.
    ///
    /// On any failure `job` is left untouched. A failed condition yields
    /// [`DomainError::Conflict`]; a mutation that would break a record
    /// invariant yields [`DomainError::InvariantViolation`].
    pub fn apply(&self, job: &mut Job) -> DomainResult<()> {
        for condition in &self.conditions {
            condition.check(job)?;
        }
        let mut next = job.clone();
        for mutation in &self.mutations {
            mutation.apply(&mut next)?;
        }
        next.check_invariants()?;
        *job = next;
        Ok(())
    }
}

/// The named transitions of the job lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    /// `PENDING → RUNNING`, taken before the processing task is dispatched.
    Start,
    /// `RUNNING → COMPLETED`, recording the uploaded outputs.
    Complete {
        result: ObjectRef,
        log: ObjectRef,
        complete_time: i64,
    },
    /// Record the cold-tier handle; only once per archival cycle.
    Archive { archive_id: ArchiveId },
    /// Clear the cold-tier handle after the result is back in the hot tier.
    Restore,
}

impl Transition {
    pub fn name(&self) -> &'static str {
        match self {
            Transition::Start => "start",
            Transition::Complete { .. } => "complete",
            Transition::Archive { .. } => "archive",
            Transition::Restore => "restore",
        }
    }

    pub fn update(&self) -> ConditionalUpdate {
        match self {
            Transition::Start => ConditionalUpdate {
                conditions: vec![Condition::StatusIs(JobStatus::Pending)],
                mutations: vec![Mutation::SetStatus(JobStatus::Running)],
            },
            Transition::Complete {
                result,
                log,
                complete_time,
            } => ConditionalUpdate {
                conditions: vec![Condition::StatusIs(JobStatus::Running)],
                mutations: vec![
                    Mutation::SetStatus(JobStatus::Completed),
                    Mutation::SetOutputs {
                        result: result.clone(),
                        log: log.clone(),
                        complete_time: *complete_time,
                    },
                ],
            },
            Transition::Archive { archive_id } => ConditionalUpdate {
                conditions: vec![
                    Condition::StatusIs(JobStatus::Completed),
                    Condition::ArchivedIs(false),
                ],
                mutations: vec![Mutation::SetArchive(archive_id.clone())],
            },
            Transition::Restore => ConditionalUpdate {
                conditions: vec![Condition::ArchivedIs(true)],
                mutations: vec![Mutation::ClearArchive],
            },
        }
    }

    /// Apply this transition to an in-memory record.
    pub fn apply(&self, job: &mut Job) -> DomainResult<()> {
        self.update().apply(job)
    }
}
