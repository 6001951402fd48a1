//! Archiver: moves free-tier results from the hot tier to the cold tier.
//!
//! Order matters: the cold copy is written and recorded on the job before the
//! hot copy is deleted, so the result is never absent from both tiers. If the
//! `Archive` update loses a race, the copy just written is deleted again and
//! the winner's archive stays the only one.

use std::sync::Arc;

use tracing::{info, warn};

use annoflow_core::{JobStatus, Transition};
use annoflow_events::{ArchiveEligible, Notification, PipelineEvent};

use crate::accounts::ProfileStore;
use crate::metadata::{MetadataStore, StoreError};
use crate::storage::{ColdArchive, HotStore};

use super::runner::{MessageHandler, Outcome, WorkerError};

pub struct Archiver {
    profiles: Arc<dyn ProfileStore>,
    metadata: Arc<dyn MetadataStore>,
    hot: Arc<dyn HotStore>,
    cold: Arc<dyn ColdArchive>,
}

impl Archiver {
    pub fn new(
        profiles: Arc<dyn ProfileStore>,
        metadata: Arc<dyn MetadataStore>,
        hot: Arc<dyn HotStore>,
        cold: Arc<dyn ColdArchive>,
    ) -> Self {
        Self {
            profiles,
            metadata,
            hot,
            cold,
        }
    }
}

impl MessageHandler for Archiver {
    fn name(&self) -> &str {
        "archiver"
    }

    fn topic(&self) -> &str {
        ArchiveEligible::TOPIC
    }

    fn handle(&self, notification: &Notification) -> Result<Outcome, WorkerError> {
        let event: ArchiveEligible = notification
            .decode()
            .map_err(|e| WorkerError::permanent(format!("malformed archive request: {e}")))?;
        let job_id = &event.job_id;

        let Some(profile) = self.profiles.get_profile(&event.user_id)? else {
            return Err(WorkerError::permanent(format!("unknown user {}", event.user_id)));
        };
        if !profile.tier.archives_results() {
            return Ok(Outcome::Skipped(format!(
                "user {} is {}; results stay hot",
                event.user_id,
                profile.tier.as_str()
            )));
        }

        let Some(job) = self.metadata.get(job_id)? else {
            return Err(WorkerError::transient(format!("job {job_id} not found")));
        };
        let Some(result) = job.result.clone() else {
            if job.status != JobStatus::Completed {
                warn!(job_id = %job_id, status = %job.status, "archive check for unfinished job");
                return Ok(Outcome::Skipped(format!("job {job_id} is {}", job.status)));
            }
            return Err(WorkerError::permanent(format!("job {job_id} has no result reference")));
        };

        if job.archived {
            // A crash between archiving and the hot delete leaves both copies.
            // A restore may have put the hot copy back since `job` was read, so
            // the record is checked again right before deleting.
            if self.hot.exists(&result)? {
                let current = self.metadata.require(job_id)?;
                if !current.archived || current.result_archive_id != job.result_archive_id {
                    return Ok(Outcome::Skipped(format!("job {job_id} restored concurrently")));
                }
                self.hot.delete(&result)?;
                info!(job_id = %job_id, result = %result, "stale hot copy of archived result removed");
            }
            return Ok(Outcome::Skipped(format!("job {job_id} already archived")));
        }
        if job.status != JobStatus::Completed {
            warn!(job_id = %job_id, status = %job.status, "archive check for unfinished job");
            return Ok(Outcome::Skipped(format!("job {job_id} is {}", job.status)));
        }

        let data = self.hot.get(&result)?;
        let archive_id = self.cold.upload_archive(data)?;

        match self.metadata.transition(
            job_id,
            &Transition::Archive {
                archive_id: archive_id.clone(),
            },
        ) {
            Ok(_) => {}
            Err(StoreError::ConditionFailed { reason, .. }) => {
                if let Err(e) = self.cold.delete_archive(&archive_id) {
                    warn!(job_id = %job_id, archive_id = %archive_id, error = %e, "failed to delete duplicate archive");
                }
                return Ok(Outcome::Skipped(format!("job {job_id} archived concurrently: {reason}")));
            }
            Err(e) => return Err(e.into()),
        }

        self.hot.delete(&result)?;
        info!(job_id = %job_id, user_id = %event.user_id, archive_id = %archive_id, "result archived");
        Ok(Outcome::Done)
    }
}
