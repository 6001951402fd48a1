//! Thaw initiator: starts cold-tier retrievals for a newly premium user.
//!
//! Each archived job gets an expedited retrieval; when expedited capacity is
//! exhausted, exactly one standard retrieval is requested instead. Completion
//! is handled by the restorer.

use std::sync::Arc;

use tracing::{error, info};

use annoflow_core::{ArchiveId, JobId, RetrievalId};
use annoflow_events::{Notification, PipelineEvent, TierUpgraded};

use crate::metadata::MetadataStore;
use crate::storage::{ColdArchive, ColdError, RetrievalTier};

use super::runner::{MessageHandler, Outcome, WorkerError};

pub struct ThawInitiator {
    metadata: Arc<dyn MetadataStore>,
    cold: Arc<dyn ColdArchive>,
}

impl ThawInitiator {
    pub fn new(metadata: Arc<dyn MetadataStore>, cold: Arc<dyn ColdArchive>) -> Self {
        Self { metadata, cold }
    }

    fn request(
        &self,
        job_id: &JobId,
        archive_id: &ArchiveId,
    ) -> Result<(RetrievalId, RetrievalTier), ColdError> {
        match self
            .cold
            .initiate_retrieval(archive_id, RetrievalTier::Expedited, job_id.as_str())
        {
            Ok(id) => Ok((id, RetrievalTier::Expedited)),
            Err(ColdError::InsufficientCapacity(_)) => {
                info!(job_id = %job_id, "expedited capacity exhausted; falling back to standard");
                self.cold
                    .initiate_retrieval(archive_id, RetrievalTier::Standard, job_id.as_str())
                    .map(|id| (id, RetrievalTier::Standard))
            }
            Err(e) => Err(e),
        }
    }
}

impl MessageHandler for ThawInitiator {
    fn name(&self) -> &str {
        "thaw"
    }

    fn topic(&self) -> &str {
        TierUpgraded::TOPIC
    }

    fn handle(&self, notification: &Notification) -> Result<Outcome, WorkerError> {
        let event: TierUpgraded = notification
            .decode()
            .map_err(|e| WorkerError::permanent(format!("malformed upgrade event: {e}")))?;
        let user_id = &event.user_id;

        let archived: Vec<_> = self
            .metadata
            .jobs_for_user(user_id)?
            .into_iter()
            .filter(|j| j.archived)
            .filter_map(|j| j.result_archive_id.clone().map(|a| (j.job_id, a)))
            .collect();
        if archived.is_empty() {
            return Ok(Outcome::Skipped(format!("user {user_id} has no archived results")));
        }

        let mut failed = Vec::new();
        for (job_id, archive_id) in &archived {
            match self.request(job_id, archive_id) {
                Ok((retrieval_id, tier)) => info!(
                    user_id = %user_id,
                    job_id = %job_id,
                    archive_id = %archive_id,
                    retrieval_id = %retrieval_id,
                    tier = tier.as_str(),
                    "retrieval requested"
                ),
                Err(e) => {
                    error!(user_id = %user_id, job_id = %job_id, archive_id = %archive_id, error = %e, "retrieval request failed");
                    failed.push(job_id.to_string());
                }
            }
        }

        if failed.is_empty() {
            Ok(Outcome::Done)
        } else {
            Err(WorkerError::transient(format!(
                "retrieval failed for {} of {} jobs: {}",
                failed.len(),
                archived.len(),
                failed.join(", ")
            )))
        }
    }
}
