//! Restorer: puts a retrieved archive back into the hot tier.
//!
//! The result is written to its original location before the job is marked
//! un-archived, so a downloadable job always has a hot copy. The cold archive
//! is kept.

use std::sync::Arc;

use tracing::info;

use annoflow_core::{JobId, Transition};
use annoflow_events::{Notification, PipelineEvent, RetrievalCompleted, RetrievalStatus};

use crate::metadata::{MetadataStore, StoreError};
use crate::storage::{ColdArchive, ColdError, HotStore};

use super::runner::{MessageHandler, Outcome, WorkerError};

pub struct Restorer {
    metadata: Arc<dyn MetadataStore>,
    hot: Arc<dyn HotStore>,
    cold: Arc<dyn ColdArchive>,
}

impl Restorer {
    pub fn new(metadata: Arc<dyn MetadataStore>, hot: Arc<dyn HotStore>, cold: Arc<dyn ColdArchive>) -> Self {
        Self { metadata, hot, cold }
    }
}

impl MessageHandler for Restorer {
    fn name(&self) -> &str {
        "restorer"
    }

    fn topic(&self) -> &str {
        RetrievalCompleted::TOPIC
    }

    fn handle(&self, notification: &Notification) -> Result<Outcome, WorkerError> {
        let event: RetrievalCompleted = notification
            .decode()
            .map_err(|e| WorkerError::permanent(format!("malformed retrieval completion: {e}")))?;
        let retrieval_id = &event.retrieval_job_id;

        if event.status != RetrievalStatus::Succeeded {
            return Err(WorkerError::permanent(format!(
                "retrieval {retrieval_id} for {} ended {:?}",
                event.description, event.status
            )));
        }

        let job_id = JobId::parse(event.description.clone()).map_err(|e| {
            WorkerError::permanent(format!("retrieval {retrieval_id}: bad job id in description: {e}"))
        })?;
        let Some(job) = self.metadata.get(&job_id)? else {
            return Err(WorkerError::permanent(format!("retrieval {retrieval_id}: job {job_id} not found")));
        };
        if !job.archived {
            return Ok(Outcome::Skipped(format!("job {job_id} already restored")));
        }
        let Some(result) = job.result.clone() else {
            return Err(WorkerError::permanent(format!("job {job_id} has no result reference")));
        };

        let data = match self.cold.retrieval_output(retrieval_id) {
            Ok(data) => data,
            Err(e @ (ColdError::RetrievalNotFound(_) | ColdError::ArchiveNotFound(_))) => {
                return Err(WorkerError::permanent(e.to_string()));
            }
            Err(e) => return Err(e.into()),
        };
        let size = data.len();
        self.hot.put(&result, data)?;

        match self.metadata.transition(&job_id, &Transition::Restore) {
            Ok(_) => {}
            Err(StoreError::ConditionFailed { .. }) => {
                return Ok(Outcome::Skipped(format!("job {job_id} restored concurrently")));
            }
            Err(e) => return Err(e.into()),
        }

        info!(
            job_id = %job_id,
            retrieval_id = %retrieval_id,
            result = %result,
            size,
            "result restored to hot tier"
        );
        Ok(Outcome::Done)
    }
}
