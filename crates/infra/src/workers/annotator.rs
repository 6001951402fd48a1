//! Annotation worker: runs the processing task for a requested job.
//!
//! Per request:
//! 1. load the record; skip finished jobs, leave jobs owned by another worker
//! 2. download the input into `<work_dir>/<job_id>/`
//! 3. `PENDING → RUNNING` (conditional; exactly one worker wins)
//! 4. run the task, upload result and log to the results bucket
//! 5. `RUNNING → COMPLETED` with the output references
//! 6. announce completion and schedule the archive check
//!
//! Every delivery that finds the job `COMPLETED` repeats step 6 before acking,
//! so a failure or crash after the `Complete` write is healed by redelivery.
//! Consumers of both announcements are idempotent.
//!
//! A job found `RUNNING` is never re-run: the message is left unacked until
//! the receive cap dead-letters it, and the job stays visibly stuck.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{error, info, warn};

use annoflow_core::{Job, JobId, JobStatus, ObjectRef, Transition};
use annoflow_events::{
    ArchiveEligible, DelayedScheduler, DelayedSchedulerExt, JobCompleted, JobRequested, NotificationBus,
    NotificationBusExt, Notification, PipelineEvent,
};

use crate::metadata::{MetadataStore, StoreError};
use crate::storage::HotStore;
use crate::submission::object_key;
use crate::task::ProcessingTask;

use super::runner::{MessageHandler, Outcome, WorkerError};

#[derive(Debug, Clone)]
pub struct AnnotatorConfig {
    /// Parent of the per-job scratch directories.
    pub work_dir: PathBuf,
    pub results_bucket: String,
    pub key_prefix: String,
    /// Delay between completion and the archive check.
    pub archive_delay: Duration,
    /// Prefix of the result URL sent to the notifier; the job id is appended.
    pub result_url_base: String,
}

pub struct AnnotationWorker {
    metadata: Arc<dyn MetadataStore>,
    hot: Arc<dyn HotStore>,
    task: Arc<dyn ProcessingTask>,
    bus: Arc<dyn NotificationBus>,
    scheduler: Arc<dyn DelayedScheduler>,
    config: AnnotatorConfig,
}

impl AnnotationWorker {
    pub fn new(
        metadata: Arc<dyn MetadataStore>,
        hot: Arc<dyn HotStore>,
        task: Arc<dyn ProcessingTask>,
        bus: Arc<dyn NotificationBus>,
        scheduler: Arc<dyn DelayedScheduler>,
        config: AnnotatorConfig,
    ) -> Self {
        Self {
            metadata,
            hot,
            task,
            bus,
            scheduler,
            config,
        }
    }

    fn job_dir(&self, job_id: &JobId) -> PathBuf {
        self.config.work_dir.join(job_id.as_str())
    }

    fn cleanup(&self, job_id: &JobId) {
        let dir = self.job_dir(job_id);
        match std::fs::remove_dir_all(&dir) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(job_id = %job_id, dir = %dir.display(), error = %e, "failed to remove work dir"),
        }
    }

    /// Handle a job that is not (or no longer) ours to run.
    fn not_runnable(&self, job: &Job, request: &JobRequested) -> Result<Outcome, WorkerError> {
        let job_id = &job.job_id;
        match job.status {
            JobStatus::Completed => {
                self.announce(job, request)?;
                Ok(Outcome::Skipped(format!(
                    "job {job_id} already completed; completion re-announced"
                )))
            }
            JobStatus::Running => Err(WorkerError::transient(format!(
                "job {job_id} is already running"
            ))),
            JobStatus::Pending => Err(WorkerError::transient(format!("job {job_id} is still pending"))),
        }
    }

    /// Notify the owner and schedule the archive check for a completed job.
    fn announce(&self, job: &Job, request: &JobRequested) -> Result<(), WorkerError> {
        let job_id = &job.job_id;
        let complete_time = job
            .complete_time
            .ok_or_else(|| WorkerError::permanent(format!("job {job_id} completed without a completion time")))?;

        self.bus.publish_event(&JobCompleted {
            job_id: job_id.clone(),
            complete_time,
            result_url: format!("{}{}", self.config.result_url_base, job_id),
            owner_email: request.owner_email.clone(),
            user_id: job.user_id.clone(),
        })?;

        if job.archived {
            return Ok(());
        }
        let due_at = self.scheduler.schedule_event(
            &ArchiveEligible {
                job_id: job_id.clone(),
                user_id: job.user_id.clone(),
            },
            self.config.archive_delay,
        )?;
        info!(job_id = %job_id, user_id = %job.user_id, archive_check_at = %due_at, "completion announced");
        Ok(())
    }

    fn run_job(&self, job: &Job, request: &JobRequested) -> Result<Outcome, WorkerError> {
        let job_id = &job.job_id;
        let input_name = Path::new(&job.input_file_name)
            .file_name()
            .map(|n| n.to_os_string())
            .ok_or_else(|| WorkerError::permanent(format!("job {job_id}: bad input file name")))?;

        let dir = self.job_dir(job_id);
        std::fs::create_dir_all(&dir)
            .map_err(|e| WorkerError::transient(format!("create {}: {e}", dir.display())))?;
        let input_path = dir.join(&input_name);

        let input = ObjectRef::new(&request.input_bucket, &request.input_key);
        let bytes = self.hot.download_to(&input, &input_path)?;
        info!(job_id = %job_id, input = %input, bytes, "input downloaded");

        match self.metadata.transition(job_id, &Transition::Start) {
            Ok(_) => {}
            Err(e) if e.is_condition_failed() => {
                let current = self.metadata.require(job_id)?;
                return self.not_runnable(&current, request);
            }
            Err(e) => return Err(e.into()),
        }

        let output = self.task.run(&input_path, &dir)?;

        let upload = |path: &Path| -> Result<ObjectRef, WorkerError> {
            let file_name = path
                .file_name()
                .and_then(|n| n.to_str())
                .ok_or_else(|| WorkerError::permanent(format!("bad output path {}", path.display())))?;
            let target = ObjectRef::new(
                &self.config.results_bucket,
                object_key(&self.config.key_prefix, &job.user_id, job_id, file_name),
            );
            self.hot.upload_from(path, &target)?;
            Ok(target)
        };
        let result = upload(&output.result)?;
        let log = upload(&output.log)?;

        let complete_time = Utc::now().timestamp();
        let completed = Transition::Complete {
            result: result.clone(),
            log,
            complete_time,
        };
        let completed_job = match self.metadata.transition(job_id, &completed) {
            Ok(updated) => updated,
            Err(StoreError::ConditionFailed { reason, .. }) => {
                let current = self.metadata.require(job_id)?;
                if current.status == JobStatus::Completed {
                    self.announce(&current, request)?;
                    return Ok(Outcome::Skipped(format!("job {job_id} completed concurrently")));
                }
                return Err(WorkerError::transient(format!("complete job {job_id}: {reason}")));
            }
            Err(e) => return Err(e.into()),
        };
        info!(job_id = %job_id, user_id = %job.user_id, result = %result, complete_time = %complete_time, "job completed");

        self.announce(&completed_job, request)?;
        Ok(Outcome::Done)
    }
}

impl MessageHandler for AnnotationWorker {
    fn name(&self) -> &str {
        "annotator"
    }

    fn topic(&self) -> &str {
        JobRequested::TOPIC
    }

    fn handle(&self, notification: &Notification) -> Result<Outcome, WorkerError> {
        let request: JobRequested = notification
            .decode()
            .map_err(|e| WorkerError::permanent(format!("malformed job request: {e}")))?;
        let job_id = &request.job_id;

        let Some(job) = self.metadata.get(job_id)? else {
            // The record may not be visible yet.
            return Err(WorkerError::transient(format!("job {job_id} not found")));
        };
        if job.user_id != request.user_id {
            return Err(WorkerError::permanent(format!(
                "job {job_id} belongs to {}, request names {}",
                job.user_id, request.user_id
            )));
        }
        let outcome = if job.status == JobStatus::Pending {
            self.run_job(&job, &request)
        } else {
            self.not_runnable(&job, &request)
        };
        // Also clears what an attempt that failed after completing left behind.
        if outcome.is_ok() {
            self.cleanup(job_id);
        }
        outcome
    }

    fn on_dead_letter(&self, notification: Option<&Notification>, reason: &str) {
        let Some(request) = notification.and_then(|n| n.decode::<JobRequested>().ok()) else {
            return;
        };
        error!(job_id = %request.job_id, user_id = %request.user_id, reason, "job request abandoned");
        self.cleanup(&request.job_id);
    }
}
