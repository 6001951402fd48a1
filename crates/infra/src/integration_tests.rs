//! End-to-end pipeline scenarios on in-memory backends.
//!
//! Submission → annotation → (delay) archive → upgrade → thaw → (delay) restore,
//! plus the duplicate-delivery and failure paths each stage must survive.

use crate::storage::cold::ColdArchive;
use std::path::Path;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use object_store::memory::InMemory;
use tempfile::TempDir;
use tokio::runtime::Runtime;

use annoflow_core::{Job, JobId, JobStatus, ObjectRef, SubscriptionTier, Transition, UserId, UserProfile};
use annoflow_events::{
    ArchiveEligible, DelayError, DelayedScheduler, InMemoryDelayScheduler, JobCompleted, MessageQueue,
    Notification, NotificationBusExt, RetrievalCompleted, RetrievalStatus, topics,
};

use crate::accounts::{InMemoryProfileStore, upgrade_to_premium};
use crate::config::PipelineConfig;
use crate::metadata::{InMemoryMetadataStore, MetadataStore};
use crate::monitor::find_stuck_jobs;
use crate::pipeline::Pipeline;
use crate::storage::{HotStore, HotStoreError, ObjectStoreHotTier, RetrievalTier, VaultArchive};
use crate::submission::{SubmitRequest, stage_input, submit_job};
use crate::task::{OutputNaming, TaskError, TaskOutput};
use crate::topology::Topology;
use crate::workers::runner::Disposition;
use crate::workers::{
    AnnotationWorker, Archiver, Outcome, QueueWorker, Restorer, ThawInitiator, WorkerError,
};

const INPUT: &[u8] = b"chr1\t12345\trs1\tA\tG\n";

struct Harness {
    // Keeps the runtime behind the object-store clients alive.
    _rt: Runtime,
    _work: TempDir,
    pipeline: Pipeline,
    metadata: Arc<InMemoryMetadataStore>,
    profiles: Arc<InMemoryProfileStore>,
    scheduler: Arc<InMemoryDelayScheduler>,
    vault: Arc<VaultArchive>,
    task_runs: Arc<AtomicUsize>,
    /// Makes the task fail without producing outputs.
    fail_task: Arc<AtomicBool>,
}

impl Harness {
    fn new() -> Self {
        Self::with_config(|_| {})
    }

    fn with_config(tweak: impl FnOnce(&mut PipelineConfig)) -> Self {
        let rt = Runtime::new().unwrap();
        let work = TempDir::new().unwrap();

        let mut config = PipelineConfig {
            work_dir: work.path().to_path_buf(),
            key_prefix: "annoflow".into(),
            archive_delay: Duration::ZERO,
            visibility_timeout: Duration::from_secs(30),
            wait_time: Duration::ZERO,
            expedited_latency: Duration::ZERO,
            standard_latency: Duration::ZERO,
            ..PipelineConfig::default()
        };
        tweak(&mut config);

        let metadata = InMemoryMetadataStore::arc();
        let profiles = InMemoryProfileStore::arc();
        let scheduler = Arc::new(InMemoryDelayScheduler::new());
        let hot = Arc::new(ObjectStoreHotTier::new(Arc::new(InMemory::new()), rt.handle().clone()));
        let vault = Arc::new(VaultArchive::new(
            Arc::new(InMemory::new()),
            rt.handle().clone(),
            scheduler.clone(),
            config.vault_config(),
        ));

        let task_runs = Arc::new(AtomicUsize::new(0));
        let fail_task = Arc::new(AtomicBool::new(false));
        let runs = task_runs.clone();
        let fail = fail_task.clone();
        let naming = config.output_naming();
        let task = move |input: &Path, _work_dir: &Path| -> Result<TaskOutput, TaskError> {
            runs.fetch_add(1, Ordering::SeqCst);
            if fail.load(Ordering::SeqCst) {
                return Err(TaskError::MissingOutput(naming.outputs_for(input)?.result));
            }
            annotate(&naming, input)
        };

        let pipeline = Pipeline {
            topology: Topology::in_memory(config.visibility_timeout),
            config,
            metadata: metadata.clone(),
            profiles: profiles.clone(),
            hot,
            cold: vault.clone(),
            scheduler: scheduler.clone(),
            task: Arc::new(task),
        };

        Self {
            _rt: rt,
            _work: work,
            pipeline,
            metadata,
            profiles,
            scheduler,
            vault,
            task_runs,
            fail_task,
        }
    }

    /// Scratch directory the annotator uses for `job_id`.
    fn job_dir(&self, job_id: &JobId) -> std::path::PathBuf {
        self._work.path().join(job_id.as_str())
    }

    fn add_user(&self, user: &str, tier: SubscriptionTier) -> UserId {
        let user_id = UserId::parse(user).unwrap();
        self.profiles
            .upsert(UserProfile::new(user_id.clone(), tier, format!("{user}@example.com")));
        user_id
    }

    fn request(&self, job: &str, user_id: &UserId) -> SubmitRequest {
        let job_id = JobId::parse(job).unwrap();
        let input = ObjectRef::new(
            &self.pipeline.config.inputs_bucket,
            crate::submission::object_key(&self.pipeline.config.key_prefix, user_id, &job_id, "in.vcf"),
        );
        SubmitRequest {
            job_id,
            user_id: user_id.clone(),
            owner_email: format!("{user_id}@example.com"),
            input_file_name: "in.vcf".into(),
            input,
        }
    }

    /// Upload the input and submit the job.
    fn submit(&self, job: &str, user_id: &UserId) -> JobId {
        let request = self.request(job, user_id);
        stage_input(
            self.pipeline.hot.as_ref(),
            &self.pipeline.config.inputs_bucket,
            &self.pipeline.config.key_prefix,
            user_id,
            &request.job_id,
            "in.vcf",
            Bytes::from_static(INPUT),
        )
        .unwrap();
        submit_job(self.pipeline.metadata.as_ref(), &self.pipeline.bus(), request)
            .unwrap()
            .job_id
    }

    fn annotator(&self) -> QueueWorker<AnnotationWorker> {
        self.pipeline.queue_worker(self.pipeline.annotator()).unwrap()
    }

    fn archiver(&self) -> QueueWorker<Archiver> {
        self.pipeline.queue_worker(self.pipeline.archiver()).unwrap()
    }

    fn thaw(&self) -> QueueWorker<ThawInitiator> {
        self.pipeline.queue_worker(self.pipeline.thaw()).unwrap()
    }

    fn restorer(&self) -> QueueWorker<Restorer> {
        self.pipeline.queue_worker(self.pipeline.restorer()).unwrap()
    }

    /// Publish every delayed notification that is due.
    fn pump(&self) -> usize {
        self.pipeline.delay_pump().pump_once().unwrap()
    }

    fn job(&self, job_id: &JobId) -> Job {
        self.metadata.require(job_id).unwrap()
    }

    fn queue(&self, topic: &str) -> Arc<dyn MessageQueue> {
        self.pipeline.topology.queue(topic).unwrap()
    }

    fn dead_letters(&self, topic: &str) -> Arc<dyn MessageQueue> {
        self.pipeline.topology.dead_letters(topic).unwrap()
    }

    /// Submit, annotate and complete a job.
    fn completed_job(&self, job: &str, user_id: &UserId) -> JobId {
        let job_id = self.submit(job, user_id);
        assert_eq!(self.annotator().poll_once().unwrap(), vec![Disposition::Acked(Outcome::Done)]);
        job_id
    }

    /// Complete a job and move its result to the cold tier.
    fn archived_job(&self, job: &str, user_id: &UserId) -> JobId {
        let job_id = self.completed_job(job, user_id);
        assert_eq!(self.pump(), 1);
        assert_eq!(self.archiver().poll_once().unwrap(), vec![Disposition::Acked(Outcome::Done)]);
        assert!(self.job(&job_id).archived);
        job_id
    }
}

/// Stand-in annotation: the result is the input with a header line.
fn annotate(naming: &OutputNaming, input: &Path) -> Result<TaskOutput, TaskError> {
    let outputs = naming.outputs_for(input)?;
    let data = std::fs::read(input).map_err(|_| TaskError::InvalidInput(input.to_path_buf()))?;
    let mut result = b"##annotated\n".to_vec();
    result.extend_from_slice(&data);
    std::fs::write(&outputs.result, result).map_err(|_| TaskError::MissingOutput(outputs.result.clone()))?;
    std::fs::write(&outputs.log, b"1 variant\n").map_err(|_| TaskError::MissingOutput(outputs.log.clone()))?;
    Ok(outputs)
}

fn annotated() -> Vec<u8> {
    let mut expected = b"##annotated\n".to_vec();
    expected.extend_from_slice(INPUT);
    expected
}

fn drain(queue: &dyn MessageQueue) -> Vec<Notification> {
    let got = queue.receive(100, Duration::ZERO).unwrap();
    for m in &got {
        queue.ack(&m.receipt_handle).unwrap();
    }
    got.iter().map(|m| Notification::from_body(&m.body).unwrap()).collect()
}

#[test]
fn job_runs_archives_thaws_and_restores() {
    let h = Harness::new();
    let u1 = h.add_user("U1", SubscriptionTier::Free);

    // Submit: PENDING record and a request on the annotator queue.
    let j1 = h.submit("J1", &u1);
    assert_eq!(h.job(&j1).status, JobStatus::Pending);

    // Annotate.
    assert_eq!(h.annotator().poll_once().unwrap(), vec![Disposition::Acked(Outcome::Done)]);
    let job = h.job(&j1);
    assert_eq!(job.status, JobStatus::Completed);
    assert!(job.complete_time.is_some());
    let result = job.result.clone().unwrap();
    assert_eq!(result.bucket, "annoflow-results");
    assert_eq!(result.key, "annoflow/U1/J1~in.annot.vcf");
    assert_eq!(job.log.clone().unwrap().key, "annoflow/U1/J1~in.vcf.count.log");
    assert_eq!(h.pipeline.hot.get(&result).unwrap().as_ref(), annotated().as_slice());
    assert!(job.is_downloadable());

    let notices = drain(h.queue(topics::JOB_RESULTS).as_ref());
    assert_eq!(notices.len(), 1);
    let completed: JobCompleted = notices[0].decode().unwrap();
    assert_eq!(completed.job_id, j1);
    assert_eq!(completed.owner_email, "U1@example.com");
    assert_eq!(completed.result_url, "http://localhost:5000/annotations/J1");

    // Archive check fires after the delay; the free user's result goes cold.
    assert_eq!(h.scheduler.pending(), 1);
    assert_eq!(h.pump(), 1);
    assert_eq!(h.archiver().poll_once().unwrap(), vec![Disposition::Acked(Outcome::Done)]);
    let job = h.job(&j1);
    assert!(job.archived);
    assert!(job.result_archive_id.is_some());
    assert!(!job.is_downloadable());
    assert!(!h.pipeline.hot.exists(&result).unwrap());
    assert_eq!(h.vault.archive_ids().unwrap(), vec![job.result_archive_id.clone().unwrap()]);

    // Upgrade: thaw requests an expedited retrieval.
    upgrade_to_premium(h.profiles.as_ref(), &h.pipeline.bus(), &u1).unwrap();
    assert_eq!(h.thaw().poll_once().unwrap(), vec![Disposition::Acked(Outcome::Done)]);
    let retrievals = h.vault.retrievals().unwrap();
    assert_eq!(retrievals.len(), 1);
    assert_eq!(retrievals[0].tier, RetrievalTier::Expedited);
    assert_eq!(retrievals[0].description, "J1");

    // Retrieval completes; the restorer puts the result back.
    assert_eq!(h.pump(), 1);
    assert_eq!(h.restorer().poll_once().unwrap(), vec![Disposition::Acked(Outcome::Done)]);
    let job = h.job(&j1);
    assert!(!job.archived);
    assert_eq!(job.status, JobStatus::Completed);
    assert!(job.is_downloadable());
    assert_eq!(h.pipeline.hot.get(&result).unwrap().as_ref(), annotated().as_slice());

    // The cold copy is retained.
    assert_eq!(h.vault.archive_ids().unwrap().len(), 1);
    assert!(find_stuck_jobs(h.metadata.as_ref(), Duration::ZERO, Utc::now()).unwrap().is_empty());
}

#[test]
fn duplicate_job_request_runs_the_task_once() {
    let h = Harness::new();
    let u1 = h.add_user("U1", SubscriptionTier::Free);
    let j1 = h.submit("J1", &u1);
    // Resubmitting a PENDING job republishes its request.
    submit_job(h.pipeline.metadata.as_ref(), &h.pipeline.bus(), h.request("J1", &u1)).unwrap();

    let annotator = h.annotator();
    let mut outcomes = Vec::new();
    for _ in 0..2 {
        outcomes.extend(annotator.poll_once().unwrap());
    }

    assert!(outcomes.contains(&Disposition::Acked(Outcome::Done)));
    assert!(outcomes
        .iter()
        .any(|d| matches!(d, Disposition::Acked(Outcome::Skipped(_)))));
    assert_eq!(h.task_runs.load(Ordering::SeqCst), 1);
    assert_eq!(h.job(&j1).status, JobStatus::Completed);
    // The duplicate re-announces the completion; both consumers are idempotent.
    assert_eq!(drain(h.queue(topics::JOB_RESULTS).as_ref()).len(), 2);
    assert_eq!(h.scheduler.pending(), 2);
    assert!(!h.job_dir(&j1).exists());

    assert_eq!(h.pump(), 2);
    let archiver = h.archiver();
    assert_eq!(archiver.poll_once().unwrap(), vec![Disposition::Acked(Outcome::Done)]);
    assert!(matches!(archiver.poll_once().unwrap()[..], [Disposition::Acked(Outcome::Skipped(_))]));
    assert_eq!(h.vault.archive_ids().unwrap().len(), 1);
}

/// Fails the first `fail` schedule calls, then delegates.
struct FlakyScheduler {
    inner: Arc<InMemoryDelayScheduler>,
    fail: Mutex<usize>,
}

impl DelayedScheduler for FlakyScheduler {
    fn schedule(&self, notification: Notification, due_at: DateTime<Utc>) -> Result<(), DelayError> {
        let mut fail = self.fail.lock().unwrap();
        if *fail > 0 {
            *fail -= 1;
            return Err(DelayError::Unavailable("scheduler restarting".into()));
        }
        self.inner.schedule(notification, due_at)
    }

    fn promote_due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Notification>, DelayError> {
        self.inner.promote_due(now, limit)
    }
}

#[test]
fn failed_archive_scheduling_is_repaired_by_redelivery() {
    let mut h = Harness::with_config(|c| {
        c.visibility_timeout = Duration::from_millis(50);
        c.wait_time = Duration::from_millis(500);
    });
    h.pipeline.scheduler = Arc::new(FlakyScheduler {
        inner: h.scheduler.clone(),
        fail: Mutex::new(1),
    });
    let u1 = h.add_user("U1", SubscriptionTier::Free);
    let j1 = h.submit("J1", &u1);

    // Completed, but the archive check could not be scheduled.
    let annotator = h.annotator();
    assert!(matches!(annotator.poll_once().unwrap()[..], [Disposition::Retry(_)]));
    assert_eq!(h.job(&j1).status, JobStatus::Completed);
    assert_eq!(h.scheduler.pending(), 0);

    // The redelivery finds the job completed and announces it again.
    assert!(matches!(
        annotator.poll_once().unwrap()[..],
        [Disposition::Acked(Outcome::Skipped(_))]
    ));
    assert_eq!(h.task_runs.load(Ordering::SeqCst), 1);
    assert_eq!(h.scheduler.pending(), 1);
    assert!(!h.job_dir(&j1).exists());
    let notices = drain(h.queue(topics::JOB_RESULTS).as_ref());
    assert_eq!(notices.len(), 2);
    assert!(notices
        .iter()
        .all(|n| n.decode::<JobCompleted>().unwrap().job_id == j1));

    assert_eq!(h.pump(), 1);
    assert_eq!(h.archiver().poll_once().unwrap(), vec![Disposition::Acked(Outcome::Done)]);
    assert!(h.job(&j1).archived);
}

#[test]
fn work_dir_is_removed_after_success() {
    let h = Harness::new();
    let u1 = h.add_user("U1", SubscriptionTier::Free);
    let j1 = h.completed_job("J1", &u1);
    assert!(!h.job_dir(&j1).exists());
}

#[test]
fn task_failure_after_start_leaves_job_running_and_stuck() {
    let h = Harness::new();
    h.fail_task.store(true, Ordering::SeqCst);
    let u1 = h.add_user("U1", SubscriptionTier::Free);
    let j1 = h.submit("J1", &u1);

    let annotator = h.annotator();
    assert!(matches!(annotator.poll_once().unwrap()[..], [Disposition::Retry(_)]));
    assert_eq!(annotator.stats().retried, 1);
    assert_eq!(h.task_runs.load(Ordering::SeqCst), 1);

    let job = h.job(&j1);
    assert_eq!(job.status, JobStatus::Running);
    assert!(job.result.is_none());
    assert!(drain(h.queue(topics::JOB_RESULTS).as_ref()).is_empty());
    assert_eq!(h.scheduler.pending(), 0);

    // Still unacked: in flight until the visibility window expires.
    assert!(h.queue(topics::JOB_REQUESTS).receive(10, Duration::ZERO).unwrap().is_empty());

    let stuck = find_stuck_jobs(h.metadata.as_ref(), Duration::ZERO, Utc::now()).unwrap();
    assert_eq!(stuck.len(), 1);
    assert_eq!(stuck[0].job_id, j1);
    assert_eq!(stuck[0].status, JobStatus::Running);
}

#[test]
fn running_job_is_not_rerun_on_redelivery() {
    let h = Harness::with_config(|c| {
        c.visibility_timeout = Duration::from_millis(50);
        c.wait_time = Duration::from_millis(500);
    });
    h.fail_task.store(true, Ordering::SeqCst);
    let u1 = h.add_user("U1", SubscriptionTier::Free);
    let j1 = h.submit("J1", &u1);

    let annotator = h.annotator();
    assert!(matches!(annotator.poll_once().unwrap()[..], [Disposition::Retry(_)]));
    h.fail_task.store(false, Ordering::SeqCst);
    assert!(matches!(annotator.poll_once().unwrap()[..], [Disposition::Retry(_)]));

    assert_eq!(h.task_runs.load(Ordering::SeqCst), 1);
    assert_eq!(h.job(&j1).status, JobStatus::Running);
}

#[test]
fn duplicate_archive_checks_leave_one_cold_object() {
    let h = Harness::new();
    let u1 = h.add_user("U1", SubscriptionTier::Free);
    let j1 = h.completed_job("J1", &u1);

    // The scheduled check plus a duplicate delivery.
    assert_eq!(h.pump(), 1);
    h.pipeline
        .bus()
        .publish_event(&ArchiveEligible {
            job_id: j1.clone(),
            user_id: u1.clone(),
        })
        .unwrap();

    let archiver = h.archiver();
    let first = archiver.poll_once().unwrap();
    let second = archiver.poll_once().unwrap();
    assert_eq!(first, vec![Disposition::Acked(Outcome::Done)]);
    assert!(matches!(second[..], [Disposition::Acked(Outcome::Skipped(_))]));

    let job = h.job(&j1);
    assert!(job.archived);
    assert_eq!(h.vault.archive_ids().unwrap(), vec![job.result_archive_id.unwrap()]);
}

#[test]
fn racing_archivers_leave_one_cold_object() {
    use crate::workers::MessageHandler;

    let h = Harness::new();
    let u1 = h.add_user("U1", SubscriptionTier::Free);
    let j1 = h.completed_job("J1", &u1);
    let n = Notification::for_event(&ArchiveEligible {
        job_id: j1.clone(),
        user_id: u1,
    })
    .unwrap();

    let archivers: Vec<Archiver> = (0..4).map(|_| h.pipeline.archiver()).collect();
    let results: Vec<Result<Outcome, WorkerError>> = std::thread::scope(|s| {
        let joins: Vec<_> = archivers.iter().map(|a| s.spawn(|| a.handle(&n))).collect();
        joins.into_iter().map(|j| j.join().unwrap()).collect()
    });

    assert!(results.iter().filter(|r| matches!(r, Ok(Outcome::Done))).count() <= 1);
    let job = h.job(&j1);
    assert!(job.archived);
    assert_eq!(h.vault.archive_ids().unwrap(), vec![job.result_archive_id.unwrap()]);
}

#[test]
fn duplicate_retrieval_completion_restores_once() {
    let h = Harness::new();
    let u1 = h.add_user("U1", SubscriptionTier::Free);
    let j1 = h.archived_job("J1", &u1);

    upgrade_to_premium(h.profiles.as_ref(), &h.pipeline.bus(), &u1).unwrap();
    h.thaw().poll_once().unwrap();
    let retrieval = h.vault.retrievals().unwrap().remove(0);

    // The scheduled completion plus a duplicate.
    assert_eq!(h.pump(), 1);
    h.pipeline
        .bus()
        .publish_event(&RetrievalCompleted {
            retrieval_job_id: retrieval.retrieval_id,
            description: j1.to_string(),
            status: RetrievalStatus::Succeeded,
        })
        .unwrap();

    let restorer = h.restorer();
    assert_eq!(restorer.poll_once().unwrap(), vec![Disposition::Acked(Outcome::Done)]);
    assert!(matches!(
        restorer.poll_once().unwrap()[..],
        [Disposition::Acked(Outcome::Skipped(_))]
    ));

    let job = h.job(&j1);
    assert!(!job.archived);
    let result = job.result.unwrap();
    assert_eq!(h.pipeline.hot.get(&result).unwrap().as_ref(), annotated().as_slice());
}

#[test]
fn premium_results_are_never_archived() {
    let h = Harness::new();
    let u2 = h.add_user("U2", SubscriptionTier::Premium);
    let j2 = h.completed_job("J2", &u2);

    assert_eq!(h.pump(), 1);
    assert!(matches!(
        h.archiver().poll_once().unwrap()[..],
        [Disposition::Acked(Outcome::Skipped(_))]
    ));

    let job = h.job(&j2);
    assert!(!job.archived);
    assert!(h.pipeline.hot.exists(&job.result.unwrap()).unwrap());
    assert!(h.vault.archive_ids().unwrap().is_empty());

    // Upgrading an already-premium user with nothing archived is a no-op for thaw.
    upgrade_to_premium(h.profiles.as_ref(), &h.pipeline.bus(), &u2).unwrap();
    assert!(matches!(
        h.thaw().poll_once().unwrap()[..],
        [Disposition::Acked(Outcome::Skipped(_))]
    ));
    assert!(h.vault.retrievals().unwrap().is_empty());
}

#[test]
fn thaw_failure_other_than_capacity_is_retried() {
    let h = Harness::new();
    let u1 = h.add_user("U1", SubscriptionTier::Free);
    let j1 = h.archived_job("J1", &u1);
    let archive_id = h.job(&j1).result_archive_id.unwrap();
    h.vault.delete_archive(&archive_id).unwrap();

    upgrade_to_premium(h.profiles.as_ref(), &h.pipeline.bus(), &u1).unwrap();
    let thaw = h.thaw();
    assert!(matches!(thaw.poll_once().unwrap()[..], [Disposition::Retry(_)]));
    assert_eq!(thaw.stats().retried, 1);

    // No standard fallback for a missing archive.
    assert!(h.vault.retrievals().unwrap().is_empty());
    assert!(h.job(&j1).archived);
}

/// Hot store that lets a restore land between the archiver's reads.
struct RestoringHotStore {
    inner: Arc<dyn HotStore>,
    metadata: Arc<InMemoryMetadataStore>,
    job_id: JobId,
}

impl HotStore for RestoringHotStore {
    fn get(&self, object: &ObjectRef) -> Result<Bytes, HotStoreError> {
        self.inner.get(object)
    }

    fn put(&self, object: &ObjectRef, data: Bytes) -> Result<(), HotStoreError> {
        self.inner.put(object, data)
    }

    fn delete(&self, object: &ObjectRef) -> Result<(), HotStoreError> {
        self.inner.delete(object)
    }

    fn exists(&self, object: &ObjectRef) -> Result<bool, HotStoreError> {
        let exists = self.inner.exists(object)?;
        if exists {
            let _ = self.metadata.transition(&self.job_id, &Transition::Restore);
        }
        Ok(exists)
    }
}

#[test]
fn archive_recheck_keeps_a_freshly_restored_hot_copy() {
    use crate::workers::MessageHandler;

    let h = Harness::new();
    let u1 = h.add_user("U1", SubscriptionTier::Free);
    let j1 = h.archived_job("J1", &u1);
    let result = h.job(&j1).result.unwrap();

    // The restorer has put the result back but not yet cleared the flag.
    h.pipeline.hot.put(&result, Bytes::from(annotated())).unwrap();
    let archiver = Archiver::new(
        h.profiles.clone(),
        h.metadata.clone(),
        Arc::new(RestoringHotStore {
            inner: h.pipeline.hot.clone(),
            metadata: h.metadata.clone(),
            job_id: j1.clone(),
        }),
        h.pipeline.cold.clone(),
    );
    let n = Notification::for_event(&ArchiveEligible {
        job_id: j1.clone(),
        user_id: u1,
    })
    .unwrap();

    assert!(matches!(archiver.handle(&n), Ok(Outcome::Skipped(_))));
    let job = h.job(&j1);
    assert!(!job.archived);
    assert!(job.is_downloadable());
    assert_eq!(h.pipeline.hot.get(&result).unwrap().as_ref(), annotated().as_slice());
}

#[test]
fn exhausted_expedited_capacity_falls_back_to_one_standard_request() {
    let h = Harness::with_config(|c| {
        c.expedited_capacity = Some(1);
        // Hold the expedited slot for the duration of the test.
        c.expedited_latency = Duration::from_secs(3600);
    });
    let u1 = h.add_user("U1", SubscriptionTier::Free);
    let j1 = h.archived_job("J1", &u1);
    let j2 = h.archived_job("J2", &u1);

    upgrade_to_premium(h.profiles.as_ref(), &h.pipeline.bus(), &u1).unwrap();
    assert_eq!(h.thaw().poll_once().unwrap(), vec![Disposition::Acked(Outcome::Done)]);

    let retrievals = h.vault.retrievals().unwrap();
    assert_eq!(retrievals.len(), 2);
    let tier_of = |job: &JobId| {
        let matching: Vec<RetrievalTier> = retrievals
            .iter()
            .filter(|r| r.description == job.as_str())
            .map(|r| r.tier)
            .collect();
        assert_eq!(matching.len(), 1, "exactly one retrieval for {job}");
        matching[0]
    };
    let mut tiers = vec![tier_of(&j1), tier_of(&j2)];
    tiers.sort_by_key(|t| t.as_str());
    assert_eq!(tiers, vec![RetrievalTier::Expedited, RetrievalTier::Standard]);

    // Only the standard retrieval is due now.
    assert_eq!(h.pump(), 1);
    assert_eq!(h.restorer().poll_once().unwrap(), vec![Disposition::Acked(Outcome::Done)]);
    assert_eq!(
        [&j1, &j2].iter().filter(|j| h.job(j).archived).count(),
        1
    );
}

#[test]
fn request_is_redelivered_after_visibility_timeout() {
    let h = Harness::with_config(|c| {
        c.visibility_timeout = Duration::from_millis(50);
        c.wait_time = Duration::from_millis(500);
    });
    let u1 = h.add_user("U1", SubscriptionTier::Free);

    // Submitted before its input is uploaded: the download fails and the job stays PENDING.
    let request = h.request("J1", &u1);
    let j1 = request.job_id.clone();
    submit_job(h.pipeline.metadata.as_ref(), &h.pipeline.bus(), request.clone()).unwrap();

    let annotator = h.annotator();
    assert!(matches!(annotator.poll_once().unwrap()[..], [Disposition::Retry(_)]));
    assert_eq!(h.job(&j1).status, JobStatus::Pending);

    h.pipeline
        .hot
        .put(&request.input, Bytes::from_static(INPUT))
        .unwrap();

    // Not acked, so it comes back once the window expires.
    assert_eq!(annotator.poll_once().unwrap(), vec![Disposition::Acked(Outcome::Done)]);
    assert_eq!(h.job(&j1).status, JobStatus::Completed);
    assert_eq!(annotator.stats().retried, 1);
    assert_eq!(h.task_runs.load(Ordering::SeqCst), 1);
}

#[test]
fn request_is_dead_lettered_after_receive_cap() {
    let h = Harness::with_config(|c| {
        c.visibility_timeout = Duration::from_millis(30);
        c.wait_time = Duration::from_millis(500);
        c.max_receives = 2;
    });
    let u1 = h.add_user("U1", SubscriptionTier::Free);
    let request = h.request("J1", &u1);
    let j1 = request.job_id.clone();
    // The input never arrives.
    submit_job(h.pipeline.metadata.as_ref(), &h.pipeline.bus(), request).unwrap();

    let annotator = h.annotator();
    assert!(matches!(annotator.poll_once().unwrap()[..], [Disposition::Retry(_)]));
    assert!(h.job_dir(&j1).exists());
    let mut last = Vec::new();
    for _ in 0..2 {
        last = annotator.poll_once().unwrap();
    }
    assert!(matches!(last[..], [Disposition::DeadLettered(_)]));
    assert!(!h.job_dir(&j1).exists());
    assert_eq!(annotator.stats().retried, 2);

    let dead = drain(h.dead_letters(topics::JOB_REQUESTS).as_ref());
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].topic(), topics::JOB_REQUESTS);

    // The job is left visibly stuck.
    assert_eq!(h.job(&j1).status, JobStatus::Pending);
    let stuck = find_stuck_jobs(h.metadata.as_ref(), Duration::ZERO, Utc::now()).unwrap();
    assert_eq!(stuck.len(), 1);
    assert_eq!(stuck[0].job_id, j1);
    assert_eq!(h.task_runs.load(Ordering::SeqCst), 0);
}
