//! In-memory metadata store for tests/dev.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, RwLock};

use annoflow_core::{ConditionalUpdate, Job, JobId, JobStatus, UserId};

use super::{MetadataStore, StoreError};

#[derive(Debug, Default)]
struct Tables {
    jobs: HashMap<JobId, Job>,
    by_user: HashMap<UserId, BTreeSet<JobId>>,
}

/// In-memory job table with a user-id index.
///
/// Conditional updates run under the write lock, so concurrent callers see
/// them as atomic.
#[derive(Debug, Default)]
pub struct InMemoryMetadataStore {
    tables: RwLock<Tables>,
}

impl InMemoryMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn poisoned() -> StoreError {
        StoreError::Storage("metadata store lock poisoned".to_string())
    }
}

impl MetadataStore for InMemoryMetadataStore {
    fn create(&self, job: &Job) -> Result<(), StoreError> {
        job.check_invariants()
            .map_err(|e| StoreError::from_domain(&job.job_id, e))?;

        let mut t = self.tables.write().map_err(|_| Self::poisoned())?;
        if t.jobs.contains_key(&job.job_id) {
            return Err(StoreError::AlreadyExists(job.job_id.clone()));
        }
        t.by_user
            .entry(job.user_id.clone())
            .or_default()
            .insert(job.job_id.clone());
        t.jobs.insert(job.job_id.clone(), job.clone());
        Ok(())
    }

    fn get(&self, job_id: &JobId) -> Result<Option<Job>, StoreError> {
        let t = self.tables.read().map_err(|_| Self::poisoned())?;
        Ok(t.jobs.get(job_id).cloned())
    }

    fn jobs_for_user(&self, user_id: &UserId) -> Result<Vec<Job>, StoreError> {
        let t = self.tables.read().map_err(|_| Self::poisoned())?;
        Ok(t.by_user
            .get(user_id)
            .map(|ids| ids.iter().filter_map(|id| t.jobs.get(id).cloned()).collect())
            .unwrap_or_default())
    }

    fn conditional_update(&self, job_id: &JobId, update: &ConditionalUpdate) -> Result<Job, StoreError> {
        let mut t = self.tables.write().map_err(|_| Self::poisoned())?;
        let job = t
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| StoreError::NotFound(job_id.clone()))?;
        update
            .apply(job)
            .map_err(|e| StoreError::from_domain(job_id, e))?;
        Ok(job.clone())
    }

    fn list_by_status(&self, status: JobStatus, limit: usize) -> Result<Vec<Job>, StoreError> {
        let t = self.tables.read().map_err(|_| Self::poisoned())?;
        let mut jobs: Vec<Job> = t.jobs.values().filter(|j| j.status == status).cloned().collect();
        jobs.sort_by(|a, b| {
            a.submit_time
                .cmp(&b.submit_time)
                .then_with(|| a.job_id.cmp(&b.job_id))
        });
        jobs.truncate(limit);
        Ok(jobs)
    }
}
