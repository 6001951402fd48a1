//! Cold tier: write-once archives with asynchronous, tiered retrieval.
//!
//! Retrieving an archive is a two-step affair. `initiate_retrieval` starts a
//! retrieval job and returns immediately; when the job finishes, a
//! `RetrievalCompleted` notification is delivered on the retrieval-completion
//! topic, after which `retrieval_output` returns the archive's bytes.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use object_store::ObjectStore;
use object_store::path::Path;
use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;

use annoflow_core::{ArchiveId, RetrievalId};
use annoflow_events::{DelayedScheduler, Notification, RetrievalCompleted, RetrievalStatus};

/// Retrieval speed class.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RetrievalTier {
    /// Minutes; subject to provisioned capacity.
    Expedited,
    /// Hours; always accepted.
    Standard,
}

impl RetrievalTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            RetrievalTier::Expedited => "Expedited",
            RetrievalTier::Standard => "Standard",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ColdError {
    /// No capacity for another expedited retrieval right now.
    #[error("insufficient capacity for {0:?} retrieval")]
    InsufficientCapacity(RetrievalTier),

    #[error("archive not found: {0}")]
    ArchiveNotFound(ArchiveId),

    #[error("retrieval {0} has not completed yet")]
    RetrievalNotReady(RetrievalId),

    #[error("retrieval not found: {0}")]
    RetrievalNotFound(RetrievalId),

    #[error("cold storage error: {0}")]
    Storage(String),
}

pub trait ColdArchive: Send + Sync {
    /// Store a new archive; returns its handle.
    fn upload_archive(&self, data: Bytes) -> Result<ArchiveId, ColdError>;

    /// Delete an archive. Deleting a missing archive succeeds.
    fn delete_archive(&self, archive_id: &ArchiveId) -> Result<(), ColdError>;

    /// Start an asynchronous retrieval; `description` is echoed in the
    /// completion notification.
    fn initiate_retrieval(
        &self,
        archive_id: &ArchiveId,
        tier: RetrievalTier,
        description: &str,
    ) -> Result<RetrievalId, ColdError>;

    /// Bytes of a completed retrieval.
    fn retrieval_output(&self, retrieval_id: &RetrievalId) -> Result<Bytes, ColdError>;
}

impl<C> ColdArchive for Arc<C>
where
    C: ColdArchive + ?Sized,
{
    fn upload_archive(&self, data: Bytes) -> Result<ArchiveId, ColdError> {
        (**self).upload_archive(data)
    }

    fn delete_archive(&self, archive_id: &ArchiveId) -> Result<(), ColdError> {
        (**self).delete_archive(archive_id)
    }

    fn initiate_retrieval(
        &self,
        archive_id: &ArchiveId,
        tier: RetrievalTier,
        description: &str,
    ) -> Result<RetrievalId, ColdError> {
        (**self).initiate_retrieval(archive_id, tier, description)
    }

    fn retrieval_output(&self, retrieval_id: &RetrievalId) -> Result<Bytes, ColdError> {
        (**self).retrieval_output(retrieval_id)
    }
}

/// Vault timing and capacity.
#[derive(Debug, Clone)]
pub struct VaultConfig {
    pub expedited_latency: Duration,
    pub standard_latency: Duration,
    /// Maximum expedited retrievals in flight; `None` is unlimited.
    pub expedited_capacity: Option<usize>,
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            expedited_latency: Duration::from_secs(5 * 60),
            standard_latency: Duration::from_secs(4 * 60 * 60),
            expedited_capacity: None,
        }
    }
}

impl VaultConfig {
    fn latency(&self, tier: RetrievalTier) -> Duration {
        match tier {
            RetrievalTier::Expedited => self.expedited_latency,
            RetrievalTier::Standard => self.standard_latency,
        }
    }
}

/// Persisted state of one retrieval job (`retrievals/<id>.json`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetrievalRecord {
    pub retrieval_id: RetrievalId,
    pub archive_id: ArchiveId,
    pub tier: RetrievalTier,
    pub description: String,
    pub requested_at: DateTime<Utc>,
    pub ready_at: DateTime<Utc>,
}

/// Archive vault on an `object_store` backend.
///
/// - archives live under `archives/<archive_id>`
/// - retrieval jobs under `retrievals/<retrieval_id>.json`
/// - completion notifications go through the delayed scheduler, due when the
///   tier's latency has elapsed
///
/// Expedited capacity is tracked per vault instance.
pub struct VaultArchive {
    store: Arc<dyn ObjectStore>,
    handle: Handle,
    scheduler: Arc<dyn DelayedScheduler>,
    config: VaultConfig,
    expedited_in_flight: Mutex<Vec<DateTime<Utc>>>,
}

impl std::fmt::Debug for VaultArchive {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VaultArchive")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl VaultArchive {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        handle: Handle,
        scheduler: Arc<dyn DelayedScheduler>,
        config: VaultConfig,
    ) -> Self {
        Self {
            store,
            handle,
            scheduler,
            config,
            expedited_in_flight: Mutex::new(Vec::new()),
        }
    }

    fn archive_path(archive_id: &ArchiveId) -> Path {
        Path::from(format!("archives/{archive_id}"))
    }

    fn retrieval_path(retrieval_id: &RetrievalId) -> Path {
        Path::from(format!("retrievals/{retrieval_id}.json"))
    }

    /// Ids of every stored archive.
    pub fn archive_ids(&self) -> Result<Vec<ArchiveId>, ColdError> {
        let prefix = Path::from("archives");
        let listing = self
            .handle
            .block_on(self.store.list_with_delimiter(Some(&prefix)))
            .map_err(storage)?;
        listing
            .objects
            .iter()
            .filter_map(|meta| meta.location.filename().map(str::to_string))
            .map(|name| ArchiveId::parse(name).map_err(|e| ColdError::Storage(e.to_string())))
            .collect()
    }

    /// Every retrieval job ever initiated.
    pub fn retrievals(&self) -> Result<Vec<RetrievalRecord>, ColdError> {
        let prefix = Path::from("retrievals");
        self.handle.block_on(async {
            let listing = self.store.list_with_delimiter(Some(&prefix)).await.map_err(storage)?;
            let mut out = Vec::with_capacity(listing.objects.len());
            for meta in listing.objects {
                let raw = self
                    .store
                    .get(&meta.location)
                    .await
                    .map_err(storage)?
                    .bytes()
                    .await
                    .map_err(storage)?;
                out.push(decode_record(&raw)?);
            }
            out.sort_by_key(|r| r.requested_at);
            Ok(out)
        })
    }

    /// Reserve an expedited slot until `ready_at`.
    fn reserve_expedited(&self, now: DateTime<Utc>, ready_at: DateTime<Utc>) -> Result<(), ColdError> {
        let mut in_flight = self
            .expedited_in_flight
            .lock()
            .map_err(|_| ColdError::Storage("capacity lock poisoned".to_string()))?;
        in_flight.retain(|done_at| *done_at > now);
        if let Some(cap) = self.config.expedited_capacity {
            if in_flight.len() >= cap {
                return Err(ColdError::InsufficientCapacity(RetrievalTier::Expedited));
            }
        }
        in_flight.push(ready_at);
        Ok(())
    }

    /// Give back a slot taken by [`Self::reserve_expedited`].
    fn release_expedited(&self, ready_at: DateTime<Utc>) {
        if let Ok(mut in_flight) = self.expedited_in_flight.lock() {
            if let Some(pos) = in_flight.iter().position(|done_at| *done_at == ready_at) {
                in_flight.swap_remove(pos);
            }
        }
    }

    /// Persist the retrieval record and schedule its completion.
    fn record_retrieval(&self, record: &RetrievalRecord) -> Result<(), ColdError> {
        let body = serde_json::to_vec(record).map_err(|e| ColdError::Storage(e.to_string()))?;
        self.handle
            .block_on(
                self.store
                    .put(&Self::retrieval_path(&record.retrieval_id), Bytes::from(body).into()),
            )
            .map_err(storage)?;

        let completion = Notification::for_event(&RetrievalCompleted {
            retrieval_job_id: record.retrieval_id.clone(),
            description: record.description.clone(),
            status: RetrievalStatus::Succeeded,
        })
        .map_err(|e| ColdError::Storage(e.to_string()))?;
        self.scheduler
            .schedule(completion, record.ready_at)
            .map_err(|e| ColdError::Storage(format!("failed to schedule completion: {e}")))
    }

    fn load_record(&self, retrieval_id: &RetrievalId) -> Result<RetrievalRecord, ColdError> {
        let path = Self::retrieval_path(retrieval_id);
        let raw = self.handle.block_on(async {
            let result = self.store.get(&path).await?;
            result.bytes().await
        });
        match raw {
            Ok(raw) => decode_record(&raw),
            Err(object_store::Error::NotFound { .. }) => {
                Err(ColdError::RetrievalNotFound(retrieval_id.clone()))
            }
            Err(e) => Err(storage(e)),
        }
    }
}

impl ColdArchive for VaultArchive {
    fn upload_archive(&self, data: Bytes) -> Result<ArchiveId, ColdError> {
        let archive_id = ArchiveId::generate();
        let size = data.len();
        self.handle
            .block_on(self.store.put(&Self::archive_path(&archive_id), data.into()))
            .map_err(storage)?;
        tracing::info!(archive_id = %archive_id, size, "archive stored");
        Ok(archive_id)
    }

    fn delete_archive(&self, archive_id: &ArchiveId) -> Result<(), ColdError> {
        match self
            .handle
            .block_on(self.store.delete(&Self::archive_path(archive_id)))
        {
            Ok(()) | Err(object_store::Error::NotFound { .. }) => {
                tracing::info!(archive_id = %archive_id, "archive deleted");
                Ok(())
            }
            Err(e) => Err(storage(e)),
        }
    }

    fn initiate_retrieval(
        &self,
        archive_id: &ArchiveId,
        tier: RetrievalTier,
        description: &str,
    ) -> Result<RetrievalId, ColdError> {
        match self
            .handle
            .block_on(self.store.head(&Self::archive_path(archive_id)))
        {
            Ok(_) => {}
            Err(object_store::Error::NotFound { .. }) => {
                return Err(ColdError::ArchiveNotFound(archive_id.clone()));
            }
            Err(e) => return Err(storage(e)),
        }

        let now = Utc::now();
        let latency = chrono::Duration::from_std(self.config.latency(tier))
            .map_err(|e| ColdError::Storage(format!("latency out of range: {e}")))?;
        let ready_at = now + latency;
        if tier == RetrievalTier::Expedited {
            self.reserve_expedited(now, ready_at)?;
        }

        let record = RetrievalRecord {
            retrieval_id: RetrievalId::generate(),
            archive_id: archive_id.clone(),
            tier,
            description: description.to_string(),
            requested_at: now,
            ready_at,
        };
        if let Err(e) = self.record_retrieval(&record) {
            if tier == RetrievalTier::Expedited {
                self.release_expedited(ready_at);
            }
            return Err(e);
        }

        tracing::info!(
            archive_id = %archive_id,
            retrieval_id = %record.retrieval_id,
            tier = tier.as_str(),
            ready_at = %ready_at,
            "retrieval initiated"
        );
        Ok(record.retrieval_id)
    }

    fn retrieval_output(&self, retrieval_id: &RetrievalId) -> Result<Bytes, ColdError> {
        let record = self.load_record(retrieval_id)?;
        if Utc::now() < record.ready_at {
            return Err(ColdError::RetrievalNotReady(retrieval_id.clone()));
        }

        let path = Self::archive_path(&record.archive_id);
        let data = self.handle.block_on(async {
            let result = self.store.get(&path).await?;
            result.bytes().await
        });
        match data {
            Ok(data) => Ok(data),
            Err(object_store::Error::NotFound { .. }) => Err(ColdError::ArchiveNotFound(record.archive_id)),
            Err(e) => Err(storage(e)),
        }
    }
}

fn storage(err: object_store::Error) -> ColdError {
    ColdError::Storage(err.to_string())
}

fn decode_record(raw: &[u8]) -> Result<RetrievalRecord, ColdError> {
    serde_json::from_slice(raw).map_err(|e| ColdError::Storage(format!("corrupt retrieval record: {e}")))
}
