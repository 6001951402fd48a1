//! Backend assembly: one place that turns a [`PipelineConfig`] into the
//! shared clients every component is built from.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::Handle;
use tracing::info;

use annoflow_events::{DelayedScheduler, InMemoryDelayScheduler, NotificationBus, QueueError};

use crate::accounts::{InMemoryProfileStore, PostgresProfileStore, ProfileError, ProfileStore};
use crate::config::PipelineConfig;
use crate::metadata::{InMemoryMetadataStore, MetadataStore, PostgresMetadataStore, StoreError};
use crate::storage::{ColdArchive, HotStore, ObjectStoreHotTier, StoreUrlError, VaultArchive, open_object_store};
use crate::task::{CommandTask, ProcessingTask};
use crate::topology::Topology;
use crate::workers::{
    AnnotationWorker, Archiver, DelayPump, MessageHandler, PumpStats, QueueWorker, Restorer, ThawInitiator,
    WorkerHandle,
};

/// Longest a worker blocks before noticing a shutdown request.
const SHUTDOWN_CHECK: Duration = Duration::from_secs(1);

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("metadata store: {0}")]
    Metadata(#[from] StoreError),

    #[error("profile store: {0}")]
    Profiles(#[from] ProfileError),

    #[error(transparent)]
    ObjectStore(#[from] StoreUrlError),

    #[error("queue setup: {0}")]
    Queue(#[from] QueueError),

    #[error("redis: {0}")]
    Redis(String),

    #[error("unknown component {0:?}")]
    UnknownComponent(String),

    #[error("no queue for topic {0}")]
    MissingQueue(String),

    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[from] std::io::Error),
}

/// A runnable pipeline component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Component {
    Annotator,
    Archiver,
    Thaw,
    Restorer,
    DelayPump,
}

impl Component {
    pub const ALL: [Component; 5] = [
        Component::Annotator,
        Component::Archiver,
        Component::Thaw,
        Component::Restorer,
        Component::DelayPump,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Component::Annotator => "annotator",
            Component::Archiver => "archiver",
            Component::Thaw => "thaw",
            Component::Restorer => "restorer",
            Component::DelayPump => "delay-pump",
        }
    }
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Component {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Component::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| PipelineError::UnknownComponent(s.to_string()))
    }
}

/// A spawned component.
#[derive(Debug)]
pub enum RunningComponent {
    Queue(WorkerHandle),
    Pump(WorkerHandle<PumpStats>),
}

impl RunningComponent {
    pub fn name(&self) -> &str {
        match self {
            RunningComponent::Queue(h) => h.name(),
            RunningComponent::Pump(h) => h.name(),
        }
    }

    /// Stop the component and log its final counters.
    pub fn shutdown(self) {
        match self {
            RunningComponent::Queue(h) => {
                let name = h.name().to_string();
                let stats = h.shutdown();
                info!(
                    worker = %name,
                    received = stats.received,
                    done = stats.done,
                    skipped = stats.skipped,
                    retried = stats.retried,
                    dead_lettered = stats.dead_lettered,
                    "worker stopped"
                );
            }
            RunningComponent::Pump(h) => {
                let name = h.name().to_string();
                let stats = h.shutdown();
                info!(
                    worker = %name,
                    published = stats.published,
                    rescheduled = stats.rescheduled,
                    dropped = stats.dropped,
                    "worker stopped"
                );
            }
        }
    }
}

/// Shared clients for every component.
pub struct Pipeline {
    pub config: PipelineConfig,
    pub metadata: Arc<dyn MetadataStore>,
    pub profiles: Arc<dyn ProfileStore>,
    pub hot: Arc<dyn HotStore>,
    pub cold: Arc<dyn ColdArchive>,
    pub scheduler: Arc<dyn DelayedScheduler>,
    pub topology: Topology,
    pub task: Arc<dyn ProcessingTask>,
}

impl Pipeline {
    /// Connect every backend named by `config`.
    ///
    /// Must be called outside the runtime behind `handle`; the returned clients
    /// block on it.
    pub fn connect(config: PipelineConfig, handle: Handle) -> Result<Self, PipelineError> {
        let (metadata, profiles): (Arc<dyn MetadataStore>, Arc<dyn ProfileStore>) = match &config.database_url {
            Some(url) => {
                let store = PostgresMetadataStore::connect(url, handle.clone())?;
                let profiles = PostgresProfileStore::new(store.pool().clone(), handle.clone());
                if config.auto_migrate {
                    store.ensure_schema()?;
                    profiles.ensure_schema()?;
                } else {
                    store.verify_schema()?;
                }
                info!(backend = "postgres", "metadata store connected");
                (Arc::new(store), Arc::new(profiles))
            }
            None => {
                info!(backend = "memory", "metadata store ready");
                (InMemoryMetadataStore::arc(), InMemoryProfileStore::arc())
            }
        };

        let (topology, scheduler) = Self::messaging(&config)?;

        let hot_objects = open_object_store(&config.hot_store_url)?;
        let cold_objects = open_object_store(&config.cold_store_url)?;
        let hot: Arc<dyn HotStore> = Arc::new(ObjectStoreHotTier::new(hot_objects, handle.clone()));
        let cold: Arc<dyn ColdArchive> = Arc::new(VaultArchive::new(
            cold_objects,
            handle,
            scheduler.clone(),
            config.vault_config(),
        ));

        let task: Arc<dyn ProcessingTask> = Arc::new(
            CommandTask::new(config.task_program.clone(), config.task_args.clone())
                .with_naming(config.output_naming()),
        );

        Ok(Self {
            config,
            metadata,
            profiles,
            hot,
            cold,
            scheduler,
            topology,
            task,
        })
    }

    #[cfg(feature = "redis")]
    fn messaging(config: &PipelineConfig) -> Result<(Topology, Arc<dyn DelayedScheduler>), PipelineError> {
        use annoflow_events::MessageQueue;

        use crate::messaging::{RedisDelayScheduler, RedisStreamsQueue};

        let Some(url) = &config.redis_url else {
            return Ok(Self::in_memory_messaging(config));
        };
        let client = Arc::new(redis::Client::open(url.as_str()).map_err(|e| PipelineError::Redis(e.to_string()))?);
        let visibility = config.visibility_timeout;
        let topology = Topology::build(|name| {
            let queue: Arc<dyn MessageQueue> = Arc::new(RedisStreamsQueue::open(client.clone(), name, visibility)?);
            Ok::<_, QueueError>(queue)
        })?;
        info!(backend = "redis", "queues ready");
        Ok((topology, Arc::new(RedisDelayScheduler::new(client))))
    }

    #[cfg(not(feature = "redis"))]
    fn messaging(config: &PipelineConfig) -> Result<(Topology, Arc<dyn DelayedScheduler>), PipelineError> {
        if config.redis_url.is_some() {
            return Err(PipelineError::Redis(
                "a redis URL is configured but redis support is not compiled in".to_string(),
            ));
        }
        Ok(Self::in_memory_messaging(config))
    }

    fn in_memory_messaging(config: &PipelineConfig) -> (Topology, Arc<dyn DelayedScheduler>) {
        info!(backend = "memory", "queues ready");
        (
            Topology::in_memory(config.visibility_timeout),
            Arc::new(InMemoryDelayScheduler::new()),
        )
    }

    pub fn bus(&self) -> Arc<dyn NotificationBus> {
        self.topology.bus()
    }

    pub fn annotator(&self) -> AnnotationWorker {
        AnnotationWorker::new(
            self.metadata.clone(),
            self.hot.clone(),
            self.task.clone(),
            self.bus(),
            self.scheduler.clone(),
            self.config.annotator_config(),
        )
    }

    pub fn archiver(&self) -> Archiver {
        Archiver::new(
            self.profiles.clone(),
            self.metadata.clone(),
            self.hot.clone(),
            self.cold.clone(),
        )
    }

    pub fn thaw(&self) -> ThawInitiator {
        ThawInitiator::new(self.metadata.clone(), self.cold.clone())
    }

    pub fn restorer(&self) -> Restorer {
        Restorer::new(self.metadata.clone(), self.hot.clone(), self.cold.clone())
    }

    pub fn delay_pump(&self) -> DelayPump {
        DelayPump::new(self.scheduler.clone(), self.bus())
    }

    /// Wrap `handler` in a queue worker on its topic's queue.
    pub fn queue_worker<H: MessageHandler + 'static>(&self, handler: H) -> Result<QueueWorker<H>, PipelineError> {
        let topic = handler.topic();
        let queue = self
            .topology
            .queue(topic)
            .ok_or_else(|| PipelineError::MissingQueue(topic.to_string()))?;
        let dlq = self
            .topology
            .dead_letters(topic)
            .ok_or_else(|| PipelineError::MissingQueue(topic.to_string()))?;
        Ok(QueueWorker::new(queue, handler, self.config.runner_config()).with_dead_letters(dlq))
    }

    pub fn spawn(&self, component: Component) -> Result<RunningComponent, PipelineError> {
        let running = match component {
            Component::Annotator => {
                RunningComponent::Queue(self.queue_worker(self.annotator())?.spawn(SHUTDOWN_CHECK)?)
            }
            Component::Archiver => RunningComponent::Queue(self.queue_worker(self.archiver())?.spawn(SHUTDOWN_CHECK)?),
            Component::Thaw => RunningComponent::Queue(self.queue_worker(self.thaw())?.spawn(SHUTDOWN_CHECK)?),
            Component::Restorer => RunningComponent::Queue(self.queue_worker(self.restorer())?.spawn(SHUTDOWN_CHECK)?),
            Component::DelayPump => RunningComponent::Pump(self.delay_pump().spawn()?),
        };
        info!(component = %component, worker = running.name(), "component started");
        Ok(running)
    }
}
