use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::{ProcessorConfig, QueueConfig};
use crate::error::QueueError;
use crate::job::NewJob;
use crate::poller::AdaptivePoller;
use crate::runtime::dispatcher::{DebugSnapshot, DispatchShared, Dispatcher, ShutdownToken};
use crate::runtime::recoverer::Recoverer;
use crate::runtime::supervisor::{JobHooks, NoopHooks, WorkHandler};
use crate::store::{EnqueueOutcome, EnqueueSummary, JobStore};

struct ActiveProcessor {
    shutdown: ShutdownToken,
    shared: Arc<DispatchShared>,
    dispatcher: JoinHandle<()>,
    recoverer: Option<JoinHandle<()>>,
}

/// Composition root for one queue.
///
/// A `Queue` is bound to exactly one `job_type`; applications own one
/// instance per queue they produce to or process. The engine keeps no
/// process-global state: everything hangs off the store the instance holds,
/// and cross-process coordination happens entirely through the table.
pub struct Queue {
    store: Arc<dyn JobStore>,
    job_type: String,
    config: QueueConfig,
    active: Mutex<Option<ActiveProcessor>>,
}

impl Queue {
    /// Bind a queue to a store and a job type. Fails fast on an invalid
    /// queue configuration.
    pub fn new(
        store: Arc<dyn JobStore>,
        job_type: impl Into<String>,
        config: QueueConfig,
    ) -> Result<Self, QueueError> {
        config.validate()?;
        Ok(Self {
            store,
            job_type: job_type.into(),
            config,
            active: Mutex::new(None),
        })
    }

    /// Convenience constructor: open a MySQL store and bind to it.
    #[cfg(feature = "mysql")]
    pub async fn connect(
        mysql: &crate::config::MySqlConfig,
        job_type: impl Into<String>,
        config: QueueConfig,
    ) -> Result<Self, QueueError> {
        let store = crate::persistence::MySqlJobStore::connect(mysql, &config).await?;
        Self::new(Arc::new(store), job_type, config)
    }

    pub fn job_type(&self) -> &str {
        &self.job_type
    }

    pub fn store(&self) -> Arc<dyn JobStore> {
        Arc::clone(&self.store)
    }

    /// Persist one `waiting` job. A unique-key conflict reports
    /// [`EnqueueOutcome::Deduplicated`], not an error.
    pub async fn enqueue(&self, job: NewJob) -> Result<EnqueueOutcome, QueueError> {
        self.store.enqueue(&self.job_type, job).await
    }

    /// Persist a batch; conflicting unique keys are dropped and counted.
    pub async fn enqueue_many(&self, jobs: Vec<NewJob>) -> Result<EnqueueSummary, QueueError> {
        self.store.enqueue_many(&self.job_type, jobs).await
    }

    /// Start the dispatcher loop (and the stuck-job recoverer unless
    /// disabled) with no-op callbacks.
    pub async fn start_processing(
        &self,
        handler: Arc<dyn WorkHandler>,
        config: ProcessorConfig,
    ) -> Result<(), QueueError> {
        self.start_processing_with_hooks(handler, Arc::new(NoopHooks), config)
            .await
    }

    /// Start processing with success/error callbacks.
    pub async fn start_processing_with_hooks(
        &self,
        handler: Arc<dyn WorkHandler>,
        hooks: Arc<dyn JobHooks>,
        config: ProcessorConfig,
    ) -> Result<(), QueueError> {
        config.validate()?;
        if let Some(capacity) = self.store.pool_capacity() {
            let needed = config.concurrency + 2;
            if (capacity as usize) < needed {
                return Err(QueueError::Config(format!(
                    "connection pool holds {capacity} connections but concurrency {} needs \
                     at least {needed}; claims would starve behind finalizations",
                    config.concurrency
                )));
            }
        }

        let mut active = self.active.lock().await;
        if active.is_some() {
            return Err(QueueError::AlreadyRunning(self.job_type.clone()));
        }

        let shutdown = ShutdownToken::new();
        let shared = Arc::new(DispatchShared::new());

        let dispatcher = Dispatcher::new(
            Arc::clone(&self.store),
            self.job_type.clone(),
            handler,
            hooks,
            config.clone(),
            AdaptivePoller::new(&self.config),
            Arc::clone(&shared),
            shutdown.clone(),
        );
        let dispatcher_handle = tokio::spawn(dispatcher.run());

        let recoverer_handle = if config.recover_stuck_jobs {
            let recoverer = Recoverer {
                store: Arc::clone(&self.store),
                job_type: self.job_type.clone(),
                interval: config.recovery_interval(),
                threshold: config.recovery_threshold(),
                shutdown: shutdown.clone(),
            };
            Some(tokio::spawn(recoverer.run()))
        } else {
            None
        };

        info!(
            job_type = %self.job_type,
            concurrency = config.concurrency,
            recover_stuck_jobs = config.recover_stuck_jobs,
            "processing started"
        );

        *active = Some(ActiveProcessor {
            shutdown,
            shared,
            dispatcher: dispatcher_handle,
            recoverer: recoverer_handle,
        });
        Ok(())
    }

    /// Stop claiming and drain: in-flight jobs run to completion (or their
    /// timeout) and are finalized before this returns. No-op when idle.
    pub async fn stop_processing(&self) -> Result<(), QueueError> {
        let Some(active) = self.active.lock().await.take() else {
            return Ok(());
        };

        active.shutdown.cancel();
        if let Some(handle) = active.recoverer {
            if let Err(err) = handle.await {
                warn!(job_type = %self.job_type, "recoverer task failed: {err}");
            }
        }
        if let Err(err) = active.dispatcher.await {
            warn!(job_type = %self.job_type, "dispatcher task failed: {err}");
        }

        info!(job_type = %self.job_type, "processing stopped");
        Ok(())
    }

    /// Stop processing and release the store's resources.
    pub async fn shutdown(&self) -> Result<(), QueueError> {
        self.stop_processing().await?;
        self.store.close().await;
        Ok(())
    }

    /// Snapshot of the running processor; zeroed when idle.
    pub async fn debug(&self) -> DebugSnapshot {
        match self.active.lock().await.as_ref() {
            Some(active) => active.shared.snapshot(),
            None => DebugSnapshot::default(),
        }
    }
}
