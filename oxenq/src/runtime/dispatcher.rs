use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::config::ProcessorConfig;
use crate::poller::AdaptivePoller;
use crate::runtime::supervisor::{supervise, JobHooks, SlotGuard, WorkHandler};
use crate::store::JobStore;

/// Token for signalling graceful shutdown to the dispatcher and recoverer.
#[derive(Clone, Debug)]
pub struct ShutdownToken {
    inner: Arc<ShutdownInner>,
}

#[derive(Debug)]
struct ShutdownInner {
    cancelled: AtomicBool,
    notify: Notify,
}

impl ShutdownToken {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ShutdownInner {
                cancelled: AtomicBool::new(false),
                notify: Notify::new(),
            }),
        }
    }

    /// Signal cancellation. All clones observe it immediately.
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Wait until cancelled.
    pub async fn cancelled(&self) {
        if self.is_cancelled() {
            return;
        }
        let notified = self.inner.notify.notified();
        tokio::pin!(notified);
        // Register before the re-check, so a cancel landing in between
        // cannot be missed.
        notified.as_mut().enable();
        if self.is_cancelled() {
            return;
        }
        notified.await;
    }
}

impl Default for ShutdownToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time view of a processor, from `Queue::debug`.
#[derive(Clone, Debug, Default)]
pub struct DebugSnapshot {
    pub inflight: usize,
    pub fetching: bool,
    pub current_batch_ids: Vec<u64>,
}

/// State shared between the dispatcher task and its supervisors.
///
/// `inflight` and `fetching` are only written from the dispatcher task and
/// the supervisors' slot release; no locking beyond the batch map is needed.
#[derive(Debug, Default)]
pub(crate) struct DispatchShared {
    inflight: AtomicUsize,
    fetching: AtomicBool,
    batches: Mutex<HashMap<u64, usize>>,
    slot_freed: Notify,
}

impl DispatchShared {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn inflight(&self) -> usize {
        self.inflight.load(Ordering::SeqCst)
    }

    fn set_fetching(&self, fetching: bool) {
        self.fetching.store(fetching, Ordering::SeqCst);
    }

    fn note_claimed(&self, batch_id: u64, jobs: usize) {
        if jobs == 0 {
            return;
        }
        self.inflight.fetch_add(jobs, Ordering::SeqCst);
        let mut batches = self.batches.lock().expect("batch map poisoned");
        *batches.entry(batch_id).or_insert(0) += jobs;
    }

    /// Called by a supervisor (via its drop guard) when a job finishes.
    pub(crate) fn release_slot(&self, batch_id: u64) {
        {
            let mut batches = self.batches.lock().expect("batch map poisoned");
            if let Some(count) = batches.get_mut(&batch_id) {
                *count -= 1;
                if *count == 0 {
                    batches.remove(&batch_id);
                }
            }
        }
        self.inflight.fetch_sub(1, Ordering::SeqCst);
        self.slot_freed.notify_one();
    }

    async fn slot_event(&self) {
        self.slot_freed.notified().await;
    }

    pub(crate) fn snapshot(&self) -> DebugSnapshot {
        let mut ids: Vec<u64> = {
            let batches = self.batches.lock().expect("batch map poisoned");
            batches.keys().copied().collect()
        };
        ids.sort_unstable();
        DebugSnapshot {
            inflight: self.inflight(),
            fetching: self.fetching.load(Ordering::SeqCst),
            current_batch_ids: ids,
        }
    }
}

/// The per-queue claim loop: converts free concurrency into store claims
/// and supervisors, paced by the adaptive poller.
pub(crate) struct Dispatcher {
    store: Arc<dyn JobStore>,
    job_type: String,
    handler: Arc<dyn WorkHandler>,
    hooks: Arc<dyn JobHooks>,
    config: ProcessorConfig,
    poller: AdaptivePoller,
    shared: Arc<DispatchShared>,
    shutdown: ShutdownToken,
}

impl Dispatcher {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        store: Arc<dyn JobStore>,
        job_type: String,
        handler: Arc<dyn WorkHandler>,
        hooks: Arc<dyn JobHooks>,
        config: ProcessorConfig,
        poller: AdaptivePoller,
        shared: Arc<DispatchShared>,
        shutdown: ShutdownToken,
    ) -> Self {
        Self {
            store,
            job_type,
            handler,
            hooks,
            config,
            poller,
            shared,
            shutdown,
        }
    }

    pub(crate) async fn run(mut self) {
        'poll: loop {
            // Wait until a slot is free. Slots only open up from here or
            // from supervisors finishing, so re-check after every wakeup.
            while self.shared.inflight() >= self.config.concurrency {
                if self.shutdown.is_cancelled() {
                    break 'poll;
                }
                tokio::select! {
                    _ = self.shared.slot_event() => {}
                    _ = self.shutdown.cancelled() => {}
                }
            }

            tokio::select! {
                _ = self.poller.schedule_next() => {}
                _ = self.shutdown.cancelled() => break 'poll,
            }

            // Request no more than the free slots; supervisors may have
            // finished during the sleep, never started.
            let free = self
                .config
                .concurrency
                .saturating_sub(self.shared.inflight());
            if free == 0 {
                continue;
            }

            // At most one batch request outstanding, ever.
            self.shared.set_fetching(true);
            let found = match self.store.claim(&self.job_type, free).await {
                Ok(batch) => {
                    let found = batch.len();
                    self.shared.note_claimed(batch.batch_id.0, found);
                    for job in batch.jobs {
                        let guard = SlotGuard::new(Arc::clone(&self.shared), job.batch_id);
                        let store = Arc::clone(&self.store);
                        let handler = Arc::clone(&self.handler);
                        let hooks = Arc::clone(&self.hooks);
                        let timeout = self.config.timeout();
                        tokio::spawn(async move {
                            supervise(store, handler, hooks, job, timeout, guard).await;
                        });
                    }
                    found
                }
                Err(err) => {
                    // Treated as an empty poll: dispatch pauses and backs
                    // off, enqueued work is not lost.
                    warn!(job_type = %self.job_type, "claim failed: {err}");
                    0
                }
            };
            self.shared.set_fetching(false);
            self.poller.record_outcome(found);
        }

        self.drain().await;
    }

    /// Graceful drain: no new claims, in-flight supervisors run to their
    /// own completion or timeout.
    async fn drain(&self) {
        let inflight = self.shared.inflight();
        if inflight > 0 {
            info!(job_type = %self.job_type, inflight, "draining in-flight jobs");
        }
        loop {
            if self.shared.inflight() == 0 {
                break;
            }
            self.shared.slot_event().await;
        }
        debug!(job_type = %self.job_type, "dispatcher stopped");
    }
}
