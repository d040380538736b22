use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use serde_json::Value;
use tracing::{debug, error, warn};

use crate::job::{retry_delay, JobFailure};
use crate::runtime::dispatcher::DispatchShared;
use crate::store::{ClaimedJob, JobStore};

/// User-supplied work function.
///
/// The returned value is encoded into the `result` column on success. A
/// return value carrying the retry sentinel requeues the job instead; an
/// `Err` marks the row `error` with the captured chain as the description.
#[async_trait]
pub trait WorkHandler: Send + Sync {
    async fn run(&self, job: &ClaimedJob) -> anyhow::Result<Value>;
}

/// Optional success/error callbacks. Retried jobs fire neither.
///
/// Hook failures never propagate into the engine: a panicking callback is
/// logged and swallowed.
#[async_trait]
pub trait JobHooks: Send + Sync {
    async fn on_job_success(&self, _job: &ClaimedJob, _result: &Value) {}
    async fn on_job_error(&self, _job: &ClaimedJob, _failure: &JobFailure) {}
}

/// Hooks that do nothing; the default for `start_processing`.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopHooks;

#[async_trait]
impl JobHooks for NoopHooks {}

/// Releases the supervisor's concurrency slot on drop, so a panicking work
/// function or hook still frees capacity.
pub(crate) struct SlotGuard {
    shared: Arc<DispatchShared>,
    batch_id: u64,
}

impl SlotGuard {
    pub(crate) fn new(shared: Arc<DispatchShared>, batch_id: u64) -> Self {
        Self { shared, batch_id }
    }
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.shared.release_slot(self.batch_id);
    }
}

const STORE_RETRY_ATTEMPTS: u32 = 3;
const STORE_RETRY_DELAY: Duration = Duration::from_millis(200);

#[derive(Clone, Copy)]
enum StoreOp<'a> {
    Success(&'a Value),
    Failure(&'a JobFailure),
    Requeue(Duration),
}

impl StoreOp<'_> {
    fn name(&self) -> &'static str {
        match self {
            StoreOp::Success(_) => "finalize_success",
            StoreOp::Failure(_) => "finalize_error",
            StoreOp::Requeue(_) => "requeue",
        }
    }
}

/// Run one claimed job to completion.
///
/// The timeout and the work function race to a single winner: whichever
/// finishes first decides the row's outcome, and the loser is dropped. A
/// work function that out-lives its timeout is cancelled at its next await
/// point; its result and callbacks are discarded either way.
pub(crate) async fn supervise(
    store: Arc<dyn JobStore>,
    handler: Arc<dyn WorkHandler>,
    hooks: Arc<dyn JobHooks>,
    job: ClaimedJob,
    timeout: Duration,
    _slot: SlotGuard,
) {
    match tokio::time::timeout(timeout, handler.run(&job)).await {
        Ok(Ok(value)) => {
            if let Some(delay) = retry_delay(&value) {
                debug!(id = job.id, delay_secs = delay.as_secs_f64(), "job requested retry");
                apply_outcome(&store, job.id, StoreOp::Requeue(delay)).await;
            } else if apply_outcome(&store, job.id, StoreOp::Success(&value)).await {
                fire_success_hook(&hooks, &job, &value).await;
            }
        }
        Ok(Err(err)) => {
            let failure = JobFailure::from_error(&err);
            debug!(id = job.id, "job failed: {}", failure.message);
            if apply_outcome(&store, job.id, StoreOp::Failure(&failure)).await {
                fire_error_hook(&hooks, &job, &failure).await;
            }
        }
        Err(_elapsed) => {
            let failure = JobFailure::timed_out(timeout);
            warn!(id = job.id, timeout_secs = timeout.as_secs(), "job timed out");
            if apply_outcome(&store, job.id, StoreOp::Failure(&failure)).await {
                fire_error_hook(&hooks, &job, &failure).await;
            }
        }
    }
}

/// Apply a finalization with a bounded retry. On exhaustion the row is left
/// `processing` for the stuck-job sweep to recover.
async fn apply_outcome(store: &Arc<dyn JobStore>, id: u64, op: StoreOp<'_>) -> bool {
    for attempt in 1..=STORE_RETRY_ATTEMPTS {
        let result = match op {
            StoreOp::Success(value) => store.finalize_success(id, value).await,
            StoreOp::Failure(failure) => store.finalize_error(id, failure).await,
            StoreOp::Requeue(delay) => store.requeue(id, delay).await,
        };
        match result {
            Ok(()) => return true,
            Err(err) if attempt < STORE_RETRY_ATTEMPTS => {
                warn!(id, attempt, "{} failed, retrying: {err}", op.name());
                tokio::time::sleep(STORE_RETRY_DELAY).await;
            }
            Err(err) => {
                error!(id, "{} failed; leaving row for recovery: {err}", op.name());
            }
        }
    }
    false
}

async fn fire_success_hook(hooks: &Arc<dyn JobHooks>, job: &ClaimedJob, value: &Value) {
    if let Err(panic) = std::panic::AssertUnwindSafe(hooks.on_job_success(job, value))
        .catch_unwind()
        .await
    {
        warn!(
            id = job.id,
            "on_job_success callback panicked: {}",
            panic_message(&panic)
        );
    }
}

async fn fire_error_hook(hooks: &Arc<dyn JobHooks>, job: &ClaimedJob, failure: &JobFailure) {
    if let Err(panic) = std::panic::AssertUnwindSafe(hooks.on_job_error(job, failure))
        .catch_unwind()
        .await
    {
        warn!(
            id = job.id,
            "on_job_error callback panicked: {}",
            panic_message(&panic)
        );
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
