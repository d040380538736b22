//! Runtime integration tests over the in-memory store.
//!
//! Covers priority ordering, deduplication, delayed execution, timeouts,
//! retry requeues, graceful drain, claim-failure backoff, stuck-job
//! recovery, and the concurrency cap.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use oxenq::{
    ClaimedJob, JobStatus, JobStore, NewJob, ProcessorConfig, Queue, QueueConfig, WorkHandler,
};
use oxenq_testkit::{
    CountingHooks, FlakyClaimStore, InMemoryJobStore, PanickingHooks, RecordingHandler,
};
use serde_json::{json, Value};

fn fast_config() -> QueueConfig {
    QueueConfig::default().with_polling_rates(10, 200)
}

fn processor(concurrency: usize) -> ProcessorConfig {
    ProcessorConfig::default().with_concurrency(concurrency)
}

async fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while !cond() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {what}"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn lower_priority_values_run_first() {
    let store = InMemoryJobStore::new();
    let queue = Queue::new(Arc::new(store.clone()), "orders", fast_config()).unwrap();
    let handler = Arc::new(RecordingHandler::new());

    queue
        .enqueue(NewJob::new(json!({"name": "a"})).with_priority(2))
        .await
        .unwrap();
    queue
        .enqueue(NewJob::new(json!({"name": "b"})).with_priority(1))
        .await
        .unwrap();

    queue
        .start_processing(handler.clone(), processor(1))
        .await
        .unwrap();
    wait_until("both jobs to finish", || {
        store.count_with_status(JobStatus::Success) == 2
    })
    .await;
    queue.stop_processing().await.unwrap();

    assert_eq!(handler.names(), vec!["b", "a"]);
}

#[tokio::test]
async fn default_priorities_give_fifo_order() {
    let store = InMemoryJobStore::new();
    let queue = Queue::new(Arc::new(store.clone()), "orders", fast_config()).unwrap();
    let handler = Arc::new(RecordingHandler::new());

    queue.enqueue(NewJob::new(json!({"name": "first"}))).await.unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;
    queue.enqueue(NewJob::new(json!({"name": "second"}))).await.unwrap();

    queue
        .start_processing(handler.clone(), processor(1))
        .await
        .unwrap();
    wait_until("both jobs to finish", || handler.call_count() == 2).await;
    queue.stop_processing().await.unwrap();

    assert_eq!(handler.names(), vec!["first", "second"]);
}

#[tokio::test]
async fn duplicate_unique_keys_persist_exactly_once() {
    let store = InMemoryJobStore::new();
    let queue = Queue::new(Arc::new(store.clone()), "orders", fast_config()).unwrap();

    let jobs: Vec<NewJob> = (0..10)
        .map(|i| NewJob::new(json!({"name": format!("dup-{i}")})).with_unique_key(42))
        .collect();
    let summary = queue.enqueue_many(jobs).await.unwrap();

    assert_eq!(summary.inserted, 1);
    assert_eq!(summary.deduplicated, 9);
    assert_eq!(store.rows_with_unique_key(42), 1);

    // Single enqueues against the live row are also benign no-ops.
    let outcome = queue
        .enqueue(NewJob::new(json!({"name": "dup-single"})).with_unique_key(42))
        .await
        .unwrap();
    assert!(outcome.is_deduplicated());
}

#[tokio::test]
async fn delayed_jobs_never_run_before_their_start_time() {
    let store = InMemoryJobStore::new();
    let queue = Queue::new(Arc::new(store.clone()), "orders", fast_config()).unwrap();
    let handler = Arc::new(RecordingHandler::new());

    let outcome = queue
        .enqueue(NewJob::new(json!({"name": "later"})).with_delay(Duration::from_millis(300)))
        .await
        .unwrap();
    let id = match outcome {
        oxenq::EnqueueOutcome::Inserted { id } => id,
        other => panic!("unexpected outcome {other:?}"),
    };
    let eligible_at = store.job(id).unwrap().created_ts;

    queue
        .start_processing(handler.clone(), processor(1))
        .await
        .unwrap();
    wait_until("delayed job to finish", || {
        store.count_with_status(JobStatus::Success) == 1
    })
    .await;
    queue.stop_processing().await.unwrap();

    let calls = handler.calls();
    assert_eq!(calls.len(), 1);
    assert!(
        calls[0].invoked_at >= eligible_at,
        "job ran {} before its start time {}",
        calls[0].invoked_at,
        eligible_at
    );
}

#[tokio::test]
async fn timeouts_mark_the_row_error_and_fire_the_hook_once() {
    let store = InMemoryJobStore::new();
    let queue = Queue::new(Arc::new(store.clone()), "orders", fast_config()).unwrap();
    let handler = Arc::new(RecordingHandler::new());
    let hooks = Arc::new(CountingHooks::new());

    queue
        .enqueue(NewJob::new(json!({"name": "sleeper", "sleep_ms": 30_000})))
        .await
        .unwrap();

    queue
        .start_processing_with_hooks(
            handler.clone(),
            hooks.clone(),
            processor(1).with_timeout(Duration::from_secs(1)),
        )
        .await
        .unwrap();
    wait_until("the job to time out", || {
        store.count_with_status(JobStatus::Error) == 1
    })
    .await;
    queue.stop_processing().await.unwrap();

    assert_eq!(hooks.error_count(), 1);
    assert!(hooks.error_messages()[0].contains("timed out"));

    let row = store.snapshot().into_iter().next().unwrap();
    assert_eq!(row.status, JobStatus::Error);
    assert!(row.result.unwrap().contains("timed out"));
    assert!(row.batch_id.is_some(), "finalize must keep the claim tag");
}

#[tokio::test]
async fn work_function_errors_capture_message_and_fire_hook() {
    let store = InMemoryJobStore::new();
    let queue = Queue::new(Arc::new(store.clone()), "orders", fast_config()).unwrap();
    let handler = Arc::new(RecordingHandler::new());
    let hooks = Arc::new(CountingHooks::new());

    queue
        .enqueue(NewJob::new(json!({"name": "bad", "fail": "no such customer"})))
        .await
        .unwrap();

    queue
        .start_processing_with_hooks(handler.clone(), hooks.clone(), processor(1))
        .await
        .unwrap();
    wait_until("the job to fail", || {
        store.count_with_status(JobStatus::Error) == 1
    })
    .await;
    queue.stop_processing().await.unwrap();

    assert_eq!(hooks.error_messages(), vec!["no such customer"]);
    let row = store.snapshot().into_iter().next().unwrap();
    assert!(row.result.unwrap().contains("no such customer"));
}

#[tokio::test]
async fn retry_sentinel_requeues_and_redelivers_the_same_body() {
    let store = InMemoryJobStore::new();
    let queue = Queue::new(Arc::new(store.clone()), "orders", fast_config()).unwrap();
    let handler = Arc::new(RecordingHandler::new());
    let hooks = Arc::new(CountingHooks::new());

    queue
        .enqueue(NewJob::new(json!({"name": "flaky", "retry_seconds": 0.1})))
        .await
        .unwrap();

    queue
        .start_processing_with_hooks(handler.clone(), hooks.clone(), processor(1))
        .await
        .unwrap();
    wait_until("the retried job to finish", || {
        store.count_with_status(JobStatus::Success) == 1
    })
    .await;
    queue.stop_processing().await.unwrap();

    let calls = handler.calls();
    assert_eq!(calls.len(), 2, "one original run plus one re-delivery");
    assert_eq!(calls[0].body, calls[1].body);
    // No callbacks fire for the requeued run, only for the final success;
    // and a requeue is not a success either.
    assert_eq!(hooks.success_ids().len(), 1);
    assert_eq!(hooks.error_count(), 0);
}

#[tokio::test]
async fn stop_processing_drains_inflight_jobs() {
    let store = InMemoryJobStore::new();
    let queue = Queue::new(Arc::new(store.clone()), "orders", fast_config()).unwrap();
    let handler = Arc::new(RecordingHandler::new());

    for i in 0..3 {
        queue
            .enqueue(NewJob::new(json!({"name": format!("slow-{i}"), "sleep_ms": 300})))
            .await
            .unwrap();
    }

    queue
        .start_processing(handler.clone(), processor(3))
        .await
        .unwrap();
    wait_until("all three jobs to start", || handler.call_count() == 3).await;

    // Drain: no cancellation of running work, everything finalized.
    queue.stop_processing().await.unwrap();

    assert_eq!(store.count_with_status(JobStatus::Success), 3);
    let snapshot = queue.debug().await;
    assert_eq!(snapshot.inflight, 0);
    assert!(snapshot.current_batch_ids.is_empty());
}

#[tokio::test]
async fn claim_failures_back_off_and_dispatch_recovers() {
    let flaky = FlakyClaimStore::new(InMemoryJobStore::new(), 2);
    let store = Arc::new(flaky.clone());
    let queue = Queue::new(store, "orders", fast_config()).unwrap();
    let handler = Arc::new(RecordingHandler::new());

    queue
        .enqueue(NewJob::new(json!({"name": "survivor"})))
        .await
        .unwrap();

    queue
        .start_processing(handler.clone(), processor(1))
        .await
        .unwrap();
    wait_until("the job to finish despite claim failures", || {
        handler.call_count() == 1
    })
    .await;
    queue.stop_processing().await.unwrap();

    assert!(flaky.claim_attempts() >= 3, "failed claims must be retried");
}

#[tokio::test]
async fn stuck_jobs_are_resurrected_and_rerun() {
    let store = InMemoryJobStore::new();

    // Simulate a worker that claimed a job and died before finalizing.
    store
        .enqueue("orders", NewJob::new(json!({"name": "orphan"})))
        .await
        .unwrap();
    let batch = store.claim("orders", 1).await.unwrap();
    let id = batch.jobs[0].id;
    store.backdate_started(id, Duration::from_secs(600));

    let queue = Queue::new(Arc::new(store.clone()), "orders", fast_config()).unwrap();
    let handler = Arc::new(RecordingHandler::new());

    let config = ProcessorConfig {
        concurrency: 1,
        timeout_secs: 5,
        recover_stuck_jobs: true,
        recovery_interval_secs: 1,
        recovery_threshold_secs: Some(120),
    };
    queue.start_processing(handler.clone(), config).await.unwrap();
    wait_until("the orphaned job to be rerun", || {
        store.count_with_status(JobStatus::Success) == 1
    })
    .await;
    queue.stop_processing().await.unwrap();

    let calls = handler.calls();
    assert_eq!(calls.len(), 1);
    assert!(calls[0].recovered, "rerun job must carry the recovered marker");
    assert!(store.job(id).unwrap().recovered);
}

#[tokio::test]
async fn recovery_can_be_disabled() {
    let store = InMemoryJobStore::new();
    store
        .enqueue("orders", NewJob::new(json!({"name": "orphan"})))
        .await
        .unwrap();
    let batch = store.claim("orders", 1).await.unwrap();
    let id = batch.jobs[0].id;
    store.backdate_started(id, Duration::from_secs(600));

    let queue = Queue::new(Arc::new(store.clone()), "orders", fast_config()).unwrap();
    let handler = Arc::new(RecordingHandler::new());

    let config = ProcessorConfig {
        recover_stuck_jobs: false,
        recovery_interval_secs: 1,
        recovery_threshold_secs: Some(120),
        ..processor(1)
    };
    queue.start_processing(handler.clone(), config).await.unwrap();
    tokio::time::sleep(Duration::from_millis(1500)).await;
    queue.stop_processing().await.unwrap();

    assert_eq!(handler.call_count(), 0);
    assert_eq!(store.job(id).unwrap().status, JobStatus::Processing);
}

struct GaugeHandler {
    current: AtomicUsize,
    peak: AtomicUsize,
}

impl GaugeHandler {
    fn new() -> Self {
        Self {
            current: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl WorkHandler for GaugeHandler {
    async fn run(&self, _job: &ClaimedJob) -> anyhow::Result<Value> {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(100)).await;
        self.current.fetch_sub(1, Ordering::SeqCst);
        Ok(json!(null))
    }
}

#[tokio::test]
async fn the_concurrency_cap_is_never_exceeded() {
    let store = InMemoryJobStore::new();
    let queue = Queue::new(Arc::new(store.clone()), "orders", fast_config()).unwrap();
    let handler = Arc::new(GaugeHandler::new());

    for i in 0..10 {
        queue
            .enqueue(NewJob::new(json!({"name": format!("j-{i}")})))
            .await
            .unwrap();
    }

    queue
        .start_processing(handler.clone(), processor(2))
        .await
        .unwrap();
    wait_until("all ten jobs to finish", || {
        store.count_with_status(JobStatus::Success) == 10
    })
    .await;
    queue.stop_processing().await.unwrap();

    assert!(
        handler.peak.load(Ordering::SeqCst) <= 2,
        "peak concurrency {} exceeded the cap",
        handler.peak.load(Ordering::SeqCst)
    );
}

#[tokio::test]
async fn panicking_callbacks_are_swallowed() {
    let store = InMemoryJobStore::new();
    let queue = Queue::new(Arc::new(store.clone()), "orders", fast_config()).unwrap();
    let handler = Arc::new(RecordingHandler::new());

    queue.enqueue(NewJob::new(json!({"name": "one"}))).await.unwrap();
    queue.enqueue(NewJob::new(json!({"name": "two"}))).await.unwrap();

    queue
        .start_processing_with_hooks(handler.clone(), Arc::new(PanickingHooks), processor(1))
        .await
        .unwrap();
    wait_until("both jobs to finish despite panicking hooks", || {
        store.count_with_status(JobStatus::Success) == 2
    })
    .await;
    queue.stop_processing().await.unwrap();
}

#[tokio::test]
async fn starting_twice_is_an_error_and_stop_is_idempotent() {
    let store = InMemoryJobStore::new();
    let queue = Queue::new(Arc::new(store), "orders", fast_config()).unwrap();
    let handler = Arc::new(RecordingHandler::new());

    queue
        .start_processing(handler.clone(), processor(1))
        .await
        .unwrap();
    let second = queue.start_processing(handler.clone(), processor(1)).await;
    assert!(matches!(second, Err(oxenq::QueueError::AlreadyRunning(_))));

    queue.stop_processing().await.unwrap();
    queue.stop_processing().await.unwrap();
}
