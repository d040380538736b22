use async_trait::async_trait;
use chrono::{DateTime, Utc};
use oxenq::{
    ClaimedBatch, ClaimedJob, EnqueueOutcome, EnqueueSummary, JobFailure, JobHooks, JobRow,
    JobStore, NewJob, QueueError, WorkHandler, RETRY_SENTINEL_KEY,
};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

/// Work handler scripted by the job body, recording every invocation.
///
/// Recognized top-level body keys:
/// - `"name"`: label recorded in call order
/// - `"sleep_ms"`: sleep before finishing
/// - `"fail"`: return this message as an error
/// - `"retry_seconds"`: request a requeue the first time this name runs
/// - `"panic"`: panic mid-run
#[derive(Clone, Default)]
pub struct RecordingHandler {
    calls: Arc<Mutex<Vec<CallRecord>>>,
    retried: Arc<Mutex<HashSet<String>>>,
}

#[derive(Clone, Debug)]
pub struct CallRecord {
    pub name: String,
    pub body: Value,
    pub invoked_at: DateTime<Utc>,
    pub recovered: bool,
}

impl RecordingHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<CallRecord> {
        self.calls.lock().clone()
    }

    pub fn names(&self) -> Vec<String> {
        self.calls.lock().iter().map(|c| c.name.clone()).collect()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }
}

#[async_trait]
impl WorkHandler for RecordingHandler {
    async fn run(&self, job: &ClaimedJob) -> anyhow::Result<Value> {
        let name = job.body["name"].as_str().unwrap_or("").to_string();
        self.calls.lock().push(CallRecord {
            name: name.clone(),
            body: job.body.clone(),
            invoked_at: Utc::now(),
            recovered: job.recovered,
        });

        if let Some(ms) = job.body["sleep_ms"].as_u64() {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
        if job.body["panic"].as_bool() == Some(true) {
            panic!("scripted panic in {name}");
        }
        if let Some(message) = job.body["fail"].as_str() {
            anyhow::bail!("{message}");
        }
        if let Some(seconds) = job.body["retry_seconds"].as_f64() {
            let first_run = self.retried.lock().insert(name.clone());
            if first_run {
                return Ok(json!({ RETRY_SENTINEL_KEY: seconds }));
            }
        }

        Ok(json!({ "done": name }))
    }
}

/// Hooks that count and record finalizations.
#[derive(Clone, Default)]
pub struct CountingHooks {
    successes: Arc<Mutex<Vec<u64>>>,
    errors: Arc<Mutex<Vec<(u64, String)>>>,
}

impl CountingHooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn success_ids(&self) -> Vec<u64> {
        self.successes.lock().clone()
    }

    pub fn error_count(&self) -> usize {
        self.errors.lock().len()
    }

    pub fn error_messages(&self) -> Vec<String> {
        self.errors.lock().iter().map(|(_, m)| m.clone()).collect()
    }
}

#[async_trait]
impl JobHooks for CountingHooks {
    async fn on_job_success(&self, job: &ClaimedJob, _result: &Value) {
        self.successes.lock().push(job.id);
    }

    async fn on_job_error(&self, job: &ClaimedJob, failure: &JobFailure) {
        self.errors.lock().push((job.id, failure.message.clone()));
    }
}

/// Hooks that panic on every callback, for asserting the engine swallows
/// callback failures and keeps processing.
#[derive(Clone, Copy, Debug, Default)]
pub struct PanickingHooks;

#[async_trait]
impl JobHooks for PanickingHooks {
    async fn on_job_success(&self, job: &ClaimedJob, _result: &Value) {
        panic!("success hook blew up for job {}", job.id);
    }

    async fn on_job_error(&self, job: &ClaimedJob, _failure: &JobFailure) {
        panic!("error hook blew up for job {}", job.id);
    }
}

/// Store wrapper whose first `fail_claims` claim calls fail, exercising the
/// claim-failure-counts-as-idle path.
#[derive(Clone)]
pub struct FlakyClaimStore<S> {
    inner: S,
    remaining_failures: Arc<Mutex<u32>>,
    claim_attempts: Arc<Mutex<u32>>,
}

impl<S> FlakyClaimStore<S> {
    pub fn new(inner: S, fail_claims: u32) -> Self {
        Self {
            inner,
            remaining_failures: Arc::new(Mutex::new(fail_claims)),
            claim_attempts: Arc::new(Mutex::new(0)),
        }
    }

    pub fn claim_attempts(&self) -> u32 {
        *self.claim_attempts.lock()
    }
}

#[async_trait]
impl<S: JobStore> JobStore for FlakyClaimStore<S> {
    async fn enqueue(&self, job_type: &str, job: NewJob) -> Result<EnqueueOutcome, QueueError> {
        self.inner.enqueue(job_type, job).await
    }

    async fn enqueue_many(
        &self,
        job_type: &str,
        jobs: Vec<NewJob>,
    ) -> Result<EnqueueSummary, QueueError> {
        self.inner.enqueue_many(job_type, jobs).await
    }

    async fn claim(&self, job_type: &str, limit: usize) -> Result<ClaimedBatch, QueueError> {
        *self.claim_attempts.lock() += 1;
        {
            let mut remaining = self.remaining_failures.lock();
            if *remaining > 0 {
                *remaining -= 1;
                return Err(QueueError::Backend("injected claim failure".into()));
            }
        }
        self.inner.claim(job_type, limit).await
    }

    async fn finalize_success(&self, id: u64, result: &Value) -> Result<(), QueueError> {
        self.inner.finalize_success(id, result).await
    }

    async fn finalize_error(&self, id: u64, failure: &JobFailure) -> Result<(), QueueError> {
        self.inner.finalize_error(id, failure).await
    }

    async fn requeue(&self, id: u64, delay: Duration) -> Result<(), QueueError> {
        self.inner.requeue(id, delay).await
    }

    async fn scan_stuck(
        &self,
        job_type: &str,
        threshold: Duration,
    ) -> Result<Vec<u64>, QueueError> {
        self.inner.scan_stuck(job_type, threshold).await
    }

    async fn recover_stuck(
        &self,
        job_type: &str,
        threshold: Duration,
    ) -> Result<u64, QueueError> {
        self.inner.recover_stuck(job_type, threshold).await
    }

    async fn fetch_job(&self, id: u64) -> Result<Option<JobRow>, QueueError> {
        self.inner.fetch_job(id).await
    }

    fn pool_capacity(&self) -> Option<u32> {
        self.inner.pool_capacity()
    }

    async fn close(&self) {
        self.inner.close().await;
    }
}
