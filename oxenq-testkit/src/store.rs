use async_trait::async_trait;
use chrono::{DateTime, Utc};
use oxenq::{
    BatchId, ClaimedBatch, ClaimedJob, EnqueueOutcome, EnqueueSummary, JobFailure, JobRow,
    JobStatus, JobStore, NewJob, QueueError,
};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

/// In-memory job store mirroring the table semantics: priority-ordered
/// claims with batch tagging, delayed eligibility, unique-key dedup against
/// live rows, and the stuck-job sweep.
#[derive(Clone, Default)]
pub struct InMemoryJobStore {
    inner: Arc<Mutex<Inner>>,
}

#[derive(Default)]
struct Inner {
    rows: BTreeMap<u64, JobRow>,
    next_id: u64,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// All rows, in id order.
    pub fn snapshot(&self) -> Vec<JobRow> {
        self.inner.lock().rows.values().cloned().collect()
    }

    pub fn job(&self, id: u64) -> Option<JobRow> {
        self.inner.lock().rows.get(&id).cloned()
    }

    pub fn count_with_status(&self, status: JobStatus) -> usize {
        self.inner
            .lock()
            .rows
            .values()
            .filter(|row| row.status == status)
            .count()
    }

    pub fn rows_with_unique_key(&self, key: u32) -> usize {
        self.inner
            .lock()
            .rows
            .values()
            .filter(|row| row.unique_key == Some(key))
            .count()
    }

    /// Age a processing row's start timestamp, so sweep tests need not wait
    /// out a real threshold.
    pub fn backdate_started(&self, id: u64, age: Duration) {
        let mut inner = self.inner.lock();
        if let Some(row) = inner.rows.get_mut(&id) {
            let age = to_chrono(age);
            if let Some(started) = row.started_ts {
                row.started_ts = Some(started - age);
            }
        }
    }

    fn insert_locked(
        inner: &mut Inner,
        job_type: &str,
        job: &NewJob,
        now: DateTime<Utc>,
    ) -> EnqueueOutcome {
        if let Some(key) = job.unique_key {
            let taken = inner
                .rows
                .values()
                .any(|row| row.unique_key == Some(key));
            if taken {
                return EnqueueOutcome::Deduplicated;
            }
        }

        inner.next_id += 1;
        let id = inner.next_id;
        inner.rows.insert(
            id,
            JobRow {
                id,
                batch_id: None,
                job_type: job_type.to_string(),
                created_ts: job.start_time.unwrap_or(now),
                started_ts: None,
                body: job.body.to_string(),
                status: JobStatus::Waiting,
                result: None,
                recovered: false,
                running_time: None,
                unique_key: job.unique_key,
                priority: Some(job.priority.unwrap_or_else(|| now.timestamp_millis())),
            },
        );
        EnqueueOutcome::Inserted { id }
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn enqueue(&self, job_type: &str, job: NewJob) -> Result<EnqueueOutcome, QueueError> {
        let mut inner = self.inner.lock();
        Ok(Self::insert_locked(&mut inner, job_type, &job, Utc::now()))
    }

    async fn enqueue_many(
        &self,
        job_type: &str,
        jobs: Vec<NewJob>,
    ) -> Result<EnqueueSummary, QueueError> {
        let mut inner = self.inner.lock();
        let now = Utc::now();
        let mut summary = EnqueueSummary::default();
        for job in &jobs {
            match Self::insert_locked(&mut inner, job_type, job, now) {
                EnqueueOutcome::Inserted { .. } => summary.inserted += 1,
                EnqueueOutcome::Deduplicated => summary.deduplicated += 1,
            }
        }
        Ok(summary)
    }

    async fn claim(&self, job_type: &str, limit: usize) -> Result<ClaimedBatch, QueueError> {
        let batch_id = BatchId::allocate();
        if limit == 0 {
            return Ok(ClaimedBatch::empty(batch_id));
        }

        let mut inner = self.inner.lock();
        let now = Utc::now();

        let mut eligible: Vec<(i64, u64)> = inner
            .rows
            .values()
            .filter(|row| {
                row.job_type == job_type
                    && row.status == JobStatus::Waiting
                    && row.batch_id.is_none()
                    && row.created_ts <= now
            })
            .map(|row| (row.priority.unwrap_or(i64::MIN), row.id))
            .collect();
        eligible.sort_unstable();
        eligible.truncate(limit);

        let mut jobs = Vec::with_capacity(eligible.len());
        for (_, id) in eligible {
            let row = inner.rows.get_mut(&id).expect("eligible row exists");
            row.status = JobStatus::Processing;
            row.batch_id = Some(batch_id.0);
            row.started_ts = Some(now);

            let body = serde_json::from_str(&row.body)
                .unwrap_or_else(|_| Value::String(row.body.clone()));
            jobs.push(ClaimedJob {
                id: row.id,
                batch_id: batch_id.0,
                job_type: row.job_type.clone(),
                body,
                priority: row.priority,
                created_ts: row.created_ts,
                started_ts: now,
                recovered: row.recovered,
            });
        }

        Ok(ClaimedBatch { batch_id, jobs })
    }

    async fn finalize_success(&self, id: u64, result: &Value) -> Result<(), QueueError> {
        let mut inner = self.inner.lock();
        if let Some(row) = inner.rows.get_mut(&id) {
            if row.status == JobStatus::Processing {
                row.status = JobStatus::Success;
                row.result = Some(result.to_string());
                row.running_time = Some(elapsed_secs(row.started_ts));
            }
        }
        Ok(())
    }

    async fn finalize_error(&self, id: u64, failure: &JobFailure) -> Result<(), QueueError> {
        let mut inner = self.inner.lock();
        if let Some(row) = inner.rows.get_mut(&id) {
            if row.status == JobStatus::Processing {
                row.status = JobStatus::Error;
                row.result = Some(failure.encode().to_string());
                row.running_time = Some(elapsed_secs(row.started_ts));
            }
        }
        Ok(())
    }

    async fn requeue(&self, id: u64, delay: Duration) -> Result<(), QueueError> {
        let mut inner = self.inner.lock();
        if let Some(row) = inner.rows.get_mut(&id) {
            if row.status == JobStatus::Processing {
                row.status = JobStatus::Waiting;
                row.batch_id = None;
                row.created_ts = Utc::now() + to_chrono(delay);
            }
        }
        Ok(())
    }

    async fn scan_stuck(
        &self,
        job_type: &str,
        threshold: Duration,
    ) -> Result<Vec<u64>, QueueError> {
        let inner = self.inner.lock();
        let cutoff = cutoff(threshold);
        Ok(inner
            .rows
            .values()
            .filter(|row| {
                row.job_type == job_type
                    && row.status == JobStatus::Processing
                    && row.started_ts.is_some_and(|started| started < cutoff)
            })
            .map(|row| row.id)
            .collect())
    }

    async fn recover_stuck(
        &self,
        job_type: &str,
        threshold: Duration,
    ) -> Result<u64, QueueError> {
        let mut inner = self.inner.lock();
        let cutoff = cutoff(threshold);
        let mut moved = 0;
        for row in inner.rows.values_mut() {
            if row.job_type != job_type {
                continue;
            }
            let abandoned = row.started_ts.is_some_and(|started| started < cutoff);
            if row.status == JobStatus::Processing && abandoned {
                row.status = JobStatus::Waiting;
                row.batch_id = None;
                row.recovered = true;
                moved += 1;
            } else if row.status == JobStatus::Waiting && row.batch_id.is_some() && abandoned {
                row.batch_id = None;
            }
        }
        Ok(moved)
    }

    async fn fetch_job(&self, id: u64) -> Result<Option<JobRow>, QueueError> {
        Ok(self.job(id))
    }
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::days(36_500))
}

fn cutoff(threshold: Duration) -> DateTime<Utc> {
    Utc::now() - to_chrono(threshold)
}

fn elapsed_secs(started_ts: Option<DateTime<Utc>>) -> u16 {
    started_ts
        .map(|started| (Utc::now() - started).num_seconds().clamp(0, u16::MAX as i64) as u16)
        .unwrap_or(0)
}
