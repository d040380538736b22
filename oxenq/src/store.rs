use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::fmt::Display;
use std::time::Duration;
use uuid::Uuid;

use crate::error::QueueError;
use crate::job::{JobRow, NewJob};

/// Globally unique identifier for a single claim event.
///
/// Serves as the soft-lock handle for every row the claim tagged. Two
/// concurrent claims never share a batch id, on any worker, at any time.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct BatchId(pub u64);

impl BatchId {
    /// Allocate a fresh batch id: 63 usable bits of v4 UUID entropy,
    /// never zero. The top bit stays clear so the value survives readers
    /// that treat the column as signed.
    pub fn allocate() -> Self {
        loop {
            let id = (Uuid::new_v4().as_u128() as u64) & (i64::MAX as u64);
            if id != 0 {
                return Self(id);
            }
        }
    }
}

impl Display for BatchId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Result of a single-job enqueue.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum EnqueueOutcome {
    /// A new row was persisted.
    Inserted { id: u64 },
    /// A live row already holds this unique key; nothing was written.
    Deduplicated,
}

impl EnqueueOutcome {
    pub fn is_deduplicated(&self) -> bool {
        matches!(self, EnqueueOutcome::Deduplicated)
    }
}

/// Accounting for a batch enqueue: every non-conflicting row persists,
/// conflicts are dropped silently.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct EnqueueSummary {
    pub inserted: u64,
    pub deduplicated: u64,
}

/// A row handed to a supervisor by a claim: the decoded body plus a
/// read-only view of the fields a work function may care about.
#[derive(Clone, Debug)]
pub struct ClaimedJob {
    pub id: u64,
    pub batch_id: u64,
    pub job_type: String,
    /// Decoded body. Non-JSON bodies surface as a JSON string.
    pub body: Value,
    pub priority: Option<i64>,
    pub created_ts: DateTime<Utc>,
    pub started_ts: DateTime<Utc>,
    pub recovered: bool,
}

impl ClaimedJob {
    /// Decode the body into a caller-defined type.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, QueueError> {
        Ok(serde_json::from_value(self.body.clone())?)
    }
}

/// Outcome of one claim event.
#[derive(Clone, Debug)]
pub struct ClaimedBatch {
    pub batch_id: BatchId,
    pub jobs: Vec<ClaimedJob>,
}

impl ClaimedBatch {
    pub fn empty(batch_id: BatchId) -> Self {
        Self {
            batch_id,
            jobs: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}

/// Storage boundary of the engine. Every SQL statement lives behind this
/// trait; the runtime never sees a connection.
///
/// All operations are single statements (or a single insert) and are
/// idempotent under retry where they condition on current row state: a
/// repeated finalize or requeue of an already-moved row affects zero rows.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert one `waiting` row. A unique-key conflict with a live row is
    /// reported as [`EnqueueOutcome::Deduplicated`], never as an error.
    async fn enqueue(&self, job_type: &str, job: NewJob) -> Result<EnqueueOutcome, QueueError>;

    /// Insert many rows; conflicting unique keys are silently dropped and
    /// counted, every other row persists.
    async fn enqueue_many(
        &self,
        job_type: &str,
        jobs: Vec<NewJob>,
    ) -> Result<EnqueueSummary, QueueError>;

    /// Atomically move up to `limit` eligible `waiting` rows to
    /// `processing`, tagged with a fresh batch id, and return them.
    /// An empty batch means the queue is empty for now.
    async fn claim(&self, job_type: &str, limit: usize) -> Result<ClaimedBatch, QueueError>;

    /// Terminal success: writes the encoded result and the running time.
    /// Leaves `batch_id` in place so claimed rows stay distinguishable.
    async fn finalize_success(&self, id: u64, result: &Value) -> Result<(), QueueError>;

    /// Terminal error: writes the encoded failure description.
    async fn finalize_error(
        &self,
        id: u64,
        failure: &crate::job::JobFailure,
    ) -> Result<(), QueueError>;

    /// Return a claimed row to `waiting`, clearing its claim tag and
    /// deferring eligibility by `delay`.
    async fn requeue(&self, id: u64, delay: Duration) -> Result<(), QueueError>;

    /// Ids of rows stranded in `processing` longer than `threshold`.
    async fn scan_stuck(
        &self,
        job_type: &str,
        threshold: Duration,
    ) -> Result<Vec<u64>, QueueError>;

    /// Return stranded rows to `waiting` with `recovered` set; reports how
    /// many rows moved. Also drops stale claim tags left on `waiting` rows
    /// by a crashed claim.
    async fn recover_stuck(&self, job_type: &str, threshold: Duration)
        -> Result<u64, QueueError>;

    /// Full-row read, for forensics and tests.
    async fn fetch_job(&self, id: u64) -> Result<Option<JobRow>, QueueError>;

    /// Advertised connection-pool ceiling, if the backend has one. Used by
    /// the startup check that the pool covers `concurrency + 2`.
    fn pool_capacity(&self) -> Option<u32> {
        None
    }

    /// Release backend resources. Safe to call more than once.
    async fn close(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn batch_ids_are_nonzero_and_distinct() {
        let mut seen = HashSet::new();
        for _ in 0..10_000 {
            let id = BatchId::allocate();
            assert!(id.0 != 0);
            assert!(id.0 <= i64::MAX as u64);
            assert!(seen.insert(id.0), "duplicate batch id {id}");
        }
    }

    #[test]
    fn claimed_job_decodes_typed_bodies() {
        #[derive(serde::Deserialize)]
        struct Payload {
            name: String,
        }

        let job = ClaimedJob {
            id: 1,
            batch_id: 7,
            job_type: "emails".into(),
            body: serde_json::json!({"name": "welcome"}),
            priority: None,
            created_ts: Utc::now(),
            started_ts: Utc::now(),
            recovered: false,
        };
        let payload: Payload = job.decode().expect("decodes");
        assert_eq!(payload.name, "welcome");
    }
}
