use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt::Display;
use std::time::Duration;

/// Well-known key a work function places in its return value to request a
/// delayed requeue instead of completion: `{ "_oxen_queue_retry_seconds": S }`
/// with `S` a non-negative number of seconds.
///
/// This is a wire contract: the supervisor inspects the encoded return value
/// for this shape, so it survives any language the producer was written in.
pub const RETRY_SENTINEL_KEY: &str = "_oxen_queue_retry_seconds";

/// Lifecycle states of a job row.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Eligible to be claimed (possibly not before its start time).
    Waiting,
    /// Claimed by a worker and tagged with a batch id.
    Processing,
    /// Finished successfully; terminal.
    Success,
    /// Finished with an error or timed out; terminal.
    Error,
    /// Transitional marker for rows abandoned by a dead worker.
    Stuck,
}

impl JobStatus {
    /// String form stored in the `status` column.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Waiting => "waiting",
            JobStatus::Processing => "processing",
            JobStatus::Success => "success",
            JobStatus::Error => "error",
            JobStatus::Stuck => "stuck",
        }
    }

    /// Parse the stored string form.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "waiting" => Some(JobStatus::Waiting),
            "processing" => Some(JobStatus::Processing),
            "success" => Some(JobStatus::Success),
            "error" => Some(JobStatus::Error),
            "stuck" => Some(JobStatus::Stuck),
            _ => None,
        }
    }

    /// Terminal rows never change again except by operator deletion.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Success | JobStatus::Error)
    }
}

impl Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A full job row as stored in the table.
///
/// `created_ts` doubles as the earliest claim-eligibility time: rows whose
/// `created_ts` lies in the future are invisible to the claim.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JobRow {
    pub id: u64,
    /// Non-null exactly while a claim holds the row; left in place by
    /// finalization so claimed rows stay distinguishable afterwards.
    pub batch_id: Option<u64>,
    pub job_type: String,
    pub created_ts: DateTime<Utc>,
    pub started_ts: Option<DateTime<Utc>>,
    /// Opaque textual payload, typically JSON.
    pub body: String,
    pub status: JobStatus,
    /// Encoded return value on success, encoded failure on error.
    pub result: Option<String>,
    /// Set when the row was resurrected by the stuck-job sweep.
    pub recovered: bool,
    /// Seconds spent processing, recorded at finalization.
    pub running_time: Option<u16>,
    pub unique_key: Option<u32>,
    pub priority: Option<i64>,
}

/// Input to `enqueue`. Only the body is required; everything else has the
/// enqueue-time defaults described on the builder methods.
#[derive(Clone, Debug)]
pub struct NewJob {
    pub body: Value,
    pub priority: Option<i64>,
    pub unique_key: Option<u32>,
    pub start_time: Option<DateTime<Utc>>,
}

impl NewJob {
    pub fn new(body: Value) -> Self {
        Self {
            body,
            priority: None,
            unique_key: None,
            start_time: None,
        }
    }

    /// Lower priorities run first. Defaults to the enqueue wall clock in
    /// milliseconds, which yields FIFO order among default-priority jobs.
    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = Some(priority);
        self
    }

    /// Deduplication key. At most one row per key may exist until the
    /// operator deletes it; conflicting enqueues are dropped, not failed.
    /// String keys must be pre-hashed by the caller; the engine does not
    /// prescribe the hash.
    pub fn with_unique_key(mut self, key: u32) -> Self {
        self.unique_key = Some(key);
        self
    }

    /// Earliest moment the job may be claimed. A job with an explicitly low
    /// priority can still overtake a delayed job once both are eligible; the
    /// claim orders only among eligible rows.
    pub fn with_start_time(mut self, start_time: DateTime<Utc>) -> Self {
        self.start_time = Some(start_time);
        self
    }

    /// Convenience for `with_start_time(now + delay)`.
    pub fn with_delay(self, delay: Duration) -> Self {
        // Absurd delays clamp to a century rather than overflow the clock.
        let delay =
            chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::days(36_500));
        self.with_start_time(Utc::now() + delay)
    }
}

/// Default priority for jobs that did not set one: enqueue time in epoch
/// milliseconds.
pub(crate) fn default_priority() -> i64 {
    Utc::now().timestamp_millis()
}

/// Extract the requeue delay from an encoded work-function return value.
///
/// Returns `None` unless the value carries the retry sentinel with a valid
/// non-negative number; anything else classifies as an ordinary success.
pub fn retry_delay(value: &Value) -> Option<Duration> {
    let seconds = value.get(RETRY_SENTINEL_KEY)?.as_f64()?;
    if seconds.is_finite() && seconds >= 0.0 {
        Some(Duration::from_secs_f64(seconds))
    } else {
        None
    }
}

/// Captured description of a failed job, stored in the `result` column.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JobFailure {
    pub message: String,
    pub stack: String,
}

impl JobFailure {
    pub fn new(message: impl Into<String>, stack: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            stack: stack.into(),
        }
    }

    /// Failure recorded when the supervisor's timer wins the race.
    pub fn timed_out(limit: Duration) -> Self {
        let message = format!("job timed out after {}s", limit.as_secs_f64());
        Self {
            stack: message.clone(),
            message,
        }
    }

    /// Capture a work-function error with its full chain as the stack.
    pub fn from_error(err: &anyhow::Error) -> Self {
        Self {
            message: err.to_string(),
            stack: format!("{err:?}"),
        }
    }

    /// Encoded form written into the `result` column.
    pub fn encode(&self) -> Value {
        serde_json::json!({
            "message": self.message,
            "stack": self.stack,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn status_round_trips_through_storage_form() {
        for status in [
            JobStatus::Waiting,
            JobStatus::Processing,
            JobStatus::Success,
            JobStatus::Error,
            JobStatus::Stuck,
        ] {
            assert_eq!(JobStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(JobStatus::parse("running"), None);
    }

    #[test]
    fn retry_sentinel_detected_on_encoded_values() {
        assert_eq!(
            retry_delay(&json!({ RETRY_SENTINEL_KEY: 30 })),
            Some(Duration::from_secs(30))
        );
        assert_eq!(
            retry_delay(&json!({ RETRY_SENTINEL_KEY: 0 })),
            Some(Duration::ZERO)
        );
        assert_eq!(
            retry_delay(&json!({ RETRY_SENTINEL_KEY: 1.5 })),
            Some(Duration::from_millis(1500))
        );
    }

    #[test]
    fn values_without_valid_sentinel_are_successes() {
        assert_eq!(retry_delay(&json!({ "answer": 42 })), None);
        assert_eq!(retry_delay(&json!("plain string")), None);
        assert_eq!(retry_delay(&json!({ RETRY_SENTINEL_KEY: -5 })), None);
        assert_eq!(retry_delay(&json!({ RETRY_SENTINEL_KEY: "soon" })), None);
    }

    #[test]
    fn failure_encoding_carries_message_and_stack() {
        let err = anyhow::anyhow!("disk on fire");
        let failure = JobFailure::from_error(&err);
        let encoded = failure.encode();
        assert_eq!(encoded["message"], "disk on fire");
        assert!(encoded["stack"].as_str().unwrap().contains("disk on fire"));
    }

    #[test]
    fn timeout_failure_names_the_timeout() {
        let failure = JobFailure::timed_out(Duration::from_secs(5));
        assert!(failure.message.contains("timed out"));
        assert!(failure.message.contains('5'));
    }

    #[test]
    fn delayed_job_builder_sets_future_start_time() {
        let job = NewJob::new(json!({"x": 1})).with_delay(Duration::from_secs(120));
        let start = job.start_time.expect("start time set");
        assert!(start > Utc::now() + chrono::Duration::seconds(60));
    }
}
