//! Full runtime against MySQL: table bootstrap, deduplicated and delayed
//! enqueues, a processor with retry and timeout handling, then a graceful
//! drain.
//!
//! Requires a reachable database. Run with:
//! `MYSQL_URL=mysql://root@localhost/test \
//!  cargo run --example mysql_queue --features mysql`

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use oxenq::persistence::MySqlJobStore;
use oxenq::{
    ClaimedJob, JobFailure, JobHooks, MySqlConfig, NewJob, ProcessorConfig, Queue,
    QueueConfig, WorkHandler,
};
use serde_json::{json, Value};

struct ChargeCard;

#[async_trait]
impl WorkHandler for ChargeCard {
    async fn run(&self, job: &ClaimedJob) -> anyhow::Result<Value> {
        let amount = job.body["amount_cents"].as_i64().unwrap_or(0);
        if amount <= 0 {
            anyhow::bail!("refusing to charge {amount} cents");
        }
        println!("[job {}] charging {amount} cents", job.id);
        tokio::time::sleep(Duration::from_millis(100)).await;
        Ok(json!({ "charged": amount }))
    }
}

struct LogHooks;

#[async_trait]
impl JobHooks for LogHooks {
    async fn on_job_success(&self, job: &ClaimedJob, result: &Value) {
        println!("[job {}] done: {result}", job.id);
    }

    async fn on_job_error(&self, job: &ClaimedJob, failure: &JobFailure) {
        println!("[job {}] failed: {}", job.id, failure.message);
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter("info").init();

    let url = std::env::var("MYSQL_URL")
        .unwrap_or_else(|_| "mysql://root@localhost/test".to_string());

    let config = QueueConfig::default();
    let store = MySqlJobStore::connect(&MySqlConfig::new(url), &config).await?;
    store.create_table().await?;

    let queue = Queue::new(Arc::new(store), "payments", config)?;

    // Idempotent enqueue: the second insert with the same key is dropped.
    let order_key = 10_443;
    queue
        .enqueue(NewJob::new(json!({ "amount_cents": 1250 })).with_unique_key(order_key))
        .await?;
    let dup = queue
        .enqueue(NewJob::new(json!({ "amount_cents": 1250 })).with_unique_key(order_key))
        .await?;
    println!("second enqueue deduplicated: {}", dup.is_deduplicated());

    // A charge scheduled for two seconds from now.
    queue
        .enqueue(NewJob::new(json!({ "amount_cents": 990 })).with_delay(Duration::from_secs(2)))
        .await?;

    queue
        .start_processing_with_hooks(
            Arc::new(ChargeCard),
            Arc::new(LogHooks),
            ProcessorConfig::default()
                .with_concurrency(4)
                .with_timeout(Duration::from_secs(30)),
        )
        .await?;

    tokio::time::sleep(Duration::from_secs(5)).await;
    println!("debug: {:?}", queue.debug().await);

    queue.shutdown().await?;
    Ok(())
}
