//! Simple queue example: enqueue a handful of jobs against the in-memory
//! store and process them with one `Queue` instance.
//!
//! Run with: `cargo run --example simple_queue`

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use oxenq::{ClaimedJob, NewJob, ProcessorConfig, Queue, QueueConfig, WorkHandler};
use oxenq_testkit::InMemoryJobStore;
use serde_json::{json, Value};

struct Greeter;

#[async_trait]
impl WorkHandler for Greeter {
    async fn run(&self, job: &ClaimedJob) -> anyhow::Result<Value> {
        let who = job.body["who"].as_str().unwrap_or("world");
        println!("[job {}] hello, {who}", job.id);
        tokio::time::sleep(Duration::from_millis(50)).await;
        Ok(json!({ "greeted": who }))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter("info").init();

    let store = InMemoryJobStore::new();
    let queue = Queue::new(
        Arc::new(store.clone()),
        "greetings",
        QueueConfig::default().with_polling_rates(20, 500),
    )?;

    // The urgent greeting runs first despite being enqueued last.
    queue.enqueue(NewJob::new(json!({ "who": "alice" }))).await?;
    queue.enqueue(NewJob::new(json!({ "who": "bob" }))).await?;
    queue
        .enqueue(NewJob::new(json!({ "who": "the boss" })).with_priority(0))
        .await?;

    queue
        .start_processing(
            Arc::new(Greeter),
            ProcessorConfig::default().with_concurrency(2),
        )
        .await?;

    tokio::time::sleep(Duration::from_secs(1)).await;
    queue.stop_processing().await?;

    for row in store.snapshot() {
        println!(
            "row {} [{}] result={}",
            row.id,
            row.status,
            row.result.unwrap_or_default()
        );
    }
    Ok(())
}
