//! Stress helpers for concurrent writers.
//!
//! These drive several clients against one authority to verify that
//! conditional writes and merge retries never lose an update.

use crate::fixtures::{fast_config, object, TestBed};
use livesync_engine::{MutateConfig, RetryConfig};
use serde_json::json;
use std::time::{Duration, Instant};

/// Result of a stress test run.
#[derive(Debug, Clone)]
pub struct StressTestResult {
    /// Total operations performed.
    pub total_ops: usize,
    /// Successful operations.
    pub successful_ops: usize,
    /// Failed operations.
    pub failed_ops: usize,
    /// Total duration.
    pub duration: Duration,
    /// Operations per second.
    pub ops_per_second: f64,
}

impl StressTestResult {
    /// Creates a new result.
    pub fn new(successful: usize, failed: usize, duration: Duration) -> Self {
        let total = successful + failed;
        let ops_per_second = if duration.as_secs_f64() > 0.0 {
            total as f64 / duration.as_secs_f64()
        } else {
            0.0
        };

        Self {
            total_ops: total,
            successful_ops: successful,
            failed_ops: failed,
            duration,
            ops_per_second,
        }
    }

    /// Prints a summary of the run.
    pub fn print_summary(&self, name: &str) {
        println!("\n=== {} ===", name);
        println!("Total operations: {}", self.total_ops);
        println!("Successful: {}", self.successful_ops);
        println!("Failed: {}", self.failed_ops);
        println!("Duration: {:?}", self.duration);
        println!("Throughput: {:.2} ops/sec", self.ops_per_second);
    }
}

/// Configuration for stress runs.
#[derive(Debug, Clone)]
pub struct StressConfig {
    /// Number of concurrent clients.
    pub clients: usize,
    /// Operations performed by each client.
    pub operations_per_client: usize,
    /// Merge attempts before a mutation gives up.
    pub mutate_attempts: u32,
}

impl Default for StressConfig {
    fn default() -> Self {
        Self {
            clients: 4,
            operations_per_client: 25,
            mutate_attempts: 1_000,
        }
    }
}

/// Has every client increment one shared counter document concurrently.
///
/// Returns the run result and the counter's final value as seen by the
/// authority.
pub async fn stress_concurrent_increments(
    bed: &TestBed,
    config: &StressConfig,
) -> (StressTestResult, i64) {
    let mut clients = Vec::with_capacity(config.clients);
    for i in 0..config.clients {
        let sync_config = fast_config().with_mutate(
            MutateConfig::new(config.mutate_attempts).with_retry(
                RetryConfig::unbounded()
                    .with_initial_delay(Duration::from_micros(200))
                    .with_max_delay(Duration::from_millis(5)),
            ),
        );
        clients.push(bed.client_with_config(&format!("writer-{i}"), sync_config).await);
    }
    clients[0]
        .documents()
        .open_or_create("counter", None)
        .await
        .expect("Failed to create counter");

    let start = Instant::now();
    let tasks: Vec<_> = clients
        .iter()
        .map(|client| {
            let documents = client.documents();
            let operations = config.operations_per_client;
            tokio::spawn(async move {
                let (mut successful, mut failed) = (0usize, 0usize);
                for _ in 0..operations {
                    let result = documents
                        .mutate_document("counter", |mut data| {
                            let value = data.get("value").and_then(|v| v.as_i64()).unwrap_or(0);
                            data.insert("value".into(), json!(value + 1));
                            Some(data)
                        })
                        .await;
                    match result {
                        Ok(_) => successful += 1,
                        Err(_) => failed += 1,
                    }
                }
                (successful, failed)
            })
        })
        .collect();

    let (mut successful, mut failed) = (0, 0);
    for task in tasks {
        let (s, f) = task.await.expect("Stress task panicked");
        successful += s;
        failed += f;
    }
    let duration = start.elapsed();

    let snapshot = clients[0]
        .documents()
        .open_existing("counter")
        .await
        .expect("Failed to open counter")
        .snapshot();
    let value = snapshot
        .data
        .unwrap_or_default()
        .get("value")
        .and_then(|v| v.as_i64())
        .unwrap_or(0);

    (StressTestResult::new(successful, failed, duration), value)
}

/// Has every client append to one shared list concurrently.
///
/// Returns the run result and the indices the authority assigned.
pub async fn stress_concurrent_appends(
    bed: &TestBed,
    config: &StressConfig,
) -> (StressTestResult, Vec<u64>) {
    let mut clients = Vec::with_capacity(config.clients);
    for i in 0..config.clients {
        clients.push(bed.client(&format!("appender-{i}")).await);
    }
    clients[0]
        .lists()
        .open_or_create("log", None)
        .await
        .expect("Failed to create list");

    let start = Instant::now();
    let tasks: Vec<_> = clients
        .iter()
        .enumerate()
        .map(|(writer, client)| {
            let lists = client.lists();
            let operations = config.operations_per_client;
            tokio::spawn(async move {
                let mut indices = Vec::with_capacity(operations);
                let mut failed = 0usize;
                for n in 0..operations {
                    match lists
                        .add_list_item("log", object(json!({ "writer": writer, "n": n })))
                        .await
                    {
                        Ok(item) => indices.extend(item.index()),
                        Err(_) => failed += 1,
                    }
                }
                (indices, failed)
            })
        })
        .collect();

    let mut indices = Vec::new();
    let mut failed = 0;
    for task in tasks {
        let (mut assigned, f) = task.await.expect("Stress task panicked");
        indices.append(&mut assigned);
        failed += f;
    }
    let result = StressTestResult::new(indices.len(), failed, start.elapsed());
    indices.sort_unstable();
    (result, indices)
}
