//! Shared fixtures for the ingest integration tests

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tabload_ingest::coordinator::{CoordinatorOptions, IngestCoordinator};
use tabload_ingest::ledger::{JobLedger, MemoryLedger};
use tabload_ingest::notify::Notifier;
use tabload_ingest::schema::{CatalogFile, PartitionRegistry};
use tabload_ingest::store::MemoryStore;
use tabload_ingest::writer::WritePolicy;
use tokio::sync::Mutex;
use tracing_subscriber::{fmt, EnvFilter};

pub const HEADER: &str = "LALVOTERID\tVoters_FirstName\tVoters_Age\tCity\tUnused";

pub fn init_tracing() {
    let _ = fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,tabload_ingest=debug")),
        )
        .with_test_writer()
        .try_init();
}

/// Collects every alert for later assertions
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    messages: Mutex<Vec<String>>,
}

impl RecordingNotifier {
    pub async fn messages(&self) -> Vec<String> {
        self.messages.lock().await.clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, message: &str) {
        self.messages.lock().await.push(message.to_string());
    }
}

pub fn registry() -> Arc<PartitionRegistry> {
    let catalog: CatalogFile = serde_json::from_value(serde_json::json!({
        "table_prefix": "voter",
        "fields": [
            {"name": "LALVOTERID", "type": "string", "required": true},
            {"name": "Voters_FirstName", "type": "string", "required": true},
            {"name": "Voters_Age", "type": "integer"},
            {"name": "City", "type": "string"}
        ],
        "natural_key": ["LALVOTERID"],
        "partitions": ["CA", "NY", "TX"]
    }))
    .unwrap();
    Arc::new(PartitionRegistry::from_catalog(catalog).unwrap())
}

/// `n` well-formed rows with ids starting at `first`
pub fn rows(first: usize, n: usize) -> Vec<String> {
    (first..first + n)
        .map(|i| format!("LAL{:06}\tName{}\t{}\tSpringfield (EST.)\tjunk", i, i, 20 + i % 60))
        .collect()
}

/// Write a source file and return its path
pub async fn write_source(dir: &Path, filename: &str, rows: &[String]) -> PathBuf {
    let mut body = String::from(HEADER);
    body.push('\n');
    for row in rows {
        body.push_str(row);
        body.push('\n');
    }
    let path = dir.join(filename);
    tokio::fs::write(&path, body).await.unwrap();
    path
}

pub fn fast_options() -> CoordinatorOptions {
    CoordinatorOptions {
        batch_size: 5,
        write_policy: WritePolicy {
            max_in_flight: 2,
            max_attempts: 3,
            attempt_timeout: Duration::from_secs(5),
            retry_delay: Duration::from_millis(1),
        },
        verify_slack: 1,
        ..CoordinatorOptions::default()
    }
}

pub struct Harness {
    pub dir: tempfile::TempDir,
    pub registry: Arc<PartitionRegistry>,
    pub ledger: Arc<MemoryLedger>,
    pub store: Arc<MemoryStore>,
    pub notifier: Arc<RecordingNotifier>,
}

impl Harness {
    pub fn new() -> Self {
        init_tracing();
        Self {
            dir: tempfile::tempdir().unwrap(),
            registry: registry(),
            ledger: Arc::new(MemoryLedger::new()),
            store: Arc::new(MemoryStore::new()),
            notifier: Arc::new(RecordingNotifier::default()),
        }
    }

    pub fn with_store(mut self, store: MemoryStore) -> Self {
        self.store = Arc::new(store);
        self
    }

    pub fn coordinator(&self, options: CoordinatorOptions) -> IngestCoordinator {
        IngestCoordinator::new(
            self.registry.clone(),
            self.ledger.clone(),
            self.store.clone(),
            self.notifier.clone(),
            options,
        )
    }

    /// Write a source file and register it with the given expected line count
    pub async fn source(&self, filename: &str, rows: &[String], lines: u64) -> PathBuf {
        let path = write_source(self.dir.path(), filename, rows).await;
        let partition = filename.split("--").nth(1).unwrap();
        self.ledger.register(filename, partition, lines).await.unwrap();
        path
    }
}
