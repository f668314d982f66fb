//! Batch writer pool
//!
//! At most `max_in_flight` writes run at once. [`BatchWriterPool::submit`]
//! waits for a free slot before dispatching, which is what throttles the
//! reader when the sink is slower than the source. A slot stays taken for
//! the whole life of a batch, retries included.
//!
//! Each attempt is bounded by a timeout. A timed-out attempt is abandoned
//! and retried even though the first may still land; the sink's
//! skip-on-conflict insert makes that safe.

use futures::FutureExt;
use serde::Serialize;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::error::{IngestError, Result, WriteError};
use crate::schema::PartitionRoute;
use crate::store::BatchSink;
use crate::types::Batch;

pub const DEFAULT_MAX_IN_FLIGHT: usize = 5;
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Concurrency and retry knobs for one pool
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WritePolicy {
    pub max_in_flight: usize,
    pub max_attempts: u32,
    pub attempt_timeout: Duration,
    /// Delay before retry `n` is `retry_delay * n`
    pub retry_delay: Duration,
}

impl Default for WritePolicy {
    fn default() -> Self {
        Self {
            max_in_flight: DEFAULT_MAX_IN_FLIGHT,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            attempt_timeout: DEFAULT_ATTEMPT_TIMEOUT,
            retry_delay: DEFAULT_RETRY_DELAY,
        }
    }
}

/// Per-job row accounting, shared by the coordinator and every write task
#[derive(Debug, Default)]
pub struct JobCounters {
    total: AtomicU64,
    success: AtomicU64,
    failed: AtomicU64,
    inserted: AtomicU64,
    failed_batches: AtomicU64,
    skipped: AtomicU64,
    malformed: AtomicU64,
}

/// Point-in-time copy of [`JobCounters`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct JobCounts {
    /// Rows read after the resume offset
    pub total: u64,
    /// Rows in batches that were persisted
    pub success: u64,
    /// Rows in batches that exhausted their retries
    pub failed: u64,
    /// Rows newly inserted (duplicates of existing keys excluded)
    pub inserted: u64,
    pub failed_batches: u64,
    /// Rows discarded by the resume offset
    pub skipped: u64,
    /// Rows rejected by the normalizer
    pub malformed: u64,
}

impl JobCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_row(&self) {
        self.total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_malformed(&self) -> u64 {
        self.malformed.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn add_skipped(&self, rows: u64) {
        self.skipped.fetch_add(rows, Ordering::Relaxed);
    }

    fn apply(&self, outcome: &WriteOutcome) {
        match *outcome {
            WriteOutcome::Written { rows, inserted, .. } => {
                self.success.fetch_add(rows, Ordering::Relaxed);
                self.inserted.fetch_add(inserted, Ordering::Relaxed);
            }
            WriteOutcome::Failed { rows, .. } => {
                self.failed.fetch_add(rows, Ordering::Relaxed);
                self.failed_batches.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub fn snapshot(&self) -> JobCounts {
        JobCounts {
            total: self.total.load(Ordering::Relaxed),
            success: self.success.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            inserted: self.inserted.load(Ordering::Relaxed),
            failed_batches: self.failed_batches.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
        }
    }
}

/// Final state of one batch
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOutcome {
    Written {
        seq: u64,
        rows: u64,
        inserted: u64,
        attempts: u32,
    },
    Failed {
        seq: u64,
        rows: u64,
        attempts: u32,
        error: WriteError,
    },
}

impl WriteOutcome {
    pub fn is_written(&self) -> bool {
        matches!(self, WriteOutcome::Written { .. })
    }

    pub fn seq(&self) -> u64 {
        match *self {
            WriteOutcome::Written { seq, .. } | WriteOutcome::Failed { seq, .. } => seq,
        }
    }
}

/// Persist one batch into the route's staging table, retrying per `policy`
pub async fn write_with_retry(
    sink: &dyn BatchSink,
    route: &PartitionRoute,
    batch: &Batch,
    policy: &WritePolicy,
) -> WriteOutcome {
    let seq = batch.seq();
    let rows = batch.len() as u64;
    let max_attempts = policy.max_attempts.max(1);
    let mut last_error = WriteError::Store("no attempt made".into());

    for attempt in 1..=max_attempts {
        debug!(
            partition = %route.key,
            batch = seq,
            batch_rows = rows,
            attempt,
            "Writing batch"
        );

        let result = tokio::time::timeout(
            policy.attempt_timeout,
            sink.insert_batch(&route.tables.staging, &route.schema, batch.records()),
        )
        .await;

        let err = match result {
            Ok(Ok(inserted)) => {
                return WriteOutcome::Written {
                    seq,
                    rows,
                    inserted,
                    attempts: attempt,
                }
            }
            Ok(Err(e)) => WriteError::Store(e.to_string()),
            Err(_) => WriteError::Timeout {
                after_secs: policy.attempt_timeout.as_secs_f64(),
            },
        };

        if attempt < max_attempts {
            let delay = policy.retry_delay * attempt;
            warn!(
                partition = %route.key,
                batch = seq,
                attempt,
                max_attempts,
                error = %err,
                "Batch write failed, retrying in {:?}",
                delay
            );
            tokio::time::sleep(delay).await;
        } else {
            error!(
                partition = %route.key,
                batch = seq,
                batch_rows = rows,
                attempts = max_attempts,
                error = %err,
                "Batch write failed after all attempts"
            );
        }
        last_error = err;
    }

    WriteOutcome::Failed {
        seq,
        rows,
        attempts: max_attempts,
        error: last_error,
    }
}

/// Aggregate returned by [`BatchWriterPool::drain`]
#[derive(Debug, Clone, Default)]
pub struct WriteReport {
    pub outcomes: Vec<WriteOutcome>,
}

impl WriteReport {
    pub fn batches_written(&self) -> usize {
        self.outcomes.iter().filter(|o| o.is_written()).count()
    }

    pub fn batches_failed(&self) -> usize {
        self.outcomes.len() - self.batches_written()
    }

    pub fn rows_failed(&self) -> u64 {
        self.outcomes
            .iter()
            .map(|o| match *o {
                WriteOutcome::Failed { rows, .. } => rows,
                WriteOutcome::Written { .. } => 0,
            })
            .sum()
    }
}

/// Bounded-concurrency writer for one partition's staging table
pub struct BatchWriterPool {
    sink: Arc<dyn BatchSink>,
    route: Arc<PartitionRoute>,
    policy: WritePolicy,
    counters: Arc<JobCounters>,
    permits: Arc<Semaphore>,
    tasks: JoinSet<WriteOutcome>,
    outcomes: Vec<WriteOutcome>,
}

impl BatchWriterPool {
    pub fn new(
        sink: Arc<dyn BatchSink>,
        route: Arc<PartitionRoute>,
        policy: WritePolicy,
        counters: Arc<JobCounters>,
    ) -> Self {
        let slots = policy.max_in_flight.max(1);
        Self {
            sink,
            route,
            policy,
            counters,
            permits: Arc::new(Semaphore::new(slots)),
            tasks: JoinSet::new(),
            outcomes: Vec::new(),
        }
    }

    /// Dispatch a batch, first waiting for a free write slot
    pub async fn submit(&mut self, batch: Batch) -> Result<()> {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| IngestError::PoolClosed)?;

        self.reap();

        let sink = self.sink.clone();
        let route = self.route.clone();
        let policy = self.policy;
        let counters = self.counters.clone();

        self.tasks.spawn(async move {
            let _permit = permit;
            let seq = batch.seq();
            let rows = batch.len() as u64;

            let outcome = AssertUnwindSafe(write_with_retry(sink.as_ref(), &route, &batch, &policy))
                .catch_unwind()
                .await
                .unwrap_or_else(|_| WriteOutcome::Failed {
                    seq,
                    rows,
                    attempts: 0,
                    error: WriteError::Store("write task panicked".into()),
                });

            counters.apply(&outcome);
            if outcome.is_written() {
                let counts = counters.snapshot();
                info!(
                    partition = %route.key,
                    batch = seq,
                    batch_rows = rows,
                    total = counts.total,
                    success = counts.success,
                    failed = counts.failed,
                    "Batch written"
                );
            }
            outcome
        });

        Ok(())
    }

    fn reap(&mut self) {
        while let Some(joined) = self.tasks.try_join_next() {
            self.collect(joined);
        }
    }

    fn collect(&mut self, joined: std::result::Result<WriteOutcome, tokio::task::JoinError>) {
        match joined {
            Ok(outcome) => self.outcomes.push(outcome),
            Err(e) => error!(partition = %self.route.key, error = %e, "Write task aborted"),
        }
    }

    /// Wait for every dispatched batch and return all outcomes
    pub async fn drain(mut self) -> WriteReport {
        while let Some(joined) = self.tasks.join_next().await {
            self.collect(joined);
        }
        self.permits.close();

        let mut outcomes = std::mem::take(&mut self.outcomes);
        outcomes.sort_by_key(WriteOutcome::seq);
        WriteReport { outcomes }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::schema::{FieldSpec, FieldType, PartitionSchema, TableNames};
    use crate::store::{MemoryStore, TableCatalog};
    use crate::types::{NormalizedRecord, Value};

    fn route() -> Arc<PartitionRoute> {
        let schema = PartitionSchema::new(
            vec![FieldSpec::new("id", FieldType::Integer)],
            vec!["id".into()],
        )
        .unwrap();
        Arc::new(PartitionRoute {
            key: "CA".into(),
            schema: Arc::new(schema),
            tables: TableNames::for_partition("t", "CA").unwrap(),
        })
    }

    fn batch(seq: u64, ids: std::ops::Range<i64>) -> Batch {
        let records = ids
            .map(|i| {
                let mut r = NormalizedRecord::new();
                r.insert("id", Value::Integer(i));
                r
            })
            .collect();
        Batch::new(seq, records)
    }

    fn fast_policy() -> WritePolicy {
        WritePolicy {
            retry_delay: Duration::from_millis(1),
            attempt_timeout: Duration::from_secs(5),
            ..WritePolicy::default()
        }
    }

    async fn store_with_staging(route: &PartitionRoute) -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        store.ensure_staging(route).await.unwrap();
        store
    }

    #[tokio::test]
    async fn test_two_failures_then_success_counts_as_success() {
        let route = route();
        let store = store_with_staging(&route).await;
        store.fail_next_writes(2);

        let outcome = write_with_retry(store.as_ref(), &route, &batch(0, 0..5), &fast_policy()).await;

        assert_eq!(
            outcome,
            WriteOutcome::Written {
                seq: 0,
                rows: 5,
                inserted: 5,
                attempts: 3
            }
        );
        assert_eq!(store.insert_calls(), 3);
    }

    #[tokio::test]
    async fn test_exhausted_retries_surface_failure() {
        let route = route();
        let store = store_with_staging(&route).await;
        store.fail_next_writes(3);

        let outcome = write_with_retry(store.as_ref(), &route, &batch(7, 0..4), &fast_policy()).await;

        assert!(matches!(
            outcome,
            WriteOutcome::Failed {
                seq: 7,
                rows: 4,
                attempts: 3,
                error: WriteError::Store(_)
            }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_attempt_times_out_and_retries() {
        let route = route();
        let store = store_with_staging(&route).await;
        store.hang_next_writes(1);

        let policy = WritePolicy {
            attempt_timeout: Duration::from_secs(60),
            ..fast_policy()
        };
        let outcome = write_with_retry(store.as_ref(), &route, &batch(0, 0..3), &policy).await;

        assert!(matches!(outcome, WriteOutcome::Written { attempts: 2, .. }));
    }

    #[tokio::test]
    async fn test_pool_counts_rows_after_drain() {
        let route = route();
        let store = store_with_staging(&route).await;
        let counters = Arc::new(JobCounters::new());
        let mut pool = BatchWriterPool::new(store.clone(), route.clone(), fast_policy(), counters.clone());

        pool.submit(batch(0, 0..5)).await.unwrap();
        pool.submit(batch(1, 5..8)).await.unwrap();
        let report = pool.drain().await;

        assert_eq!(report.batches_written(), 2);
        assert_eq!(report.outcomes[0].seq(), 0);
        let counts = counters.snapshot();
        assert_eq!(counts.success, 8);
        assert_eq!(counts.failed, 0);
        assert_eq!(store.count_rows(&route.tables.staging).await.unwrap(), 8);
    }
}
