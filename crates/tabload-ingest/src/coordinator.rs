//! Ingest coordinator: drives one source file through the pipeline
//!
//! ```text
//! Pending -> Skipping(n) -> Streaming -> Draining -> Verifying -> Cutover -> Loaded
//!     \                                                   \
//!      -> Skipped (already loaded)                          -> Failed
//! ```
//!
//! A job that fails keeps `loaded = false` and its staging table, so a
//! later run (optionally with a resume offset) can pick it up again.
//!
//! The ledger claim is renewed in the background for as long as the job
//! runs, and is confirmed once more before cutover.

use serde::Serialize;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::AsyncRead;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::batch::{BatchAccumulator, DEFAULT_BATCH_SIZE};
use crate::cutover::{CutoverManager, CutoverReport};
use crate::error::{IngestError, Result};
use crate::ledger::{ClaimOutcome, JobLedger, DEFAULT_LEASE};
use crate::normalizer::{NormalizeOptions, RowNormalizer};
use crate::notify::Notifier;
use crate::schema::{PartitionRegistry, PartitionRoute};
use crate::source::TabSource;
use crate::store::{BatchSink, TableCatalog};
use crate::verifier::{CompletenessVerifier, Verification, DEFAULT_SLACK};
use crate::writer::{BatchWriterPool, JobCounters, JobCounts, WritePolicy};

/// Malformed rows logged at warn level before dropping to debug
const MALFORMED_WARN_LIMIT: u64 = 10;

/// Lease renewals per lease period
const RENEWALS_PER_LEASE: u32 = 3;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoordinatorOptions {
    pub batch_size: usize,
    pub write_policy: WritePolicy,
    pub normalize: NormalizeOptions,
    /// Rows to discard from the start of the source
    pub resume: u64,
    pub verify_slack: u64,
    /// Empty the staging table before streaming
    pub truncate_staging: bool,
    /// Yield to the scheduler after this many rows; 0 disables
    pub yield_every: u64,
    pub lease: Duration,
}

impl Default for CoordinatorOptions {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            write_policy: WritePolicy::default(),
            normalize: NormalizeOptions::default(),
            resume: 0,
            verify_slack: DEFAULT_SLACK,
            truncate_staging: false,
            yield_every: 1000,
            lease: DEFAULT_LEASE,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "rows", rename_all = "snake_case")]
pub enum JobState {
    Pending,
    Skipping(u64),
    Streaming,
    Draining,
    Verifying,
    Cutover,
    /// Promoted and marked loaded
    Loaded,
    /// Already loaded by an earlier run
    Skipped,
    Failed,
}

impl JobState {
    pub fn is_failed(self) -> bool {
        self == JobState::Failed
    }
}

/// Per-job outcome, produced for every job whether it succeeded or not
#[derive(Debug, Clone, Serialize)]
pub struct JobSummary {
    pub filename: String,
    pub partition: Option<String>,
    pub state: JobState,
    pub counts: JobCounts,
    pub verification: Option<Verification>,
    pub cutover: Option<CutoverReport>,
    pub error: Option<String>,
    pub elapsed_secs: f64,
}

impl JobSummary {
    fn new(filename: &str) -> Self {
        Self {
            filename: filename.to_string(),
            partition: None,
            state: JobState::Pending,
            counts: JobCounts::default(),
            verification: None,
            cutover: None,
            error: None,
            elapsed_secs: 0.0,
        }
    }

    fn enter(&mut self, state: JobState) {
        debug!(filename = %self.filename, from = ?self.state, to = ?state, "Job state change");
        self.state = state;
    }
}

/// Renews a ledger claim in the background until stopped or dropped
struct LeaseKeeper {
    handle: JoinHandle<()>,
    lost: Arc<AtomicBool>,
}

impl LeaseKeeper {
    fn start(ledger: Arc<dyn JobLedger>, filename: String, owner: Uuid, lease: Duration) -> Self {
        let lost = Arc::new(AtomicBool::new(false));
        let flag = lost.clone();
        let period = (lease / RENEWALS_PER_LEASE).max(Duration::from_millis(10));

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately
            ticker.tick().await;

            loop {
                ticker.tick().await;
                match ledger.renew(&filename, owner).await {
                    Ok(true) => debug!(filename = %filename, "Ledger claim renewed"),
                    Ok(false) => {
                        warn!(filename = %filename, "Ledger claim lost to another loader");
                        flag.store(true, Ordering::SeqCst);
                        break;
                    }
                    Err(e) => warn!(filename = %filename, error = %e, "Ledger claim renewal failed"),
                }
            }
        });

        Self { handle, lost }
    }

    fn is_lost(&self) -> bool {
        self.lost.load(Ordering::SeqCst)
    }

    fn stop(&self) {
        self.handle.abort();
    }
}

impl Drop for LeaseKeeper {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

pub struct IngestCoordinator {
    registry: Arc<PartitionRegistry>,
    ledger: Arc<dyn JobLedger>,
    sink: Arc<dyn BatchSink>,
    catalog: Arc<dyn TableCatalog>,
    notifier: Arc<dyn Notifier>,
    options: CoordinatorOptions,
    owner: Uuid,
}

impl IngestCoordinator {
    pub fn new<S>(
        registry: Arc<PartitionRegistry>,
        ledger: Arc<dyn JobLedger>,
        store: Arc<S>,
        notifier: Arc<dyn Notifier>,
        options: CoordinatorOptions,
    ) -> Self
    where
        S: BatchSink + TableCatalog + 'static,
    {
        Self {
            registry,
            ledger,
            sink: store.clone(),
            catalog: store,
            notifier,
            options,
            owner: Uuid::new_v4(),
        }
    }

    /// Loader id used for ledger claims
    pub fn owner(&self) -> Uuid {
        self.owner
    }

    pub fn options(&self) -> &CoordinatorOptions {
        &self.options
    }

    /// Run the pipeline for one file; never fails, the outcome is in the summary
    pub async fn run_file(&self, path: &Path) -> JobSummary {
        let started = Instant::now();
        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());

        let counters = Arc::new(JobCounters::new());
        let mut summary = JobSummary::new(&filename);

        if let Err(e) = self.run(path, &counters, &mut summary).await {
            error!(
                filename = %filename,
                partition = summary.partition.as_deref().unwrap_or("-"),
                state = ?summary.state,
                error = %e,
                "Ingest job failed"
            );
            summary.enter(JobState::Failed);
            summary.error = Some(e.to_string());
        }

        summary.counts = counters.snapshot();
        summary.elapsed_secs = started.elapsed().as_secs_f64();

        info!(
            filename = %summary.filename,
            partition = summary.partition.as_deref().unwrap_or("-"),
            state = ?summary.state,
            total = summary.counts.total,
            success = summary.counts.success,
            failed = summary.counts.failed,
            malformed = summary.counts.malformed,
            skipped = summary.counts.skipped,
            elapsed_secs = summary.elapsed_secs,
            "Ingest job finished"
        );

        summary
    }

    async fn run(
        &self,
        path: &Path,
        counters: &Arc<JobCounters>,
        summary: &mut JobSummary,
    ) -> Result<()> {
        let job = self
            .ledger
            .get(&summary.filename)
            .await?
            .ok_or_else(|| IngestError::NotRegistered(summary.filename.clone()))?;
        summary.partition = Some(job.partition_key.clone());

        if job.loaded {
            info!(filename = %job.filename, "Already loaded, skipping");
            summary.enter(JobState::Skipped);
            return Ok(());
        }

        let route = self.registry.route(&job.partition_key)?;

        let outcome = self
            .ledger
            .claim(&job.filename, self.owner, self.options.lease)
            .await?;
        match outcome {
            ClaimOutcome::Acquired => {}
            ClaimOutcome::Refused => return Err(IngestError::AlreadyClaimed(job.filename)),
            ClaimOutcome::PartitionBusy { holder } => {
                return Err(IngestError::PartitionBusy {
                    partition: job.partition_key,
                    holder,
                })
            }
        }

        let keeper = LeaseKeeper::start(
            self.ledger.clone(),
            job.filename.clone(),
            self.owner,
            self.options.lease,
        );
        let result = self
            .load_claimed(path, &route, job.expected_rows(), &keeper, counters, summary)
            .await;
        drop(keeper);

        if result.is_err() {
            if let Err(e) = self.ledger.release(&job.filename, self.owner).await {
                warn!(filename = %job.filename, error = %e, "Could not release ledger claim");
            }
        }
        result
    }

    async fn load_claimed(
        &self,
        path: &Path,
        route: &Arc<PartitionRoute>,
        expected: u64,
        keeper: &LeaseKeeper,
        counters: &Arc<JobCounters>,
        summary: &mut JobSummary,
    ) -> Result<()> {
        let normalizer = RowNormalizer::new(route.schema.clone(), self.options.normalize.clone())?;

        self.catalog.ensure_staging(route).await?;
        if self.options.truncate_staging {
            if self.options.resume > 0 {
                warn!(
                    partition = %route.key,
                    resume = self.options.resume,
                    "Truncating staging while resuming discards the rows being resumed past"
                );
            }
            self.catalog.truncate(&route.tables.staging).await?;
        }

        let mut source = TabSource::open(path, &route.schema).await?;

        if self.options.resume > 0 {
            summary.enter(JobState::Skipping(self.options.resume));
            let skipped = source.skip(self.options.resume).await?;
            counters.add_skipped(skipped);
            info!(partition = %route.key, skipped, "Resume offset applied");
        }

        summary.enter(JobState::Streaming);
        let mut pool = BatchWriterPool::new(
            self.sink.clone(),
            route.clone(),
            self.options.write_policy,
            counters.clone(),
        );
        let streamed = self
            .stream(&mut source, &normalizer, &mut pool, keeper, counters, summary)
            .await;

        let report = pool.drain().await;
        streamed?;

        let failed_batches = report.batches_failed();
        if failed_batches > 0 {
            self.notifier
                .notify(&format!(
                    "{}: {} batches ({} rows) failed to write for {}",
                    summary.filename,
                    failed_batches,
                    report.rows_failed(),
                    route.key
                ))
                .await;
        }

        summary.enter(JobState::Verifying);
        let verification = CompletenessVerifier::new(self.catalog.as_ref(), self.options.verify_slack)
            .verify(route, expected)
            .await?;
        summary.verification = Some(verification);

        if verification.is_empty() {
            let err = IngestError::EmptyLoad {
                partition: route.key.clone(),
                expected: verification.expected,
                persisted: verification.persisted,
            };
            self.notifier
                .notify(&format!("{}: {}", summary.filename, err))
                .await;
            return Err(err);
        }

        if !verification.accepted() {
            let err = IngestError::VerificationShortfall {
                partition: route.key.clone(),
                expected: verification.expected,
                persisted: verification.persisted,
                short_by: verification.verdict.shortfall(),
                slack: verification.slack,
            };
            self.notifier
                .notify(&format!("{}: {}", summary.filename, err))
                .await;
            return Err(err);
        }

        if keeper.is_lost() || !self.ledger.renew(&summary.filename, self.owner).await? {
            let err = IngestError::ClaimLost(summary.filename.clone());
            self.notifier
                .notify(&format!("{}; staging for {} was not promoted", err, route.key))
                .await;
            return Err(err);
        }

        summary.enter(JobState::Cutover);
        let cutover = CutoverManager::new(self.catalog.clone(), self.notifier.clone())
            .promote(route)
            .await?;
        summary.cutover = Some(cutover);

        keeper.stop();
        if !self.ledger.mark_loaded(&summary.filename, self.owner).await? {
            let message = format!(
                "{} was promoted but its ledger claim was lost before it could be marked loaded",
                summary.filename
            );
            self.notifier.notify(&message).await;
            return Err(IngestError::Ledger(message));
        }

        summary.enter(JobState::Loaded);
        Ok(())
    }

    /// Source -> normalizer -> accumulator -> pool; the caller drains the pool
    async fn stream<R>(
        &self,
        source: &mut TabSource<R>,
        normalizer: &RowNormalizer,
        pool: &mut BatchWriterPool,
        keeper: &LeaseKeeper,
        counters: &JobCounters,
        summary: &mut JobSummary,
    ) -> Result<()>
    where
        R: AsyncRead + Unpin + Send,
    {
        let mut accumulator = BatchAccumulator::new(self.options.batch_size);
        let mut since_yield = 0u64;

        while let Some(raw) = source.next_record().await? {
            counters.record_row();

            match normalizer.normalize(&raw) {
                Ok(record) => {
                    if let Some(batch) = accumulator.push(record) {
                        pool.submit(batch).await?;
                    }
                }
                Err(e) => {
                    let seen = counters.record_malformed();
                    let row = source.rows_read();
                    if seen <= MALFORMED_WARN_LIMIT {
                        warn!(filename = %summary.filename, row, error = %e, "Skipping malformed row");
                    } else {
                        debug!(filename = %summary.filename, row, error = %e, "Skipping malformed row");
                    }
                }
            }

            since_yield += 1;
            if self.options.yield_every > 0 && since_yield >= self.options.yield_every {
                since_yield = 0;
                if keeper.is_lost() {
                    return Err(IngestError::ClaimLost(summary.filename.clone()));
                }
                tokio::task::yield_now().await;
            }
        }

        summary.enter(JobState::Draining);
        if let Some(batch) = accumulator.flush() {
            pool.submit(batch).await?;
        }
        Ok(())
    }

    /// Promote a partition's staging table without loading anything
    pub async fn promote(&self, partition: &str) -> Result<CutoverReport> {
        let route = self.registry.route(partition)?;
        Ok(CutoverManager::new(self.catalog.clone(), self.notifier.clone())
            .promote(&route)
            .await?)
    }
}
