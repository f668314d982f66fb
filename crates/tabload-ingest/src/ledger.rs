//! Job ledger: durable per-file ingest state
//!
//! One entry per source file, recording its partition, the expected line
//! count taken at discovery, and whether it has been loaded. A loader must
//! hold the entry's claim (a lease keyed by a loader id) before it may mark
//! the file loaded, so two processes never promote the same job.
//!
//! Files of one partition share a staging table, so at most one file per
//! partition holds a live claim at a time. Long loads keep their lease
//! alive with [`JobLedger::renew`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::postgres::PgPool;
use sqlx::FromRow;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::{IngestError, Result};

pub const DEFAULT_LEASE: Duration = Duration::from_secs(6 * 60 * 60);

/// One ingest job as persisted in the ledger
#[derive(Debug, Clone, PartialEq, Eq, Serialize, FromRow)]
pub struct IngestJob {
    pub filename: String,
    pub partition_key: String,
    /// Line count at discovery time, header included
    pub lines: i64,
    pub loaded: bool,
    pub claimed_by: Option<Uuid>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub loaded_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl IngestJob {
    pub fn new(filename: impl Into<String>, partition_key: impl Into<String>, lines: u64) -> Self {
        Self {
            filename: filename.into(),
            partition_key: partition_key.into(),
            lines: i64::try_from(lines).unwrap_or(i64::MAX),
            loaded: false,
            claimed_by: None,
            claimed_at: None,
            loaded_at: None,
            created_at: Utc::now(),
        }
    }

    pub fn expected_rows(&self) -> u64 {
        self.lines.max(0) as u64
    }

    fn claim_is_live(&self, now: DateTime<Utc>, lease: Duration) -> bool {
        match (self.claimed_by, self.claimed_at) {
            (Some(_), Some(at)) => chrono::Duration::from_std(lease)
                .map(|lease| at + lease > now)
                .unwrap_or(true),
            _ => false,
        }
    }
}

/// Result of [`JobLedger::claim`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimOutcome {
    Acquired,
    /// Loaded, unknown, or held by another loader
    Refused,
    /// Another file of the same partition holds a live claim
    PartitionBusy { holder: String },
}

impl ClaimOutcome {
    pub fn is_acquired(&self) -> bool {
        matches!(self, ClaimOutcome::Acquired)
    }
}

#[async_trait]
pub trait JobLedger: Send + Sync {
    /// Record a newly discovered file; returns false if it was already known
    async fn register(&self, filename: &str, partition_key: &str, lines: u64) -> Result<bool>;

    async fn get(&self, filename: &str) -> Result<Option<IngestJob>>;

    /// All jobs ordered by filename
    async fn list(&self) -> Result<Vec<IngestJob>>;

    /// Take the single-writer claim on an unloaded job. Succeeds if the job
    /// is unclaimed, already held by `owner`, or its lease has expired, and
    /// no other file of its partition holds a live claim.
    async fn claim(&self, filename: &str, owner: Uuid, lease: Duration) -> Result<ClaimOutcome>;

    /// Extend `owner`'s lease; false once the claim has been lost
    async fn renew(&self, filename: &str, owner: Uuid) -> Result<bool>;

    async fn release(&self, filename: &str, owner: Uuid) -> Result<()>;

    /// Set `loaded = true`; only the current claim holder may do this
    async fn mark_loaded(&self, filename: &str, owner: Uuid) -> Result<bool>;
}

/// Ledger backed by the `ingest_files` table
#[derive(Debug, Clone)]
pub struct PgLedger {
    pool: PgPool,
}

impl PgLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Apply pending migrations
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .map_err(IngestError::ledger)
    }
}

#[async_trait]
impl JobLedger for PgLedger {
    async fn register(&self, filename: &str, partition_key: &str, lines: u64) -> Result<bool> {
        let lines = i64::try_from(lines).map_err(IngestError::ledger)?;
        let result = sqlx::query(
            r#"
            INSERT INTO ingest_files (filename, partition_key, lines)
            VALUES ($1, $2, $3)
            ON CONFLICT (filename) DO NOTHING
            "#,
        )
        .bind(filename)
        .bind(partition_key)
        .bind(lines)
        .execute(&self.pool)
        .await
        .map_err(IngestError::ledger)?;

        Ok(result.rows_affected() == 1)
    }

    async fn get(&self, filename: &str) -> Result<Option<IngestJob>> {
        sqlx::query_as::<_, IngestJob>(
            r#"
            SELECT filename, partition_key, lines, loaded, claimed_by, claimed_at,
                   loaded_at, created_at
            FROM ingest_files
            WHERE filename = $1
            "#,
        )
        .bind(filename)
        .fetch_optional(&self.pool)
        .await
        .map_err(IngestError::ledger)
    }

    async fn list(&self) -> Result<Vec<IngestJob>> {
        sqlx::query_as::<_, IngestJob>(
            r#"
            SELECT filename, partition_key, lines, loaded, claimed_by, claimed_at,
                   loaded_at, created_at
            FROM ingest_files
            ORDER BY filename
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(IngestError::ledger)
    }

    async fn claim(&self, filename: &str, owner: Uuid, lease: Duration) -> Result<ClaimOutcome> {
        let lease_secs = lease.as_secs_f64();
        let mut tx = self.pool.begin().await.map_err(IngestError::ledger)?;

        // Serialize claims within a partition until commit
        sqlx::query(
            r#"
            SELECT pg_advisory_xact_lock(hashtext(partition_key))
            FROM ingest_files
            WHERE filename = $1
            "#,
        )
        .bind(filename)
        .execute(&mut *tx)
        .await
        .map_err(IngestError::ledger)?;

        let holder: Option<String> = sqlx::query_scalar(
            r#"
            SELECT other.filename
            FROM ingest_files other
            JOIN ingest_files target ON target.partition_key = other.partition_key
            WHERE target.filename = $1
              AND other.filename <> $1
              AND NOT other.loaded
              AND other.claimed_by IS NOT NULL
              AND other.claimed_at >= NOW() - make_interval(secs => $2)
            LIMIT 1
            "#,
        )
        .bind(filename)
        .bind(lease_secs)
        .fetch_optional(&mut *tx)
        .await
        .map_err(IngestError::ledger)?;

        if let Some(holder) = holder {
            tx.rollback().await.map_err(IngestError::ledger)?;
            return Ok(ClaimOutcome::PartitionBusy { holder });
        }

        let claimed: Option<String> = sqlx::query_scalar(
            r#"
            UPDATE ingest_files
            SET claimed_by = $2, claimed_at = NOW()
            WHERE filename = $1
              AND NOT loaded
              AND (claimed_by IS NULL
                   OR claimed_by = $2
                   OR claimed_at < NOW() - make_interval(secs => $3))
            RETURNING filename
            "#,
        )
        .bind(filename)
        .bind(owner)
        .bind(lease_secs)
        .fetch_optional(&mut *tx)
        .await
        .map_err(IngestError::ledger)?;

        tx.commit().await.map_err(IngestError::ledger)?;

        Ok(match claimed {
            Some(_) => ClaimOutcome::Acquired,
            None => ClaimOutcome::Refused,
        })
    }

    async fn renew(&self, filename: &str, owner: Uuid) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE ingest_files
            SET claimed_at = NOW()
            WHERE filename = $1 AND claimed_by = $2 AND NOT loaded
            "#,
        )
        .bind(filename)
        .bind(owner)
        .execute(&self.pool)
        .await
        .map_err(IngestError::ledger)?;

        Ok(result.rows_affected() == 1)
    }

    async fn release(&self, filename: &str, owner: Uuid) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE ingest_files
            SET claimed_by = NULL, claimed_at = NULL
            WHERE filename = $1 AND claimed_by = $2
            "#,
        )
        .bind(filename)
        .bind(owner)
        .execute(&self.pool)
        .await
        .map_err(IngestError::ledger)?;
        Ok(())
    }

    async fn mark_loaded(&self, filename: &str, owner: Uuid) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE ingest_files
            SET loaded = TRUE, loaded_at = NOW(), claimed_by = NULL, claimed_at = NULL
            WHERE filename = $1 AND claimed_by = $2 AND NOT loaded
            "#,
        )
        .bind(filename)
        .bind(owner)
        .execute(&self.pool)
        .await
        .map_err(IngestError::ledger)?;

        Ok(result.rows_affected() == 1)
    }
}

/// In-process ledger for dry runs and tests
#[derive(Debug, Default)]
pub struct MemoryLedger {
    jobs: Mutex<BTreeMap<String, IngestJob>>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace an entry verbatim
    pub async fn put(&self, job: IngestJob) {
        self.jobs.lock().await.insert(job.filename.clone(), job);
    }
}

#[async_trait]
impl JobLedger for MemoryLedger {
    async fn register(&self, filename: &str, partition_key: &str, lines: u64) -> Result<bool> {
        let mut jobs = self.jobs.lock().await;
        if jobs.contains_key(filename) {
            return Ok(false);
        }
        jobs.insert(
            filename.to_string(),
            IngestJob::new(filename, partition_key, lines),
        );
        Ok(true)
    }

    async fn get(&self, filename: &str) -> Result<Option<IngestJob>> {
        Ok(self.jobs.lock().await.get(filename).cloned())
    }

    async fn list(&self) -> Result<Vec<IngestJob>> {
        Ok(self.jobs.lock().await.values().cloned().collect())
    }

    async fn claim(&self, filename: &str, owner: Uuid, lease: Duration) -> Result<ClaimOutcome> {
        let mut jobs = self.jobs.lock().await;
        let now = Utc::now();
        let Some(partition) = jobs.get(filename).map(|j| j.partition_key.clone()) else {
            return Ok(ClaimOutcome::Refused);
        };

        let busy = jobs.values().find(|other| {
            other.filename != filename
                && other.partition_key == partition
                && !other.loaded
                && other.claim_is_live(now, lease)
        });
        if let Some(other) = busy {
            return Ok(ClaimOutcome::PartitionBusy {
                holder: other.filename.clone(),
            });
        }

        let Some(job) = jobs.get_mut(filename) else {
            return Ok(ClaimOutcome::Refused);
        };
        if job.loaded || (job.claimed_by != Some(owner) && job.claim_is_live(now, lease)) {
            return Ok(ClaimOutcome::Refused);
        }
        job.claimed_by = Some(owner);
        job.claimed_at = Some(now);
        Ok(ClaimOutcome::Acquired)
    }

    async fn renew(&self, filename: &str, owner: Uuid) -> Result<bool> {
        match self.jobs.lock().await.get_mut(filename) {
            Some(job) if !job.loaded && job.claimed_by == Some(owner) => {
                job.claimed_at = Some(Utc::now());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release(&self, filename: &str, owner: Uuid) -> Result<()> {
        if let Some(job) = self.jobs.lock().await.get_mut(filename) {
            if job.claimed_by == Some(owner) {
                job.claimed_by = None;
                job.claimed_at = None;
            }
        }
        Ok(())
    }

    async fn mark_loaded(&self, filename: &str, owner: Uuid) -> Result<bool> {
        let mut jobs = self.jobs.lock().await;
        match jobs.get_mut(filename) {
            Some(job) if !job.loaded && job.claimed_by == Some(owner) => {
                job.loaded = true;
                job.loaded_at = Some(Utc::now());
                job.claimed_by = None;
                job.claimed_at = None;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_register_is_idempotent() {
        let ledger = MemoryLedger::new();
        assert!(ledger.register("01--CA--x.tab", "CA", 10).await.unwrap());
        assert!(!ledger.register("01--CA--x.tab", "CA", 99).await.unwrap());
        assert_eq!(ledger.get("01--CA--x.tab").await.unwrap().unwrap().lines, 10);
    }

    #[tokio::test]
    async fn test_claim_is_exclusive_until_released() {
        let ledger = MemoryLedger::new();
        ledger.register("f", "CA", 1).await.unwrap();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());

        assert!(ledger.claim("f", a, DEFAULT_LEASE).await.unwrap().is_acquired());
        assert!(ledger.claim("f", a, DEFAULT_LEASE).await.unwrap().is_acquired());
        assert_eq!(
            ledger.claim("f", b, DEFAULT_LEASE).await.unwrap(),
            ClaimOutcome::Refused
        );

        ledger.release("f", a).await.unwrap();
        assert!(ledger.claim("f", b, DEFAULT_LEASE).await.unwrap().is_acquired());
    }

    #[tokio::test]
    async fn test_expired_lease_can_be_taken_over() {
        let ledger = MemoryLedger::new();
        let mut job = IngestJob::new("f", "CA", 1);
        job.claimed_by = Some(Uuid::new_v4());
        job.claimed_at = Some(Utc::now() - chrono::Duration::hours(7));
        ledger.put(job).await;

        assert!(ledger
            .claim("f", Uuid::new_v4(), DEFAULT_LEASE)
            .await
            .unwrap()
            .is_acquired());
    }

    #[tokio::test]
    async fn test_only_claim_holder_marks_loaded() {
        let ledger = MemoryLedger::new();
        ledger.register("f", "CA", 1).await.unwrap();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        ledger.claim("f", a, DEFAULT_LEASE).await.unwrap();

        assert!(!ledger.mark_loaded("f", b).await.unwrap());
        assert!(ledger.mark_loaded("f", a).await.unwrap());

        let job = ledger.get("f").await.unwrap().unwrap();
        assert!(job.loaded);
        assert!(job.claimed_by.is_none());
        assert!(!ledger.claim("f", a, DEFAULT_LEASE).await.unwrap().is_acquired());
        assert!(!ledger.renew("f", a).await.unwrap());
    }

    #[tokio::test]
    async fn test_one_live_claim_per_partition() {
        let ledger = MemoryLedger::new();
        ledger.register("01--CA--a.tab", "CA", 1).await.unwrap();
        ledger.register("02--CA--b.tab", "CA", 1).await.unwrap();
        ledger.register("03--NY--c.tab", "NY", 1).await.unwrap();
        let owner = Uuid::new_v4();

        assert!(ledger.claim("01--CA--a.tab", owner, DEFAULT_LEASE).await.unwrap().is_acquired());
        // Same owner still may not load two CA files at once
        assert_eq!(
            ledger.claim("02--CA--b.tab", owner, DEFAULT_LEASE).await.unwrap(),
            ClaimOutcome::PartitionBusy {
                holder: "01--CA--a.tab".to_string()
            }
        );
        assert!(ledger.claim("03--NY--c.tab", owner, DEFAULT_LEASE).await.unwrap().is_acquired());

        ledger.mark_loaded("01--CA--a.tab", owner).await.unwrap();
        assert!(ledger.claim("02--CA--b.tab", owner, DEFAULT_LEASE).await.unwrap().is_acquired());
    }

    #[tokio::test]
    async fn test_renew_keeps_lease_alive() {
        let ledger = MemoryLedger::new();
        ledger.register("f", "CA", 1).await.unwrap();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let lease = Duration::from_millis(100);
        ledger.claim("f", a, lease).await.unwrap();

        for _ in 0..4 {
            tokio::time::sleep(Duration::from_millis(40)).await;
            assert!(ledger.renew("f", a).await.unwrap());
            assert!(!ledger.claim("f", b, lease).await.unwrap().is_acquired());
        }

        assert!(!ledger.renew("f", b).await.unwrap());
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(ledger.claim("f", b, lease).await.unwrap().is_acquired());
        assert!(!ledger.renew("f", a).await.unwrap());
    }
}
