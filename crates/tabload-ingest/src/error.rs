//! Error taxonomy for the ingest pipeline
//!
//! Errors are split by blast radius:
//! - [`MalformedValueError`]: one row, skipped and counted
//! - [`WriteError`]: one write attempt, retried by the writer pool
//! - [`IngestError`]: the whole job, which ends `Failed` and stays unloaded

use thiserror::Error;

use crate::cutover::CutoverError;
use crate::store::StoreError;
use tabload_common::TabloadError;

/// Result type alias for job-level operations
pub type Result<T> = std::result::Result<T, IngestError>;

/// A single row could not be normalized
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MalformedValueError {
    #[error("field {field}: '{value}' is not an integer")]
    InvalidInteger { field: String, value: String },

    #[error("field {field}: '{value}' is not a recognised timestamp")]
    InvalidTimestamp { field: String, value: String },

    #[error("field {field}: '{value}' is not a valid coordinate")]
    InvalidCoordinate { field: String, value: String },

    #[error("required field {0} is empty")]
    MissingRequired(String),
}

/// One failed attempt at persisting a batch
#[derive(Error, Debug, Clone, PartialEq)]
pub enum WriteError {
    #[error("write timed out after {after_secs:.1}s")]
    Timeout { after_secs: f64 },

    #[error("write failed: {0}")]
    Store(String),
}

/// Job-level failure; the job ends `Failed` and is left `loaded = false`
#[derive(Error, Debug)]
pub enum IngestError {
    #[error("failed to read source {path}: {message}")]
    SourceRead { path: String, message: String },

    #[error("unknown partition '{0}'")]
    UnknownPartition(String),

    #[error("invalid identifier '{0}'")]
    InvalidIdentifier(String),

    #[error("schema error: {0}")]
    Schema(String),

    #[error("{0} is not registered in the job ledger")]
    NotRegistered(String),

    #[error("{0} is claimed by another loader")]
    AlreadyClaimed(String),

    #[error("partition {partition} is busy: {holder} is being loaded")]
    PartitionBusy { partition: String, holder: String },

    #[error("{0} lost its ledger claim to another loader")]
    ClaimLost(String),

    #[error(
        "verification shortfall for {partition}: expected {expected}, persisted {persisted}, \
         short by {short_by} (slack {slack})"
    )]
    VerificationShortfall {
        partition: String,
        expected: u64,
        persisted: u64,
        short_by: u64,
        slack: u64,
    },

    #[error("refusing cutover for {partition}: expected {expected} rows, staging holds {persisted}")]
    EmptyLoad {
        partition: String,
        expected: u64,
        persisted: u64,
    },

    #[error(transparent)]
    Cutover(#[from] CutoverError),

    #[error("ledger error: {0}")]
    Ledger(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("writer pool is closed")]
    PoolClosed,

    #[error(transparent)]
    Common(#[from] TabloadError),
}

impl IngestError {
    pub(crate) fn source_read(path: impl std::fmt::Display, err: impl std::fmt::Display) -> Self {
        IngestError::SourceRead {
            path: path.to_string(),
            message: err.to_string(),
        }
    }

    pub(crate) fn ledger(err: impl std::fmt::Display) -> Self {
        IngestError::Ledger(err.to_string())
    }
}
