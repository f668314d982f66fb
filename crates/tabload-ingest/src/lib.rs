//! Tabload Ingest Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Streaming loader for large tab-delimited extracts, one file per
//! partition. Rows are normalized against the partition's schema, written
//! in bounded-concurrency batches to a staging table, checked against the
//! expected line count and then promoted to production.
//!
//! # Components
//!
//! - **Normalizer** ([`normalizer`]): raw row to typed record
//! - **Accumulator** ([`batch`]): fixed-size batching
//! - **Writer pool** ([`writer`]): bounded concurrency, retry, timeouts
//! - **Coordinator** ([`coordinator`]): per-file state machine
//! - **Verifier** ([`verifier`]) and **cutover** ([`cutover`])
//! - **Ledger** ([`ledger`]): durable per-file state with claim leases
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use tabload_ingest::coordinator::{CoordinatorOptions, IngestCoordinator};
//! use tabload_ingest::ledger::MemoryLedger;
//! use tabload_ingest::notify::LogNotifier;
//! use tabload_ingest::schema::PartitionRegistry;
//! use tabload_ingest::store::MemoryStore;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let registry = Arc::new(PartitionRegistry::load("catalog.json".as_ref())?);
//!     let coordinator = IngestCoordinator::new(
//!         registry,
//!         Arc::new(MemoryLedger::new()),
//!         Arc::new(MemoryStore::new()),
//!         Arc::new(LogNotifier),
//!         CoordinatorOptions::default(),
//!     );
//!     let summary = coordinator.run_file("data/01--CA--VOTERS.tab".as_ref()).await;
//!     println!("{:?}", summary.state);
//!     Ok(())
//! }
//! ```

pub mod batch;
pub mod config;
pub mod coordinator;
pub mod cutover;
pub mod discovery;
pub mod error;
pub mod ledger;
pub mod normalizer;
pub mod notify;
pub mod runner;
pub mod schema;
pub mod source;
pub mod store;
pub mod types;
pub mod verifier;
pub mod writer;

pub use config::IngestConfig;
pub use coordinator::{IngestCoordinator, JobState, JobSummary};
pub use error::{IngestError, Result};
pub use runner::{FileBounds, IngestRunner};
