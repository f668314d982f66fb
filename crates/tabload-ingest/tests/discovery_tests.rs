//! Discovery, registration and multi-file runs

#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use common::{fast_options, rows, write_source, Harness};
use std::sync::Arc;
use tabload_ingest::coordinator::JobState;
use tabload_ingest::discovery::{discover_local_files, register_new_files};
use tabload_ingest::ledger::JobLedger;
use tabload_ingest::{FileBounds, IngestRunner};

#[tokio::test]
async fn test_files_ordered_by_numeric_prefix() {
    let h = Harness::new();
    for name in ["10--TX--C.tab", "2--CA--B.tab", "01--NY--A.tab", "notes.txt"] {
        write_source(h.dir.path(), name, &rows(0, 1)).await;
    }
    tokio::fs::create_dir(h.dir.path().join("99--CA--dir.tab"))
        .await
        .unwrap();

    let files = discover_local_files(h.dir.path()).await.unwrap();
    let names: Vec<&str> = files.iter().map(|f| f.filename.as_str()).collect();

    assert_eq!(names, vec!["01--NY--A.tab", "2--CA--B.tab", "10--TX--C.tab"]);
    assert_eq!(files[2].partition.as_deref(), Some("TX"));
}

#[tokio::test]
async fn test_registration_counts_lines_and_skips_unrouted() {
    let h = Harness::new();
    write_source(h.dir.path(), "01--CA--A.tab", &rows(0, 4)).await;
    write_source(h.dir.path(), "02--ZZ--B.tab", &rows(0, 4)).await;
    tokio::fs::write(h.dir.path().join("03--NY--EMPTY.tab"), b"")
        .await
        .unwrap();

    let report = register_new_files(h.ledger.as_ref(), &h.registry, h.dir.path(), h.notifier.as_ref())
        .await
        .unwrap();

    assert_eq!(report.registered, vec!["01--CA--A.tab", "03--NY--EMPTY.tab"]);
    assert_eq!(report.unrouted, vec!["02--ZZ--B.tab"]);

    let job = h.ledger.get("01--CA--A.tab").await.unwrap().unwrap();
    assert_eq!(job.partition_key, "CA");
    assert_eq!(job.lines, 5);
    assert!(!job.loaded);

    let alerts = h.notifier.messages().await;
    assert_eq!(alerts.len(), 1);
    assert!(alerts[0].contains("03--NY--EMPTY.tab"));

    // Second pass only reports what is already known
    let again = register_new_files(h.ledger.as_ref(), &h.registry, h.dir.path(), h.notifier.as_ref())
        .await
        .unwrap();
    assert!(again.registered.is_empty());
    assert_eq!(again.already_known.len(), 2);
}

#[tokio::test]
async fn test_runner_respects_bounds_and_continues_after_failure() {
    let h = Harness::new();
    write_source(h.dir.path(), "01--CA--A.tab", &rows(0, 3)).await;
    write_source(h.dir.path(), "02--NY--B.tab", &rows(0, 3)).await;
    write_source(h.dir.path(), "03--TX--C.tab", &rows(0, 3)).await;
    write_source(h.dir.path(), "04--CA--D.tab", &rows(10, 3)).await;
    register_new_files(h.ledger.as_ref(), &h.registry, h.dir.path(), h.notifier.as_ref())
        .await
        .unwrap();

    // Another loader holds the NY file
    h.ledger
        .claim("02--NY--B.tab", uuid::Uuid::new_v4(), std::time::Duration::from_secs(3600))
        .await
        .unwrap();

    let files = discover_local_files(h.dir.path()).await.unwrap();
    let runner = IngestRunner::new(
        Arc::new(h.coordinator(fast_options())),
        FileBounds {
            start: 1,
            end: Some(2),
        },
        2,
    );
    let summaries = runner.run(&files).await;

    let outcome: Vec<(&str, JobState)> = summaries
        .iter()
        .map(|s| (s.filename.as_str(), s.state))
        .collect();
    assert_eq!(
        outcome,
        vec![
            ("02--NY--B.tab", JobState::Failed),
            ("03--TX--C.tab", JobState::Loaded),
        ]
    );
    assert!(!h.ledger.get("01--CA--A.tab").await.unwrap().unwrap().loaded);
    assert!(!h.ledger.get("04--CA--D.tab").await.unwrap().unwrap().loaded);
}

#[tokio::test]
async fn test_named_file_ignores_index_bounds() {
    let h = Harness::new();
    write_source(h.dir.path(), "01--CA--A.tab", &rows(0, 3)).await;
    write_source(h.dir.path(), "02--NY--B.tab", &rows(0, 3)).await;
    register_new_files(h.ledger.as_ref(), &h.registry, h.dir.path(), h.notifier.as_ref())
        .await
        .unwrap();

    let mut files = discover_local_files(h.dir.path()).await.unwrap();
    files.retain(|f| f.filename == "01--CA--A.tab");

    let runner = IngestRunner::new(
        Arc::new(h.coordinator(fast_options())),
        FileBounds::for_run(1, None, true),
        1,
    );
    let summaries = runner.run(&files).await;

    assert_eq!(summaries.len(), 1);
    assert_eq!(summaries[0].state, JobState::Loaded, "{:?}", summaries[0].error);
    assert!(!h.ledger.get("02--NY--B.tab").await.unwrap().unwrap().loaded);
}
