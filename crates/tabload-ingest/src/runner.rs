// Multi-file ingest runs

use futures::stream::{self, StreamExt};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

use crate::coordinator::{IngestCoordinator, JobSummary};
use crate::discovery::SourceFile;

/// Which slice of the ordered file list to load
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileBounds {
    pub start: usize,
    /// Inclusive
    pub end: Option<usize>,
}

impl FileBounds {
    pub fn all() -> Self {
        Self {
            start: 0,
            end: None,
        }
    }

    /// Bounds for a run; a run over one named file ignores the index bounds
    pub fn for_run(start: usize, end: Option<usize>, named_file: bool) -> Self {
        if named_file {
            Self::all()
        } else {
            Self { start, end }
        }
    }

    pub fn contains(&self, index: usize) -> bool {
        index >= self.start && self.end.map_or(true, |end| index <= end)
    }
}

impl Default for FileBounds {
    fn default() -> Self {
        Self::all()
    }
}

pub struct IngestRunner {
    coordinator: Arc<IngestCoordinator>,
    bounds: FileBounds,
    job_concurrency: usize,
}

impl IngestRunner {
    pub fn new(coordinator: Arc<IngestCoordinator>, bounds: FileBounds, job_concurrency: usize) -> Self {
        Self {
            coordinator,
            bounds,
            job_concurrency: job_concurrency.max(1),
        }
    }

    /// Run every file within bounds; one summary per file, in input order
    ///
    /// Files of one partition share a staging table, so they run one after
    /// another in input order; up to `job_concurrency` partitions run at once.
    pub async fn run(&self, files: &[SourceFile]) -> Vec<JobSummary> {
        let selected: Vec<&SourceFile> = files
            .iter()
            .enumerate()
            .filter(|(i, _)| self.bounds.contains(*i))
            .map(|(_, f)| f)
            .collect();

        info!(
            files = selected.len(),
            available = files.len(),
            start = self.bounds.start,
            end = ?self.bounds.end,
            job_concurrency = self.job_concurrency,
            "Starting ingest run"
        );

        let lanes = partition_lanes(selected);
        let mut summaries: Vec<(usize, JobSummary)> = stream::iter(lanes)
            .map(|lane| {
                let coordinator = self.coordinator.clone();
                async move {
                    let mut done = Vec::with_capacity(lane.len());
                    for (order, file) in lane {
                        done.push((order, coordinator.run_file(&file.path).await));
                    }
                    done
                }
            })
            .buffer_unordered(self.job_concurrency)
            .flat_map(stream::iter)
            .collect()
            .await;

        summaries.sort_by_key(|(order, _)| *order);
        let summaries: Vec<JobSummary> = summaries.into_iter().map(|(_, s)| s).collect();

        let failed = summaries.iter().filter(|s| s.state.is_failed()).count();
        info!(
            jobs = summaries.len(),
            failed,
            "Ingest run finished"
        );
        summaries
    }
}

/// Group files by partition, keeping input order within and across groups
fn partition_lanes(files: Vec<&SourceFile>) -> Vec<Vec<(usize, &SourceFile)>> {
    let mut lanes: Vec<Vec<(usize, &SourceFile)>> = Vec::new();
    let mut lane_of: HashMap<&str, usize> = HashMap::new();

    for (order, file) in files.into_iter().enumerate() {
        match file.partition.as_deref() {
            Some(partition) => {
                let lane = *lane_of.entry(partition).or_insert_with(|| {
                    lanes.push(Vec::new());
                    lanes.len() - 1
                });
                lanes[lane].push((order, file));
            }
            // Unrouted; the coordinator fails it on its own
            None => lanes.push(vec![(order, file)]),
        }
    }
    lanes
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_bounds_are_inclusive() {
        let bounds = FileBounds {
            start: 1,
            end: Some(3),
        };
        let picked: Vec<usize> = (0..6).filter(|i| bounds.contains(*i)).collect();
        assert_eq!(picked, vec![1, 2, 3]);
        assert!(FileBounds::all().contains(1_000));
        assert_eq!(FileBounds::for_run(4, Some(9), true), FileBounds::all());
        assert_eq!(FileBounds::for_run(4, None, false).start, 4);
    }

    #[test]
    fn test_lanes_group_by_partition() {
        let files: Vec<SourceFile> = ["01--CA--a.tab", "02--NY--b.tab", "03--CA--c.tab", "readme.tab"]
            .into_iter()
            .map(|name| SourceFile::from_path(name.into()).unwrap())
            .collect();

        let lanes: Vec<Vec<&str>> = partition_lanes(files.iter().collect())
            .into_iter()
            .map(|lane| lane.into_iter().map(|(_, f)| f.filename.as_str()).collect())
            .collect();

        assert_eq!(
            lanes,
            vec![
                vec!["01--CA--a.tab", "03--CA--c.tab"],
                vec!["02--NY--b.tab"],
                vec!["readme.tab"],
            ]
        );
    }
}
