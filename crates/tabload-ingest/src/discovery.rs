//! Local source discovery and ledger registration
//!
//! Source files are named `NN--PARTITION--description.tab`; the numeric
//! prefix fixes run order and the second segment names the partition.

use serde::Serialize;
use std::path::{Path, PathBuf};
use tokio::io::AsyncReadExt;
use tracing::{debug, info, warn};

use crate::error::{IngestError, Result};
use crate::ledger::JobLedger;
use crate::notify::Notifier;
use crate::schema::PartitionRegistry;

pub const SOURCE_EXTENSION: &str = "tab";

const COUNT_BUFFER: usize = 1 << 16;

/// A source file found on disk
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceFile {
    pub path: PathBuf,
    pub filename: String,
    /// Numeric prefix, if the name carries one
    pub index: Option<u64>,
    /// Uppercased second `--` segment
    pub partition: Option<String>,
}

impl SourceFile {
    pub fn from_path(path: PathBuf) -> Option<Self> {
        let filename = path.file_name()?.to_str()?.to_string();
        let mut segments = filename.split("--");
        let index = segments.next().and_then(|s| s.trim().parse().ok());
        let partition = segments
            .next()
            .map(|s| s.trim().to_uppercase())
            .filter(|s| !s.is_empty());

        Some(Self {
            path,
            filename,
            index,
            partition,
        })
    }
}

/// `*.tab` files in `dir`, ordered by numeric prefix and then name
pub async fn discover_local_files(dir: &Path) -> Result<Vec<SourceFile>> {
    let mut entries = tokio::fs::read_dir(dir)
        .await
        .map_err(|e| IngestError::source_read(dir.display(), e))?;

    let mut files = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| IngestError::source_read(dir.display(), e))?
    {
        let path = entry.path();
        let is_tab = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case(SOURCE_EXTENSION));
        let is_file = entry.file_type().await.map(|t| t.is_file()).unwrap_or(false);
        if !is_tab || !is_file {
            continue;
        }
        if let Some(file) = SourceFile::from_path(path) {
            files.push(file);
        }
    }

    files.sort_by(|a, b| {
        let ka = (a.index.is_none(), a.index, &a.filename);
        let kb = (b.index.is_none(), b.index, &b.filename);
        ka.cmp(&kb)
    });

    debug!(dir = %dir.display(), files = files.len(), "Discovered source files");
    Ok(files)
}

/// Newline count of a file, the same figure `wc -l` reports
pub async fn count_lines(path: &Path) -> Result<u64> {
    let mut file = tokio::fs::File::open(path)
        .await
        .map_err(|e| IngestError::source_read(path.display(), e))?;

    let mut buf = vec![0u8; COUNT_BUFFER];
    let mut lines = 0u64;
    loop {
        let n = file
            .read(&mut buf)
            .await
            .map_err(|e| IngestError::source_read(path.display(), e))?;
        if n == 0 {
            break;
        }
        lines += buf[..n].iter().filter(|&&b| b == b'\n').count() as u64;
    }
    Ok(lines)
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DiscoveryReport {
    pub registered: Vec<String>,
    pub already_known: Vec<String>,
    /// Files without a partition segment or with one outside the catalog
    pub unrouted: Vec<String>,
}

/// Record every local file the ledger does not know yet
pub async fn register_new_files(
    ledger: &dyn JobLedger,
    registry: &PartitionRegistry,
    dir: &Path,
    notifier: &dyn Notifier,
) -> Result<DiscoveryReport> {
    let mut report = DiscoveryReport::default();

    for file in discover_local_files(dir).await? {
        let Some(partition) = file.partition.as_deref().filter(|p| registry.contains(p)) else {
            warn!(filename = %file.filename, "No catalogued partition for file, skipping");
            report.unrouted.push(file.filename);
            continue;
        };

        if ledger.get(&file.filename).await?.is_some() {
            report.already_known.push(file.filename);
            continue;
        }

        let lines = count_lines(&file.path).await?;
        if lines == 0 {
            notifier
                .notify(&format!("{} has zero lines", file.filename))
                .await;
        }

        if ledger.register(&file.filename, partition, lines).await? {
            info!(filename = %file.filename, partition, lines, "Registered source file");
            report.registered.push(file.filename);
        } else {
            report.already_known.push(file.filename);
        }
    }

    Ok(report)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_filename_segments() {
        let file = SourceFile::from_path(PathBuf::from("/data/07--ca--VOTERFILE.tab")).unwrap();
        assert_eq!(file.index, Some(7));
        assert_eq!(file.partition.as_deref(), Some("CA"));

        let odd = SourceFile::from_path(PathBuf::from("readme.tab")).unwrap();
        assert_eq!(odd.index, None);
        assert_eq!(odd.partition, None);
    }

    #[tokio::test]
    async fn test_count_lines_matches_newlines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("01--CA--x.tab");
        tokio::fs::write(&path, "h\na\nb\nc").await.unwrap();
        assert_eq!(count_lines(&path).await.unwrap(), 3);
    }
}
