//! Tab-delimited source reader
//!
//! Reads the header row once, keeps only the columns the partition schema
//! declares, and then yields one [`SourceRecord`] per data row. Rows are
//! decoded lossily; the normalizer rejects anything that fails to type.

use csv_async::{AsyncReader, AsyncReaderBuilder, ByteRecord};
use std::path::Path;
use std::sync::Arc;
use tokio::io::AsyncRead;
use tracing::{debug, info};

use crate::error::{IngestError, Result};
use crate::schema::PartitionSchema;
use crate::types::SourceRecord;

const READ_BUFFER: usize = 1 << 20;
const SKIP_PROGRESS_EVERY: u64 = 10_000;

/// Streaming reader over one tab-separated file
pub struct TabSource<R> {
    label: String,
    reader: AsyncReader<R>,
    /// Source column index for each retained header
    columns: Vec<usize>,
    headers: Arc<[String]>,
    record: ByteRecord,
    rows_read: u64,
}

impl TabSource<tokio::fs::File> {
    pub async fn open(path: &Path, schema: &PartitionSchema) -> Result<Self> {
        let file = tokio::fs::File::open(path)
            .await
            .map_err(|e| IngestError::source_read(path.display(), e))?;
        Self::from_reader(file, schema, path.display().to_string()).await
    }
}

impl<R> TabSource<R>
where
    R: AsyncRead + Unpin + Send,
{
    pub async fn from_reader(
        reader: R,
        schema: &PartitionSchema,
        label: impl Into<String>,
    ) -> Result<Self> {
        let label = label.into();
        let mut reader = AsyncReaderBuilder::new()
            .delimiter(b'\t')
            .has_headers(true)
            .flexible(true)
            .quoting(false)
            .buffer_capacity(READ_BUFFER)
            .create_reader(reader);

        let raw_headers = reader
            .byte_headers()
            .await
            .map_err(|e| IngestError::source_read(&label, e))?
            .clone();

        let mut columns = Vec::new();
        let mut headers = Vec::new();
        for (index, raw) in raw_headers.iter().enumerate() {
            let name = String::from_utf8_lossy(raw);
            let name = name.trim().trim_start_matches('\u{feff}');
            if schema.contains(name) && !headers.iter().any(|h| h == name) {
                columns.push(index);
                headers.push(name.to_string());
            }
        }

        debug!(
            source = %label,
            columns = raw_headers.len(),
            retained = headers.len(),
            "Filtered source headers against schema"
        );

        Ok(Self {
            label,
            reader,
            columns,
            headers: headers.into(),
            record: ByteRecord::new(),
            rows_read: 0,
        })
    }

    /// Header names retained after schema filtering, in source order
    pub fn headers(&self) -> &[String] {
        &self.headers
    }

    /// Data rows consumed so far, skipped rows included
    pub fn rows_read(&self) -> u64 {
        self.rows_read
    }

    async fn advance(&mut self) -> Result<bool> {
        let more = self
            .reader
            .read_byte_record(&mut self.record)
            .await
            .map_err(|e| IngestError::source_read(&self.label, e))?;
        if more {
            self.rows_read += 1;
        }
        Ok(more)
    }

    pub async fn next_record(&mut self) -> Result<Option<SourceRecord>> {
        if !self.advance().await? {
            return Ok(None);
        }

        let values = self
            .columns
            .iter()
            .map(|&i| {
                self.record
                    .get(i)
                    .map(|raw| String::from_utf8_lossy(raw).into_owned())
            })
            .collect();

        Ok(Some(SourceRecord::new(self.headers.clone(), values)))
    }

    /// Discard up to `n` rows without decoding them; returns how many were
    /// actually skipped, which is less than `n` only at end of input
    pub async fn skip(&mut self, n: u64) -> Result<u64> {
        let mut skipped = 0;
        while skipped < n {
            if !self.advance().await? {
                break;
            }
            skipped += 1;
            if skipped % SKIP_PROGRESS_EVERY == 0 {
                info!(source = %self.label, skipped, requested = n, "Skipping rows");
            }
        }
        Ok(skipped)
    }
}
