//! Fixed-size batching of normalized records

use crate::types::{Batch, NormalizedRecord};

pub const DEFAULT_BATCH_SIZE: usize = 1000;

/// Groups records into batches of exactly `batch_size`
///
/// A completed batch takes ownership of the buffered records; the next
/// buffer is allocated fresh, so nothing handed out is ever aliased.
#[derive(Debug)]
pub struct BatchAccumulator {
    batch_size: usize,
    buffer: Vec<NormalizedRecord>,
    next_seq: u64,
}

impl BatchAccumulator {
    /// A zero batch size is treated as 1
    pub fn new(batch_size: usize) -> Self {
        let batch_size = batch_size.max(1);
        Self {
            batch_size,
            buffer: Vec::with_capacity(batch_size),
            next_seq: 0,
        }
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Records buffered but not yet emitted
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    pub fn push(&mut self, record: NormalizedRecord) -> Option<Batch> {
        self.buffer.push(record);
        if self.buffer.len() >= self.batch_size {
            Some(self.take())
        } else {
            None
        }
    }

    /// Emit whatever is left at end of stream
    pub fn flush(&mut self) -> Option<Batch> {
        if self.buffer.is_empty() {
            None
        } else {
            Some(self.take())
        }
    }

    fn take(&mut self) -> Batch {
        let records = std::mem::replace(&mut self.buffer, Vec::with_capacity(self.batch_size));
        let batch = Batch::new(self.next_seq, records);
        self.next_seq += 1;
        batch
    }
}

impl Default for BatchAccumulator {
    fn default() -> Self {
        Self::new(DEFAULT_BATCH_SIZE)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::types::Value;

    fn record(i: i64) -> NormalizedRecord {
        let mut r = NormalizedRecord::new();
        r.insert("id", Value::Integer(i));
        r
    }

    #[test]
    fn test_emits_exactly_every_n_pushes() {
        let mut acc = BatchAccumulator::new(4);
        let mut emitted_at = Vec::new();

        for i in 0..13 {
            if let Some(batch) = acc.push(record(i)) {
                assert_eq!(batch.len(), 4);
                emitted_at.push(i + 1);
            }
        }

        assert_eq!(emitted_at, vec![4, 8, 12]);
        assert_eq!(acc.pending(), 1);
    }

    #[test]
    fn test_flush_returns_partial_only_once() {
        let mut acc = BatchAccumulator::new(5);
        for i in 0..8 {
            acc.push(record(i));
        }

        let tail = acc.flush().unwrap();
        assert_eq!(tail.len(), 3);
        assert_eq!(tail.seq(), 1);
        assert!(acc.flush().is_none());
    }

    #[test]
    fn test_flush_on_exact_multiple_is_empty() {
        let mut acc = BatchAccumulator::new(2);
        assert!(acc.push(record(1)).is_none());
        assert!(acc.push(record(2)).is_some());
        assert!(acc.flush().is_none());
    }

    #[test]
    fn test_batches_preserve_row_order() {
        let mut acc = BatchAccumulator::new(3);
        acc.push(record(1));
        acc.push(record(2));
        let batch = acc.push(record(3)).unwrap();

        let ids: Vec<_> = batch
            .records()
            .iter()
            .map(|r| r.get("id").and_then(Value::as_integer).unwrap())
            .collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[test]
    fn test_zero_batch_size_is_clamped() {
        let mut acc = BatchAccumulator::new(0);
        assert_eq!(acc.batch_size(), 1);
        assert!(acc.push(record(1)).is_some());
    }
}
