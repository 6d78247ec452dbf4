//! Append-only statement buffer with a delivery cursor
//!
//! Records are kept in insertion order for the lifetime of the pipeline.
//! Everything before `offset` has been accepted by the primary collector and
//! is retained only for backup mirroring; everything from `offset` onward is
//! pending.

use crate::models::Record;
use serde_json::Value;
use std::sync::Arc;
use tracing::warn;

/// A contiguous slice of pending records taken for one submission
#[derive(Clone)]
pub struct Batch {
    /// Queue index of the first record in the batch
    pub start: usize,
    pub records: Vec<Arc<dyn Record>>,
}

impl Batch {
    /// Queue index one past the last record in the batch
    pub fn end(&self) -> usize {
        self.start + self.records.len()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Render every record in the batch to its structured form
    pub fn statements(&self) -> Vec<Value> {
        self.records.iter().map(|r| r.to_statement()).collect()
    }
}

/// Ordered buffer of records plus the first not-yet-delivered index
#[derive(Default)]
pub struct DeliveryQueue {
    records: Vec<Arc<dyn Record>>,
    offset: usize,
}

impl DeliveryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a record, returning its queue position
    pub fn push(&mut self, record: Arc<dyn Record>) -> usize {
        self.records.push(record);
        self.records.len() - 1
    }

    /// Total records ever buffered
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Number of records confirmed delivered
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Number of records still awaiting delivery
    pub fn pending(&self) -> usize {
        self.records.len() - self.offset
    }

    /// The next slice `[offset, min(offset + batch_size, len))`, or `None`
    /// when nothing is pending
    pub fn next_batch(&self, batch_size: usize) -> Option<Batch> {
        if self.offset >= self.records.len() || batch_size == 0 {
            return None;
        }
        let end = (self.offset + batch_size).min(self.records.len());
        Some(Batch {
            start: self.offset,
            records: self.records[self.offset..end].to_vec(),
        })
    }

    /// Move the cursor past a delivered batch.
    ///
    /// Only a batch taken at the current offset can advance it; a stale batch
    /// leaves the cursor untouched and returns false.
    pub fn advance(&mut self, batch: &Batch) -> bool {
        if batch.start != self.offset || batch.end() > self.records.len() {
            warn!(
                batch_start = batch.start,
                offset = self.offset,
                "Ignoring delivery of stale batch"
            );
            return false;
        }
        self.offset = batch.end();
        true
    }

    /// Every buffered record, delivered and pending, in insertion order
    pub fn snapshot(&self) -> Vec<Arc<dyn Record>> {
        self.records.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Numbered(usize);

    impl Record for Numbered {
        fn to_statement(&self) -> Value {
            json!({ "n": self.0 })
        }

        fn csv_fields(&self) -> Vec<(String, String)> {
            vec![("n".to_string(), self.0.to_string())]
        }
    }

    fn queue_with(n: usize) -> DeliveryQueue {
        let mut queue = DeliveryQueue::new();
        for i in 0..n {
            queue.push(Arc::new(Numbered(i)));
        }
        queue
    }

    #[test]
    fn test_empty_queue_has_no_batch() {
        let queue = DeliveryQueue::new();
        assert!(queue.is_empty());
        assert_eq!(queue.pending(), 0);
        assert!(queue.next_batch(10).is_none());
    }

    #[test]
    fn test_push_returns_positions() {
        let mut queue = DeliveryQueue::new();
        assert_eq!(queue.push(Arc::new(Numbered(0))), 0);
        assert_eq!(queue.push(Arc::new(Numbered(1))), 1);
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn test_batches_are_contiguous_slices() {
        let mut queue = queue_with(250);

        let mut seen = Vec::new();
        while let Some(batch) = queue.next_batch(100) {
            assert_eq!(batch.start, queue.offset());
            for statement in batch.statements() {
                seen.push(statement["n"].as_u64().unwrap() as usize);
            }
            assert!(queue.advance(&batch));
        }

        assert_eq!(seen, (0..250).collect::<Vec<_>>());
        assert_eq!(queue.offset(), 250);
        assert_eq!(queue.pending(), 0);
    }

    #[test]
    fn test_last_batch_is_short() {
        let mut queue = queue_with(150);
        let first = queue.next_batch(100).unwrap();
        assert_eq!(first.len(), 100);
        queue.advance(&first);

        let second = queue.next_batch(100).unwrap();
        assert_eq!((second.start, second.end()), (100, 150));
    }

    #[test]
    fn test_stale_batch_does_not_advance() {
        let mut queue = queue_with(20);
        let batch = queue.next_batch(10).unwrap();
        assert!(queue.advance(&batch));
        assert!(!queue.advance(&batch));
        assert_eq!(queue.offset(), 10);
    }

    #[test]
    fn test_undelivered_batch_is_taken_again() {
        let queue = queue_with(5);
        let a = queue.next_batch(10).unwrap();
        let b = queue.next_batch(10).unwrap();
        assert_eq!((a.start, a.end()), (b.start, b.end()));
    }

    #[test]
    fn test_snapshot_includes_delivered_records() {
        let mut queue = queue_with(3);
        let batch = queue.next_batch(2).unwrap();
        queue.advance(&batch);

        let snapshot = queue.snapshot();
        assert_eq!(snapshot.len(), 3);
        assert_eq!(snapshot[0].to_statement()["n"], 0);
    }
}
