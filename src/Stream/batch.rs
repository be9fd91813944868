//! Size-bounded batches of serialized records

use super::record::{encode_event, PhysicsEvent, RECORD_SIZE};

/// Bytes in one megabyte of batch budget.
pub const MEGABYTE: usize = 1_048_576;

// Upper bound for the up-front reservation of a batch buffer; larger batches grow on demand.
const MAX_RESERVE_BYTES: usize = 64 * MEGABYTE;

/// Record-count threshold for a batch budget of `megabytes`.
pub fn records_per_batch(megabytes: usize) -> usize {
    megabytes.saturating_mul(MEGABYTE) / RECORD_SIZE
}

/// Contiguous run of whole records produced by one task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    buf: Vec<u8>,
    records: usize,
    task: usize,
}

impl Batch {
    pub fn with_capacity(records: usize, task: usize) -> Self {
        let bytes = records.saturating_mul(RECORD_SIZE).min(MAX_RESERVE_BYTES);
        Self {
            buf: Vec::with_capacity(bytes),
            records: 0,
            task,
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn len_bytes(&self) -> usize {
        self.buf.len()
    }

    pub fn record_count(&self) -> usize {
        self.records
    }

    pub fn is_empty(&self) -> bool {
        self.records == 0
    }

    /// Index of the task that filled this batch.
    pub fn owner(&self) -> usize {
        self.task
    }

    fn push_record(&mut self, record: &[u8; RECORD_SIZE]) {
        self.buf.extend_from_slice(record);
        self.records += 1;
    }

    fn push_event(&mut self, event: &PhysicsEvent) {
        self.push_record(&encode_event(event));
    }
}

/// Owns the one open batch of a task and decides when it is full.
#[derive(Debug)]
pub struct BatchAccumulator {
    current: Batch,
    threshold: usize,
    task: usize,
}

impl BatchAccumulator {
    /// `threshold` is the record count at which a batch is full; clamped to at least 1.
    pub fn new(task: usize, threshold: usize) -> Self {
        let threshold = threshold.max(1);
        Self {
            current: Batch::with_capacity(threshold, task),
            threshold,
            task,
        }
    }

    /// Accumulator whose threshold is `megabytes` worth of records.
    pub fn with_megabytes(task: usize, megabytes: usize) -> Self {
        Self::new(task, records_per_batch(megabytes))
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }

    /// Records in the open batch.
    pub fn pending(&self) -> usize {
        self.current.record_count()
    }

    /// Append one already-serialized record.
    pub fn append(&mut self, record: &[u8; RECORD_SIZE]) {
        self.current.push_record(record);
    }

    /// Serialize `event` straight into the open batch.
    pub fn append_event(&mut self, event: &PhysicsEvent) {
        self.current.push_event(event);
    }

    /// Full once the threshold is reached, or on the final record of a source.
    /// An empty batch is never full.
    pub fn is_full(&self, last: bool) -> bool {
        !self.current.is_empty() && (last || self.current.record_count() >= self.threshold)
    }

    /// Hand out the open batch and start a fresh one with the same capacity hint.
    pub fn take_and_reset(&mut self) -> Batch {
        let fresh = Batch::with_capacity(self.threshold, self.task);
        std::mem::replace(&mut self.current, fresh)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn threshold_from_megabytes() {
        assert_eq!(records_per_batch(1), 8192);
        assert_eq!(records_per_batch(10), 81_920);
        assert_eq!(BatchAccumulator::with_megabytes(0, 0).threshold(), 1);
    }

    #[test]
    fn empty_batch_is_never_full() {
        let acc = BatchAccumulator::new(0, 1);
        assert!(!acc.is_full(false));
        assert!(!acc.is_full(true));
    }

    #[test]
    fn take_and_reset_starts_fresh() {
        let mut acc = BatchAccumulator::new(3, 2);
        acc.append(&[1u8; RECORD_SIZE]);
        assert!(!acc.is_full(false));
        assert!(acc.is_full(true));
        acc.append(&[2u8; RECORD_SIZE]);
        assert!(acc.is_full(false));

        let batch = acc.take_and_reset();
        assert_eq!(batch.record_count(), 2);
        assert_eq!(batch.len_bytes(), 2 * RECORD_SIZE);
        assert_eq!(batch.owner(), 3);
        assert_eq!(&batch.as_bytes()[..RECORD_SIZE], &[1u8; RECORD_SIZE][..]);
        assert_eq!(acc.pending(), 0);
    }
}
