use crate::error::SeglogError;
use crate::operations::{Operation, OperationBody, SegmentId};
use parking_lot::Mutex;
use std::collections::HashMap;
use tracing::debug;

/// Applies durably-committed operations to in-memory read state. Invoked
/// by the commit tracker with its lock held, in sequence order; `process`
/// may only fail with `DataCorruption` and must not call back into the
/// processor.
pub trait MemoryStateUpdater: Send + Sync + 'static {
    fn process(&self, op: &Operation) -> Result<(), SeglogError>;
    /// Publishes batched updates to readers.
    fn flush(&self);
}

#[derive(Debug, Default)]
struct MemoryLogState {
    operations: Vec<Operation>,
    tail_sequence: u64,
    published_sequence: u64,
    segment_tails: HashMap<SegmentId, u64>,
}

/// In-memory tail of committed operations plus per-segment read offsets.
/// Cross-checks each operation against the read state it is about to
/// mutate; any mismatch means the commit pipeline and the read path have
/// diverged, which is unrecoverable.
#[derive(Debug, Default)]
pub struct MemoryLog {
    state: Mutex<MemoryLogState>,
}

impl MemoryLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tail_sequence(&self) -> u64 {
        self.state.lock().tail_sequence
    }

    /// Highest sequence visible to readers; trails `tail_sequence` until
    /// the next `flush`.
    pub fn published_sequence(&self) -> u64 {
        self.state.lock().published_sequence
    }

    pub fn committed_operations(&self) -> Vec<Operation> {
        self.state.lock().operations.clone()
    }

    pub fn segment_tail(&self, segment_id: SegmentId) -> Option<u64> {
        self.state.lock().segment_tails.get(&segment_id).copied()
    }
}

impl MemoryStateUpdater for MemoryLog {
    fn process(&self, op: &Operation) -> Result<(), SeglogError> {
        let mut state = self.state.lock();
        let sequence = op.sequence_number();
        if sequence <= state.tail_sequence {
            return Err(SeglogError::DataCorruption(format!(
                "operation sequence {sequence} does not advance the tail {}",
                state.tail_sequence
            )));
        }
        match op.body() {
            OperationBody::SegmentAppend {
                segment_id,
                offset,
                data,
                ..
            } => {
                let offset = offset.ok_or_else(|| {
                    SeglogError::DataCorruption("committed append without an offset".into())
                })?;
                if let Some(tail) = state.segment_tails.get(segment_id)
                    && *tail != offset
                {
                    return Err(SeglogError::DataCorruption(format!(
                        "append to segment {segment_id} at offset {offset} \
                         but read tail is {tail}"
                    )));
                }
                state
                    .segment_tails
                    .insert(*segment_id, offset + data.len() as u64);
            }
            OperationBody::SegmentMap {
                segment_id, length, ..
            } => {
                if let Some(id) = segment_id {
                    state.segment_tails.entry(*id).or_insert(*length);
                }
            }
            OperationBody::SegmentMerge {
                target_id,
                target_offset,
                length,
                ..
            } => {
                if let (Some(target_offset), Some(length)) = (target_offset, length) {
                    state
                        .segment_tails
                        .insert(*target_id, target_offset + length);
                }
            }
            OperationBody::SegmentSeal { .. }
            | OperationBody::UpdateAttributes { .. }
            | OperationBody::MetadataCheckpoint { .. }
            | OperationBody::Probe => {}
        }
        state.tail_sequence = sequence;
        state.operations.push(op.clone());
        Ok(())
    }

    fn flush(&self) {
        let mut state = self.state.lock();
        if state.published_sequence != state.tail_sequence {
            state.published_sequence = state.tail_sequence;
            debug!(
                published_sequence = state.published_sequence,
                "published committed operations"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{MemoryLog, MemoryStateUpdater};
    use crate::error::SeglogError;
    use crate::operations::{Operation, OperationBody};

    fn committed_append(sequence: u64, segment_id: u64, offset: u64, len: usize) -> Operation {
        let mut op = Operation::segment_append(segment_id, vec![0u8; len], Vec::new());
        op.set_sequence_number(sequence);
        if let OperationBody::SegmentAppend { offset: slot, .. } = op.body_mut() {
            *slot = Some(offset);
        }
        op
    }

    #[test]
    fn appends_advance_segment_tails_and_publish_on_flush() {
        let log = MemoryLog::new();
        log.process(&committed_append(1, 5, 0, 10)).expect("process");
        log.process(&committed_append(2, 5, 10, 20)).expect("process");

        assert_eq!(log.segment_tail(5), Some(30));
        assert_eq!(log.tail_sequence(), 2);
        assert_eq!(log.published_sequence(), 0);
        log.flush();
        assert_eq!(log.published_sequence(), 2);
        assert_eq!(log.committed_operations().len(), 2);
    }

    #[test]
    fn sequence_regression_is_corruption() {
        let log = MemoryLog::new();
        log.process(&committed_append(3, 1, 0, 4)).expect("process");
        let err = log
            .process(&committed_append(3, 1, 4, 4))
            .expect_err("regression");
        assert!(matches!(err, SeglogError::DataCorruption(_)));
    }

    #[test]
    fn append_offset_mismatch_is_corruption() {
        let log = MemoryLog::new();
        log.process(&committed_append(1, 1, 0, 8)).expect("process");
        let err = log
            .process(&committed_append(2, 1, 20, 8))
            .expect_err("gap in offsets");
        assert!(matches!(err, SeglogError::DataCorruption(_)));
    }
}
