use crate::error::SeglogError;
use crate::frames::FrameCommitArgs;
use crate::frames::builder::FrameLifecycle;
use crate::memory_state::MemoryStateUpdater;
use crate::metadata::updater::OperationMetadataUpdater;
use crate::operations::Operation;
use crate::policy::MetadataCheckpointPolicy;
use crate::processor::ProcessorTelemetry;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::oneshot;
use tracing::{debug, error, warn};

/// An admitted operation paired with its single-shot result slot. The
/// slot resolves to the assigned sequence number on success; consuming
/// `complete`/`fail` makes double completion unrepresentable.
#[derive(Debug)]
pub(crate) struct PendingOperation {
    pub operation: Operation,
    completion: oneshot::Sender<Result<u64, SeglogError>>,
}

impl PendingOperation {
    pub fn new(
        operation: Operation,
        completion: oneshot::Sender<Result<u64, SeglogError>>,
    ) -> Self {
        Self {
            operation,
            completion,
        }
    }

    pub fn complete(self) {
        let _ = self.completion.send(Ok(self.operation.sequence_number()));
    }

    pub fn fail(self, error: SeglogError) {
        let _ = self.completion.send(Err(error));
    }
}

/// State guarded by the single shared lock: the metadata updater plus the
/// tracker's correlation structures. One lock for both is deliberate;
/// sealing a transaction and recording its frame must be atomic.
pub(crate) struct CoreState {
    pub updater: OperationMetadataUpdater,
    pending: VecDeque<PendingOperation>,
    frame_transactions: HashMap<u64, u64>,
    highest_committed_frame: Option<u64>,
}

impl CoreState {
    pub fn new(updater: OperationMetadataUpdater) -> Self {
        Self {
            updater,
            pending: VecDeque::new(),
            frame_transactions: HashMap::new(),
            highest_committed_frame: None,
        }
    }
}

/// Correlates frame-builder acknowledgments with metadata transactions,
/// commits or rolls back, and resolves operation futures in sequence
/// order.
pub(crate) struct CommitTracker {
    core: Arc<Mutex<CoreState>>,
    memory_state: Arc<dyn MemoryStateUpdater>,
    checkpoint_policy: Arc<dyn MetadataCheckpointPolicy>,
    fatal_callback: Box<dyn Fn(SeglogError) + Send + Sync>,
    fatal_latched: AtomicBool,
    telemetry: Arc<ProcessorTelemetry>,
}

impl CommitTracker {
    pub fn new(
        core: Arc<Mutex<CoreState>>,
        memory_state: Arc<dyn MemoryStateUpdater>,
        checkpoint_policy: Arc<dyn MetadataCheckpointPolicy>,
        fatal_callback: Box<dyn Fn(SeglogError) + Send + Sync>,
        telemetry: Arc<ProcessorTelemetry>,
    ) -> Self {
        Self {
            core,
            memory_state,
            checkpoint_policy,
            fatal_callback,
            fatal_latched: AtomicBool::new(false),
            telemetry,
        }
    }

    pub fn add_pending(&self, pending: PendingOperation) {
        self.core.lock().pending.push_back(pending);
        self.auto_complete_prefix();
    }

    /// Completes non-serializable operations at the head of the pending
    /// queue. They carry no frame entry, so no acknowledgment will ever
    /// arrive for them; once every earlier serializable operation has
    /// committed they are done.
    fn auto_complete_prefix(&self) {
        let ready: Vec<PendingOperation> = {
            let mut core = self.core.lock();
            let mut ready = Vec::new();
            while core
                .pending
                .front()
                .is_some_and(|p| !p.operation.can_serialize())
            {
                if let Some(pending) = core.pending.pop_front() {
                    ready.push(pending);
                }
            }
            ready
        };
        for pending in ready {
            self.telemetry.record_completed();
            pending.complete();
        }
    }

    fn commit_acknowledged(&self, args: &FrameCommitArgs) -> Option<SeglogError> {
        let mut core = self.core.lock();
        let Some(address) = args.log_address else {
            warn!(frame_id = args.frame_id, "commit callback without a log address");
            return None;
        };

        // The frame is durable regardless of ack ordering; the truncation
        // marker is always valid.
        core.updater
            .record_truncation_marker(args.last_started_sequence, address);

        if core
            .highest_committed_frame
            .is_some_and(|highest| address.sequence <= highest)
        {
            debug!(
                frame_sequence = address.sequence,
                "ignoring late frame acknowledgment"
            );
            self.telemetry.record_stale_frame_ack();
            self.checkpoint_policy.record_commit(args.frame_length);
            return None;
        }

        let Some(transaction_id) = core.frame_transactions.remove(&args.frame_id) else {
            // The transaction was rolled back while this write was still in
            // flight; its operations have already been failed.
            debug!(
                frame_id = args.frame_id,
                "acknowledged frame has no metadata transaction"
            );
            self.checkpoint_policy.record_commit(args.frame_length);
            return None;
        };
        core.frame_transactions.retain(|_, id| *id > transaction_id);
        core.updater.commit(transaction_id);

        let last_sequence = args.last_fully_serialized_sequence;
        while core
            .pending
            .front()
            .is_some_and(|p| p.operation.sequence_number() <= last_sequence)
        {
            let Some(pending) = core.pending.pop_front() else {
                break;
            };
            if pending.operation.can_serialize() {
                if let Err(memory_error) = self.memory_state.process(&pending.operation) {
                    error!(
                        sequence = pending.operation.sequence_number(),
                        %memory_error,
                        "failed to apply committed operation to memory state"
                    );
                    self.telemetry.record_failed();
                    pending.fail(memory_error.clone());
                    return Some(memory_error);
                }
            }
            self.telemetry.record_completed();
            pending.complete();
        }

        self.memory_state.flush();
        self.checkpoint_policy.record_commit(args.frame_length);
        core.highest_committed_frame = Some(address.sequence);
        self.telemetry
            .record_frame_committed(args.frame_length as u64);
        None
    }
}

impl FrameLifecycle for CommitTracker {
    fn checkpoint(&self, args: &FrameCommitArgs) {
        let mut core = self.core.lock();
        let transaction_id = core.updater.seal_transaction();
        core.frame_transactions.insert(args.frame_id, transaction_id);
    }

    fn commit(&self, args: &FrameCommitArgs) {
        if let Some(memory_error) = self.commit_acknowledged(args) {
            self.fail(&memory_error, Some(args));
        }
        self.auto_complete_prefix();
    }

    fn fail(&self, error: &SeglogError, args: Option<&FrameCommitArgs>) {
        {
            let mut core = self.core.lock();
            let from_id = args
                .and_then(|a| core.frame_transactions.remove(&a.frame_id))
                .unwrap_or(0);
            core.frame_transactions.retain(|_, id| *id < from_id);
            core.updater.rollback(from_id);

            // Drain from the tail so a head-first re-enqueue after a retry
            // would preserve order; the drain order itself is not
            // user-observable since every operation fails the same way.
            while let Some(pending) = core.pending.pop_back() {
                self.telemetry.record_failed();
                pending.fail(error.clone());
            }
        }

        if error.is_fatal() && !self.fatal_latched.swap(true, Ordering::SeqCst) {
            (self.fatal_callback)(error.clone());
        }
        self.auto_complete_prefix();
    }
}

#[cfg(test)]
mod tests {
    use super::{CommitTracker, CoreState, PendingOperation};
    use crate::error::SeglogError;
    use crate::frames::FrameCommitArgs;
    use crate::frames::builder::FrameLifecycle;
    use crate::log::LogAddress;
    use crate::memory_state::MemoryLog;
    use crate::metadata::updater::OperationMetadataUpdater;
    use crate::metadata::{ContainerMetadata, SegmentMetadata};
    use crate::operations::Operation;
    use crate::policy::NoopCheckpointPolicy;
    use crate::processor::ProcessorTelemetry;
    use parking_lot::Mutex;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::oneshot;

    struct Fixture {
        tracker: CommitTracker,
        core: Arc<Mutex<CoreState>>,
        fatal_count: Arc<AtomicUsize>,
    }

    fn fixture() -> Fixture {
        let mut metadata = ContainerMetadata::new(0);
        metadata.insert_segment(SegmentMetadata::new(1, "s", 0, false));
        let core = Arc::new(Mutex::new(CoreState::new(OperationMetadataUpdater::new(
            metadata,
        ))));
        let fatal_count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fatal_count);
        let tracker = CommitTracker::new(
            Arc::clone(&core),
            Arc::new(MemoryLog::new()),
            Arc::new(NoopCheckpointPolicy),
            Box::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
            Arc::new(ProcessorTelemetry::default()),
        );
        Fixture {
            tracker,
            core,
            fatal_count,
        }
    }

    /// Admits an append through the updater and the tracker the way the
    /// processor loop would, without a frame builder.
    fn admit_append(
        fixture: &Fixture,
        len: usize,
    ) -> (u64, oneshot::Receiver<Result<u64, SeglogError>>) {
        let mut op = Operation::segment_append(1, vec![0u8; len], Vec::new());
        {
            let mut core = fixture.core.lock();
            core.updater.pre_process(&mut op).expect("pre_process");
            let sequence = core.updater.next_operation_sequence_number();
            op.set_sequence_number(sequence);
            core.updater.accept(&op).expect("accept");
        }
        let sequence = op.sequence_number();
        let (tx, rx) = oneshot::channel();
        fixture.tracker.add_pending(PendingOperation::new(op, tx));
        (sequence, rx)
    }

    fn admit_probe(fixture: &Fixture) -> oneshot::Receiver<Result<u64, SeglogError>> {
        let (tx, rx) = oneshot::channel();
        fixture
            .tracker
            .add_pending(PendingOperation::new(Operation::probe(), tx));
        rx
    }

    fn frame_args(fixture: &Fixture, frame_id: u64, last_started: u64, last_full: u64) -> FrameCommitArgs {
        let args = FrameCommitArgs {
            frame_id,
            last_started_sequence: last_started,
            last_fully_serialized_sequence: last_full,
            frame_length: 100,
            log_address: None,
        };
        fixture.tracker.checkpoint(&args);
        args
    }

    fn with_address(mut args: FrameCommitArgs, sequence: u64) -> FrameCommitArgs {
        args.log_address = Some(LogAddress {
            sequence,
            offset: sequence * 1000,
        });
        args
    }

    #[test]
    fn commit_completes_operations_in_sequence_order() {
        let fixture = fixture();
        let (seq_a, rx_a) = admit_append(&fixture, 10);
        let (seq_b, rx_b) = admit_append(&fixture, 20);
        let args = frame_args(&fixture, 0, seq_b, seq_b);

        fixture.tracker.commit(&with_address(args, 1));

        assert_eq!(rx_a.blocking_recv().expect("slot"), Ok(seq_a));
        assert_eq!(rx_b.blocking_recv().expect("slot"), Ok(seq_b));
        let core = fixture.core.lock();
        assert_eq!(core.updater.metadata().segment(1).expect("segment").length, 30);
        assert_eq!(
            core.updater.metadata().truncation_markers().get(&seq_b),
            Some(&LogAddress {
                sequence: 1,
                offset: 1000
            })
        );
    }

    #[test]
    fn stale_acknowledgment_changes_nothing() {
        let fixture = fixture();
        let (seq_a, rx_a) = admit_append(&fixture, 10);
        let args_a = frame_args(&fixture, 0, seq_a, seq_a);
        let (seq_b, rx_b) = admit_append(&fixture, 20);
        let args_b = frame_args(&fixture, 1, seq_b, seq_b);

        // Frame B acknowledges first with a higher log sequence.
        fixture.tracker.commit(&with_address(args_b, 6));
        assert_eq!(rx_a.blocking_recv().expect("slot"), Ok(seq_a));
        assert_eq!(rx_b.blocking_recv().expect("slot"), Ok(seq_b));
        let length_after_b = {
            let core = fixture.core.lock();
            core.updater.metadata().segment(1).expect("segment").length
        };
        assert_eq!(length_after_b, 30);

        // Frame A arrives late; metadata and completions stay untouched.
        fixture.tracker.commit(&with_address(args_a, 5));
        let core = fixture.core.lock();
        assert_eq!(
            core.updater.metadata().segment(1).expect("segment").length,
            length_after_b
        );
        // Its truncation marker is still recorded: the frame is durable.
        assert!(core.updater.metadata().truncation_markers().contains_key(&seq_a));
    }

    #[test]
    fn partial_frame_commit_leaves_spanning_operation_pending() {
        let fixture = fixture();
        let (seq_a, rx_a) = admit_append(&fixture, 10);
        let (seq_b, mut rx_b) = admit_append(&fixture, 20);

        // Frame 0 ends mid-record: operation B started but did not finish.
        let args = frame_args(&fixture, 0, seq_b, seq_a);
        fixture.tracker.commit(&with_address(args, 1));

        assert_eq!(rx_a.blocking_recv().expect("slot"), Ok(seq_a));
        assert!(rx_b.try_recv().is_err(), "spanning operation must stay pending");

        let args = frame_args(&fixture, 1, seq_b, seq_b);
        fixture.tracker.commit(&with_address(args, 2));
        assert_eq!(rx_b.blocking_recv().expect("slot"), Ok(seq_b));
    }

    #[test]
    fn probe_between_serializable_operations_completes_in_order() {
        let fixture = fixture();
        let (seq_a, rx_a) = admit_append(&fixture, 10);
        let mut probe_rx = admit_probe(&fixture);
        let (seq_b, rx_b) = admit_append(&fixture, 20);

        assert!(probe_rx.try_recv().is_err(), "probe must wait for the prefix");

        let args = frame_args(&fixture, 0, seq_b, seq_b);
        fixture.tracker.commit(&with_address(args, 1));

        assert_eq!(rx_a.blocking_recv().expect("slot"), Ok(seq_a));
        assert!(probe_rx.blocking_recv().expect("slot").is_ok());
        assert_eq!(rx_b.blocking_recv().expect("slot"), Ok(seq_b));
    }

    #[test]
    fn probe_at_head_completes_immediately() {
        let fixture = fixture();
        let probe_rx = admit_probe(&fixture);
        assert!(probe_rx.blocking_recv().expect("slot").is_ok());
    }

    #[test]
    fn fail_rolls_back_and_fails_all_pending() {
        let fixture = fixture();
        let before = fixture.core.lock().updater.metadata().snapshot();
        let (_, rx_a) = admit_append(&fixture, 10);
        let (_, rx_b) = admit_append(&fixture, 20);
        frame_args(&fixture, 0, 2, 2);

        let error = SeglogError::Io("write failed".into());
        fixture.tracker.fail(&error, None);

        assert_eq!(rx_a.blocking_recv().expect("slot"), Err(error.clone()));
        assert_eq!(rx_b.blocking_recv().expect("slot"), Err(error));
        let core = fixture.core.lock();
        assert_eq!(core.updater.metadata().snapshot(), before);
        assert_eq!(core.updater.pending_transaction_count(), 0);
        assert_eq!(fixture.fatal_count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn fatal_callback_fires_exactly_once() {
        let fixture = fixture();
        let error = SeglogError::DataCorruption("bad".into());
        fixture.tracker.fail(&error, None);
        fixture.tracker.fail(&error, None);
        assert_eq!(fixture.fatal_count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn memory_state_failure_fails_the_rest_of_the_batch() {
        struct PoisonedSecond {
            applied: AtomicUsize,
        }

        impl crate::memory_state::MemoryStateUpdater for PoisonedSecond {
            fn process(&self, _op: &Operation) -> Result<(), SeglogError> {
                if self.applied.fetch_add(1, Ordering::SeqCst) == 1 {
                    return Err(SeglogError::DataCorruption("index diverged".into()));
                }
                Ok(())
            }

            fn flush(&self) {}
        }

        let mut metadata = ContainerMetadata::new(0);
        metadata.insert_segment(SegmentMetadata::new(1, "s", 0, false));
        let core = Arc::new(Mutex::new(CoreState::new(OperationMetadataUpdater::new(
            metadata,
        ))));
        let fatal_count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fatal_count);
        let tracker = CommitTracker::new(
            Arc::clone(&core),
            Arc::new(PoisonedSecond {
                applied: AtomicUsize::new(0),
            }),
            Arc::new(NoopCheckpointPolicy),
            Box::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
            Arc::new(ProcessorTelemetry::default()),
        );
        let fixture = Fixture {
            tracker,
            core,
            fatal_count,
        };

        let (seq_a, rx_a) = admit_append(&fixture, 10);
        let (_, rx_b) = admit_append(&fixture, 20);
        let (seq_c, rx_c) = admit_append(&fixture, 30);
        let args = frame_args(&fixture, 0, seq_c, seq_c);
        fixture.tracker.commit(&with_address(args, 1));

        assert_eq!(rx_a.blocking_recv().expect("slot"), Ok(seq_a));
        assert!(matches!(
            rx_b.blocking_recv().expect("slot"),
            Err(SeglogError::DataCorruption(_))
        ));
        assert!(matches!(
            rx_c.blocking_recv().expect("slot"),
            Err(SeglogError::DataCorruption(_))
        ));
        assert_eq!(fixture.fatal_count.load(Ordering::SeqCst), 1);
    }
}
