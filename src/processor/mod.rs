use crate::config::ProcessorConfig;
use crate::error::SeglogError;
use crate::frames::builder::{FrameBuilder, FrameLifecycle};
use crate::intake::IntakeQueue;
use crate::log::DurableLog;
use crate::memory_state::MemoryStateUpdater;
use crate::metadata::updater::OperationMetadataUpdater;
use crate::metadata::{ContainerMetadata, MetadataSnapshot};
use crate::operations::Operation;
use crate::policy::MetadataCheckpointPolicy;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};
use tokio::sync::{Notify, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

pub mod tracker;

use tracker::{CommitTracker, CoreState, PendingOperation};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessorState {
    Created,
    Running,
    Stopping,
    Stopped,
    Failed(SeglogError),
}

impl ProcessorState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ProcessorState::Stopped | ProcessorState::Failed(_))
    }
}

#[derive(Debug, Default)]
pub(crate) struct ProcessorTelemetry {
    operations_admitted: AtomicU64,
    operations_completed: AtomicU64,
    operations_failed: AtomicU64,
    frames_committed: AtomicU64,
    frame_bytes_committed: AtomicU64,
    stale_frame_acks: AtomicU64,
    builder_rebuilds: AtomicU64,
}

impl ProcessorTelemetry {
    pub fn record_admitted(&self) {
        self.operations_admitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_completed(&self) {
        self.operations_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failed(&self) {
        self.operations_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_frame_committed(&self, bytes: u64) {
        self.frames_committed.fetch_add(1, Ordering::Relaxed);
        self.frame_bytes_committed.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_stale_frame_ack(&self) {
        self.stale_frame_acks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_builder_rebuild(&self) {
        self.builder_rebuilds.fetch_add(1, Ordering::Relaxed);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessorMetrics {
    pub operations_admitted: u64,
    pub operations_completed: u64,
    pub operations_failed: u64,
    pub frames_committed: u64,
    pub frame_bytes_committed: u64,
    pub stale_frame_acks: u64,
    pub builder_rebuilds: u64,
    pub queued_operations: usize,
}

struct LifecycleShared {
    state: Mutex<ProcessorState>,
    terminated: Notify,
}

impl LifecycleShared {
    fn current(&self) -> ProcessorState {
        self.state.lock().clone()
    }

    fn is_running(&self) -> bool {
        matches!(*self.state.lock(), ProcessorState::Running)
    }

    /// Transitions to `Failed` unless a terminal state is already set.
    fn mark_failed(&self, error: SeglogError) {
        let mut state = self.state.lock();
        if !state.is_terminal() {
            *state = ProcessorState::Failed(error);
        }
    }

    /// Final transition after the loop drains: `Failed` sticks, everything
    /// else becomes `Stopped`.
    fn finalize(&self) {
        let mut state = self.state.lock();
        if !matches!(*state, ProcessorState::Failed(_)) {
            *state = ProcessorState::Stopped;
        }
    }

    /// Error to fail leftover operations with during shutdown.
    fn closing_error(&self) -> SeglogError {
        match &*self.state.lock() {
            ProcessorState::Failed(error) => error.clone(),
            _ => SeglogError::Closed("operation processor is shutting down".into()),
        }
    }
}

struct ProcessorShared {
    config: ProcessorConfig,
    queue: Arc<IntakeQueue<PendingOperation>>,
    core: Arc<Mutex<CoreState>>,
    tracker: Arc<CommitTracker>,
    log: Arc<dyn DurableLog>,
    lifecycle: Arc<LifecycleShared>,
    telemetry: Arc<ProcessorTelemetry>,
}

/// Resolves to the operation's assigned sequence number once its frame is
/// durable and its metadata committed. Dropping the future does not cancel
/// the operation.
pub struct CommitFuture {
    receiver: oneshot::Receiver<Result<u64, SeglogError>>,
}

impl Future for CommitFuture {
    type Output = Result<u64, SeglogError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.get_mut().receiver)
            .poll(cx)
            .map(|received| match received {
                Ok(result) => result,
                Err(_) => Err(SeglogError::Closed(
                    "operation was abandoned by the processor".into(),
                )),
            })
    }
}

/// Single-consumer commit engine: admits operations through a bounded
/// intake queue, sequences and packs them into data frames, pipelines the
/// durable writes, and commits metadata and read state as frames are
/// acknowledged. One processor per container.
pub struct OperationProcessor {
    shared: Arc<ProcessorShared>,
    loop_task: Mutex<Option<JoinHandle<()>>>,
}

impl OperationProcessor {
    pub fn new(
        config: ProcessorConfig,
        metadata: ContainerMetadata,
        log: Arc<dyn DurableLog>,
        memory_state: Arc<dyn MemoryStateUpdater>,
        checkpoint_policy: Arc<dyn MetadataCheckpointPolicy>,
    ) -> Result<Self, SeglogError> {
        config.validate()?;
        let queue = Arc::new(IntakeQueue::<PendingOperation>::new(config.max_queued_operations));
        let telemetry = Arc::new(ProcessorTelemetry::default());
        let lifecycle = Arc::new(LifecycleShared {
            state: Mutex::new(ProcessorState::Created),
            terminated: Notify::new(),
        });
        let core = Arc::new(Mutex::new(CoreState::new(OperationMetadataUpdater::new(
            metadata,
        ))));

        let fatal_queue = Arc::clone(&queue);
        let fatal_lifecycle = Arc::clone(&lifecycle);
        let fatal_telemetry = Arc::clone(&telemetry);
        let fatal_callback = Box::new(move |fatal: SeglogError| {
            error!(%fatal, "fatal error, stopping operation processor");
            fatal_lifecycle.mark_failed(fatal.clone());
            for pending in fatal_queue.close() {
                fatal_telemetry.record_failed();
                pending.fail(fatal.clone());
            }
        });
        let tracker = Arc::new(CommitTracker::new(
            Arc::clone(&core),
            memory_state,
            checkpoint_policy,
            fatal_callback,
            Arc::clone(&telemetry),
        ));

        Ok(Self {
            shared: Arc::new(ProcessorShared {
                config,
                queue,
                core,
                tracker,
                log,
                lifecycle,
                telemetry,
            }),
            loop_task: Mutex::new(None),
        })
    }

    /// Spawns the processing loop on the current tokio runtime.
    pub fn start(&self) -> Result<(), SeglogError> {
        {
            let mut state = self.shared.lifecycle.state.lock();
            match *state {
                ProcessorState::Created => *state = ProcessorState::Running,
                _ => {
                    return Err(SeglogError::BadOperation(
                        "operation processor has already been started".into(),
                    ));
                }
            }
        }
        let shared = Arc::clone(&self.shared);
        *self.loop_task.lock() = Some(tokio::spawn(run_loop(shared)));
        Ok(())
    }

    pub fn state(&self) -> ProcessorState {
        self.shared.lifecycle.current()
    }

    pub fn is_running(&self) -> bool {
        self.shared.lifecycle.is_running()
    }

    /// Admits an operation. The returned future resolves to the assigned
    /// sequence number once the operation is durable and committed, or to
    /// the error that stopped it. Enqueue failures surface through the
    /// future as well.
    pub fn process(&self, operation: Operation) -> CommitFuture {
        let (sender, receiver) = oneshot::channel();
        let future = CommitFuture { receiver };
        if !self.is_running() {
            let _ = sender.send(Err(SeglogError::Closed(
                "operation processor is not running".into(),
            )));
            return future;
        }
        debug!(kind = operation.kind(), "admitting operation");
        match self.shared.queue.add(PendingOperation::new(operation, sender)) {
            Ok(()) => self.shared.telemetry.record_admitted(),
            Err(rejected) => {
                self.shared.telemetry.record_failed();
                rejected.item.fail(rejected.error);
            }
        }
        future
    }

    /// Graceful shutdown: closes the intake queue, fails everything still
    /// queued, and waits (bounded by `shutdown_timeout`) for in-flight
    /// frames to drain.
    pub async fn stop(&self) {
        {
            let mut state = self.shared.lifecycle.state.lock();
            match *state {
                ProcessorState::Running => *state = ProcessorState::Stopping,
                ProcessorState::Created => {
                    *state = ProcessorState::Stopped;
                    drop(state);
                    self.shared.lifecycle.terminated.notify_waiters();
                    return;
                }
                _ => {}
            }
        }
        let closing = self.shared.lifecycle.closing_error();
        for pending in self.shared.queue.close() {
            self.shared.telemetry.record_failed();
            pending.fail(closing.clone());
        }

        let timeout = self.shared.config.shutdown_timeout;
        if tokio::time::timeout(timeout, self.await_terminated())
            .await
            .is_err()
        {
            warn!("shutdown timed out, aborting the processor loop");
            if let Some(task) = self.loop_task.lock().take() {
                task.abort();
            }
            // Writes that never acknowledged will never complete their
            // operations; fail them so no caller waits forever.
            self.shared.tracker.fail(
                &SeglogError::Closed("operation processor shutdown timed out".into()),
                None,
            );
            self.shared.lifecycle.finalize();
            self.shared.lifecycle.terminated.notify_waiters();
        }
    }

    /// Waits for the processor to reach a terminal state and returns it.
    pub async fn await_terminated(&self) -> ProcessorState {
        loop {
            let notified = self.shared.lifecycle.terminated.notified();
            let state = self.shared.lifecycle.current();
            if state.is_terminal() {
                return state;
            }
            notified.await;
        }
    }

    /// Snapshot of the committed (base) container metadata.
    pub fn metadata_snapshot(&self) -> MetadataSnapshot {
        self.shared.core.lock().updater.metadata().snapshot()
    }

    pub fn metrics(&self) -> ProcessorMetrics {
        let telemetry = &self.shared.telemetry;
        ProcessorMetrics {
            operations_admitted: telemetry.operations_admitted.load(Ordering::Relaxed),
            operations_completed: telemetry.operations_completed.load(Ordering::Relaxed),
            operations_failed: telemetry.operations_failed.load(Ordering::Relaxed),
            frames_committed: telemetry.frames_committed.load(Ordering::Relaxed),
            frame_bytes_committed: telemetry.frame_bytes_committed.load(Ordering::Relaxed),
            stale_frame_acks: telemetry.stale_frame_acks.load(Ordering::Relaxed),
            builder_rebuilds: telemetry.builder_rebuilds.load(Ordering::Relaxed),
            queued_operations: self.shared.queue.len(),
        }
    }
}

async fn run_loop(shared: Arc<ProcessorShared>) {
    debug!("operation processor loop started");
    let mut builder: Option<FrameBuilder> = None;
    let exit_error = loop {
        if !shared.lifecycle.is_running() {
            break None;
        }
        let batch = match shared.queue.take(shared.config.max_read_at_once).await {
            Ok(batch) => batch,
            // Queue closed by stop() or by the fatal callback.
            Err(_) => break None,
        };
        if let Err(fatal) = process_batch(&shared, &mut builder, batch) {
            break Some(fatal);
        }
    };
    shutdown(shared, builder, exit_error).await;
}

async fn shutdown(
    shared: Arc<ProcessorShared>,
    builder: Option<FrameBuilder>,
    exit_error: Option<SeglogError>,
) {
    if let Some(fatal) = exit_error {
        shared.lifecycle.mark_failed(fatal);
    }
    let closing = shared.lifecycle.closing_error();
    for pending in shared.queue.close() {
        shared.telemetry.record_failed();
        pending.fail(closing.clone());
    }
    // Closing the builder flushes the in-progress frame and awaits every
    // in-flight write; the tracker's callbacks drain naturally.
    if let Some(mut builder) = builder {
        builder.close().await;
    }
    shared.lifecycle.finalize();
    shared.lifecycle.terminated.notify_waiters();
    debug!(state = ?shared.lifecycle.current(), "operation processor loop stopped");
}

/// One iteration of the consumer: drains the given batch (and whatever
/// arrives meanwhile) through the frame builder. Non-fatal errors fail the
/// in-flight operations and continue with a fresh builder; fatal errors
/// propagate after cancelling what never ran.
fn process_batch(
    shared: &Arc<ProcessorShared>,
    builder_slot: &mut Option<FrameBuilder>,
    batch: Vec<PendingOperation>,
) -> Result<(), SeglogError> {
    debug!(operations = batch.len(), "processing batch");
    let mut batch: VecDeque<PendingOperation> = batch.into();
    while !batch.is_empty() {
        if let Err(error) = process_batch_round(shared, builder_slot, &mut batch) {
            shared.tracker.fail(&error, None);
            if error.is_fatal() {
                cancel_incomplete(shared, batch, &error);
                return Err(error);
            }
        }
    }
    Ok(())
}

fn process_batch_round(
    shared: &Arc<ProcessorShared>,
    builder_slot: &mut Option<FrameBuilder>,
    batch: &mut VecDeque<PendingOperation>,
) -> Result<(), SeglogError> {
    let builder = ensure_builder(shared, builder_slot);
    while let Some(pending) = batch.pop_front() {
        process_one(shared, builder, pending)?;
    }
    // More operations may have arrived while we were busy; draining them
    // now avoids a context switch and fills frames better.
    let more = shared.queue.poll(shared.config.max_read_at_once);
    if more.is_empty() {
        builder.flush()?;
    } else {
        batch.extend(more);
    }
    Ok(())
}

fn ensure_builder<'a>(
    shared: &Arc<ProcessorShared>,
    slot: &'a mut Option<FrameBuilder>,
) -> &'a mut FrameBuilder {
    if slot.as_ref().is_some_and(|b| b.failure_cause().is_some()) {
        debug!("discarding failed frame builder");
        shared.telemetry.record_builder_rebuild();
        *slot = None;
    }
    slot.get_or_insert_with(|| {
        FrameBuilder::new(
            Arc::clone(&shared.log),
            Arc::clone(&shared.tracker) as Arc<dyn FrameLifecycle>,
            shared.config.frame_capacity_bytes,
            shared.config.max_concurrent_writes,
        )
    })
}

/// Admits one operation: pre-process and sequence under the shared lock,
/// append to the frame builder, then accept under the lock again. The
/// append may synchronously seal a frame, which seals the open metadata
/// transaction; the accept then lands in a newer transaction, which is
/// intended: both commit or roll back together with their frames.
fn process_one(
    shared: &Arc<ProcessorShared>,
    builder: &mut FrameBuilder,
    mut pending: PendingOperation,
) -> Result<(), SeglogError> {
    if !pending.operation.can_serialize() {
        shared.tracker.add_pending(pending);
        return Ok(());
    }

    {
        let mut core = shared.core.lock();
        if let Err(error) = core.updater.pre_process(&mut pending.operation) {
            drop(core);
            return reject_operation(shared, pending, error);
        }
        let sequence = core.updater.next_operation_sequence_number();
        pending.operation.set_sequence_number(sequence);
    }

    if let Err(error) = builder.append(&pending.operation) {
        if matches!(error, SeglogError::BuilderClosed) {
            // Prefer the latched root cause; the loop rolls back and
            // rebuilds the builder on the next round.
            let cause = builder.failure_cause().unwrap_or(error);
            shared.telemetry.record_failed();
            pending.fail(cause.clone());
            return Err(cause);
        }
        return reject_operation(shared, pending, error);
    }

    {
        let mut core = shared.core.lock();
        if let Err(error) = core.updater.accept(&pending.operation) {
            drop(core);
            return reject_operation(shared, pending, error);
        }
    }

    shared.tracker.add_pending(pending);
    Ok(())
}

/// Fails a single operation locally; fatal causes propagate to the loop.
fn reject_operation(
    shared: &Arc<ProcessorShared>,
    pending: PendingOperation,
    error: SeglogError,
) -> Result<(), SeglogError> {
    warn!(
        kind = pending.operation.kind(),
        %error,
        "operation rejected"
    );
    shared.telemetry.record_failed();
    pending.fail(error.clone());
    if error.is_fatal() { Err(error) } else { Ok(()) }
}

fn cancel_incomplete(
    shared: &Arc<ProcessorShared>,
    batch: VecDeque<PendingOperation>,
    error: &SeglogError,
) {
    if batch.is_empty() {
        return;
    }
    warn!(count = batch.len(), %error, "cancelling operations that never ran");
    for pending in batch {
        shared.telemetry.record_failed();
        pending.fail(error.clone());
    }
}

impl Drop for OperationProcessor {
    fn drop(&mut self) {
        // The loop exits on its own once the queue closes; aborting here
        // only covers processors dropped without `stop`.
        self.shared.queue.close();
        if let Some(task) = self.loop_task.lock().take() {
            task.abort();
        }
    }
}
