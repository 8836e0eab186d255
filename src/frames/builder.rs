use crate::error::SeglogError;
use crate::frames::{DataFrame, FrameCommitArgs};
use crate::log::{DurableLog, LogAddress};
use crate::operations::Operation;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::mem;
use std::sync::Arc;
use tokio::sync::{Notify, Semaphore, mpsc};
use tracing::{debug, warn};

/// Observer of the frame lifecycle. All three callbacks fire with the
/// pipeline's delivery lock held, so they are mutually serialized; they
/// must not call back into the builder.
pub trait FrameLifecycle: Send + Sync + 'static {
    /// Frame sealed and about to be handed to the durable log. Invoked
    /// synchronously from the thread driving `append`/`flush`;
    /// `log_address` is still unset.
    fn checkpoint(&self, args: &FrameCommitArgs);
    /// Frame durably acknowledged; `log_address` is populated. Delivered
    /// in frame dispatch order even when the log completes out of order.
    fn commit(&self, args: &FrameCommitArgs);
    /// Frame write rejected by the durable log.
    fn fail(&self, error: &SeglogError, args: Option<&FrameCommitArgs>);
}

struct PendingWrite {
    args: FrameCommitArgs,
    bytes: Vec<u8>,
}

#[derive(Default)]
struct DeliveryState {
    next_delivery_index: u64,
    completed: BTreeMap<u64, (FrameCommitArgs, Result<LogAddress, SeglogError>)>,
    in_flight: usize,
}

struct WritePipeline {
    lifecycle: Arc<dyn FrameLifecycle>,
    state: Mutex<DeliveryState>,
    idle: Notify,
    failure: Mutex<Option<SeglogError>>,
}

impl WritePipeline {
    /// Buffers one completed write and flushes the contiguous run of
    /// completions starting at the next delivery index, firing lifecycle
    /// callbacks in dispatch order.
    fn deliver(&self, index: u64, args: FrameCommitArgs, result: Result<LogAddress, SeglogError>) {
        let mut state = self.state.lock();
        state.completed.insert(index, (args, result));
        while let Some((mut args, result)) = {
            let next = state.next_delivery_index;
            state.completed.remove(&next)
        } {
            state.next_delivery_index += 1;
            state.in_flight -= 1;
            match result {
                Ok(address) => {
                    args.log_address = Some(address);
                    self.lifecycle.commit(&args);
                }
                Err(error) => {
                    {
                        let mut failure = self.failure.lock();
                        if failure.is_none() {
                            *failure = Some(error.clone());
                        }
                    }
                    warn!(frame_id = args.frame_id, %error, "frame write failed");
                    self.lifecycle.fail(&error, Some(&args));
                }
            }
        }
        let idle = state.in_flight == 0;
        drop(state);
        if idle {
            self.idle.notify_waiters();
        }
    }

    async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            if self.state.lock().in_flight == 0 {
                return;
            }
            notified.await;
        }
    }

    fn latch_failure(&self, error: SeglogError) {
        let mut failure = self.failure.lock();
        if failure.is_none() {
            *failure = Some(error);
        }
    }
}

/// Serializes operations into fixed-capacity data frames and writes sealed
/// frames to the durable log with bounded concurrency. Writes are
/// initiated in frame order by a dedicated task, so log addresses are
/// monotone in frame order; completions are re-sequenced before `commit`
/// callbacks fire. Once a write fails the builder latches the cause and
/// refuses further work; construct a new builder to resume.
pub struct FrameBuilder {
    frame_capacity: usize,
    current: DataFrame,
    next_frame_id: u64,
    lifecycle: Arc<dyn FrameLifecycle>,
    pipeline: Arc<WritePipeline>,
    writes: mpsc::UnboundedSender<PendingWrite>,
}

impl FrameBuilder {
    /// Must be called from within a tokio runtime; the builder spawns its
    /// write dispatcher on the current one.
    pub fn new(
        log: Arc<dyn DurableLog>,
        lifecycle: Arc<dyn FrameLifecycle>,
        frame_capacity: usize,
        max_concurrent_writes: usize,
    ) -> Self {
        let pipeline = Arc::new(WritePipeline {
            lifecycle: Arc::clone(&lifecycle),
            state: Mutex::new(DeliveryState::default()),
            idle: Notify::new(),
            failure: Mutex::new(None),
        });
        debug_assert!(
            frame_capacity >= crate::frames::MIN_FRAME_CAPACITY,
            "frame capacity below the minimum would stall appends"
        );
        let (writes, rx) = mpsc::unbounded_channel();
        spawn_dispatcher(log, Arc::clone(&pipeline), rx, max_concurrent_writes);
        Self {
            frame_capacity,
            current: DataFrame::new(frame_capacity),
            next_frame_id: 0,
            lifecycle,
            pipeline,
            writes,
        }
    }

    pub fn failure_cause(&self) -> Option<SeglogError> {
        self.pipeline.failure.lock().clone()
    }

    /// Serializes `op` into the in-progress frame, sealing and dispatching
    /// frames as they fill. A single operation may span several frames.
    pub fn append(&mut self, op: &Operation) -> Result<(), SeglogError> {
        self.ensure_open()?;
        let payload = op.serialize()?;
        let sequence = op.sequence_number();
        let mut written = 0usize;
        let mut first = true;
        while written < payload.len() {
            let taken = self
                .current
                .append_fragment(sequence, &payload[written..], first);
            if taken == 0 {
                self.seal_and_dispatch();
                continue;
            }
            written += taken;
            first = false;
        }
        Ok(())
    }

    /// Seals the in-progress frame, if non-empty, and initiates its write.
    pub fn flush(&mut self) -> Result<(), SeglogError> {
        self.ensure_open()?;
        if !self.current.is_empty() {
            self.seal_and_dispatch();
        }
        Ok(())
    }

    /// Flushes and waits for every in-flight write to resolve. Must be
    /// called on clean shutdown.
    pub async fn close(&mut self) {
        if let Err(error) = self.flush() {
            debug!(%error, "skipping final flush on closed builder");
        }
        self.pipeline.wait_idle().await;
    }

    fn ensure_open(&self) -> Result<(), SeglogError> {
        if self.pipeline.failure.lock().is_some() {
            return Err(SeglogError::BuilderClosed);
        }
        Ok(())
    }

    fn seal_and_dispatch(&mut self) {
        let frame = mem::replace(&mut self.current, DataFrame::new(self.frame_capacity));
        let sealed = frame.seal();
        let args = FrameCommitArgs {
            frame_id: self.next_frame_id,
            last_started_sequence: sealed.last_started_sequence,
            last_fully_serialized_sequence: sealed.last_fully_serialized_sequence,
            frame_length: sealed.length,
            log_address: None,
        };
        self.next_frame_id += 1;
        self.lifecycle.checkpoint(&args);
        self.pipeline.state.lock().in_flight += 1;
        if self
            .writes
            .send(PendingWrite {
                args,
                bytes: sealed.bytes,
            })
            .is_err()
        {
            self.pipeline.state.lock().in_flight -= 1;
            self.pipeline
                .latch_failure(SeglogError::Io("frame write dispatcher is gone".into()));
        }
    }
}

/// Pulls sealed frames off the channel and initiates their log appends in
/// order, with at most `max_concurrent_writes` outstanding. Completion
/// handling runs in per-write tasks and re-sequences through the pipeline.
fn spawn_dispatcher(
    log: Arc<dyn DurableLog>,
    pipeline: Arc<WritePipeline>,
    mut rx: mpsc::UnboundedReceiver<PendingWrite>,
    max_concurrent_writes: usize,
) {
    tokio::spawn(async move {
        let semaphore = Arc::new(Semaphore::new(max_concurrent_writes));
        let mut next_index = 0u64;
        while let Some(write) = rx.recv().await {
            let permit = match Arc::clone(&semaphore).acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };
            let future = log.append(write.bytes);
            let pipeline = Arc::clone(&pipeline);
            let index = next_index;
            next_index += 1;
            tokio::spawn(async move {
                let result = future.await;
                drop(permit);
                pipeline.deliver(index, write.args, result);
            });
        }
    });
}
