use parking_lot::Mutex;
use std::sync::Arc;
use tracing::debug;

/// Observes bytes durably written and decides when a metadata checkpoint
/// operation should be synthesized. `record_commit` is invoked with the
/// commit tracker's lock held, so implementations must hand any follow-up
/// work off asynchronously rather than re-entering the processor.
pub trait MetadataCheckpointPolicy: Send + Sync + 'static {
    fn record_commit(&self, frame_length: usize);
}

/// Policy that never checkpoints; useful for tests and embedders that
/// drive checkpoints themselves.
#[derive(Debug, Default)]
pub struct NoopCheckpointPolicy;

impl MetadataCheckpointPolicy for NoopCheckpointPolicy {
    fn record_commit(&self, _frame_length: usize) {}
}

#[derive(Debug, Default)]
struct CheckpointAccounting {
    bytes_since_checkpoint: u64,
    commits_since_checkpoint: u64,
}

/// Triggers a checkpoint once either the committed byte volume or the
/// committed frame count since the last checkpoint crosses its threshold.
/// The trigger runs on a spawned task, typically enqueueing a
/// `MetadataCheckpoint` operation back through the processor.
pub struct ThresholdCheckpointPolicy {
    min_commit_bytes: u64,
    min_commit_count: u64,
    accounting: Mutex<CheckpointAccounting>,
    create_checkpoint: Arc<dyn Fn() + Send + Sync>,
}

impl ThresholdCheckpointPolicy {
    pub fn new(
        min_commit_bytes: u64,
        min_commit_count: u64,
        create_checkpoint: Arc<dyn Fn() + Send + Sync>,
    ) -> Self {
        Self {
            min_commit_bytes,
            min_commit_count,
            accounting: Mutex::new(CheckpointAccounting::default()),
            create_checkpoint,
        }
    }
}

impl MetadataCheckpointPolicy for ThresholdCheckpointPolicy {
    fn record_commit(&self, frame_length: usize) {
        let triggered = {
            let mut accounting = self.accounting.lock();
            accounting.bytes_since_checkpoint += frame_length as u64;
            accounting.commits_since_checkpoint += 1;
            if accounting.bytes_since_checkpoint >= self.min_commit_bytes
                || accounting.commits_since_checkpoint >= self.min_commit_count
            {
                *accounting = CheckpointAccounting::default();
                true
            } else {
                false
            }
        };
        if triggered {
            debug!("checkpoint threshold crossed");
            let create_checkpoint = Arc::clone(&self.create_checkpoint);
            tokio::spawn(async move { create_checkpoint() });
        }
    }
}
