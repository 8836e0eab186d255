use crate::error::SeglogError;
use crate::frames::MIN_FRAME_CAPACITY;
use std::time::Duration;

/// Runtime configuration for an operation processor.
#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    /// Maximum number of frame writes dispatched to the durable log at once.
    pub max_concurrent_writes: usize,
    /// Maximum number of operations pulled from the intake queue per loop
    /// iteration.
    pub max_read_at_once: usize,
    /// Intake queue bound; `process` fails fast with `QueueFull` beyond it.
    pub max_queued_operations: usize,
    /// Serialized size of a sealed data frame, including frame overhead.
    pub frame_capacity_bytes: usize,
    pub shutdown_timeout: Duration,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_writes: 1,
            max_read_at_once: 1000,
            max_queued_operations: 4096,
            frame_capacity_bytes: 1024 * 1024,
            shutdown_timeout: Duration::from_secs(10),
        }
    }
}

impl ProcessorConfig {
    /// Profile with pipelined durable writes. Commit acknowledgements are
    /// re-sequenced by the frame builder, so callers observe the same
    /// ordering guarantees as the serial default.
    pub fn pipelined() -> Self {
        Self {
            max_concurrent_writes: 4,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), SeglogError> {
        if self.max_concurrent_writes == 0 {
            return Err(SeglogError::InvalidConfig(
                "max_concurrent_writes must be greater than zero".into(),
            ));
        }
        if self.max_read_at_once == 0 {
            return Err(SeglogError::InvalidConfig(
                "max_read_at_once must be greater than zero".into(),
            ));
        }
        if self.max_queued_operations == 0 {
            return Err(SeglogError::InvalidConfig(
                "max_queued_operations must be greater than zero".into(),
            ));
        }
        if self.frame_capacity_bytes < MIN_FRAME_CAPACITY {
            return Err(SeglogError::InvalidConfig(format!(
                "frame_capacity_bytes must be at least {MIN_FRAME_CAPACITY}"
            )));
        }
        Ok(())
    }
}
