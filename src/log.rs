use crate::error::SeglogError;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Address of a durably written record: a log-assigned monotone sequence
/// plus an opaque physical position.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct LogAddress {
    pub sequence: u64,
    pub offset: u64,
}

/// Append-only durable medium. Implementations assign addresses in the
/// order `append` is invoked; the returned future resolves when the record
/// is durable.
pub trait DurableLog: Send + Sync {
    fn append(&self, payload: Vec<u8>) -> BoxFuture<'static, Result<LogAddress, SeglogError>>;
    fn close(&self);
}

#[derive(Debug, Default)]
struct InMemoryLogState {
    records: Vec<(LogAddress, Vec<u8>)>,
    next_sequence: u64,
    next_offset: u64,
    closed: bool,
}

/// Durable log backed by process memory. Appends acknowledge immediately;
/// useful for embedding and for driving the processor in tests.
#[derive(Debug, Default)]
pub struct InMemoryLog {
    state: Mutex<InMemoryLogState>,
}

impl InMemoryLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.state.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn records(&self) -> Vec<(LogAddress, Vec<u8>)> {
        self.state.lock().records.clone()
    }
}

impl DurableLog for InMemoryLog {
    fn append(&self, payload: Vec<u8>) -> BoxFuture<'static, Result<LogAddress, SeglogError>> {
        let result = {
            let mut state = self.state.lock();
            if state.closed {
                Err(SeglogError::Closed("durable log is closed".into()))
            } else {
                state.next_sequence += 1;
                let address = LogAddress {
                    sequence: state.next_sequence,
                    offset: state.next_offset,
                };
                state.next_offset += payload.len() as u64;
                state.records.push((address, payload));
                Ok(address)
            }
        };
        Box::pin(async move { result })
    }

    fn close(&self) {
        self.state.lock().closed = true;
    }
}

#[cfg(test)]
mod tests {
    use super::{DurableLog, InMemoryLog};
    use crate::error::SeglogError;

    #[tokio::test]
    async fn addresses_are_monotone_in_append_order() {
        let log = InMemoryLog::new();
        let a = log.append(vec![1, 2, 3]).await.expect("append");
        let b = log.append(vec![4, 5]).await.expect("append");
        assert!(b.sequence > a.sequence);
        assert_eq!(b.offset, a.offset + 3);
        assert_eq!(log.len(), 2);
    }

    #[tokio::test]
    async fn closed_log_rejects_appends() {
        let log = InMemoryLog::new();
        log.close();
        let err = log.append(vec![0]).await.expect_err("closed");
        assert!(matches!(err, SeglogError::Closed(_)));
    }
}
