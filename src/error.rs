use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeglogErrorCode {
    Io,
    Encode,
    BadOperation,
    BuilderClosed,
    QueueFull,
    Closed,
    NotPrimary,
    DataCorruption,
    InvalidConfig,
}

impl SeglogErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            SeglogErrorCode::Io => "io",
            SeglogErrorCode::Encode => "encode",
            SeglogErrorCode::BadOperation => "bad_operation",
            SeglogErrorCode::BuilderClosed => "builder_closed",
            SeglogErrorCode::QueueFull => "queue_full",
            SeglogErrorCode::Closed => "closed",
            SeglogErrorCode::NotPrimary => "not_primary",
            SeglogErrorCode::DataCorruption => "data_corruption",
            SeglogErrorCode::InvalidConfig => "invalid_config",
        }
    }
}

/// Errors are `Clone` because a single failure fans out to every waiter of
/// every in-flight operation; I/O causes are therefore carried as strings.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SeglogError {
    #[error("io error: {0}")]
    Io(String),
    #[error("encode error: {0}")]
    Encode(String),
    #[error("bad operation: {0}")]
    BadOperation(String),
    #[error("frame builder is closed")]
    BuilderClosed,
    #[error("intake queue is full")]
    QueueFull,
    #[error("closed: {0}")]
    Closed(String),
    #[error("durable log writer is no longer primary: {0}")]
    NotPrimary(String),
    #[error("data corruption: {0}")]
    DataCorruption(String),
    #[error("invalid config: {0}")]
    InvalidConfig(String),
}

impl SeglogError {
    pub fn code(&self) -> SeglogErrorCode {
        match self {
            SeglogError::Io(_) => SeglogErrorCode::Io,
            SeglogError::Encode(_) => SeglogErrorCode::Encode,
            SeglogError::BadOperation(_) => SeglogErrorCode::BadOperation,
            SeglogError::BuilderClosed => SeglogErrorCode::BuilderClosed,
            SeglogError::QueueFull => SeglogErrorCode::QueueFull,
            SeglogError::Closed(_) => SeglogErrorCode::Closed,
            SeglogError::NotPrimary(_) => SeglogErrorCode::NotPrimary,
            SeglogError::DataCorruption(_) => SeglogErrorCode::DataCorruption,
            SeglogError::InvalidConfig(_) => SeglogErrorCode::InvalidConfig,
        }
    }

    pub fn code_str(&self) -> &'static str {
        self.code().as_str()
    }

    /// Fatal errors cannot be recovered from by rebuilding the frame
    /// builder; the processor must stop to preserve evidence (corruption)
    /// or to yield to the new writer (lost primacy).
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SeglogError::DataCorruption(_) | SeglogError::NotPrimary(_)
        )
    }
}

impl From<std::io::Error> for SeglogError {
    fn from(value: std::io::Error) -> Self {
        SeglogError::Io(value.to_string())
    }
}
