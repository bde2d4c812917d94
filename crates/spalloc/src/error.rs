use thiserror::Error;

#[derive(Debug, Error)]
pub enum SpallocError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    SerializationError(String),
    #[error("Allocation service raised an exception: {0}")]
    RemoteException(String),
    #[error("No response from the allocation service within {0:?}")]
    Timeout(std::time::Duration),
    #[error("Protocol error: {0}")]
    ProtocolError(String),
    #[error("Allocator client was closed")]
    Closed,
}

impl SpallocError {
    /// Transport failures are worth retrying, a reply carrying an exception is not.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            SpallocError::IoError(_) | SpallocError::Timeout(_) | SpallocError::ProtocolError(_)
        )
    }
}

impl From<serde_json::error::Error> for SpallocError {
    fn from(e: serde_json::error::Error) -> Self {
        Self::SerializationError(e.to_string())
    }
}

impl From<tokio_util::codec::LinesCodecError> for SpallocError {
    fn from(e: tokio_util::codec::LinesCodecError) -> Self {
        match e {
            tokio_util::codec::LinesCodecError::Io(e) => Self::IoError(e),
            tokio_util::codec::LinesCodecError::MaxLineLengthExceeded => {
                Self::ProtocolError("line length limit exceeded".to_string())
            }
        }
    }
}
