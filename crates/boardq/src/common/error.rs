use thiserror::Error;

use crate::JobId;

#[derive(Debug, Error)]
pub enum BoardqError {
    #[error(transparent)]
    IoError(#[from] std::io::Error),
    #[error("Allocator error: {0}")]
    AllocatorError(#[from] spalloc::Error),
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
    #[error("No hardware is available")]
    NoHardware,
    #[error("Unknown job {0}")]
    UnknownJob(JobId),
    #[error("Job {job_id} holds no machine named {name}")]
    MachineNotFound { job_id: JobId, name: String },
    #[error("Allocation was destroyed: {reason}")]
    SessionDestroyed { reason: String },
    #[error("Machine manager was closed")]
    Closed,
    #[error("Invalid configuration: {0}")]
    ConfigError(String),
}

impl From<toml::de::Error> for BoardqError {
    fn from(error: toml::de::Error) -> Self {
        Self::ConfigError(error.to_string())
    }
}
