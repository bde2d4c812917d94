use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::{JobId, Map};

/// A job as received from the upstream queue. Never modified by the orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    /// Hardware and software requirements as given by the submitter.
    #[serde(default)]
    pub resources: Map<String, String>,
    /// What the worker should run.
    pub command: String,
    /// Provenance recorded before the job reached the orchestrator.
    #[serde(default)]
    pub provenance: Option<serde_json::Value>,
}

/// Durable reference to a stored output file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataItem {
    pub location: String,
}

/// Everything reported upstream when a job ends, successfully or not.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobCompletion {
    pub log: String,
    pub outputs: Vec<DataItem>,
    /// Core-seconds consumed by the job.
    pub usage: i64,
    pub provenance: Option<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StackFrame {
    pub class_name: String,
    pub method_name: String,
    #[serde(default)]
    pub file_name: Option<String>,
    #[serde(default)]
    pub line_number: i32,
}

/// Error raised by a job, with the stack trace reported by its worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobFailure {
    pub message: String,
    pub stack_trace: Vec<StackFrame>,
}

impl JobFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            stack_trace: Vec::new(),
        }
    }
}

/// The upstream queue that owns the jobs and their persistent status.
#[async_trait::async_trait]
pub trait JobQueue: Send + Sync {
    async fn set_job_running(&self, job_id: JobId) -> anyhow::Result<()>;

    async fn append_job_log(&self, job_id: JobId, text: &str) -> anyhow::Result<()>;

    async fn set_job_finished(&self, job_id: JobId, report: JobCompletion) -> anyhow::Result<()>;

    async fn set_job_error(
        &self,
        job_id: JobId,
        report: JobCompletion,
        failure: JobFailure,
    ) -> anyhow::Result<()>;
}

/// Moves output files into durable storage.
#[async_trait::async_trait]
pub trait OutputStore: Send + Sync {
    /// `files` are relative to `base_dir`.
    async fn add_outputs(
        &self,
        job_id: JobId,
        base_dir: &Path,
        files: &[PathBuf],
    ) -> anyhow::Result<Vec<DataItem>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct OrchestratorStatus {
    pub live_workers: usize,
    pub boards_in_use: u32,
}

/// Receives periodic status of the orchestrator.
#[async_trait::async_trait]
pub trait StatusMonitor: Send + Sync {
    async fn update_status(&self, status: OrchestratorStatus);
}
