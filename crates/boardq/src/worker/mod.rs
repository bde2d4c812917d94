use tokio::sync::mpsc::UnboundedSender;

/// Identifier of a started worker, chosen by the lifecycle strategy.
pub type ExecutorId = String;

/// Reported once for every started worker when it terminates, whatever the cause.
#[derive(Debug, Clone)]
pub struct WorkerExit {
    pub executor_id: ExecutorId,
    /// Output collected from the worker.
    pub log: String,
}

/// Channel through which a lifecycle strategy reports terminated workers.
#[derive(Clone)]
pub struct ExitNotifier {
    sender: UnboundedSender<WorkerExit>,
}

impl ExitNotifier {
    pub(crate) fn new(sender: UnboundedSender<WorkerExit>) -> Self {
        Self { sender }
    }

    pub fn worker_exited(&self, executor_id: ExecutorId, log: String) {
        log::debug!("Worker {executor_id} has exited");
        if self
            .sender
            .send(WorkerExit { executor_id, log })
            .is_err()
        {
            log::debug!("Worker exit was not delivered, orchestrator is gone");
        }
    }
}

/// Strategy that starts workers (local processes, virtual machines, ...).
///
/// A started worker is expected to connect to `callback_address` and ask for a job.
/// The strategy must call [`ExitNotifier::worker_exited`] exactly once for every worker that
/// it has successfully started.
#[async_trait::async_trait]
pub trait WorkerLifecycle: Send + Sync {
    async fn start(
        &self,
        callback_address: &str,
        exits: ExitNotifier,
    ) -> anyhow::Result<ExecutorId>;
}
