use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;

use crate::common::config::{MachinesConfig, OrchestratorConfig};
use crate::machine::{
    ChipCoordinates, FixedMachineManager, HardwareHandle, MachineManager, UnallocationListener,
};
use crate::server::orchestrator::Collaborators;
use crate::server::queue::{
    DataItem, Job, JobCompletion, JobFailure, JobQueue, OrchestratorStatus, OutputStore,
    StatusMonitor,
};
use crate::server::JobOrchestrator;
use crate::worker::{ExecutorId, ExitNotifier, WorkerLifecycle};
use crate::JobId;

pub fn machine(name: &str, boards: u32) -> HardwareHandle {
    HardwareHandle {
        name: name.to_string(),
        version: "5".to_string(),
        width: 8 * boards,
        height: 8,
        boards,
        bmp: None,
    }
}

pub fn job(id: JobId) -> Job {
    Job {
        id,
        resources: Default::default(),
        command: format!("run-{id}.sh"),
        provenance: None,
    }
}

/// Polls `condition` until it holds, panics after a few seconds.
pub async fn wait_until<F: FnMut() -> bool>(mut condition: F) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        if tokio::time::Instant::now() > deadline {
            panic!("Condition was not met in time");
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum QueueEvent {
    Running(JobId),
    Log(JobId, String),
    Finished(JobId, JobCompletion),
    Error(JobId, JobCompletion, JobFailure),
}

#[derive(Default)]
pub struct RecordingQueue {
    events: Mutex<Vec<QueueEvent>>,
}

impl RecordingQueue {
    pub fn events(&self) -> Vec<QueueEvent> {
        self.events.lock().clone()
    }

    /// Finished and failed reports of a job.
    pub fn reports(&self, job_id: JobId) -> Vec<QueueEvent> {
        self.events()
            .into_iter()
            .filter(|e| match e {
                QueueEvent::Finished(id, _) | QueueEvent::Error(id, _, _) => *id == job_id,
                _ => false,
            })
            .collect()
    }
}

#[async_trait::async_trait]
impl JobQueue for RecordingQueue {
    async fn set_job_running(&self, job_id: JobId) -> anyhow::Result<()> {
        self.events.lock().push(QueueEvent::Running(job_id));
        Ok(())
    }

    async fn append_job_log(&self, job_id: JobId, text: &str) -> anyhow::Result<()> {
        self.events.lock().push(QueueEvent::Log(job_id, text.to_string()));
        Ok(())
    }

    async fn set_job_finished(&self, job_id: JobId, report: JobCompletion) -> anyhow::Result<()> {
        self.events.lock().push(QueueEvent::Finished(job_id, report));
        Ok(())
    }

    async fn set_job_error(
        &self,
        job_id: JobId,
        report: JobCompletion,
        failure: JobFailure,
    ) -> anyhow::Result<()> {
        self.events
            .lock()
            .push(QueueEvent::Error(job_id, report, failure));
        Ok(())
    }
}

/// Keeps the content of every stored file.
#[derive(Default)]
pub struct RecordingOutputs {
    stored: Mutex<Vec<(JobId, PathBuf, Vec<u8>)>>,
}

impl RecordingOutputs {
    pub fn stored(&self) -> Vec<(JobId, PathBuf, Vec<u8>)> {
        self.stored.lock().clone()
    }
}

#[async_trait::async_trait]
impl OutputStore for RecordingOutputs {
    async fn add_outputs(
        &self,
        job_id: JobId,
        base_dir: &Path,
        files: &[PathBuf],
    ) -> anyhow::Result<Vec<DataItem>> {
        let mut items = Vec::new();
        for file in files {
            let content = std::fs::read(base_dir.join(file)).unwrap_or_default();
            self.stored.lock().push((job_id, file.clone(), content));
            items.push(DataItem {
                location: format!("store/{job_id}/{}", file.display()),
            });
        }
        Ok(items)
    }
}

/// Starts no real workers; tests play the role of the workers.
#[derive(Default)]
pub struct ScriptedLifecycle {
    started: AtomicUsize,
    fail_starts: AtomicBool,
    notifiers: Mutex<Vec<(ExecutorId, ExitNotifier)>>,
}

impl ScriptedLifecycle {
    pub fn started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }

    pub fn set_fail_starts(&self, fail: bool) {
        self.fail_starts.store(fail, Ordering::SeqCst);
    }

    /// Reports the exit of a started worker.
    pub fn exit(&self, executor_id: &str, log: &str) {
        let notifiers = self.notifiers.lock();
        let (id, notifier) = notifiers
            .iter()
            .find(|(id, _)| id == executor_id)
            .expect("Unknown worker");
        notifier.worker_exited(id.clone(), log.to_string());
    }
}

#[async_trait::async_trait]
impl WorkerLifecycle for ScriptedLifecycle {
    async fn start(
        &self,
        _callback_address: &str,
        exits: ExitNotifier,
    ) -> anyhow::Result<ExecutorId> {
        if self.fail_starts.load(Ordering::SeqCst) {
            anyhow::bail!("No capacity for workers");
        }
        let n = self.started.fetch_add(1, Ordering::SeqCst) + 1;
        let id = format!("worker-{n}");
        self.notifiers.lock().push((id.clone(), exits));
        Ok(id)
    }
}

#[derive(Default)]
pub struct RecordingMonitor {
    statuses: Mutex<Vec<OrchestratorStatus>>,
}

impl RecordingMonitor {
    pub fn statuses(&self) -> Vec<OrchestratorStatus> {
        self.statuses.lock().clone()
    }
}

#[async_trait::async_trait]
impl StatusMonitor for RecordingMonitor {
    async fn update_status(&self, status: OrchestratorStatus) {
        self.statuses.lock().push(status);
    }
}

/// Static pool whose machines can be taken away by the test.
pub struct RevocablePool {
    pool: FixedMachineManager,
    listener: Mutex<Option<UnallocationListener>>,
}

impl RevocablePool {
    pub fn new(machines: Vec<HardwareHandle>) -> Self {
        Self {
            pool: FixedMachineManager::new(machines).unwrap(),
            listener: Mutex::new(None),
        }
    }

    pub fn revoke(&self, machine: &HardwareHandle) {
        if let Some(listener) = self.listener.lock().as_ref() {
            listener.send(machine.clone()).unwrap();
        }
    }
}

#[async_trait::async_trait]
impl MachineManager for RevocablePool {
    async fn get_machines(&self) -> crate::Result<Vec<HardwareHandle>> {
        self.pool.get_machines().await
    }

    async fn get_next_available_machine(&self, min_boards: u32) -> crate::Result<HardwareHandle> {
        self.pool.get_next_available_machine(min_boards).await
    }

    async fn get_largest_available_machine(&self) -> crate::Result<HardwareHandle> {
        self.pool.get_largest_available_machine().await
    }

    fn is_machine_available(&self, machine: &HardwareHandle) -> bool {
        self.pool.is_machine_available(machine)
    }

    async fn wait_for_machine_state_change(
        &self,
        machine: &HardwareHandle,
        timeout: Duration,
    ) -> bool {
        self.pool
            .wait_for_machine_state_change(machine, timeout)
            .await
    }

    async fn release_machine(&self, machine: &HardwareHandle) {
        self.pool.release_machine(machine).await
    }

    async fn set_machine_power(
        &self,
        machine: &HardwareHandle,
        power_on: bool,
    ) -> crate::Result<()> {
        self.pool.set_machine_power(machine, power_on).await
    }

    async fn get_chip_coordinates(
        &self,
        machine: &HardwareHandle,
        x: u32,
        y: u32,
    ) -> crate::Result<ChipCoordinates> {
        self.pool.get_chip_coordinates(machine, x, y).await
    }

    fn set_unallocation_listener(&self, listener: UnallocationListener) {
        *self.listener.lock() = Some(listener);
    }

    async fn close(&self) {
        self.pool.close().await
    }
}

pub fn test_config(machines: &[HardwareHandle], restart: bool) -> OrchestratorConfig {
    OrchestratorConfig {
        callback_address: "http://localhost:1234".to_string(),
        restart_executors_on_failure: restart,
        default_boards: 3,
        status_update_period: Duration::from_millis(20),
        machines: MachinesConfig::Static {
            machines: machines.to_vec(),
        },
    }
}

pub struct TestEnv {
    pub orchestrator: JobOrchestrator,
    pub machines: Arc<dyn MachineManager>,
    pub queue: Arc<RecordingQueue>,
    pub outputs: Arc<RecordingOutputs>,
    pub lifecycle: Arc<ScriptedLifecycle>,
    pub monitor: Arc<RecordingMonitor>,
}

impl TestEnv {
    pub fn new(machines: &[HardwareHandle], restart: bool) -> Self {
        let manager = Arc::new(FixedMachineManager::new(machines.to_vec()).unwrap());
        Self::with_manager(test_config(machines, restart), manager)
    }

    /// Spawns the orchestrator process onto the current runtime.
    pub fn with_manager(config: OrchestratorConfig, manager: Arc<dyn MachineManager>) -> Self {
        let queue = Arc::new(RecordingQueue::default());
        let outputs = Arc::new(RecordingOutputs::default());
        let lifecycle = Arc::new(ScriptedLifecycle::default());
        let monitor = Arc::new(RecordingMonitor::default());
        let (orchestrator, process) = JobOrchestrator::new(
            config,
            Collaborators {
                machines: manager.clone(),
                lifecycle: lifecycle.clone(),
                queue: queue.clone(),
                outputs: outputs.clone(),
                monitor: Some(monitor.clone()),
            },
        );
        tokio::spawn(process);
        Self {
            orchestrator,
            machines: manager,
            queue,
            outputs,
            lifecycle,
            monitor,
        }
    }
}
