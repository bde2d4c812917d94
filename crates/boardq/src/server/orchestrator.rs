use std::future::Future;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tempfile::TempDir;
use tokio::sync::mpsc;
use tokio::task::JoinSet;

use crate::common::config::OrchestratorConfig;
use crate::machine::{ChipCoordinates, HardwareHandle, MachineManager};
use crate::server::provenance::ProvenanceTree;
use crate::server::queue::{
    DataItem, Job, JobCompletion, JobFailure, JobQueue, OrchestratorStatus, OutputStore,
    StatusMonitor,
};
use crate::server::sizing::{MachineRequest, SizeRequest, resource_usage, size_request};
use crate::worker::{ExecutorId, ExitNotifier, WorkerExit, WorkerLifecycle};
use crate::{JobId, Map, Set};

/// Provenance key under which the name of every granted machine is recorded.
const MACHINE_PROVENANCE_KEY: &str = "spinnaker_machine";

const UNCLEAN_EXIT_MESSAGE: &str = "Job did not finish cleanly";

/// External components the orchestrator works with.
pub struct Collaborators {
    pub machines: Arc<dyn MachineManager>,
    pub lifecycle: Arc<dyn WorkerLifecycle>,
    pub queue: Arc<dyn JobQueue>,
    pub outputs: Arc<dyn OutputStore>,
    pub monitor: Option<Arc<dyn StatusMonitor>>,
}

struct Registration {
    job_id: JobId,
    /// The job was finished or failed through the worker API.
    reported: bool,
}

#[derive(Default)]
struct ExecutorTable {
    live: Set<ExecutorId>,
    /// Worker starts that have not returned yet.
    starting: usize,
    /// Workers whose exit arrived before their start was confirmed.
    early_exits: Set<ExecutorId>,
    registrations: Map<ExecutorId, Registration>,
    executor_of_job: Map<JobId, ExecutorId>,
    pending_jobs: usize,
}

#[derive(Debug, Clone, Copy)]
struct LedgerEntry {
    core_quota: i64,
    usage: i64,
}

struct OrchestratorInner {
    config: OrchestratorConfig,
    machines: Arc<dyn MachineManager>,
    lifecycle: Arc<dyn WorkerLifecycle>,
    queue: Arc<dyn JobQueue>,
    outputs: Arc<dyn OutputStore>,
    monitor: Option<Arc<dyn StatusMonitor>>,
    exit_notifier: ExitNotifier,

    pending_sender: mpsc::UnboundedSender<Job>,
    /// Waiting workers queue up on this lock, which hands out jobs in FIFO order.
    pending_receiver: tokio::sync::Mutex<mpsc::UnboundedReceiver<Job>>,

    executors: Mutex<ExecutorTable>,
    allocations: Mutex<Map<JobId, Vec<HardwareHandle>>>,
    ledger: Mutex<Map<JobId, LedgerEntry>>,
    provenance: Mutex<Map<JobId, ProvenanceTree>>,
    uploads: Mutex<Map<JobId, TempDir>>,
}

/// Matches queued jobs with workers and hardware.
///
/// Every piece of per-job state lives behind its own lock and no lock is held while
/// waiting on a collaborator.
#[derive(Clone)]
pub struct JobOrchestrator {
    inner: Arc<OrchestratorInner>,
}

impl JobOrchestrator {
    /// Creates the orchestrator and the future that processes worker exits, machines taken
    /// away by the allocator and status reports. The future has to be polled for the
    /// orchestrator to react to these events.
    pub fn new(
        config: OrchestratorConfig,
        collaborators: Collaborators,
    ) -> (JobOrchestrator, impl Future<Output = ()>) {
        let (exit_sender, exit_receiver) = mpsc::unbounded_channel();
        let (unallocation_sender, unallocation_receiver) = mpsc::unbounded_channel();
        let (pending_sender, pending_receiver) = mpsc::unbounded_channel();
        collaborators
            .machines
            .set_unallocation_listener(unallocation_sender);

        let orchestrator = JobOrchestrator {
            inner: Arc::new(OrchestratorInner {
                config,
                machines: collaborators.machines,
                lifecycle: collaborators.lifecycle,
                queue: collaborators.queue,
                outputs: collaborators.outputs,
                monitor: collaborators.monitor,
                exit_notifier: ExitNotifier::new(exit_sender),
                pending_sender,
                pending_receiver: tokio::sync::Mutex::new(pending_receiver),
                executors: Default::default(),
                allocations: Default::default(),
                ledger: Default::default(),
                provenance: Default::default(),
                uploads: Default::default(),
            }),
        };
        let process =
            orchestrator_process(orchestrator.clone(), exit_receiver, unallocation_receiver);
        (orchestrator, process)
    }

    pub fn machine_manager(&self) -> &Arc<dyn MachineManager> {
        &self.inner.machines
    }

    /// Queues the job and starts one more worker for it.
    pub async fn add_job(&self, job: Job) {
        log::info!("New job {}", job.id);
        if let Some(initial) = job.provenance.clone() {
            match ProvenanceTree::from_value(initial) {
                Some(tree) => {
                    self.inner.provenance.lock().insert(job.id, tree);
                }
                None => log::warn!("Ignoring provenance of job {}, it is not an object", job.id),
            }
        }
        self.inner.executors.lock().pending_jobs += 1;
        if self.inner.pending_sender.send(job).is_err() {
            log::error!("Pending job queue is closed");
        }
        self.start_worker().await;
    }

    async fn start_worker(&self) -> bool {
        let inner = &self.inner;
        inner.executors.lock().starting += 1;
        let result = inner
            .lifecycle
            .start(&inner.config.callback_address, inner.exit_notifier.clone())
            .await;

        let mut executors = inner.executors.lock();
        executors.starting -= 1;
        let started = match result {
            Ok(executor_id) => {
                if executors.early_exits.remove(&executor_id) {
                    log::debug!("Worker {executor_id} has exited before its start was confirmed");
                } else {
                    log::info!("Started worker {executor_id}");
                    executors.live.insert(executor_id);
                }
                true
            }
            Err(error) => {
                log::error!("Could not start worker: {error:#}");
                false
            }
        };
        if executors.starting == 0 {
            executors.early_exits.clear();
        }
        started
    }

    /// Waits for the next queued job and assigns it to the worker.
    pub async fn get_next_job(&self, executor_id: &str) -> crate::Result<Job> {
        let job = {
            let mut receiver = self.inner.pending_receiver.lock().await;
            receiver.recv().await.ok_or(crate::Error::Closed)?
        };
        {
            let mut executors = self.inner.executors.lock();
            executors.pending_jobs = executors.pending_jobs.saturating_sub(1);
            executors.registrations.insert(
                executor_id.to_string(),
                Registration {
                    job_id: job.id,
                    reported: false,
                },
            );
            executors
                .executor_of_job
                .insert(job.id, executor_id.to_string());
        }
        log::info!("Worker {executor_id} is running job {}", job.id);
        if let Err(error) = self.inner.queue.set_job_running(job.id).await {
            log::error!("Could not mark job {} as running: {error:#}", job.id);
        }
        Ok(job)
    }

    /// Allocates the largest free unit and accounts the job for all of its boards.
    pub async fn get_largest_job_machine(
        &self,
        job_id: JobId,
        run_time_ms: f64,
    ) -> crate::Result<HardwareHandle> {
        // Reject a bad run time before anything is allocated
        resource_usage(0, run_time_ms)?;
        let machine = self.inner.machines.get_largest_available_machine().await?;
        let request = size_request(
            SizeRequest {
                cores: -1,
                chips: -1,
                boards: machine.boards as i64,
            },
            self.inner.config.default_boards,
        )
        .and_then(|request| {
            let usage = resource_usage(request.core_quota, run_time_ms)?;
            Ok((request, usage))
        });
        match request {
            Ok((request, usage)) => {
                self.record_lease(job_id, machine.clone(), request.core_quota, usage);
                Ok(machine)
            }
            Err(error) => {
                self.inner.machines.release_machine(&machine).await;
                Err(error)
            }
        }
    }

    /// Sizes the request, allocates a unit for it and starts accounting its usage.
    pub async fn get_job_machine(
        &self,
        job_id: JobId,
        size: SizeRequest,
        run_time_ms: f64,
    ) -> crate::Result<HardwareHandle> {
        log::info!(
            "Job {job_id} requests {} cores or {} chips or {} boards for {}s",
            size.cores,
            size.chips,
            size.boards,
            run_time_ms / 1000.0
        );
        let request = size_request(size, self.inner.config.default_boards)?;
        self.lease_machine(job_id, request, run_time_ms).await
    }

    async fn lease_machine(
        &self,
        job_id: JobId,
        request: MachineRequest,
        run_time_ms: f64,
    ) -> crate::Result<HardwareHandle> {
        let usage = resource_usage(request.core_quota, run_time_ms)?;
        let machine = self
            .inner
            .machines
            .get_next_available_machine(request.boards)
            .await?;
        self.record_lease(job_id, machine.clone(), request.core_quota, usage);
        Ok(machine)
    }

    fn record_lease(&self, job_id: JobId, machine: HardwareHandle, core_quota: i64, usage: i64) {
        log::info!("Running job {job_id} on {machine}");
        log::debug!("Resource usage of job {job_id}: {usage}");
        self.inner.ledger.lock().insert(job_id, LedgerEntry { core_quota, usage });
        self.add_provenance(
            job_id,
            &[MACHINE_PROVENANCE_KEY.to_string()],
            machine.name.clone(),
        );
        self.inner
            .allocations
            .lock()
            .entry(job_id)
            .or_default()
            .push(machine);
    }

    /// Recomputes the usage of the job for the given total run time.
    pub fn extend_job_machine_lease(&self, job_id: JobId, run_time_ms: f64) -> crate::Result<()> {
        let mut ledger = self.inner.ledger.lock();
        let entry = ledger
            .get_mut(&job_id)
            .ok_or(crate::Error::UnknownJob(job_id))?;
        entry.usage = resource_usage(entry.core_quota, run_time_ms)?;
        log::info!("Usage of job {job_id} is now {}", entry.usage);
        Ok(())
    }

    /// Returns `false` when any unit of the job is gone, possibly after waiting up to
    /// `wait_time` for a change of any of them.
    pub async fn check_machine_lease(&self, job_id: JobId, wait_time: Duration) -> bool {
        let Some(machines) = self.inner.allocations.lock().get(&job_id).cloned() else {
            log::debug!("Lease check of job {job_id} that holds no machines");
            return false;
        };
        let manager = &self.inner.machines;
        if !machines.iter().all(|m| manager.is_machine_available(m)) {
            return false;
        }

        let (sender, mut receiver) = mpsc::channel(machines.len().max(1));
        let mut watchers = JoinSet::new();
        for machine in machines.iter().cloned() {
            let manager = manager.clone();
            let sender = sender.clone();
            watchers.spawn(async move {
                if manager
                    .wait_for_machine_state_change(&machine, wait_time)
                    .await
                {
                    let _ = sender.send(machine).await;
                }
            });
        }
        drop(sender);
        if let Ok(Some(machine)) = tokio::time::timeout(wait_time, receiver.recv()).await {
            log::debug!("State of machine {machine} of job {job_id} has changed");
        }
        // Remaining watchers are not needed anymore
        watchers.abort_all();

        machines.iter().all(|m| manager.is_machine_available(m))
    }

    pub async fn append_log(&self, job_id: JobId, text: &str) {
        log::debug!("Updating log of job {job_id}");
        log::trace!("{job_id}: {text}");
        if let Err(error) = self.inner.queue.append_job_log(job_id, text).await {
            log::error!("Could not append log of job {job_id}: {error:#}");
        }
    }

    /// Conflicting paths are logged and ignored.
    pub fn add_provenance(&self, job_id: JobId, path: &[String], value: String) {
        let mut provenance = self.inner.provenance.lock();
        if let Err(error) = provenance.entry(job_id).or_default().add(path, value) {
            log::warn!("Could not add provenance item {path:?} to job {job_id}: {error}");
        }
    }

    /// Stores an uploaded output file until the job ends.
    pub async fn add_output(&self, job_id: JobId, filename: &str, data: &[u8]) -> crate::Result<()> {
        let relative = Path::new(filename);
        if filename.is_empty()
            || !relative
                .components()
                .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
        {
            return Err(crate::Error::InvalidRequest(format!(
                "Invalid output file name `{filename}`"
            )));
        }
        let directory = {
            let mut uploads = self.inner.uploads.lock();
            match uploads.get(&job_id) {
                Some(dir) => dir.path().to_path_buf(),
                None => {
                    let dir = tempfile::Builder::new().prefix("job-output-").tempdir()?;
                    let path = dir.path().to_path_buf();
                    uploads.insert(job_id, dir);
                    path
                }
            }
        };
        let target = directory.join(relative);
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&target, data).await?;
        log::debug!("Stored output {filename} of job {job_id}");
        Ok(())
    }

    fn find_machine(&self, job_id: JobId, name: &str) -> crate::Result<HardwareHandle> {
        let allocations = self.inner.allocations.lock();
        let machines = allocations
            .get(&job_id)
            .ok_or(crate::Error::UnknownJob(job_id))?;
        machines
            .iter()
            .find(|m| m.name == name)
            .cloned()
            .ok_or_else(|| crate::Error::MachineNotFound {
                job_id,
                name: name.to_string(),
            })
    }

    /// Gives one unit of a running job back to the machine manager.
    pub async fn release_machine(&self, job_id: JobId, name: &str) -> crate::Result<()> {
        let machine = {
            let mut allocations = self.inner.allocations.lock();
            let machines = allocations
                .get_mut(&job_id)
                .ok_or(crate::Error::UnknownJob(job_id))?;
            let index = machines.iter().position(|m| m.name == name).ok_or_else(|| {
                crate::Error::MachineNotFound {
                    job_id,
                    name: name.to_string(),
                }
            })?;
            let machine = machines.remove(index);
            if machines.is_empty() {
                allocations.remove(&job_id);
            }
            machine
        };
        log::info!("Job {job_id} releases {machine}");
        self.inner.machines.release_machine(&machine).await;
        Ok(())
    }

    pub async fn set_machine_power(
        &self,
        job_id: JobId,
        name: &str,
        power_on: bool,
    ) -> crate::Result<()> {
        let machine = self.find_machine(job_id, name)?;
        self.inner
            .machines
            .set_machine_power(&machine, power_on)
            .await
    }

    pub async fn get_chip_coordinates(
        &self,
        job_id: JobId,
        name: &str,
        x: u32,
        y: u32,
    ) -> crate::Result<ChipCoordinates> {
        let machine = self.find_machine(job_id, name)?;
        self.inner
            .machines
            .get_chip_coordinates(&machine, x, y)
            .await
    }

    pub async fn set_job_finished(
        &self,
        job_id: JobId,
        job_log: String,
        base_dir: &Path,
        outputs: &[PathBuf],
    ) {
        log::info!("Marking job {job_id} as finished");
        self.mark_reported(job_id);
        let report = self
            .complete_job(job_id, job_log, Some(base_dir), outputs)
            .await;
        if let Err(error) = self.inner.queue.set_job_finished(job_id, report).await {
            log::error!("Could not report job {job_id} as finished: {error:#}");
        }
    }

    pub async fn set_job_error(
        &self,
        job_id: JobId,
        failure: JobFailure,
        job_log: String,
        base_dir: &Path,
        outputs: &[PathBuf],
    ) {
        log::info!("Marking job {job_id} as failed: {}", failure.message);
        self.mark_reported(job_id);
        let report = self
            .complete_job(job_id, job_log, Some(base_dir), outputs)
            .await;
        if let Err(error) = self
            .inner
            .queue
            .set_job_error(job_id, report, failure)
            .await
        {
            log::error!("Could not report job {job_id} as failed: {error:#}");
        }
    }

    /// Handles the termination of a worker.
    pub async fn worker_exited(&self, executor_id: &str, output: String) {
        let (registration, missing_workers) = {
            let mut executors = self.inner.executors.lock();
            if !executors.live.remove(executor_id) {
                if executors.starting > 0 {
                    executors.early_exits.insert(executor_id.to_string());
                } else {
                    log::debug!("Exit of worker {executor_id} that is not running");
                }
            }
            let registration = executors.registrations.remove(executor_id);
            if let Some(registration) = &registration {
                if executors
                    .executor_of_job
                    .get(&registration.job_id)
                    .is_some_and(|id| id == executor_id)
                {
                    executors.executor_of_job.remove(&registration.job_id);
                }
            }
            let missing = if registration.is_none() && self.inner.config.restart_executors_on_failure
            {
                executors.pending_jobs.saturating_sub(executors.live.len())
            } else {
                0
            };
            (registration, missing)
        };

        match registration {
            Some(Registration {
                job_id,
                reported: false,
            }) => {
                log::warn!("Worker {executor_id} of job {job_id} has exited, but the job did not finish cleanly");
                let report = self.complete_job(job_id, output, None, &[]).await;
                if let Err(error) = self
                    .inner
                    .queue
                    .set_job_error(job_id, report, JobFailure::new(UNCLEAN_EXIT_MESSAGE))
                    .await
                {
                    log::error!("Could not report job {job_id} as failed: {error:#}");
                }
            }
            Some(Registration {
                job_id,
                reported: true,
            }) => {
                log::debug!("Worker {executor_id} of job {job_id} has exited");
                if self.release_allocation(job_id).await {
                    log::warn!("Job {job_id} has acquired machines after it was finished");
                }
            }
            None => {
                log::error!(
                    "Worker {executor_id} has exited without a job. This could indicate an error!"
                );
                if !output.is_empty() {
                    log::error!("{output}");
                }
                if missing_workers > 0 {
                    log::warn!("Restarting {missing_workers} worker(s) for pending jobs");
                    for _ in 0..missing_workers {
                        self.start_worker().await;
                    }
                }
            }
        }
    }

    fn mark_reported(&self, job_id: JobId) {
        let mut executors = self.inner.executors.lock();
        let ExecutorTable {
            registrations,
            executor_of_job,
            ..
        } = &mut *executors;
        if let Some(registration) = executor_of_job
            .get(&job_id)
            .and_then(|id| registrations.get_mut(id))
        {
            registration.reported = true;
        }
    }

    /// Returns `true` if the job held any machine.
    async fn release_allocation(&self, job_id: JobId) -> bool {
        let Some(machines) = self.inner.allocations.lock().remove(&job_id) else {
            return false;
        };
        for machine in &machines {
            log::debug!("Releasing {machine} of job {job_id}");
            self.inner.machines.release_machine(machine).await;
        }
        !machines.is_empty()
    }

    /// Releases everything held by the job and gathers its final report.
    /// Repeated calls find nothing to release and report no usage or provenance.
    async fn complete_job(
        &self,
        job_id: JobId,
        job_log: String,
        base_dir: Option<&Path>,
        outputs: &[PathBuf],
    ) -> JobCompletion {
        self.release_allocation(job_id).await;
        let usage = self
            .inner
            .ledger
            .lock()
            .remove(&job_id)
            .map(|entry| entry.usage)
            .unwrap_or(0);
        let provenance = self
            .inner
            .provenance
            .lock()
            .remove(&job_id)
            .map(ProvenanceTree::into_value);
        let outputs = self.collect_outputs(job_id, base_dir, outputs).await;
        JobCompletion {
            log: job_log,
            outputs,
            usage,
            provenance,
        }
    }

    async fn collect_outputs(
        &self,
        job_id: JobId,
        base_dir: Option<&Path>,
        outputs: &[PathBuf],
    ) -> Vec<DataItem> {
        let mut items = Vec::new();
        if let Some(base_dir) = base_dir {
            if !outputs.is_empty() {
                match self.inner.outputs.add_outputs(job_id, base_dir, outputs).await {
                    Ok(stored) => items.extend(stored),
                    Err(error) => {
                        log::error!("Could not store outputs of job {job_id}: {error:#}")
                    }
                }
            }
        }

        let uploads = self.inner.uploads.lock().remove(&job_id);
        if let Some(directory) = uploads {
            let files: Vec<PathBuf> = walkdir::WalkDir::new(directory.path())
                .into_iter()
                .filter_map(|entry| entry.ok())
                .filter(|entry| entry.file_type().is_file())
                .filter_map(|entry| {
                    entry
                        .path()
                        .strip_prefix(directory.path())
                        .ok()
                        .map(Path::to_path_buf)
                })
                .collect();
            if !files.is_empty() {
                match self
                    .inner
                    .outputs
                    .add_outputs(job_id, directory.path(), &files)
                    .await
                {
                    Ok(stored) => items.extend(stored),
                    Err(error) => {
                        log::error!("Could not store uploaded outputs of job {job_id}: {error:#}")
                    }
                }
            }
        }
        items
    }

    async fn machine_unallocated(&self, machine: HardwareHandle) {
        let job_id = self
            .inner
            .allocations
            .lock()
            .iter()
            .find(|(_, machines)| machines.contains(&machine))
            .map(|(job_id, _)| *job_id);
        match job_id {
            Some(job_id) => {
                log::warn!("Machine {machine} of job {job_id} was taken away by the allocator");
                self.append_log(
                    job_id,
                    &format!("Machine {} was unallocated by the allocator\n", machine.name),
                )
                .await;
            }
            None => log::debug!("Machine {machine} was unallocated while not leased to a job"),
        }
    }

    pub fn status(&self) -> OrchestratorStatus {
        let live_workers = self.inner.executors.lock().live.len();
        let boards_in_use = self
            .inner
            .allocations
            .lock()
            .values()
            .flatten()
            .map(|m| m.boards)
            .sum();
        OrchestratorStatus {
            live_workers,
            boards_in_use,
        }
    }

    async fn report_status(&self) {
        if let Some(monitor) = &self.inner.monitor {
            monitor.update_status(self.status()).await;
        }
    }

    pub fn pending_jobs(&self) -> usize {
        self.inner.executors.lock().pending_jobs
    }

    pub fn allocated_machines(&self, job_id: JobId) -> Vec<HardwareHandle> {
        self.inner
            .allocations
            .lock()
            .get(&job_id)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn close(&self) {
        self.inner.machines.close().await;
    }
}

async fn orchestrator_process(
    orchestrator: JobOrchestrator,
    mut exits: mpsc::UnboundedReceiver<WorkerExit>,
    mut unallocations: mpsc::UnboundedReceiver<HardwareHandle>,
) {
    let mut status_interval =
        tokio::time::interval(orchestrator.inner.config.status_update_period);
    loop {
        tokio::select! {
            Some(exit) = exits.recv() => {
                orchestrator.worker_exited(&exit.executor_id, exit.log).await;
            }
            Some(machine) = unallocations.recv() => {
                orchestrator.machine_unallocated(machine).await;
            }
            _ = status_interval.tick() => {
                orchestrator.report_status().await;
            }
        }
    }
}
