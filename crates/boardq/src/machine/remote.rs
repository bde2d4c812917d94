use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use spalloc::{
    AllocatorClient, JobMachineInfo, Notifications, SessionId, SessionState, SessionStatus,
    create_allocator_client,
};
use tokio::sync::watch;
use tokio::task::JoinSet;

use crate::common::config::RemoteAllocatorConfig;
use crate::machine::{ChipCoordinates, HardwareHandle, MachineManager, UnallocationListener};
use crate::Map;

/// Tag of the machines that are offered to jobs.
const DEFAULT_TAG: &str = "default";

/// Machines are listed in triads of boards, 12x12 chips each.
const TRIAD_CHIPS: u32 = 12;

/// Fallback poll of a session that does not send notifications.
const SESSION_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Terminal result of waiting for a session.
#[derive(Debug, Clone, PartialEq, Eq)]
enum SessionOutcome {
    Ready,
    Destroyed { reason: String },
}

struct Session {
    state: SessionState,
    machine: Option<HardwareHandle>,
}

#[derive(Default)]
struct SessionTable {
    sessions: Map<SessionId, Session>,
    by_machine: Map<HardwareHandle, SessionId>,
}

struct RemoteShared {
    client: AllocatorClient,
    config: RemoteAllocatorConfig,
    table: Mutex<SessionTable>,
    /// Bumped whenever the state of a tracked session changes.
    changed: watch::Sender<u64>,
    listener: Mutex<Option<UnallocationListener>>,
}

/// Hands out units allocated on demand by a remote allocation service.
pub struct RemoteMachineManager {
    shared: Arc<RemoteShared>,
    tasks: Mutex<JoinSet<()>>,
}

impl RemoteMachineManager {
    /// Connects to the service and starts the keepalive and notification processing.
    /// Has to be called within a Tokio runtime.
    pub fn start(config: RemoteAllocatorConfig) -> Self {
        let (client, notifications, connection) = create_allocator_client(config.client_config());
        let shared = Arc::new(RemoteShared {
            client,
            config,
            table: Mutex::new(SessionTable::default()),
            changed: watch::Sender::new(0),
            listener: Mutex::new(None),
        });

        let mut tasks = JoinSet::new();
        tasks.spawn(connection);
        tasks.spawn(keepalive_process(shared.clone()));
        tasks.spawn(notification_process(shared.clone(), notifications));
        Self {
            shared,
            tasks: Mutex::new(tasks),
        }
    }
}

/// Boards that are requested for `boards` boards.
pub(crate) fn session_boards(boards: u32, round_to_triads: bool) -> u32 {
    if round_to_triads && boards > 1 {
        boards.div_ceil(3) * 3
    } else {
        boards.max(1)
    }
}

/// Machines are identified by the hostname of their first ethernet chip.
fn machine_from_info(
    id: SessionId,
    info: &JobMachineInfo,
    version: &str,
) -> crate::Result<HardwareHandle> {
    let Some(first) = info.connections.first() else {
        return Err(spalloc::Error::ProtocolError(format!(
            "Session {id} is ready but reports no connections"
        ))
        .into());
    };
    Ok(HardwareHandle {
        name: first.hostname.clone(),
        version: version.to_string(),
        width: info.width,
        height: info.height,
        boards: info.connections.len() as u32,
        bmp: None,
    })
}

impl RemoteShared {
    /// Repeats a command until it gets a reply; transport failures are only logged.
    async fn retrying<T, F, Fut>(&self, what: &str, mut command: F) -> crate::Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = spalloc::Result<T>>,
    {
        loop {
            match command().await {
                Ok(value) => return Ok(value),
                Err(spalloc::Error::Closed) => return Err(crate::Error::Closed),
                Err(error) if error.is_transient() => {
                    log::warn!("Could not {what}, retrying: {error}");
                    tokio::time::sleep(self.config.reconnect_delay).await;
                }
                Err(error) => return Err(error.into()),
            }
        }
    }

    fn notify_change(&self) {
        self.changed.send_modify(|version| *version += 1);
    }

    fn session_of(&self, machine: &HardwareHandle) -> Option<SessionId> {
        self.table.lock().by_machine.get(machine).copied()
    }

    fn session_state(&self, id: SessionId) -> Option<SessionState> {
        self.table.lock().sessions.get(&id).map(|s| s.state)
    }

    /// Records a fresh state of a tracked session.
    /// A destroyed session is forgotten and its machine reported to the unallocation listener.
    fn apply_status(&self, id: SessionId, status: &SessionStatus) {
        let unallocated = {
            let mut table = self.table.lock();
            let Some(session) = table.sessions.get_mut(&id) else {
                return;
            };
            if session.state == status.state {
                return;
            }
            log::debug!("Session {id} changed state to {:?}", status.state);
            session.state = status.state;
            if status.is_terminal() {
                table.sessions.remove(&id).and_then(|session| {
                    let machine = session.machine?;
                    table.by_machine.remove(&machine);
                    Some(machine)
                })
            } else {
                None
            }
        };
        self.notify_change();

        if let Some(machine) = unallocated {
            log::warn!(
                "Machine {machine} was taken away by the allocator: {}",
                status.reason.as_deref().unwrap_or("no reason given")
            );
            if let Some(listener) = self.listener.lock().as_ref() {
                let _ = listener.send(machine);
            }
        }
    }

    async fn refresh_session(&self, id: SessionId) {
        if self.session_state(id).is_none() {
            return;
        }
        match self.client.job_state(id).await {
            Ok(status) => self.apply_status(id, &status),
            Err(error) => log::warn!("Could not refresh state of session {id}: {error}"),
        }
    }

    /// Polls the session until it is ready or destroyed.
    async fn wait_for_session(&self, id: SessionId) -> crate::Result<SessionOutcome> {
        let mut changed = self.changed.subscribe();
        loop {
            let status = self
                .retrying("get session state", || self.client.job_state(id))
                .await?;
            self.apply_status(id, &status);
            match status.state {
                SessionState::Ready => return Ok(SessionOutcome::Ready),
                SessionState::Destroyed => {
                    return Ok(SessionOutcome::Destroyed {
                        reason: status.reason.unwrap_or_else(|| "unknown".to_string()),
                    });
                }
                SessionState::Unknown | SessionState::Queued | SessionState::Power => {}
            }
            let _ = tokio::time::timeout(SESSION_POLL_INTERVAL, changed.changed()).await;
        }
    }

    fn forget_session(&self, id: SessionId) {
        let mut table = self.table.lock();
        if let Some(machine) = table.sessions.remove(&id).and_then(|s| s.machine) {
            table.by_machine.remove(&machine);
        }
    }

    async fn destroy_session(&self, id: SessionId) {
        if let Err(error) = self.client.notify_job(id, false).await {
            log::warn!("Could not disable notifications of session {id}: {error}");
        }
        if let Err(error) = self.client.destroy_job(id).await {
            log::error!("Could not destroy session {id}: {error}");
        }
    }

    /// Keeps trying until the service grants a session or destroys it.
    async fn allocate(&self, boards: u32) -> crate::Result<HardwareHandle> {
        let boards = session_boards(boards, self.config.round_to_triads);
        loop {
            match self.try_allocate(boards).await {
                Ok(machine) => return Ok(machine),
                Err(error @ (crate::Error::SessionDestroyed { .. } | crate::Error::Closed)) => {
                    return Err(error);
                }
                Err(error) => {
                    log::warn!("Could not allocate {boards} board(s), retrying: {error}");
                    tokio::time::sleep(self.config.reconnect_delay).await;
                }
            }
        }
    }

    async fn try_allocate(&self, boards: u32) -> crate::Result<HardwareHandle> {
        let config = &self.config;
        let id = self
            .retrying("create session", || {
                self.client.create_job(boards, &config.owner, &config.tags)
            })
            .await?;
        log::info!("Created session {id} for {boards} board(s)");
        self.table.lock().sessions.insert(
            id,
            Session {
                state: SessionState::Unknown,
                machine: None,
            },
        );

        let result = self.resolve_session(id).await;
        if result.is_err() {
            self.forget_session(id);
            self.destroy_session(id).await;
        }
        result
    }

    async fn resolve_session(&self, id: SessionId) -> crate::Result<HardwareHandle> {
        self.retrying("enable notifications", || self.client.notify_job(id, true))
            .await?;
        if let SessionOutcome::Destroyed { reason } = self.wait_for_session(id).await? {
            log::warn!("Session {id} was destroyed before becoming ready: {reason}");
            return Err(crate::Error::SessionDestroyed { reason });
        }
        let info = self
            .retrying("get machine of session", || self.client.job_machine_info(id))
            .await?;
        let machine = machine_from_info(id, &info, &self.config.machine_version)?;

        let mut table = self.table.lock();
        let Some(session) = table.sessions.get_mut(&id) else {
            return Err(crate::Error::SessionDestroyed {
                reason: "destroyed while resolving its machine".to_string(),
            });
        };
        session.machine = Some(machine.clone());
        table.by_machine.insert(machine.clone(), id);
        log::info!("Session {id} is ready on machine {machine}");
        Ok(machine)
    }
}

async fn keepalive_process(shared: Arc<RemoteShared>) {
    let mut interval = tokio::time::interval(shared.config.keepalive_period);
    loop {
        interval.tick().await;
        if shared.client.is_closed() {
            break;
        }
        let ids: Vec<SessionId> = shared.table.lock().sessions.keys().copied().collect();
        for id in ids {
            match shared.client.keepalive(id).await {
                Ok(()) => {}
                Err(spalloc::Error::Closed) => return,
                Err(error) => log::warn!("Keepalive of session {id} failed: {error}"),
            }
        }
    }
}

async fn notification_process(shared: Arc<RemoteShared>, mut notifications: Notifications) {
    while let Some(ids) = notifications.next().await {
        // Sent after every reconnection, changes may have been missed in the meantime
        let ids = if ids.is_empty() {
            shared.table.lock().sessions.keys().copied().collect()
        } else {
            ids
        };
        for id in ids {
            shared.refresh_session(id).await;
        }
    }
    log::debug!("Allocator notification stream has ended");
}

#[async_trait::async_trait]
impl MachineManager for RemoteMachineManager {
    async fn get_machines(&self) -> crate::Result<Vec<HardwareHandle>> {
        let shared = &self.shared;
        let machines = shared
            .retrying("list machines", || shared.client.list_machines())
            .await?;
        Ok(machines
            .into_iter()
            .filter(|m| m.has_tag(DEFAULT_TAG))
            .map(|m| HardwareHandle {
                name: m.name,
                version: shared.config.machine_version.clone(),
                width: m.width * TRIAD_CHIPS,
                height: m.height * TRIAD_CHIPS,
                boards: m.width * m.height,
                bmp: None,
            })
            .collect())
    }

    async fn get_next_available_machine(&self, min_boards: u32) -> crate::Result<HardwareHandle> {
        self.shared.allocate(min_boards).await
    }

    fn is_machine_available(&self, machine: &HardwareHandle) -> bool {
        let table = self.shared.table.lock();
        table
            .by_machine
            .get(machine)
            .and_then(|id| table.sessions.get(id))
            .is_some_and(|s| s.state != SessionState::Destroyed)
    }

    async fn wait_for_machine_state_change(
        &self,
        machine: &HardwareHandle,
        timeout: Duration,
    ) -> bool {
        let mut changed = self.shared.changed.subscribe();
        let state = || {
            self.shared
                .session_of(machine)
                .and_then(|id| self.shared.session_state(id))
        };
        let before = state();
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            match tokio::time::timeout_at(deadline, changed.changed()).await {
                Ok(Ok(())) => {
                    if state() != before {
                        return true;
                    }
                }
                Ok(Err(_)) => return state() != before,
                Err(_) => return false,
            }
        }
    }

    async fn release_machine(&self, machine: &HardwareHandle) {
        let id = {
            let mut table = self.shared.table.lock();
            let Some(id) = table.by_machine.remove(machine) else {
                log::warn!("Releasing machine {machine} that is not allocated");
                return;
            };
            table.sessions.remove(&id);
            id
        };
        self.shared.notify_change();
        log::info!("Releasing session {id} of machine {machine}");
        self.shared.destroy_session(id).await;
    }

    async fn set_machine_power(
        &self,
        machine: &HardwareHandle,
        power_on: bool,
    ) -> crate::Result<()> {
        let shared = &self.shared;
        let Some(id) = shared.session_of(machine) else {
            return Err(crate::Error::InvalidRequest(format!(
                "Machine {machine} is not allocated"
            )));
        };
        log::debug!(
            "Switching session {id} {}",
            if power_on { "on" } else { "off" }
        );
        shared
            .retrying("switch power", || {
                shared.client.power_job_boards(id, power_on)
            })
            .await?;
        if power_on {
            if let SessionOutcome::Destroyed { reason } = shared.wait_for_session(id).await? {
                return Err(crate::Error::SessionDestroyed { reason });
            }
        }
        Ok(())
    }

    async fn get_chip_coordinates(
        &self,
        machine: &HardwareHandle,
        x: u32,
        y: u32,
    ) -> crate::Result<ChipCoordinates> {
        let shared = &self.shared;
        let Some(id) = shared.session_of(machine) else {
            return Err(crate::Error::InvalidRequest(format!(
                "Machine {machine} is not allocated"
            )));
        };
        let location = shared
            .retrying("locate chip", || shared.client.where_is(id, x, y))
            .await?;
        match location.and_then(|l| l.physical) {
            Some([cabinet, frame, board]) => Ok(ChipCoordinates {
                cabinet,
                frame,
                board,
            }),
            None => Err(crate::Error::InvalidRequest(format!(
                "Chip ({x}, {y}) is not part of machine {machine}"
            ))),
        }
    }

    fn set_unallocation_listener(&self, listener: UnallocationListener) {
        *self.shared.listener.lock() = Some(listener);
    }

    async fn close(&self) {
        let ids: Vec<SessionId> = self.shared.table.lock().sessions.keys().copied().collect();
        let connected = self.shared.client.is_connected();
        let limit = self.shared.config.response_timeout * 2;
        for id in ids {
            self.shared.forget_session(id);
            if !connected {
                log::warn!("Not connected, session {id} is left to expire");
                continue;
            }
            if tokio::time::timeout(limit, self.shared.destroy_session(id))
                .await
                .is_err()
            {
                log::warn!("Session {id} could not be destroyed in time");
            }
        }
        self.shared.client.close();
        self.shared.notify_change();
        self.tasks.lock().abort_all();
    }
}

impl Drop for RemoteMachineManager {
    fn drop(&mut self) {
        self.shared.client.close();
    }
}
