use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::UnboundedSender;

use crate::common::config::MachinesConfig;

mod fixed;
mod handle;
mod remote;

pub use fixed::FixedMachineManager;
pub use handle::HardwareHandle;
pub use remote::RemoteMachineManager;

/// Receives units that were taken away by the allocator while they were still leased.
pub type UnallocationListener = UnboundedSender<HardwareHandle>;

/// Physical location of a chip.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct ChipCoordinates {
    pub cabinet: u32,
    pub frame: u32,
    pub board: u32,
}

/// Source of allocatable hardware.
///
/// A unit handed out by [`MachineManager::get_next_available_machine`] stays allocated until
/// it is passed to [`MachineManager::release_machine`] (or the allocator takes it away).
#[async_trait::async_trait]
pub trait MachineManager: Send + Sync {
    /// All units known to the manager, allocated or not.
    async fn get_machines(&self) -> crate::Result<Vec<HardwareHandle>>;

    /// Allocates a unit with at least `min_boards` boards, waiting until one is available.
    async fn get_next_available_machine(&self, min_boards: u32) -> crate::Result<HardwareHandle>;

    /// Allocates the free unit with the largest area, the first one in order on ties.
    ///
    /// Managers that create units on demand allocate a unit as large as the largest one
    /// they know of.
    async fn get_largest_available_machine(&self) -> crate::Result<HardwareHandle> {
        let largest = largest_by_area(self.get_machines().await?).ok_or(crate::Error::NoHardware)?;
        self.get_next_available_machine(largest.boards).await
    }

    /// Whether the unit is still allocated and usable.
    fn is_machine_available(&self, machine: &HardwareHandle) -> bool;

    /// Waits at most `timeout` for the availability of the unit to change.
    /// Returns `true` if it changed.
    async fn wait_for_machine_state_change(
        &self,
        machine: &HardwareHandle,
        timeout: Duration,
    ) -> bool;

    async fn release_machine(&self, machine: &HardwareHandle);

    async fn set_machine_power(&self, machine: &HardwareHandle, power_on: bool)
    -> crate::Result<()>;

    async fn get_chip_coordinates(
        &self,
        machine: &HardwareHandle,
        x: u32,
        y: u32,
    ) -> crate::Result<ChipCoordinates>;

    fn set_unallocation_listener(&self, _listener: UnallocationListener) {}

    async fn close(&self);
}

pub(crate) fn largest_by_area<I>(machines: I) -> Option<HardwareHandle>
where
    I: IntoIterator<Item = HardwareHandle>,
{
    machines
        .into_iter()
        .reduce(|best, m| if m.area() > best.area() { m } else { best })
}

pub fn create_machine_manager(config: &MachinesConfig) -> crate::Result<Arc<dyn MachineManager>> {
    Ok(match config {
        MachinesConfig::Static { machines } => {
            log::info!("Using static pool of {} machine(s)", machines.len());
            Arc::new(FixedMachineManager::new(machines.clone())?)
        }
        MachinesConfig::Remote(remote) => {
            log::info!("Using allocation service at {}", remote.address());
            Arc::new(RemoteMachineManager::start(remote.clone()))
        }
    })
}
