use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;

use crate::Set;
use crate::machine::{ChipCoordinates, HardwareHandle, MachineManager, largest_by_area};

struct PoolState {
    /// Free units in the order in which they are offered.
    available: Vec<HardwareHandle>,
    allocated: Set<HardwareHandle>,
    closed: bool,
}

/// Hands out units from a pool fixed at startup.
pub struct FixedMachineManager {
    machines: Vec<HardwareHandle>,
    state: Mutex<PoolState>,
    /// Bumped on every change of the pool.
    changed: watch::Sender<u64>,
}

impl FixedMachineManager {
    pub fn new(machines: Vec<HardwareHandle>) -> crate::Result<Self> {
        let unique: Set<&HardwareHandle> = machines.iter().collect();
        if unique.len() != machines.len() {
            return Err(crate::Error::InvalidRequest(
                "Machine pool contains duplicate machines".into(),
            ));
        }
        Ok(Self {
            state: Mutex::new(PoolState {
                available: machines.clone(),
                allocated: Set::default(),
                closed: false,
            }),
            machines,
            changed: watch::Sender::new(0),
        })
    }

    fn notify_change(&self) {
        self.changed.send_modify(|version| *version += 1);
    }

    fn try_allocate(&self, min_boards: u32) -> crate::Result<Option<HardwareHandle>> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(crate::Error::Closed);
        }
        if let Some(index) = state.available.iter().position(|m| m.boards >= min_boards) {
            let machine = state.available.remove(index);
            state.allocated.insert(machine.clone());
            return Ok(Some(machine));
        }
        Ok(None)
    }

    fn try_allocate_largest(&self) -> crate::Result<Option<HardwareHandle>> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(crate::Error::Closed);
        }
        let Some(largest) = largest_by_area(state.available.iter().cloned()) else {
            return Ok(None);
        };
        state.available.retain(|m| *m != largest);
        state.allocated.insert(largest.clone());
        Ok(Some(largest))
    }
}

#[async_trait::async_trait]
impl MachineManager for FixedMachineManager {
    async fn get_machines(&self) -> crate::Result<Vec<HardwareHandle>> {
        Ok(self.machines.clone())
    }

    async fn get_next_available_machine(&self, min_boards: u32) -> crate::Result<HardwareHandle> {
        if !self.machines.iter().any(|m| m.boards >= min_boards) {
            return Err(crate::Error::NoHardware);
        }
        let mut changed = self.changed.subscribe();
        loop {
            if let Some(machine) = self.try_allocate(min_boards)? {
                log::debug!("Allocated machine {machine} from the pool");
                self.notify_change();
                return Ok(machine);
            }
            log::debug!("Waiting for a machine with at least {min_boards} board(s)");
            if changed.changed().await.is_err() {
                return Err(crate::Error::Closed);
            }
        }
    }

    async fn get_largest_available_machine(&self) -> crate::Result<HardwareHandle> {
        if self.machines.is_empty() {
            return Err(crate::Error::NoHardware);
        }
        let mut changed = self.changed.subscribe();
        loop {
            if let Some(machine) = self.try_allocate_largest()? {
                log::debug!("Allocated largest free machine {machine} from the pool");
                self.notify_change();
                return Ok(machine);
            }
            log::debug!("Waiting for any machine to become free");
            if changed.changed().await.is_err() {
                return Err(crate::Error::Closed);
            }
        }
    }

    fn is_machine_available(&self, machine: &HardwareHandle) -> bool {
        self.state.lock().allocated.contains(machine)
    }

    async fn wait_for_machine_state_change(
        &self,
        machine: &HardwareHandle,
        timeout: Duration,
    ) -> bool {
        let mut changed = self.changed.subscribe();
        let before = self.is_machine_available(machine);
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            match tokio::time::timeout_at(deadline, changed.changed()).await {
                Ok(Ok(())) => {
                    if self.is_machine_available(machine) != before {
                        return true;
                    }
                }
                Ok(Err(_)) => return self.is_machine_available(machine) != before,
                Err(_) => return false,
            }
        }
    }

    async fn release_machine(&self, machine: &HardwareHandle) {
        {
            let mut state = self.state.lock();
            if !state.allocated.remove(machine) {
                log::warn!("Releasing machine {machine} that is not allocated");
                return;
            }
            state.available.push(machine.clone());
        }
        log::debug!("Machine {machine} returned to the pool");
        self.notify_change();
    }

    async fn set_machine_power(
        &self,
        _machine: &HardwareHandle,
        _power_on: bool,
    ) -> crate::Result<()> {
        Ok(())
    }

    async fn get_chip_coordinates(
        &self,
        _machine: &HardwareHandle,
        _x: u32,
        _y: u32,
    ) -> crate::Result<ChipCoordinates> {
        Ok(ChipCoordinates {
            cabinet: 0,
            frame: 0,
            board: 0,
        })
    }

    async fn close(&self) {
        self.state.lock().closed = true;
        self.notify_change();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use crate::machine::{FixedMachineManager, HardwareHandle, MachineManager};
    use crate::tests::utils::machine;

    fn pool(machines: &[HardwareHandle]) -> Arc<FixedMachineManager> {
        Arc::new(FixedMachineManager::new(machines.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn allocate_first_fitting_machine() {
        let manager = pool(&[machine("a", 1), machine("b", 3), machine("c", 3)]);
        let m = manager.get_next_available_machine(2).await.unwrap();
        assert_eq!(m.name, "b");
        assert!(manager.is_machine_available(&m));
        let m = manager.get_next_available_machine(1).await.unwrap();
        assert_eq!(m.name, "a");
        assert_eq!(manager.get_machines().await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn unsatisfiable_request_fails() {
        let manager = pool(&[machine("a", 1)]);
        assert!(matches!(
            manager.get_next_available_machine(2).await,
            Err(crate::Error::NoHardware)
        ));
    }

    #[tokio::test]
    async fn duplicate_machines_rejected() {
        assert!(FixedMachineManager::new(vec![machine("a", 1), machine("a", 2)]).is_err());
    }

    #[tokio::test]
    async fn allocation_waits_for_release() {
        let manager = pool(&[machine("a", 1)]);
        let first = manager.get_next_available_machine(1).await.unwrap();

        let waiting = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.get_next_available_machine(1).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiting.is_finished());

        manager.release_machine(&first).await;
        let second = waiting.await.unwrap().unwrap();
        assert_eq!(second, first);
    }

    #[tokio::test]
    async fn state_change_is_reported() {
        let manager = pool(&[machine("a", 1), machine("b", 1)]);
        let a = manager.get_next_available_machine(1).await.unwrap();
        let b = manager.get_next_available_machine(1).await.unwrap();

        // Changes of other machines are not reported
        let waiter = {
            let manager = manager.clone();
            let a = a.clone();
            tokio::spawn(async move {
                manager
                    .wait_for_machine_state_change(&a, Duration::from_secs(5))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        manager.release_machine(&b).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        manager.release_machine(&a).await;
        assert!(waiter.await.unwrap());
        assert!(!manager.is_machine_available(&a));

        assert!(
            !manager
                .wait_for_machine_state_change(&a, Duration::from_millis(10))
                .await
        );
    }

    #[tokio::test]
    async fn close_fails_waiters() {
        let manager = pool(&[machine("a", 1)]);
        manager.get_next_available_machine(1).await.unwrap();
        let waiting = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.get_next_available_machine(1).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        manager.close().await;
        assert!(matches!(waiting.await.unwrap(), Err(crate::Error::Closed)));
    }

    #[tokio::test]
    async fn largest_free_machine_by_area() {
        let mut small = machine("small", 1);
        small.width = 8;
        let mut big = machine("big", 1);
        big.width = 16;
        big.height = 16;
        let manager = pool(&[small.clone(), big.clone()]);

        assert_eq!(manager.get_largest_available_machine().await.unwrap(), big);
        assert_eq!(manager.get_largest_available_machine().await.unwrap(), small);

        let waiting = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.get_largest_available_machine().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiting.is_finished());
        manager.release_machine(&small).await;
        assert_eq!(waiting.await.unwrap().unwrap(), small);

        let empty = pool(&[]);
        assert!(matches!(
            empty.get_largest_available_machine().await,
            Err(crate::Error::NoHardware)
        ));
    }
}
