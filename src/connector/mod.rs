//! Hypervisor connector: the narrow capability the scheduling core
//! consumes to list, create, destroy and pin VMs (spec §4.4, §6.5).

pub mod offline;
pub mod qemu;
pub mod xml;

use crate::domain::DomainEntity;
use crate::error::SchedulerResult;

/// Everything the core needs from a hypervisor. Implementations own the
/// uuid→entity cache (`cache_purge` clears it).
///
/// `cpu_usage`/`mem_usage` return `Ok(None)` when the VM has disappeared —
/// per spec §4.4 the caller treats that as an ordinary skip, never an
/// error (`SchedulerError::ConsumerNotAlive` is reserved for call sites
/// that need to *report* the condition, e.g. the outer control loop).
pub trait HypervisorConnector: Send {
    /// Currently running VMs.
    fn list_alive(&mut self) -> SchedulerResult<Vec<DomainEntity>>;

    /// Defined but not running VMs.
    fn list_defined(&mut self) -> SchedulerResult<Vec<DomainEntity>>;

    /// Every known VM, alive or defined.
    fn list_all(&mut self) -> SchedulerResult<Vec<DomainEntity>> {
        let mut all = self.list_alive()?;
        all.extend(self.list_defined()?);
        Ok(all)
    }

    /// Create and start `vm`. Returns the entity with its `uuid` set.
    /// On partial failure (defined but not started), the stub is undefined
    /// before the error is returned.
    fn create_vm(&mut self, vm: DomainEntity) -> SchedulerResult<DomainEntity>;

    fn delete_vm(&mut self, vm: &DomainEntity) -> SchedulerResult<()>;

    /// Push `vm`'s current `cpu_pin` mask to the live domain and persist it.
    fn update_pin(&mut self, vm: &DomainEntity) -> SchedulerResult<()>;

    fn cpu_usage(&mut self, vm: &DomainEntity) -> SchedulerResult<Option<f64>>;

    fn mem_usage(&mut self, vm: &DomainEntity) -> SchedulerResult<Option<f64>>;

    /// Build a host-wide pin mask from a subset's physical core list.
    fn build_pin_template(&self, cores: &[u32], host_core_count: usize) -> Vec<bool> {
        let mut mask = vec![false; host_core_count];
        for core in cores {
            if (*core as usize) < host_core_count {
                mask[*core as usize] = true;
            }
        }
        mask
    }

    fn cache_purge(&mut self);
}
