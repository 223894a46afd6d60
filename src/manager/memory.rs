//! Per-NUMA-node memory subset manager (spec §4.6, §4.10), grounded on
//! `MemSubsetManager`
//! (`examples/original_source/schedulerlocal/subset/subsetmanager.py`).
//!
//! Memory has no locality policy (§9 Design Note), so subsets are grown by
//! a simple bump allocator over each node's byte range rather than a
//! distance-ordered search — ranges are carved out in arrival order and
//! never reused, so overlap between subsets can never occur by
//! construction (the original's explicit overlap check has no counterpart
//! here).

use crate::domain::DomainEntity;
use crate::error::{SchedulerError, SchedulerResult};
use crate::oversubscription::OversubscriptionPolicy;
use crate::subset::{MemorySubset, SubsetCollection};

#[derive(Debug)]
pub struct MemorySubsetManager {
    numa_id: u32,
    critical_size: usize,
    capacity_mb: u64,
    subsets: SubsetCollection<MemorySubset>,
}

impl MemorySubsetManager {
    pub fn new(numa_id: u32, critical_size: usize, capacity_mb: u64) -> Self {
        Self {
            numa_id,
            critical_size,
            capacity_mb,
            subsets: SubsetCollection::new(),
        }
    }

    pub fn numa_id(&self) -> u32 {
        self.numa_id
    }

    pub fn subsets(&self) -> &SubsetCollection<MemorySubset> {
        &self.subsets
    }

    pub fn has_vm(&self, vm: &DomainEntity) -> bool {
        self.subsets.values().any(|s| s.has_vm(vm))
    }

    pub fn get_vm_by_name(&self, name: &str) -> Option<&DomainEntity> {
        self.subsets.values().find_map(|s| s.get_vm_by_name(name))
    }

    pub fn get_vm_mut_by_name(&mut self, name: &str) -> Option<&mut DomainEntity> {
        self.subsets.values_mut().find_map(|s| s.get_vm_mut_by_name(name))
    }

    fn allocated_mb(&self) -> u64 {
        self.subsets.values().map(|s| s.capacity() as u64).sum()
    }

    pub fn available_mb(&self) -> u64 {
        self.capacity_mb.saturating_sub(self.allocated_mb())
    }

    fn next_range_start(&self) -> u64 {
        self.subsets
            .values()
            .flat_map(|s| s.ranges().iter().map(|(_, sup)| sup + 1))
            .max()
            .unwrap_or(0)
    }

    fn check_capacity_bound(&self, additional_mb: u64) -> bool {
        additional_mb <= self.available_mb()
    }

    /// Memory is always deployed under ratio `1.0` — a VM's whole request
    /// lands on one subset, never split across ratios (spec §4.10).
    pub fn deploy(&mut self, vm: &DomainEntity) -> SchedulerResult<()> {
        let ratio = 1.0;
        if !self.subsets.contains(ratio) {
            self.try_to_create_subset(vm)?;
        } else {
            let needed = self.subsets.get(ratio).expect("just checked contains").additional_resources_required(vm);
            if needed > 0 {
                self.try_to_extend_subset(ratio, needed as u64)?;
            }
        }
        let subset = self
            .subsets
            .get_mut(ratio)
            .ok_or_else(|| SchedulerError::NotEnoughResources { resource: "mem".to_string() })?;
        if subset.try_deploy(vm.clone()) {
            Ok(())
        } else {
            Err(SchedulerError::NotEnoughResources { resource: "mem".to_string() })
        }
    }

    pub fn remove(&mut self, vm: &DomainEntity) -> SchedulerResult<()> {
        let subset = self
            .subsets
            .get_mut(1.0)
            .ok_or_else(|| SchedulerError::DoesNotExist(vm.name().to_string()))?;
        if !subset.remove_consumer(vm) {
            return Err(SchedulerError::DoesNotExist(vm.name().to_string()));
        }
        self.shrink_subset();
        Ok(())
    }

    fn try_to_create_subset(&mut self, vm: &DomainEntity) -> SchedulerResult<()> {
        let policy = OversubscriptionPolicy::new(1.0, self.critical_size);
        let mut subset = MemorySubset::new(self.numa_id, policy);
        let needed = subset.additional_resources_required(vm) as u64;
        if !self.check_capacity_bound(needed) {
            return Err(SchedulerError::NotEnoughResources { resource: "mem".to_string() });
        }
        let start = self.next_range_start();
        if needed > 0 {
            subset.add_range(start, start + needed - 1);
        } else {
            subset.add_range(start, start);
        }
        self.subsets.add(1.0, subset);
        Ok(())
    }

    fn try_to_extend_subset(&mut self, ratio: f64, needed_mb: u64) -> SchedulerResult<()> {
        if !self.check_capacity_bound(needed_mb) {
            return Err(SchedulerError::NotEnoughResources { resource: "mem".to_string() });
        }
        let subset = self.subsets.get_mut(ratio).expect("caller checked presence");
        subset.grow(needed_mb);
        Ok(())
    }

    fn shrink_subset(&mut self) {
        if let Some(subset) = self.subsets.get_mut(1.0) {
            let unused = subset.unused_resources_count() as u64;
            if unused > 0 {
                subset.shrink(unused);
            }
            if subset.ranges().iter().all(|(inf, sup)| sup <= inf) && subset.consumers().is_empty() {
                self.subsets.remove(1.0);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn creates_subset_sized_to_first_request() {
        let mut mgr = MemorySubsetManager::new(0, 0, 4096);
        let vm = DomainEntity::builder("vm-a", 1024 * 1024, 2, 1.0).build(); // 1024 MB
        mgr.deploy(&vm).unwrap();
        assert_eq!(mgr.subsets.get(1.0).unwrap().capacity(), 1024.0);
    }

    #[test]
    fn extends_subset_for_a_second_vm() {
        let mut mgr = MemorySubsetManager::new(0, 0, 4096);
        let vm_a = DomainEntity::builder("vm-a", 1024 * 1024, 2, 1.0).build();
        let vm_b = DomainEntity::builder("vm-b", 1024 * 1024, 2, 1.0).build();
        mgr.deploy(&vm_a).unwrap();
        mgr.deploy(&vm_b).unwrap();
        assert_eq!(mgr.subsets.get(1.0).unwrap().capacity(), 2048.0);
    }

    #[test]
    fn rejects_deploy_beyond_node_capacity() {
        let mut mgr = MemorySubsetManager::new(0, 0, 512);
        let vm = DomainEntity::builder("vm-a", 1024 * 1024, 2, 1.0).build(); // 1024 MB > 512
        assert!(mgr.deploy(&vm).is_err());
    }

    #[test]
    fn remove_frees_capacity_for_a_later_deploy() {
        let mut mgr = MemorySubsetManager::new(0, 0, 1024);
        let vm_a = DomainEntity::builder("vm-a", 1024 * 1024, 2, 1.0).build();
        mgr.deploy(&vm_a).unwrap();
        mgr.remove(&vm_a).unwrap();
        assert!(mgr.subsets.get(1.0).is_none());
        let vm_b = DomainEntity::builder("vm-b", 1024 * 1024, 2, 1.0).build();
        mgr.deploy(&vm_b).unwrap();
    }
}
