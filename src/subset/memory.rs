//! Memory subsets: disjoint `[inf, sup]` byte ranges under an
//! oversubscription policy (spec §3, §4.6), grounded on `MemSubset`
//! (`examples/original_source/schedulerlocal/subset/subset.py`). Locality
//! is out of scope for memory (§9 Design Note), so a subset is just a
//! capacity-tracking range list, normally a single range per subset.

use super::SubsetStatus;
use crate::domain::DomainEntity;
use crate::oversubscription::OversubscriptionPolicy;

#[derive(Debug, Clone)]
pub struct MemorySubset {
    numa_id: u32,
    oversubscription: OversubscriptionPolicy,
    ranges: Vec<(u64, u64)>,
    consumers: Vec<DomainEntity>,
}

impl MemorySubset {
    pub fn new(numa_id: u32, oversubscription: OversubscriptionPolicy) -> Self {
        Self {
            numa_id,
            oversubscription,
            ranges: Vec::new(),
            consumers: Vec::new(),
        }
    }

    pub fn numa_id(&self) -> u32 {
        self.numa_id
    }

    pub fn oversubscription(&self) -> &OversubscriptionPolicy {
        &self.oversubscription
    }

    pub fn oversubscription_id(&self) -> f64 {
        self.oversubscription.id()
    }

    pub fn ranges(&self) -> &[(u64, u64)] {
        &self.ranges
    }

    pub fn add_range(&mut self, inf: u64, sup: u64) {
        self.ranges.push((inf, sup));
    }

    /// Extends the subset's (single) range upward by `amount` MB.
    pub fn grow(&mut self, amount: u64) {
        if let Some(last) = self.ranges.last_mut() {
            last.1 += amount;
        }
    }

    /// Trims the subset's (single) range downward by `amount` MB.
    pub fn shrink(&mut self, amount: u64) {
        if let Some(last) = self.ranges.last_mut() {
            last.1 = last.1.saturating_sub(amount).max(last.0);
        }
    }

    pub fn capacity(&self) -> f64 {
        self.ranges.iter().map(|(inf, sup)| (sup - inf + 1) as f64).sum()
    }

    pub fn allocation(&self) -> f64 {
        self.consumers.iter().map(|c| c.mem_mb() as f64).sum()
    }

    pub fn max_consumer_allocation(&self) -> f64 {
        self.consumers.iter().map(|c| c.mem_mb() as f64).fold(0.0, f64::max)
    }

    pub fn consumers(&self) -> &[DomainEntity] {
        &self.consumers
    }

    pub fn has_vm(&self, vm: &DomainEntity) -> bool {
        self.consumers.iter().any(|c| c == vm)
    }

    pub fn get_vm_by_name(&self, name: &str) -> Option<&DomainEntity> {
        self.consumers.iter().find(|c| c.name() == name)
    }

    pub fn get_vm_mut_by_name(&mut self, name: &str) -> Option<&mut DomainEntity> {
        self.consumers.iter_mut().find(|c| c.name() == name)
    }

    pub fn try_deploy(&mut self, vm: DomainEntity) -> bool {
        let already_present = self.has_vm(&vm);
        let consumer_count_with_new = if already_present { self.consumers.len() } else { self.consumers.len() + 1 };
        let request = vm.mem_mb() as f64;
        let available = self
            .oversubscription
            .available(self.capacity(), self.allocation(), consumer_count_with_new);
        if request > available {
            return false;
        }
        self.consumers.push(vm);
        true
    }

    pub fn remove_consumer(&mut self, vm: &DomainEntity) -> bool {
        let before = self.consumers.len();
        self.consumers.retain(|c| c != vm);
        self.consumers.len() != before
    }

    pub fn unused_resources_count(&self) -> usize {
        self.oversubscription.unused_resources_count(
            self.capacity(),
            self.allocation(),
            self.consumers.len(),
            self.max_consumer_allocation(),
        )
    }

    pub fn additional_resources_required(&self, vm: &DomainEntity) -> usize {
        let consumer_count_with_new = if self.has_vm(vm) { self.consumers.len() } else { self.consumers.len() + 1 };
        self.oversubscription.additional_resources_required(
            vm.mem_mb() as f64,
            self.capacity(),
            self.allocation(),
            consumer_count_with_new,
        )
    }

    pub fn status(&self) -> SubsetStatus {
        SubsetStatus {
            pcap: self.capacity(),
            palloc: self.allocation(),
            vavail: self
                .oversubscription
                .available(self.capacity(), self.allocation(), self.consumers.len() + 1),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> OversubscriptionPolicy {
        OversubscriptionPolicy::new(1.0, 0)
    }

    #[test]
    fn capacity_sums_range_lengths() {
        let mut m = MemorySubset::new(0, policy());
        m.add_range(0, 1023);
        assert_eq!(m.capacity(), 1024.0);
    }

    #[test]
    fn deploy_rejects_beyond_capacity() {
        let mut m = MemorySubset::new(0, policy());
        m.add_range(0, 511);
        let vm = DomainEntity::builder("vm-a", 1024 * 1024, 2, 1.0).build(); // 1024 MB
        assert!(!m.try_deploy(vm));
    }

    #[test]
    fn grow_then_deploy_fits() {
        let mut m = MemorySubset::new(0, policy());
        m.add_range(0, 511);
        m.grow(512);
        let vm = DomainEntity::builder("vm-a", 1024 * 1024, 2, 1.0).build();
        assert!(m.try_deploy(vm));
    }
}
