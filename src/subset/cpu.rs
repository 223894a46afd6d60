//! CPU subsets: disjoint groups of physical cores, in either a static or
//! an elastic (predictor-sized active window) flavor (spec §3, §4.6-§4.7),
//! grounded on `CpuSubset`/`CpuElasticSubset`
//! (`examples/original_source/schedulerlocal/subset/subset.py`).

use super::SubsetStatus;
use crate::domain::DomainEntity;
use crate::oversubscription::OversubscriptionPolicy;
use crate::predictor::Predictor;
use std::collections::HashMap;

/// A VM's share of a CPU subset: how many of its vCPUs live here. A VM
/// whose template splits vcpus across subsets appears as a consumer of
/// each one, each with its own `vcpus` count (spec §4.10 per-vCPU pairs).
#[derive(Debug, Clone)]
pub struct CpuConsumer {
    pub vm: DomainEntity,
    pub vcpus: u32,
}

#[derive(Debug, Clone)]
pub struct CpuStaticSubset {
    numa_id: u32,
    oversubscription: OversubscriptionPolicy,
    resources: Vec<u32>,
    /// Idle cores on loan from `balance_available_resources` (spec §4.10):
    /// included in the pin mask but not owned, so they never count toward
    /// this subset's capacity or get shrunk by `unused_resources_count`.
    shared_active: Vec<u32>,
    consumers: Vec<CpuConsumer>,
}

impl CpuStaticSubset {
    pub fn new(numa_id: u32, oversubscription: OversubscriptionPolicy) -> Self {
        Self {
            numa_id,
            oversubscription,
            resources: Vec::new(),
            shared_active: Vec::new(),
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

    pub fn resources(&self) -> &[u32] {
        &self.resources
    }

    pub fn set_shared_active(&mut self, cores: Vec<u32>) {
        self.shared_active = cores;
    }

    pub fn shared_active(&self) -> &[u32] {
        &self.shared_active
    }

    /// Owned resources plus any cores on loan from the balancing pass.
    pub fn pinning_resources(&self) -> Vec<u32> {
        let mut combined = self.resources.clone();
        for core in &self.shared_active {
            if !combined.contains(core) {
                combined.push(*core);
            }
        }
        combined
    }

    pub fn add_resource(&mut self, core: u32) {
        if !self.resources.contains(&core) {
            self.resources.push(core);
        }
    }

    pub fn remove_resource(&mut self, core: u32) -> bool {
        let before = self.resources.len();
        self.resources.retain(|c| *c != core);
        self.resources.len() != before
    }

    /// Drop the tail `count` resources (farthest from the seed, since
    /// resources are appended in distance order as the subset grows).
    pub fn shrink_tail(&mut self, count: usize) {
        let new_len = self.resources.len().saturating_sub(count);
        self.resources.truncate(new_len);
    }

    pub fn capacity(&self) -> f64 {
        self.resources.len() as f64
    }

    pub fn allocation(&self) -> f64 {
        self.consumers.iter().map(|c| c.vcpus as f64).sum()
    }

    pub fn max_consumer_allocation(&self) -> f64 {
        self.consumers.iter().map(|c| c.vcpus as f64).fold(0.0, f64::max)
    }

    pub fn consumers(&self) -> &[CpuConsumer] {
        &self.consumers
    }

    pub fn has_vm(&self, vm: &DomainEntity) -> bool {
        self.consumers.iter().any(|c| &c.vm == vm)
    }

    pub fn get_vm_by_name(&self, name: &str) -> Option<&DomainEntity> {
        self.consumers.iter().map(|c| &c.vm).find(|vm| vm.name() == name)
    }

    pub fn get_vm_mut_by_name(&mut self, name: &str) -> Option<&mut DomainEntity> {
        self.consumers.iter_mut().map(|c| &mut c.vm).find(|vm| vm.name() == name)
    }

    /// Adds `quantity` vcpus of `vm` to this subset, or tops up its
    /// existing share if `vm` is already a consumer here. Rejected if the
    /// request would exceed the policy's virtual availability.
    pub fn try_deploy(&mut self, vm: &DomainEntity, quantity: u32) -> bool {
        let already_present = self.has_vm(vm);
        let consumer_count_with_new = if already_present { self.consumers.len() } else { self.consumers.len() + 1 };
        let available = self
            .oversubscription
            .available(self.capacity(), self.allocation(), consumer_count_with_new);
        if quantity as f64 > available {
            return false;
        }
        if let Some(existing) = self.consumers.iter_mut().find(|c| &c.vm == vm) {
            existing.vcpus += quantity;
        } else {
            self.consumers.push(CpuConsumer { vm: vm.clone(), vcpus: quantity });
        }
        true
    }

    pub fn remove_consumer(&mut self, vm: &DomainEntity) -> bool {
        let before = self.consumers.len();
        self.consumers.retain(|c| &c.vm != vm);
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

    /// Physical cores still needed so `quantity` more vcpus fit, as if
    /// the candidate VM were already counted (spec §4.5 "with_new_vm").
    pub fn additional_resources_required(&self, vm: &DomainEntity, quantity: u32) -> usize {
        let consumer_count_with_new = if self.has_vm(vm) { self.consumers.len() } else { self.consumers.len() + 1 };
        self.oversubscription
            .additional_resources_required(quantity as f64, self.capacity(), self.allocation(), consumer_count_with_new)
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

/// A static subset plus a predictor-sized active window: the pin mask
/// only ever covers `resources[..active_len]`, leaving the rest reserved
/// but unpinned headroom (spec §4.7).
#[derive(Debug, Clone)]
pub struct CpuElasticSubset {
    base: CpuStaticSubset,
    predictor: Predictor,
    monitoring_window: f64,
    hist_usage: Vec<(f64, f64)>,
    hist_consumer_usage: HashMap<String, Vec<(f64, f64)>>,
    /// `None` means "use the full resource list", matching the original's
    /// falsy-empty-list fallback rather than an explicit zero-size window.
    active_len: Option<usize>,
}

impl CpuElasticSubset {
    pub fn new(
        numa_id: u32,
        oversubscription: OversubscriptionPolicy,
        monitoring_window: f64,
        monitoring_learning: f64,
        monitoring_leeway: f64,
    ) -> Self {
        Self {
            base: CpuStaticSubset::new(numa_id, oversubscription),
            predictor: Predictor::new(monitoring_window, monitoring_learning, monitoring_leeway),
            monitoring_window,
            hist_usage: Vec::new(),
            hist_consumer_usage: HashMap::new(),
            active_len: None,
        }
    }

    pub fn base(&self) -> &CpuStaticSubset {
        &self.base
    }

    pub fn base_mut(&mut self) -> &mut CpuStaticSubset {
        &mut self.base
    }

    pub fn pinning_resources(&self) -> &[u32] {
        match self.active_len {
            Some(n) if n > 0 => &self.base.resources()[..n.min(self.base.resources().len())],
            _ => self.base.resources(),
        }
    }

    pub fn remove_consumer(&mut self, vm: &DomainEntity) -> bool {
        self.hist_consumer_usage.remove(vm.name());
        self.base.remove_consumer(vm)
    }

    /// Feeds the latest usage samples into the predictor and resizes the
    /// active window. Returns `true` when the window size changed, so the
    /// caller knows to re-sync the pin mask.
    pub fn update_monitoring(&mut self, timestamp: f64, subset_usage: f64, consumer_usage: &[(String, f64)]) -> bool {
        self.hist_usage.push((timestamp, subset_usage));
        self.hist_usage.retain(|(t, _)| timestamp - *t <= self.monitoring_window);

        for (name, usage) in consumer_usage {
            let entry = self.hist_consumer_usage.entry(name.clone()).or_default();
            entry.push((timestamp, *usage));
            entry.retain(|(t, _)| timestamp - *t <= self.monitoring_window);
        }

        let capacity = self.base.resources().len() as u32;
        let predicted = self.predictor.predict(timestamp, capacity, subset_usage);
        let new_len = Some(predicted as usize);
        let changed = self.active_len != new_len;
        self.active_len = new_len;
        changed
    }
}

/// Tagged dispatch over the two CPU subset flavors (Design Note "dynamic
/// dispatch (Subset subclasses)").
#[derive(Debug, Clone)]
pub enum CpuSubset {
    Static(CpuStaticSubset),
    Elastic(CpuElasticSubset),
}

impl CpuSubset {
    pub fn base(&self) -> &CpuStaticSubset {
        match self {
            CpuSubset::Static(s) => s,
            CpuSubset::Elastic(e) => e.base(),
        }
    }

    pub fn base_mut(&mut self) -> &mut CpuStaticSubset {
        match self {
            CpuSubset::Static(s) => s,
            CpuSubset::Elastic(e) => e.base_mut(),
        }
    }

    pub fn numa_id(&self) -> u32 {
        self.base().numa_id()
    }

    pub fn oversubscription(&self) -> &OversubscriptionPolicy {
        self.base().oversubscription()
    }

    pub fn oversubscription_id(&self) -> f64 {
        self.base().oversubscription_id()
    }

    pub fn resources(&self) -> &[u32] {
        self.base().resources()
    }

    pub fn pinning_resources(&self) -> &[u32] {
        match self {
            CpuSubset::Static(s) => s.resources(),
            CpuSubset::Elastic(e) => e.pinning_resources(),
        }
    }

    pub fn add_resource(&mut self, core: u32) {
        self.base_mut().add_resource(core);
    }

    pub fn shrink_tail(&mut self, count: usize) {
        self.base_mut().shrink_tail(count);
    }

    pub fn capacity(&self) -> f64 {
        self.base().capacity()
    }

    pub fn allocation(&self) -> f64 {
        self.base().allocation()
    }

    pub fn consumers(&self) -> &[CpuConsumer] {
        self.base().consumers()
    }

    pub fn has_vm(&self, vm: &DomainEntity) -> bool {
        self.base().has_vm(vm)
    }

    pub fn get_vm_by_name(&self, name: &str) -> Option<&DomainEntity> {
        self.base().get_vm_by_name(name)
    }

    pub fn get_vm_mut_by_name(&mut self, name: &str) -> Option<&mut DomainEntity> {
        self.base_mut().get_vm_mut_by_name(name)
    }

    pub fn try_deploy(&mut self, vm: &DomainEntity, quantity: u32) -> bool {
        self.base_mut().try_deploy(vm, quantity)
    }

    pub fn remove_consumer(&mut self, vm: &DomainEntity) -> bool {
        match self {
            CpuSubset::Static(s) => s.remove_consumer(vm),
            CpuSubset::Elastic(e) => e.remove_consumer(vm),
        }
    }

    pub fn unused_resources_count(&self) -> usize {
        self.base().unused_resources_count()
    }

    pub fn additional_resources_required(&self, vm: &DomainEntity, quantity: u32) -> usize {
        self.base().additional_resources_required(vm, quantity)
    }

    pub fn status(&self) -> SubsetStatus {
        self.base().status()
    }

    /// No-op for static subsets; elastic subsets resize their active
    /// window and report whether the pin mask needs re-syncing.
    pub fn update_monitoring(&mut self, timestamp: f64, subset_usage: f64, consumer_usage: &[(String, f64)]) -> bool {
        match self {
            CpuSubset::Static(_) => false,
            CpuSubset::Elastic(e) => e.update_monitoring(timestamp, subset_usage, consumer_usage),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(ratio: f64) -> OversubscriptionPolicy {
        OversubscriptionPolicy::new(ratio, 0)
    }

    #[test]
    fn deploy_rejects_beyond_virtual_capacity() {
        let mut s = CpuStaticSubset::new(0, policy(1.0));
        s.add_resource(0);
        let vm = DomainEntity::builder("vm-a", 1024, 2, 1.0).build();
        assert!(!s.try_deploy(&vm, 2));
    }

    #[test]
    fn deploy_tops_up_existing_consumer_rather_than_duplicating() {
        let mut s = CpuStaticSubset::new(0, policy(2.0));
        s.add_resource(0);
        s.add_resource(1);
        let vm = DomainEntity::builder("vm-a", 1024, 2, 1.0).build();
        assert!(s.try_deploy(&vm, 1));
        assert!(s.try_deploy(&vm, 1));
        assert_eq!(s.consumers().len(), 1);
        assert_eq!(s.consumers()[0].vcpus, 2);
    }

    #[test]
    fn elastic_falls_back_to_full_list_when_window_empty() {
        let e = CpuElasticSubset::new(0, policy(1.0), 100.0, 10.0, 5.0);
        assert_eq!(e.pinning_resources().len(), 0);
    }

    #[test]
    fn elastic_reports_change_on_first_prediction() {
        let mut e = CpuElasticSubset::new(0, policy(1.0), 100.0, 10.0, 5.0);
        e.base_mut().add_resource(0);
        e.base_mut().add_resource(1);
        let changed = e.update_monitoring(0.0, 0.5, &[]);
        assert!(changed);
    }
}
