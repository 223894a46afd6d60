//! Joins every per-NUMA, per-resource-kind manager into one atomic
//! deploy/remove/iterate surface for the local agent (spec §4.10, §4.11),
//! grounded on `SubsetManagerPool`
//! (`examples/original_source/schedulerlocal/subset/subsetmanager.py`).

use super::cpu::{balance_available_resources, CpuSubsetManager};
use super::memory::MemorySubsetManager;
use super::{template, ManagerStatus, SubsetStatusView};
use crate::config::PredictorConfig;
use crate::connector::HypervisorConnector;
use crate::dataendpoint::{subset_wire_id, trace::CsvTrace, DataSink};
use crate::domain::DomainEntity;
use crate::error::{SchedulerError, SchedulerResult};
use crate::topology::{CpuSet, MemorySet};
use std::collections::BTreeMap;

pub struct ManagerPool {
    topology: CpuSet,
    memory: MemorySet,
    template: Vec<f64>,
    cpu_managers: Vec<CpuSubsetManager>,
    mem_managers: Vec<MemorySubsetManager>,
    connector: Box<dyn HypervisorConnector>,
}

impl ManagerPool {
    pub fn new(
        topology: CpuSet,
        memory: MemorySet,
        template: Vec<f64>,
        elastic: bool,
        critical_size: usize,
        predictor: PredictorConfig,
        connector: Box<dyn HypervisorConnector>,
    ) -> Self {
        let numa_ids = topology.numa_node_ids();
        let cpu_managers = numa_ids
            .iter()
            .map(|&id| CpuSubsetManager::new(id, elastic, critical_size, predictor))
            .collect();
        let mem_managers = numa_ids
            .iter()
            .map(|&id| MemorySubsetManager::new(id, critical_size, memory.numa_allowed_mb(id).unwrap_or(0)))
            .collect();
        Self {
            topology,
            memory,
            template,
            cpu_managers,
            mem_managers,
            connector,
        }
    }

    pub fn topology(&self) -> &CpuSet {
        &self.topology
    }

    pub fn memory(&self) -> &MemorySet {
        &self.memory
    }

    pub fn numa_node_ids(&self) -> Vec<u32> {
        self.topology.numa_node_ids()
    }

    pub fn has_vm(&self, vm: &DomainEntity) -> bool {
        let in_cpu = self.cpu_managers.iter().any(|m| m.has_vm(vm));
        let in_mem = self.mem_managers.iter().any(|m| m.has_vm(vm));
        if in_cpu != in_mem {
            log::warn!("{}", SchedulerError::UnequalPresence(vm.name().to_string()));
        }
        in_cpu || in_mem
    }

    pub fn get_vm_by_name(&self, name: &str) -> Option<DomainEntity> {
        let cpu_hit = self.cpu_managers.iter().find_map(|m| m.get_vm_by_name(name));
        let mem_hit = self.mem_managers.iter().find_map(|m| m.get_vm_by_name(name));
        if cpu_hit.is_some() != mem_hit.is_some() {
            log::warn!("{}", SchedulerError::UnequalPresence(name.to_string()));
        }
        cpu_hit.or(mem_hit).cloned()
    }

    /// Every VM currently tracked by any CPU subset, deduplicated by name
    /// (a VM split across several ratio groups appears once).
    pub fn list_vm(&self) -> Vec<DomainEntity> {
        let mut seen = std::collections::HashSet::new();
        let mut out = Vec::new();
        for manager in &self.cpu_managers {
            for subset in manager.subsets().values() {
                for consumer in subset.consumers() {
                    if seen.insert(consumer.vm.name().to_string()) {
                        out.push(consumer.vm.clone());
                    }
                }
            }
        }
        out
    }

    /// Two-phase deploy across NUMA nodes (spec §4.11): on each node, every
    /// CPU ratio group then the memory request must succeed; a failure
    /// partway through rolls back only the managers that had already
    /// succeeded on that node, then the next NUMA node is tried. The
    /// hypervisor connector is only invoked once placement fully succeeds
    /// on some node; a connector failure rolls that node back too.
    pub fn deploy(
        &mut self,
        name: &str,
        cpu: u32,
        mem_mb: u64,
        cpu_ratio: f64,
        qcow2: Option<String>,
    ) -> SchedulerResult<DomainEntity> {
        let mut vm_builder = DomainEntity::builder(name, mem_mb * 1024, cpu, cpu_ratio);
        if let Some(path) = qcow2 {
            vm_builder = vm_builder.qcow2(path);
        }
        let vm = vm_builder.build();

        let targets = template::cpu_vcpu_targets(cpu, &self.template);
        let groups = template::group_targets(&targets);

        let mut last_err = None;
        for numa in self.numa_node_ids() {
            match self.try_deploy_on_numa(numa, &vm, &groups) {
                Ok(()) => match self.connector.create_vm(vm.clone()) {
                    Ok(created) => return Ok(created),
                    Err(e) => {
                        self.rollback_numa(numa, &vm, &groups);
                        last_err = Some(e);
                    }
                },
                Err(e) => last_err = Some(e),
            }
        }
        Err(last_err.unwrap_or(SchedulerError::NotEnoughResources { resource: "cpu+mem".to_string() }))
    }

    fn try_deploy_on_numa(
        &mut self,
        numa: u32,
        vm: &DomainEntity,
        groups: &[(f64, u32)],
    ) -> SchedulerResult<()> {
        let topology = &self.topology;
        let cpu_mgr = self
            .cpu_managers
            .iter_mut()
            .find(|m| m.numa_id() == numa)
            .ok_or_else(|| SchedulerError::DoesNotExist(format!("numa{numa}")))?;

        let mut succeeded: Vec<f64> = Vec::new();
        for &(ratio, qty) in groups {
            match cpu_mgr.deploy(topology, vm, ratio, qty) {
                Ok(()) => succeeded.push(ratio),
                Err(e) => {
                    for &r in &succeeded {
                        let _ = cpu_mgr.remove(vm, r);
                    }
                    return Err(e);
                }
            }
        }

        let mem_mgr = self
            .mem_managers
            .iter_mut()
            .find(|m| m.numa_id() == numa)
            .ok_or_else(|| SchedulerError::DoesNotExist(format!("numa{numa}")))?;

        if let Err(e) = mem_mgr.deploy(vm) {
            let cpu_mgr = self.cpu_managers.iter_mut().find(|m| m.numa_id() == numa).expect("checked above");
            for &r in &succeeded {
                let _ = cpu_mgr.remove(vm, r);
            }
            return Err(e);
        }
        Ok(())
    }

    fn rollback_numa(&mut self, numa: u32, vm: &DomainEntity, groups: &[(f64, u32)]) {
        if let Some(cpu_mgr) = self.cpu_managers.iter_mut().find(|m| m.numa_id() == numa) {
            for &(ratio, _) in groups {
                let _ = cpu_mgr.remove(vm, ratio);
            }
        }
        if let Some(mem_mgr) = self.mem_managers.iter_mut().find(|m| m.numa_id() == numa) {
            let _ = mem_mgr.remove(vm);
        }
    }

    /// Removal does not roll back (spec §4.11): a failure on one manager
    /// aborts immediately, leaving any already-treated managers as they
    /// are. `being_destroyed` is set before the attempt and cleared again
    /// if it aborts early, so a partially-removed VM is still visible to
    /// `iterate` on the next pass.
    pub fn remove(&mut self, name: &str) -> SchedulerResult<()> {
        let vm = self
            .get_vm_by_name(name)
            .ok_or_else(|| SchedulerError::DoesNotExist(name.to_string()))?;

        for manager in self.cpu_managers.iter_mut() {
            if let Some(entity) = manager.get_vm_mut_by_name(name) {
                entity.set_being_destroyed(true);
            }
        }
        for manager in self.mem_managers.iter_mut() {
            if let Some(entity) = manager.get_vm_mut_by_name(name) {
                entity.set_being_destroyed(true);
            }
        }

        if let Err(e) = self.connector.delete_vm(&vm) {
            self.reset_being_destroyed(name);
            return Err(e);
        }

        let targets = template::cpu_vcpu_targets(vm.cpu(), &self.template);
        let groups = template::group_targets(&targets);
        for manager in self.cpu_managers.iter_mut() {
            for &(ratio, _) in &groups {
                let present = manager.subsets().get(ratio).map_or(false, |s| s.has_vm(&vm));
                if present {
                    if let Err(e) = manager.remove(&vm, ratio) {
                        self.reset_being_destroyed(name);
                        return Err(e);
                    }
                }
            }
        }
        for manager in self.mem_managers.iter_mut() {
            if manager.has_vm(&vm) {
                if let Err(e) = manager.remove(&vm) {
                    self.reset_being_destroyed(name);
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    fn reset_being_destroyed(&mut self, name: &str) {
        for manager in self.cpu_managers.iter_mut() {
            if let Some(entity) = manager.get_vm_mut_by_name(name) {
                entity.set_being_destroyed(false);
            }
        }
        for manager in self.mem_managers.iter_mut() {
            if let Some(entity) = manager.get_vm_mut_by_name(name) {
                entity.set_being_destroyed(false);
            }
        }
    }

    /// One control-loop pass (spec §4.3, live mode): `loadGlobal` precedes
    /// per-subset monitoring (spec §5 ordering (ii)); feed fresh usage
    /// samples from the hypervisor connector into every elastic subset,
    /// resync pin masks where the active window changed, recompute the
    /// fleet-wide balancing pass, then reconcile against whatever the
    /// hypervisor actually reports. `sink`, when present, records every
    /// sample read this pass to a trace file (spec §6.3) — live agents
    /// normally run with `None`.
    pub fn iterate(&mut self, timestamp: f64, mut sink: Option<&mut dyn DataSink>) -> SchedulerResult<()> {
        let global_usage = self.sample_global_cpu_usage();
        if let Some(sink) = sink.as_deref_mut() {
            sink.store_global(timestamp as i64, "cpu", global_usage, self.topology.allowed() as f64)?;
        }

        for manager in self.cpu_managers.iter_mut() {
            for subset in manager.subsets_mut() {
                let consumer_usage: Vec<(String, f64)> = subset
                    .consumers()
                    .iter()
                    .filter_map(|c| {
                        self.connector
                            .cpu_usage(&c.vm)
                            .ok()
                            .flatten()
                            .map(|u| (c.vm.name().to_string(), u))
                    })
                    .collect();
                let subset_usage = consumer_usage.iter().map(|(_, u)| *u).sum::<f64>();
                let changed = subset.update_monitoring(timestamp, subset_usage, &consumer_usage);
                if changed {
                    for consumer in subset.consumers() {
                        let mut vm = consumer.vm.clone();
                        vm.set_cpu_pin_template(subset.pinning_resources(), self.topology.host_count());
                        let _ = self.connector.update_pin(&vm);
                    }
                }
                if let Some(sink) = sink.as_deref_mut() {
                    let wire_id = subset_wire_id(manager.numa_id(), subset.oversubscription_id());
                    let unused = subset.unused_resources_count() as f64;
                    sink.store_subset(
                        timestamp as i64,
                        "cpu",
                        &wire_id,
                        Some(subset_usage),
                        subset.capacity(),
                        subset.oversubscription_id(),
                        unused,
                    )?;
                    for (name, usage) in &consumer_usage {
                        if let Some(vm) = subset.get_vm_by_name(name) {
                            sink.store_vm(timestamp as i64, "cpu", &wire_id, vm, Some(*usage), vm.cpu_ratio())?;
                        }
                    }
                }
            }
        }

        balance_available_resources(&mut self.cpu_managers, &self.topology)?;
        self.watch_out_of_schedulers_vm()?;
        if let Some(sink) = sink.as_deref_mut() {
            sink.flush()?;
        }
        Ok(())
    }

    /// Host-wide CPU usage average across every VM this pool currently
    /// tracks, used as the `rec=global` sample (spec §6.3). `None` when no
    /// VM yet has two usage samples to derive a delta from.
    fn sample_global_cpu_usage(&mut self) -> Option<f64> {
        let vms: Vec<DomainEntity> = self.list_vm();
        if vms.is_empty() {
            return None;
        }
        let samples: Vec<f64> = vms.iter().filter_map(|vm| self.connector.cpu_usage(vm).ok().flatten()).collect();
        if samples.is_empty() {
            None
        } else {
            Some(samples.iter().sum::<f64>() / samples.len() as f64)
        }
    }

    /// Replay-mode control-loop pass (spec §4.11): usage samples come from
    /// the loaded trace rather than the (bypassed/offline) hypervisor
    /// connector. Pin masks are still recomputed in-memory when an elastic
    /// subset's active window changes, but never pushed to a real
    /// hypervisor — the pool's connector is expected to be an
    /// `OfflineConnector` in this mode.
    pub fn iterate_replay(&mut self, tmp: i64, trace: &CsvTrace, mut sink: Option<&mut dyn DataSink>) -> SchedulerResult<()> {
        let global_usage = trace.load_global("cpu", tmp);
        if let Some(sink) = sink.as_deref_mut() {
            sink.store_global(tmp, "cpu", global_usage, self.topology.allowed() as f64)?;
        }

        for manager in self.cpu_managers.iter_mut() {
            for subset in manager.subsets_mut() {
                let wire_id = subset_wire_id(manager.numa_id(), subset.oversubscription_id());
                let (subset_usage, vm_usage) = trace.load_subset("cpu", &wire_id, tmp);
                let consumer_usage: Vec<(String, f64)> = vm_usage
                    .iter()
                    .filter_map(|(vm, usage)| usage.map(|u| (vm.name().to_string(), u)))
                    .collect();
                let changed = subset.update_monitoring(tmp as f64, subset_usage.unwrap_or(0.0), &consumer_usage);
                if changed {
                    for consumer in subset.consumers() {
                        let mut vm = consumer.vm.clone();
                        vm.set_cpu_pin_template(subset.pinning_resources(), self.topology.host_count());
                        let _ = self.connector.update_pin(&vm);
                    }
                }
                if let Some(sink) = sink.as_deref_mut() {
                    let unused = subset.unused_resources_count() as f64;
                    sink.store_subset(
                        tmp,
                        "cpu",
                        &wire_id,
                        subset_usage,
                        subset.capacity(),
                        subset.oversubscription_id(),
                        unused,
                    )?;
                    for (name, usage) in &consumer_usage {
                        if let Some(vm) = subset.get_vm_by_name(name) {
                            sink.store_vm(tmp, "cpu", &wire_id, vm, Some(*usage), vm.cpu_ratio())?;
                        }
                    }
                }
            }
        }

        balance_available_resources(&mut self.cpu_managers, &self.topology)?;
        if let Some(sink) = sink.as_deref_mut() {
            sink.flush()?;
        }
        Ok(())
    }

    /// Warn about any VM the hypervisor reports that this pool never
    /// deployed (spec §4.3) — a VM started outside the scheduler's control.
    fn watch_out_of_schedulers_vm(&mut self) -> SchedulerResult<()> {
        for vm in self.connector.list_alive()? {
            if !self.has_vm(&vm) {
                log::warn!("vm '{}' is running but not tracked by any subset manager", vm.name());
            }
        }
        Ok(())
    }

    /// Per-NUMA status snapshot for the `/status` endpoint (spec §6.1):
    /// each ratio's current usage plus its `vpotential`, the virtual
    /// capacity a not-yet-existing subset of that ratio could offer from
    /// this node's unallocated physical pool.
    pub fn status(&self) -> BTreeMap<u32, ManagerStatus> {
        let mut out = BTreeMap::new();
        for manager in &self.cpu_managers {
            let avail = manager.available_cpus(&self.topology).len() as f64;
            let mut subset = BTreeMap::new();
            for s in manager.subsets().values() {
                let status = s.status();
                let potential = crate::oversubscription::OversubscriptionPolicy::new(s.oversubscription_id(), 0)
                    .oversubscribed_quantity(avail, 1);
                subset.insert(
                    format!("{}", s.oversubscription_id()),
                    SubsetStatusView {
                        pcap: status.pcap,
                        palloc: status.palloc,
                        vavail: status.vavail,
                        vpotential: potential,
                    },
                );
            }
            out.insert(manager.numa_id(), ManagerStatus { avail, subset });
        }
        out
    }

    /// Per-NUMA memory status for the `/status` endpoint's `mem` half
    /// (spec §6.1). Memory only ever has the ratio-`1.0` subset (spec §1's
    /// "memory oversubscription ratio fixed at 1.0").
    pub fn mem_status(&self) -> BTreeMap<u32, ManagerStatus> {
        let mut out = BTreeMap::new();
        for manager in &self.mem_managers {
            let avail = manager.available_mb() as f64;
            let mut subset = BTreeMap::new();
            if let Some(s) = manager.subsets().get(1.0) {
                let status = s.status();
                let potential = crate::oversubscription::OversubscriptionPolicy::new(1.0, 0).oversubscribed_quantity(avail, 1);
                subset.insert(
                    "1".to_string(),
                    SubsetStatusView {
                        pcap: status.pcap,
                        palloc: status.palloc,
                        vavail: status.vavail,
                        vpotential: potential,
                    },
                );
            }
            out.insert(manager.numa_id(), ManagerStatus { avail, subset });
        }
        out
    }
}
