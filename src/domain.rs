//! `DomainEntity` — the data-access object representing a single VM,
//! shared by the local agent's managers and the hypervisor connector
//! (spec §3).

use std::collections::HashMap;

/// Per-vCPU pin mask: for vcpu `i`, `cpu_pin[i][cpu_id]` is true if that
/// vcpu may run on `cpu_id`.
pub type CpuPin = Vec<Vec<bool>>;

/// Cumulative vCPU time sample used to derive a VM's CPU usage ratio
/// between two polls, mirroring `topology::core::CpuTime` at the VM level.
#[derive(Debug, Clone, Copy)]
pub struct DomainCpuTime {
    pub epoch_ns: i64,
    pub total_ns: u64,
    pub system_ns: u64,
    pub user_ns: u64,
}

#[derive(Debug, Clone)]
pub struct DomainEntity {
    name: String,
    mem_kb: u64,
    cpu: u32,
    cpu_ratio: f64,
    uuid: Option<String>,
    cpu_pin: Option<CpuPin>,
    qcow2: Option<String>,
    being_destroyed: bool,
    cpu_time: Option<DomainCpuTime>,
}

impl DomainEntity {
    pub fn builder(name: impl Into<String>, mem_kb: u64, cpu: u32, cpu_ratio: f64) -> DomainEntityBuilder {
        DomainEntityBuilder::new(name, mem_kb, cpu, cpu_ratio)
    }

    pub fn uuid(&self) -> Option<&str> {
        self.uuid.as_deref()
    }

    pub fn set_uuid(&mut self, uuid: impl Into<String>) {
        self.uuid = Some(uuid.into());
    }

    pub fn is_deployed(&self) -> bool {
        self.uuid.is_some()
    }

    pub fn is_being_destroyed(&self) -> bool {
        self.being_destroyed
    }

    pub fn set_being_destroyed(&mut self, value: bool) {
        self.being_destroyed = value;
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn mem_kb(&self) -> u64 {
        self.mem_kb
    }

    pub fn mem_mb(&self) -> u64 {
        self.mem_kb / 1024
    }

    pub fn cpu(&self) -> u32 {
        self.cpu
    }

    pub fn cpu_ratio(&self) -> f64 {
        self.cpu_ratio
    }

    pub fn cpu_pin(&self) -> Option<&CpuPin> {
        self.cpu_pin.as_ref()
    }

    /// Pin every vCPU to the same physical core template (spec §4.4's
    /// "apply a subset's pin template to a newly deployed VM").
    pub fn set_cpu_pin_template(&mut self, template: &[u32], host_core_count: usize) {
        let mut mask = vec![false; host_core_count];
        for core in template {
            if (*core as usize) < host_core_count {
                mask[*core as usize] = true;
            }
        }
        self.cpu_pin = Some(vec![mask; self.cpu as usize]);
    }

    /// Per physical core, whether at least one vCPU is pinned to it.
    pub fn cpu_pin_aggregated(&self) -> HashMap<u32, bool> {
        let mut aggregated = HashMap::new();
        if let Some(pin) = &self.cpu_pin {
            for vcpu_mask in pin {
                for (cpu_id, is_pinned) in vcpu_mask.iter().enumerate() {
                    let entry = aggregated.entry(cpu_id as u32).or_insert(false);
                    *entry = *entry || *is_pinned;
                }
            }
        }
        aggregated
    }

    pub fn qcow2(&self) -> Option<&str> {
        self.qcow2.as_deref()
    }

    pub fn cpu_time(&self) -> Option<DomainCpuTime> {
        self.cpu_time
    }

    pub fn set_cpu_time(&mut self, sample: DomainCpuTime) {
        self.cpu_time = Some(sample);
    }

    pub fn clear_cpu_time(&mut self) {
        self.cpu_time = None;
    }
}

impl PartialEq for DomainEntity {
    fn eq(&self, other: &Self) -> bool {
        if std::ptr::eq(self, other) {
            return true;
        }
        match (&self.uuid, &other.uuid) {
            (Some(a), Some(b)) if a == b => return true,
            _ => {}
        }
        self.name == other.name && self.cpu == other.cpu && self.mem_kb == other.mem_kb
    }
}

impl std::fmt::Display for DomainEntity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "vm {} {}vCPU {}MB with oc {}",
            self.name,
            self.cpu,
            self.mem_mb(),
            self.cpu_ratio
        )
    }
}

/// Builder for `DomainEntity`, mirroring the hypervisor connector's
/// spec-builder style: required fields up front, optional ones chained.
pub struct DomainEntityBuilder {
    name: String,
    mem_kb: u64,
    cpu: u32,
    cpu_ratio: f64,
    uuid: Option<String>,
    qcow2: Option<String>,
}

impl DomainEntityBuilder {
    fn new(name: impl Into<String>, mem_kb: u64, cpu: u32, cpu_ratio: f64) -> Self {
        Self {
            name: name.into(),
            mem_kb,
            cpu,
            cpu_ratio,
            uuid: None,
            qcow2: None,
        }
    }

    pub fn uuid(mut self, uuid: impl Into<String>) -> Self {
        self.uuid = Some(uuid.into());
        self
    }

    pub fn qcow2(mut self, path: impl Into<String>) -> Self {
        self.qcow2 = Some(path.into());
        self
    }

    pub fn build(self) -> DomainEntity {
        DomainEntity {
            name: self.name,
            mem_kb: self.mem_kb,
            cpu: self.cpu,
            cpu_ratio: self.cpu_ratio,
            uuid: self.uuid,
            cpu_pin: None,
            qcow2: self.qcow2,
            being_destroyed: false,
            cpu_time: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equal_by_uuid_even_if_other_fields_differ() {
        let a = DomainEntity::builder("vm-a", 1024, 2, 1.0).uuid("u1").build();
        let b = DomainEntity::builder("vm-b", 2048, 4, 1.0).uuid("u1").build();
        assert_eq!(a, b);
    }

    #[test]
    fn equal_by_name_cpu_mem_when_undeployed() {
        let a = DomainEntity::builder("vm-a", 1024, 2, 1.0).build();
        let b = DomainEntity::builder("vm-a", 1024, 2, 1.5).build();
        assert_eq!(a, b);
    }

    #[test]
    fn not_equal_when_neither_matches() {
        let a = DomainEntity::builder("vm-a", 1024, 2, 1.0).build();
        let b = DomainEntity::builder("vm-b", 2048, 4, 1.0).build();
        assert_ne!(a, b);
    }

    #[test]
    fn pin_template_aggregation() {
        let mut vm = DomainEntity::builder("vm-a", 1024, 2, 1.0).build();
        vm.set_cpu_pin_template(&[1, 3], 4);
        let agg = vm.cpu_pin_aggregated();
        assert_eq!(agg.get(&1), Some(&true));
        assert_eq!(agg.get(&0), Some(&false));
    }

    #[test]
    fn is_deployed_tracks_uuid() {
        let mut vm = DomainEntity::builder("vm-a", 1024, 2, 1.0).build();
        assert!(!vm.is_deployed());
        vm.set_uuid("abc");
        assert!(vm.is_deployed());
    }
}
