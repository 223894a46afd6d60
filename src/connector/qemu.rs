//! Live connector backed by the `virsh` CLI (spec §6.5).
//!
//! No libvirt binding crate exists in this crate's dependency stack, so
//! this talks to the hypervisor the same way an operator would at a
//! terminal: shelling out to `virsh -c <url> ...` and parsing its text
//! output. Every failure (non-zero exit, unparsable output, vanished
//! domain) surfaces as `SchedulerError::HypervisorFailure`, matching
//! spec §4.4's "failures surface as (success, reason)" contract.

use super::xml::render_domain_xml;
use super::HypervisorConnector;
use crate::config::QemuConfig;
use crate::domain::DomainEntity;
use crate::error::{SchedulerError, SchedulerResult};
use std::collections::HashMap;
use std::process::Command;

pub struct QemuConnector {
    qemu: QemuConfig,
    cache_entity: HashMap<String, DomainEntity>,
}

impl QemuConnector {
    pub fn new(qemu: QemuConfig) -> Self {
        Self {
            qemu,
            cache_entity: HashMap::new(),
        }
    }

    fn virsh(&self, args: &[&str]) -> SchedulerResult<String> {
        let mut full_args = vec!["-c", &self.qemu.url];
        full_args.extend_from_slice(args);
        let output = Command::new("virsh")
            .args(&full_args)
            .output()
            .map_err(|e| SchedulerError::HypervisorFailure(format!("virsh spawn failed: {e}")))?;
        if !output.status.success() {
            return Err(SchedulerError::HypervisorFailure(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    fn list_names(&self, extra: &[&str]) -> SchedulerResult<Vec<String>> {
        let mut args = vec!["list", "--name"];
        args.extend_from_slice(extra);
        let out = self.virsh(&args)?;
        Ok(out.lines().map(str::trim).filter(|l| !l.is_empty()).collect())
    }

    fn to_entity(&mut self, name: &str) -> SchedulerResult<Option<DomainEntity>> {
        let uuid = match self.virsh(&["domuuid", name]) {
            Ok(u) => u.trim().to_string(),
            Err(_) => return Ok(None), // domain vanished between list and lookup
        };
        if let Some(cached) = self.cache_entity.get(&uuid) {
            return Ok(Some(cached.clone()));
        }
        let mem_kb: u64 = self
            .virsh(&["dominfo", name])?
            .lines()
            .find_map(|l| l.strip_prefix("Max memory:"))
            .and_then(|v| v.split_whitespace().next())
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        let cpu: u32 = self
            .virsh(&["dominfo", name])?
            .lines()
            .find_map(|l| l.strip_prefix("CPU(s):"))
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(0);

        let entity = DomainEntity::builder(name, mem_kb, cpu, 1.0).uuid(uuid.clone()).build();
        self.cache_entity.insert(uuid, entity.clone());
        Ok(Some(entity))
    }
}

impl HypervisorConnector for QemuConnector {
    fn list_alive(&mut self) -> SchedulerResult<Vec<DomainEntity>> {
        let names = self.list_names(&[])?;
        let mut result = Vec::with_capacity(names.len());
        for name in names {
            if let Some(e) = self.to_entity(&name)? {
                result.push(e);
            }
        }
        Ok(result)
    }

    fn list_defined(&mut self) -> SchedulerResult<Vec<DomainEntity>> {
        let names = self.list_names(&["--all", "--inactive"])?;
        let mut result = Vec::with_capacity(names.len());
        for name in names {
            if let Some(e) = self.to_entity(&name)? {
                result.push(e);
            }
        }
        Ok(result)
    }

    fn create_vm(&mut self, vm: DomainEntity) -> SchedulerResult<DomainEntity> {
        let xml = render_domain_xml(&vm, &self.qemu);
        let xml_path = format!("{}/{}.xml", self.qemu.loc, vm.name());
        std::fs::write(&xml_path, &xml)
            .map_err(|e| SchedulerError::HypervisorFailure(format!("write domain xml: {e}")))?;

        if let Err(e) = self.virsh(&["define", &xml_path]) {
            let _ = std::fs::remove_file(&xml_path);
            return Err(e);
        }
        if let Err(e) = self.virsh(&["start", vm.name()]) {
            // partial failure: defined but not started, undefine the stub
            let _ = self.virsh(&["undefine", vm.name()]);
            return Err(e);
        }

        let uuid = self.virsh(&["domuuid", vm.name()])?.trim().to_string();
        let mut created = vm;
        created.set_uuid(uuid.clone());
        self.cache_entity.insert(uuid, created.clone());
        Ok(created)
    }

    fn delete_vm(&mut self, vm: &DomainEntity) -> SchedulerResult<()> {
        let _ = self.virsh(&["destroy", vm.name()]);
        self.virsh(&["undefine", vm.name()])?;
        if let Some(uuid) = vm.uuid() {
            self.cache_entity.remove(uuid);
        }
        Ok(())
    }

    fn update_pin(&mut self, vm: &DomainEntity) -> SchedulerResult<()> {
        let Some(pin) = vm.cpu_pin() else {
            return Ok(());
        };
        for (vcpu, mask) in pin.iter().enumerate() {
            let cpuset = mask_to_cpuset(mask);
            self.virsh(&["vcpupin", vm.name(), &vcpu.to_string(), &cpuset, "--live", "--config"])?;
        }
        if let Some(uuid) = vm.uuid() {
            self.cache_entity.insert(uuid.to_string(), vm.clone());
        }
        Ok(())
    }

    fn cpu_usage(&mut self, vm: &DomainEntity) -> SchedulerResult<Option<f64>> {
        let Ok(out) = self.virsh(&["domstats", vm.name(), "--cpu-total"]) else {
            return Ok(None); // consumer not alive
        };
        let cpu_time_ns: u64 = out
            .lines()
            .find_map(|l| l.trim().strip_prefix("cpu.time="))
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        let now_ns = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos() as i64)
            .unwrap_or(0);
        let Some(prev) = vm.cpu_time() else {
            return Ok(None); // first sample, no delta yet
        };
        let delta_total = (cpu_time_ns as i64 - prev.total_ns as i64).max(0) as f64;
        let delta_epoch = (now_ns - prev.epoch_ns).max(1) as f64;
        let usage = (delta_total / delta_epoch / vm.cpu().max(1) as f64).clamp(0.0, 1.0);
        Ok(Some(usage))
    }

    fn mem_usage(&mut self, vm: &DomainEntity) -> SchedulerResult<Option<f64>> {
        let Ok(out) = self.virsh(&["dommemstat", vm.name()]) else {
            return Ok(None);
        };
        let actual: f64 = out
            .lines()
            .find_map(|l| l.strip_prefix("actual "))
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(0.0);
        if vm.mem_kb() == 0 {
            return Ok(None);
        }
        Ok(Some((actual / vm.mem_kb() as f64).clamp(0.0, 1.0)))
    }

    fn cache_purge(&mut self) {
        self.cache_entity.clear();
    }
}

fn mask_to_cpuset(mask: &[bool]) -> String {
    mask.iter()
        .enumerate()
        .filter(|(_, allowed)| **allowed)
        .map(|(id, _)| id.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mask_to_cpuset_joins_allowed_ids() {
        assert_eq!(mask_to_cpuset(&[true, false, true]), "0,2");
    }
}
