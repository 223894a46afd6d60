//! In-memory connector used for trace replay and tests (spec §5's
//! "hypervisor connector is bypassed" offline mode).
//!
//! Every VM is considered alive as soon as `create_vm` registers it; usage
//! sampling always reports `None` since offline usage comes from the
//! trace's data endpoint, not the connector.

use super::HypervisorConnector;
use crate::domain::DomainEntity;
use crate::error::SchedulerResult;
use std::collections::HashMap;

#[derive(Debug, Default)]
pub struct OfflineConnector {
    by_uuid: HashMap<String, DomainEntity>,
}

impl OfflineConnector {
    pub fn new() -> Self {
        Self::default()
    }
}

impl HypervisorConnector for OfflineConnector {
    fn list_alive(&mut self) -> SchedulerResult<Vec<DomainEntity>> {
        Ok(self.by_uuid.values().cloned().collect())
    }

    fn list_defined(&mut self) -> SchedulerResult<Vec<DomainEntity>> {
        Ok(Vec::new())
    }

    fn create_vm(&mut self, mut vm: DomainEntity) -> SchedulerResult<DomainEntity> {
        if vm.uuid().is_none() {
            vm.set_uuid(uuid::Uuid::new_v4().to_string());
        }
        self.by_uuid.insert(vm.uuid().unwrap().to_string(), vm.clone());
        Ok(vm)
    }

    fn delete_vm(&mut self, vm: &DomainEntity) -> SchedulerResult<()> {
        if let Some(uuid) = vm.uuid() {
            self.by_uuid.remove(uuid);
        }
        Ok(())
    }

    fn update_pin(&mut self, vm: &DomainEntity) -> SchedulerResult<()> {
        if let Some(uuid) = vm.uuid() {
            if let Some(stored) = self.by_uuid.get_mut(uuid) {
                *stored = vm.clone();
            }
        }
        Ok(())
    }

    fn cpu_usage(&mut self, _vm: &DomainEntity) -> SchedulerResult<Option<f64>> {
        Ok(None)
    }

    fn mem_usage(&mut self, _vm: &DomainEntity) -> SchedulerResult<Option<f64>> {
        Ok(None)
    }

    fn cache_purge(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_assigns_uuid_and_registers() {
        let mut conn = OfflineConnector::new();
        let vm = DomainEntity::builder("vm-a", 1024, 2, 1.0).build();
        let created = conn.create_vm(vm).unwrap();
        assert!(created.uuid().is_some());
        assert_eq!(conn.list_alive().unwrap().len(), 1);
    }

    #[test]
    fn delete_removes_by_uuid() {
        let mut conn = OfflineConnector::new();
        let vm = conn
            .create_vm(DomainEntity::builder("vm-a", 1024, 2, 1.0).build())
            .unwrap();
        conn.delete_vm(&vm).unwrap();
        assert!(conn.list_alive().unwrap().is_empty());
    }
}
