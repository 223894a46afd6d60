//! Host memory topology: total/allowed capacity, broken down per NUMA node.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Usable memory for VM provisioning, in MB, both host-wide and per NUMA
/// node (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemorySet {
    total_mb: u64,
    allowed_mb: u64,
    numa_node_mb: HashMap<u32, u64>,
}

impl MemorySet {
    pub fn new(total_mb: u64, allowed_mb: u64) -> Self {
        Self {
            total_mb,
            allowed_mb,
            numa_node_mb: HashMap::new(),
        }
    }

    pub fn total_mb(&self) -> u64 {
        self.total_mb
    }

    pub fn allowed_mb(&self) -> u64 {
        self.allowed_mb
    }

    pub fn add_numa_node(&mut self, numa_id: u32, mb: u64) {
        self.numa_node_mb.insert(numa_id, mb);
    }

    pub fn numa_allowed_mb(&self, numa_id: u32) -> Option<u64> {
        self.numa_node_mb.get(&numa_id).copied()
    }

    pub fn numa_node_ids(&self) -> Vec<u32> {
        let mut ids: Vec<u32> = self.numa_node_mb.keys().copied().collect();
        ids.sort_unstable();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn per_node_lookup_roundtrips() {
        let mut set = MemorySet::new(65536, 61440);
        set.add_numa_node(0, 32768);
        set.add_numa_node(1, 28672);
        assert_eq!(set.numa_allowed_mb(0), Some(32768));
        assert_eq!(set.numa_allowed_mb(2), None);
        assert_eq!(set.numa_node_ids(), vec![0, 1]);
    }
}
