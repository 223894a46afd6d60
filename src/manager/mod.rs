//! Per-resource, per-NUMA subset managers, and the pool that joins them
//! into one atomic deploy/remove surface (spec §4.10, §4.11), grounded on
//! `SubsetManager`/`CpuSubsetManager`/`MemSubsetManager`/
//! `SubsetManagerPool`
//! (`examples/original_source/schedulerlocal/subset/subsetmanager.py`).

pub mod cpu;
pub mod memory;
pub mod pool;
pub mod template;

pub use cpu::CpuSubsetManager;
pub use memory::MemorySubsetManager;
pub use pool::ManagerPool;

/// Per-NUMA-node manager status returned by `/status` (spec §6.1).
/// `Deserialize` lets the global dispatcher parse a node's response back
/// into the same shape (spec §6.2) instead of re-declaring a wire type.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ManagerStatus {
    pub avail: f64,
    pub subset: std::collections::BTreeMap<String, SubsetStatusView>,
}

/// A subset's status plus its `vpotential` (spec §6.1
/// `managerStatus.subset[ratio]`): the virtual capacity a hypothetical new
/// subset of this ratio could offer from the manager's currently
/// unallocated physical pool.
#[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize)]
pub struct SubsetStatusView {
    pub pcap: f64,
    pub palloc: f64,
    pub vavail: f64,
    pub vpotential: f64,
}
