//! Subset abstraction: a disjoint group of physical resources shared by
//! zero or more VMs under one oversubscription policy (spec §3, §4.6).
//!
//! CPU subsets (static or elastic) and memory subsets are distinct
//! concrete types rather than a class hierarchy (Design Note "dynamic
//! dispatch (Subset subclasses)" — tagged variants instead).

pub mod collection;
pub mod cpu;
pub mod memory;

pub use collection::SubsetCollection;
pub use cpu::{CpuConsumer, CpuElasticSubset, CpuStaticSubset, CpuSubset};
pub use memory::MemorySubset;

/// Point-in-time capacity/allocation snapshot returned by `status()`
/// handlers (spec §6.2 `/status`).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SubsetStatus {
    /// Physical capacity.
    pub pcap: f64,
    /// Physical allocation (sum of consumer requests).
    pub palloc: f64,
    /// Virtual capacity still available, counting a hypothetical new VM.
    pub vavail: f64,
}
