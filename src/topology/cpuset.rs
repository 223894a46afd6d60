//! The full set of physical cores considered for scheduling on this host.

use super::core::Core;
use super::distance;
use crate::error::SchedulerResult;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Cores admitted after `TOPO_EXCLUDE`/explorer filtering, plus the raw NUMA
/// distance matrix needed to compute pairwise core distances (spec §3, §4.2).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CpuSet {
    /// Total core count on the host, ignoring include/exclude filtering.
    host_count: usize,
    cpu_list: Vec<Core>,
    numa_distances: HashMap<u32, Vec<u32>>,
}

impl CpuSet {
    pub fn new(host_count: usize, numa_distances: HashMap<u32, Vec<u32>>) -> Self {
        Self {
            host_count,
            cpu_list: Vec::new(),
            numa_distances,
        }
    }

    pub fn add_cpu(&mut self, cpu: Core) {
        self.cpu_list.push(cpu);
    }

    pub fn host_count(&self) -> usize {
        self.host_count
    }

    /// Usable CPU count for VM provisioning: the admitted, non-excluded set.
    pub fn allowed(&self) -> usize {
        self.cpu_list.len()
    }

    pub fn cpu_list(&self) -> &[Core] {
        &self.cpu_list
    }

    pub fn cpu_list_mut(&mut self) -> &mut [Core] {
        &mut self.cpu_list
    }

    pub fn numa_distances(&self) -> &HashMap<u32, Vec<u32>> {
        &self.numa_distances
    }

    pub fn get(&self, cpu_id: u32) -> Option<&Core> {
        self.cpu_list.iter().find(|c| c.cpu_id == cpu_id)
    }

    pub fn get_mut(&mut self, cpu_id: u32) -> Option<&mut Core> {
        self.cpu_list.iter_mut().find(|c| c.cpu_id == cpu_id)
    }

    pub fn numa_node_ids(&self) -> Vec<u32> {
        let mut ids: Vec<u32> = self.cpu_list.iter().map(|c| c.numa_node).collect();
        ids.sort_unstable();
        ids.dedup();
        ids
    }

    pub fn cores_on_node(&self, numa_node: u32) -> Vec<&Core> {
        self.cpu_list
            .iter()
            .filter(|c| c.numa_node == numa_node)
            .collect()
    }

    pub fn distance_between(&self, cpu0: u32, cpu1: u32) -> SchedulerResult<u32> {
        let a = self.get(cpu0).ok_or_else(|| {
            crate::error::SchedulerError::DoesNotExist(format!("cpu{cpu0}"))
        })?;
        let b = self.get(cpu1).ok_or_else(|| {
            crate::error::SchedulerError::DoesNotExist(format!("cpu{cpu1}"))
        })?;
        distance::distance(a, b, &self.numa_distances)
    }

    /// Cores in `candidates` ordered from closest to farthest relative to
    /// `from`, ties broken by ascending cpu id.
    pub fn closest_to(&self, from: u32, candidates: &[u32]) -> SchedulerResult<Vec<u32>> {
        let from_core = self
            .get(from)
            .ok_or_else(|| crate::error::SchedulerError::DoesNotExist(format!("cpu{from}")))?;
        let candidate_cores: Vec<&Core> = candidates
            .iter()
            .filter_map(|id| self.get(*id))
            .collect();
        distance::sorted_by_distance(from_core, &candidate_cores, &self.numa_distances)
    }

    /// Cores in `candidates` ordered from farthest to closest relative to
    /// `from`.
    pub fn farthest_from(&self, from: u32, candidates: &[u32]) -> SchedulerResult<Vec<u32>> {
        let mut closest = self.closest_to(from, candidates)?;
        closest.reverse();
        Ok(closest)
    }

    /// `closestFrom(fromList, toList, excludeMax)` (spec §4.2): for every
    /// core in `from_list` that is not itself a member of `to_list`,
    /// compute its average distance to every core in `to_list`. When
    /// `to_list` is empty every candidate gets a distance of `0`, matching
    /// the original's "no count means no distance penalty" behavior
    /// (`examples/original_source/schedulerlocal/subset/subsetmanager.py`'s
    /// `__get_available_cpus_with_weight`).
    pub fn closest_from(
        &self,
        from_list: &[u32],
        to_list: &[u32],
        exclude_max: Option<u32>,
    ) -> SchedulerResult<HashMap<u32, f64>> {
        let mut out = HashMap::with_capacity(from_list.len());
        for &from in from_list {
            if to_list.contains(&from) {
                continue;
            }
            let mut total = 0u64;
            let mut count = 0u64;
            for &to in to_list {
                let d = self.distance_between(from, to)?;
                if let Some(max) = exclude_max {
                    if d >= max {
                        continue;
                    }
                }
                total += d as u64;
                count += 1;
            }
            let avg = if count == 0 { 0.0 } else { total as f64 / count as f64 };
            out.insert(from, avg);
        }
        Ok(out)
    }

    /// Order `weighted` (as returned by `closest_from`) ascending by
    /// distance, ties broken by ascending cpu id.
    pub fn order_by_weight(weighted: &HashMap<u32, f64>, descending: bool) -> Vec<u32> {
        let mut entries: Vec<(u32, f64)> = weighted.iter().map(|(k, v)| (*k, *v)).collect();
        entries.sort_by(|a, b| {
            let ord = a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal);
            let ord = if descending { ord.reverse() } else { ord };
            ord.then(a.0.cmp(&b.0))
        });
        entries.into_iter().map(|(id, _)| id).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn core(id: u32, numa: u32) -> Core {
        let mut cache_level = BTreeMap::new();
        cache_level.insert(0, id as u64 / 2);
        Core {
            cpu_id: id,
            numa_node: numa,
            sib_smt: vec![],
            sib_cpu: vec![],
            cache_level,
            max_freq_khz: 2_500_000,
            cpu_time: Default::default(),
        }
    }

    fn sample_set() -> CpuSet {
        let numa = HashMap::from([(0, vec![10, 20]), (1, vec![20, 10])]);
        let mut set = CpuSet::new(4, numa);
        set.add_cpu(core(0, 0));
        set.add_cpu(core(1, 0));
        set.add_cpu(core(2, 1));
        set.add_cpu(core(3, 1));
        set
    }

    #[test]
    fn closest_orders_same_cache_first() {
        let set = sample_set();
        let ordered = set.closest_to(0, &[1, 2, 3]).unwrap();
        assert_eq!(ordered[0], 1);
    }

    #[test]
    fn farthest_is_reverse_of_closest() {
        let set = sample_set();
        let closest = set.closest_to(0, &[1, 2, 3]).unwrap();
        let farthest = set.farthest_from(0, &[1, 2, 3]).unwrap();
        assert_eq!(closest, farthest.into_iter().rev().collect::<Vec<_>>());
    }

    #[test]
    fn numa_node_ids_deduped_sorted() {
        let set = sample_set();
        assert_eq!(set.numa_node_ids(), vec![0, 1]);
    }

    #[test]
    fn closest_from_excludes_to_list_members() {
        let set = sample_set();
        let weighted = set.closest_from(&[0, 1], &[1], None).unwrap();
        assert!(!weighted.contains_key(&1));
        assert!(weighted.contains_key(&0));
    }

    #[test]
    fn closest_from_empty_to_list_has_zero_distance() {
        let set = sample_set();
        let weighted = set.closest_from(&[0, 1], &[], None).unwrap();
        assert_eq!(weighted.get(&0), Some(&0.0));
    }

    #[test]
    fn order_by_weight_breaks_ties_by_cpu_id() {
        let weighted = HashMap::from([(3, 5.0), (1, 5.0), (2, 1.0)]);
        assert_eq!(CpuSet::order_by_weight(&weighted, false), vec![2, 1, 3]);
    }
}
