//! Core-to-core distance model (spec §4.2).
//!
//! Distance steps by 10 per shared cache level, innermost first; the first
//! matching cache id at any level short-circuits the walk. If no cache
//! level is shared, the NUMA distance matrix entry between the two cores'
//! nodes is added on top of the full cache-level walk cost.

use super::core::Core;
use crate::error::{SchedulerError, SchedulerResult};
use std::collections::HashMap;

const CACHE_STEP: u32 = 10;

/// Distance between two cores, or an error if they report a different
/// number of cache levels (the host is not cache-homogeneous, which the
/// explorer should never produce for a single machine).
pub fn distance(
    a: &Core,
    b: &Core,
    numa_distances: &HashMap<u32, Vec<u32>>,
) -> SchedulerResult<u32> {
    if a.cpu_id == b.cpu_id {
        return Ok(0);
    }
    if a.cache_level.len() != b.cache_level.len() {
        return Err(SchedulerError::TraceFormat(format!(
            "heterogeneous cache level count between cpu{} and cpu{}",
            a.cpu_id, b.cpu_id
        )));
    }

    let mut acc = 0;
    for (level, cache_id) in &a.cache_level {
        acc += CACHE_STEP;
        if b.cache_level.get(level) == Some(cache_id) {
            return Ok(acc);
        }
    }

    let row = numa_distances.get(&a.numa_node).ok_or_else(|| {
        SchedulerError::TraceFormat(format!("no numa distance row for node {}", a.numa_node))
    })?;
    let entry = row.get(b.numa_node as usize).ok_or_else(|| {
        SchedulerError::TraceFormat(format!(
            "no numa distance from node {} to node {}",
            a.numa_node, b.numa_node
        ))
    })?;
    Ok(acc + entry)
}

/// Order `candidates` by ascending distance from `from`.
pub fn sorted_by_distance(
    from: &Core,
    candidates: &[&Core],
    numa_distances: &HashMap<u32, Vec<u32>>,
) -> SchedulerResult<Vec<u32>> {
    let mut scored = Vec::with_capacity(candidates.len());
    for c in candidates {
        scored.push((c.cpu_id, distance(from, c, numa_distances)?));
    }
    scored.sort_by_key(|(_, d)| *d);
    Ok(scored.into_iter().map(|(id, _)| id).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn core(id: u32, numa: u32, l1: u64, l2: u64) -> Core {
        let mut cache_level = BTreeMap::new();
        cache_level.insert(0, l1);
        cache_level.insert(1, l2);
        Core {
            cpu_id: id,
            numa_node: numa,
            sib_smt: vec![],
            sib_cpu: vec![],
            cache_level,
            max_freq_khz: 3_000_000,
            cpu_time: Default::default(),
        }
    }

    #[test]
    fn shares_l1_gives_minimal_distance() {
        let a = core(0, 0, 1, 2);
        let b = core(1, 0, 1, 3);
        let numa = HashMap::from([(0, vec![10, 20]), (1, vec![20, 10])]);
        assert_eq!(distance(&a, &b, &numa).unwrap(), 10);
    }

    #[test]
    fn shares_only_l2() {
        let a = core(0, 0, 1, 2);
        let b = core(1, 0, 5, 2);
        let numa = HashMap::from([(0, vec![10, 20]), (1, vec![20, 10])]);
        assert_eq!(distance(&a, &b, &numa).unwrap(), 20);
    }

    #[test]
    fn falls_back_to_numa_distance() {
        let a = core(0, 0, 1, 2);
        let b = core(1, 1, 5, 6);
        let numa = HashMap::from([(0, vec![10, 21]), (1, vec![21, 10])]);
        // two cache levels walked (20) + numa distance (21)
        assert_eq!(distance(&a, &b, &numa).unwrap(), 41);
    }

    #[test]
    fn heterogeneous_cache_levels_error() {
        let a = core(0, 0, 1, 2);
        let mut b = core(1, 0, 1, 2);
        b.cache_level.remove(&1);
        let numa = HashMap::from([(0, vec![10])]);
        assert!(distance(&a, &b, &numa).is_err());
    }
}
