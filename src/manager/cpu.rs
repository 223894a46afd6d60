//! Per-NUMA-node CPU subset manager: owns every CPU subset on one node,
//! decides where a new subset's cores come from, and grows/shrinks subsets
//! as VMs come and go (spec §4.6, §4.10), grounded on
//! `CpuSubsetManager`/`CpuElasticSubsetManager`
//! (`examples/original_source/schedulerlocal/subset/subsetmanager.py`).

use crate::config::PredictorConfig;
use crate::domain::DomainEntity;
use crate::error::{SchedulerError, SchedulerResult};
use crate::oversubscription::OversubscriptionPolicy;
use crate::subset::{CpuElasticSubset, CpuStaticSubset, CpuSubset, SubsetCollection};
use crate::topology::CpuSet;
use std::collections::HashSet;

/// One manager per NUMA node. `elastic` picks the subset flavor this
/// manager creates for every new ratio — the original keeps this as a
/// separate `CpuElasticSubsetManager` subclass that overrides only subset
/// construction; here it is a constructor flag instead (Design Note
/// "dynamic dispatch (Subset subclasses)").
#[derive(Debug)]
pub struct CpuSubsetManager {
    numa_id: u32,
    elastic: bool,
    critical_size: usize,
    predictor: PredictorConfig,
    subsets: SubsetCollection<CpuSubset>,
}

impl CpuSubsetManager {
    pub fn new(numa_id: u32, elastic: bool, critical_size: usize, predictor: PredictorConfig) -> Self {
        Self {
            numa_id,
            elastic,
            critical_size,
            predictor,
            subsets: SubsetCollection::new(),
        }
    }

    pub fn numa_id(&self) -> u32 {
        self.numa_id
    }

    pub fn subsets(&self) -> &SubsetCollection<CpuSubset> {
        &self.subsets
    }

    pub fn subsets_mut(&mut self) -> impl Iterator<Item = &mut CpuSubset> {
        self.subsets.values_mut()
    }

    pub fn has_vm(&self, vm: &DomainEntity) -> bool {
        self.subsets.values().any(|s| s.has_vm(vm))
    }

    pub fn get_vm_by_name(&self, name: &str) -> Option<&DomainEntity> {
        self.subsets.values().find_map(|s| s.get_vm_by_name(name))
    }

    pub fn get_vm_mut_by_name(&mut self, name: &str) -> Option<&mut DomainEntity> {
        self.subsets.values_mut().find_map(|s| s.get_vm_mut_by_name(name))
    }

    /// Cores on this node owned by no subset (`__get_available_cpus`).
    pub fn available_cpus(&self, topology: &CpuSet) -> Vec<u32> {
        let owned: HashSet<u32> = self.subsets.values().flat_map(|s| s.resources().iter().copied()).collect();
        topology
            .cores_on_node(self.numa_id)
            .into_iter()
            .map(|c| c.cpu_id)
            .filter(|id| !owned.contains(id))
            .collect()
    }

    fn occupied_cpus(&self) -> Vec<u32> {
        self.subsets.values().flat_map(|s| s.resources().iter().copied()).collect()
    }

    /// Deploy `quantity` vcpus of `vm` at oversubscription ratio `ratio`,
    /// creating or extending the matching subset as needed (spec §4.10).
    pub fn deploy(
        &mut self,
        topology: &CpuSet,
        vm: &DomainEntity,
        ratio: f64,
        quantity: u32,
    ) -> SchedulerResult<()> {
        if !self.subsets.contains(ratio) {
            self.try_to_create_subset(topology, ratio, vm, quantity)?;
        } else {
            let needed = self.subsets.get(ratio).expect("just checked contains").additional_resources_required(vm, quantity);
            if needed > 0 {
                self.try_to_extend_subset(topology, ratio, needed)?;
            }
        }
        let subset = self
            .subsets
            .get_mut(ratio)
            .ok_or_else(|| SchedulerError::NotEnoughResources { resource: "cpu".to_string() })?;
        if subset.try_deploy(vm, quantity) {
            Ok(())
        } else {
            Err(SchedulerError::NotEnoughResources { resource: "cpu".to_string() })
        }
    }

    pub fn remove(&mut self, vm: &DomainEntity, ratio: f64) -> SchedulerResult<()> {
        let subset = self
            .subsets
            .get_mut(ratio)
            .ok_or_else(|| SchedulerError::DoesNotExist(vm.name().to_string()))?;
        if !subset.remove_consumer(vm) {
            return Err(SchedulerError::DoesNotExist(vm.name().to_string()));
        }
        self.shrink_subset(ratio);
        Ok(())
    }

    /// Seeds a brand-new subset with the farthest-available core relative
    /// to sibling subsets already on this node, then grows it one core at a
    /// time, each pick the closest-available core to what has been claimed
    /// so far (`__get_farthest_available_cpus` / `__get_closest_available_cpus`).
    fn try_to_create_subset(
        &mut self,
        topology: &CpuSet,
        ratio: f64,
        vm: &DomainEntity,
        quantity: u32,
    ) -> SchedulerResult<()> {
        let policy = OversubscriptionPolicy::new(ratio, self.critical_size);
        let mut subset = if self.elastic {
            CpuSubset::Elastic(CpuElasticSubset::new(
                self.numa_id,
                policy,
                self.predictor.monitoring_window,
                self.predictor.monitoring_learning,
                self.predictor.monitoring_leeway,
            ))
        } else {
            CpuSubset::Static(CpuStaticSubset::new(self.numa_id, policy))
        };

        let needed = subset.additional_resources_required(vm, quantity);
        if needed == 0 {
            self.subsets.add(ratio, subset);
            return Ok(());
        }

        let mut available = self.available_cpus(topology);
        if available.len() < needed {
            return Err(SchedulerError::NotEnoughResources { resource: "cpu".to_string() });
        }

        let occupied = self.occupied_cpus();
        let weighted = topology.closest_from(&available, &occupied, None)?;
        let farthest_first = CpuSet::order_by_weight(&weighted, true);
        let seed = *farthest_first.first().ok_or_else(|| SchedulerError::NotEnoughResources { resource: "cpu".to_string() })?;
        subset.add_resource(seed);
        available.retain(|c| *c != seed);

        while subset.resources().len() < needed {
            if available.is_empty() {
                return Err(SchedulerError::NotEnoughResources { resource: "cpu".to_string() });
            }
            let closest_first = self.closest_available_cpus(topology, &available, subset.resources(), ratio)?;
            let next = closest_first[0];
            subset.add_resource(next);
            available.retain(|c| c != &next);
        }

        self.subsets.add(ratio, subset);
        Ok(())
    }

    /// Grows the subset at `ratio` by `needed` more cores, always picking
    /// the closest-available core to the subset's current footprint, after
    /// penalizing any candidate closer to a sibling subset on this node.
    fn try_to_extend_subset(&mut self, topology: &CpuSet, ratio: f64, needed: usize) -> SchedulerResult<()> {
        let mut available = self.available_cpus(topology);
        if available.len() < needed {
            return Err(SchedulerError::NotEnoughResources { resource: "cpu".to_string() });
        }

        let mut growing: Vec<u32> = self.subsets.get(ratio).expect("caller checked presence").resources().to_vec();
        let mut picked = Vec::with_capacity(needed);
        for _ in 0..needed {
            let closest_first = self.closest_available_cpus(topology, &available, &growing, ratio)?;
            let next = closest_first[0];
            growing.push(next);
            picked.push(next);
            available.retain(|c| c != &next);
        }

        let subset = self.subsets.get_mut(ratio).expect("caller checked presence");
        for core in picked {
            subset.add_resource(core);
        }
        Ok(())
    }

    /// Available cores ordered closest-first to `target_resources`, with a
    /// penalty applied to any candidate that sits closer to a sibling
    /// subset on this node (a different oversubscription ratio) than to
    /// `target_resources` itself (spec §4.10 `closestAvailable`,
    /// `__get_closest_available_cpus` in the original). The penalty is the
    /// candidates' own max average distance, computed once up front and
    /// then carried forward across siblings, matching the original's
    /// in-place accumulation — a core already penalized against one
    /// sibling compares its now-penalized weight against the next.
    fn closest_available_cpus(
        &self,
        topology: &CpuSet,
        available: &[u32],
        target_resources: &[u32],
        own_ratio: f64,
    ) -> SchedulerResult<Vec<u32>> {
        let mut weighted = topology.closest_from(available, target_resources, None)?;
        let penalty = weighted.values().cloned().fold(0.0, f64::max);

        for other in self.subsets.values() {
            if other.oversubscription_id() == own_ratio {
                continue;
            }
            let other_weighted = topology.closest_from(available, other.resources(), None)?;
            for (cpu_id, own_distance) in weighted.iter_mut() {
                if let Some(other_distance) = other_weighted.get(cpu_id) {
                    if *other_distance < *own_distance {
                        *own_distance += penalty;
                    }
                }
            }
        }

        Ok(CpuSet::order_by_weight(&weighted, false))
    }

    /// Drops a subset's now-idle tail cores back to the free pool, and
    /// drops the subset entirely once it holds neither resources nor
    /// consumers.
    pub fn shrink_subset(&mut self, ratio: f64) {
        if let Some(subset) = self.subsets.get_mut(ratio) {
            let unused = subset.unused_resources_count();
            if unused > 0 {
                subset.shrink_tail(unused);
            }
            if subset.resources().is_empty() && subset.consumers().is_empty() {
                self.subsets.remove(ratio);
            }
        }
    }

    /// Clears any cores this node's subsets had been loaned from the
    /// fleet-wide balancing pass (`balance_available_resources` runs this
    /// before recomputing the new loan set each iteration).
    pub fn clear_shared_active(&mut self) {
        for subset in self.subsets.values_mut() {
            subset.base_mut().set_shared_active(Vec::new());
        }
    }
}

/// Fleet-wide opportunistic sharing of unallocated and oversubscribed cores
/// across every oversubscribed subset on every NUMA node (spec §4.10
/// `balanceAvailable`, resolved Open Question: a fleet-wide pass, not a
/// per-NUMA one). Grounded on `balance_available_resources`
/// (`subsetmanager.py`).
///
/// Sets every oversubscribed subset's `shared_active` to the same pin mask
/// — the union of all oversubscribed subsets' owned resources plus every
/// free core on the host — but only when at least one oversubscribed
/// subset has not yet reached its critical size (`critical_size_unreached`
/// in the original) and the fleet has enough slack that every
/// oversubscribed subset could plausibly use the whole mask at once without
/// starving another. `resources` itself never changes, so invariant I1
/// (subsets partition the host) still holds over `resources` alone;
/// `shared_active` is a loan, not ownership.
pub fn balance_available_resources(managers: &mut [CpuSubsetManager], topology: &CpuSet) -> SchedulerResult<()> {
    for manager in managers.iter_mut() {
        manager.clear_shared_active();
    }

    let mut oversub_resources: Vec<u32> = Vec::new();
    let mut allocation_oversub = 0.0f64;
    let mut min_oversubscribed_ratio = f64::MAX;
    let mut critical_size_unreached = false;

    for manager in managers.iter() {
        for subset in manager.subsets.values() {
            if subset.oversubscription_id() > 1.0 {
                oversub_resources.extend(subset.resources().iter().copied());
                allocation_oversub += subset.allocation();
                min_oversubscribed_ratio = min_oversubscribed_ratio.min(subset.oversubscription_id());
                if !subset.oversubscription().is_critical_size_reached(subset.consumers().len()) {
                    critical_size_unreached = true;
                }
            }
        }
    }

    if !critical_size_unreached {
        return Ok(());
    }

    let mut free: Vec<u32> = Vec::new();
    for manager in managers.iter() {
        free.extend(manager.available_cpus(topology));
    }

    let potential_allocation = allocation_oversub + free.len() as f64;
    let min_allocation_for_mutualisation = (allocation_oversub / min_oversubscribed_ratio).ceil();

    if potential_allocation < min_allocation_for_mutualisation {
        return Ok(());
    }

    let mut shared = oversub_resources;
    for core in free {
        if !shared.contains(&core) {
            shared.push(core);
        }
    }
    shared.sort_unstable();

    for manager in managers.iter_mut() {
        for subset in manager.subsets.values_mut() {
            if subset.oversubscription_id() > 1.0 {
                subset.base_mut().set_shared_active(shared.clone());
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use crate::topology::core::Core;

    fn predictor_cfg() -> PredictorConfig {
        PredictorConfig { monitoring_window: 100.0, monitoring_learning: 10.0, monitoring_leeway: 1.0 }
    }

    fn topology_with(node_cores: &[(u32, u32)]) -> CpuSet {
        let numa = std::collections::HashMap::from([(0, vec![10, 10]), (1, vec![10, 10])]);
        let mut set = CpuSet::new(node_cores.len(), numa);
        for &(id, node) in node_cores {
            set.add_cpu(Core {
                cpu_id: id,
                numa_node: node,
                sib_smt: vec![],
                sib_cpu: vec![],
                cache_level: BTreeMap::new(),
                max_freq_khz: 2_000_000,
                cpu_time: Default::default(),
            });
        }
        set
    }

    /// One NUMA node, six cores split into three L1 groups `{0,1}`,
    /// `{2,3}`, `{4,5}`, with `{0,1,2,3}` further sharing an L2 id so that
    /// core 0 is nearer to core 3 (shares L2) than to core 5 (shares
    /// neither level). Self-numa distance is 5, so same-node cache misses
    /// still resolve to a finite, always-largest distance.
    fn socketed_topology() -> CpuSet {
        let numa = std::collections::HashMap::from([(0, vec![5])]);
        let mut set = CpuSet::new(6, numa);
        let l1_of = |id: u32| (id / 2) as u64;
        let l2_of = |id: u32| if id < 4 { 0u64 } else { 1u64 };
        for id in 0..6 {
            let mut cache_level = BTreeMap::new();
            cache_level.insert(0, l1_of(id));
            cache_level.insert(1, l2_of(id));
            set.add_cpu(Core {
                cpu_id: id,
                numa_node: 0,
                sib_smt: vec![],
                sib_cpu: vec![],
                cache_level,
                max_freq_khz: 2_000_000,
                cpu_time: Default::default(),
            });
        }
        set
    }

    #[test]
    fn creates_subset_on_first_deploy() {
        let topo = topology_with(&[(0, 0), (1, 0), (2, 0), (3, 0)]);
        let mut mgr = CpuSubsetManager::new(0, false, 0, predictor_cfg());
        let vm = DomainEntity::builder("vm-a", 1024, 2, 1.0).build();
        mgr.deploy(&topo, &vm, 1.0, 2).unwrap();
        assert_eq!(mgr.subsets.get(1.0).unwrap().resources().len(), 2);
    }

    #[test]
    fn create_fails_when_node_is_out_of_cores() {
        let topo = topology_with(&[(0, 0)]);
        let mut mgr = CpuSubsetManager::new(0, false, 0, predictor_cfg());
        let vm = DomainEntity::builder("vm-a", 1024, 4, 1.0).build();
        assert!(mgr.deploy(&topo, &vm, 1.0, 4).is_err());
    }

    #[test]
    fn remove_shrinks_unused_tail_and_drops_empty_subset() {
        let topo = topology_with(&[(0, 0), (1, 0)]);
        let mut mgr = CpuSubsetManager::new(0, false, 0, predictor_cfg());
        let vm = DomainEntity::builder("vm-a", 1024, 2, 1.0).build();
        mgr.deploy(&topo, &vm, 1.0, 2).unwrap();
        mgr.remove(&vm, 1.0).unwrap();
        assert!(mgr.subsets.get(1.0).is_none());
    }

    #[test]
    fn closest_available_cpus_penalizes_a_core_closer_to_a_sibling_subset() {
        // Own subset owns core 0; a sibling subset owns core 3, which
        // shares an L2 id with core 0's socket. Of the two available
        // cores, 2 is nominally closer to core 0 than 5 is — but 2 is
        // even closer to the sibling's core 3, so it must be penalized
        // out of first place in favor of 5.
        let topo = socketed_topology();
        let mut mgr = CpuSubsetManager::new(0, false, 0, predictor_cfg());
        let mut owned = CpuStaticSubset::new(0, OversubscriptionPolicy::new(2.0, 0));
        owned.add_resource(0);
        mgr.subsets.add(2.0, CpuSubset::Static(owned));
        let mut sibling = CpuStaticSubset::new(0, OversubscriptionPolicy::new(3.0, 0));
        sibling.add_resource(3);
        mgr.subsets.add(3.0, CpuSubset::Static(sibling));

        let ordered = mgr.closest_available_cpus(&topo, &[2, 5], &[0], 2.0).unwrap();
        assert_eq!(ordered[0], 5);
    }

    #[test]
    fn closest_available_cpus_skips_penalty_against_its_own_ratio() {
        // A candidate closer to a subset of the *same* ratio (e.g. the
        // subset being grown itself, passed as `own_ratio`) is never
        // penalized against itself.
        let topo = socketed_topology();
        let mut mgr = CpuSubsetManager::new(0, false, 0, predictor_cfg());
        let mut owned = CpuStaticSubset::new(0, OversubscriptionPolicy::new(2.0, 0));
        owned.add_resource(3);
        mgr.subsets.add(2.0, CpuSubset::Static(owned));

        let ordered = mgr.closest_available_cpus(&topo, &[2, 5], &[0], 2.0).unwrap();
        // Without a sibling to penalize against, plain closest-first order
        // applies: core 2 (distance 20) before core 5 (distance 25).
        assert_eq!(ordered[0], 2);
    }

    #[test]
    fn balance_shares_cores_across_oversubscribed_subsets_when_slack_allows() {
        // critical_size=2 with a single consumer: the subset has not yet
        // reached critical size, so the sharing pass is allowed to run.
        let topo = topology_with(&[(0, 0), (1, 0), (2, 0), (3, 0)]);
        let mut mgr_a = CpuSubsetManager::new(0, false, 2, predictor_cfg());
        let vm = DomainEntity::builder("vm-a", 1024, 1, 2.0).build();
        mgr_a.deploy(&topo, &vm, 2.0, 1).unwrap();
        let mut managers = vec![mgr_a];
        balance_available_resources(&mut managers, &topo).unwrap();
        let subset = managers[0].subsets.get(2.0).unwrap();
        assert!(!subset.base().shared_active().is_empty());
    }

    #[test]
    fn balance_is_noop_without_any_oversubscribed_subset() {
        let topo = topology_with(&[(0, 0), (1, 0)]);
        let mut mgr = CpuSubsetManager::new(0, false, 0, predictor_cfg());
        let vm = DomainEntity::builder("vm-a", 1024, 1, 1.0).build();
        mgr.deploy(&topo, &vm, 1.0, 1).unwrap();
        let mut managers = vec![mgr];
        balance_available_resources(&mut managers, &topo).unwrap();
        assert!(managers[0].subsets.get(1.0).unwrap().base().shared_active().is_empty());
    }

    #[test]
    fn balance_is_noop_once_every_oversubscribed_subset_passed_critical_size() {
        // Same shape as the sharing test above, but critical_size=1 means
        // the single consumer already clears it: no subset is still
        // waiting on mutualisation, so balancing must not run.
        let topo = topology_with(&[(0, 0), (1, 0), (2, 0), (3, 0)]);
        let mut mgr_a = CpuSubsetManager::new(0, false, 1, predictor_cfg());
        let vm = DomainEntity::builder("vm-a", 1024, 1, 2.0).build();
        mgr_a.deploy(&topo, &vm, 2.0, 1).unwrap();
        let mut managers = vec![mgr_a];
        balance_available_resources(&mut managers, &topo).unwrap();
        let subset = managers[0].subsets.get(2.0).unwrap();
        assert!(subset.base().shared_active().is_empty());
    }
}
