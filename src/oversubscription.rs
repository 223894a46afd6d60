//! Static oversubscription policy: physical→virtual capacity translation
//! under a fixed ratio with a critical-size lower bound (spec §4.5).
//!
//! Ported field-for-field from the original's `SubsetOversubscriptionStatic`
//! (`examples/original_source/schedulerlocal/subset/subsetoversubscription.py`):
//! same effective-ratio gate, same unused/missing formulas.

/// The id of a policy is its ratio; `1.0` means no oversubscription
/// (spec §3 I4). `critical_size` is read once at startup from
/// `OVSB_CRITICAL_SIZE` and passed in by the manager that owns this policy.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OversubscriptionPolicy {
    ratio: f64,
    critical_size: usize,
}

impl OversubscriptionPolicy {
    pub fn new(ratio: f64, critical_size: usize) -> Self {
        Self { ratio, critical_size }
    }

    pub fn id(&self) -> f64 {
        self.ratio
    }

    pub fn ratio(&self) -> f64 {
        self.ratio
    }

    /// Whether this subset has enough consumers to have its ratio honored
    /// at all (spec §4.5's critical size `k`; `is_critical_size_reached`
    /// in the original `SubsetOversubscriptionStatic`).
    pub fn is_critical_size_reached(&self, consumer_count: usize) -> bool {
        consumer_count >= self.critical_size
    }

    /// `r_eff = 1.0 if n < k else r`, where `n` is `consumer_count`
    /// (already incremented by the caller if a candidate VM is being
    /// considered, per spec §4.5 "with a candidate new VM, use n+1").
    pub fn effective_ratio(&self, consumer_count: usize) -> f64 {
        if consumer_count < self.critical_size {
            1.0
        } else {
            self.ratio
        }
    }

    /// `C · r_eff`, the virtual capacity of `capacity` physical resources.
    pub fn oversubscribed_quantity(&self, capacity: f64, consumer_count: usize) -> f64 {
        capacity * self.effective_ratio(consumer_count)
    }

    /// `C · r_eff − A`: virtual resources still available.
    pub fn available(&self, capacity: f64, allocation: f64, consumer_count: usize) -> f64 {
        self.oversubscribed_quantity(capacity, consumer_count) - allocation
    }

    /// `u = floor((C·r_eff − A)/r_eff)`, clamped so `C − u ≥ max_consumer_alloc`
    /// (never shrink below the largest consumer, spec §4.5).
    pub fn unused_resources_count(
        &self,
        capacity: f64,
        allocation: f64,
        consumer_count: usize,
        max_consumer_allocation: f64,
    ) -> usize {
        let r_eff = self.effective_ratio(consumer_count);
        let available_oversubscribed = self.available(capacity, allocation, consumer_count);
        let unused = (available_oversubscribed / r_eff).floor();
        let used = capacity - unused;

        if used < max_consumer_allocation {
            return 0f64.max((capacity - max_consumer_allocation).floor()) as usize;
        }
        unused.max(0.0) as usize
    }

    /// Additional physical resources needed so `request` (the VM's
    /// un-oversubscribed allocation) fits, given a candidate deploy
    /// (`consumer_count` already includes the new VM).
    pub fn additional_resources_required(
        &self,
        request: f64,
        capacity: f64,
        allocation: f64,
        consumer_count: usize,
    ) -> usize {
        let r_eff = self.effective_ratio(consumer_count);
        let available_oversubscribed = self.available(capacity, allocation, consumer_count);
        let missing_oversubscribed = request - available_oversubscribed;
        let mut missing_physical = if missing_oversubscribed > 0.0 {
            (missing_oversubscribed / r_eff).ceil()
        } else {
            0.0
        };

        let new_capacity = capacity + missing_physical;
        if new_capacity < request {
            missing_physical += (request - new_capacity).ceil();
        }
        missing_physical.max(0.0) as usize
    }
}

impl std::fmt::Display for OversubscriptionPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "oc:{}", self.ratio)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn below_critical_size_ratio_is_one() {
        let p = OversubscriptionPolicy::new(3.0, 2);
        assert_eq!(p.effective_ratio(0), 1.0);
        assert_eq!(p.effective_ratio(1), 1.0);
        assert_eq!(p.effective_ratio(2), 3.0);
    }

    #[test]
    fn critical_size_reached_is_a_strict_consumer_count_comparison() {
        let p = OversubscriptionPolicy::new(3.0, 2);
        assert!(!p.is_critical_size_reached(1));
        assert!(p.is_critical_size_reached(2));
        assert!(p.is_critical_size_reached(3));
    }

    #[test]
    fn no_oversubscription_at_ratio_one() {
        let p = OversubscriptionPolicy::new(1.0, 0);
        assert_eq!(p.available(4.0, 2.0, 2), 2.0);
    }

    #[test]
    fn unused_never_drops_below_max_consumer() {
        // 4 physical cores, ratio 2, one consumer needing all 4 alone.
        let p = OversubscriptionPolicy::new(2.0, 0);
        let unused = p.unused_resources_count(4.0, 4.0, 1, 4.0);
        assert_eq!(unused, 0);
    }

    #[test]
    fn scenario_critical_size_gate() {
        // spec §8 scenario 2: 4 cores, critical_size=2, ratio 3.0.
        let p = OversubscriptionPolicy::new(3.0, 2);
        // Two 1-vcpu VMs already deployed (n=2), deploying a third (n+1=3).
        let missing = p.additional_resources_required(1.0, 2.0, 2.0, 3);
        assert_eq!(missing, 0); // fits virtually: 2*3 - 2 = 4 >= 1
        assert_eq!(p.available(2.0, 3.0, 3), 3.0);
    }

    #[test]
    fn additional_resources_for_oversized_vm() {
        // A 32-vcpu request must never be oversubscribed with itself.
        let p = OversubscriptionPolicy::new(2.0, 0);
        let missing = p.additional_resources_required(32.0, 0.0, 0.0, 1);
        assert_eq!(missing, 32);
    }
}
