//! A single physical CPU core and its cumulative `/proc/stat` time counters.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Idle/non-idle tick counters sampled from `/proc/stat`, used to derive a
/// usage ratio as a delta between two samples (spec §3's `usage` field).
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct CpuTime {
    idle: Option<u64>,
    not_idle: Option<u64>,
}

impl CpuTime {
    pub fn has_time(&self) -> bool {
        self.idle.is_some() && self.not_idle.is_some()
    }

    pub fn set_time(&mut self, idle: u64, not_idle: u64) {
        self.idle = Some(idle);
        self.not_idle = Some(not_idle);
    }

    pub fn get_time(&self) -> Option<(u64, u64)> {
        Some((self.idle?, self.not_idle?))
    }

    pub fn clear(&mut self) {
        self.idle = None;
        self.not_idle = None;
    }

    /// Consume a fresh `(idle, not_idle)` sample, returning the usage ratio
    /// in `[0, 1]` against the previous sample, or `None` on the first call.
    pub fn push_sample(&mut self, idle: u64, not_idle: u64) -> Option<f64> {
        let usage = self.get_time().map(|(prev_idle, prev_not_idle)| {
            let delta_idle = idle.saturating_sub(prev_idle) as f64;
            let delta_total =
                ((idle + not_idle) as i64 - (prev_idle + prev_not_idle) as i64).max(0) as f64;
            if delta_total == 0.0 {
                0.0
            } else {
                (delta_total - delta_idle) / delta_total
            }
        });
        self.set_time(idle, not_idle);
        usage
    }
}

/// A physical core as discovered on the host: its NUMA membership, SMT and
/// socket siblings, the chain of cache identifiers it shares with other
/// cores, and its rated max frequency in kHz.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Core {
    pub cpu_id: u32,
    pub numa_node: u32,
    pub sib_smt: Vec<u32>,
    pub sib_cpu: Vec<u32>,
    /// Cache level (L1, L2, ...) mapped to the cache's unique id on the host.
    /// Two cores sharing a cache id at a given level share that cache.
    pub cache_level: BTreeMap<u32, u64>,
    pub max_freq_khz: u64,
    #[serde(skip)]
    pub cpu_time: CpuTime,
}

impl Core {
    pub fn max_freq_mhz(&self) -> f64 {
        self.max_freq_khz as f64 / 1000.0
    }
}

impl std::fmt::Display for Core {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "cpu{} {:.0}MHz on numa node {} with cache level id {:?}",
            self.cpu_id,
            self.max_freq_mhz(),
            self.numa_node,
            self.cache_level
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cpu_time_first_sample_is_none() {
        let mut t = CpuTime::default();
        assert_eq!(t.push_sample(100, 50), None);
        assert!(t.has_time());
    }

    #[test]
    fn cpu_time_delta_ratio() {
        let mut t = CpuTime::default();
        t.push_sample(100, 50);
        let usage = t.push_sample(110, 100).unwrap();
        // delta_idle=10, delta_total=60 -> busy fraction = 50/60
        assert!((usage - (50.0 / 60.0)).abs() < 1e-9);
    }

    #[test]
    fn cpu_time_clear_resets() {
        let mut t = CpuTime::default();
        t.push_sample(1, 1);
        t.clear();
        assert!(!t.has_time());
    }
}
