//! Linux sysfs/procfs topology discovery (spec §4.2).
//!
//! Reads `/sys/devices/system/cpu`, `/sys/devices/system/node` and
//! `/proc/meminfo` on Linux. On any other target, or if those paths are
//! unreadable (containers without a full sysfs mount), falls back to a
//! single synthetic NUMA node built from `num_cpus::get()`.

use super::core::{Core, CpuTime};
use super::cpuset::CpuSet;
use super::memory::MemorySet;
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::Path;

const FS_CPU: &str = "/sys/devices/system/cpu";
const FS_NUMA: &str = "/sys/devices/system/node";
const FS_STAT: &str = "/proc/stat";
const FS_MEMINFO: &str = "/proc/meminfo";

/// Builds `CpuSet`/`MemorySet` snapshots from the live host, applying an
/// include/exclude core filter (`TOPO_EXCLUDE`, spec §6.4).
pub struct TopologyExplorer {
    to_include: Vec<u32>,
    to_exclude: Vec<u32>,
}

impl TopologyExplorer {
    pub fn new(to_exclude: Vec<u32>) -> Self {
        Self {
            to_include: Vec::new(),
            to_exclude,
        }
    }

    pub fn with_include(mut self, to_include: Vec<u32>) -> Self {
        self.to_include = to_include;
        self
    }

    pub fn build_cpuset(&self) -> CpuSet {
        if Path::new(FS_CPU).is_dir() && Path::new(FS_NUMA).is_dir() {
            match self.build_cpuset_linux() {
                Ok(set) => return set,
                Err(e) => log::warn!("falling back to single-node topology: {e}"),
            }
        }
        self.build_cpuset_fallback()
    }

    pub fn build_memoryset(&self) -> MemorySet {
        if Path::new(FS_MEMINFO).is_file() {
            match self.build_memoryset_linux() {
                Ok(set) => return set,
                Err(e) => log::warn!("falling back to synthetic memory topology: {e}"),
            }
        }
        self.build_memoryset_fallback()
    }

    /// Refresh the usage ratio of every core in `cpuset` from `/proc/stat`.
    /// Returns `None` per core on the first call (no previous sample) or if
    /// `/proc/stat` cannot be read.
    pub fn refresh_usage(&self, cpuset: &mut CpuSet) {
        let Ok(content) = fs::read_to_string(FS_STAT) else {
            return;
        };
        let mut by_id: HashMap<u32, (u64, u64)> = HashMap::new();
        for line in content.lines() {
            let cols: Vec<&str> = line.split_whitespace().collect();
            let Some(tag) = cols.first() else { continue };
            let Some(rest) = tag.strip_prefix("cpu") else {
                break;
            };
            if rest.is_empty() {
                continue; // aggregate "cpu" line, not a per-core line
            }
            let Ok(id) = rest.parse::<u32>() else {
                continue;
            };
            let fields: Vec<u64> = cols[1..].iter().filter_map(|f| f.parse().ok()).collect();
            if fields.len() < 8 {
                continue;
            }
            let idle = fields[3] + fields[4];
            let not_idle = fields[0] + fields[1] + fields[2] + fields[5] + fields[6] + fields[7];
            by_id.insert(id, (idle, not_idle));
        }
        for core in cpuset.cpu_list_mut() {
            if let Some((idle, not_idle)) = by_id.get(&core.cpu_id) {
                core.cpu_time.push_sample(*idle, *not_idle);
            }
        }
    }

    fn is_conform(&self, cpu_id: u32) -> bool {
        if self.to_exclude.contains(&cpu_id) {
            return false;
        }
        self.to_include.is_empty() || self.to_include.contains(&cpu_id)
    }

    fn build_cpuset_linux(&self) -> std::io::Result<CpuSet> {
        let mut found = Vec::new();
        for entry in fs::read_dir(FS_CPU)? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if let Some(rest) = name.strip_prefix("cpu") {
                if let Ok(id) = rest.parse::<u32>() {
                    found.push(id);
                }
            }
        }
        found.sort_unstable();
        let host_count = found.len();
        let conform: Vec<u32> = found.into_iter().filter(|id| self.is_conform(*id)).collect();

        let numa_distances = self.read_numa_distances()?;
        let mut cpuset = CpuSet::new(host_count, numa_distances);
        for id in &conform {
            if let Ok(core) = self.read_core(*id, &conform) {
                cpuset.add_cpu(core);
            }
        }
        Ok(cpuset)
    }

    fn read_core(&self, cpu_id: u32, conform: &[u32]) -> std::io::Result<Core> {
        let topology = format!("{FS_CPU}/cpu{cpu_id}/topology");
        let numa_node: u32 = fs::read_to_string(format!("{topology}/physical_package_id"))?
            .trim()
            .parse()
            .unwrap_or(0);
        let sib_smt = parse_list(&fs::read_to_string(format!(
            "{topology}/thread_siblings_list"
        ))?)
        .into_iter()
        .filter(|id| *id != cpu_id && conform.contains(id))
        .collect();
        let sib_cpu = parse_list(&fs::read_to_string(format!(
            "{topology}/core_siblings_list"
        ))?)
        .into_iter()
        .filter(|id| *id != cpu_id && conform.contains(id))
        .collect();

        let cache_level = self.read_cache_levels(cpu_id);
        let max_freq_khz = fs::read_to_string(format!(
            "{FS_CPU}/cpu{cpu_id}/cpufreq/cpuinfo_max_freq"
        ))
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(0);

        Ok(Core {
            cpu_id,
            numa_node,
            sib_smt,
            sib_cpu,
            cache_level,
            max_freq_khz,
            cpu_time: CpuTime::default(),
        })
    }

    fn read_cache_levels(&self, cpu_id: u32) -> BTreeMap<u32, u64> {
        let mut levels = BTreeMap::new();
        for level in 0.. {
            let path = format!("{FS_CPU}/cpu{cpu_id}/cache/index{level}/id");
            match fs::read_to_string(&path) {
                Ok(s) => match s.trim().parse::<u64>() {
                    Ok(id) => {
                        levels.insert(level, id);
                    }
                    Err(_) => break,
                },
                Err(_) => break,
            }
        }
        levels
    }

    fn read_numa_distances(&self) -> std::io::Result<HashMap<u32, Vec<u32>>> {
        let mut distances = HashMap::new();
        for index in 0.. {
            let path = format!("{FS_NUMA}/node{index}/distance");
            if !Path::new(&path).exists() {
                break;
            }
            let row: Vec<u32> = fs::read_to_string(&path)?
                .split_whitespace()
                .filter_map(|s| s.parse().ok())
                .collect();
            distances.insert(index, row);
        }
        if distances.is_empty() {
            distances.insert(0, vec![10]);
        }
        Ok(distances)
    }

    fn build_cpuset_fallback(&self) -> CpuSet {
        let count = num_cpus::get() as u32;
        let numa_distances = HashMap::from([(0, vec![10])]);
        let mut cpuset = CpuSet::new(count as usize, numa_distances);
        for id in 0..count {
            if !self.is_conform(id) {
                continue;
            }
            cpuset.add_cpu(Core {
                cpu_id: id,
                numa_node: 0,
                sib_smt: Vec::new(),
                sib_cpu: Vec::new(),
                cache_level: BTreeMap::from([(0, 0)]),
                max_freq_khz: 0,
                cpu_time: CpuTime::default(),
            });
        }
        cpuset
    }

    fn build_memoryset_linux(&self) -> std::io::Result<MemorySet> {
        let meminfo = fs::read_to_string(FS_MEMINFO)?;
        let total_mb = read_meminfo_total(&meminfo, 1)
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::InvalidData, "no MemTotal"))?;
        let mut set = MemorySet::new(total_mb, total_mb);

        for entry in fs::read_dir(FS_NUMA)? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            let Some(rest) = name.strip_prefix("node") else {
                continue;
            };
            let Ok(numa_id) = rest.parse::<u32>() else {
                continue;
            };
            let numa_meminfo_path = entry.path().join("meminfo");
            if let Ok(numa_meminfo) = fs::read_to_string(&numa_meminfo_path) {
                if let Some(mb) = read_meminfo_total(&numa_meminfo, 3) {
                    set.add_numa_node(numa_id, mb);
                }
            }
        }
        Ok(set)
    }

    fn build_memoryset_fallback(&self) -> MemorySet {
        let total_mb = fs::read_to_string(FS_MEMINFO)
            .ok()
            .and_then(|s| read_meminfo_total(&s, 1))
            .unwrap_or(8192);
        let mut set = MemorySet::new(total_mb, total_mb);
        set.add_numa_node(0, total_mb);
        set
    }
}

fn parse_list(raw: &str) -> Vec<u32> {
    let raw = raw.trim();
    let mut out = Vec::new();
    for part in raw.split(',') {
        if let Some((lo, hi)) = part.split_once('-') {
            if let (Ok(lo), Ok(hi)) = (lo.parse::<u32>(), hi.parse::<u32>()) {
                out.extend(lo..=hi);
            }
        } else if let Ok(id) = part.parse::<u32>() {
            out.push(id);
        }
    }
    out
}

/// `field_index` is 1 for the global `/proc/meminfo` (`MemTotal:` is column
/// 1), 3 for the per-node `<node>/meminfo` format (`Node N MemTotal:` is
/// column 3). Values in those files are kB; this returns MB.
fn read_meminfo_total(data: &str, field_index: usize) -> Option<u64> {
    let first_line = data.lines().next()?;
    let cols: Vec<&str> = first_line.split_whitespace().collect();
    cols.get(field_index)?.parse::<u64>().ok().map(|kb| kb / 1024)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_list_ranges_and_singles() {
        assert_eq!(parse_list("0-2,5"), vec![0, 1, 2, 5]);
    }

    #[test]
    fn read_meminfo_total_global_format() {
        let data = "MemTotal:       16384000 kB\nMemFree: 100 kB\n";
        assert_eq!(read_meminfo_total(data, 1), Some(16000));
    }

    #[test]
    fn read_meminfo_total_numa_format() {
        let data = "Node 0 MemTotal:       8192000 kB\n";
        assert_eq!(read_meminfo_total(data, 3), Some(8000));
    }

    #[test]
    fn fallback_cpuset_respects_exclude() {
        let explorer = TopologyExplorer::new(vec![0]);
        let set = explorer.build_cpuset_fallback();
        assert!(set.get(0).is_none());
    }
}
