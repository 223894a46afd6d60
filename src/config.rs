//! Environment-variable configuration surface (spec §6.4).
//!
//! Every `std::env::var` call in the crate lives here. Both binaries call
//! `LocalAgentConfig::from_env()` / `DispatcherConfig::from_env()` exactly
//! once at startup; everything downstream receives plain values.

use crate::error::{SchedulerError, SchedulerResult};
use std::time::Duration;

fn required(name: &str) -> SchedulerResult<String> {
    std::env::var(name).map_err(|_| SchedulerError::ConfigMissing(name.to_string()))
}

fn optional(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

fn parse_required<T: std::str::FromStr>(name: &str) -> SchedulerResult<T> {
    required(name)?
        .parse()
        .map_err(|_| SchedulerError::ConfigMissing(format!("{name} (unparsable)")))
}

fn parse_optional<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// `QEMU_URL`/`QEMU_LOC`/`QEMU_MACHINE` — the hypervisor connection
/// parameters forwarded into the domain-XML templater (spec §6.5).
#[derive(Debug, Clone)]
pub struct QemuConfig {
    pub url: String,
    pub loc: String,
    pub machine: String,
}

impl QemuConfig {
    pub fn from_env() -> Self {
        Self {
            url: optional("QEMU_URL", "qemu:///system"),
            loc: optional("QEMU_LOC", "/var/lib/libvirt/images"),
            machine: optional("QEMU_MACHINE", "pc"),
        }
    }
}

/// `TOPO_EXCLUDE` — comma-separated physical core ids never admitted by the
/// topology explorer.
fn parse_core_list(raw: &str) -> Vec<u32> {
    raw.split(',')
        .filter_map(|s| s.trim().parse::<u32>().ok())
        .collect()
}

/// `SCL_ACT_MONITORING`/`SCL_ACT_LEARNING`/`SCL_ACT_LEEWAY` — elastic subset
/// predictor tuning (spec §4.8).
#[derive(Debug, Clone, Copy)]
pub struct PredictorConfig {
    pub monitoring_window: f64,
    pub monitoring_learning: f64,
    pub monitoring_leeway: f64,
}

impl PredictorConfig {
    pub fn from_env() -> Self {
        Self {
            monitoring_window: parse_optional("SCL_ACT_MONITORING", 3600.0),
            monitoring_learning: parse_optional("SCL_ACT_LEARNING", 600.0),
            monitoring_leeway: parse_optional("SCL_ACT_LEEWAY", 1.0),
        }
    }
}

/// Configuration for the per-host local agent process.
#[derive(Debug, Clone)]
pub struct LocalAgentConfig {
    pub bind_url: String,
    pub bind_port: u16,
    pub iteration_delay: Duration,
    pub qemu: QemuConfig,
    pub topo_exclude: Vec<u32>,
    pub critical_size: usize,
    pub template: Vec<f64>,
    pub predictor: PredictorConfig,
    /// Whether newly created CPU subsets are elastic (predictor-sized
    /// active window, spec §4.7) or static. Not named in spec §6.4's
    /// environment surface — defaulted on, since the elastic flavor is
    /// this system's headline capability, and exposed as `SCL_ELASTIC`
    /// for operators who want the simpler static behavior instead.
    pub elastic: bool,
}

impl LocalAgentConfig {
    pub fn from_env() -> SchedulerResult<Self> {
        let delay_secs: f64 = parse_optional("SCL_DELAY", 5.0);
        let template_raw = optional("OVSB_TEMPLATE", "1.0");
        let template: Vec<f64> = template_raw
            .split(',')
            .filter_map(|s| s.trim().parse::<f64>().ok())
            .collect();
        if template.is_empty() {
            return Err(SchedulerError::ConfigMissing(
                "OVSB_TEMPLATE (empty after parse)".to_string(),
            ));
        }
        Ok(Self {
            bind_url: optional("SCL_URL", "0.0.0.0"),
            bind_port: parse_optional("SCL_PORT", 8100),
            iteration_delay: Duration::from_secs_f64(delay_secs.max(0.0)),
            qemu: QemuConfig::from_env(),
            topo_exclude: parse_core_list(&optional("TOPO_EXCLUDE", "")),
            critical_size: parse_required("OVSB_CRITICAL_SIZE")?,
            template,
            predictor: PredictorConfig::from_env(),
            elastic: parse_optional("SCL_ELASTIC", true),
        })
    }
}

/// Configuration for the fleet-wide global dispatcher process.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub bind_url: String,
    pub bind_port: u16,
    pub iteration_delay: Duration,
    pub node_urls: Vec<String>,
    /// `SCG_CONNECT_TIMEOUT_MS`/`SCG_READ_TIMEOUT_MS` — per spec §5, the
    /// dispatcher's REST client to each node has explicit connect and read
    /// deadlines and never retries.
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
}

impl DispatcherConfig {
    pub fn from_env() -> SchedulerResult<Self> {
        let delay_secs: f64 = parse_optional("SCG_DELAY", 10.0);
        let node_urls: Vec<String> = required("SCG_NODE_URL_LIST")?
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        if node_urls.is_empty() {
            return Err(SchedulerError::ConfigMissing(
                "SCG_NODE_URL_LIST (empty after parse)".to_string(),
            ));
        }
        Ok(Self {
            bind_url: optional("SCG_URL", "0.0.0.0"),
            bind_port: parse_optional("SCG_PORT", 8200),
            iteration_delay: Duration::from_secs_f64(delay_secs.max(0.0)),
            node_urls,
            connect_timeout: Duration::from_millis(parse_optional("SCG_CONNECT_TIMEOUT_MS", 2000)),
            read_timeout: Duration::from_millis(parse_optional("SCG_READ_TIMEOUT_MS", 5000)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_core_list_skips_junk() {
        assert_eq!(parse_core_list("0,1, 3,x,5"), vec![0, 1, 3, 5]);
    }

    #[test]
    fn parse_core_list_empty() {
        assert_eq!(parse_core_list(""), Vec::<u32>::new());
    }
}
