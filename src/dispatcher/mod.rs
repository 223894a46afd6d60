//! Fleet-wide global dispatcher: caches every node's last-known `/status`
//! and `/listvm`, and places a new VM on the first node with enough
//! headroom (spec §4.12), grounded on `SchedulerGlobal`
//! (`examples/original_source/schedulerglobal/schedulerglobal.py`).

pub mod client;

use client::{ActionResult as NodeActionResult, AgentClient, NodeStatus};
use crate::error::{SchedulerError, SchedulerResult};
use crate::manager::ManagerStatus;
use axum::extract::{Query, State};
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

struct NodeCache {
    url: String,
    status: Option<NodeStatus>,
    consecutive_failures: u32,
}

/// Fleet state behind the dispatcher's single coarse mutex (spec §5): the
/// REST router and the periodic refresh loop both operate on this, never
/// concurrently.
struct Fleet {
    nodes: Vec<NodeCache>,
    /// VM name -> node url, populated by the periodic `/listvm` refresh
    /// and by successful dispatcher-issued deploys (spec §4.12's `knownVm`).
    known_vm: HashMap<String, String>,
}

/// Entries are dropped after this many consecutive `/listvm` failures
/// (resolution to the open question on `knownVm` staleness: a node that
/// has been unreachable for this long is assumed to have lost its VMs
/// from the dispatcher's point of view, rather than held forever).
const MAX_CONSECUTIVE_FAILURES: u32 = 3;

pub struct GlobalDispatcher {
    fleet: Arc<Mutex<Fleet>>,
    client: AgentClient,
    delay: Duration,
}

#[derive(Clone)]
struct AppState {
    fleet: Arc<Mutex<Fleet>>,
    client: AgentClient,
}

#[derive(Debug, Serialize)]
struct ActionResult {
    success: bool,
    reason: Option<String>,
}

impl ActionResult {
    fn ok() -> Self {
        Self { success: true, reason: None }
    }

    fn err(reason: impl Into<String>) -> Self {
        Self { success: false, reason: Some(reason.into()) }
    }
}

impl From<NodeActionResult> for ActionResult {
    fn from(r: NodeActionResult) -> Self {
        Self { success: r.success, reason: r.reason }
    }
}

#[derive(Debug, Default, Deserialize)]
struct DeployParams {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    cpu: Option<u32>,
    #[serde(default)]
    mem: Option<f64>,
    #[serde(default)]
    oc: Option<f64>,
    #[serde(default)]
    qcow2: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RemoveParams {
    #[serde(default)]
    name: Option<String>,
}

impl GlobalDispatcher {
    pub fn new(node_urls: Vec<String>, delay: Duration, connect_timeout: Duration, read_timeout: Duration) -> Self {
        let nodes = node_urls
            .into_iter()
            .map(|url| NodeCache { url, status: None, consecutive_failures: 0 })
            .collect();
        Self {
            fleet: Arc::new(Mutex::new(Fleet { nodes, known_vm: HashMap::new() })),
            client: AgentClient::new(connect_timeout, read_timeout),
            delay,
        }
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/", get(heartbeat))
            .route("/status", get(status_handler))
            .route("/listvm", get(listvm_handler))
            .route("/deploy", get(deploy_handler))
            .route("/remove", get(remove_handler))
            .with_state(AppState { fleet: self.fleet.clone(), client: self.client.clone() })
    }

    /// Periodic refresh (spec §4.12): pull `/listvm` from every node,
    /// rebuild `knownVm` from the union of responses, and pull `/status`
    /// for the placement cache. A node failing `/listvm`
    /// `MAX_CONSECUTIVE_FAILURES` times in a row has its VMs dropped from
    /// `knownVm` and its status cache cleared.
    pub async fn run_refresh(&self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        while !*shutdown.borrow() {
            self.refresh_once().await;
            tokio::select! {
                _ = tokio::time::sleep(self.delay) => {}
                _ = shutdown.changed() => {}
            }
        }
        log::info!("dispatcher refresh loop stopped on cancellation");
    }

    async fn refresh_once(&self) {
        let node_urls: Vec<String> = {
            let fleet = self.fleet.lock().await;
            fleet.nodes.iter().map(|n| n.url.clone()).collect()
        };

        for url in node_urls {
            let listvm = self.client.list_vm(&url).await;
            let status = self.client.status(&url).await;

            let mut fleet = self.fleet.lock().await;
            let Some(node) = fleet.nodes.iter_mut().find(|n| n.url == url) else { continue };
            match listvm {
                Ok(names) => {
                    node.consecutive_failures = 0;
                    fleet.known_vm.retain(|_, owner| owner != &url);
                    for name in names {
                        fleet.known_vm.insert(name, url.clone());
                    }
                }
                Err(e) => {
                    node.consecutive_failures += 1;
                    log::warn!("listvm failed for {url} ({} consecutive): {e}", node.consecutive_failures);
                    if node.consecutive_failures >= MAX_CONSECUTIVE_FAILURES {
                        log::warn!("dropping knownVm entries for unreachable node {url}");
                        fleet.known_vm.retain(|_, owner| owner != &url);
                        node.status = None;
                    }
                }
            }
            if let Ok(s) = status {
                node.status = Some(s);
            }
        }
    }
}

fn numa_fits_cpu(status: &ManagerStatus, oc: f64, vcpus: u32) -> bool {
    let key = format!("{oc}");
    if let Some(s) = status.subset.get(&key) {
        if s.vavail + s.vpotential >= vcpus as f64 {
            return true;
        }
    }
    status.avail >= vcpus as f64
}

fn numa_fits_mem(status: &ManagerStatus, mem_mb: f64) -> bool {
    if let Some(s) = status.subset.get("1") {
        if s.vavail + s.vpotential >= mem_mb {
            return true;
        }
    }
    status.avail >= mem_mb
}

/// A node fits a request if some NUMA node present in both its `cpu` and
/// `mem` status maps independently has enough headroom for the vcpu count
/// and the memory request (the local agent's own two-phase `deploy` tries
/// every NUMA node itself, so the dispatcher only needs existence, not a
/// specific numa id).
fn node_fits(status: &NodeStatus, oc: f64, vcpus: u32, mem_mb: f64) -> bool {
    for (numa_id, cpu_status) in &status.cpu {
        if let Some(mem_status) = status.mem.get(numa_id) {
            if numa_fits_cpu(cpu_status, oc, vcpus) && numa_fits_mem(mem_status, mem_mb) {
                return true;
            }
        }
    }
    false
}

async fn heartbeat() -> &'static str {
    "hvsched global dispatcher OK\n"
}

async fn status_handler(State(state): State<AppState>) -> Json<BTreeMap<String, Option<NodeStatus>>> {
    let fleet = state.fleet.lock().await;
    Json(fleet.nodes.iter().map(|n| (n.url.clone(), n.status.clone())).collect())
}

async fn listvm_handler(State(state): State<AppState>) -> Json<Vec<String>> {
    let fleet = state.fleet.lock().await;
    let mut names: Vec<String> = fleet.known_vm.keys().cloned().collect();
    names.sort();
    Json(names)
}

/// First-fit placement (spec §4.12): walk nodes in configured order,
/// deploy on the first one whose cached status has room, record the
/// winner in `knownVm` on success.
async fn deploy_handler(State(state): State<AppState>, Query(params): Query<DeployParams>) -> Json<ActionResult> {
    let (name, cpu, mem, oc) = match (params.name, params.cpu, params.mem, params.oc) {
        (Some(name), Some(cpu), Some(mem), Some(oc)) => (name, cpu, mem, oc),
        _ => {
            return Json(ActionResult::err(
                "Wrong usage: /deploy?name=&cpu=&mem=&oc=&qcow2=",
            ))
        }
    };
    if oc < 1.0 {
        return Json(ActionResult::err("oversubscription ratio must be >= 1.0"));
    }
    let mem_mb = mem * 1024.0;

    let candidate_urls: Vec<String> = {
        let fleet = state.fleet.lock().await;
        fleet
            .nodes
            .iter()
            .filter(|n| n.status.as_ref().map_or(false, |s| node_fits(s, oc, cpu, mem_mb)))
            .map(|n| n.url.clone())
            .collect()
    };

    for url in candidate_urls {
        match state.client.deploy(&url, &name, cpu, mem, oc, params.qcow2.as_deref()).await {
            Ok(result) if result.success => {
                let mut fleet = state.fleet.lock().await;
                fleet.known_vm.insert(name.clone(), url);
                return Json(result.into());
            }
            Ok(result) => {
                log::warn!("node {url} rejected deploy for '{name}': {:?}", result.reason);
            }
            Err(e) => {
                log::warn!("node {url} unreachable during deploy: {e}");
            }
        }
    }
    Json(ActionResult::err(SchedulerError::NotEnoughResources { resource: "cpu+mem across fleet".to_string() }.to_string()))
}

async fn remove_handler(State(state): State<AppState>, Query(params): Query<RemoveParams>) -> Json<ActionResult> {
    let Some(name) = params.name else {
        return Json(ActionResult::err("Wrong usage: /remove?name="));
    };
    let node_url = {
        let fleet = state.fleet.lock().await;
        fleet.known_vm.get(&name).cloned()
    };
    let Some(node_url) = node_url else {
        return Json(ActionResult::err(format!("vm '{name}' is not known to this dispatcher")));
    };
    match state.client.remove(&node_url, &name).await {
        Ok(result) if result.success => {
            let mut fleet = state.fleet.lock().await;
            fleet.known_vm.remove(&name);
            Json(result.into())
        }
        Ok(result) => Json(result.into()),
        Err(e) => Json(ActionResult::err(e.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::SubsetStatusView;

    fn status_with_headroom(avail: f64, ratio_key: &str, vavail: f64, vpotential: f64) -> ManagerStatus {
        let mut subset = BTreeMap::new();
        subset.insert(
            ratio_key.to_string(),
            SubsetStatusView { pcap: avail, palloc: 0.0, vavail, vpotential },
        );
        ManagerStatus { avail, subset }
    }

    #[test]
    fn numa_fits_cpu_via_matching_subset() {
        let status = status_with_headroom(8.0, "1", 2.0, 2.0);
        assert!(numa_fits_cpu(&status, 1.0, 4));
        assert!(!numa_fits_cpu(&status, 1.0, 5));
    }

    #[test]
    fn numa_fits_cpu_falls_back_to_raw_avail_without_subset() {
        let status = ManagerStatus { avail: 6.0, subset: BTreeMap::new() };
        assert!(numa_fits_cpu(&status, 2.0, 6));
        assert!(!numa_fits_cpu(&status, 2.0, 7));
    }

    #[test]
    fn node_fits_requires_same_numa_on_both_axes() {
        let mut cpu = BTreeMap::new();
        cpu.insert(0, status_with_headroom(8.0, "1", 4.0, 4.0));
        let mut mem = BTreeMap::new();
        mem.insert(1, status_with_headroom(8192.0, "1", 4096.0, 4096.0));
        let status = NodeStatus { cpu, mem };
        assert!(!node_fits(&status, 1.0, 4, 1024.0));
    }

    #[test]
    fn node_fits_when_same_numa_has_both() {
        let mut cpu = BTreeMap::new();
        cpu.insert(0, status_with_headroom(8.0, "1", 4.0, 4.0));
        let mut mem = BTreeMap::new();
        mem.insert(0, status_with_headroom(8192.0, "1", 4096.0, 4096.0));
        let status = NodeStatus { cpu, mem };
        assert!(node_fits(&status, 1.0, 4, 1024.0));
    }
}
