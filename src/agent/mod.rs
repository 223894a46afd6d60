//! Per-host local agent: owns the manager pool behind a single coarse
//! mutex (spec §5), drives the periodic `iterate(t)` control loop — live
//! or trace-replay — and serves the five-verb REST surface (spec §6.1).
//! Grounded on `SchedulerLocal`/`ApiEndpoint`
//! (`examples/original_source/schedulerlocal/schedulerlocal.py`,
//! `apiendpoint/apiendpoint.py`), axum wiring style from
//! `nvm::webgui::server`'s `Router::new().route(...)` construction.

use crate::dataendpoint::trace::CsvTrace;
use crate::dataendpoint::{CsvWriter, DataSink};
use crate::error::SchedulerResult;
use crate::manager::ManagerPool;
use axum::extract::{Query, State};
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

#[derive(Clone)]
struct AppState {
    pool: Arc<Mutex<ManagerPool>>,
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

#[derive(Debug, Serialize)]
struct StatusResponse {
    cpu: BTreeMap<u32, crate::manager::ManagerStatus>,
    mem: BTreeMap<u32, crate::manager::ManagerStatus>,
}

/// Per-host local agent process state: the REST router and the outer
/// control loop both close over the same `Arc<Mutex<ManagerPool>>`
/// (spec §5's "single coarse mutex... handlers and the control loop may
/// not execute against the ManagerPool concurrently").
pub struct LocalAgent {
    pool: Arc<Mutex<ManagerPool>>,
    delay: Duration,
}

impl LocalAgent {
    pub fn new(pool: ManagerPool, delay: Duration) -> Self {
        Self { pool: Arc::new(Mutex::new(pool)), delay }
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/", get(heartbeat))
            .route("/status", get(status_handler))
            .route("/listvm", get(listvm_handler))
            .route("/deploy", get(deploy_handler))
            .route("/remove", get(remove_handler))
            .with_state(AppState { pool: self.pool.clone() })
    }

    /// Live outer control loop (spec §4.11): record `start`, run
    /// `iterate(t)`, sleep `delay - elapsed`; a negative remainder logs an
    /// overlap warning and continues immediately rather than sleeping a
    /// negative duration. Status is logged only when it changed from the
    /// previous iteration (spec §4.11). `shutdown` going high is a
    /// cancellation point, honored both mid-sleep and at the next loop
    /// boundary (spec §5).
    pub async fn run_live(&self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        let start = Instant::now();
        let mut last_status = String::new();
        while !*shutdown.borrow() {
            let iter_start = Instant::now();
            let t = start.elapsed().as_secs_f64();
            {
                let mut pool = self.pool.lock().await;
                if let Err(e) = pool.iterate(t, None) {
                    log::error!("iterate({t}) failed: {e}");
                }
                let status = format!("{:?}", pool.status());
                if status != last_status {
                    log::info!("status changed: {status}");
                    last_status = status;
                }
            }

            let elapsed = iter_start.elapsed();
            let sleep_for = match self.delay.checked_sub(elapsed) {
                Some(d) => d,
                None => {
                    log::warn!("iteration at t={t:.3} took longer than the configured delay, continuing immediately");
                    Duration::ZERO
                }
            };

            tokio::select! {
                _ = tokio::time::sleep(sleep_for) => {}
                _ = shutdown.changed() => {}
            }
        }
        log::info!("local agent control loop stopped on cancellation");
    }

    /// Replay outer control loop (spec §4.11): driven by the trace's
    /// sorted timestamps rather than wall-clock delay. At each timestamp,
    /// deploys VMs whose `tmp_first == t`, removes those whose
    /// `tmp_last == t_prev`, then runs one `iterate_replay` pass. The
    /// hypervisor connector backing `pool` is expected to be an
    /// `OfflineConnector` in this mode.
    pub async fn run_replay(&self, trace: CsvTrace, mut sink: Option<CsvWriter>) -> SchedulerResult<()> {
        for t in trace.timestamps() {
            let mut pool = self.pool.lock().await;
            for vm in trace.deployed_on(t) {
                if let Err(e) = pool.deploy(vm.name(), vm.cpu(), vm.mem_mb(), vm.cpu_ratio(), None) {
                    log::warn!("replay deploy '{}' at t={t} failed: {e}", vm.name());
                }
            }
            for vm in trace.destroyed_on(t) {
                if let Err(e) = pool.remove(vm.name()) {
                    log::warn!("replay remove '{}' at t={t} failed: {e}", vm.name());
                }
            }
            let sink_ref: Option<&mut dyn DataSink> = sink.as_mut().map(|s| s as &mut dyn DataSink);
            pool.iterate_replay(t, &trace, sink_ref)?;
        }
        if let Some(sink) = sink.as_mut() {
            sink.flush()?;
        }
        Ok(())
    }
}

async fn heartbeat() -> &'static str {
    "hvsched local agent OK\n"
}

async fn status_handler(State(state): State<AppState>) -> Json<StatusResponse> {
    let pool = state.pool.lock().await;
    Json(StatusResponse { cpu: pool.status(), mem: pool.mem_status() })
}

async fn listvm_handler(State(state): State<AppState>) -> Json<Vec<String>> {
    let pool = state.pool.lock().await;
    Json(pool.list_vm().into_iter().map(|vm| vm.name().to_string()).collect())
}

async fn deploy_handler(State(state): State<AppState>, Query(params): Query<DeployParams>) -> Json<ActionResult> {
    let (name, cpu, mem_gb, oc) = match (params.name, params.cpu, params.mem, params.oc) {
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
    // `mem` is GB at this surface; ManagerPool::deploy takes MB and itself
    // multiplies by 1024 to store KB, so pass GB*1024 (spec §6.1).
    let mem_mb = (mem_gb * 1024.0).round() as u64;
    let mut pool = state.pool.lock().await;
    match pool.deploy(&name, cpu, mem_mb, oc, params.qcow2) {
        Ok(_) => Json(ActionResult::ok()),
        Err(e) => Json(ActionResult::err(e.to_string())),
    }
}

async fn remove_handler(State(state): State<AppState>, Query(params): Query<RemoveParams>) -> Json<ActionResult> {
    let Some(name) = params.name else {
        return Json(ActionResult::err("Wrong usage: /remove?name="));
    };
    let mut pool = state.pool.lock().await;
    match pool.remove(&name) {
        Ok(()) => Json(ActionResult::ok()),
        Err(e) => Json(ActionResult::err(e.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::offline::OfflineConnector;
    use crate::config::PredictorConfig;
    use crate::topology::core::Core;
    use crate::topology::{CpuSet, MemorySet};
    use std::collections::{BTreeMap as Map, HashMap};
    use tower::ServiceExt;

    fn pool_with_four_cores() -> ManagerPool {
        let numa = HashMap::from([(0, vec![10])]);
        let mut topo = CpuSet::new(4, numa);
        for id in 0..4 {
            topo.add_cpu(Core {
                cpu_id: id,
                numa_node: 0,
                sib_smt: vec![],
                sib_cpu: vec![],
                cache_level: Map::new(),
                max_freq_khz: 2_000_000,
                cpu_time: Default::default(),
            });
        }
        let mut mem = MemorySet::new(8192, 8192);
        mem.add_numa_node(0, 8192);
        ManagerPool::new(
            topo,
            mem,
            vec![1.0],
            false,
            0,
            PredictorConfig { monitoring_window: 60.0, monitoring_learning: 10.0, monitoring_leeway: 1.0 },
            Box::new(OfflineConnector::new()),
        )
    }

    #[tokio::test]
    async fn deploy_then_listvm_then_remove_round_trip() {
        let agent = LocalAgent::new(pool_with_four_cores(), Duration::from_secs(1));
        let router = agent.router();

        let req = axum::http::Request::builder()
            .uri("/deploy?name=vm-a&cpu=2&mem=1&oc=1.0")
            .body(axum::body::Body::empty())
            .unwrap();
        let resp = router.clone().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), axum::http::StatusCode::OK);

        let req = axum::http::Request::builder()
            .uri("/listvm")
            .body(axum::body::Body::empty())
            .unwrap();
        let resp = router.clone().oneshot(req).await.unwrap();
        let body = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let names: Vec<String> = serde_json::from_slice(&body).unwrap();
        assert_eq!(names, vec!["vm-a".to_string()]);

        let req = axum::http::Request::builder()
            .uri("/remove?name=vm-a")
            .body(axum::body::Body::empty())
            .unwrap();
        let resp = router.clone().oneshot(req).await.unwrap();
        let body = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let result: ActionResult = serde_json::from_slice(&body).unwrap();
        assert!(result.success);
    }

    #[tokio::test]
    async fn deploy_missing_params_reports_wrong_usage() {
        let agent = LocalAgent::new(pool_with_four_cores(), Duration::from_secs(1));
        let router = agent.router();
        let req = axum::http::Request::builder()
            .uri("/deploy?name=vm-a")
            .body(axum::body::Body::empty())
            .unwrap();
        let resp = router.oneshot(req).await.unwrap();
        let body = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let result: ActionResult = serde_json::from_slice(&body).unwrap();
        assert!(!result.success);
        assert!(result.reason.unwrap().starts_with("Wrong usage"));
    }

    #[tokio::test]
    async fn status_reports_both_resource_kinds() {
        let agent = LocalAgent::new(pool_with_four_cores(), Duration::from_secs(1));
        let router = agent.router();
        let req = axum::http::Request::builder()
            .uri("/status")
            .body(axum::body::Body::empty())
            .unwrap();
        let resp = router.oneshot(req).await.unwrap();
        let body = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert!(value.get("cpu").is_some());
        assert!(value.get("mem").is_some());
    }
}
