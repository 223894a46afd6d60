//! REST client the global dispatcher uses to reach each node's local
//! agent (spec §6.2), grounded on `ApiRequester`
//! (`examples/original_source/schedulerglobal/apirequester.py`). One
//! `reqwest::Client` shared across all nodes, connect and read timeouts
//! set explicitly, no retries (spec §5 — a failed call is reported to the
//! caller, which decides whether to count it against the node).

use crate::error::{SchedulerError, SchedulerResult};
use crate::manager::ManagerStatus;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ActionResult {
    pub success: bool,
    pub reason: Option<String>,
}

/// Mirrors the local agent's `/status` response shape (spec §6.1).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct NodeStatus {
    pub cpu: BTreeMap<u32, ManagerStatus>,
    pub mem: BTreeMap<u32, ManagerStatus>,
}

#[derive(Clone)]
pub struct AgentClient {
    http: reqwest::Client,
}

impl AgentClient {
    pub fn new(connect_timeout: Duration, read_timeout: Duration) -> Self {
        let http = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .timeout(read_timeout)
            .build()
            .expect("reqwest client builder with static config never fails");
        Self { http }
    }

    pub async fn list_vm(&self, node_url: &str) -> SchedulerResult<Vec<String>> {
        self.get_json(&format!("{node_url}/listvm"), &[]).await
    }

    pub async fn status(&self, node_url: &str) -> SchedulerResult<NodeStatus> {
        self.get_json(&format!("{node_url}/status"), &[]).await
    }

    pub async fn deploy(
        &self,
        node_url: &str,
        name: &str,
        cpu: u32,
        mem_gb: f64,
        oc: f64,
        qcow2: Option<&str>,
    ) -> SchedulerResult<ActionResult> {
        let mut query = vec![
            ("name".to_string(), name.to_string()),
            ("cpu".to_string(), cpu.to_string()),
            ("mem".to_string(), mem_gb.to_string()),
            ("oc".to_string(), oc.to_string()),
        ];
        if let Some(q) = qcow2 {
            query.push(("qcow2".to_string(), q.to_string()));
        }
        self.get_json(&format!("{node_url}/deploy"), &query).await
    }

    pub async fn remove(&self, node_url: &str, name: &str) -> SchedulerResult<ActionResult> {
        self.get_json(&format!("{node_url}/remove"), &[("name".to_string(), name.to_string())])
            .await
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, url: &str, query: &[(String, String)]) -> SchedulerResult<T> {
        let resp = self
            .http
            .get(url)
            .query(query)
            .send()
            .await
            .map_err(|e| SchedulerError::NodeUnreachable(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(SchedulerError::NodeUnreachable(format!("{url} returned {}", resp.status())));
        }
        resp.json::<T>().await.map_err(|e| SchedulerError::NodeUnreachable(e.to_string()))
    }
}
