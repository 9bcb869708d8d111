use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProcessId(pub String);

impl ProcessId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ProcessId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ProcessId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ProcessId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Lifecycle state reported by the supervised process itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessState {
    Uninitialised,
    Starting,
    Started,
    Running,
    Restarting,
    Stopping,
    Stopped,
    Errored,
    Failed,
    Paused,
}

/// State of the daemon's RPC link to a supervised process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryUsage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heap_total: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heap_used: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resident_size: Option<u64>,
}

/// Status payload pushed by a supervised process.
///
/// Every field is optional: a report only carries what changed. Keys the daemon
/// does not know about end up in `unknown` and are rejected by
/// [`ProcessStatus::reconcile`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub script: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<ProcessState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gid: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uptime: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<MemoryUsage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restarts: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub debug_port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster: Option<bool>,
    #[serde(flatten)]
    pub unknown: BTreeMap<String, serde_json::Value>,
}

/// Attributes accumulated from every [`StatusReport`] seen so far.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessStatus {
    pub name: Option<String>,
    pub script: Option<String>,
    pub status: Option<ProcessState>,
    pub pid: Option<u32>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub user: Option<String>,
    pub group: Option<String>,
    pub uptime: Option<f64>,
    pub cpu: Option<f64>,
    pub memory: Option<MemoryUsage>,
    pub restarts: Option<u32>,
    pub debug_port: Option<u16>,
    pub cluster: Option<bool>,
}

impl ProcessStatus {
    /// Merges the fields present in `report` and returns the keys that were
    /// rejected because they are not part of the status shape.
    pub fn reconcile(&mut self, report: StatusReport) -> Vec<String> {
        fn merge<T>(slot: &mut Option<T>, value: Option<T>) {
            if let Some(v) = value {
                *slot = Some(v);
            }
        }

        merge(&mut self.name, report.name);
        merge(&mut self.script, report.script);
        merge(&mut self.status, report.status);
        merge(&mut self.pid, report.pid);
        merge(&mut self.uid, report.uid);
        merge(&mut self.gid, report.gid);
        merge(&mut self.user, report.user);
        merge(&mut self.group, report.group);
        merge(&mut self.uptime, report.uptime);
        merge(&mut self.cpu, report.cpu);
        merge(&mut self.memory, report.memory);
        merge(&mut self.restarts, report.restarts);
        merge(&mut self.debug_port, report.debug_port);
        merge(&mut self.cluster, report.cluster);

        report.unknown.into_keys().collect()
    }

    pub fn is_cluster(&self) -> bool {
        self.cluster.unwrap_or(false)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerInfo {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<ProcessState>,
}

/// Worker membership of a cluster process. Ids are unique.
#[derive(Debug, Clone, Default)]
pub struct WorkerRoster {
    workers: Vec<WorkerInfo>,
}

impl WorkerRoster {
    /// Adds `worker` unless one with the same id is already present.
    /// Returns whether the roster changed.
    pub fn add(&mut self, worker: WorkerInfo) -> bool {
        if self.workers.iter().any(|w| w.id == worker.id) {
            return false;
        }
        self.workers.push(worker);
        true
    }

    pub fn remove(&mut self, id: &str) -> Option<WorkerInfo> {
        let idx = self.workers.iter().position(|w| w.id == id)?;
        Some(self.workers.remove(idx))
    }

    pub fn workers(&self) -> &[WorkerInfo] {
        &self.workers
    }
}

/// Point-in-time view of a supervised process as the daemon sees it.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessInfo {
    pub id: ProcessId,
    pub endpoint: String,
    pub connection: ConnectionState,
    pub cluster: bool,
    pub reported: ProcessStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workers: Option<Vec<WorkerInfo>>,
}
