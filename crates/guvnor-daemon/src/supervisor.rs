use std::{collections::BTreeMap, sync::Arc};

use guvnor_deploy::DeploymentEngine;
use guvnor_process::{ProcessId, ProcessInfo};
use guvnor_rpc::ChannelFactory;
use tokio::sync::RwLock;

use crate::error::SupervisorError;
use crate::host::{HostInfo, ServerDetails, ServerStatus};
use crate::proxy::ProcessProxy;
use crate::timeout::TimeoutPolicy;

/// Directory of supervised processes plus the deployment engine.
pub struct Supervisor {
    processes: RwLock<BTreeMap<ProcessId, ProcessProxy>>,
    factory: Arc<dyn ChannelFactory>,
    policy: TimeoutPolicy,
    engine: Arc<DeploymentEngine>,
    host: HostInfo,
}

impl Supervisor {
    pub fn new(factory: Arc<dyn ChannelFactory>, policy: TimeoutPolicy, engine: Arc<DeploymentEngine>) -> Self {
        Self {
            processes: RwLock::new(BTreeMap::new()),
            factory,
            policy,
            engine,
            host: HostInfo::default(),
        }
    }

    pub fn engine(&self) -> &Arc<DeploymentEngine> {
        &self.engine
    }

    /// Registers a process reachable at `endpoint`. The proxy does not connect
    /// until it is first used.
    pub async fn register(
        &self,
        id: ProcessId,
        endpoint: &str,
        cluster: bool,
    ) -> Result<ProcessProxy, SupervisorError> {
        let mut processes = self.processes.write().await;
        if processes.contains_key(&id) {
            return Err(SupervisorError::Duplicate(id));
        }
        let proxy = ProcessProxy::new(id.clone(), endpoint, cluster, self.factory.clone(), self.policy);
        processes.insert(id.clone(), proxy.clone());
        tracing::info!(process = %id, %endpoint, cluster, "process registered");
        Ok(proxy)
    }

    pub async fn remove(&self, id: &ProcessId) -> Result<(), SupervisorError> {
        let proxy = self
            .processes
            .write()
            .await
            .remove(id)
            .ok_or_else(|| SupervisorError::NotFound(id.clone()))?;
        proxy.disconnect().await;
        tracing::info!(process = %id, "process removed");
        Ok(())
    }

    pub async fn find(&self, id: &ProcessId) -> Result<ProcessProxy, SupervisorError> {
        self.processes
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| SupervisorError::NotFound(id.clone()))
    }

    pub async fn find_process_info(&self, id: &ProcessId) -> Result<ProcessInfo, SupervisorError> {
        self.find(id).await.map(|p| p.info())
    }

    pub async fn list_processes(&self) -> Vec<ProcessInfo> {
        self.processes.read().await.values().map(ProcessProxy::info).collect()
    }

    pub fn server_status(&self) -> ServerStatus {
        self.host.status()
    }

    pub fn server_details(&self) -> ServerDetails {
        self.host.details()
    }

    /// Disconnects every process, leaving them registered.
    pub async fn shutdown(&self) {
        let proxies: Vec<ProcessProxy> = self.processes.read().await.values().cloned().collect();
        for proxy in proxies {
            proxy.disconnect().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use guvnor_deploy::MemoryVcs;
    use guvnor_process::ConnectionState;
    use guvnor_rpc::WsChannelFactory;

    use super::*;

    async fn supervisor(root: &std::path::Path) -> Supervisor {
        let engine = DeploymentEngine::open(root.join("apps"), Arc::new(MemoryVcs::new()))
            .await
            .unwrap();
        Supervisor::new(
            Arc::new(WsChannelFactory::default()),
            TimeoutPolicy::new(Duration::from_secs(1)),
            Arc::new(engine),
        )
    }

    #[tokio::test]
    async fn register_find_and_remove() {
        let root = tempfile::tempdir().unwrap();
        let sup = supervisor(root.path()).await;
        let id = ProcessId::from("web-1");

        let proxy = sup.register(id.clone(), "ws://127.0.0.1:1", true).await.unwrap();
        assert_eq!(proxy.connection(), ConnectionState::Disconnected);
        assert_eq!(
            sup.register(id.clone(), "ws://127.0.0.1:2", false).await.unwrap_err(),
            SupervisorError::Duplicate(id.clone())
        );

        let info = sup.find_process_info(&id).await.unwrap();
        assert_eq!(info.endpoint, "ws://127.0.0.1:1");
        assert!(info.cluster);
        assert_eq!(sup.list_processes().await.len(), 1);

        sup.remove(&id).await.unwrap();
        assert_eq!(sup.remove(&id).await.unwrap_err(), SupervisorError::NotFound(id.clone()));
        assert!(sup.find(&id).await.is_err());
    }

    #[tokio::test]
    async fn remove_does_not_wait_for_a_silent_process() {
        let root = tempfile::tempdir().unwrap();
        let sup = supervisor(root.path()).await;
        // Accepts TCP but never answers the WebSocket handshake.
        let silent = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = format!("ws://{}", silent.local_addr().unwrap());
        let id = ProcessId::from("mute-1");

        let proxy = sup.register(id.clone(), &endpoint, false).await.unwrap();
        let pending = proxy.kill(vec![]);
        assert_eq!(proxy.connection(), ConnectionState::Connecting);

        tokio::time::timeout(Duration::from_secs(2), sup.remove(&id))
            .await
            .expect("remove must return while the handshake hangs")
            .unwrap();
        assert!(pending.await.is_err());
        assert!(sup.list_processes().await.is_empty());
    }
}
