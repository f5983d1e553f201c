//! Agent 注册表
//!
//! 名称 → 连接器；注册信息同步写入状态存储，重启时据此重建连接器。

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use super::{
    AgentConnector, ConnectorSettings, HandlerTable, LocalConnector, RemoteConnector,
    SimulatedConnector,
};
use crate::core::{AgentRegistration, ConnectorKind, OrchestrationError};
use crate::store::{StateStore, StoreError};

pub struct AgentRegistry {
    agents: RwLock<HashMap<String, Arc<dyn AgentConnector>>>,
    store: Arc<StateStore>,
}

impl AgentRegistry {
    pub fn new(store: Arc<StateStore>) -> Self {
        Self {
            agents: RwLock::new(HashMap::new()),
            store,
        }
    }

    /// 注册（同名覆盖）
    pub async fn register(&self, connector: Arc<dyn AgentConnector>) -> Result<(), StoreError> {
        let registration = connector.registration();
        self.agents
            .write()
            .await
            .insert(registration.name.clone(), connector);
        tracing::info!(agent = %registration.name, kind = ?registration.kind, "Agent registered");
        self.store.put_agent(registration).await
    }

    pub async fn unregister(&self, name: &str) -> Result<bool, StoreError> {
        let removed = self.agents.write().await.remove(name).is_some();
        self.store.remove_agent(name).await?;
        if removed {
            tracing::info!(agent = %name, "Agent unregistered");
        }
        Ok(removed)
    }

    pub async fn get(&self, name: &str) -> Option<Arc<dyn AgentConnector>> {
        self.agents.read().await.get(name).cloned()
    }

    /// 查找连接器；未注册返回 `AgentNotFound`
    pub async fn resolve(&self, name: &str) -> Result<Arc<dyn AgentConnector>, OrchestrationError> {
        self.get(name)
            .await
            .ok_or_else(|| OrchestrationError::AgentNotFound(name.to_string()))
    }

    pub async fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.agents.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    pub async fn registrations(&self) -> Vec<AgentRegistration> {
        let mut regs: Vec<_> = self
            .agents
            .read()
            .await
            .values()
            .map(|c| c.registration())
            .collect();
        regs.sort_by(|a, b| a.name.cmp(&b.name));
        regs
    }

    /// 对所有已注册 Agent 做健康检查
    pub async fn health_report(&self) -> Vec<(String, bool)> {
        let connectors: Vec<_> = self.agents.read().await.values().cloned().collect();
        let checks = connectors.iter().map(|c| async move {
            (c.name().to_string(), c.health_check().await)
        });
        let mut report = futures_util::future::join_all(checks).await;
        report.sort_by(|a, b| a.0.cmp(&b.0));
        report
    }

    /// 按状态存储中的注册信息重建连接器；已在内存中注册的名字跳过。返回重建数量
    pub async fn restore_from_store(
        &self,
        handlers: &HandlerTable,
        settings: &ConnectorSettings,
    ) -> usize {
        let mut restored = 0;
        for reg in self.store.agents().await {
            if self.get(&reg.name).await.is_some() {
                continue;
            }
            let connector: Arc<dyn AgentConnector> = match reg.kind {
                ConnectorKind::Local => match handlers.get(&reg.name) {
                    Some(handler) => Arc::new(LocalConnector::new(
                        reg.name.clone(),
                        handler,
                        Arc::clone(&self.store),
                    )),
                    None => {
                        tracing::warn!(agent = %reg.name, "No handler for persisted local agent, skipping");
                        continue;
                    }
                },
                ConnectorKind::Remote => {
                    match RemoteConnector::new(reg.name.clone(), reg.endpoint.clone(), settings.remote_timeout) {
                        Ok(c) => Arc::new(c),
                        Err(e) => {
                            tracing::warn!(agent = %reg.name, error = %e, "Failed to rebuild remote agent");
                            continue;
                        }
                    }
                }
                ConnectorKind::Simulated => Arc::new(SimulatedConnector::new(
                    reg.name.clone(),
                    settings.simulated_delay,
                    Arc::clone(&self.store),
                )),
            };
            self.agents.write().await.insert(reg.name.clone(), connector);
            restored += 1;
        }
        if restored > 0 {
            tracing::info!(restored, "Agents restored from state store");
        }
        restored
    }
}
