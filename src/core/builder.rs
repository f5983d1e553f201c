//! 编排器构建：把状态存储、备份、人工控制、注册表、引擎、自愈管理装配成一个服务对象
//!
//! 所有组件都通过 Arc 显式传递，不存在全局单例；进程内 Agent 的处理器在这里登记到 HandlerTable。

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::{EngineConfig, OrchestrationEngine, OrchestrationError, TaskPacket};
use crate::backup::{BackupError, BackupManager};
use crate::config::{AgentSection, AppConfig};
use crate::connector::{
    AgentConnector, AgentRegistry, HandlerTable, LocalConnector, RemoteConnector,
    SimulatedConnector, TaskHandler,
};
use crate::control::handler::HUMAN_CONTROL_AGENT;
use crate::control::{ControlHandler, HumanControl};
use crate::core::ConnectorKind;
use crate::resilience::handler::SYSTEM_RESILIENCE_AGENT;
use crate::resilience::{ResilienceError, ResilienceHandler, ResilienceManager};
use crate::store::{StateStore, StoreError};

#[derive(Error, Debug)]
pub enum BuildError {
    #[error("failed to open state store: {0}")]
    Store(#[from] StoreError),

    #[error("failed to prepare backup directory: {0}")]
    Backup(#[from] BackupError),

    #[error("failed to set up resilience manager: {0}")]
    Resilience(#[from] ResilienceError),

    #[error("agent {name} is misconfigured: {reason}")]
    InvalidAgent { name: String, reason: String },

    #[error(transparent)]
    Orchestration(#[from] OrchestrationError),
}

/// 编排器构建器
pub struct OrchestratorBuilder {
    config: AppConfig,
    in_memory: bool,
    builtin_agents: bool,
    engine_config: Option<EngineConfig>,
    handlers: HandlerTable,
    connectors: Vec<Arc<dyn AgentConnector>>,
}

impl OrchestratorBuilder {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config,
            in_memory: false,
            builtin_agents: true,
            engine_config: None,
            handlers: HandlerTable::new(),
            connectors: Vec::new(),
        }
    }

    /// 不落盘（状态目录配置被忽略，备份目录仍然使用）
    pub fn in_memory(mut self, in_memory: bool) -> Self {
        self.in_memory = in_memory;
        self
    }

    /// 是否注册内置的 HumanControl / SystemResilience Agent
    pub fn with_builtin_agents(mut self, enable: bool) -> Self {
        self.builtin_agents = enable;
        self
    }

    /// 覆盖 [engine] 段换算出的引擎参数
    pub fn with_engine_config(mut self, engine_config: EngineConfig) -> Self {
        self.engine_config = Some(engine_config);
        self
    }

    /// 登记进程内 Agent
    pub fn with_handler(mut self, agent: impl Into<String>, handler: impl TaskHandler + 'static) -> Self {
        self.handlers.register(agent, handler);
        self
    }

    /// 直接注册一个连接器
    pub fn with_connector(mut self, connector: Arc<dyn AgentConnector>) -> Self {
        self.connectors.push(connector);
        self
    }

    pub async fn build(self) -> Result<Orchestrator, BuildError> {
        let store = if self.in_memory {
            Arc::new(StateStore::in_memory())
        } else {
            Arc::new(StateStore::open(&self.config.storage.state_dir)?)
        };
        let backups = Arc::new(BackupManager::new(
            &self.config.storage.backup_dir,
            Arc::clone(&store),
        )?);
        let control = Arc::new(HumanControl::new(Arc::clone(&store)));
        let registry = Arc::new(AgentRegistry::new(Arc::clone(&store)));

        let engine_config = self
            .engine_config
            .unwrap_or_else(|| self.config.engine.to_engine_config());
        let engine = Arc::new(OrchestrationEngine::new(
            engine_config,
            Arc::clone(&store),
            Arc::clone(&registry),
            Arc::clone(&backups),
            Arc::clone(&control),
        ));
        let resilience = Arc::new(ResilienceManager::new(
            self.config.resilience.to_resilience_config(),
            Arc::clone(&store),
            Arc::clone(&engine),
            Arc::clone(&control),
        )?);

        let mut handlers = self.handlers;
        if self.builtin_agents {
            handlers.register(
                HUMAN_CONTROL_AGENT,
                ControlHandler::new(
                    Arc::clone(&control),
                    Arc::clone(&backups),
                    Arc::downgrade(&engine),
                ),
            );
            handlers.register(
                SYSTEM_RESILIENCE_AGENT,
                ResilienceHandler::new(Arc::downgrade(&resilience)),
            );
        }

        for name in handlers.names() {
            if let Some(handler) = handlers.get(&name) {
                registry
                    .register(Arc::new(LocalConnector::new(name, handler, Arc::clone(&store))))
                    .await?;
            }
        }
        for connector in self.connectors {
            registry.register(connector).await?;
        }

        let settings = self.config.connectors.settings();
        for agent in &self.config.agents {
            let connector: Arc<dyn AgentConnector> = match agent.kind {
                ConnectorKind::Local => {
                    if !handlers.contains(&agent.name) {
                        return Err(invalid(agent, "no in-process handler with this name"));
                    }
                    continue;
                }
                ConnectorKind::Remote => {
                    let endpoint = agent
                        .endpoint
                        .as_deref()
                        .ok_or_else(|| invalid(agent, "remote agent needs an endpoint"))?;
                    Arc::new(RemoteConnector::new(
                        agent.name.clone(),
                        endpoint,
                        settings.remote_timeout,
                    )?)
                }
                ConnectorKind::Simulated => Arc::new(SimulatedConnector::new(
                    agent.name.clone(),
                    agent
                        .delay_ms
                        .map(Duration::from_millis)
                        .unwrap_or(settings.simulated_delay),
                    Arc::clone(&store),
                )),
            };
            registry.register(connector).await?;
        }

        registry.restore_from_store(&handlers, &settings).await;

        tracing::info!(agents = ?registry.names().await, "Orchestrator built");

        Ok(Orchestrator {
            config: self.config,
            store,
            backups,
            control,
            registry,
            engine,
            resilience,
        })
    }
}

fn invalid(agent: &AgentSection, reason: &str) -> BuildError {
    BuildError::InvalidAgent {
        name: agent.name.clone(),
        reason: reason.to_string(),
    }
}

/// 装配完成的编排服务
pub struct Orchestrator {
    config: AppConfig,
    store: Arc<StateStore>,
    backups: Arc<BackupManager>,
    control: Arc<HumanControl>,
    registry: Arc<AgentRegistry>,
    engine: Arc<OrchestrationEngine>,
    resilience: Arc<ResilienceManager>,
}

impl Orchestrator {
    /// 启动 worker 池（按配置先把上次未完成的任务重新入队）
    pub async fn start(&self) -> Result<(), OrchestrationError> {
        if self.config.engine.requeue_on_start {
            self.engine.requeue_unfinished().await?;
        }
        self.engine.start().await;
        Ok(())
    }

    pub async fn stop(&self) {
        self.engine.stop().await;
    }

    pub async fn submit(&self, task: TaskPacket) -> Result<TaskPacket, OrchestrationError> {
        self.engine.submit(task).await
    }

    /// 按 [resilience] 段的间隔启动周期扫描；未配置时返回 None
    pub fn spawn_resilience_sweep(&self, cancel: CancellationToken) -> Option<JoinHandle<()>> {
        let interval = self.config.resilience.sweep_interval()?;
        tracing::info!(interval_secs = interval.as_secs(), "Periodic resilience sweep enabled");
        Some(self.resilience.spawn_periodic_sweep(interval, cancel))
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<StateStore> {
        &self.store
    }

    pub fn backups(&self) -> &Arc<BackupManager> {
        &self.backups
    }

    pub fn control(&self) -> &Arc<HumanControl> {
        &self.control
    }

    pub fn registry(&self) -> &Arc<AgentRegistry> {
        &self.registry
    }

    pub fn engine(&self) -> &Arc<OrchestrationEngine> {
        &self.engine
    }

    pub fn resilience(&self) -> &Arc<ResilienceManager> {
        &self.resilience
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(dir: &std::path::Path) -> AppConfig {
        let mut config = AppConfig::default();
        config.storage.state_dir = dir.join("state");
        config.storage.backup_dir = dir.join("backups");
        config
    }

    #[tokio::test]
    async fn test_builtin_and_configured_agents() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(dir.path());
        config.agents.push(AgentSection {
            name: "Analyzer".into(),
            kind: ConnectorKind::Simulated,
            endpoint: None,
            delay_ms: Some(5),
        });

        let orchestrator = OrchestratorBuilder::new(config).build().await.unwrap();
        assert_eq!(
            orchestrator.registry().names().await,
            vec![
                "Analyzer".to_string(),
                HUMAN_CONTROL_AGENT.to_string(),
                SYSTEM_RESILIENCE_AGENT.to_string(),
            ]
        );
        assert!(dir.path().join("state/agents.json").exists());
    }

    #[tokio::test]
    async fn test_remote_without_endpoint_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(dir.path());
        config.agents.push(AgentSection {
            name: "Builder".into(),
            kind: ConnectorKind::Remote,
            endpoint: None,
            delay_ms: None,
        });

        let err = OrchestratorBuilder::new(config)
            .in_memory(true)
            .build()
            .await
            .err()
            .unwrap();
        assert!(matches!(err, BuildError::InvalidAgent { .. }));
    }
}
