//! 进程内连接器
//!
//! 处理器在启动时按名登记到 HandlerTable；LocalConnector 在后台任务里调用处理器，
//! 结束后把结果写回状态存储。

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::AgentConnector;
use crate::core::{ConnectorKind, OrchestrationError, TaskPacket, TaskStatus};
use crate::store::StateStore;

/// 处理器返回值：`{"status": "success", "result": ...}` 或 `{"status": "error", "message": ...}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum HandlerOutcome {
    Success {
        #[serde(default)]
        result: Value,
    },
    Error {
        message: String,
    },
}

impl HandlerOutcome {
    pub fn success(result: Value) -> Self {
        Self::Success { result }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }
}

/// 进程内 Agent 处理器
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, task: &TaskPacket) -> HandlerOutcome;
}

/// 闭包处理器
pub struct FnHandler<F>(F);

/// 把 `Fn(TaskPacket) -> Future<Output = HandlerOutcome>` 包装成处理器
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(TaskPacket) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerOutcome> + Send + 'static,
{
    FnHandler(f)
}

#[async_trait]
impl<F, Fut> TaskHandler for FnHandler<F>
where
    F: Fn(TaskPacket) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerOutcome> + Send + 'static,
{
    async fn handle(&self, task: &TaskPacket) -> HandlerOutcome {
        (self.0)(task.clone()).await
    }
}

/// 处理器登记表：Agent 名 → 处理器，启动时显式构建
#[derive(Default, Clone)]
pub struct HandlerTable {
    handlers: HashMap<String, Arc<dyn TaskHandler>>,
}

impl HandlerTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, agent: impl Into<String>, handler: impl TaskHandler + 'static) {
        self.handlers.insert(agent.into(), Arc::new(handler));
    }

    pub fn get(&self, agent: &str) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.get(agent).cloned()
    }

    pub fn contains(&self, agent: &str) -> bool {
        self.handlers.contains_key(agent)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.handlers.keys().cloned().collect();
        names.sort();
        names
    }
}

/// 进程内连接器
pub struct LocalConnector {
    name: String,
    handler: Arc<dyn TaskHandler>,
    store: Arc<StateStore>,
}

impl LocalConnector {
    pub fn new(name: impl Into<String>, handler: Arc<dyn TaskHandler>, store: Arc<StateStore>) -> Self {
        Self {
            name: name.into(),
            handler,
            store,
        }
    }
}

#[async_trait]
impl AgentConnector for LocalConnector {
    fn name(&self) -> &str {
        &self.name
    }

    fn endpoint(&self) -> &str {
        "local"
    }

    fn kind(&self) -> ConnectorKind {
        ConnectorKind::Local
    }

    async fn send(&self, task: &TaskPacket) -> Result<(), OrchestrationError> {
        tracing::info!(agent = %self.name, task_id = %task.task_id, "Sending task to local handler");

        let handler = Arc::clone(&self.handler);
        let store = Arc::clone(&self.store);
        let agent = self.name.clone();
        let task = task.clone();

        tokio::spawn(async move {
            let task_id = task.task_id.clone();
            // 处理器放进独立任务，panic 只会体现为 JoinError
            let run = tokio::spawn(async move { handler.handle(&task).await });

            let (status, result) = match run.await {
                Ok(HandlerOutcome::Success { result }) => (TaskStatus::Completed, result),
                Ok(HandlerOutcome::Error { message }) => (
                    TaskStatus::Failed,
                    json!({ "error": message, "kind": "handler_error" }),
                ),
                Err(e) => {
                    tracing::error!(agent = %agent, task_id = %task_id, error = %e, "Local handler crashed");
                    (
                        TaskStatus::Failed,
                        json!({ "error": format!("handler crashed: {e}"), "kind": "handler_error" }),
                    )
                }
            };

            if let Err(e) = store.record_outcome(&task_id, status, result).await {
                tracing::warn!(task_id = %task_id, error = %e, "Failed to record handler outcome");
            }
        });

        Ok(())
    }
}
