//! 模拟连接器：固定延迟后把任务标记为完成

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use super::AgentConnector;
use crate::core::{ConnectorKind, OrchestrationError, TaskPacket, TaskStatus};
use crate::store::StateStore;

pub struct SimulatedConnector {
    name: String,
    delay: Duration,
    store: Arc<StateStore>,
}

impl SimulatedConnector {
    pub fn new(name: impl Into<String>, delay: Duration, store: Arc<StateStore>) -> Self {
        Self {
            name: name.into(),
            delay,
            store,
        }
    }
}

#[async_trait]
impl AgentConnector for SimulatedConnector {
    fn name(&self) -> &str {
        &self.name
    }

    fn endpoint(&self) -> &str {
        "simulated"
    }

    fn kind(&self) -> ConnectorKind {
        ConnectorKind::Simulated
    }

    async fn send(&self, task: &TaskPacket) -> Result<(), OrchestrationError> {
        tracing::info!(agent = %self.name, task_id = %task.task_id, delay_ms = self.delay.as_millis() as u64, "Simulating task");

        let store = Arc::clone(&self.store);
        let agent = self.name.clone();
        let task_id = task.task_id.clone();
        let delay = self.delay;

        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let result = json!({
                "message": format!("Task {task_id} completed by simulated agent {agent}"),
                "task_id": task_id,
                "agent": agent,
            });
            if let Err(e) = store
                .record_outcome(&task_id, TaskStatus::Completed, result)
                .await
            {
                tracing::warn!(task_id = %task_id, error = %e, "Failed to record simulated outcome");
            }
        });
        Ok(())
    }
}
