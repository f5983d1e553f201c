//! 远程连接器：把任务包 POST 到 Agent 的 HTTP 端点
//!
//! 远端受理后自行执行，完成时通过共享状态存储回写结果。

use std::time::Duration;

use async_trait::async_trait;

use super::AgentConnector;
use crate::core::{ConnectorKind, OrchestrationError, TaskPacket};

pub struct RemoteConnector {
    name: String,
    endpoint: String,
    client: reqwest::Client,
}

impl RemoteConnector {
    pub fn new(
        name: impl Into<String>,
        endpoint: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, OrchestrationError> {
        let name = name.into();
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| OrchestrationError::DispatchFailure {
                agent: name.clone(),
                reason: error_chain(&e),
            })?;
        Ok(Self {
            name,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            client,
        })
    }
}

/// 展开 reqwest 的错误链，让 "connection refused" 之类的底层原因出现在文本里
fn error_chain(err: &(dyn std::error::Error + 'static)) -> String {
    let mut text = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        text.push_str(": ");
        text.push_str(&cause.to_string());
        source = cause.source();
    }
    text
}

#[async_trait]
impl AgentConnector for RemoteConnector {
    fn name(&self) -> &str {
        &self.name
    }

    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn kind(&self) -> ConnectorKind {
        ConnectorKind::Remote
    }

    async fn send(&self, task: &TaskPacket) -> Result<(), OrchestrationError> {
        tracing::info!(agent = %self.name, endpoint = %self.endpoint, task_id = %task.task_id, "Sending task to remote agent");

        let response = self
            .client
            .post(&self.endpoint)
            .json(task)
            .send()
            .await
            .map_err(|e| OrchestrationError::DispatchFailure {
                agent: self.name.clone(),
                reason: error_chain(&e),
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(OrchestrationError::DispatchFailure {
                agent: self.name.clone(),
                reason: format!("endpoint answered HTTP {status}"),
            });
        }
        Ok(())
    }

    async fn health_check(&self) -> bool {
        let url = format!("{}/health", self.endpoint);
        match self.client.get(&url).send().await {
            Ok(resp) => resp.status().is_success(),
            Err(e) => {
                tracing::debug!(agent = %self.name, error = %e, "Health check failed");
                false
            }
        }
    }
}
