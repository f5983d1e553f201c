//! Agent 连接器：引擎与具体 Agent 实现之间的派发抽象
//!
//! 所有派发方式（进程内处理器 / 远程端点 / 模拟）实现 AgentConnector，
//! 由 AgentRegistry 按名注册与查找。

pub mod local;
pub mod registry;
pub mod remote;
pub mod simulated;

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::core::{AgentRegistration, ConnectorKind, OrchestrationError, TaskPacket};

pub use local::{handler_fn, FnHandler, HandlerOutcome, HandlerTable, LocalConnector, TaskHandler};
pub use registry::AgentRegistry;
pub use remote::RemoteConnector;
pub use simulated::SimulatedConnector;

/// 连接器 trait：发送任务、可选轮询结果、健康检查
#[async_trait]
pub trait AgentConnector: Send + Sync {
    /// Agent 名称（注册表的键）
    fn name(&self) -> &str;

    fn endpoint(&self) -> &str;

    fn kind(&self) -> ConnectorKind;

    /// 发送任务；返回 Ok 只代表已受理，完成情况通过状态存储得知
    async fn send(&self, task: &TaskPacket) -> Result<(), OrchestrationError>;

    /// 主动拉取结果；默认不支持，完成由状态存储通知
    async fn poll_result(&self, _task_id: &str) -> Option<Value> {
        None
    }

    async fn health_check(&self) -> bool {
        true
    }

    fn registration(&self) -> AgentRegistration {
        AgentRegistration {
            name: self.name().to_string(),
            endpoint: self.endpoint().to_string(),
            kind: self.kind(),
        }
    }
}

/// 重建连接器时使用的参数
#[derive(Debug, Clone)]
pub struct ConnectorSettings {
    /// 远程派发的 HTTP 超时
    pub remote_timeout: Duration,
    /// 模拟连接器的完成延迟
    pub simulated_delay: Duration,
}

impl Default for ConnectorSettings {
    fn default() -> Self {
        Self {
            remote_timeout: Duration::from_secs(10),
            simulated_delay: Duration::from_secs(2),
        }
    }
}
