//! 任务包（Task Packet）：调度的基本单元及其生命周期状态
//!
//! 任务只会迁移状态、永不删除：Pending → Running → Completed / Failed；
//! Failed 可在重试预算内或由自愈扫描重新打开为 Pending。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::OrchestrationError;

/// 任务 ID
pub type TaskId = String;

/// 任务状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    /// 等待执行（含等待审批、等待重试）
    Pending,
    /// 已派发，等待完成
    Running,
    /// 已完成
    Completed,
    /// 执行失败
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// 任务类型；Modification / Deployment 属于高风险，需要人工审批
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskKind {
    Analysis,
    Modification,
    Verification,
    Deployment,
}

impl TaskKind {
    /// 派发前是否必须经过人工审批
    pub fn requires_approval(self) -> bool {
        matches!(self, Self::Modification | Self::Deployment)
    }

    /// 提交前是否必须先做安全备份
    pub fn mutates_project(self) -> bool {
        matches!(self, Self::Modification)
    }
}

fn default_max_retries() -> u32 {
    3
}

/// 任务包
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskPacket {
    /// 任务 ID（生成后不可变）
    pub task_id: TaskId,
    /// 目标 Agent 名称
    pub agent: String,
    /// 模块 / 分类标签
    pub module: String,
    pub kind: TaskKind,
    /// 任意结构化负载；Modification 任务需含 `project_path`
    #[serde(default)]
    pub payload: Value,
    /// 优先级（仅作参考，队列严格 FIFO）
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub dependencies: Vec<TaskId>,
    #[serde(default)]
    pub constraints: Vec<String>,
    #[serde(default)]
    pub business_rules: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    /// 关联的安全备份；重试时复用，不会重复备份
    #[serde(default)]
    pub backup_id: Option<String>,
    pub status: TaskStatus,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub retries: u32,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    pub created_at: DateTime<Utc>,
}

impl TaskPacket {
    pub fn new(agent: impl Into<String>, module: impl Into<String>, kind: TaskKind) -> Self {
        Self {
            task_id: uuid::Uuid::new_v4().to_string(),
            agent: agent.into(),
            module: module.into(),
            kind,
            payload: Value::Object(Default::default()),
            priority: 0,
            dependencies: Vec::new(),
            constraints: Vec::new(),
            business_rules: Vec::new(),
            tags: Vec::new(),
            backup_id: None,
            status: TaskStatus::Pending,
            result: None,
            retries: 0,
            max_retries: default_max_retries(),
            created_at: Utc::now(),
        }
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_backup(mut self, backup_id: impl Into<String>) -> Self {
        self.backup_id = Some(backup_id.into());
        self
    }

    /// payload 中的 `project_path`（安全备份的目标目录）
    pub fn project_path(&self) -> Option<&str> {
        self.payload
            .get("project_path")
            .and_then(Value::as_str)
            .filter(|p| !p.is_empty())
    }

    /// 失败时记录的错误文本
    pub fn error_message(&self) -> Option<&str> {
        self.result
            .as_ref()
            .and_then(|r| r.get("error"))
            .and_then(Value::as_str)
    }

    /// 标记为终态失败，并把错误写入 result
    pub fn fail_with(&mut self, err: &OrchestrationError) {
        self.status = TaskStatus::Failed;
        self.result = Some(serde_json::json!({
            "error": err.to_string(),
            "kind": err.kind(),
        }));
    }

    pub fn is_finished(&self) -> bool {
        self.status.is_terminal()
    }
}

/// 连接器类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectorKind {
    /// 进程内处理器
    Local,
    /// 进程外端点（HTTP）
    Remote,
    /// 固定延迟后完成，用于测试和演示
    Simulated,
}

/// Agent 注册信息；镜像到状态存储，用于重启恢复
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentRegistration {
    pub name: String,
    pub endpoint: String,
    pub kind: ConnectorKind,
}
