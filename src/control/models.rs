//! 人工控制相关数据结构：审批请求、全局控制开关

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::TaskPacket;

/// 审批状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
}

/// 审批请求：每个高风险任务最多对应一个
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub request_id: String,
    pub task_id: String,
    pub requester: String,
    pub status: ApprovalStatus,
    pub requested_at: DateTime<Utc>,
    /// 请求时刻的任务快照
    #[serde(default)]
    pub details: Value,
    #[serde(default)]
    pub approver: Option<String>,
    #[serde(default)]
    pub decided_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub reason: Option<String>,
}

impl ApprovalRequest {
    pub fn for_task(task: &TaskPacket, requester: impl Into<String>) -> Self {
        Self {
            request_id: uuid::Uuid::new_v4().to_string(),
            task_id: task.task_id.clone(),
            requester: requester.into(),
            status: ApprovalStatus::Pending,
            requested_at: Utc::now(),
            details: serde_json::to_value(task).unwrap_or(Value::Null),
            approver: None,
            decided_at: None,
            reason: None,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.status == ApprovalStatus::Pending
    }
}

/// 全局控制开关（持久化，重启后保留）
///
/// 不变量：`safe_mode` 为 true 时 `paused` 必为 true。
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlFlags {
    #[serde(default)]
    pub paused: bool,
    #[serde(default)]
    pub emergency_stop: bool,
    #[serde(default)]
    pub safe_mode: bool,
}
