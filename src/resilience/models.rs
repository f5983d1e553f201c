//! 自愈动作与扫描报告

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// 自愈动作类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResilienceActionKind {
    RestartAgent,
    RecoverTask,
    TriggerSafeMode,
    RetryFailedTasks,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActionStatus {
    Pending,
    Completed,
    Failed,
}

/// 自愈动作（只追加的审计记录）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResilienceAction {
    pub action_id: String,
    pub timestamp: DateTime<Utc>,
    pub kind: ResilienceActionKind,
    /// Agent 名称或任务 ID
    pub target: String,
    pub reason: String,
    pub status: ActionStatus,
    #[serde(default)]
    pub details: Value,
}

impl ResilienceAction {
    pub fn new(
        kind: ResilienceActionKind,
        target: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            action_id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            kind,
            target: target.into(),
            reason: reason.into(),
            status: ActionStatus::Pending,
            details: Value::Null,
        }
    }

    pub fn with_status(mut self, status: ActionStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = details;
        self
    }
}

/// 系统健康度
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SystemStatus {
    Nominal,
    Degraded,
    Critical,
}

/// 一次 detect_and_fix 扫描的结果
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResilienceReport {
    pub report_id: String,
    pub timestamp: DateTime<Utc>,
    pub failing_patterns: Vec<String>,
    pub actions_taken: Vec<ResilienceAction>,
    pub recovered_tasks: usize,
    pub system_status: SystemStatus,
    pub safe_mode_active: bool,
}
