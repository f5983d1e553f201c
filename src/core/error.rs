//! 编排错误分类
//!
//! 结构性 / 策略性错误（缺字段、审批拒绝、Agent 不存在、备份失败）立即终止且不重试；
//! 瞬态基础设施错误（发送失败、超时、Agent 被停用）走重试预算。

use thiserror::Error;

use crate::control::ControlError;
use crate::store::StoreError;

/// 编排过程中可能出现的错误
#[derive(Error, Debug)]
pub enum OrchestrationError {
    /// 安全规则所需字段缺失（如 Modification 任务缺少 project_path）
    #[error("policy violation: {0}")]
    PolicyViolation(String),

    #[error("task {task_id} was rejected by human approval")]
    ApprovalRejected { task_id: String },

    #[error("agent {0} is disabled")]
    AgentDisabled(String),

    #[error("agent {0} not found")]
    AgentNotFound(String),

    #[error("failed to send task to agent {agent}: {reason}")]
    DispatchFailure { agent: String, reason: String },

    #[error("task timed out after {secs}s")]
    Timeout { secs: u64 },

    /// 提交阶段的安全备份失败；任务不会进入队列
    #[error("backup failed: {0}")]
    BackupFailure(String),

    #[error("state store error: {0}")]
    Store(#[from] StoreError),

    #[error("control error: {0}")]
    Control(#[from] ControlError),
}

impl OrchestrationError {
    /// 机器可读的错误类型，写入失败任务的 result.kind
    pub fn kind(&self) -> &'static str {
        match self {
            Self::PolicyViolation(_) => "policy_violation",
            Self::ApprovalRejected { .. } => "approval_rejected",
            Self::AgentDisabled(_) => "agent_disabled",
            Self::AgentNotFound(_) => "agent_not_found",
            Self::DispatchFailure { .. } => "dispatch_failure",
            Self::Timeout { .. } => "timeout",
            Self::BackupFailure(_) => "backup_failure",
            Self::Store(_) => "store",
            Self::Control(_) => "control",
        }
    }

    /// 是否进入重试预算；其余错误直接判为终态失败
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::AgentDisabled(_) | Self::DispatchFailure { .. } | Self::Timeout { .. }
        )
    }
}
