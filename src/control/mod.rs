//! 人工控制接口：审批、暂停 / 急停 / 安全模式、Agent 启停
//!
//! 全部状态落在共享状态存储里，引擎的 worker 每轮从存储读取开关，
//! 因此任何持有 HumanControl 的调用方都能即时影响调度。不做身份校验。

pub mod handler;
pub mod models;

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;

pub use handler::ControlHandler;
pub use models::{ApprovalRequest, ApprovalStatus, ControlFlags};

use crate::core::TaskPacket;
use crate::store::{StateStore, StoreError};

#[derive(Error, Debug)]
pub enum ControlError {
    #[error("approval request {0} not found")]
    RequestNotFound(String),

    #[error("approval request {request_id} was already {status:?}")]
    AlreadyDecided {
        request_id: String,
        status: ApprovalStatus,
    },

    #[error("cannot resume while safe mode is active")]
    SafeModeActive,

    #[error(transparent)]
    Store(#[from] StoreError),
}

pub struct HumanControl {
    store: Arc<StateStore>,
}

impl HumanControl {
    pub fn new(store: Arc<StateStore>) -> Self {
        Self { store }
    }

    /// 为任务创建一个待审批请求
    pub async fn request_approval(
        &self,
        task: &TaskPacket,
        requester: &str,
    ) -> Result<ApprovalRequest, ControlError> {
        let request = ApprovalRequest::for_task(task, requester);
        self.store.put_approval(request.clone()).await?;
        tracing::info!(
            request_id = %request.request_id,
            task_id = %task.task_id,
            requester,
            "Approval requested"
        );
        Ok(request)
    }

    pub async fn approve(
        &self,
        request_id: &str,
        approver: &str,
        reason: Option<&str>,
    ) -> Result<ApprovalRequest, ControlError> {
        self.decide(request_id, ApprovalStatus::Approved, approver, reason)
            .await
    }

    pub async fn reject(
        &self,
        request_id: &str,
        approver: &str,
        reason: Option<&str>,
    ) -> Result<ApprovalRequest, ControlError> {
        self.decide(request_id, ApprovalStatus::Rejected, approver, reason)
            .await
    }

    async fn decide(
        &self,
        request_id: &str,
        decision: ApprovalStatus,
        approver: &str,
        reason: Option<&str>,
    ) -> Result<ApprovalRequest, ControlError> {
        let outcome = self
            .store
            .update_approval(request_id, |req| {
                if !req.is_pending() {
                    return Err(ControlError::AlreadyDecided {
                        request_id: req.request_id.clone(),
                        status: req.status,
                    });
                }
                req.status = decision;
                req.approver = Some(approver.to_string());
                req.reason = reason.map(str::to_string);
                req.decided_at = Some(Utc::now());
                Ok(req.clone())
            })
            .await?
            .ok_or_else(|| ControlError::RequestNotFound(request_id.to_string()))?;

        let request = outcome?;
        tracing::info!(
            request_id,
            task_id = %request.task_id,
            decision = ?decision,
            approver,
            "Approval decided"
        );
        Ok(request)
    }

    pub async fn list_pending(&self) -> Vec<ApprovalRequest> {
        self.store
            .approvals()
            .await
            .into_iter()
            .filter(ApprovalRequest::is_pending)
            .collect()
    }

    pub async fn approval_for_task(&self, task_id: &str) -> Option<ApprovalRequest> {
        self.store.approval_for_task(task_id).await
    }

    /// 暂停 / 恢复调度；安全模式下拒绝恢复
    pub async fn set_paused(&self, paused: bool) -> Result<ControlFlags, ControlError> {
        let flags = self
            .store
            .update_controls(|c| {
                if !paused && c.safe_mode {
                    return Err(ControlError::SafeModeActive);
                }
                c.paused = paused;
                Ok(*c)
            })
            .await??;
        tracing::info!(paused, "Pause flag changed");
        Ok(flags)
    }

    pub async fn set_emergency_stop(&self, active: bool) -> Result<ControlFlags, ControlError> {
        let flags = self
            .store
            .update_controls(|c| {
                c.emergency_stop = active;
                *c
            })
            .await?;
        if active {
            tracing::warn!("Emergency stop activated");
        } else {
            tracing::info!("Emergency stop cleared");
        }
        Ok(flags)
    }

    /// 安全模式：开启时同时暂停，关闭时同时恢复，一次写入完成
    pub async fn set_safe_mode(&self, active: bool) -> Result<ControlFlags, ControlError> {
        let flags = self
            .store
            .update_controls(|c| {
                c.safe_mode = active;
                c.paused = active;
                *c
            })
            .await?;
        tracing::warn!(active, "Safe mode changed");
        Ok(flags)
    }

    pub async fn get_controls(&self) -> ControlFlags {
        self.store.controls().await
    }

    pub async fn toggle_agent(&self, agent: &str, enabled: bool) -> Result<(), ControlError> {
        self.store.set_toggle(agent, enabled).await?;
        tracing::info!(agent, enabled, "Agent toggled");
        Ok(())
    }

    pub async fn get_toggles(&self) -> HashMap<String, bool> {
        self.store.toggles().await
    }

    pub async fn is_agent_enabled(&self, agent: &str) -> bool {
        self.store.is_agent_enabled(agent).await
    }
}
