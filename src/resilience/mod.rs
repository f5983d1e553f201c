//! 自愈管理：扫描失败任务、识别不稳定 Agent、必要时进入安全模式
//!
//! 引擎本地重试耗尽之后的第二道恢复：只针对超时 / 连接类瞬态错误，
//! 把任务重置（retries 归零）后重新提交。所有动作追加到状态存储的审计日志。

pub mod handler;
pub mod models;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use regex::Regex;
use serde_json::json;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub use handler::ResilienceHandler;
pub use models::{
    ActionStatus, ResilienceAction, ResilienceActionKind, ResilienceReport, SystemStatus,
};

use crate::control::{ControlError, ControlFlags, HumanControl};
use crate::core::{OrchestrationEngine, TaskStatus};
use crate::store::{StateStore, StoreError};

/// 默认瞬态错误匹配规则（不区分大小写）
pub const DEFAULT_TRANSIENT_PATTERN: &str = r"(?i)timeout|timed out|connection refused|failed to send";

#[derive(Error, Debug)]
pub enum ResilienceError {
    #[error("invalid transient error pattern: {0}")]
    Pattern(#[from] regex::Error),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Control(#[from] ControlError),
}

#[derive(Debug, Clone)]
pub struct ResilienceConfig {
    /// 失败数超过该值的 Agent 视为不稳定
    pub agent_failure_threshold: usize,
    /// 不稳定模式数超过该值时进入安全模式
    pub safe_mode_pattern_threshold: usize,
    pub transient_pattern: String,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            agent_failure_threshold: 5,
            safe_mode_pattern_threshold: 2,
            transient_pattern: DEFAULT_TRANSIENT_PATTERN.to_string(),
        }
    }
}

pub struct ResilienceManager {
    config: ResilienceConfig,
    transient: Regex,
    store: Arc<StateStore>,
    engine: Arc<OrchestrationEngine>,
    control: Arc<HumanControl>,
}

impl ResilienceManager {
    pub fn new(
        config: ResilienceConfig,
        store: Arc<StateStore>,
        engine: Arc<OrchestrationEngine>,
        control: Arc<HumanControl>,
    ) -> Result<Self, ResilienceError> {
        let transient = Regex::new(&config.transient_pattern)?;
        Ok(Self {
            config,
            transient,
            store,
            engine,
            control,
        })
    }

    /// 错误文本是否属于可恢复的瞬态错误
    pub fn is_transient(&self, error: &str) -> bool {
        self.transient.is_match(error)
    }

    /// 一次完整扫描：恢复瞬态失败 → 统计 Agent 失败 → 视情况进入安全模式
    pub async fn detect_and_fix(&self) -> Result<ResilienceReport, ResilienceError> {
        // 统计与恢复都基于扫描开始时的快照
        let failed = self.store.tasks_with_status(TaskStatus::Failed).await;
        let mut actions = Vec::new();
        let mut failing_patterns = Vec::new();
        let mut recovered_tasks = 0;

        for task in &failed {
            let error = task.error_message().unwrap_or_default();
            if !self.is_transient(error) {
                continue;
            }

            let action = ResilienceAction::new(
                ResilienceActionKind::RecoverTask,
                task.task_id.clone(),
                format!(
                    "Attempting recovery for task {} due to transient error: {error}",
                    task.task_id
                ),
            );

            let mut retry = task.clone();
            retry.status = TaskStatus::Pending;
            retry.retries = 0;
            retry.result = None;

            let action = match self.engine.submit(retry).await {
                Ok(_) => {
                    recovered_tasks += 1;
                    tracing::info!(task_id = %task.task_id, "Task recovery initiated");
                    action.with_status(ActionStatus::Completed)
                }
                Err(e) => {
                    tracing::error!(task_id = %task.task_id, error = %e, "Task recovery failed");
                    action
                        .with_status(ActionStatus::Failed)
                        .with_details(json!({ "error": e.to_string() }))
                }
            };
            self.store.append_action(action.clone()).await?;
            actions.push(action);
        }

        let mut per_agent: BTreeMap<&str, usize> = BTreeMap::new();
        for task in &failed {
            *per_agent.entry(task.agent.as_str()).or_default() += 1;
        }

        for (agent, count) in per_agent {
            if count <= self.config.agent_failure_threshold {
                continue;
            }
            failing_patterns.push(format!(
                "Agent '{agent}' has high failure rate ({count} failures)"
            ));
            tracing::warn!(agent, failures = count, "Restarting unstable agent");
            let action = ResilienceAction::new(
                ResilienceActionKind::RestartAgent,
                agent,
                format!("Agent {agent} exceeding failure threshold"),
            )
            .with_status(ActionStatus::Completed)
            .with_details(json!({ "failures": count }));
            self.store.append_action(action.clone()).await?;
            actions.push(action);
        }

        let mut safe_mode_active = self.store.controls().await.safe_mode;
        if failing_patterns.len() > self.config.safe_mode_pattern_threshold && !safe_mode_active {
            self.set_safe_mode(true).await?;
            let action = ResilienceAction::new(
                ResilienceActionKind::TriggerSafeMode,
                "system",
                "Multiple agent failures detected, activating safe mode",
            )
            .with_status(ActionStatus::Completed)
            .with_details(json!({ "patterns": failing_patterns.len() }));
            self.store.append_action(action.clone()).await?;
            actions.push(action);
            safe_mode_active = true;
        }

        let system_status = if safe_mode_active {
            SystemStatus::Critical
        } else if !actions.is_empty() {
            SystemStatus::Degraded
        } else {
            SystemStatus::Nominal
        };

        let report = ResilienceReport {
            report_id: uuid::Uuid::new_v4().to_string(),
            timestamp: chrono::Utc::now(),
            failing_patterns,
            actions_taken: actions,
            recovered_tasks,
            system_status,
            safe_mode_active,
        };
        tracing::info!(
            report_id = %report.report_id,
            status = ?report.system_status,
            recovered = report.recovered_tasks,
            actions = report.actions_taken.len(),
            "Resilience sweep complete"
        );
        Ok(report)
    }

    /// 开启安全模式会同时暂停引擎；关闭时同时恢复
    pub async fn set_safe_mode(&self, active: bool) -> Result<ControlFlags, ResilienceError> {
        Ok(self.control.set_safe_mode(active).await?)
    }

    pub async fn safe_mode_active(&self) -> bool {
        self.store.controls().await.safe_mode
    }

    /// 审计日志（按追加顺序）
    pub async fn history(&self) -> Vec<ResilienceAction> {
        self.store.actions().await
    }

    /// 按固定间隔执行扫描，直到 `cancel` 被触发
    pub fn spawn_periodic_sweep(
        self: &Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // 跳过立即触发的第一拍
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = manager.detect_and_fix().await {
                            tracing::error!(error = %e, "Periodic resilience sweep failed");
                        }
                    }
                }
            }
            tracing::debug!("Periodic resilience sweep stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::BackupManager;
    use crate::connector::AgentRegistry;
    use crate::core::{EngineConfig, OrchestrationError, TaskKind, TaskPacket};

    fn manager(dir: &std::path::Path) -> (ResilienceManager, Arc<StateStore>, Arc<OrchestrationEngine>) {
        let store = Arc::new(StateStore::in_memory());
        let registry = Arc::new(AgentRegistry::new(Arc::clone(&store)));
        let backups = Arc::new(BackupManager::new(dir.join("backups"), Arc::clone(&store)).unwrap());
        let control = Arc::new(HumanControl::new(Arc::clone(&store)));
        let engine = Arc::new(OrchestrationEngine::new(
            EngineConfig::default(),
            Arc::clone(&store),
            registry,
            backups,
            Arc::clone(&control),
        ));
        let manager = ResilienceManager::new(
            ResilienceConfig::default(),
            Arc::clone(&store),
            Arc::clone(&engine),
            control,
        )
        .unwrap();
        (manager, store, engine)
    }

    async fn seed_failed(store: &StateStore, agent: &str, err: OrchestrationError) -> TaskPacket {
        let mut task = TaskPacket::new(agent, "m", TaskKind::Analysis);
        task.retries = 3;
        task.fail_with(&err);
        store.upsert_task(&task).await.unwrap();
        task
    }

    #[test]
    fn test_transient_heuristic() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, _store, _engine) = manager(dir.path());
        assert!(manager.is_transient("Task Timed Out"));
        assert!(manager.is_transient("failed to send task to agent A: boom"));
        assert!(manager.is_transient("Connection refused (os error 111)"));
        assert!(!manager.is_transient("agent A not found"));
        assert!(!manager.is_transient(""));
    }

    #[tokio::test]
    async fn test_transient_failures_are_resubmitted() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, store, engine) = manager(dir.path());
        let timed_out = seed_failed(&store, "A", OrchestrationError::Timeout { secs: 300 }).await;
        let rejected = seed_failed(
            &store,
            "A",
            OrchestrationError::ApprovalRejected { task_id: "x".into() },
        )
        .await;

        let report = manager.detect_and_fix().await.unwrap();
        assert_eq!(report.recovered_tasks, 1);
        assert_eq!(report.system_status, SystemStatus::Degraded);
        assert_eq!(report.actions_taken[0].kind, ResilienceActionKind::RecoverTask);
        assert_eq!(report.actions_taken[0].status, ActionStatus::Completed);

        let recovered = store.get_task(&timed_out.task_id).await.unwrap();
        assert_eq!(recovered.status, TaskStatus::Pending);
        assert_eq!(recovered.retries, 0);
        assert_eq!(engine.queue_len(), 1);
        assert_eq!(
            store.get_task(&rejected.task_id).await.unwrap().status,
            TaskStatus::Failed
        );
        assert_eq!(manager.history().await.len(), 1);
    }

    #[tokio::test]
    async fn test_quiet_system_is_nominal() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, _store, _engine) = manager(dir.path());
        let report = manager.detect_and_fix().await.unwrap();
        assert_eq!(report.system_status, SystemStatus::Nominal);
        assert!(report.actions_taken.is_empty());
        assert!(!report.safe_mode_active);
    }

    #[tokio::test]
    async fn test_safe_mode_toggle() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, store, _engine) = manager(dir.path());
        manager.set_safe_mode(true).await.unwrap();
        assert!(manager.safe_mode_active().await);
        assert!(store.controls().await.paused);

        manager.set_safe_mode(false).await.unwrap();
        let flags = store.controls().await;
        assert!(!flags.safe_mode && !flags.paused);
    }

    #[test]
    fn test_invalid_pattern_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(StateStore::in_memory());
        let control = Arc::new(HumanControl::new(Arc::clone(&store)));
        let engine = Arc::new(OrchestrationEngine::new(
            EngineConfig::default(),
            Arc::clone(&store),
            Arc::new(AgentRegistry::new(Arc::clone(&store))),
            Arc::new(BackupManager::new(dir.path(), Arc::clone(&store)).unwrap()),
            Arc::clone(&control),
        ));
        let config = ResilienceConfig {
            transient_pattern: "(unclosed".into(),
            ..Default::default()
        };
        assert!(matches!(
            ResilienceManager::new(config, store, engine, control),
            Err(ResilienceError::Pattern(_))
        ));
    }
}
