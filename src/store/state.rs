//! 共享状态存储
//!
//! 引擎、备份、人工控制、自愈扫描共用的唯一事实来源。每个聚合一把锁、一个文件；
//! 任务写入会广播 [`TaskEvent`]，引擎据此感知完成，无需固定间隔轮询。

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde_json::Value;
use tokio::sync::broadcast;

use super::persistence::{Aggregate, JsonFile};
use super::StoreError;
use crate::backup::BackupRecord;
use crate::control::{ApprovalRequest, ControlFlags};
use crate::core::{AgentRegistration, TaskId, TaskPacket, TaskStatus};
use crate::resilience::ResilienceAction;

const EVENT_CAPACITY: usize = 256;

/// 任务写入通知
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskEvent {
    pub task_id: TaskId,
    pub status: TaskStatus,
}

/// 共享状态存储
#[derive(Debug)]
pub struct StateStore {
    root: Option<PathBuf>,
    tasks: Aggregate<HashMap<TaskId, TaskPacket>>,
    agents: Aggregate<HashMap<String, AgentRegistration>>,
    backups: Aggregate<Vec<BackupRecord>>,
    approvals: Aggregate<HashMap<String, ApprovalRequest>>,
    controls: Aggregate<ControlFlags>,
    toggles: Aggregate<HashMap<String, bool>>,
    resilience: Aggregate<Vec<ResilienceAction>>,
    extensions: Aggregate<HashMap<String, Value>>,
    events: broadcast::Sender<TaskEvent>,
}

impl StateStore {
    /// 打开（或新建）状态目录，并加载其中所有聚合
    pub fn open(root: impl AsRef<Path>) -> Result<Self, StoreError> {
        let root = root.as_ref().to_path_buf();
        std::fs::create_dir_all(&root).map_err(|source| StoreError::Io {
            path: root.clone(),
            source,
        })?;

        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let store = Self {
            tasks: Aggregate::load(JsonFile::new(root.join("tasks.json"))),
            agents: Aggregate::load(JsonFile::new(root.join("agents.json"))),
            backups: Aggregate::load(JsonFile::new(root.join("backups.json"))),
            approvals: Aggregate::load(JsonFile::new(root.join("approvals.json"))),
            controls: Aggregate::load(JsonFile::new(root.join("controls.json"))),
            toggles: Aggregate::load(JsonFile::new(root.join("toggles.json"))),
            resilience: Aggregate::load(JsonFile::new(root.join("resilience.json"))),
            extensions: Aggregate::load(JsonFile::new(root.join("extensions.json"))),
            root: Some(root),
            events,
        };
        tracing::info!(root = ?store.root, "State store opened");
        Ok(store)
    }

    /// 不落盘的存储（测试与嵌入场景）
    pub fn in_memory() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            root: None,
            tasks: Aggregate::in_memory(),
            agents: Aggregate::in_memory(),
            backups: Aggregate::in_memory(),
            approvals: Aggregate::in_memory(),
            controls: Aggregate::in_memory(),
            toggles: Aggregate::in_memory(),
            resilience: Aggregate::in_memory(),
            extensions: Aggregate::in_memory(),
            events,
        }
    }

    pub fn root(&self) -> Option<&Path> {
        self.root.as_deref()
    }

    /// 订阅任务写入通知
    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.events.subscribe()
    }

    fn publish(&self, task: &TaskPacket) {
        // 没有订阅者时 send 返回 Err，忽略即可
        let _ = self.events.send(TaskEvent {
            task_id: task.task_id.clone(),
            status: task.status,
        });
    }

    // ---- tasks ----

    /// 写入整条任务记录（新增或覆盖）
    pub async fn upsert_task(&self, task: &TaskPacket) -> Result<(), StoreError> {
        self.tasks
            .mutate(|tasks| {
                tasks.insert(task.task_id.clone(), task.clone());
            })
            .await?;
        self.publish(task);
        Ok(())
    }

    /// 原地修改任务；任务不存在时返回 None
    pub async fn update_task(
        &self,
        task_id: &str,
        f: impl FnOnce(&mut TaskPacket),
    ) -> Result<Option<TaskPacket>, StoreError> {
        let updated = self
            .tasks
            .mutate(|tasks| {
                tasks.get_mut(task_id).map(|task| {
                    f(task);
                    task.clone()
                })
            })
            .await?;
        if let Some(task) = &updated {
            self.publish(task);
        }
        Ok(updated)
    }

    /// 连接器回写执行结果
    pub async fn record_outcome(
        &self,
        task_id: &str,
        status: TaskStatus,
        result: Value,
    ) -> Result<bool, StoreError> {
        let updated = self
            .update_task(task_id, |task| {
                task.status = status;
                task.result = Some(result);
            })
            .await?;
        Ok(updated.is_some())
    }

    pub async fn get_task(&self, task_id: &str) -> Option<TaskPacket> {
        self.tasks.read().await.get(task_id).cloned()
    }

    pub async fn list_tasks(&self) -> Vec<TaskPacket> {
        let mut tasks: Vec<_> = self.tasks.read().await.values().cloned().collect();
        tasks.sort_by_key(|t| t.created_at);
        tasks
    }

    pub async fn tasks_with_status(&self, status: TaskStatus) -> Vec<TaskPacket> {
        let mut tasks: Vec<_> = self
            .tasks
            .read()
            .await
            .values()
            .filter(|t| t.status == status)
            .cloned()
            .collect();
        tasks.sort_by_key(|t| t.created_at);
        tasks
    }

    // ---- agents ----

    pub async fn put_agent(&self, registration: AgentRegistration) -> Result<(), StoreError> {
        self.agents
            .mutate(|agents| {
                agents.insert(registration.name.clone(), registration);
            })
            .await
    }

    pub async fn remove_agent(&self, name: &str) -> Result<bool, StoreError> {
        self.agents.mutate(|agents| agents.remove(name).is_some()).await
    }

    pub async fn agents(&self) -> Vec<AgentRegistration> {
        let mut agents: Vec<_> = self.agents.read().await.values().cloned().collect();
        agents.sort_by(|a, b| a.name.cmp(&b.name));
        agents
    }

    // ---- backups ----

    pub async fn add_backup(&self, record: BackupRecord) -> Result<(), StoreError> {
        self.backups.mutate(|backups| backups.push(record)).await
    }

    pub async fn backups(&self) -> Vec<BackupRecord> {
        self.backups.read().await.clone()
    }

    pub async fn find_backup(&self, backup_id: &str) -> Option<BackupRecord> {
        self.backups
            .read()
            .await
            .iter()
            .find(|b| b.backup_id == backup_id)
            .cloned()
    }

    // ---- approvals ----

    pub async fn put_approval(&self, request: ApprovalRequest) -> Result<(), StoreError> {
        self.approvals
            .mutate(|approvals| {
                approvals.insert(request.request_id.clone(), request);
            })
            .await
    }

    /// 原地修改审批请求；请求不存在时返回 None
    pub async fn update_approval<R>(
        &self,
        request_id: &str,
        f: impl FnOnce(&mut ApprovalRequest) -> R,
    ) -> Result<Option<R>, StoreError> {
        self.approvals
            .mutate(|approvals| approvals.get_mut(request_id).map(f))
            .await
    }

    pub async fn approvals(&self) -> Vec<ApprovalRequest> {
        let mut approvals: Vec<_> = self.approvals.read().await.values().cloned().collect();
        approvals.sort_by_key(|a| a.requested_at);
        approvals
    }

    /// 某个任务最近一次的审批请求
    pub async fn approval_for_task(&self, task_id: &str) -> Option<ApprovalRequest> {
        self.approvals
            .read()
            .await
            .values()
            .filter(|a| a.task_id == task_id)
            .max_by_key(|a| a.requested_at)
            .cloned()
    }

    // ---- controls ----

    pub async fn controls(&self) -> ControlFlags {
        *self.controls.read().await
    }

    /// 在同一次写入内修改控制开关，返回修改后的值
    pub async fn update_controls<R>(
        &self,
        f: impl FnOnce(&mut ControlFlags) -> R,
    ) -> Result<R, StoreError> {
        self.controls.mutate(f).await
    }

    // ---- toggles ----

    pub async fn set_toggle(&self, agent: &str, enabled: bool) -> Result<(), StoreError> {
        self.toggles
            .mutate(|toggles| {
                toggles.insert(agent.to_string(), enabled);
            })
            .await
    }

    pub async fn toggles(&self) -> HashMap<String, bool> {
        self.toggles.read().await.clone()
    }

    /// 未设置开关的 Agent 默认启用
    pub async fn is_agent_enabled(&self, agent: &str) -> bool {
        self.toggles.read().await.get(agent).copied().unwrap_or(true)
    }

    // ---- resilience log ----

    pub async fn append_action(&self, action: ResilienceAction) -> Result<(), StoreError> {
        self.resilience.mutate(|log| log.push(action)).await
    }

    pub async fn actions(&self) -> Vec<ResilienceAction> {
        self.resilience.read().await.clone()
    }

    // ---- extensions ----

    /// 协作子系统自有的扩展键
    pub async fn set_extension(&self, key: &str, value: Value) -> Result<(), StoreError> {
        self.extensions
            .mutate(|ext| {
                ext.insert(key.to_string(), value);
            })
            .await
    }

    pub async fn extension(&self, key: &str) -> Option<Value> {
        self.extensions.read().await.get(key).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{ConnectorKind, TaskKind};

    #[tokio::test]
    async fn test_task_roundtrip_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let task = TaskPacket::new("Analyzer", "core", TaskKind::Analysis);
        {
            let store = StateStore::open(dir.path()).unwrap();
            store.upsert_task(&task).await.unwrap();
            store.set_toggle("Analyzer", false).await.unwrap();
            store
                .update_controls(|c| c.paused = true)
                .await
                .unwrap();
        }

        let store = StateStore::open(dir.path()).unwrap();
        assert_eq!(store.get_task(&task.task_id).await, Some(task));
        assert!(!store.is_agent_enabled("Analyzer").await);
        assert!(store.controls().await.paused);
    }

    #[tokio::test]
    async fn test_update_task_publishes_event() {
        let store = StateStore::in_memory();
        let task = TaskPacket::new("A", "m", TaskKind::Analysis);
        store.upsert_task(&task).await.unwrap();

        let mut rx = store.subscribe();
        let done = store
            .record_outcome(&task.task_id, TaskStatus::Completed, serde_json::json!({"ok": true}))
            .await
            .unwrap();
        assert!(done);

        let event = rx.recv().await.unwrap();
        assert_eq!(event.task_id, task.task_id);
        assert_eq!(event.status, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn test_record_outcome_for_unknown_task() {
        let store = StateStore::in_memory();
        let done = store
            .record_outcome("missing", TaskStatus::Completed, Value::Null)
            .await
            .unwrap();
        assert!(!done);
    }

    #[tokio::test]
    async fn test_toggle_defaults_to_enabled() {
        let store = StateStore::in_memory();
        assert!(store.is_agent_enabled("Unknown").await);
    }

    #[tokio::test]
    async fn test_agents_and_extensions() {
        let store = StateStore::in_memory();
        store
            .put_agent(AgentRegistration {
                name: "Remote".into(),
                endpoint: "http://localhost:9".into(),
                kind: ConnectorKind::Remote,
            })
            .await
            .unwrap();
        assert_eq!(store.agents().await.len(), 1);
        assert!(store.remove_agent("Remote").await.unwrap());
        assert!(store.agents().await.is_empty());

        store
            .set_extension("scheduler", serde_json::json!({"last_run": 1}))
            .await
            .unwrap();
        assert_eq!(store.extension("scheduler").await.unwrap()["last_run"], 1);
    }

    #[tokio::test]
    async fn test_only_touched_aggregate_is_written() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::open(dir.path()).unwrap();
        store.set_toggle("A", true).await.unwrap();
        assert!(dir.path().join("toggles.json").exists());
        assert!(!dir.path().join("tasks.json").exists());
    }
}
