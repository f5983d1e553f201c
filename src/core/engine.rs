//! 编排引擎：worker 池 + 任务状态机
//!
//! 每个任务：Pending → Running → Completed / Failed；可重试错误在预算内回到 Pending 并排到队尾。
//! worker 取任务前后都检查全局开关（急停 / 暂停）；派发前依次检查 Agent 开关、审批闸门，
//! 派发后等待状态存储的任务事件（按 poll_interval 兜底轮询），超时走失败处理。

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::queue::TaskQueue;
use super::{OrchestrationError, TaskPacket, TaskStatus};
use crate::backup::BackupManager;
use crate::connector::{AgentConnector, AgentRegistry};
use crate::control::{ApprovalStatus, HumanControl};
use crate::store::{StateStore, TaskEvent};

/// 审批请求的发起者名称
pub const ENGINE_REQUESTER: &str = "OrchestrationEngine";

/// 引擎运行参数
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub workers: usize,
    /// 派发后等待完成的上限
    pub task_timeout: Duration,
    /// 兜底轮询间隔
    pub poll_interval: Duration,
    pub pause_recheck: Duration,
    /// 急停时的空转间隔（比暂停更长）
    pub emergency_recheck: Duration,
    /// 审批未决时重新入队的延迟
    pub approval_recheck: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workers: 5,
            task_timeout: Duration::from_secs(300),
            poll_interval: Duration::from_secs(2),
            pause_recheck: Duration::from_secs(1),
            emergency_recheck: Duration::from_secs(5),
            approval_recheck: Duration::from_secs(5),
        }
    }
}

struct WorkerPool {
    cancel: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

pub struct OrchestrationEngine {
    config: EngineConfig,
    store: Arc<StateStore>,
    queue: TaskQueue,
    registry: Arc<AgentRegistry>,
    backups: Arc<BackupManager>,
    control: Arc<HumanControl>,
    pool: Mutex<Option<WorkerPool>>,
    running: AtomicBool,
}

impl OrchestrationEngine {
    pub fn new(
        config: EngineConfig,
        store: Arc<StateStore>,
        registry: Arc<AgentRegistry>,
        backups: Arc<BackupManager>,
        control: Arc<HumanControl>,
    ) -> Self {
        Self {
            config,
            store,
            queue: TaskQueue::new(),
            registry,
            backups,
            control,
            pool: Mutex::new(None),
            running: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// 启动 worker 池；重复调用无效果
    pub async fn start(self: &Arc<Self>) {
        let mut pool = self.pool.lock().await;
        if pool.is_some() {
            tracing::debug!("Engine already running");
            return;
        }

        let cancel = CancellationToken::new();
        let handles = (0..self.config.workers.max(1))
            .map(|worker_id| {
                let engine = Arc::clone(self);
                let cancel = cancel.clone();
                tokio::spawn(async move { engine.worker_loop(worker_id, cancel).await })
            })
            .collect();

        *pool = Some(WorkerPool { cancel, handles });
        self.running.store(true, Ordering::SeqCst);
        tracing::info!(workers = self.config.workers.max(1), "Orchestration engine started");
    }

    /// 取消所有 worker 并等待退出；进行中的任务保留最后一次持久化的状态
    pub async fn stop(&self) {
        let Some(pool) = self.pool.lock().await.take() else {
            return;
        };
        pool.cancel.cancel();
        for result in futures_util::future::join_all(pool.handles).await {
            if let Err(e) = result {
                tracing::warn!(error = %e, "Worker ended abnormally");
            }
        }
        self.running.store(false, Ordering::SeqCst);
        tracing::info!("Orchestration engine stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    pub async fn get_task(&self, task_id: &str) -> Option<TaskPacket> {
        self.store.get_task(task_id).await
    }

    pub async fn list_tasks(&self) -> Vec<TaskPacket> {
        self.store.list_tasks().await
    }

    /// 提交任务
    ///
    /// Modification 任务若还没有备份，必须带 `payload.project_path`，并在入队前完成备份；
    /// 缺路径或备份失败时任务以 Failed 落盘并返回错误，不会入队。
    pub async fn submit(&self, mut task: TaskPacket) -> Result<TaskPacket, OrchestrationError> {
        if task.kind.mutates_project() && task.backup_id.is_none() {
            let Some(project_path) = task.project_path().map(str::to_string) else {
                let err = OrchestrationError::PolicyViolation(
                    "modification task requires payload.project_path for safety backup".into(),
                );
                tracing::error!(task_id = %task.task_id, "Modification task without project_path rejected");
                return self.reject_submission(task, err).await;
            };

            let description = format!("Auto-backup before {}", task.task_id);
            match self.backups.create_backup(&project_path, &description).await {
                Ok(record) => task.backup_id = Some(record.backup_id),
                Err(e) => {
                    tracing::error!(task_id = %task.task_id, error = %e, "Backup failed, modification aborted");
                    return self
                        .reject_submission(task, OrchestrationError::BackupFailure(e.to_string()))
                        .await;
                }
            }
        }

        task.status = TaskStatus::Pending;
        self.store.upsert_task(&task).await?;
        self.queue.enqueue(task.clone());
        tracing::info!(task_id = %task.task_id, agent = %task.agent, kind = ?task.kind, "Task submitted");
        Ok(task)
    }

    async fn reject_submission(
        &self,
        mut task: TaskPacket,
        err: OrchestrationError,
    ) -> Result<TaskPacket, OrchestrationError> {
        task.fail_with(&err);
        self.store.upsert_task(&task).await?;
        Err(err)
    }

    /// 启动时把持久化为 Pending / Running 的任务重新入队；返回数量
    pub async fn requeue_unfinished(&self) -> Result<usize, OrchestrationError> {
        let mut count = 0;
        for task in self.store.list_tasks().await {
            if task.is_finished() {
                continue;
            }
            let requeued = self
                .store
                .update_task(&task.task_id, |t| t.status = TaskStatus::Pending)
                .await?;
            if let Some(task) = requeued {
                self.queue.enqueue(task);
                count += 1;
            }
        }
        if count > 0 {
            tracing::info!(count, "Unfinished tasks requeued");
        }
        Ok(count)
    }

    async fn worker_loop(self: Arc<Self>, worker_id: usize, cancel: CancellationToken) {
        tracing::debug!(worker_id, "Worker started");
        loop {
            if !self.hold_while_stopped(&cancel).await {
                break;
            }

            // 限时等待，空队列时也能及时感知暂停 / 急停
            let next = tokio::select! {
                _ = cancel.cancelled() => break,
                next = tokio::time::timeout(self.config.pause_recheck, self.queue.dequeue()) => next,
            };
            let task = match next {
                Ok(Some(task)) => task,
                Ok(None) => break,
                Err(_) => continue,
            };

            // 等待出队期间可能已被暂停：持有该任务直到放行，保持 FIFO 顺序
            if !self.hold_while_stopped(&cancel).await {
                self.queue.enqueue(task);
                break;
            }

            let task_id = task.task_id.clone();
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::warn!(worker_id, task_id = %task_id, "Worker cancelled during task processing");
                    break;
                }
                result = self.process_task(task) => {
                    if let Err(e) = result {
                        tracing::error!(worker_id, task_id = %task_id, error = %e, "Task processing error");
                    }
                }
            }
        }
        tracing::debug!(worker_id, "Worker stopped");
    }

    /// 急停或暂停期间空转，直到两者都解除；被取消时返回 false
    async fn hold_while_stopped(&self, cancel: &CancellationToken) -> bool {
        loop {
            let controls = self.store.controls().await;
            let delay = if controls.emergency_stop {
                self.config.emergency_recheck
            } else if controls.paused {
                self.config.pause_recheck
            } else {
                return true;
            };
            if !idle(cancel, delay).await {
                return false;
            }
        }
    }

    async fn process_task(&self, queued: TaskPacket) -> Result<(), OrchestrationError> {
        // 以存储中的版本为准
        let mut task = self.store.get_task(&queued.task_id).await.unwrap_or(queued);
        if task.is_finished() {
            tracing::debug!(task_id = %task.task_id, status = ?task.status, "Skipping finished task");
            return Ok(());
        }

        if !self.control.is_agent_enabled(&task.agent).await {
            let err = OrchestrationError::AgentDisabled(task.agent.clone());
            return self.handle_failure(task, err).await;
        }

        if task.kind.requires_approval() {
            match self.control.approval_for_task(&task.task_id).await {
                None => {
                    self.control.request_approval(&task, ENGINE_REQUESTER).await?;
                    tracing::info!(task_id = %task.task_id, "Task awaiting approval");
                    self.queue.enqueue_after(task, self.config.approval_recheck);
                    return Ok(());
                }
                Some(request) => match request.status {
                    ApprovalStatus::Pending => {
                        self.queue.enqueue_after(task, self.config.approval_recheck);
                        return Ok(());
                    }
                    ApprovalStatus::Rejected => {
                        let err = OrchestrationError::ApprovalRejected {
                            task_id: task.task_id.clone(),
                        };
                        return self.handle_failure(task, err).await;
                    }
                    ApprovalStatus::Approved => {}
                },
            }
        }

        if task.kind.mutates_project() && task.backup_id.is_none() {
            let err = OrchestrationError::PolicyViolation(
                "modification task has no safety backup".into(),
            );
            return self.handle_failure(task, err).await;
        }

        let connector = match self.registry.resolve(&task.agent).await {
            Ok(connector) => connector,
            Err(err) => return self.handle_failure(task, err).await,
        };

        // 先订阅再派发，避免错过快速完成的事件
        let events = self.store.subscribe();
        task.status = TaskStatus::Running;
        task.result = None;
        self.store.upsert_task(&task).await?;
        tracing::info!(task_id = %task.task_id, agent = %task.agent, attempt = task.retries + 1, "Task dispatched");

        if let Err(err) = connector.send(&task).await {
            return self.handle_failure(task, err).await;
        }

        match self
            .await_completion(&task.task_id, connector.as_ref(), events)
            .await?
        {
            Some(finished) => {
                tracing::info!(task_id = %finished.task_id, status = ?finished.status, "Task finished");
                Ok(())
            }
            None => {
                let err = OrchestrationError::Timeout {
                    secs: self.config.task_timeout.as_secs(),
                };
                self.handle_failure(task, err).await
            }
        }
    }

    /// 等待任务进入终态；超时返回 None
    async fn await_completion(
        &self,
        task_id: &str,
        connector: &dyn AgentConnector,
        mut events: broadcast::Receiver<TaskEvent>,
    ) -> Result<Option<TaskPacket>, OrchestrationError> {
        let deadline = tokio::time::sleep(self.config.task_timeout);
        tokio::pin!(deadline);
        let mut ticker = tokio::time::interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut events_closed = false;

        loop {
            tokio::select! {
                _ = &mut deadline => return Ok(None),
                event = events.recv(), if !events_closed => match event {
                    Ok(event) if event.task_id == task_id && event.status.is_terminal() => {}
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::debug!(task_id, skipped, "Task events lagged, re-reading store");
                    }
                    Err(broadcast::error::RecvError::Closed) => events_closed = true,
                },
                _ = ticker.tick() => {
                    if let Some(result) = connector.poll_result(task_id).await {
                        let updated = self
                            .store
                            .update_task(task_id, |t| {
                                t.status = TaskStatus::Completed;
                                t.result = Some(result);
                            })
                            .await?;
                        return Ok(updated);
                    }
                }
            }

            if let Some(current) = self.store.get_task(task_id).await {
                if current.is_finished() {
                    return Ok(Some(current));
                }
            }
        }
    }

    /// 失败处理：终态错误立即失败；可重试错误在预算内回到 Pending 并排到队尾
    async fn handle_failure(
        &self,
        mut task: TaskPacket,
        err: OrchestrationError,
    ) -> Result<(), OrchestrationError> {
        if !err.is_retryable() {
            task.fail_with(&err);
            self.store.upsert_task(&task).await?;
            tracing::error!(task_id = %task.task_id, kind = err.kind(), error = %err, "Task failed");
            return Ok(());
        }

        task.retries = (task.retries + 1).min(task.max_retries);
        if task.retries < task.max_retries {
            tracing::warn!(
                task_id = %task.task_id,
                retry = task.retries,
                max_retries = task.max_retries,
                error = %err,
                "Task retrying"
            );
            task.status = TaskStatus::Pending;
            task.result = Some(json!({ "last_error": err.to_string(), "kind": err.kind() }));
            self.store.upsert_task(&task).await?;
            self.queue.enqueue(task);
        } else {
            task.fail_with(&err);
            self.store.upsert_task(&task).await?;
            tracing::error!(task_id = %task.task_id, error = %err, "Task max retries reached");
        }
        Ok(())
    }
}

/// 空转 `delay`；被取消时返回 false
async fn idle(cancel: &CancellationToken, delay: Duration) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::{handler_fn, HandlerOutcome, LocalConnector};
    use crate::core::TaskKind;

    fn fast_config() -> EngineConfig {
        EngineConfig {
            workers: 2,
            task_timeout: Duration::from_millis(300),
            poll_interval: Duration::from_millis(20),
            pause_recheck: Duration::from_millis(20),
            emergency_recheck: Duration::from_millis(20),
            approval_recheck: Duration::from_millis(20),
        }
    }

    fn engine(dir: &std::path::Path) -> (Arc<OrchestrationEngine>, Arc<StateStore>, Arc<AgentRegistry>, Arc<HumanControl>) {
        let store = Arc::new(StateStore::in_memory());
        let registry = Arc::new(AgentRegistry::new(Arc::clone(&store)));
        let backups = Arc::new(BackupManager::new(dir.join("backups"), Arc::clone(&store)).unwrap());
        let control = Arc::new(HumanControl::new(Arc::clone(&store)));
        let engine = Arc::new(OrchestrationEngine::new(
            fast_config(),
            Arc::clone(&store),
            Arc::clone(&registry),
            backups,
            Arc::clone(&control),
        ));
        (engine, store, registry, control)
    }

    async fn wait_for(store: &StateStore, task_id: &str, status: TaskStatus) -> TaskPacket {
        for _ in 0..200 {
            if let Some(task) = store.get_task(task_id).await {
                if task.status == status {
                    return task;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("task {task_id} never reached {status:?}");
    }

    #[tokio::test]
    async fn test_unknown_agent_fails_without_retry() {
        let dir = tempfile::tempdir().unwrap();
        let (engine, store, _registry, _control) = engine(dir.path());
        engine.start().await;

        let task = engine
            .submit(TaskPacket::new("Ghost", "m", TaskKind::Analysis))
            .await
            .unwrap();
        let failed = wait_for(&store, &task.task_id, TaskStatus::Failed).await;
        assert_eq!(failed.retries, 0);
        assert!(failed.error_message().unwrap().contains("not found"));
        engine.stop().await;
    }

    #[tokio::test]
    async fn test_disabled_agent_exhausts_retries() {
        let dir = tempfile::tempdir().unwrap();
        let (engine, store, registry, control) = engine(dir.path());
        let handler = handler_fn(|_t: TaskPacket| async { HandlerOutcome::success(json!({})) });
        registry
            .register(Arc::new(LocalConnector::new("Off", Arc::new(handler), Arc::clone(&store))))
            .await
            .unwrap();
        control.toggle_agent("Off", false).await.unwrap();
        engine.start().await;

        let task = engine
            .submit(TaskPacket::new("Off", "m", TaskKind::Analysis))
            .await
            .unwrap();
        let failed = wait_for(&store, &task.task_id, TaskStatus::Failed).await;
        assert_eq!(failed.retries, 3);
        assert!(failed.error_message().unwrap().contains("disabled"));
        engine.stop().await;
    }

    #[tokio::test]
    async fn test_timeout_goes_through_retry_budget() {
        let dir = tempfile::tempdir().unwrap();
        let (engine, store, registry, _control) = engine(dir.path());
        let handler = handler_fn(|_t: TaskPacket| async {
            tokio::time::sleep(Duration::from_secs(30)).await;
            HandlerOutcome::success(json!({}))
        });
        registry
            .register(Arc::new(LocalConnector::new("Slow", Arc::new(handler), Arc::clone(&store))))
            .await
            .unwrap();
        engine.start().await;

        let task = engine
            .submit(TaskPacket::new("Slow", "m", TaskKind::Analysis).with_max_retries(2))
            .await
            .unwrap();
        let failed = wait_for(&store, &task.task_id, TaskStatus::Failed).await;
        assert_eq!(failed.retries, 2);
        assert!(failed.error_message().unwrap().contains("timed out"));
        engine.stop().await;
    }

    #[tokio::test]
    async fn test_pause_holds_queue() {
        let dir = tempfile::tempdir().unwrap();
        let (engine, store, registry, control) = engine(dir.path());
        let handler = handler_fn(|_t: TaskPacket| async { HandlerOutcome::success(json!({"ok": true})) });
        registry
            .register(Arc::new(LocalConnector::new("Quick", Arc::new(handler), Arc::clone(&store))))
            .await
            .unwrap();
        control.set_paused(true).await.unwrap();
        engine.start().await;

        let task = engine
            .submit(TaskPacket::new("Quick", "m", TaskKind::Analysis))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(store.get_task(&task.task_id).await.unwrap().status, TaskStatus::Pending);
        assert_eq!(engine.queue_len(), 1);

        control.set_paused(false).await.unwrap();
        wait_for(&store, &task.task_id, TaskStatus::Completed).await;
        engine.stop().await;
        assert!(!engine.is_running());
    }

    #[tokio::test]
    async fn test_pause_while_running_holds_next_task() {
        let dir = tempfile::tempdir().unwrap();
        let (engine, store, registry, control) = engine(dir.path());
        let handler = handler_fn(|_t: TaskPacket| async { HandlerOutcome::success(json!({"ok": true})) });
        registry
            .register(Arc::new(LocalConnector::new("Quick", Arc::new(handler), Arc::clone(&store))))
            .await
            .unwrap();
        engine.start().await;
        // worker 此时已阻塞在出队等待上
        tokio::time::sleep(Duration::from_millis(50)).await;
        control.set_paused(true).await.unwrap();

        let task = engine
            .submit(TaskPacket::new("Quick", "m", TaskKind::Analysis))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(store.get_task(&task.task_id).await.unwrap().status, TaskStatus::Pending);

        control.set_paused(false).await.unwrap();
        wait_for(&store, &task.task_id, TaskStatus::Completed).await;
        engine.stop().await;
    }

    #[tokio::test]
    async fn test_emergency_stop_leaves_queue_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let (engine, store, registry, control) = engine(dir.path());
        let handler = handler_fn(|_t: TaskPacket| async { HandlerOutcome::success(json!({})) });
        registry
            .register(Arc::new(LocalConnector::new("Quick", Arc::new(handler), Arc::clone(&store))))
            .await
            .unwrap();
        engine.start().await;
        control.set_emergency_stop(true).await.unwrap();
        // 超过一次出队等待，确保所有 worker 都已进入急停空转
        tokio::time::sleep(Duration::from_millis(100)).await;

        let task = engine
            .submit(TaskPacket::new("Quick", "m", TaskKind::Analysis))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(engine.queue_len(), 1);
        assert_eq!(store.get_task(&task.task_id).await.unwrap().status, TaskStatus::Pending);

        control.set_emergency_stop(false).await.unwrap();
        wait_for(&store, &task.task_id, TaskStatus::Completed).await;
        assert_eq!(engine.queue_len(), 0);
        engine.stop().await;
    }

    #[tokio::test]
    async fn test_zero_retry_budget_fails_on_first_error() {
        let dir = tempfile::tempdir().unwrap();
        let (engine, store, registry, control) = engine(dir.path());
        let handler = handler_fn(|_t: TaskPacket| async { HandlerOutcome::success(json!({})) });
        registry
            .register(Arc::new(LocalConnector::new("Off", Arc::new(handler), Arc::clone(&store))))
            .await
            .unwrap();
        control.toggle_agent("Off", false).await.unwrap();
        engine.start().await;

        let task = engine
            .submit(TaskPacket::new("Off", "m", TaskKind::Analysis).with_max_retries(0))
            .await
            .unwrap();
        let failed = wait_for(&store, &task.task_id, TaskStatus::Failed).await;
        assert_eq!(failed.retries, 0);
        assert!(failed.retries <= failed.max_retries);
        engine.stop().await;
    }

    #[tokio::test]
    async fn test_requeue_unfinished() {
        let dir = tempfile::tempdir().unwrap();
        let (engine, store, _registry, _control) = engine(dir.path());
        let mut running = TaskPacket::new("A", "m", TaskKind::Analysis);
        running.status = TaskStatus::Running;
        let mut done = TaskPacket::new("A", "m", TaskKind::Analysis);
        done.status = TaskStatus::Completed;
        store.upsert_task(&running).await.unwrap();
        store.upsert_task(&done).await.unwrap();

        assert_eq!(engine.requeue_unfinished().await.unwrap(), 1);
        assert_eq!(engine.queue_len(), 1);
        assert_eq!(
            store.get_task(&running.task_id).await.unwrap().status,
            TaskStatus::Pending
        );
    }
}
