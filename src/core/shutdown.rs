//! 优雅关闭
//!
//! Ctrl+C / SIGTERM 触发统一的关闭 token；随后按注册顺序执行清理：
//! 先停掉后台扫描，再停 worker 池。状态在每次写入时已落盘，关闭时无需额外 flush。

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::OrchestrationEngine;

/// 关闭信号管理器
#[derive(Clone, Default)]
pub struct ShutdownManager {
    token: CancellationToken,
}

/// 关闭原因
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownReason {
    /// Ctrl+C
    UserInitiated,
    /// SIGTERM
    Signal,
}

impl ShutdownManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// 关闭 token；后台任务在其上 select 以便及时退出
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn shutdown(&self, reason: ShutdownReason) {
        tracing::info!(reason = ?reason, "Shutdown requested");
        self.token.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.token.is_cancelled()
    }

    pub async fn wait_for_shutdown(&self) {
        self.token.cancelled().await;
    }

    /// 安装 Ctrl+C / SIGTERM 处理
    pub fn install_signal_handlers(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            if let Ok(()) = tokio::signal::ctrl_c().await {
                tracing::info!("Received Ctrl+C, initiating graceful shutdown");
                manager.shutdown(ShutdownReason::UserInitiated);
            }
        });

        #[cfg(unix)]
        {
            let manager = Arc::clone(self);
            tokio::spawn(async move {
                use tokio::signal::unix::{signal, SignalKind};
                if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
                    sigterm.recv().await;
                    tracing::info!("Received SIGTERM, initiating graceful shutdown");
                    manager.shutdown(ShutdownReason::Signal);
                }
            });
        }
    }
}

/// 关闭时执行的清理步骤
#[async_trait::async_trait]
pub trait ShutdownCleanup: Send + Sync {
    async fn cleanup(&self) -> anyhow::Result<()>;

    /// 日志中显示的名称
    fn name(&self) -> &'static str;
}

/// 关闭协调器：按注册顺序逐个执行清理，每步有超时
pub struct ShutdownCoordinator {
    steps: Vec<Arc<dyn ShutdownCleanup>>,
    timeout: Duration,
}

impl ShutdownCoordinator {
    pub fn new(timeout: Duration) -> Self {
        Self {
            steps: Vec::new(),
            timeout,
        }
    }

    pub fn register<T: ShutdownCleanup + 'static>(&mut self, step: T) {
        self.steps.push(Arc::new(step));
    }

    pub async fn run_cleanup(&self) {
        tracing::info!(steps = self.steps.len(), "Running shutdown cleanup");

        for step in &self.steps {
            let name = step.name();
            match tokio::time::timeout(self.timeout, step.cleanup()).await {
                Ok(Ok(())) => tracing::info!(step = name, "Cleanup step completed"),
                Ok(Err(e)) => tracing::warn!(step = name, error = %e, "Cleanup step failed"),
                Err(_) => tracing::warn!(step = name, timeout_ms = self.timeout.as_millis() as u64, "Cleanup step timed out"),
            }
        }

        tracing::info!("Shutdown cleanup finished");
    }
}

/// 停止引擎的 worker 池
pub struct EngineCleanup {
    engine: Arc<OrchestrationEngine>,
}

impl EngineCleanup {
    pub fn new(engine: Arc<OrchestrationEngine>) -> Self {
        Self { engine }
    }
}

#[async_trait::async_trait]
impl ShutdownCleanup for EngineCleanup {
    async fn cleanup(&self) -> anyhow::Result<()> {
        self.engine.stop().await;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "OrchestrationEngine"
    }
}

/// 等待一个在关闭 token 上退出的后台任务（如周期性自愈扫描）
pub struct BackgroundTaskCleanup {
    name: &'static str,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl BackgroundTaskCleanup {
    pub fn new(name: &'static str, handle: JoinHandle<()>) -> Self {
        Self {
            name,
            handle: Mutex::new(Some(handle)),
        }
    }
}

#[async_trait::async_trait]
impl ShutdownCleanup for BackgroundTaskCleanup {
    async fn cleanup(&self) -> anyhow::Result<()> {
        if let Some(handle) = self.handle.lock().await.take() {
            handle.await?;
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        self.name
    }
}

/// 运行 `app` 直到其结束或收到关闭信号，然后执行 `cleanup`
pub async fn run_with_graceful_shutdown<F, Fut>(
    shutdown_manager: Arc<ShutdownManager>,
    app: F,
    cleanup: impl FnOnce() -> Fut,
) where
    F: Future<Output = ()>,
    Fut: Future<Output = ()>,
{
    shutdown_manager.install_signal_handlers();

    tokio::select! {
        _ = app => {
            tracing::info!("Application finished normally");
        }
        _ = shutdown_manager.wait_for_shutdown() => {
            tracing::info!("Shutdown signal received");
        }
    }

    cleanup().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn test_shutdown_cancels_token() {
        let manager = ShutdownManager::new();
        let token = manager.token();
        assert!(!manager.is_shutdown());
        manager.shutdown(ShutdownReason::Signal);
        assert!(manager.is_shutdown());
        assert!(token.is_cancelled());
    }

    struct FlagCleanup {
        called: Arc<AtomicBool>,
    }

    #[async_trait::async_trait]
    impl ShutdownCleanup for FlagCleanup {
        async fn cleanup(&self) -> anyhow::Result<()> {
            self.called.store(true, Ordering::SeqCst);
            Ok(())
        }

        fn name(&self) -> &'static str {
            "Flag"
        }
    }

    #[tokio::test]
    async fn test_coordinator_runs_steps() {
        let manager = Arc::new(ShutdownManager::new());
        let mut coordinator = ShutdownCoordinator::new(Duration::from_secs(1));

        let called = Arc::new(AtomicBool::new(false));
        coordinator.register(FlagCleanup { called: Arc::clone(&called) });

        let token = manager.token();
        let background = tokio::spawn(async move { token.cancelled().await });
        coordinator.register(BackgroundTaskCleanup::new("Background", background));

        manager.shutdown(ShutdownReason::UserInitiated);
        coordinator.run_cleanup().await;
        assert!(called.load(Ordering::SeqCst));
    }

    struct StuckCleanup;

    #[async_trait::async_trait]
    impl ShutdownCleanup for StuckCleanup {
        async fn cleanup(&self) -> anyhow::Result<()> {
            std::future::pending::<()>().await;
            Ok(())
        }

        fn name(&self) -> &'static str {
            "Stuck"
        }
    }

    #[tokio::test]
    async fn test_stuck_step_times_out_and_later_steps_run() {
        let mut coordinator = ShutdownCoordinator::new(Duration::from_millis(50));
        coordinator.register(StuckCleanup);
        let called = Arc::new(AtomicBool::new(false));
        coordinator.register(FlagCleanup { called: Arc::clone(&called) });

        tokio::time::timeout(Duration::from_secs(2), coordinator.run_cleanup())
            .await
            .unwrap();
        assert!(called.load(Ordering::SeqCst));
    }
}
