//! Switchyard 入口
//!
//! 用法：`switchyard [config.toml]`。初始化日志、加载配置、装配编排器并启动 worker 池，
//! 直到 Ctrl+C / SIGTERM 后按顺序停止后台扫描与引擎。

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use switchyard::core::shutdown::{
    run_with_graceful_shutdown, BackgroundTaskCleanup, EngineCleanup, ShutdownCoordinator,
    ShutdownManager,
};
use switchyard::{config, observability, OrchestratorBuilder};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    observability::init();

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = config::load_config(config_path).context("Failed to load configuration")?;

    let orchestrator = OrchestratorBuilder::new(config)
        .build()
        .await
        .context("Failed to build orchestrator")?;
    orchestrator
        .start()
        .await
        .context("Failed to start orchestration engine")?;

    let controls = orchestrator.control().get_controls().await;
    if controls.safe_mode || controls.paused || controls.emergency_stop {
        tracing::warn!(?controls, "Starting with persisted control flags set");
    }

    let shutdown = Arc::new(ShutdownManager::new());
    let mut coordinator =
        ShutdownCoordinator::new(orchestrator.config().engine.shutdown_timeout());
    if let Some(sweep) = orchestrator.spawn_resilience_sweep(shutdown.token()) {
        coordinator.register(BackgroundTaskCleanup::new("ResilienceSweep", sweep));
    }
    coordinator.register(EngineCleanup::new(Arc::clone(orchestrator.engine())));

    tracing::info!(
        workers = orchestrator.engine().config().workers,
        state_dir = %orchestrator.config().storage.state_dir.display(),
        "Switchyard running, press Ctrl+C to stop"
    );

    run_with_graceful_shutdown(
        Arc::clone(&shutdown),
        std::future::pending::<()>(),
        || async { coordinator.run_cleanup().await },
    )
    .await;

    Ok(())
}
