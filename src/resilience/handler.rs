//! "SystemResilience" 进程内 Agent
//!
//! `payload.action`：analyze_and_fix / report / set_safe_mode（配合 `payload.active`）。
//! 管理器持有引擎、引擎的注册表又持有本处理器，这里用 Weak 断开环。

use std::sync::Weak;

use async_trait::async_trait;
use serde_json::{json, Value};

use super::ResilienceManager;
use crate::connector::{HandlerOutcome, TaskHandler};
use crate::core::TaskPacket;

pub const SYSTEM_RESILIENCE_AGENT: &str = "SystemResilience";

pub struct ResilienceHandler {
    manager: Weak<ResilienceManager>,
}

impl ResilienceHandler {
    pub fn new(manager: Weak<ResilienceManager>) -> Self {
        Self { manager }
    }
}

#[async_trait]
impl TaskHandler for ResilienceHandler {
    async fn handle(&self, task: &TaskPacket) -> HandlerOutcome {
        let Some(manager) = self.manager.upgrade() else {
            return HandlerOutcome::error("resilience manager is no longer available");
        };
        let action = task
            .payload
            .get("action")
            .and_then(Value::as_str)
            .unwrap_or("report");

        match action {
            "analyze_and_fix" => match manager.detect_and_fix().await {
                Ok(report) => match serde_json::to_value(&report) {
                    Ok(value) => HandlerOutcome::success(value),
                    Err(e) => HandlerOutcome::error(e.to_string()),
                },
                Err(e) => HandlerOutcome::error(e.to_string()),
            },
            "report" => {
                let history = manager.history().await;
                let recent: Vec<Value> = history
                    .iter()
                    .rev()
                    .take(10)
                    .filter_map(|a| serde_json::to_value(a).ok())
                    .collect();
                HandlerOutcome::success(json!({
                    "safe_mode": manager.safe_mode_active().await,
                    "total_actions": history.len(),
                    "recent_actions": recent,
                }))
            }
            "set_safe_mode" => {
                let Some(active) = task.payload.get("active").and_then(Value::as_bool) else {
                    return HandlerOutcome::error("set_safe_mode needs boolean payload.active");
                };
                match manager.set_safe_mode(active).await {
                    Ok(flags) => HandlerOutcome::success(json!({
                        "safe_mode": flags.safe_mode,
                        "paused": flags.paused,
                    })),
                    Err(e) => HandlerOutcome::error(e.to_string()),
                }
            }
            other => HandlerOutcome::error(format!("unknown resilience action: {other}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::BackupManager;
    use crate::connector::AgentRegistry;
    use crate::control::HumanControl;
    use crate::core::{EngineConfig, OrchestrationEngine, TaskKind};
    use crate::resilience::ResilienceConfig;
    use crate::store::StateStore;
    use std::sync::Arc;

    fn manager(dir: &std::path::Path) -> Arc<ResilienceManager> {
        let store = Arc::new(StateStore::in_memory());
        let control = Arc::new(HumanControl::new(Arc::clone(&store)));
        let engine = Arc::new(OrchestrationEngine::new(
            EngineConfig::default(),
            Arc::clone(&store),
            Arc::new(AgentRegistry::new(Arc::clone(&store))),
            Arc::new(BackupManager::new(dir, Arc::clone(&store)).unwrap()),
            Arc::clone(&control),
        ));
        Arc::new(ResilienceManager::new(ResilienceConfig::default(), store, engine, control).unwrap())
    }

    fn packet(payload: Value) -> TaskPacket {
        TaskPacket::new(SYSTEM_RESILIENCE_AGENT, "resilience", TaskKind::Analysis).with_payload(payload)
    }

    #[tokio::test]
    async fn test_actions() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path());
        let handler = ResilienceHandler::new(Arc::downgrade(&manager));

        match handler.handle(&packet(json!({"action": "analyze_and_fix"}))).await {
            HandlerOutcome::Success { result } => assert_eq!(result["system_status"], "Nominal"),
            other => panic!("unexpected outcome: {other:?}"),
        }

        handler
            .handle(&packet(json!({"action": "set_safe_mode", "active": true})))
            .await;
        assert!(manager.safe_mode_active().await);

        match handler.handle(&packet(json!({}))).await {
            HandlerOutcome::Success { result } => assert_eq!(result["safe_mode"], true),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_dropped_manager() {
        let dir = tempfile::tempdir().unwrap();
        let handler = ResilienceHandler::new(Arc::downgrade(&manager(dir.path())));
        assert!(matches!(
            handler.handle(&packet(json!({"action": "report"}))).await,
            HandlerOutcome::Error { .. }
        ));
    }
}
