//! "HumanControl" 进程内 Agent：通过任务包驱动人工控制操作
//!
//! `payload.action` 取值：request_approval / pause / resume / emergency_stop /
//! clear_emergency_stop / rollback / toggle_agent / dispatch_task。
//! 引擎的注册表持有本处理器，所以对引擎只保留 Weak。

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use serde_json::{json, Value};

use super::HumanControl;
use crate::backup::BackupManager;
use crate::connector::{HandlerOutcome, TaskHandler};
use crate::core::{OrchestrationEngine, TaskKind, TaskPacket};

pub const HUMAN_CONTROL_AGENT: &str = "HumanControl";

pub struct ControlHandler {
    control: Arc<HumanControl>,
    backups: Arc<BackupManager>,
    engine: Weak<OrchestrationEngine>,
}

impl ControlHandler {
    pub fn new(
        control: Arc<HumanControl>,
        backups: Arc<BackupManager>,
        engine: Weak<OrchestrationEngine>,
    ) -> Self {
        Self {
            control,
            backups,
            engine,
        }
    }
}

fn str_field<'a>(payload: &'a Value, key: &str) -> Option<&'a str> {
    payload.get(key).and_then(Value::as_str)
}

fn flags_value(flags: super::ControlFlags) -> Value {
    serde_json::to_value(flags).unwrap_or(Value::Null)
}

/// 由 `payload.new_task` 构造任务包：agent / kind 必填，其余字段缺省时取新任务的默认值
fn packet_from_value(value: &Value) -> Result<TaskPacket, String> {
    let Value::Object(fields) = value else {
        return Err("new_task must be an object".into());
    };
    let agent = fields
        .get("agent")
        .and_then(Value::as_str)
        .ok_or_else(|| "new_task needs agent".to_string())?;
    let kind: TaskKind = fields
        .get("kind")
        .cloned()
        .ok_or_else(|| "new_task needs kind".to_string())
        .and_then(|kind| serde_json::from_value(kind).map_err(|e| format!("invalid kind: {e}")))?;
    let module = fields.get("module").and_then(Value::as_str).unwrap_or("manual");

    let mut merged = serde_json::to_value(TaskPacket::new(agent, module, kind)).map_err(|e| e.to_string())?;
    if let Value::Object(base) = &mut merged {
        for (key, field) in fields {
            base.insert(key.clone(), field.clone());
        }
    }
    serde_json::from_value(merged).map_err(|e| format!("invalid new_task: {e}"))
}

#[async_trait]
impl TaskHandler for ControlHandler {
    async fn handle(&self, task: &TaskPacket) -> HandlerOutcome {
        let payload = &task.payload;
        let Some(action) = str_field(payload, "action") else {
            return HandlerOutcome::error("missing payload.action");
        };
        tracing::debug!(task_id = %task.task_id, action, "Control action received");

        match action {
            "request_approval" => {
                let Some(target_id) = str_field(payload, "task_id") else {
                    return HandlerOutcome::error("request_approval needs payload.task_id");
                };
                let Some(snapshot) = payload.get("task") else {
                    return HandlerOutcome::error("request_approval needs payload.task");
                };
                let mut target = match serde_json::from_value::<TaskPacket>(snapshot.clone()) {
                    Ok(target) => target,
                    Err(e) => return HandlerOutcome::error(format!("invalid payload.task: {e}")),
                };
                target.task_id = target_id.to_string();
                let requester = str_field(payload, "requester").unwrap_or("HumanControl");
                match self.control.request_approval(&target, requester).await {
                    Ok(req) => HandlerOutcome::success(json!({ "request_id": req.request_id })),
                    Err(e) => HandlerOutcome::error(e.to_string()),
                }
            }
            "pause" | "resume" => match self.control.set_paused(action == "pause").await {
                Ok(flags) => HandlerOutcome::success(flags_value(flags)),
                Err(e) => HandlerOutcome::error(e.to_string()),
            },
            "emergency_stop" | "clear_emergency_stop" => {
                match self.control.set_emergency_stop(action == "emergency_stop").await {
                    Ok(flags) => HandlerOutcome::success(flags_value(flags)),
                    Err(e) => HandlerOutcome::error(e.to_string()),
                }
            }
            "rollback" => {
                let Some(backup_id) = str_field(payload, "backup_id") else {
                    return HandlerOutcome::error("rollback needs payload.backup_id");
                };
                match self.backups.rollback(backup_id).await {
                    Ok(record) => HandlerOutcome::success(json!({
                        "backup_id": record.backup_id,
                        "project_path": record.project_path,
                    })),
                    Err(e) => HandlerOutcome::error(e.to_string()),
                }
            }
            "toggle_agent" => {
                let Some(agent) = str_field(payload, "agent") else {
                    return HandlerOutcome::error("toggle_agent needs payload.agent");
                };
                let enabled = payload.get("enabled").and_then(Value::as_bool).unwrap_or(true);
                match self.control.toggle_agent(agent, enabled).await {
                    Ok(()) => HandlerOutcome::success(json!({ "agent": agent, "enabled": enabled })),
                    Err(e) => HandlerOutcome::error(e.to_string()),
                }
            }
            "dispatch_task" => {
                let Some(raw) = payload.get("new_task") else {
                    return HandlerOutcome::error("dispatch_task needs payload.new_task");
                };
                let new_task = match packet_from_value(raw) {
                    Ok(new_task) => new_task,
                    Err(message) => return HandlerOutcome::error(message),
                };
                let Some(engine) = self.engine.upgrade() else {
                    return HandlerOutcome::error("orchestration engine is no longer available");
                };
                match engine.submit(new_task).await {
                    Ok(submitted) => {
                        tracing::info!(task_id = %submitted.task_id, agent = %submitted.agent, "Task dispatched by control agent");
                        HandlerOutcome::success(json!({ "task_id": submitted.task_id }))
                    }
                    Err(e) => HandlerOutcome::error(e.to_string()),
                }
            }
            other => HandlerOutcome::error(format!("unknown control action: {other}")),
        }
    }
}
