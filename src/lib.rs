//! Switchyard - 多 Agent 任务编排核心
//!
//! 模块划分：
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 任务模型、错误分类、FIFO 队列、编排引擎、装配与优雅关闭
//! - **store**: 共享状态存储（按聚合加锁、按聚合落盘、任务事件广播）
//! - **backup**: 修改类任务前的 zip 快照与回滚
//! - **connector**: Agent 连接器（进程内 / 远程 HTTP / 模拟）与注册表
//! - **control**: 人工审批、暂停 / 急停 / 安全模式、Agent 启停
//! - **resilience**: 失败扫描、自动恢复、安全模式触发
//! - **observability**: tracing 初始化

pub mod backup;
pub mod config;
pub mod connector;
pub mod control;
pub mod core;
pub mod observability;
pub mod resilience;
pub mod store;

pub use crate::core::{Orchestrator, OrchestratorBuilder, TaskKind, TaskPacket, TaskStatus};
