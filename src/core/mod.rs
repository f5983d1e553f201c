//! 核心编排层：任务模型、错误分类、队列、引擎、装配与关闭

pub mod builder;
pub mod engine;
pub mod error;
pub mod queue;
pub mod shutdown;
pub mod task;

pub use builder::{BuildError, Orchestrator, OrchestratorBuilder};
pub use engine::{EngineConfig, OrchestrationEngine};
pub use error::OrchestrationError;
pub use queue::TaskQueue;
pub use shutdown::{ShutdownCoordinator, ShutdownManager, ShutdownReason};
pub use task::{AgentRegistration, ConnectorKind, TaskId, TaskKind, TaskPacket, TaskStatus};
