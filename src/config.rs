//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `SWITCHYARD__*` 覆盖
//! （双下划线表示嵌套，如 `SWITCHYARD__ENGINE__WORKERS=8`）。

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::connector::ConnectorSettings;
use crate::core::{ConnectorKind, EngineConfig};
use crate::resilience::{ResilienceConfig, DEFAULT_TRANSIENT_PATTERN};

/// 应用配置根
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub engine: EngineSection,
    pub storage: StorageSection,
    pub resilience: ResilienceSection,
    pub connectors: ConnectorsSection,
    /// `[[agents]]`：启动时注册的 Agent
    pub agents: Vec<AgentSection>,
}

/// [engine] 段：worker 数量与各类间隔
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineSection {
    pub workers: usize,
    /// 派发后等待完成的上限（秒）
    pub task_timeout_secs: u64,
    pub poll_interval_ms: u64,
    pub pause_recheck_ms: u64,
    pub emergency_recheck_ms: u64,
    pub approval_recheck_ms: u64,
    /// 启动时是否把上次未完成的任务重新入队
    pub requeue_on_start: bool,
    /// 关闭时每个清理步骤的超时（秒）
    pub shutdown_timeout_secs: u64,
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            workers: 5,
            task_timeout_secs: 300,
            poll_interval_ms: 2000,
            pause_recheck_ms: 1000,
            emergency_recheck_ms: 5000,
            approval_recheck_ms: 5000,
            requeue_on_start: false,
            shutdown_timeout_secs: 10,
        }
    }
}

impl EngineSection {
    pub fn to_engine_config(&self) -> EngineConfig {
        EngineConfig {
            workers: self.workers.max(1),
            task_timeout: Duration::from_secs(self.task_timeout_secs),
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            pause_recheck: Duration::from_millis(self.pause_recheck_ms),
            emergency_recheck: Duration::from_millis(self.emergency_recheck_ms),
            approval_recheck: Duration::from_millis(self.approval_recheck_ms),
        }
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

/// [storage] 段：状态目录与备份目录
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageSection {
    pub state_dir: PathBuf,
    pub backup_dir: PathBuf,
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from("data/state"),
            backup_dir: PathBuf::from("data/backups"),
        }
    }
}

/// [resilience] 段：阈值与周期扫描
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ResilienceSection {
    pub agent_failure_threshold: usize,
    pub safe_mode_pattern_threshold: usize,
    /// 0 表示不启用周期扫描
    pub sweep_interval_secs: u64,
    pub transient_pattern: String,
}

impl Default for ResilienceSection {
    fn default() -> Self {
        Self {
            agent_failure_threshold: 5,
            safe_mode_pattern_threshold: 2,
            sweep_interval_secs: 0,
            transient_pattern: DEFAULT_TRANSIENT_PATTERN.to_string(),
        }
    }
}

impl ResilienceSection {
    pub fn to_resilience_config(&self) -> ResilienceConfig {
        ResilienceConfig {
            agent_failure_threshold: self.agent_failure_threshold,
            safe_mode_pattern_threshold: self.safe_mode_pattern_threshold,
            transient_pattern: self.transient_pattern.clone(),
        }
    }

    pub fn sweep_interval(&self) -> Option<Duration> {
        (self.sweep_interval_secs > 0).then(|| Duration::from_secs(self.sweep_interval_secs))
    }
}

/// [connectors] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConnectorsSection {
    pub remote_timeout_secs: u64,
    /// 模拟 Agent 未单独配置 delay_ms 时的完成延迟
    pub simulated_delay_ms: u64,
}

impl Default for ConnectorsSection {
    fn default() -> Self {
        Self {
            remote_timeout_secs: 10,
            simulated_delay_ms: 2000,
        }
    }
}

impl ConnectorsSection {
    pub fn settings(&self) -> ConnectorSettings {
        ConnectorSettings {
            remote_timeout: Duration::from_secs(self.remote_timeout_secs),
            simulated_delay: Duration::from_millis(self.simulated_delay_ms),
        }
    }
}

/// [[agents]] 条目
#[derive(Debug, Clone, Deserialize)]
pub struct AgentSection {
    pub name: String,
    pub kind: ConnectorKind,
    /// remote 必填
    #[serde(default)]
    pub endpoint: Option<String>,
    /// 仅 simulated 使用
    #[serde(default)]
    pub delay_ms: Option<u64>,
}

/// 从 config 目录加载配置，环境变量 SWITCHYARD__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    for name in ["config/default", "../config/default"] {
        if std::path::Path::new(&format!("{name}.toml")).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path).required(false));
        } else {
            tracing::warn!(path = %path.display(), "Config file not found, ignoring");
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("SWITCHYARD")
            .separator("__")
            .try_parsing(true),
    );

    builder.build()?.try_deserialize()
}
