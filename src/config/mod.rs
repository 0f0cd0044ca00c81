use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

use crate::error::{EngineError, Result};
use crate::task::TaskKind;

/// 单个任务队列的配置
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// 并发 worker 数
    pub workers: usize,
    /// 等待队列容量，满了之后 submit 会阻塞
    pub capacity: usize,
    /// 最大重试次数
    pub max_retries: u32,
}

impl QueueConfig {
    pub fn new(workers: usize, capacity: usize, max_retries: u32) -> Self {
        Self {
            workers,
            capacity,
            max_retries,
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self::new(5, 256, 1)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TasksConfig {
    pub download: QueueConfig,
    pub upload: QueueConfig,
    pub transfer: QueueConfig,
    pub copy: QueueConfig,
    /// 关闭时等待运行中任务的时间
    pub shutdown_grace_secs: u64,
}

impl Default for TasksConfig {
    fn default() -> Self {
        Self {
            download: QueueConfig::new(5, 256, 1),
            upload: QueueConfig::new(5, 256, 0),
            transfer: QueueConfig::new(5, 256, 2),
            copy: QueueConfig::new(5, 256, 2),
            shutdown_grace_secs: 10,
        }
    }
}

impl TasksConfig {
    pub fn queue(&self, kind: TaskKind) -> QueueConfig {
        match kind {
            TaskKind::Download => self.download,
            TaskKind::Upload => self.upload,
            TaskKind::Transfer => self.transfer,
            TaskKind::Copy => self.copy,
        }
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

/// 任务持久化后端
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StoreConfig {
    Memory,
    File { dir: PathBuf },
    Postgres { url: String },
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig::File {
            dir: PathBuf::from("data/tasks"),
        }
    }
}

/// 启动时挂载的存储
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageConfig {
    pub driver: String,
    pub mount_path: String,
    #[serde(default)]
    pub order: i32,
    #[serde(default)]
    pub disabled: bool,
    #[serde(default)]
    pub additional: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub log_level: String,
    pub tasks: TasksConfig,
    pub store: StoreConfig,
    pub storages: Vec<StorageConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            tasks: TasksConfig::default(),
            store: StoreConfig::default(),
            storages: Vec::new(),
        }
    }
}

impl Config {
    /// 读取配置文件，不存在时写出默认配置
    ///
    /// 已存在的文件会按当前结构重新写回，新增字段因此出现在文件里。
    pub fn load_or_create(path: &Path) -> Result<Self> {
        info!("读取配置文件: {:?}", path);
        let config = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            serde_json::from_str::<Config>(&content)?
        } else {
            info!("配置文件不存在，创建默认配置");
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            Config::default()
        };

        std::fs::write(path, serde_json::to_string_pretty(&config)?)?;
        config.validate()?;
        Ok(config)
    }

    /// worker 数或队列容量为 0 属于启动期的致命配置错误
    pub fn validate(&self) -> Result<()> {
        for kind in TaskKind::ALL {
            let queue = self.tasks.queue(kind);
            if queue.workers == 0 {
                return Err(EngineError::Misconfigured(format!(
                    "{} queue needs at least one worker",
                    kind
                )));
            }
            if queue.capacity == 0 {
                return Err(EngineError::Misconfigured(format!(
                    "{} queue capacity must be positive",
                    kind
                )));
            }
        }
        Ok(())
    }
}
