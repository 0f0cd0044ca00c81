//! 启动流程：读取配置后打开任务存储、挂载存储、启动任务引擎

use std::sync::Arc;

use tracing::{error, info};

use crate::config::{Config, StorageConfig, StoreConfig};
use crate::error::Result;
use crate::mount::MountTable;
use crate::storage::{ConfiguredStorage, Driver, StorageInstance, StorageStatus};
use crate::task::{
    Executors, FileTaskStore, MemoryTaskStore, PgTaskStore, TaskManager, TaskStore,
};

/// 按配置打开任务存储；`force_lock` 只对文件存储有效
pub async fn open_store(config: &StoreConfig, force_lock: bool) -> Result<Arc<dyn TaskStore>> {
    let store: Arc<dyn TaskStore> = match config {
        StoreConfig::Memory => {
            info!("使用内存任务存储，重启后任务不会保留");
            Arc::new(MemoryTaskStore::new())
        }
        StoreConfig::File { dir } => Arc::new(FileTaskStore::open(dir, force_lock)?),
        StoreConfig::Postgres { url } => Arc::new(PgTaskStore::connect(url).await?),
    };
    Ok(store)
}

#[derive(Debug)]
pub struct Runtime {
    config: Config,
    mounts: Arc<MountTable>,
    tasks: TaskManager,
    rejected: Vec<StorageInstance>,
}

impl Runtime {
    pub async fn start(config: Config, executors: Executors, force_lock: bool) -> Result<Self> {
        config.validate()?;
        let store = open_store(&config.store, force_lock).await?;

        let mounts = Arc::new(MountTable::new());
        let rejected = mount_storages(&mounts, &config.storages);
        info!(
            "已挂载 {} 个存储，{} 个挂载失败",
            mounts.len(),
            rejected.len()
        );

        let tasks = TaskManager::start(&config.tasks, executors, store).await?;
        Ok(Self {
            config,
            mounts,
            tasks,
            rejected,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn mounts(&self) -> &Arc<MountTable> {
        &self.mounts
    }

    pub fn tasks(&self) -> &TaskManager {
        &self.tasks
    }

    /// 注册失败的存储，状态为 errored
    pub fn rejected_storages(&self) -> &[StorageInstance] {
        &self.rejected
    }

    pub async fn shutdown(&self) {
        self.tasks.shutdown().await;
        info!("运行时已关闭");
    }
}

/// 逐个注册配置中的存储，返回注册失败的实例
pub fn mount_storages(mounts: &MountTable, storages: &[StorageConfig]) -> Vec<StorageInstance> {
    let mut rejected = Vec::new();
    for storage in storages {
        let driver = ConfiguredStorage::from(storage);
        if let Err(e) = mounts.register(Arc::new(driver.clone())) {
            error!(
                "挂载存储失败 {} ({}, order={}): {}",
                storage.mount_path, storage.driver, storage.order, e
            );
            rejected.push(driver.instance().clone().with_status(StorageStatus::Errored));
        }
    }
    rejected
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{NewTask, Outcome, TaskContext, TaskKind, TaskState};
    use serde_json::json;
    use std::time::Duration;
    use tempfile::TempDir;

    fn storage(mount_path: &str, order: i32) -> StorageConfig {
        StorageConfig {
            driver: "local".to_string(),
            mount_path: mount_path.to_string(),
            order,
            disabled: false,
            additional: json!({ "root_folder_path": "/srv" }),
        }
    }

    #[test]
    fn test_mount_storages_keeps_failures() {
        let mounts = MountTable::new();
        let rejected = mount_storages(
            &mounts,
            &[storage("/a", 0), storage("/a", 0), storage("/b", 1)],
        );

        assert_eq!(mounts.len(), 2);
        assert_eq!(rejected.len(), 1);
        assert_eq!(rejected[0].mount_path, "/a");
        assert_eq!(rejected[0].status, StorageStatus::Errored);

        let resolved = mounts.resolve("/b/x.txt").unwrap();
        assert_eq!(resolved.actual_path, "/srv/x.txt");
    }

    #[tokio::test]
    async fn test_runtime_start_and_shutdown() {
        let temp_dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.store = StoreConfig::File {
            dir: temp_dir.path().join("tasks"),
        };
        config.storages = vec![storage("/data", 0)];
        config.tasks.shutdown_grace_secs = 1;

        let runtime = Runtime::start(
            config,
            Executors::uniform(Arc::new(|_ctx: TaskContext| async {
                anyhow::Ok(Outcome::Completed)
            })),
            false,
        )
        .await
        .unwrap();
        assert!(runtime.rejected_storages().is_empty());
        assert_eq!(runtime.mounts().resolve("/data/f").unwrap().actual_path, "/srv/f");

        let id = runtime
            .tasks()
            .submit(TaskKind::Upload, NewTask::new("u", json!({})))
            .await
            .unwrap();
        for _ in 0..500 {
            if runtime.tasks().get(TaskKind::Upload, &id).map(|t| t.state)
                == Some(TaskState::Succeeded)
            {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(
            runtime.tasks().get(TaskKind::Upload, &id).unwrap().state,
            TaskState::Succeeded
        );
        runtime.shutdown().await;
    }

    #[tokio::test]
    async fn test_runtime_rejects_zero_capacity() {
        let mut config = Config::default();
        config.store = StoreConfig::Memory;
        config.tasks.download.capacity = 0;
        let result = Runtime::start(
            config,
            Executors::uniform(Arc::new(|_ctx: TaskContext| async {
                anyhow::Ok(Outcome::Completed)
            })),
            false,
        )
        .await;
        assert!(matches!(
            result,
            Err(crate::error::EngineError::Misconfigured(_))
        ));
    }
}
