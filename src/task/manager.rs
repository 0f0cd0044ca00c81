use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::config::TasksConfig;
use crate::error::Result;
use crate::task::{Executor, NewTask, Task, TaskEngine, TaskKind, TaskState, TaskStats, TaskStore};

/// 四类任务各自的执行函数
#[derive(Clone)]
pub struct Executors {
    pub download: Arc<dyn Executor>,
    pub upload: Arc<dyn Executor>,
    pub transfer: Arc<dyn Executor>,
    pub copy: Arc<dyn Executor>,
}

impl Executors {
    /// 四类任务共用同一个执行函数
    pub fn uniform(executor: Arc<dyn Executor>) -> Self {
        Self {
            download: Arc::clone(&executor),
            upload: Arc::clone(&executor),
            transfer: Arc::clone(&executor),
            copy: executor,
        }
    }

    pub fn get(&self, kind: TaskKind) -> Arc<dyn Executor> {
        match kind {
            TaskKind::Download => Arc::clone(&self.download),
            TaskKind::Upload => Arc::clone(&self.upload),
            TaskKind::Transfer => Arc::clone(&self.transfer),
            TaskKind::Copy => Arc::clone(&self.copy),
        }
    }
}

/// 持有四个相互独立的任务引擎
///
/// 某一类的队列满或 worker 阻塞不会影响其它类。
#[derive(Debug)]
pub struct TaskManager {
    download: TaskEngine,
    upload: TaskEngine,
    transfer: TaskEngine,
    copy: TaskEngine,
    grace: Duration,
}

impl TaskManager {
    /// 依次恢复并启动四个引擎，共用同一个存储
    pub async fn start(
        config: &TasksConfig,
        executors: Executors,
        store: Arc<dyn TaskStore>,
    ) -> Result<Self> {
        let start = |kind: TaskKind| {
            TaskEngine::start(
                kind,
                config.queue(kind),
                executors.get(kind),
                Arc::clone(&store),
            )
        };
        let manager = Self {
            download: start(TaskKind::Download).await?,
            upload: start(TaskKind::Upload).await?,
            transfer: start(TaskKind::Transfer).await?,
            copy: start(TaskKind::Copy).await?,
            grace: config.shutdown_grace(),
        };
        info!("任务管理器已启动");
        Ok(manager)
    }

    pub fn engine(&self, kind: TaskKind) -> &TaskEngine {
        match kind {
            TaskKind::Download => &self.download,
            TaskKind::Upload => &self.upload,
            TaskKind::Transfer => &self.transfer,
            TaskKind::Copy => &self.copy,
        }
    }

    pub async fn submit(&self, kind: TaskKind, new_task: NewTask) -> Result<String> {
        self.engine(kind).submit(new_task).await
    }

    pub async fn try_submit(&self, kind: TaskKind, new_task: NewTask) -> Result<String> {
        self.engine(kind).try_submit(new_task).await
    }

    pub async fn cancel(&self, kind: TaskKind, id: &str) -> Result<TaskState> {
        self.engine(kind).cancel(id).await
    }

    pub async fn delete(&self, kind: TaskKind, id: &str) -> Result<Task> {
        self.engine(kind).delete(id).await
    }

    pub async fn clear_done(&self, kind: TaskKind) -> Result<usize> {
        self.engine(kind).clear_done().await
    }

    pub fn get(&self, kind: TaskKind, id: &str) -> Option<Task> {
        self.engine(kind).get(id)
    }

    pub fn list_undone(&self, kind: TaskKind) -> Vec<Task> {
        self.engine(kind).list_undone()
    }

    pub fn list_done(&self, kind: TaskKind) -> Vec<Task> {
        self.engine(kind).list_done()
    }

    pub fn stats(&self) -> Vec<TaskStats> {
        TaskKind::ALL
            .iter()
            .map(|kind| self.engine(*kind).stats())
            .collect()
    }

    /// 四个引擎同时关闭，共用同一个等待时间
    pub async fn shutdown(&self) {
        info!("正在关闭任务管理器，最多等待 {:?}", self.grace);
        futures::future::join_all(
            TaskKind::ALL
                .iter()
                .map(|kind| self.engine(*kind).shutdown(self.grace)),
        )
        .await;
        for stats in self.stats() {
            info!("{}", stats);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QueueConfig;
    use crate::error::EngineError;
    use crate::task::{MemoryTaskStore, Outcome, TaskContext};
    use serde_json::json;

    fn config() -> TasksConfig {
        TasksConfig {
            download: QueueConfig::new(1, 1, 0),
            upload: QueueConfig::new(1, 4, 0),
            transfer: QueueConfig::new(1, 4, 0),
            copy: QueueConfig::new(1, 4, 0),
            shutdown_grace_secs: 1,
        }
    }

    async fn wait_until(manager: &TaskManager, kind: TaskKind, id: &str, state: TaskState) {
        for _ in 0..500 {
            if manager.get(kind, id).map(|t| t.state) == Some(state) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("{} task {} never reached {}", kind, id, state);
    }

    #[tokio::test]
    async fn test_kinds_are_independent() {
        let blocking: Arc<dyn Executor> = Arc::new(|ctx: TaskContext| async move {
            ctx.canceled().await;
            anyhow::Ok(Outcome::Canceled)
        });
        let quick: Arc<dyn Executor> =
            Arc::new(|_ctx: TaskContext| async { anyhow::Ok(Outcome::Completed) });
        let executors = Executors {
            download: blocking,
            upload: Arc::clone(&quick),
            transfer: Arc::clone(&quick),
            copy: quick,
        };
        let manager = TaskManager::start(&config(), executors, Arc::new(MemoryTaskStore::new()))
            .await
            .unwrap();

        // 下载队列被占满
        let running = manager
            .submit(TaskKind::Download, NewTask::new("d1", json!({})))
            .await
            .unwrap();
        wait_until(&manager, TaskKind::Download, &running, TaskState::Running).await;
        manager
            .submit(TaskKind::Download, NewTask::new("d2", json!({})))
            .await
            .unwrap();
        assert!(matches!(
            manager
                .try_submit(TaskKind::Download, NewTask::new("d3", json!({})))
                .await,
            Err(EngineError::QueueFull(TaskKind::Download))
        ));

        // 复制任务照常执行
        let copy = manager
            .submit(TaskKind::Copy, NewTask::new("c1", json!({})))
            .await
            .unwrap();
        wait_until(&manager, TaskKind::Copy, &copy, TaskState::Succeeded).await;
        assert!(manager.get(TaskKind::Download, &copy).is_none());

        let stats = manager.stats();
        assert_eq!(stats.len(), 4);
        assert_eq!(stats[0].kind, TaskKind::Download);
        assert_eq!((stats[0].running, stats[0].pending), (1, 1));
        assert_eq!(stats[3].succeeded, 1);

        manager.cancel(TaskKind::Download, &running).await.unwrap();
        wait_until(&manager, TaskKind::Download, &running, TaskState::Canceled).await;
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_route_alias_reaches_download_engine() {
        let quick: Arc<dyn Executor> =
            Arc::new(|_ctx: TaskContext| async { anyhow::Ok(Outcome::Completed) });
        let manager = TaskManager::start(
            &config(),
            Executors::uniform(quick),
            Arc::new(MemoryTaskStore::new()),
        )
        .await
        .unwrap();

        let kind: TaskKind = "down".parse().unwrap();
        let id = manager.submit(kind, NewTask::new("d", json!({}))).await.unwrap();
        wait_until(&manager, TaskKind::Download, &id, TaskState::Succeeded).await;
        assert_eq!(manager.clear_done(TaskKind::Download).await.unwrap(), 1);
        assert!(manager.list_done(TaskKind::Download).is_empty());
        manager.shutdown().await;
    }
}
