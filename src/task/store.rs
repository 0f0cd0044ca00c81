use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::Row;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::Result;
use crate::lock::StoreLock;
use crate::task::{Task, TaskKind};

/// 任务持久化接口
///
/// 调用方在 `save`/`remove` 返回之后才会向外报告操作完成，
/// 实现需要保证此时数据已经落盘。
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// 按 id 插入或覆盖
    async fn save(&self, task: &Task) -> Result<()>;

    /// 按创建顺序返回某一类的全部任务，启动时调用一次
    async fn load_all(&self, kind: TaskKind) -> Result<Vec<Task>>;

    async fn remove(&self, kind: TaskKind, id: &str) -> Result<()>;
}

fn upsert(tasks: &mut Vec<Task>, task: &Task) {
    match tasks.iter_mut().find(|t| t.id == task.id) {
        Some(existing) => *existing = task.clone(),
        None => tasks.push(task.clone()),
    }
}

/// 进程内存储，测试和不需要持久化的部署使用
#[derive(Debug, Default)]
pub struct MemoryTaskStore {
    tasks: Mutex<HashMap<TaskKind, Vec<Task>>>,
}

impl MemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TaskStore for MemoryTaskStore {
    async fn save(&self, task: &Task) -> Result<()> {
        let mut tasks = self.tasks.lock().await;
        upsert(tasks.entry(task.kind).or_default(), task);
        Ok(())
    }

    async fn load_all(&self, kind: TaskKind) -> Result<Vec<Task>> {
        let tasks = self.tasks.lock().await;
        Ok(tasks.get(&kind).cloned().unwrap_or_default())
    }

    async fn remove(&self, kind: TaskKind, id: &str) -> Result<()> {
        let mut tasks = self.tasks.lock().await;
        if let Some(list) = tasks.get_mut(&kind) {
            list.retain(|t| t.id != id);
        }
        Ok(())
    }
}

/// 每类任务一个 JSON 文件
///
/// 写入先落到临时文件再重命名；目录由 [`StoreLock`] 独占，
/// 避免两个进程同时恢复并改写同一批任务。
#[derive(Debug)]
pub struct FileTaskStore {
    dir: PathBuf,
    tasks: Mutex<HashMap<TaskKind, Vec<Task>>>,
    _lock: StoreLock,
}

impl FileTaskStore {
    /// 打开存储目录，`force` 为 true 时清理已有的锁
    pub fn open(dir: impl Into<PathBuf>, force: bool) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;

        let mut lock = StoreLock::new(&dir);
        if force {
            lock.force_lock()?;
        } else {
            lock.try_lock()?;
        }

        info!("打开任务存储目录: {:?}", dir);
        Ok(Self {
            dir,
            tasks: Mutex::new(HashMap::new()),
            _lock: lock,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn file_path(&self, kind: TaskKind) -> PathBuf {
        self.dir.join(format!("{}.json", kind))
    }

    async fn read_file(&self, kind: TaskKind) -> Result<Vec<Task>> {
        let path = self.file_path(kind);
        match tokio::fs::read_to_string(&path).await {
            Ok(content) => Ok(serde_json::from_str(&content)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_file(&self, kind: TaskKind, tasks: &[Task]) -> Result<()> {
        let path = self.file_path(kind);
        let tmp = path.with_extension("json.tmp");
        let json = serde_json::to_vec_pretty(tasks)?;

        let mut file = tokio::fs::File::create(&tmp).await?;
        tokio::io::AsyncWriteExt::write_all(&mut file, &json).await?;
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(&tmp, &path).await?;

        debug!("写入任务文件 {:?}: {} 条", path, tasks.len());
        Ok(())
    }

    /// 取得某类任务的缓存，首次访问时从磁盘读取
    async fn cached<'a>(
        &self,
        cache: &'a mut HashMap<TaskKind, Vec<Task>>,
        kind: TaskKind,
    ) -> Result<&'a mut Vec<Task>> {
        if !cache.contains_key(&kind) {
            let tasks = self.read_file(kind).await?;
            cache.insert(kind, tasks);
        }
        Ok(cache.entry(kind).or_default())
    }
}

#[async_trait]
impl TaskStore for FileTaskStore {
    async fn save(&self, task: &Task) -> Result<()> {
        let mut cache = self.tasks.lock().await;
        let tasks = self.cached(&mut cache, task.kind).await?;
        upsert(tasks, task);
        let snapshot = tasks.clone();
        self.write_file(task.kind, &snapshot).await
    }

    async fn load_all(&self, kind: TaskKind) -> Result<Vec<Task>> {
        let mut cache = self.tasks.lock().await;
        Ok(self.cached(&mut cache, kind).await?.clone())
    }

    async fn remove(&self, kind: TaskKind, id: &str) -> Result<()> {
        let mut cache = self.tasks.lock().await;
        let tasks = self.cached(&mut cache, kind).await?;
        let before = tasks.len();
        tasks.retain(|t| t.id != id);
        if tasks.len() == before {
            return Ok(());
        }
        let snapshot = tasks.clone();
        self.write_file(kind, &snapshot).await
    }
}

/// Postgres 存储，`seq` 列保留首次写入的顺序
#[derive(Debug, Clone)]
pub struct PgTaskStore {
    pool: PgPool,
}

impl PgTaskStore {
    pub async fn connect(url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new().max_connections(5).connect(url).await?;
        let store = Self::from_pool(pool);
        store.migrate().await?;
        info!("已连接任务数据库");
        Ok(store)
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> Result<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS unifs_tasks (
                seq BIGSERIAL,
                kind TEXT NOT NULL,
                id TEXT NOT NULL,
                body TEXT NOT NULL,
                PRIMARY KEY (kind, id)
            )",
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl TaskStore for PgTaskStore {
    async fn save(&self, task: &Task) -> Result<()> {
        let body = serde_json::to_string(task)?;
        sqlx::query(
            "INSERT INTO unifs_tasks (kind, id, body) VALUES ($1, $2, $3)
             ON CONFLICT (kind, id) DO UPDATE SET body = EXCLUDED.body",
        )
        .bind(task.kind.as_str())
        .bind(&task.id)
        .bind(body)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn load_all(&self, kind: TaskKind) -> Result<Vec<Task>> {
        let rows = sqlx::query("SELECT body FROM unifs_tasks WHERE kind = $1 ORDER BY seq")
            .bind(kind.as_str())
            .fetch_all(&self.pool)
            .await?;

        let mut tasks = Vec::with_capacity(rows.len());
        for row in rows {
            let body: String = row.try_get("body")?;
            tasks.push(serde_json::from_str(&body)?);
        }
        Ok(tasks)
    }

    async fn remove(&self, kind: TaskKind, id: &str) -> Result<()> {
        sqlx::query("DELETE FROM unifs_tasks WHERE kind = $1 AND id = $2")
            .bind(kind.as_str())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
