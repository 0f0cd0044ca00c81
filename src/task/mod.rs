//! 后台任务：下载、上传、中转、复制四类，各自独立排队和追踪

pub mod engine;
pub mod manager;
pub mod registry;
pub mod store;

use std::fmt;
use std::future::Future;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::error::{EngineError, Result};

pub use engine::TaskEngine;
pub use manager::{Executors, TaskManager};
pub use registry::{TaskRegistry, TaskStats};
pub use store::{FileTaskStore, MemoryTaskStore, PgTaskStore, TaskStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskKind {
    Download,
    Upload,
    Transfer,
    Copy,
}

impl TaskKind {
    pub const ALL: [TaskKind; 4] = [
        TaskKind::Download,
        TaskKind::Upload,
        TaskKind::Transfer,
        TaskKind::Copy,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::Download => "download",
            TaskKind::Upload => "upload",
            TaskKind::Transfer => "transfer",
            TaskKind::Copy => "copy",
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskKind {
    type Err = EngineError;

    /// 接受管理接口路由中的写法，`down` 是 `download` 的别名
    fn from_str(s: &str) -> Result<Self> {
        match s {
            "download" | "down" => Ok(TaskKind::Download),
            "upload" => Ok(TaskKind::Upload),
            "transfer" => Ok(TaskKind::Transfer),
            "copy" => Ok(TaskKind::Copy),
            other => Err(EngineError::UnknownTaskKind(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    Pending,
    Running,
    Succeeded,
    Failed,
    Canceled,
}

impl TaskState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Pending => "pending",
            TaskState::Running => "running",
            TaskState::Succeeded => "succeeded",
            TaskState::Failed => "failed",
            TaskState::Canceled => "canceled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Succeeded | TaskState::Failed | TaskState::Canceled
        )
    }

    pub fn is_undone(&self) -> bool {
        !self.is_terminal()
    }

    /// 状态机允许的迁移
    pub fn can_transition_to(&self, next: TaskState) -> bool {
        use TaskState::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Canceled)
                | (Running, Succeeded)
                | (Running, Failed)
                | (Running, Canceled)
                | (Failed, Pending)
        )
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 提交任务时的参数
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NewTask {
    /// 展示用的任务描述，例如 `copy [/a/1.txt](/b)`
    pub name: String,
    /// 交给执行函数的参数，对引擎不透明
    #[serde(default)]
    pub params: Value,
}

impl NewTask {
    pub fn new(name: impl Into<String>, params: Value) -> Self {
        Self {
            name: name.into(),
            params,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub kind: TaskKind,
    pub name: String,
    #[serde(default)]
    pub params: Value,
    pub state: TaskState,
    /// 进度（比例或字节数），只增不减
    pub progress: f64,
    /// 仅在 failed 状态下有值
    pub error: Option<String>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Task {
    pub fn new(kind: TaskKind, new_task: NewTask, max_retries: u32) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind,
            name: new_task.name,
            params: new_task.params,
            state: TaskState::Pending,
            progress: 0.0,
            error: None,
            retry_count: 0,
            max_retries,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }

    /// 按状态机迁移，非法迁移返回错误且不修改任务
    pub fn transition(&mut self, next: TaskState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(EngineError::IllegalTransition {
                from: self.state,
                to: next,
            });
        }
        let now = Utc::now();
        match next {
            TaskState::Pending => {
                self.error = None;
                self.started_at = None;
                self.finished_at = None;
            }
            TaskState::Running => self.started_at = Some(now),
            TaskState::Succeeded | TaskState::Failed | TaskState::Canceled => {
                self.finished_at = Some(now)
            }
        }
        self.state = next;
        Ok(())
    }

    /// 记录失败，`error` 只在 failed 状态下出现
    pub fn fail(&mut self, error: impl Into<String>) -> Result<()> {
        self.transition(TaskState::Failed)?;
        self.error = Some(error.into());
        Ok(())
    }

    pub fn set_progress(&mut self, progress: f64) {
        if progress.is_finite() && progress > self.progress {
            self.progress = progress;
        }
    }
}

/// 执行函数的结果：正常完成，或观察到取消信号后提前返回
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Completed,
    Canceled,
}

/// 交给执行函数的上下文
#[derive(Debug, Clone)]
pub struct TaskContext {
    task: Task,
    cancel: CancellationToken,
    registry: TaskRegistry,
}

impl TaskContext {
    pub(crate) fn new(task: Task, cancel: CancellationToken, registry: TaskRegistry) -> Self {
        Self {
            task,
            cancel,
            registry,
        }
    }

    pub fn id(&self) -> &str {
        &self.task.id
    }

    pub fn kind(&self) -> TaskKind {
        self.task.kind
    }

    pub fn name(&self) -> &str {
        &self.task.name
    }

    pub fn params(&self) -> &Value {
        &self.task.params
    }

    /// 本次执行开始时的任务快照
    pub fn task(&self) -> &Task {
        &self.task
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_canceled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// 等待取消信号，适合放进 `tokio::select!`
    pub async fn canceled(&self) {
        self.cancel.cancelled().await
    }

    /// 只在任务运行期间生效，结束后的更新被忽略
    pub fn set_progress(&self, progress: f64) {
        self.registry.update(&self.task.id, |task| {
            if task.state == TaskState::Running {
                task.set_progress(progress);
            }
        });
    }
}

/// 每类任务由外部提供的执行函数
///
/// 取消是协作式的：执行函数需要在安全点检查取消信号并返回
/// [`Outcome::Canceled`]，引擎不会强行中断正在进行的 I/O。
#[async_trait]
pub trait Executor: Send + Sync {
    async fn execute(&self, ctx: TaskContext) -> anyhow::Result<Outcome>;
}

#[async_trait]
impl<F, Fut> Executor for F
where
    F: Fn(TaskContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Outcome>> + Send + 'static,
{
    async fn execute(&self, ctx: TaskContext) -> anyhow::Result<Outcome> {
        (self)(ctx).await
    }
}
