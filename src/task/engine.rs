//! 通用任务引擎：有界 FIFO 队列 + 固定大小的 worker 池
//!
//! 每类任务各自实例化一个引擎，互不影响。

use std::any::Any;
use std::collections::VecDeque;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::{Notify, Semaphore, TryAcquireError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::QueueConfig;
use crate::error::{EngineError, Result};
use crate::task::{
    Executor, NewTask, Outcome, Task, TaskContext, TaskKind, TaskRegistry, TaskState, TaskStats,
    TaskStore,
};

/// 队列中的一项；`holds_slot` 表示它占用了一个容量名额
#[derive(Debug)]
struct Queued {
    id: String,
    holds_slot: bool,
}

/// 取消操作的结果
enum CancelAction {
    /// pending 任务待取消，附带取消后的快照
    Dequeue(Task),
    /// 已向运行中的任务发出取消信号
    Signaled,
    /// 任务已结束，保持原状态
    Unchanged(TaskState),
}

struct EngineInner {
    kind: TaskKind,
    config: QueueConfig,
    executor: Arc<dyn Executor>,
    registry: TaskRegistry,
    store: Arc<dyn TaskStore>,
    queue: Mutex<VecDeque<Queued>>,
    /// 队列容量
    slots: Semaphore,
    ready: Notify,
    shutdown: CancellationToken,
}

pub struct TaskEngine {
    inner: Arc<EngineInner>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl fmt::Debug for TaskEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskEngine")
            .field("kind", &self.inner.kind)
            .field("config", &self.inner.config)
            .field("queued", &self.queued())
            .finish()
    }
}

impl TaskEngine {
    /// 从存储恢复任务并启动 worker
    ///
    /// worker 数或容量为 0 时返回 `Misconfigured`。
    pub async fn start(
        kind: TaskKind,
        config: QueueConfig,
        executor: Arc<dyn Executor>,
        store: Arc<dyn TaskStore>,
    ) -> Result<Self> {
        if config.workers == 0 {
            return Err(EngineError::Misconfigured(format!(
                "{} queue needs at least one worker",
                kind
            )));
        }
        if config.capacity == 0 {
            return Err(EngineError::Misconfigured(format!(
                "{} queue capacity must be positive",
                kind
            )));
        }

        let inner = Arc::new(EngineInner {
            kind,
            config,
            executor,
            registry: TaskRegistry::new(kind),
            store,
            queue: Mutex::new(VecDeque::new()),
            slots: Semaphore::new(config.capacity),
            ready: Notify::new(),
            shutdown: CancellationToken::new(),
        });
        inner.rehydrate().await?;

        let workers = (0..config.workers)
            .map(|n| tokio::spawn(run_worker(Arc::clone(&inner), n)))
            .collect();

        info!(
            "{} 任务引擎启动: workers={}, capacity={}, max_retries={}",
            kind, config.workers, config.capacity, config.max_retries
        );
        Ok(Self {
            inner,
            workers: Mutex::new(workers),
        })
    }

    pub fn kind(&self) -> TaskKind {
        self.inner.kind
    }

    pub fn config(&self) -> QueueConfig {
        self.inner.config
    }

    pub fn registry(&self) -> &TaskRegistry {
        &self.inner.registry
    }

    /// 提交任务，队列满时等待空位
    pub async fn submit(&self, new_task: NewTask) -> Result<String> {
        let permit = self
            .inner
            .slots
            .acquire()
            .await
            .map_err(|_| EngineError::ShuttingDown(self.inner.kind))?;
        let id = self.inner.admit(new_task).await?;
        // 名额随队列项转移，出队时归还
        permit.forget();
        Ok(id)
    }

    /// 非阻塞提交，队列满时返回 `QueueFull`
    pub async fn try_submit(&self, new_task: NewTask) -> Result<String> {
        let permit = match self.inner.slots.try_acquire() {
            Ok(permit) => permit,
            Err(TryAcquireError::NoPermits) => {
                return Err(EngineError::QueueFull(self.inner.kind))
            }
            Err(TryAcquireError::Closed) => {
                return Err(EngineError::ShuttingDown(self.inner.kind))
            }
        };
        let id = self.inner.admit(new_task).await?;
        permit.forget();
        Ok(id)
    }

    /// 取消任务，返回操作之后的状态
    ///
    /// pending 直接变为 canceled，执行函数不会被调用；running 只发出取消
    /// 信号并立即返回，等执行函数自行退出后才变为 canceled；已结束的任务不变。
    /// pending 任务的取消先写入存储，写入失败时任务保持 pending 且仍在队列中。
    pub async fn cancel(&self, id: &str) -> Result<TaskState> {
        let inner = &self.inner;
        let lock = inner
            .registry
            .persist_lock(id)
            .ok_or_else(|| inner.not_found(id))?;
        let _guard = lock.lock().await;

        let action = inner
            .registry
            .update_with_token(id, |task, token| match task.state {
                TaskState::Pending => {
                    let mut canceled = task.clone();
                    canceled
                        .transition(TaskState::Canceled)
                        .map(|_| CancelAction::Dequeue(canceled))
                }
                TaskState::Running => {
                    token.cancel();
                    Ok(CancelAction::Signaled)
                }
                state => Ok(CancelAction::Unchanged(state)),
            })
            .ok_or_else(|| inner.not_found(id))??;

        let canceled = match action {
            CancelAction::Dequeue(canceled) => canceled,
            CancelAction::Signaled => {
                info!("已向运行中的 {} 任务 {} 发出取消信号", inner.kind, id);
                return Ok(TaskState::Running);
            }
            CancelAction::Unchanged(state) => {
                debug!("{} 任务 {} 已经是 {}，忽略取消", inner.kind, id, state);
                return Ok(state);
            }
        };

        // 先出队，避免写入期间被 worker 取走
        let taken = inner.take_queued(id);
        if let Err(e) = inner.store.save(&canceled).await {
            if let Some((pos, queued)) = taken {
                inner.restore_queued(pos, queued);
            }
            error!("取消 {} 任务 {} 时写入存储失败: {}", inner.kind, id, e);
            return Err(e);
        }
        if let Some((_, queued)) = taken {
            inner.release(queued);
        }

        // 写入期间 worker 可能已经开始执行；它随后的持久化会覆盖这次写入
        let state = inner
            .registry
            .update_with_token(id, |task, token| {
                if task.state == TaskState::Pending {
                    *task = canceled;
                    TaskState::Canceled
                } else {
                    token.cancel();
                    task.state
                }
            })
            .ok_or_else(|| inner.not_found(id))?;
        info!("取消等待中的 {} 任务 {}: {}", inner.kind, id, state);
        Ok(state)
    }

    /// 删除已结束的任务；pending/running 返回 `TaskRunning` 且不做任何修改
    ///
    /// 先从存储删除，成功后才移出注册表，失败时可以直接重试。
    pub async fn delete(&self, id: &str) -> Result<Task> {
        let inner = &self.inner;
        let lock = inner.registry.terminal_lock(id)?;
        let _guard = lock.lock().await;
        inner.store.remove(inner.kind, id).await?;
        let task = inner.registry.remove_terminal(id)?;
        info!("删除 {} 任务 {} ({})", inner.kind, id, task.state);
        Ok(task)
    }

    /// 清理全部已结束的任务，返回清理数量
    ///
    /// 逐个从存储删除，只有删除成功的任务才会移出注册表。
    pub async fn clear_done(&self) -> Result<usize> {
        let inner = &self.inner;
        let mut cleared = 0;
        let mut first_error = None;
        for task in inner.registry.list_done() {
            let Ok(lock) = inner.registry.terminal_lock(&task.id) else {
                continue;
            };
            let _guard = lock.lock().await;
            match inner.store.remove(inner.kind, &task.id).await {
                Ok(()) => {
                    if inner.registry.remove_terminal(&task.id).is_ok() {
                        cleared += 1;
                    }
                }
                Err(e) => {
                    error!("从存储删除 {} 任务 {} 失败: {}", inner.kind, task.id, e);
                    first_error.get_or_insert(e);
                }
            }
        }
        if cleared > 0 {
            info!("清理 {} 个已结束的 {} 任务", cleared, inner.kind);
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(cleared),
        }
    }

    pub fn get(&self, id: &str) -> Option<Task> {
        self.inner.registry.get(id)
    }

    /// pending 与 running 的任务，按创建顺序
    pub fn list_undone(&self) -> Vec<Task> {
        self.inner.registry.list_undone()
    }

    /// 已结束的任务，按创建顺序
    pub fn list_done(&self) -> Vec<Task> {
        self.inner.registry.list_done()
    }

    pub fn stats(&self) -> TaskStats {
        self.inner.registry.stats()
    }

    /// 队列中等待 worker 的任务数
    pub fn queued(&self) -> usize {
        self.inner.queue.lock().len()
    }

    /// 停止出队并拒绝新提交，最多等待 `grace` 让运行中的任务结束
    ///
    /// 超时后直接中止 worker；仍为 running 的任务会在下次启动时被标记为失败。
    pub async fn shutdown(&self, grace: Duration) {
        let inner = &self.inner;
        inner.shutdown.cancel();
        inner.slots.close();

        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.workers.lock());
        if handles.is_empty() {
            return;
        }
        let aborts: Vec<_> = handles.iter().map(|h| h.abort_handle()).collect();

        match tokio::time::timeout(grace, futures::future::join_all(handles)).await {
            Ok(_) => info!("{} 任务引擎已停止", inner.kind),
            Err(_) => {
                warn!(
                    "{} 任务引擎等待超时 ({:?})，中止 {} 个 worker",
                    inner.kind,
                    grace,
                    aborts.len()
                );
                for abort in aborts {
                    abort.abort();
                }
            }
        }
    }
}

impl Drop for TaskEngine {
    fn drop(&mut self) {
        // 空闲 worker 立即退出，运行中的执行完当前任务后退出
        self.inner.shutdown.cancel();
    }
}

impl EngineInner {
    fn not_found(&self, id: &str) -> EngineError {
        EngineError::TaskNotFound {
            kind: self.kind,
            id: id.to_string(),
        }
    }

    /// 登记、持久化并入队；调用方已经取得容量名额
    async fn admit(&self, new_task: NewTask) -> Result<String> {
        if self.shutdown.is_cancelled() {
            return Err(EngineError::ShuttingDown(self.kind));
        }

        let task = Task::new(self.kind, new_task, self.config.max_retries);
        let id = task.id.clone();
        let name = task.name.clone();
        self.registry.insert(task);
        if let Err(e) = self.persist(&id).await {
            self.registry.discard(&id);
            return Err(e);
        }

        self.enqueue(Queued {
            id: id.clone(),
            holds_slot: true,
        });
        info!("提交 {} 任务 {}: {}", self.kind, id, name);
        Ok(id)
    }

    fn enqueue(&self, queued: Queued) {
        self.queue.lock().push_back(queued);
        self.ready.notify_one();
    }

    /// 重试或恢复的任务排到队尾；有空余名额就占用，没有也照样入队
    fn requeue(&self, id: String) {
        let holds_slot = match self.slots.try_acquire() {
            Ok(permit) => {
                permit.forget();
                true
            }
            Err(_) => false,
        };
        self.enqueue(Queued { id, holds_slot });
    }

    fn dequeue(&self) -> Option<String> {
        let queued = self.queue.lock().pop_front()?;
        if queued.holds_slot {
            self.slots.add_permits(1);
        }
        Some(queued.id)
    }

    /// 从队列中取出指定任务，返回原位置
    fn take_queued(&self, id: &str) -> Option<(usize, Queued)> {
        let mut queue = self.queue.lock();
        let pos = queue.iter().position(|q| q.id == id)?;
        queue.remove(pos).map(|queued| (pos, queued))
    }

    fn restore_queued(&self, pos: usize, queued: Queued) {
        let mut queue = self.queue.lock();
        let pos = pos.min(queue.len());
        queue.insert(pos, queued);
        self.ready.notify_one();
    }

    /// 归还被取出任务占用的名额
    fn release(&self, queued: Queued) {
        if queued.holds_slot {
            self.slots.add_permits(1);
        }
    }

    /// 把注册表中的最新快照写入存储；同一任务的写入串行
    async fn persist(&self, id: &str) -> Result<()> {
        let Some(lock) = self.registry.persist_lock(id) else {
            return Ok(());
        };
        let _guard = lock.lock().await;
        match self.registry.get(id) {
            Some(task) => self.store.save(&task).await,
            // 已被删除
            None => Ok(()),
        }
    }

    async fn persist_logged(&self, id: &str) {
        if let Err(e) = self.persist(id).await {
            error!("持久化 {} 任务 {} 失败: {}", self.kind, id, e);
        }
    }

    /// 启动时从存储恢复：running 改为 failed，pending 重新入队
    async fn rehydrate(&self) -> Result<()> {
        let tasks = self.store.load_all(self.kind).await?;
        let (mut requeued, mut interrupted) = (0usize, 0usize);

        for mut task in tasks {
            if task.kind != self.kind {
                warn!("忽略类型不符的任务 {} ({} != {})", task.id, task.kind, self.kind);
                continue;
            }
            let was_running = task.state == TaskState::Running;
            if was_running {
                task.fail(EngineError::RestartInterrupted.to_string())?;
            }
            let is_pending = task.state == TaskState::Pending;
            let id = task.id.clone();
            if !self.registry.insert(task) {
                warn!("忽略重复的 {} 任务 {}", self.kind, id);
                continue;
            }

            if was_running {
                interrupted += 1;
                self.persist(&id).await?;
            }
            if is_pending {
                requeued += 1;
                self.requeue(id);
            }
        }

        if !self.registry.is_empty() {
            info!(
                "恢复 {} 任务 {} 个: 重新排队 {}，因重启中断 {}",
                self.kind,
                self.registry.len(),
                requeued,
                interrupted
            );
        }
        Ok(())
    }

    async fn run_task(&self, id: &str) {
        let started = self
            .registry
            .update_with_token(id, |task, token| {
                if task.state != TaskState::Pending {
                    return None;
                }
                match task.transition(TaskState::Running) {
                    Ok(()) => Some((task.clone(), token.clone())),
                    Err(e) => {
                        error!("{} 任务 {} 无法开始: {}", self.kind, task.id, e);
                        None
                    }
                }
            })
            .flatten();
        let Some((task, token)) = started else {
            debug!("跳过已取消或已删除的 {} 任务 {}", self.kind, id);
            return;
        };

        info!(
            "开始执行 {} 任务 {} ({})，第 {} 次尝试",
            self.kind,
            id,
            task.name,
            task.retry_count + 1
        );
        self.persist_logged(id).await;

        let ctx = TaskContext::new(task, token.clone(), self.registry.clone());
        let result = AssertUnwindSafe(self.executor.execute(ctx))
            .catch_unwind()
            .await;
        let result = match result {
            Ok(Ok(outcome)) => Ok(outcome),
            Ok(Err(e)) => Err(format!("{:#}", e)),
            Err(panic) => Err(panic_message(panic)),
        };

        match result {
            Ok(Outcome::Completed) => self.finish(id, TaskState::Succeeded).await,
            Ok(Outcome::Canceled) => self.finish(id, TaskState::Canceled).await,
            Err(message) if token.is_cancelled() => {
                debug!("{} 任务 {} 取消后返回错误: {}", self.kind, id, message);
                self.finish(id, TaskState::Canceled).await
            }
            Err(message) => self.fail_or_retry(id, message).await,
        }
    }

    async fn finish(&self, id: &str, state: TaskState) {
        let result = self.registry.update(id, |task| task.transition(state));
        match result {
            Some(Ok(())) => info!("{} 任务 {} 结束: {}", self.kind, id, state),
            Some(Err(e)) => error!("{} 任务 {} 状态异常: {}", self.kind, id, e),
            None => warn!("{} 任务 {} 执行期间被移除", self.kind, id),
        }
        self.persist_logged(id).await;
    }

    /// 失败后重试计数加一，未达到上限时回到 pending 并排到队尾
    async fn fail_or_retry(&self, id: &str, message: String) {
        let error = EngineError::Execution(message).to_string();
        let result = self.registry.update(id, |task| -> Result<(bool, u32)> {
            task.retry_count += 1;
            task.fail(error.clone())?;
            if task.retry_count < task.max_retries {
                task.transition(TaskState::Pending)?;
                Ok((true, task.retry_count))
            } else {
                Ok((false, task.retry_count))
            }
        });

        let retry = match result {
            Some(Ok((true, count))) => {
                warn!("{} 任务 {} 失败，第 {} 次重试: {}", self.kind, id, count, error);
                true
            }
            Some(Ok((false, count))) => {
                error!("{} 任务 {} 失败（已重试 {} 次）: {}", self.kind, id, count, error);
                false
            }
            Some(Err(e)) => {
                error!("{} 任务 {} 状态异常: {}", self.kind, id, e);
                false
            }
            None => false,
        };

        self.persist_logged(id).await;
        if retry {
            self.requeue(id.to_string());
        }
    }
}

async fn run_worker(inner: Arc<EngineInner>, worker: usize) {
    debug!("{} worker {} 启动", inner.kind, worker);
    loop {
        if inner.shutdown.is_cancelled() {
            break;
        }
        let id = match inner.dequeue() {
            Some(id) => id,
            None => {
                tokio::select! {
                    biased;
                    _ = inner.shutdown.cancelled() => break,
                    _ = inner.ready.notified() => {}
                }
                continue;
            }
        };
        inner.run_task(&id).await;
    }
    debug!("{} worker {} 退出", inner.kind, worker);
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("executor panicked: {}", s)
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("executor panicked: {}", s)
    } else {
        "executor panicked".to_string()
    }
}
