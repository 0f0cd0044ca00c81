use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{EngineError, Result};
use crate::task::{Task, TaskKind, TaskState};

/// 注册表条目
#[derive(Debug)]
struct Entry {
    seq: u64,
    task: Task,
    /// 运行中任务的取消信号
    cancel: CancellationToken,
    /// 同一任务的持久化串行执行，保证最后写入的是最新快照
    persist: Arc<Mutex<()>>,
}

#[derive(Debug, Default)]
struct Inner {
    entries: HashMap<String, Entry>,
    /// 插入顺序 -> 任务 id
    order: BTreeMap<u64, String>,
    next_seq: u64,
}

/// 单一任务类型的内存注册表
///
/// 按插入顺序列出任务；条目只会被显式的删除/清理移除，引擎不会静默丢弃。
#[derive(Clone)]
pub struct TaskRegistry {
    kind: TaskKind,
    inner: Arc<RwLock<Inner>>,
}

impl fmt::Debug for TaskRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskRegistry")
            .field("kind", &self.kind)
            .field("stats", &self.stats().to_string())
            .finish()
    }
}

impl TaskRegistry {
    pub fn new(kind: TaskKind) -> Self {
        Self {
            kind,
            inner: Arc::new(RwLock::new(Inner::default())),
        }
    }

    pub fn kind(&self) -> TaskKind {
        self.kind
    }

    /// 插入新任务，id 已存在时返回 false
    pub fn insert(&self, task: Task) -> bool {
        let mut inner = self.inner.write();
        if inner.entries.contains_key(&task.id) {
            return false;
        }
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.order.insert(seq, task.id.clone());
        debug!("登记任务 {} {} (seq={})", self.kind, task.id, seq);
        inner.entries.insert(
            task.id.clone(),
            Entry {
                seq,
                task,
                cancel: CancellationToken::new(),
                persist: Arc::new(Mutex::new(())),
            },
        );
        true
    }

    pub fn get(&self, id: &str) -> Option<Task> {
        self.inner.read().entries.get(id).map(|e| e.task.clone())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.inner.read().entries.contains_key(id)
    }

    /// 在写锁内修改任务
    pub fn update<R>(&self, id: &str, f: impl FnOnce(&mut Task) -> R) -> Option<R> {
        let mut inner = self.inner.write();
        inner.entries.get_mut(id).map(|e| f(&mut e.task))
    }

    /// 同 [`update`](Self::update)，额外提供任务的取消信号
    pub(crate) fn update_with_token<R>(
        &self,
        id: &str,
        f: impl FnOnce(&mut Task, &CancellationToken) -> R,
    ) -> Option<R> {
        let mut inner = self.inner.write();
        inner.entries.get_mut(id).map(|e| f(&mut e.task, &e.cancel))
    }

    pub(crate) fn persist_lock(&self, id: &str) -> Option<Arc<Mutex<()>>> {
        self.inner
            .read()
            .entries
            .get(id)
            .map(|e| Arc::clone(&e.persist))
    }

    /// 撤销一次插入，提交持久化失败时使用
    pub(crate) fn discard(&self, id: &str) {
        let mut inner = self.inner.write();
        if let Some(entry) = inner.entries.remove(id) {
            inner.order.remove(&entry.seq);
        }
    }

    /// 确认任务已结束并返回它的持久化锁，不做修改
    pub(crate) fn terminal_lock(&self, id: &str) -> Result<Arc<Mutex<()>>> {
        let inner = self.inner.read();
        let entry = inner.entries.get(id).ok_or_else(|| EngineError::TaskNotFound {
            kind: self.kind,
            id: id.to_string(),
        })?;
        if !entry.task.state.is_terminal() {
            return Err(EngineError::TaskRunning {
                kind: self.kind,
                id: id.to_string(),
                state: entry.task.state,
            });
        }
        Ok(Arc::clone(&entry.persist))
    }

    /// 删除一个已结束的任务；未结束的任务保持原样并返回 `TaskRunning`
    pub(crate) fn remove_terminal(&self, id: &str) -> Result<Task> {
        let mut inner = self.inner.write();
        let state = inner
            .entries
            .get(id)
            .map(|e| e.task.state)
            .ok_or_else(|| EngineError::TaskNotFound {
                kind: self.kind,
                id: id.to_string(),
            })?;
        if !state.is_terminal() {
            return Err(EngineError::TaskRunning {
                kind: self.kind,
                id: id.to_string(),
                state,
            });
        }
        let entry = inner
            .entries
            .remove(id)
            .ok_or_else(|| EngineError::TaskNotFound {
                kind: self.kind,
                id: id.to_string(),
            })?;
        inner.order.remove(&entry.seq);
        Ok(entry.task)
    }

    /// 按插入顺序列出满足条件的任务
    pub fn list(&self, filter: impl Fn(&Task) -> bool) -> Vec<Task> {
        let inner = self.inner.read();
        inner
            .order
            .values()
            .filter_map(|id| inner.entries.get(id))
            .filter(|e| filter(&e.task))
            .map(|e| e.task.clone())
            .collect()
    }

    /// pending 与 running 的任务
    pub fn list_undone(&self) -> Vec<Task> {
        self.list(|t| t.state.is_undone())
    }

    /// succeeded、failed、canceled 的任务
    pub fn list_done(&self) -> Vec<Task> {
        self.list(|t| t.state.is_terminal())
    }

    pub fn len(&self) -> usize {
        self.inner.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> TaskStats {
        let inner = self.inner.read();
        let mut stats = TaskStats {
            kind: self.kind,
            total: inner.entries.len(),
            ..TaskStats::default_for(self.kind)
        };
        for entry in inner.entries.values() {
            match entry.task.state {
                TaskState::Pending => stats.pending += 1,
                TaskState::Running => stats.running += 1,
                TaskState::Succeeded => stats.succeeded += 1,
                TaskState::Failed => stats.failed += 1,
                TaskState::Canceled => stats.canceled += 1,
            }
        }
        stats
    }
}

/// 任务统计信息
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskStats {
    pub kind: TaskKind,
    pub total: usize,
    pub pending: usize,
    pub running: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub canceled: usize,
}

impl TaskStats {
    fn default_for(kind: TaskKind) -> Self {
        Self {
            kind,
            total: 0,
            pending: 0,
            running: 0,
            succeeded: 0,
            failed: 0,
            canceled: 0,
        }
    }
}

impl fmt::Display for TaskStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} 任务统计: 总计={}, 等待={}, 运行={}, 成功={}, 失败={}, 已取消={}",
            self.kind,
            self.total,
            self.pending,
            self.running,
            self.succeeded,
            self.failed,
            self.canceled
        )
    }
}
