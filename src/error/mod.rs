use thiserror::Error;

use crate::task::{TaskKind, TaskState};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("path traversal rejected: {0}")]
    PathTraversal(String),

    #[error("no mount matches path: {0}")]
    NoMountMatch(String),

    #[error("no storage available for mount path: {0}")]
    NoStorageAvailable(String),

    #[error("storage already mounted at {mount_path} with order {order}")]
    DuplicateInstance { mount_path: String, order: i32 },

    #[error("no storage mounted at {mount_path} with order {order}")]
    InstanceNotFound { mount_path: String, order: i32 },

    #[error("invalid mount path: {0}")]
    InvalidMountPath(String),

    #[error("{kind} task not found: {id}")]
    TaskNotFound { kind: TaskKind, id: String },

    #[error("{kind} task {id} is still {state}")]
    TaskRunning {
        kind: TaskKind,
        id: String,
        state: TaskState,
    },

    #[error("{0} queue is full")]
    QueueFull(TaskKind),

    #[error("{0} queue is shutting down")]
    ShuttingDown(TaskKind),

    #[error("execution error: {0}")]
    Execution(String),

    #[error("interrupted by restart")]
    RestartInterrupted,

    #[error("illegal task transition: {from} -> {to}")]
    IllegalTransition { from: TaskState, to: TaskState },

    #[error("unknown task kind: {0}")]
    UnknownTaskKind(String),

    #[error("unknown storage status: {0}")]
    UnknownStorageStatus(String),

    #[error("task store locked: {0}")]
    StoreLocked(String),

    #[error("misconfigured: {0}")]
    Misconfigured(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl EngineError {
    /// 解析阶段的错误直接返回给调用方，不做内部重试
    pub fn is_resolution(&self) -> bool {
        matches!(
            self,
            EngineError::PathTraversal(_)
                | EngineError::NoMountMatch(_)
                | EngineError::NoStorageAvailable(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
