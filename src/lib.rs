pub mod error;
pub mod config;
pub mod path;
pub mod storage;
pub mod balance;
pub mod mount;
pub mod lock;
pub mod task;
pub mod bootstrap;

pub use error::{EngineError, Result};
pub use config::{Config, QueueConfig, StorageConfig, StoreConfig, TasksConfig};
pub use storage::{ConfiguredStorage, Driver, StorageInstance, StorageStatus};
pub use balance::{MountGroup, StorageBalancer};
pub use mount::{MountTable, Mounted, Resolved};
pub use task::{
    Executor, Executors, NewTask, Outcome, Task, TaskContext, TaskEngine, TaskKind, TaskManager,
    TaskState, TaskStats, TaskStore,
};
pub use bootstrap::Runtime;
