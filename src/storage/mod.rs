use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::StorageConfig;
use crate::error::EngineError;
use crate::path::standardize_path;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageStatus {
    Enabled,
    Disabled,
    Errored,
}

impl StorageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageStatus::Enabled => "enabled",
            StorageStatus::Disabled => "disabled",
            StorageStatus::Errored => "errored",
        }
    }
}

impl fmt::Display for StorageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StorageStatus {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "enabled" => Ok(StorageStatus::Enabled),
            "disabled" => Ok(StorageStatus::Disabled),
            "errored" => Ok(StorageStatus::Errored),
            other => Err(EngineError::UnknownStorageStatus(other.to_string())),
        }
    }
}

/// 一个挂载到虚拟路径上的存储后端记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageInstance {
    /// 驱动名称，仅用于日志和展示
    pub driver: String,
    /// 虚拟挂载路径（已规范化）
    pub mount_path: String,
    /// 后端内部的根目录前缀，注册时从驱动能力中取得并缓存
    pub root_folder_path: Option<String>,
    /// 同一挂载路径下的优先级，负载均衡按升序轮转
    pub order: i32,
    pub status: StorageStatus,
    /// 驱动专属配置，对核心逻辑不透明
    #[serde(default)]
    pub additional: Value,
}

impl StorageInstance {
    pub fn new(driver: impl Into<String>, mount_path: &str, order: i32) -> Self {
        Self {
            driver: driver.into(),
            mount_path: standardize_path(mount_path),
            root_folder_path: None,
            order,
            status: StorageStatus::Enabled,
            additional: Value::Null,
        }
    }

    pub fn with_status(mut self, status: StorageStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_additional(mut self, additional: Value) -> Self {
        self.additional = additional;
        self
    }

    pub fn is_enabled(&self) -> bool {
        self.status == StorageStatus::Enabled
    }
}

/// 存储驱动契约
///
/// 核心只关心驱动的记录、不透明配置，以及一个可选的“根目录前缀”能力。
/// 该能力在注册时查询一次，结果缓存到 [`StorageInstance::root_folder_path`]。
pub trait Driver: Send + Sync + fmt::Debug {
    fn instance(&self) -> &StorageInstance;

    fn additional(&self) -> &Value {
        &self.instance().additional
    }

    /// 不支持根目录前缀的驱动返回 `None`
    fn root_folder_path(&self) -> Option<&str> {
        None
    }
}

/// 仅由配置构造的驱动，根目录能力来自 `additional.root_folder_path`
#[derive(Debug, Clone)]
pub struct ConfiguredStorage {
    instance: StorageInstance,
}

impl ConfiguredStorage {
    pub fn new(instance: StorageInstance) -> Self {
        Self { instance }
    }
}

impl From<&StorageConfig> for ConfiguredStorage {
    fn from(config: &StorageConfig) -> Self {
        let status = if config.disabled {
            StorageStatus::Disabled
        } else {
            StorageStatus::Enabled
        };
        let instance = StorageInstance::new(config.driver.clone(), &config.mount_path, config.order)
            .with_status(status)
            .with_additional(config.additional.clone());
        Self::new(instance)
    }
}

impl Driver for ConfiguredStorage {
    fn instance(&self) -> &StorageInstance {
        &self.instance
    }

    fn root_folder_path(&self) -> Option<&str> {
        self.instance
            .additional
            .get("root_folder_path")
            .and_then(Value::as_str)
    }
}
