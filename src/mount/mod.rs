//! 挂载表与路径解析
//!
//! 把虚拟请求路径映射到具体的存储实例和后端内部路径，最长前缀匹配，
//! 同一挂载路径下有多个启用实例时交给 [`StorageBalancer`] 选择。

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::balance::{MountGroup, StorageBalancer};
use crate::error::{EngineError, Result};
use crate::path::{ancestors, has_parent_segment, is_under, join_path, standardize_path, strip_mount};
use crate::storage::{Driver, StorageInstance, StorageStatus};

/// 挂载表中的一个条目：实例记录快照 + 驱动
#[derive(Debug, Clone)]
pub struct Mounted {
    pub instance: StorageInstance,
    pub driver: Arc<dyn Driver>,
}

impl Mounted {
    /// 根目录能力只在这里查询一次，之后解析直接使用缓存值
    pub fn new(driver: Arc<dyn Driver>) -> Self {
        let mut instance = driver.instance().clone();
        instance.mount_path = standardize_path(&instance.mount_path);
        instance.root_folder_path = driver.root_folder_path().map(standardize_path);
        Self { instance, driver }
    }
}

/// 解析结果
#[derive(Debug, Clone)]
pub struct Resolved {
    pub storage: Arc<dyn Driver>,
    pub instance: StorageInstance,
    /// 去掉挂载前缀并拼上根目录前缀之后的后端路径
    pub actual_path: String,
}

/// 虚拟挂载表
///
/// 注册/注销持写锁，解析只持读锁，因此解析之间可以并发，
/// 但会与拓扑变更串行。
pub struct MountTable {
    groups: RwLock<BTreeMap<String, MountGroup>>,
    balancer: StorageBalancer,
}

impl fmt::Debug for MountTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let groups = self.groups.read();
        f.debug_struct("MountTable")
            .field("mount_paths", &groups.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Default for MountTable {
    fn default() -> Self {
        Self::new()
    }
}

impl MountTable {
    pub fn new() -> Self {
        Self::with_balancer(StorageBalancer::new())
    }

    pub fn with_balancer(balancer: StorageBalancer) -> Self {
        Self {
            groups: RwLock::new(BTreeMap::new()),
            balancer,
        }
    }

    fn validate_mount_path(raw: &str) -> Result<String> {
        if raw.trim().is_empty() || has_parent_segment(raw) {
            return Err(EngineError::InvalidMountPath(raw.to_string()));
        }
        Ok(standardize_path(raw))
    }

    /// 注册一个存储实例
    ///
    /// 同一挂载路径下已有相同 `order` 的启用实例时返回 `DuplicateInstance`；
    /// 已有的实例未启用时直接替换。
    pub fn register(&self, driver: Arc<dyn Driver>) -> Result<StorageInstance> {
        Self::validate_mount_path(&driver.instance().mount_path)?;
        let mounted = Mounted::new(driver);
        let instance = mounted.instance.clone();

        let mut groups = self.groups.write();
        let group = groups.entry(instance.mount_path.clone()).or_default();
        if let Some(existing) = group.find(instance.order) {
            if existing.instance.is_enabled() {
                return Err(EngineError::DuplicateInstance {
                    mount_path: instance.mount_path,
                    order: instance.order,
                });
            }
            warn!(
                "替换未启用的存储: {} order={} ({})",
                instance.mount_path, instance.order, existing.instance.status
            );
            group.remove(instance.order);
        }
        group.insert(mounted);

        info!(
            "挂载存储 {} 到 {} (order={}, status={}, root={:?})",
            instance.driver,
            instance.mount_path,
            instance.order,
            instance.status,
            instance.root_folder_path
        );
        Ok(instance)
    }

    /// 替换挂载路径 + order 相同的实例，不存在时等同于注册
    pub fn update(&self, driver: Arc<dyn Driver>) -> Result<StorageInstance> {
        Self::validate_mount_path(&driver.instance().mount_path)?;
        let mounted = Mounted::new(driver);
        let instance = mounted.instance.clone();

        let mut groups = self.groups.write();
        let group = groups.entry(instance.mount_path.clone()).or_default();
        let replaced = group.remove(instance.order).is_some();
        group.insert(mounted);

        info!(
            "{}存储 {} order={}",
            if replaced { "更新" } else { "挂载" },
            instance.mount_path,
            instance.order
        );
        Ok(instance)
    }

    /// 从挂载组中移除一个实例，组为空时一并删除
    pub fn unregister(&self, mount_path: &str, order: i32) -> Result<StorageInstance> {
        let mount_path = standardize_path(mount_path);
        let mut groups = self.groups.write();
        let not_found = || EngineError::InstanceNotFound {
            mount_path: mount_path.clone(),
            order,
        };

        let group = groups.get_mut(&mount_path).ok_or_else(not_found)?;
        let removed = group.remove(order).ok_or_else(not_found)?;
        if group.is_empty() {
            groups.remove(&mount_path);
        }

        info!("卸载存储 {} order={}", mount_path, order);
        Ok(removed.instance)
    }

    /// 修改实例状态，驱动初始化失败时标记为 errored
    pub fn set_status(&self, mount_path: &str, order: i32, status: StorageStatus) -> Result<()> {
        let mount_path = standardize_path(mount_path);
        let mut groups = self.groups.write();
        let mounted = groups
            .get_mut(&mount_path)
            .and_then(|group| group.find_mut(order))
            .ok_or_else(|| EngineError::InstanceNotFound {
                mount_path: mount_path.clone(),
                order,
            })?;

        if mounted.instance.status != status {
            info!(
                "存储 {} order={} 状态 {} -> {}",
                mount_path, order, mounted.instance.status, status
            );
            mounted.instance.status = status;
        }
        Ok(())
    }

    /// 解析虚拟路径
    pub fn resolve(&self, raw_path: &str) -> Result<Resolved> {
        if has_parent_segment(raw_path) {
            return Err(EngineError::PathTraversal(raw_path.to_string()));
        }
        let path = standardize_path(raw_path);

        let groups = self.groups.read();
        let (mount_path, group) = ancestors(&path)
            .find_map(|prefix| groups.get_key_value(prefix))
            .ok_or_else(|| EngineError::NoMountMatch(path.clone()))?;

        let chosen = self.balancer.select(mount_path, group)?;
        let remainder = strip_mount(&path, mount_path);
        let actual_path = match &chosen.instance.root_folder_path {
            Some(root) => join_path(root, &remainder),
            None => standardize_path(&remainder),
        };

        debug!(
            "解析 {} -> {} order={} 实际路径 {}",
            path, mount_path, chosen.instance.order, actual_path
        );
        Ok(Resolved {
            storage: Arc::clone(&chosen.driver),
            instance: chosen.instance.clone(),
            actual_path,
        })
    }

    /// 列出 `path` 之下仅由挂载点构成的下一级目录名
    pub fn virtual_children(&self, raw_path: &str) -> Result<Vec<String>> {
        if has_parent_segment(raw_path) {
            return Err(EngineError::PathTraversal(raw_path.to_string()));
        }
        let path = standardize_path(raw_path);

        let groups = self.groups.read();
        let names: BTreeSet<String> = groups
            .keys()
            .filter(|mount| mount.as_str() != path && is_under(mount, &path))
            .filter_map(|mount| {
                strip_mount(mount, &path)
                    .trim_start_matches('/')
                    .split('/')
                    .next()
                    .map(str::to_string)
            })
            .filter(|name| !name.is_empty())
            .collect();
        Ok(names.into_iter().collect())
    }

    /// 所有实例，按挂载路径、order 排序
    pub fn list(&self) -> Vec<StorageInstance> {
        let groups = self.groups.read();
        groups
            .values()
            .flat_map(|group| group.members().iter().map(|m| m.instance.clone()))
            .collect()
    }

    /// 某个挂载路径下的实例
    pub fn group(&self, mount_path: &str) -> Vec<StorageInstance> {
        let mount_path = standardize_path(mount_path);
        let groups = self.groups.read();
        groups
            .get(&mount_path)
            .map(|group| group.members().iter().map(|m| m.instance.clone()).collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.groups.read().values().map(|g| g.members().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::ConfiguredStorage;
    use serde_json::json;

    fn storage(mount: &str, order: i32) -> Arc<dyn Driver> {
        Arc::new(ConfiguredStorage::new(StorageInstance::new("local", mount, order)))
    }

    fn rooted(mount: &str, order: i32, root: &str) -> Arc<dyn Driver> {
        Arc::new(ConfiguredStorage::new(
            StorageInstance::new("local", mount, order)
                .with_additional(json!({ "root_folder_path": root })),
        ))
    }

    #[test]
    fn test_longest_prefix() {
        let table = MountTable::new();
        table.register(storage("/", 0)).unwrap();
        table.register(storage("/a/b", 0)).unwrap();

        let resolved = table.resolve("/a/b/c/d").unwrap();
        assert_eq!(resolved.instance.mount_path, "/a/b");
        assert_eq!(resolved.actual_path, "/c/d");

        // /a/bc 不属于 /a/b
        let resolved = table.resolve("/a/bc").unwrap();
        assert_eq!(resolved.instance.mount_path, "/");
        assert_eq!(resolved.actual_path, "/a/bc");
    }

    #[test]
    fn test_root_folder_prefix() {
        let table = MountTable::new();
        table.register(rooted("/a/b", 0, "/srv/data/")).unwrap();

        let resolved = table.resolve("a//b/c/d/").unwrap();
        assert_eq!(resolved.actual_path, "/srv/data/c/d");
        assert_eq!(resolved.instance.root_folder_path.as_deref(), Some("/srv/data"));

        let resolved = table.resolve("/a/b").unwrap();
        assert_eq!(resolved.actual_path, "/srv/data");
    }

    #[test]
    fn test_path_traversal() {
        let table = MountTable::new();
        table.register(storage("/", 0)).unwrap();

        for path in ["/a/../b", "..", "/a/b/..", "a\\..\\etc"] {
            let result = table.resolve(path);
            assert!(matches!(result, Err(EngineError::PathTraversal(_))), "{}", path);
        }
        assert!(table.resolve("/a..b").is_ok());
    }

    #[test]
    fn test_no_mount_match() {
        let table = MountTable::new();
        table.register(storage("/data", 0)).unwrap();
        assert!(matches!(
            table.resolve("/other/file"),
            Err(EngineError::NoMountMatch(_))
        ));
    }

    #[test]
    fn test_balanced_round_robin() {
        let table = MountTable::new();
        table.register(storage("/x", 2)).unwrap();
        table.register(storage("/x", 1)).unwrap();

        let orders: Vec<i32> = (0..4)
            .map(|_| table.resolve("/x/file").unwrap().instance.order)
            .collect();
        assert_eq!(orders, vec![1, 2, 1, 2]);
    }

    #[test]
    fn test_disabled_and_errored() {
        let table = MountTable::new();
        table.register(storage("/x", 1)).unwrap();
        table.register(storage("/x", 2)).unwrap();
        table.set_status("/x", 1, StorageStatus::Disabled).unwrap();

        for _ in 0..4 {
            assert_eq!(table.resolve("/x/y").unwrap().instance.order, 2);
        }

        table.set_status("/x", 2, StorageStatus::Errored).unwrap();
        assert!(matches!(
            table.resolve("/x/y"),
            Err(EngineError::NoStorageAvailable(_))
        ));
    }

    #[test]
    fn test_duplicate_instance() {
        let table = MountTable::new();
        table.register(storage("/x", 1)).unwrap();
        assert!(matches!(
            table.register(storage("/x/", 1)),
            Err(EngineError::DuplicateInstance { order: 1, .. })
        ));

        // 未启用的同序实例可以被替换
        table.set_status("/x", 1, StorageStatus::Disabled).unwrap();
        let instance = table.register(storage("/x", 1)).unwrap();
        assert!(instance.is_enabled());
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_invalid_mount_path() {
        let table = MountTable::new();
        assert!(matches!(
            table.register(storage("/a/../b", 0)),
            Err(EngineError::InvalidMountPath(_))
        ));
        assert!(table.is_empty());
    }

    #[test]
    fn test_unregister() {
        let table = MountTable::new();
        table.register(storage("/x", 1)).unwrap();
        table.register(storage("/x", 2)).unwrap();

        table.unregister("/x", 1).unwrap();
        assert_eq!(table.group("/x").len(), 1);
        assert!(matches!(
            table.unregister("/x", 1),
            Err(EngineError::InstanceNotFound { .. })
        ));

        table.unregister("/x", 2).unwrap();
        assert!(table.is_empty());
        assert!(matches!(
            table.resolve("/x/y"),
            Err(EngineError::NoMountMatch(_))
        ));
    }

    #[test]
    fn test_update_replaces() {
        let table = MountTable::new();
        table.register(storage("/x", 1)).unwrap();
        table.update(rooted("/x", 1, "/new")).unwrap();

        assert_eq!(table.len(), 1);
        assert_eq!(table.resolve("/x/f").unwrap().actual_path, "/new/f");
    }

    #[test]
    fn test_virtual_children() {
        let table = MountTable::new();
        table.register(storage("/", 0)).unwrap();
        table.register(storage("/mnt/a", 0)).unwrap();
        table.register(storage("/mnt/b/c", 0)).unwrap();
        table.register(storage("/scratch", 0)).unwrap();

        assert_eq!(table.virtual_children("/").unwrap(), vec!["mnt", "scratch"]);
        assert_eq!(table.virtual_children("/mnt").unwrap(), vec!["a", "b"]);
        assert!(table.virtual_children("/scratch").unwrap().is_empty());
        assert!(table.virtual_children("/mnt/..").is_err());
    }

    #[test]
    fn test_list_sorted() {
        let table = MountTable::new();
        table.register(storage("/b", 2)).unwrap();
        table.register(storage("/a", 0)).unwrap();
        table.register(storage("/b", 1)).unwrap();

        let listed: Vec<(String, i32)> = table
            .list()
            .into_iter()
            .map(|i| (i.mount_path, i.order))
            .collect();
        assert_eq!(
            listed,
            vec![("/a".into(), 0), ("/b".into(), 1), ("/b".into(), 2)]
        );
    }
}
