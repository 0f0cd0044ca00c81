use std::sync::atomic::{AtomicUsize, Ordering};

use tracing::debug;

use crate::error::{EngineError, Result};
use crate::mount::Mounted;

/// 同一挂载路径下的一组存储实例
///
/// 成员按 `order` 升序保存；轮转计数器属于整个组，
/// 与调用方无关，每次对该组做负载均衡选择时加一。
#[derive(Debug, Default)]
pub struct MountGroup {
    members: Vec<Mounted>,
    rotation: AtomicUsize,
}

impl MountGroup {
    pub fn members(&self) -> &[Mounted] {
        &self.members
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// 当前启用的成员，按 `order` 升序
    pub fn enabled(&self) -> Vec<&Mounted> {
        self.members
            .iter()
            .filter(|m| m.instance.is_enabled())
            .collect()
    }

    /// 启用成员超过一个即为负载均衡组
    pub fn is_balanced(&self) -> bool {
        self.enabled().len() > 1
    }

    pub fn rotation(&self) -> usize {
        self.rotation.load(Ordering::Relaxed)
    }

    pub(crate) fn find(&self, order: i32) -> Option<&Mounted> {
        self.members.iter().find(|m| m.instance.order == order)
    }

    pub(crate) fn find_mut(&mut self, order: i32) -> Option<&mut Mounted> {
        self.members.iter_mut().find(|m| m.instance.order == order)
    }

    pub(crate) fn insert(&mut self, mounted: Mounted) {
        let pos = self
            .members
            .partition_point(|m| m.instance.order <= mounted.instance.order);
        self.members.insert(pos, mounted);
    }

    pub(crate) fn remove(&mut self, order: i32) -> Option<Mounted> {
        let pos = self.members.iter().position(|m| m.instance.order == order)?;
        Some(self.members.remove(pos))
    }
}

/// 从负载均衡组中选出一个实例
///
/// 默认策略是在启用成员上按 `order` 轮转。成员变化后计数器直接对新的
/// 成员数取模，扩缩容前后不保证公平。
#[derive(Debug, Default, Clone, Copy)]
pub struct StorageBalancer;

impl StorageBalancer {
    pub fn new() -> Self {
        Self
    }

    pub fn select<'a>(&self, mount_path: &str, group: &'a MountGroup) -> Result<&'a Mounted> {
        let enabled = group.enabled();
        match enabled.len() {
            0 => Err(EngineError::NoStorageAvailable(mount_path.to_string())),
            1 => Ok(enabled[0]),
            len => {
                // 在共享读锁下原子自增，并发解析不会拿到同一个计数值
                let tick = group.rotation.fetch_add(1, Ordering::Relaxed);
                let chosen = enabled[tick % len];
                debug!(
                    "负载均衡: {} 第 {} 次选择 order={} (共 {} 个可用)",
                    mount_path, tick, chosen.instance.order, len
                );
                Ok(chosen)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{ConfiguredStorage, StorageInstance, StorageStatus};
    use std::sync::Arc;

    fn member(order: i32, status: StorageStatus) -> Mounted {
        let instance = StorageInstance::new("local", "/x", order).with_status(status);
        Mounted::new(Arc::new(ConfiguredStorage::new(instance)))
    }

    fn picks(group: &MountGroup, n: usize) -> Vec<i32> {
        let balancer = StorageBalancer::new();
        (0..n)
            .map(|_| balancer.select("/x", group).unwrap().instance.order)
            .collect()
    }

    #[test]
    fn test_round_robin_by_order() {
        let mut group = MountGroup::default();
        // 插入顺序与 order 无关
        group.insert(member(2, StorageStatus::Enabled));
        group.insert(member(1, StorageStatus::Enabled));
        assert!(group.is_balanced());

        assert_eq!(picks(&group, 4), vec![1, 2, 1, 2]);
        assert_eq!(group.rotation(), 4);
    }

    #[test]
    fn test_deterministic_replay() {
        let build = || {
            let mut group = MountGroup::default();
            for order in [3, 1, 2] {
                group.insert(member(order, StorageStatus::Enabled));
            }
            group
        };
        assert_eq!(picks(&build(), 7), picks(&build(), 7));
    }

    #[test]
    fn test_disabled_excluded() {
        let mut group = MountGroup::default();
        group.insert(member(1, StorageStatus::Disabled));
        group.insert(member(2, StorageStatus::Enabled));
        group.insert(member(3, StorageStatus::Errored));

        assert_eq!(picks(&group, 5), vec![2, 2, 2, 2, 2]);
        // 只有一个可用成员时不推进计数器
        assert_eq!(group.rotation(), 0);
    }

    #[test]
    fn test_resize_takes_modulo() {
        let mut group = MountGroup::default();
        for order in [1, 2, 3] {
            group.insert(member(order, StorageStatus::Enabled));
        }
        assert_eq!(picks(&group, 2), vec![1, 2]);

        group.remove(3);
        // 计数器为 2，对新的成员数 2 取模
        assert_eq!(picks(&group, 2), vec![1, 2]);
    }

    #[test]
    fn test_empty_group_fails() {
        let mut group = MountGroup::default();
        group.insert(member(1, StorageStatus::Disabled));
        let result = StorageBalancer::new().select("/x", &group);
        assert!(matches!(result, Err(EngineError::NoStorageAvailable(_))));
    }
}
