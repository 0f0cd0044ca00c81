use std::fs::{File, OpenOptions, Permissions};
use std::io::{Read, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::error::{EngineError, Result};

const LOCK_FILE_NAME: &str = ".unifs.lock";
/// 超过这个时间的锁视为异常遗留
const STALE_LOCK_SECS: u64 = 86400;

/// 锁文件信息
#[derive(Debug, Serialize, Deserialize)]
struct LockInfo {
    /// 进程 ID
    pid: u32,
    /// 主机名
    hostname: String,
    /// 锁创建时间
    created_at: u64,
    /// 程序版本
    version: String,
}

/// 任务存储目录的独占锁
///
/// 启动恢复会把 running 的任务改写为 failed，两个进程共用同一目录会互相覆盖。
#[derive(Debug)]
pub struct StoreLock {
    lock_file: PathBuf,
    dir: PathBuf,
    /// 原始目录权限（用于恢复）
    original_permissions: Option<Permissions>,
    locked: bool,
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

impl StoreLock {
    pub fn new(dir: &Path) -> Self {
        Self {
            lock_file: dir.join(LOCK_FILE_NAME),
            dir: dir.to_path_buf(),
            original_permissions: None,
            locked: false,
        }
    }

    /// 尝试获取锁
    pub fn try_lock(&mut self) -> Result<()> {
        if self.locked {
            return Ok(());
        }

        self.check_and_clean_stale_lock()?;

        match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.lock_file)
        {
            Ok(mut file) => {
                let lock_info = LockInfo {
                    pid: process::id(),
                    hostname: whoami::hostname(),
                    created_at: now_secs(),
                    version: env!("CARGO_PKG_VERSION").to_string(),
                };
                file.write_all(serde_json::to_string_pretty(&lock_info)?.as_bytes())?;
                file.sync_all()?;
                info!("成功获取任务存储锁: {:?}", self.lock_file);
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                let message = match self.read_lock_info() {
                    Ok(info) => format!(
                        "{:?} is locked by pid {} @ {} since {}s ago; remove the lock file or start with --force",
                        self.lock_file,
                        info.pid,
                        info.hostname,
                        now_secs().saturating_sub(info.created_at)
                    ),
                    Err(_) => format!("{:?} is locked and unreadable", self.lock_file),
                };
                return Err(EngineError::StoreLocked(message));
            }
            Err(e) => return Err(e.into()),
        }

        // 任务参数里可能带有凭据，只允许所有者访问
        let metadata = std::fs::metadata(&self.dir)?;
        self.original_permissions = Some(metadata.permissions());
        let mut restricted = metadata.permissions();
        restricted.set_mode(0o700);
        std::fs::set_permissions(&self.dir, restricted)?;

        self.locked = true;
        Ok(())
    }

    /// 强制获取锁（清理现有锁）
    pub fn force_lock(&mut self) -> Result<()> {
        if self.locked {
            return Ok(());
        }
        if self.lock_file.exists() {
            warn!("强制删除现有锁文件: {:?}", self.lock_file);
            std::fs::remove_file(&self.lock_file)?;
        }
        self.try_lock()
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }

    /// 释放锁并恢复目录权限
    pub fn unlock(&mut self) -> Result<()> {
        if !self.locked {
            return Ok(());
        }

        if let Some(original) = self.original_permissions.take() {
            if self.dir.exists() {
                std::fs::set_permissions(&self.dir, original)?;
            }
        }

        if self.lock_file.exists() {
            match self.read_lock_info() {
                Ok(info) if info.pid == process::id() => {
                    std::fs::remove_file(&self.lock_file)?;
                    info!("已释放任务存储锁: {:?}", self.lock_file);
                }
                _ => warn!("锁文件不属于当前进程，跳过: {:?}", self.lock_file),
            }
        }

        self.locked = false;
        Ok(())
    }

    /// 持有者进程已退出、锁过旧或文件损坏时清理
    fn check_and_clean_stale_lock(&self) -> Result<()> {
        if !self.lock_file.exists() {
            return Ok(());
        }

        match self.read_lock_info() {
            Ok(info) => {
                if !is_process_running(info.pid) {
                    warn!("检测到过期锁文件（进程 {} 已退出），正在清理...", info.pid);
                    std::fs::remove_file(&self.lock_file)?;
                } else if now_secs().saturating_sub(info.created_at) > STALE_LOCK_SECS {
                    warn!("检测到超过24小时的锁文件，正在清理...");
                    std::fs::remove_file(&self.lock_file)?;
                }
            }
            Err(e) => {
                warn!("无法读取锁文件信息，可能已损坏: {}", e);
                std::fs::remove_file(&self.lock_file)?;
            }
        }
        Ok(())
    }

    fn read_lock_info(&self) -> Result<LockInfo> {
        let mut contents = String::new();
        File::open(&self.lock_file)?.read_to_string(&mut contents)?;
        Ok(serde_json::from_str(&contents)?)
    }
}

impl Drop for StoreLock {
    fn drop(&mut self) {
        if self.locked {
            if let Err(e) = self.unlock() {
                error!("释放任务存储锁失败: {}", e);
            }
        }
    }
}

/// 发送信号 0 检查进程是否存在
fn is_process_running(pid: u32) -> bool {
    unsafe { libc::kill(pid as i32, 0) == 0 }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_lock_unlock() {
        let temp_dir = TempDir::new().unwrap();
        let mut lock = StoreLock::new(temp_dir.path());

        assert!(lock.try_lock().is_ok());
        // 已经持有锁，再次加锁直接成功
        assert!(lock.try_lock().is_ok());
        assert!(lock.is_locked());

        assert!(lock.unlock().is_ok());
        assert!(!temp_dir.path().join(LOCK_FILE_NAME).exists());
        assert!(lock.try_lock().is_ok());
    }

    #[test]
    fn test_lock_conflict() {
        let temp_dir = TempDir::new().unwrap();
        let mut lock1 = StoreLock::new(temp_dir.path());
        let mut lock2 = StoreLock::new(temp_dir.path());

        assert!(lock1.try_lock().is_ok());
        assert!(matches!(lock2.try_lock(), Err(EngineError::StoreLocked(_))));

        assert!(lock1.unlock().is_ok());
        assert!(lock2.try_lock().is_ok());
    }

    #[test]
    fn test_force_lock() {
        let temp_dir = TempDir::new().unwrap();
        let mut lock1 = StoreLock::new(temp_dir.path());
        let mut lock2 = StoreLock::new(temp_dir.path());

        assert!(lock1.try_lock().is_ok());
        assert!(lock2.force_lock().is_ok());
        assert!(lock2.is_locked());
    }

    #[test]
    fn test_corrupt_lock_is_cleaned() {
        let temp_dir = TempDir::new().unwrap();
        std::fs::write(temp_dir.path().join(LOCK_FILE_NAME), "garbage").unwrap();

        let mut lock = StoreLock::new(temp_dir.path());
        assert!(lock.try_lock().is_ok());
    }

    #[test]
    fn test_restricts_permissions() {
        let temp_dir = TempDir::new().unwrap();
        let mut lock = StoreLock::new(temp_dir.path());
        lock.try_lock().unwrap();

        let mode = std::fs::metadata(temp_dir.path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o700);
    }
}
