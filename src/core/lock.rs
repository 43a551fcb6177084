//! 会话锁，防止两次运行同时修改同一对路径

use crate::error::{BisyncError, BisyncResult};
use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// 锁文件内容
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockInfo {
    pub session: String,
    pub run_id: Uuid,
    pub pid: u32,
    pub renewed: DateTime<Utc>,
    /// None 表示永不过期
    pub expires: Option<DateTime<Utc>>,
}

impl LockInfo {
    fn new(session: &str, run_id: Uuid, max_lock: Option<Duration>) -> Self {
        let now = Utc::now();
        Self {
            session: session.to_string(),
            run_id,
            pid: std::process::id(),
            renewed: now,
            expires: max_lock
                .and_then(|d| chrono::Duration::from_std(d).ok())
                .map(|d| now + d),
        }
    }

    fn is_expired(&self) -> bool {
        self.expires.is_some_and(|t| t < Utc::now())
    }
}

pub struct SessionLock {
    path: PathBuf,
    pub run_id: Uuid,
    stop: CancellationToken,
    renewer: Option<JoinHandle<()>>,
    released: bool,
}

impl SessionLock {
    /// 获取锁，已有未过期的锁时返回 `Locked`
    pub async fn acquire(
        path: &Path,
        session: &str,
        max_lock: Option<Duration>,
    ) -> BisyncResult<Self> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("创建工作目录失败: {:?}", parent))?;
        }

        match tokio::fs::read_to_string(path).await {
            Ok(content) => {
                let existing: Option<LockInfo> = serde_json::from_str(&content).ok();
                match existing {
                    Some(info) if info.is_expired() => {
                        warn!(
                            "锁已过期（pid={}, 过期于 {:?}），接管: {:?}",
                            info.pid, info.expires, path
                        );
                        tokio::fs::remove_file(path)
                            .await
                            .with_context(|| format!("删除过期锁失败: {:?}", path))?;
                    }
                    Some(info) => {
                        return Err(BisyncError::Locked(format!(
                            "{:?} 被 pid={} 持有（运行 {}），过期时间 {}",
                            path,
                            info.pid,
                            info.run_id,
                            info.expires
                                .map(|t| t.to_rfc3339())
                                .unwrap_or_else(|| "永不".to_string())
                        )))
                    }
                    None => {
                        return Err(BisyncError::Locked(format!(
                            "{:?} 已存在且无法解析，确认没有其他运行后手动删除",
                            path
                        )))
                    }
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(anyhow::anyhow!("读取锁文件失败 {:?}: {}", path, e).into()),
        }

        let run_id = Uuid::new_v4();
        let info = LockInfo::new(session, run_id, max_lock);
        let mut file = match tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .await
        {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                return Err(BisyncError::Locked(format!("{:?} 刚被其他运行获取", path)))
            }
            Err(e) => return Err(anyhow::anyhow!("创建锁文件失败 {:?}: {}", path, e).into()),
        };
        let content = serde_json::to_vec_pretty(&info).map_err(anyhow::Error::from)?;
        file.write_all(&content)
            .await
            .with_context(|| format!("写入锁文件失败: {:?}", path))?;
        file.flush().await.map_err(anyhow::Error::from)?;
        info!("已获取会话锁: {:?}", path);

        let stop = CancellationToken::new();
        let renewer = max_lock.map(|d| {
            tokio::spawn(renew_loop(
                path.to_path_buf(),
                session.to_string(),
                run_id,
                d,
                stop.clone(),
            ))
        });

        Ok(Self {
            path: path.to_path_buf(),
            run_id,
            stop,
            renewer,
            released: false,
        })
    }

    /// 停止续期并删除锁文件
    pub async fn release(mut self) {
        self.stop.cancel();
        if let Some(handle) = self.renewer.take() {
            let _ = handle.await;
        }
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => debug!("已释放会话锁: {:?}", self.path),
            Err(e) => warn!("删除锁文件失败 {:?}: {}", self.path, e),
        }
        self.released = true;
    }
}

impl Drop for SessionLock {
    fn drop(&mut self) {
        if !self.released {
            self.stop.cancel();
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

/// 每半个有效期续期一次
async fn renew_loop(
    path: PathBuf,
    session: String,
    run_id: Uuid,
    max_lock: Duration,
    stop: CancellationToken,
) {
    let mut interval = tokio::time::interval(max_lock / 2);
    // 第一次 tick 立即返回
    interval.tick().await;
    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            _ = interval.tick() => {
                let info = LockInfo::new(&session, run_id, Some(max_lock));
                let result = async {
                    let content = serde_json::to_vec_pretty(&info)?;
                    let mut tmp = path.as_os_str().to_os_string();
                    tmp.push(".tmp");
                    tokio::fs::write(&tmp, content).await?;
                    tokio::fs::rename(&tmp, &path).await?;
                    anyhow::Ok(())
                }
                .await;
                match result {
                    Ok(()) => debug!("会话锁已续期: {:?}", path),
                    Err(e) => warn!("会话锁续期失败 {:?}: {:#}", path, e),
                }
            }
        }
    }
}
