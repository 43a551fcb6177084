//! 应用配置模块

use crate::core::conflict::{ConflictLoser, ConflictResolve};
use crate::error::{BisyncError, BisyncResult};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// 默认删除比例上限（百分比）
pub const DEFAULT_MAX_DELETE: i64 = 50;
/// 默认访问检查文件名
pub const DEFAULT_CHECK_FILENAME: &str = "BISYNC_TEST";
/// 默认冲突后缀
pub const DEFAULT_CONFLICT_SUFFIX: &str = "conflict";
/// 锁文件最短有效期
pub const MIN_MAX_LOCK: Duration = Duration::from_secs(120);

/// 存储类型
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StorageType {
    Local,
    S3,
    WebDav,
}

/// 存储配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageConfig {
    #[serde(rename = "type")]
    pub typ: StorageType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bucket: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub access_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secret_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prefix: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub webdav_endpoint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub root: Option<String>,
}

/// resync 时两侧都有且不同的文件由谁胜出
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ResyncMode {
    #[default]
    None,
    Path1,
    Path2,
    Newer,
    Older,
    Larger,
    Smaller,
}

/// 同步后的列表一致性检查
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum CheckSync {
    #[default]
    True,
    False,
    /// 只检查，不同步
    Only,
}

/// 同步选项
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BisyncOptions {
    /// 根据当前状态重建列表，从不删除
    pub resync: bool,
    pub resync_mode: ResyncMode,
    pub dry_run: bool,
    /// 跳过删除比例检查
    pub force: bool,
    pub check_sync: CheckSync,
    pub check_access: bool,
    pub check_filename: String,
    /// 删除比例上限 0-100
    pub max_delete: i64,
    pub create_empty_src_dirs: bool,
    pub remove_empty_dirs: bool,
    /// 显式比较项，如 "size,modtime,checksum"
    pub compare: String,
    pub size_only: bool,
    pub checksum: bool,
    pub ignore_size: bool,
    pub ignore_listing_checksum: bool,
    pub no_slow_hash: bool,
    pub conflict_resolve: ConflictResolve,
    pub conflict_loser: ConflictLoser,
    /// "sfx" 或 "sfx1,sfx2"
    pub conflict_suffix: String,
    pub suffix_keep_extension: bool,
    /// 覆盖或删除前的备份目录（位于同一侧存储内）
    pub backup_dir1: Option<String>,
    pub backup_dir2: Option<String>,
    pub resilient: bool,
    /// 锁文件有效期（秒），0 表示永不过期
    pub max_lock: u64,
    pub save_queues: bool,
    /// 最大并发传输数
    pub transfers: usize,
    pub workdir: Option<PathBuf>,
    pub no_unicode_normalization: bool,
}

impl Default for BisyncOptions {
    fn default() -> Self {
        Self {
            resync: false,
            resync_mode: ResyncMode::None,
            dry_run: false,
            force: false,
            check_sync: CheckSync::True,
            check_access: false,
            check_filename: DEFAULT_CHECK_FILENAME.to_string(),
            max_delete: DEFAULT_MAX_DELETE,
            create_empty_src_dirs: false,
            remove_empty_dirs: false,
            compare: String::new(),
            size_only: false,
            checksum: false,
            ignore_size: false,
            ignore_listing_checksum: false,
            no_slow_hash: false,
            conflict_resolve: ConflictResolve::None,
            conflict_loser: ConflictLoser::Num,
            conflict_suffix: DEFAULT_CONFLICT_SUFFIX.to_string(),
            suffix_keep_extension: false,
            backup_dir1: None,
            backup_dir2: None,
            resilient: false,
            max_lock: 0,
            save_queues: false,
            transfers: 4, // 默认并行数为4
            workdir: None,
            no_unicode_normalization: false,
        }
    }
}

impl BisyncOptions {
    /// 检查互相矛盾的选项
    pub fn validate(&self) -> BisyncResult<()> {
        if !(0..=100).contains(&self.max_delete) {
            return Err(BisyncError::config(format!(
                "maxDelete 必须是 0 到 100 之间的百分比，当前为 {}",
                self.max_delete
            )));
        }
        if self.create_empty_src_dirs && self.remove_empty_dirs {
            return Err(BisyncError::config(
                "createEmptySrcDirs 与 removeEmptyDirs 不能同时启用",
            ));
        }
        if self.transfers == 0 {
            return Err(BisyncError::config("transfers 至少为 1"));
        }
        if self.conflict_suffix.trim().is_empty() {
            return Err(BisyncError::config("conflictSuffix 不能为空"));
        }
        Ok(())
    }

    /// 指定了 resyncMode 也视为 resync
    pub fn is_resync(&self) -> bool {
        self.resync || self.resync_mode != ResyncMode::None
    }

    /// 锁有效期，`None` 表示永不过期
    pub fn max_lock_duration(&self) -> Option<Duration> {
        match self.max_lock {
            0 => None,
            secs => Some(Duration::from_secs(secs).max(MIN_MAX_LOCK)),
        }
    }

    /// 工作目录，默认位于缓存目录下
    pub fn workdir(&self) -> PathBuf {
        self.workdir.clone().unwrap_or_else(|| {
            crate::dirs::cache_dir()
                .map(|p| p.join("bisync"))
                .unwrap_or_else(|| PathBuf::from(".bisync"))
        })
    }
}

/// 同步任务配置文件
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobConfig {
    pub path1: StorageConfig,
    pub path2: StorageConfig,
    /// 排除规则（glob patterns）
    #[serde(default)]
    pub exclude: Vec<String>,
    #[serde(default)]
    pub options: BisyncOptions,
}

impl JobConfig {
    /// 从 JSON 文件加载任务
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("读取任务文件失败 {:?}: {}", path, e))?;
        let job: JobConfig = serde_json::from_str(&content)
            .map_err(|e| anyhow::anyhow!("解析任务文件失败 {:?}: {}", path, e))?;
        Ok(job)
    }
}
