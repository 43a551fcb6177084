use crate::core::context::RunContext;
use crate::core::listing::{FileRecord, Listing};
use crate::core::Side;
use crate::storage::{Storage, PARTIAL_SUFFIX};
use anyhow::{anyhow, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// 路径过滤器
pub trait PathFilter: Send + Sync {
    /// 返回 false 表示不参与同步
    fn include(&self, path: &str, is_dir: bool) -> bool;
}

/// 基于 glob 的排除规则
pub struct GlobFilter {
    set: GlobSet,
    excluded_dirs: Vec<String>,
}

impl GlobFilter {
    pub fn new(patterns: &[String]) -> Result<Self> {
        let mut builder = GlobSetBuilder::new();
        for pattern in patterns {
            let glob = Glob::new(pattern)
                .map_err(|e| anyhow!("无效的排除规则 {:?}: {}", pattern, e))?;
            builder.add(glob);
        }
        Ok(Self {
            set: builder.build()?,
            excluded_dirs: Vec::new(),
        })
    }

    /// 整个目录排除（如备份目录）
    pub fn with_excluded_dir(mut self, dir: &str) -> Self {
        let dir = dir.trim_matches('/');
        if !dir.is_empty() {
            self.excluded_dirs.push(dir.to_string());
        }
        self
    }
}

impl PathFilter for GlobFilter {
    fn include(&self, path: &str, _is_dir: bool) -> bool {
        let file_name = path.rsplit('/').next().unwrap_or(path);
        if file_name.ends_with(PARTIAL_SUFFIX) {
            return false;
        }
        for dir in &self.excluded_dirs {
            if path == dir || path.starts_with(&format!("{}/", dir)) {
                return false;
            }
        }
        !self.set.is_match(path)
    }
}

/// 文件扫描器，把一侧存储转换为列表
pub struct FileScanner {
    storage: Arc<dyn Storage>,
    side: Side,
    filter: Arc<dyn PathFilter>,
}

impl FileScanner {
    pub fn new(storage: Arc<dyn Storage>, side: Side, filter: Arc<dyn PathFilter>) -> Self {
        Self {
            storage,
            side,
            filter,
        }
    }

    /// 扫描存储并返回列表
    pub async fn scan(&self, ctx: &RunContext) -> Result<Listing> {
        if ctx.is_cancelled() {
            return Err(anyhow!("操作已取消"));
        }
        info!("开始扫描 {}: {}", self.side, self.storage.name());

        let entries = self.storage.list_files().await?;
        let mut listing = Listing::new(!ctx.opt.no_unicode_normalization);
        let mut excluded = 0;
        let mut need_hash = Vec::new();

        let ht = ctx.compare.hash_type(self.side);
        let wants_hash = ctx.compare.wants_hash(self.side);

        for entry in entries {
            if ctx.is_cancelled() {
                return Err(anyhow!("操作已取消"));
            }
            // 只在同步空目录时跟踪目录
            if entry.is_dir && !ctx.opt.create_empty_src_dirs {
                continue;
            }
            if !self.filter.include(&entry.path, entry.is_dir) {
                debug!("排除: {}", entry.path);
                excluded += 1;
                continue;
            }

            let mut record = FileRecord::from_info(&entry);
            let native = entry.checksum.as_ref().is_some_and(|c| c.typ == ht);
            if !wants_hash || !native {
                record.hash.clear();
            }
            if wants_hash && !native && !entry.is_dir {
                need_hash.push(entry.path.clone());
            }
            listing.insert(record);
        }

        if !need_hash.is_empty() {
            self.fill_hashes(ctx, &mut listing, need_hash).await?;
        }

        info!(
            "{} 扫描完成: {} 个条目（文件 {}），排除 {}",
            self.side,
            listing.len(),
            listing.file_count(),
            excluded
        );
        Ok(listing)
    }

    /// 并发计算缺少的哈希
    async fn fill_hashes(
        &self,
        ctx: &RunContext,
        listing: &mut Listing,
        names: Vec<String>,
    ) -> Result<()> {
        let ht = ctx.compare.hash_type(self.side);
        debug!("{} 需要计算 {} 个文件的 {} 哈希", self.side, names.len(), ht);

        let semaphore = Arc::new(Semaphore::new(ctx.opt.transfers.max(1)));
        let mut tasks = JoinSet::new();
        for name in names {
            let storage = self.storage.clone();
            let semaphore = semaphore.clone();
            let cancel = ctx.cancel.clone();
            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await?;
                if cancel.is_cancelled() {
                    return Err(anyhow!("操作已取消"));
                }
                let hash = storage.hash(&name, ht).await;
                anyhow::Ok((name, hash))
            });
        }

        while let Some(joined) = tasks.join_next().await {
            let (name, hash) = joined??;
            match hash {
                Ok(Some(h)) => {
                    let key = listing.key(&name);
                    if let Some(record) = listing.get(&key).cloned() {
                        listing.insert(FileRecord { hash: h, ..record });
                    }
                }
                Ok(None) => {}
                // 文件可能在扫描期间被删除，保留空哈希
                Err(e) => warn!("{} 计算哈希失败 {}: {:#}", self.side, name, e),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BisyncOptions;
    use crate::core::comparator::{CompareFlags, CompareOpt};
    use crate::storage::{compute_hash, HashType, LocalStorage};
    use tempfile::TempDir;
    use tokio_util::sync::CancellationToken;

    fn context(opt: BisyncOptions, storage: &dyn Storage) -> RunContext {
        let f = storage.features();
        let compare = CompareOpt::resolve(&CompareFlags::from(&opt), f, f).unwrap();
        RunContext::new(opt, compare, CancellationToken::new())
    }

    #[test]
    fn test_glob_filter() {
        let filter = GlobFilter::new(&["*.log".to_string(), "cache/**".to_string()])
            .unwrap()
            .with_excluded_dir("/.backup/");
        assert!(filter.include("a.txt", false));
        assert!(!filter.include("x/y.log", false));
        assert!(!filter.include("cache/a/b", false));
        assert!(!filter.include(".backup", true));
        assert!(!filter.include(".backup/a.txt", false));
        assert!(filter.include(".backupx/a.txt", false));
        assert!(!filter.include("dir/.a.txt.bisync-partial", false));
        assert!(GlobFilter::new(&["a[".to_string()]).is_err());
    }

    #[tokio::test]
    async fn test_scan_with_hashes_and_dirs() {
        let dir = TempDir::new().unwrap();
        let storage: Arc<dyn Storage> =
            Arc::new(LocalStorage::new(dir.path().to_str().unwrap()).unwrap());
        storage.write("a.txt", b"aaa".to_vec()).await.unwrap();
        storage.write("skip.log", b"x".to_vec()).await.unwrap();
        storage.create_dir("empty").await.unwrap();

        let opt = BisyncOptions {
            checksum: true,
            create_empty_src_dirs: true,
            ..Default::default()
        };
        let ctx = context(opt, storage.as_ref());
        let filter = Arc::new(GlobFilter::new(&["*.log".to_string()]).unwrap());
        let scanner = FileScanner::new(storage.clone(), Side::Path1, filter);
        let listing = scanner.scan(&ctx).await.unwrap();

        assert_eq!(listing.len(), 2);
        assert!(listing.get("empty").unwrap().is_dir);
        let a = listing.get("a.txt").unwrap();
        assert_eq!(a.size, 3);
        assert_eq!(Some(a.hash.clone()), compute_hash(HashType::Blake3, b"aaa"));
    }

    #[tokio::test]
    async fn test_scan_skips_dirs_and_cancels() {
        let dir = TempDir::new().unwrap();
        let storage: Arc<dyn Storage> =
            Arc::new(LocalStorage::new(dir.path().to_str().unwrap()).unwrap());
        storage.write("d/a.txt", b"a".to_vec()).await.unwrap();

        let ctx = context(BisyncOptions::default(), storage.as_ref());
        let filter = Arc::new(GlobFilter::new(&[]).unwrap());
        let scanner = FileScanner::new(storage.clone(), Side::Path2, filter);
        let listing = scanner.scan(&ctx).await.unwrap();
        assert_eq!(listing.keys().collect::<Vec<_>>(), vec!["d/a.txt"]);
        assert!(listing.get("d/a.txt").unwrap().hash.is_empty());

        ctx.cancel.cancel();
        assert!(scanner.scan(&ctx).await.is_err());
    }
}
