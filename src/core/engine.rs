//! 双向同步引擎

use crate::config::{BisyncOptions, CheckSync};
use crate::core::comparator::{CompareFlags, CompareOpt, FileComparator};
use crate::core::conflict::{ConflictRecord, ConflictResolver, PickRule};
use crate::core::context::RunContext;
use crate::core::delta::{classify_side, conflict_record, merge, Verdict};
use crate::core::executor::{
    fast_copy, fast_delete, fast_replace, prune_empty_dirs, rename_files, sync_empty_dirs, Action, DirOp,
    Results,
};
use crate::core::listing::{FileRecord, Listing, SessionPaths};
use crate::core::lock::SessionLock;
use crate::core::queue::{QueueCounts, QueuePlan};
use crate::core::scanner::{FileScanner, GlobFilter, PathFilter};
use crate::core::Side;
use crate::error::{BisyncError, BisyncResult};
use crate::storage::Storage;
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// 运行报告
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunReport {
    pub session: String,
    pub resync: bool,
    pub dry_run: bool,
    pub check_sync_only: bool,
    pub queues: QueueCounts,
    pub conflicts: Vec<ConflictRecord>,
    pub results: usize,
    pub errors: usize,
    pub first_error: Option<String>,
    pub listings_written: bool,
    pub empty_dirs_removed: usize,
    pub duration_ms: u64,
}

impl RunReport {
    /// 有失败的操作时返回 `PartialFailure`
    pub fn check(&self) -> BisyncResult<()> {
        if self.errors > 0 {
            return Err(BisyncError::PartialFailure {
                count: self.errors,
                first: self.first_error.clone().unwrap_or_default(),
            });
        }
        Ok(())
    }
}

/// 两侧当前状态
struct Snapshot {
    prior1: Option<Listing>,
    prior2: Option<Listing>,
    current1: Listing,
    current2: Listing,
}

pub struct Bisync {
    path1: Arc<dyn Storage>,
    path2: Arc<dyn Storage>,
    opt: BisyncOptions,
    exclude: Vec<String>,
    cancel: CancellationToken,
}

impl Bisync {
    pub fn new(path1: Arc<dyn Storage>, path2: Arc<dyn Storage>, opt: BisyncOptions) -> Self {
        Self {
            path1,
            path2,
            opt,
            exclude: Vec::new(),
            cancel: CancellationToken::new(),
        }
    }

    /// 排除规则（glob）
    pub fn with_exclude(mut self, patterns: Vec<String>) -> Self {
        self.exclude = patterns;
        self
    }

    /// 取消信号，可在其他任务中触发
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    fn storage(&self, side: Side) -> &Arc<dyn Storage> {
        match side {
            Side::Path1 => &self.path1,
            Side::Path2 => &self.path2,
        }
    }

    fn backup_dir(&self, side: Side) -> Option<String> {
        match side {
            Side::Path1 => self.opt.backup_dir1.clone(),
            Side::Path2 => self.opt.backup_dir2.clone(),
        }
    }

    /// 执行一次同步
    pub async fn run(&self) -> BisyncResult<RunReport> {
        let started = Instant::now();
        self.opt.validate()?;

        let compare = CompareOpt::resolve(
            &CompareFlags::from(&self.opt),
            self.path1.features(),
            self.path2.features(),
        )?;

        let paths = SessionPaths::new(&self.opt.workdir(), self.path1.name(), self.path2.name());
        info!(
            "开始双向同步: {} <-> {}（会话 {}）",
            self.path1.name(),
            self.path2.name(),
            paths.session
        );

        let lock = SessionLock::acquire(
            &paths.lock_file(),
            &paths.session,
            self.opt.max_lock_duration(),
        )
        .await?;

        let ctx = Arc::new(RunContext::new(
            self.opt.clone(),
            compare,
            self.cancel.clone(),
        ));
        let outcome = self.run_locked(&ctx, &paths).await;
        lock.release().await;

        match outcome {
            Ok(mut report) => {
                report.duration_ms = started.elapsed().as_millis() as u64;
                if report.errors > 0 {
                    warn!(
                        "同步完成，但有 {} 个错误，耗时 {}ms",
                        report.errors, report.duration_ms
                    );
                } else {
                    info!("同步完成，耗时 {}ms", report.duration_ms);
                }
                Ok(report)
            }
            Err(e) => {
                self.handle_failure(&paths, &e);
                Err(e)
            }
        }
    }

    /// 严重错误时让列表失效，迫使下次 resync
    fn handle_failure(&self, paths: &SessionPaths, err: &BisyncError) {
        match err {
            BisyncError::Critical { .. } => {
                if self.opt.dry_run {
                    error!("{}（dry-run，列表保持不变）", err);
                } else if err.is_retryable(self.opt.resilient) {
                    warn!("{}，resilient 模式下保留列表，下次运行将重试", err);
                } else {
                    error!("{}，下次运行必须使用 resync", err);
                    if let Err(e) = paths.mark_listings_failed() {
                        error!("标记列表失败: {:#}", e);
                    }
                }
            }
            BisyncError::Cancelled => warn!("同步已取消，列表未更新"),
            other => error!("同步失败: {}", other),
        }
    }

    async fn run_locked(
        &self,
        ctx: &Arc<RunContext>,
        paths: &SessionPaths,
    ) -> BisyncResult<RunReport> {
        let normalize = !self.opt.no_unicode_normalization;
        let load = |side: Side| {
            Listing::load(&paths.listing(side), normalize)
                .map_err(|e| BisyncError::critical(format!("{:#}", e)))
        };
        let prior1 = load(Side::Path1)?;
        let prior2 = load(Side::Path2)?;

        if self.opt.check_sync == CheckSync::Only {
            return self.check_sync_only(paths, prior1, prior2);
        }

        let resync = self.opt.is_resync();
        if !resync && (prior1.is_none() || prior2.is_none()) {
            return Err(BisyncError::critical(
                "找不到上次的列表（首次运行或上次出现严重错误），必须先运行 resync",
            ));
        }

        let (current1, current2) = self.list_both(ctx).await?;
        if self.opt.check_access {
            self.check_access(&current1, &current2)?;
        }

        // resync 不以旧列表为基准，失败的路径从两侧列表中移除
        let (prior1, prior2) = if resync {
            (None, None)
        } else {
            (prior1, prior2)
        };
        let snapshot = Snapshot {
            prior1,
            prior2,
            current1,
            current2,
        };

        let (plan, conflicts) = if resync {
            (self.plan_resync(ctx, &snapshot), Vec::new())
        } else {
            self.plan_sync(ctx, &snapshot)?
        };

        let mut report = RunReport {
            session: paths.session.clone(),
            resync,
            dry_run: self.opt.dry_run,
            queues: plan.counts(),
            conflicts,
            ..Default::default()
        };
        if plan.is_empty() {
            info!("两侧已一致，无需同步");
        } else {
            info!("队列: {:?}", report.queues);
        }

        if self.opt.save_queues {
            if let Err(e) = plan.save(paths) {
                warn!("保存队列失败: {:#}", e);
            }
        }

        let results = self.execute(ctx, &plan).await;
        if !results.is_empty() {
            info!(
                "执行完成: {} 个操作，失败 {} 个",
                results.len(),
                results.error_count()
            );
        }
        let ledger = ctx.ledger().await;
        report.results = ledger.results;
        report.errors = ledger.errors;
        report.first_error = ledger.first_error;

        if ctx.is_cancelled() {
            return Err(BisyncError::Cancelled);
        }
        if self.opt.dry_run {
            info!("dry-run 完成，未修改任何文件和列表");
            return Ok(report);
        }

        let (new1, new2) = update_listings(&snapshot, &results);
        if self.opt.check_sync == CheckSync::True {
            check_listings_match(&new1, &new2)?;
        }
        for (side, listing) in [(Side::Path1, &new1), (Side::Path2, &new2)] {
            listing.save(&paths.listing(side)).map_err(|e| {
                BisyncError::critical(format!("写入 {} 列表失败: {:#}", side, e))
            })?;
        }
        report.listings_written = true;

        if self.opt.remove_empty_dirs {
            for side in [Side::Path1, Side::Path2] {
                match prune_empty_dirs(self.storage(side).as_ref(), side).await {
                    Ok(n) => report.empty_dirs_removed += n,
                    Err(e) => warn!("清理 {} 空目录失败: {:#}", side, e),
                }
            }
        }

        Ok(report)
    }

    /// 同时扫描两侧
    async fn list_both(&self, ctx: &Arc<RunContext>) -> BisyncResult<(Listing, Listing)> {
        let mut filter = GlobFilter::new(&self.exclude).map_err(|e| BisyncError::config(format!("{:#}", e)))?;
        // 两侧都排除备份目录
        for dir in [&self.opt.backup_dir1, &self.opt.backup_dir2].into_iter().flatten() {
            filter = filter.with_excluded_dir(dir);
        }
        let filter: Arc<dyn PathFilter> = Arc::new(filter);

        let scanner1 = FileScanner::new(self.path1.clone(), Side::Path1, filter.clone());
        let scanner2 = FileScanner::new(self.path2.clone(), Side::Path2, filter);

        match tokio::try_join!(scanner1.scan(ctx), scanner2.scan(ctx)) {
            Ok(listings) => Ok(listings),
            Err(_) if ctx.is_cancelled() => Err(BisyncError::Cancelled),
            Err(e) => Err(BisyncError::listing(format!("列出文件失败: {:#}", e))),
        }
    }

    /// 两侧必须有相同且非空的检查文件集合
    fn check_access(&self, l1: &Listing, l2: &Listing) -> BisyncResult<()> {
        let name = self.opt.check_filename.as_str();
        let collect = |l: &Listing| -> BTreeSet<String> {
            l.iter()
                .filter(|(_, r)| !r.is_dir && r.name.rsplit('/').next() == Some(name))
                .map(|(k, _)| k.clone())
                .collect()
        };
        let c1 = collect(l1);
        let c2 = collect(l2);
        if c1.is_empty() || c2.is_empty() {
            return Err(BisyncError::critical(format!(
                "访问检查失败: 找不到检查文件 {}（Path1 {} 个，Path2 {} 个）",
                name,
                c1.len(),
                c2.len()
            )));
        }
        if c1 != c2 {
            for missing in c1.symmetric_difference(&c2) {
                error!("检查文件只存在于一侧: {}", missing);
            }
            return Err(BisyncError::critical(format!(
                "访问检查失败: 两侧的 {} 文件不一致",
                name
            )));
        }
        info!("访问检查通过: {} 个检查文件", c1.len());
        Ok(())
    }

    fn check_sync_only(
        &self,
        paths: &SessionPaths,
        prior1: Option<Listing>,
        prior2: Option<Listing>,
    ) -> BisyncResult<RunReport> {
        let (Some(l1), Some(l2)) = (prior1, prior2) else {
            return Err(BisyncError::critical("找不到列表，无法检查同步状态"));
        };
        check_listings_match(&l1, &l2)?;
        info!("列表一致性检查通过");
        Ok(RunReport {
            session: paths.session.clone(),
            check_sync_only: true,
            dry_run: self.opt.dry_run,
            ..Default::default()
        })
    }

    /// resync：并集复制，从不删除
    fn plan_resync(&self, ctx: &RunContext, snap: &Snapshot) -> QueuePlan {
        info!("resync: 以当前状态重建列表");
        let cmp = FileComparator::new(ctx.compare, self.path1.features(), self.path2.features());
        let rule = PickRule::from(self.opt.resync_mode);
        let mut plan = QueuePlan::default();

        let keys: BTreeSet<&String> = snap.current1.keys().chain(snap.current2.keys()).collect();
        for key in keys {
            match (snap.current1.get(key), snap.current2.get(key)) {
                (Some(r1), None) => queue_missing(&mut plan, r1, Side::Path2),
                (None, Some(r2)) => queue_missing(&mut plan, r2, Side::Path1),
                (Some(r1), Some(r2)) => {
                    if r1.is_dir != r2.is_dir {
                        warn!("文件与目录同名，跳过: {}", key);
                        continue;
                    }
                    if r1.is_dir || cmp.files_equal(r1, r2) {
                        continue;
                    }
                    let winner = rule.pick(r1, r2).unwrap_or_else(|| {
                        debug!("resyncMode 无法判断，以 Path1 为准: {}", key);
                        Side::Path1
                    });
                    let (src, dst) = match winner {
                        Side::Path1 => (r1, r2),
                        Side::Path2 => (r2, r1),
                    };
                    plan.copy_to(winner.other())
                        .insert_as(src.name.as_str(), dst.name.as_str());
                }
                (None, None) => {}
            }
        }
        plan
    }

    /// 常规同步：分类、安全检查、冲突处理
    fn plan_sync(
        &self,
        ctx: &RunContext,
        snap: &Snapshot,
    ) -> BisyncResult<(QueuePlan, Vec<ConflictRecord>)> {
        let empty = Listing::new(!self.opt.no_unicode_normalization);
        let prior1 = snap.prior1.as_ref().unwrap_or(&empty);
        let prior2 = snap.prior2.as_ref().unwrap_or(&empty);
        let (cur1, cur2) = (&snap.current1, &snap.current2);

        let cmp = FileComparator::new(ctx.compare, self.path1.features(), self.path2.features());
        let d1 = classify_side(Side::Path1, prior1, cur1, &cmp);
        let d2 = classify_side(Side::Path2, prior2, cur2, &cmp);
        info!(
            "差异: Path1 {} 处，Path2 {} 处",
            d1.changes().count(),
            d2.changes().count()
        );

        d1.check_max_delete(self.opt.max_delete, self.opt.force)?;
        d2.check_max_delete(self.opt.max_delete, self.opt.force)?;

        let verdicts = merge(&d1, &d2, cur1, cur2, &cmp);
        let mut resolver = ConflictResolver::new(
            self.opt.conflict_resolve,
            self.opt.conflict_loser,
            &self.opt.conflict_suffix,
            self.opt.suffix_keep_extension,
        );
        let current = |side: Side| match side {
            Side::Path1 => cur1,
            Side::Path2 => cur2,
        };

        let mut plan = QueuePlan::default();
        let mut conflicts = Vec::new();
        for (key, verdict) in verdicts {
            match verdict {
                Verdict::CopyTo(to) => {
                    if let Some(src) = current(to.other()).get(&key) {
                        let target = current(to)
                            .get(&key)
                            .map(|r| r.name.as_str())
                            .unwrap_or(src.name.as_str());
                        if current(to).occupied_for_file(&key) {
                            debug!("{} 目标位置被占用，稍后替换: {}", to, key);
                            plan.replace_on(to).insert_as(src.name.as_str(), target);
                        } else {
                            plan.copy_to(to).insert_as(src.name.as_str(), target);
                        }
                    }
                }
                Verdict::DeleteOn(side) => {
                    if let Some(r) = current(side).get(&key) {
                        plan.delete_on(side).insert(r.name.as_str());
                    }
                }
                Verdict::MkdirOn(side) => {
                    // 文件被目录取代：先删除旧文件
                    if let Some(old) = current(side).get(&key).filter(|r| !r.is_dir) {
                        plan.delete_on(side).insert(old.name.as_str());
                    }
                    if let Some(r) = current(side.other()).get(&key) {
                        plan.mkdir_on(side).insert(r.name.as_str());
                    }
                }
                Verdict::RmdirOn(side) => {
                    if let Some(r) = current(side).get(&key) {
                        plan.rmdir_on(side).insert(r.name.as_str());
                    }
                }
                Verdict::Conflict(kind) => {
                    let mut record = conflict_record(&key, kind, &d1, &d2);
                    let resolution = resolver.decide(&record, cur1.get(&key), cur2.get(&key))?;
                    record.resolution = Some(resolution);
                    info!(
                        "冲突 {}: {:?}，胜者 {:?}，处置 {:?}",
                        key, kind, resolution.winner, resolution.disposition
                    );
                    for action in resolver.plan(&record, resolution, cur1, cur2) {
                        plan.apply_conflict(action);
                    }
                    conflicts.push(record);
                }
            }
        }

        Ok((plan, conflicts))
    }

    /// 顺序执行各队列，单个队列内部并发
    async fn execute(&self, ctx: &Arc<RunContext>, plan: &QueuePlan) -> Results {
        let mut results = Results::new();

        results.extend(rename_files(ctx, self.path1.as_ref(), &plan.rename_path1, Side::Path1).await);
        results.extend(rename_files(ctx, self.path2.as_ref(), &plan.rename_path2, Side::Path2).await);

        results.extend(
            fast_copy(
                ctx,
                self.path1.clone(),
                self.path2.clone(),
                &plan.copy_to_path2,
                Side::Path2,
                self.backup_dir(Side::Path2),
            )
            .await,
        );
        results.extend(
            fast_copy(
                ctx,
                self.path2.clone(),
                self.path1.clone(),
                &plan.copy_to_path1,
                Side::Path1,
                self.backup_dir(Side::Path1),
            )
            .await,
        );

        for side in [Side::Path1, Side::Path2] {
            let queue = match side {
                Side::Path1 => &plan.delete_path1,
                Side::Path2 => &plan.delete_path2,
            };
            results.extend(
                fast_delete(ctx, self.storage(side).clone(), queue, side, self.backup_dir(side)).await,
            );
        }

        for (side, queue) in [(Side::Path1, &plan.mkdir_path1), (Side::Path2, &plan.mkdir_path2)] {
            results.extend(
                sync_empty_dirs(ctx, self.storage(side).as_ref(), queue, side, DirOp::Make).await,
            );
        }
        for (side, queue) in [(Side::Path1, &plan.rmdir_path1), (Side::Path2, &plan.rmdir_path2)] {
            results.extend(
                sync_empty_dirs(ctx, self.storage(side).as_ref(), queue, side, DirOp::Remove).await,
            );
        }

        for (to, queue) in [(Side::Path1, &plan.replace_path1), (Side::Path2, &plan.replace_path2)] {
            results.extend(
                fast_replace(
                    ctx,
                    self.storage(to.other()).clone(),
                    self.storage(to).clone(),
                    queue,
                    to,
                    self.backup_dir(to),
                )
                .await,
            );
        }

        results
    }
}

fn queue_missing(plan: &mut QueuePlan, record: &FileRecord, to: Side) {
    if record.is_dir {
        plan.mkdir_on(to).insert(record.name.as_str());
    } else {
        plan.copy_to(to).insert(record.name.as_str());
    }
}

/// 新列表 = 开始时的列表 + 已确认的操作；失败的路径回退到上次快照
fn update_listings(snap: &Snapshot, results: &Results) -> (Listing, Listing) {
    let mut l1 = snap.current1.clone();
    let mut l2 = snap.current2.clone();
    let mut failed = BTreeSet::new();

    for r in results {
        let listing = match r.side {
            Side::Path1 => &mut l1,
            Side::Path2 => &mut l2,
        };
        let key = listing.key(&r.name);
        if !r.confirmed() {
            failed.insert(key);
            if let Some(ref from) = r.from {
                failed.insert(listing.key(from));
            }
            continue;
        }

        match r.action {
            Action::Copy => listing.insert(FileRecord::file(
                r.name.as_str(),
                r.size,
                r.mod_time,
                r.hash.as_str(),
            )),
            Action::Delete | Action::Rmdir => {
                listing.remove(&key);
            }
            Action::Mkdir => listing.insert(FileRecord::dir(r.name.as_str())),
            Action::Rename => {
                let old = r.from.as_ref().and_then(|f| {
                    let k = listing.key(f);
                    listing.remove(&k)
                });
                let mut record =
                    old.unwrap_or_else(|| FileRecord::file(r.name.as_str(), r.size, r.mod_time, ""));
                record.name = r.name.clone();
                if r.size >= 0 {
                    record.size = r.size;
                }
                if r.mod_time.is_some() {
                    record.mod_time = r.mod_time;
                }
                listing.insert(record);
            }
        }
    }

    for key in &failed {
        debug!("操作未完成，回退列表: {}", key);
        revert(&mut l1, snap.prior1.as_ref(), key);
        revert(&mut l2, snap.prior2.as_ref(), key);
    }
    (l1, l2)
}

fn revert(listing: &mut Listing, prior: Option<&Listing>, key: &str) {
    match prior.and_then(|p| p.get(key)) {
        Some(record) => listing.insert(record.clone()),
        None => {
            listing.remove(key);
        }
    }
}

/// 两侧列表必须包含相同的路径
fn check_listings_match(l1: &Listing, l2: &Listing) -> BisyncResult<()> {
    let k1: BTreeSet<&String> = l1.keys().collect();
    let k2: BTreeSet<&String> = l2.keys().collect();
    let only1: Vec<_> = k1.difference(&k2).collect();
    let only2: Vec<_> = k2.difference(&k1).collect();
    if only1.is_empty() && only2.is_empty() {
        return Ok(());
    }
    for key in &only1 {
        error!("只存在于 Path1 列表: {}", key);
    }
    for key in &only2 {
        error!("只存在于 Path2 列表: {}", key);
    }
    Err(BisyncError::critical(format!(
        "列表不一致: {} 个路径只在 Path1，{} 个路径只在 Path2",
        only1.len(),
        only2.len()
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::executor::{OpResult, FLAG_NOT_EMPTY};
    use chrono::DateTime;

    fn listing(names: &[&str]) -> Listing {
        let mut l = Listing::new(true);
        for n in names {
            l.insert(FileRecord::file(*n, 1, DateTime::from_timestamp(10, 0), ""));
        }
        l
    }

    #[test]
    fn test_update_listings_reverts_failures() {
        let snap = Snapshot {
            prior1: Some(listing(&["gone"])),
            prior2: Some(listing(&["gone"])),
            current1: listing(&["new", "broken"]),
            current2: listing(&["gone"]),
        };
        let mut results = Results::new();
        let mut copied = OpResult::new("new", Side::Path2, Action::Copy);
        copied.size = 1;
        copied.mod_time = DateTime::from_timestamp(10, 0);
        results.push(copied);
        results.push(OpResult::new("broken", Side::Path2, Action::Copy).failed("boom"));
        results.push(OpResult::new("gone", Side::Path2, Action::Delete));

        let (l1, l2) = update_listings(&snap, &results);
        assert_eq!(l1.keys().collect::<Vec<_>>(), vec!["new"]);
        assert_eq!(l2.keys().collect::<Vec<_>>(), vec!["new"]);
        assert!(check_listings_match(&l1, &l2).is_ok());
    }

    #[test]
    fn test_resync_failure_drops_path_from_both() {
        // resync 时旧列表不参与回退
        let snap = Snapshot {
            prior1: None,
            prior2: None,
            current1: listing(&["a.txt", "b.txt"]),
            current2: listing(&["b.txt"]),
        };
        let mut results = Results::new();
        results.push(OpResult::new("a.txt", Side::Path2, Action::Copy).failed("boom"));

        let (l1, l2) = update_listings(&snap, &results);
        assert_eq!(l1.keys().collect::<Vec<_>>(), vec!["b.txt"]);
        assert_eq!(l2.keys().collect::<Vec<_>>(), vec!["b.txt"]);
    }

    #[test]
    fn test_update_listings_rename_then_copy() {
        let snap = Snapshot {
            prior1: Some(listing(&["a"])),
            prior2: Some(listing(&["a"])),
            current1: listing(&["a"]),
            current2: listing(&["a"]),
        };
        let mut results = Results::new();
        let mut renamed = OpResult::new("a.conflict1", Side::Path1, Action::Rename);
        renamed.from = Some("a".into());
        results.push(renamed);
        results.push(OpResult::new("a", Side::Path1, Action::Copy));
        results.push(OpResult::new("a.conflict1", Side::Path2, Action::Copy));

        let (l1, l2) = update_listings(&snap, &results);
        assert_eq!(l1.keys().collect::<Vec<_>>(), vec!["a", "a.conflict1"]);
        assert_eq!(l2.keys().collect::<Vec<_>>(), vec!["a", "a.conflict1"]);
        assert_eq!(l1.get("a.conflict1").unwrap().size, 1);
    }

    #[test]
    fn test_not_empty_dir_is_kept() {
        let mut prior = Listing::new(true);
        prior.insert(FileRecord::dir("d"));
        let snap = Snapshot {
            prior1: Some(prior.clone()),
            prior2: Some(prior.clone()),
            current1: Listing::new(true),
            current2: prior,
        };
        let mut results = Results::new();
        results.push(OpResult::new("d", Side::Path2, Action::Rmdir).flag(FLAG_NOT_EMPTY));
        let (l1, l2) = update_listings(&snap, &results);
        assert!(l1.contains("d") && l2.contains("d"));
    }

    #[test]
    fn test_check_listings_match() {
        assert!(check_listings_match(&listing(&["a", "b"]), &listing(&["b", "a"])).is_ok());
        let err = check_listings_match(&listing(&["a"]), &listing(&["b"])).unwrap_err();
        assert!(matches!(err, BisyncError::Critical { listing_related: false, .. }));
    }

    #[test]
    fn test_report_check() {
        let mut report = RunReport::default();
        assert!(report.check().is_ok());
        report.errors = 2;
        report.first_error = Some("a.txt: boom".into());
        assert!(matches!(
            report.check(),
            Err(BisyncError::PartialFailure { count: 2, .. })
        ));
    }
}
