//! 队列执行：复制、删除、改名和空目录同步

use crate::core::context::RunContext;
use crate::core::queue::Queue;
use crate::core::Side;
use crate::storage::{Storage, StreamHasher, CHUNK_SIZE};
use anyhow::{anyhow, bail, Result};
use chrono::{DateTime, Utc};
use futures::stream;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

pub const FLAG_DRY_RUN: &str = "dry-run";
pub const FLAG_BACKUP: &str = "backup";
/// 目录非空未删除
pub const FLAG_NOT_EMPTY: &str = "not-empty";
/// 待删除的文件已不存在
pub const FLAG_MISSING: &str = "missing";

/// 操作类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Copy,
    Delete,
    Rename,
    Mkdir,
    Rmdir,
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Action::Copy => "copy",
            Action::Delete => "delete",
            Action::Rename => "rename",
            Action::Mkdir => "mkdir",
            Action::Rmdir => "rmdir",
        };
        write!(f, "{}", s)
    }
}

/// 单个操作的结果
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OpResult {
    /// 操作所在侧的文件名
    pub name: String,
    pub side: Side,
    pub size: i64,
    pub mod_time: Option<DateTime<Utc>>,
    pub hash: String,
    pub action: Action,
    pub flags: Vec<String>,
    pub error: Option<String>,
    /// 改名前的名称
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
}

impl OpResult {
    pub fn new(name: impl Into<String>, side: Side, action: Action) -> Self {
        Self {
            name: name.into(),
            side,
            size: -1,
            mod_time: None,
            hash: String::new(),
            action,
            flags: Vec::new(),
            error: None,
            from: None,
        }
    }

    pub fn failed(mut self, err: impl std::fmt::Display) -> Self {
        self.error = Some(err.to_string());
        self
    }

    pub fn flag(mut self, flag: &str) -> Self {
        self.flags.push(flag.to_string());
        self
    }

    pub fn has_flag(&self, flag: &str) -> bool {
        self.flags.iter().any(|f| f == flag)
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }

    /// 操作确实完成，可以写入新快照
    pub fn confirmed(&self) -> bool {
        self.is_ok() && !self.has_flag(FLAG_DRY_RUN) && !self.has_flag(FLAG_NOT_EMPTY)
    }
}

/// 一次执行的结果序列，可以反复遍历
#[derive(Debug, Clone, Default, Serialize)]
#[serde(transparent)]
pub struct Results {
    items: Vec<OpResult>,
}

impl Results {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, result: OpResult) {
        self.items.push(result);
    }

    pub fn extend(&mut self, other: Results) {
        self.items.extend(other.items);
    }

    pub fn iter(&self) -> std::slice::Iter<'_, OpResult> {
        self.items.iter()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn error_count(&self) -> usize {
        self.items.iter().filter(|r| !r.is_ok()).count()
    }

    fn sort(&mut self) {
        self.items.sort_by(|a, b| a.name.cmp(&b.name));
    }
}

impl<'a> IntoIterator for &'a Results {
    type Item = &'a OpResult;
    type IntoIter = std::slice::Iter<'a, OpResult>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.iter()
    }
}

fn backup_path(dir: &str, name: &str) -> String {
    format!("{}/{}", dir.trim_end_matches('/'), name)
}

/// 覆盖或删除前把旧文件移到备份目录，返回是否做了备份
async fn backup_file(storage: &dyn Storage, dir: Option<&str>, name: &str) -> Result<bool> {
    let Some(dir) = dir else {
        return Ok(false);
    };
    match storage.stat(name).await? {
        Some(meta) if !meta.is_dir => {
            let to = backup_path(dir, name);
            storage.rename(name, &to).await?;
            debug!("已备份: {} -> {}", name, to);
            Ok(true)
        }
        _ => Ok(false),
    }
}

/// 只复制队列中的文件
pub async fn fast_copy(
    ctx: &Arc<RunContext>,
    src: Arc<dyn Storage>,
    dst: Arc<dyn Storage>,
    queue: &Queue,
    to: Side,
    backup_dir: Option<String>,
) -> Results {
    let mut results = Results::new();
    if queue.is_empty() {
        return results;
    }
    info!("复制 {} 个文件到 {}", queue.len(), to);

    if ctx.dry_run() {
        for name in queue.iter() {
            let r = OpResult::new(queue.target(name), to, Action::Copy).flag(FLAG_DRY_RUN);
            info!("[dry-run] 复制到 {}: {}", to, name);
            ctx.record(&r).await;
            results.push(r);
        }
        return results;
    }

    let semaphore = Arc::new(Semaphore::new(ctx.opt.transfers));
    let mut tasks = JoinSet::new();

    for name in queue.iter() {
        let name = name.clone();
        let target = queue.target(&name).to_string();
        let ctx = ctx.clone();
        let src = src.clone();
        let dst = dst.clone();
        let semaphore = semaphore.clone();
        let backup_dir = backup_dir.clone();

        tasks.spawn(async move {
            let _permit = match semaphore.acquire_owned().await {
                Ok(p) => p,
                Err(_) => {
                    return OpResult::new(target, to, Action::Copy).failed("并发控制已关闭")
                }
            };
            if ctx.is_cancelled() {
                return OpResult::new(target, to, Action::Copy).failed("已取消");
            }
            match copy_one(
                &ctx,
                src,
                dst.as_ref(),
                &name,
                &target,
                to,
                backup_dir.as_deref(),
            )
            .await
            {
                Ok(r) => r,
                Err(e) => OpResult::new(target, to, Action::Copy).failed(format!("{:#}", e)),
            }
        });
    }

    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(r) => {
                ctx.record(&r).await;
                results.push(r);
            }
            Err(e) => error!("复制任务异常退出: {}", e),
        }
    }

    // 异常退出的任务同样记为失败
    let done: HashSet<String> = results.iter().map(|r| r.name.clone()).collect();
    for name in queue.iter() {
        let target = queue.target(name);
        if !done.contains(target) {
            let r = OpResult::new(target, to, Action::Copy).failed("任务异常退出");
            ctx.record(&r).await;
            results.push(r);
        }
    }

    results.sort();
    results
}

/// 目标位置是目录时复制，先清掉只含空目录的目录树
pub async fn fast_replace(
    ctx: &Arc<RunContext>,
    src: Arc<dyn Storage>,
    dst: Arc<dyn Storage>,
    queue: &Queue,
    to: Side,
    backup_dir: Option<String>,
) -> Results {
    if queue.is_empty() {
        return Results::new();
    }
    info!("替换 {} 上 {} 个被占用的路径", to, queue.len());

    let mut ready = Queue::new();
    let mut results = Results::new();
    for name in queue.iter() {
        let target = queue.target(name);
        if ctx.dry_run() || ctx.is_cancelled() {
            ready.insert_as(name.as_str(), target);
            continue;
        }
        let cleared: Result<bool> = async {
            match dst.stat(target).await? {
                Some(meta) if meta.is_dir => dst.remove_empty_dir(target).await,
                _ => Ok(true),
            }
        }
        .await;
        match cleared {
            Ok(true) => ready.insert_as(name.as_str(), target),
            Ok(false) => {
                let r = OpResult::new(target, to, Action::Copy).failed("目标目录非空，无法替换为文件");
                ctx.record(&r).await;
                results.push(r);
            }
            Err(e) => {
                let r = OpResult::new(target, to, Action::Copy).failed(format!("{:#}", e));
                ctx.record(&r).await;
                results.push(r);
            }
        }
    }

    results.extend(fast_copy(ctx, src, dst, &ready, to, backup_dir).await);
    results.sort();
    results
}

async fn copy_one(
    ctx: &Arc<RunContext>,
    src: Arc<dyn Storage>,
    dst: &dyn Storage,
    name: &str,
    target: &str,
    to: Side,
    backup_dir: Option<&str>,
) -> Result<OpResult> {
    let meta = src
        .stat(name)
        .await?
        .ok_or_else(|| anyhow!("源文件不存在: {}", name))?;
    if meta.is_dir {
        bail!("源路径是目录: {}", name);
    }

    let ht = ctx.compare.hash_type(to);
    let hasher = if ctx.compare.wants_hash(to) {
        StreamHasher::new(ht)
    } else {
        None
    };
    let known_size = u64::try_from(meta.size).ok();

    let mut result = OpResult::new(target, to, Action::Copy);
    if backup_file(dst, backup_dir, target).await? {
        result = result.flag(FLAG_BACKUP);
    }

    let (tx, rx) = mpsc::channel::<Result<Vec<u8>>>(4);
    let reader = tokio::spawn(read_chunks(
        ctx.clone(),
        src,
        name.to_string(),
        known_size,
        hasher,
        tx,
    ));
    let stream = stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|chunk| (chunk, rx))
    });
    let written = dst.write_stream(target, Box::pin(stream), known_size).await;
    let stream_hash = reader
        .await
        .map_err(|e| anyhow!("读取任务异常退出: {}", e))?;
    written?;

    if let Some(t) = meta.modified_time {
        if dst.features().can_set_modtime {
            dst.set_modtime(target, t).await?;
        }
    }

    let written = dst
        .stat(target)
        .await?
        .ok_or_else(|| anyhow!("写入后找不到目标文件: {}", target))?;
    result.size = written.size;
    result.mod_time = written.modified_time;

    if ctx.compare.wants_hash(to) {
        result.hash = match stream_hash {
            Some(h) => h,
            None => dst.hash(target, ht).await?.unwrap_or_default(),
        };
    }

    debug!("已复制到 {}: {} ({} bytes)", to, target, result.size);
    Ok(result)
}

/// 分块读取源文件送入写入端，同时计算哈希
///
/// 大小未知时读到空块为止；大小已知时提前读到空块说明源文件被截断。
async fn read_chunks(
    ctx: Arc<RunContext>,
    src: Arc<dyn Storage>,
    name: String,
    known_size: Option<u64>,
    mut hasher: Option<StreamHasher>,
    tx: mpsc::Sender<Result<Vec<u8>>>,
) -> Option<String> {
    let mut offset = 0u64;
    loop {
        let length = match known_size {
            Some(size) if offset >= size => break,
            Some(size) => CHUNK_SIZE.min(size - offset),
            None => CHUNK_SIZE,
        };
        if ctx.is_cancelled() {
            let _ = tx.send(Err(anyhow!("已取消"))).await;
            return None;
        }

        let data = match src.read_range(&name, offset, length).await {
            Ok(data) if data.is_empty() && known_size.is_some() => {
                let _ = tx.send(Err(anyhow!("源文件在复制过程中变短: {}", name))).await;
                return None;
            }
            Ok(data) if data.is_empty() => break,
            Ok(data) => data,
            Err(e) => {
                let _ = tx.send(Err(e)).await;
                return None;
            }
        };

        offset += data.len() as u64;
        if let Some(h) = hasher.as_mut() {
            h.update(&data);
        }
        // 写入端已放弃
        if tx.send(Ok(data)).await.is_err() {
            return None;
        }
    }
    hasher.map(StreamHasher::finish)
}

async fn delete_one(storage: &dyn Storage, name: &str, side: Side, backup: Option<&str>) -> OpResult {
    let result = OpResult::new(name, side, Action::Delete);
    let outcome: Result<bool> = async {
        if backup_file(storage, backup, name).await? {
            return Ok(true);
        }
        storage.delete(name).await?;
        Ok(false)
    }
    .await;

    match outcome {
        Ok(true) => result.flag(FLAG_BACKUP),
        Ok(false) => {
            debug!("已删除 {}: {}", side, name);
            result
        }
        Err(e) => result.failed(format!("{:#}", e)),
    }
}

/// 列出目标存储一次，按队列过滤后交给固定数量的删除任务
pub async fn fast_delete(
    ctx: &Arc<RunContext>,
    storage: Arc<dyn Storage>,
    queue: &Queue,
    side: Side,
    backup_dir: Option<String>,
) -> Results {
    let mut results = Results::new();
    if queue.is_empty() {
        return results;
    }
    info!("从 {} 删除 {} 个文件", side, queue.len());

    if ctx.dry_run() {
        for name in queue.iter() {
            let r = OpResult::new(name.as_str(), side, Action::Delete).flag(FLAG_DRY_RUN);
            info!("[dry-run] 从 {} 删除: {}", side, name);
            ctx.record(&r).await;
            results.push(r);
        }
        return results;
    }

    let workers_count = ctx.opt.transfers.max(1);
    let (tx, rx) = async_channel::bounded::<String>(workers_count);
    let mut workers = JoinSet::new();

    for _ in 0..workers_count {
        let rx = rx.clone();
        let ctx = ctx.clone();
        let storage = storage.clone();
        let backup_dir = backup_dir.clone();
        workers.spawn(async move {
            let mut done = Vec::new();
            while let Ok(name) = rx.recv().await {
                let r = if ctx.is_cancelled() {
                    OpResult::new(name, side, Action::Delete).failed("已取消")
                } else {
                    delete_one(storage.as_ref(), &name, side, backup_dir.as_deref()).await
                };
                ctx.record(&r).await;
                done.push(r);
            }
            done
        });
    }
    drop(rx);

    // 生产者：一次列表扫描
    let mut sent = HashSet::new();
    let mut list_error = None;
    match storage.list_files().await {
        Ok(entries) => {
            for entry in entries {
                if entry.is_dir || !queue.contains(&entry.path) {
                    continue;
                }
                if ctx.is_cancelled() {
                    break;
                }
                sent.insert(entry.path.clone());
                if tx.send(entry.path).await.is_err() {
                    break;
                }
            }
        }
        Err(e) => {
            error!("列出 {} 失败，无法删除: {:#}", side, e);
            list_error = Some(format!("{:#}", e));
        }
    }
    // 关闭通道是消费者的结束信号
    drop(tx);

    while let Some(joined) = workers.join_next().await {
        match joined {
            Ok(done) => {
                for r in done {
                    results.push(r);
                }
            }
            Err(e) => error!("删除任务异常退出: {}", e),
        }
    }

    let finished: HashSet<String> = results.iter().map(|r| r.name.clone()).collect();
    for name in queue.iter() {
        if finished.contains(name) {
            continue;
        }
        let r = if let Some(ref err) = list_error {
            OpResult::new(name.as_str(), side, Action::Delete).failed(err)
        } else if ctx.is_cancelled() {
            OpResult::new(name.as_str(), side, Action::Delete).failed("已取消")
        } else if sent.contains(name) {
            OpResult::new(name.as_str(), side, Action::Delete).failed("任务异常退出")
        } else {
            debug!("待删除文件已不存在: {}", name);
            OpResult::new(name.as_str(), side, Action::Delete).flag(FLAG_MISSING)
        };
        ctx.record(&r).await;
        results.push(r);
    }

    results.sort();
    results
}

/// 冲突改名，按顺序执行
pub async fn rename_files(
    ctx: &Arc<RunContext>,
    storage: &dyn Storage,
    renames: &[(String, String)],
    side: Side,
) -> Results {
    let mut results = Results::new();
    for (from, to) in renames {
        let mut r = OpResult::new(to.as_str(), side, Action::Rename);
        r.from = Some(from.clone());

        if ctx.dry_run() {
            info!("[dry-run] {} 改名: {} -> {}", side, from, to);
            r = r.flag(FLAG_DRY_RUN);
        } else if ctx.is_cancelled() {
            r = r.failed("已取消");
        } else {
            let outcome: Result<()> = async {
                storage.rename(from, to).await?;
                if let Some(meta) = storage.stat(to).await? {
                    r.size = meta.size;
                    r.mod_time = meta.modified_time;
                }
                Ok(())
            }
            .await;
            match outcome {
                Ok(()) => info!("{} 冲突文件改名: {} -> {}", side, from, to),
                Err(e) => r = r.failed(format!("{:#}", e)),
            }
        }

        ctx.record(&r).await;
        results.push(r);
    }
    results
}

/// 空目录操作
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirOp {
    Make,
    Remove,
}

/// 同步空目录，删除时从最深的目录开始
pub async fn sync_empty_dirs(
    ctx: &Arc<RunContext>,
    storage: &dyn Storage,
    queue: &Queue,
    side: Side,
    op: DirOp,
) -> Results {
    let mut results = Results::new();
    if !ctx.opt.create_empty_src_dirs || queue.is_empty() {
        return results;
    }
    // resync 从不删除
    if op == DirOp::Remove && ctx.opt.is_resync() {
        return results;
    }

    let names: Vec<&String> = match op {
        DirOp::Make => queue.iter().collect(),
        DirOp::Remove => queue.iter().rev().collect(),
    };
    let action = match op {
        DirOp::Make => Action::Mkdir,
        DirOp::Remove => Action::Rmdir,
    };

    for name in names {
        if ctx.is_cancelled() {
            break;
        }
        let mut r = OpResult::new(name.as_str(), side, action);

        if ctx.dry_run() {
            info!("[dry-run] {} {}: {}", side, action, name);
            r = r.flag(FLAG_DRY_RUN);
        } else {
            let outcome: Result<bool> = async {
                if let Some(meta) = storage.stat(name).await? {
                    if !meta.is_dir {
                        bail!("路径是文件，跳过目录操作");
                    }
                }
                match op {
                    DirOp::Make => {
                        storage.create_dir(name).await?;
                        Ok(true)
                    }
                    DirOp::Remove => storage.remove_empty_dir(name).await,
                }
            }
            .await;
            match outcome {
                Ok(true) => debug!("{} {}: {}", side, action, name),
                Ok(false) => {
                    warn!("{} 目录非空，未删除: {}", side, name);
                    r = r.flag(FLAG_NOT_EMPTY);
                }
                Err(e) => r = r.failed(format!("{:#}", e)),
            }
        }

        ctx.record(&r).await;
        results.push(r);
    }
    results
}

/// 删除一侧所有空目录，返回删除数量
pub async fn prune_empty_dirs(storage: &dyn Storage, side: Side) -> Result<usize> {
    let mut dirs: Vec<String> = storage
        .list_files()
        .await?
        .into_iter()
        .filter(|f| f.is_dir)
        .map(|f| f.path)
        .collect();
    dirs.sort();

    let mut removed = 0;
    for dir in dirs.iter().rev() {
        match storage.remove_empty_dir(dir).await {
            Ok(true) => {
                debug!("{} 删除空目录: {}", side, dir);
                removed += 1;
            }
            Ok(false) => {}
            Err(e) => warn!("{} 删除空目录失败 {}: {:#}", side, dir, e),
        }
    }
    if removed > 0 {
        info!("{} 删除了 {} 个空目录", side, removed);
    }
    Ok(removed)
}
