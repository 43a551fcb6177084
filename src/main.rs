use bisync_lib::config::{CheckSync, JobConfig, ResyncMode};
use bisync_lib::logging::init_logging;
use bisync_lib::storage::create_storage;
use bisync_lib::{Bisync, BisyncError};
use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info, warn};

/// 双向同步两个目录树
#[derive(Debug, Parser)]
#[command(name = "bisync", version)]
struct Cli {
    /// JSON 任务文件
    job: PathBuf,

    /// 以当前状态重建列表
    #[arg(long)]
    resync: bool,

    /// resync 时两侧不同的文件由谁胜出
    #[arg(long, value_enum)]
    resync_mode: Option<ResyncMode>,

    /// 只显示将要执行的操作
    #[arg(long)]
    dry_run: bool,

    /// 跳过删除比例检查
    #[arg(long)]
    force: bool,

    #[arg(long, value_enum)]
    check_sync: Option<CheckSync>,

    /// 日志级别
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let _guard = init_logging(cli.log_level.as_deref());

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            match e.downcast_ref::<BisyncError>() {
                Some(BisyncError::PartialFailure { .. }) => ExitCode::from(1),
                Some(BisyncError::Cancelled) => ExitCode::from(130),
                _ => ExitCode::from(2),
            }
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let mut job = JobConfig::load(&cli.job)?;
    let opt = &mut job.options;
    opt.resync |= cli.resync;
    opt.dry_run |= cli.dry_run;
    opt.force |= cli.force;
    if let Some(mode) = cli.resync_mode {
        opt.resync_mode = mode;
    }
    if let Some(check) = cli.check_sync {
        opt.check_sync = check;
    }

    let path1 = create_storage(&job.path1).await?;
    let path2 = create_storage(&job.path2).await?;
    let bisync = Bisync::new(path1, path2, job.options).with_exclude(job.exclude);

    let cancel = bisync.cancel_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("收到中断信号，正在取消同步...");
            cancel.cancel();
        }
    });

    let report = bisync.run().await?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    report.check()?;
    info!("全部完成");
    Ok(())
}
