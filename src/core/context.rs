use crate::config::BisyncOptions;
use crate::core::comparator::CompareOpt;
use crate::core::executor::OpResult;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::error;

/// 并发任务共享的统计
#[derive(Debug, Default, Clone)]
pub struct Ledger {
    pub results: usize,
    pub errors: usize,
    pub first_error: Option<String>,
}

/// 单次运行的上下文，运行期间只读（统计除外）
#[derive(Debug)]
pub struct RunContext {
    pub opt: BisyncOptions,
    pub compare: CompareOpt,
    pub cancel: CancellationToken,
    ledger: Mutex<Ledger>,
}

impl RunContext {
    pub fn new(opt: BisyncOptions, compare: CompareOpt, cancel: CancellationToken) -> Self {
        Self {
            opt,
            compare,
            cancel,
            ledger: Mutex::new(Ledger::default()),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn dry_run(&self) -> bool {
        self.opt.dry_run
    }

    /// 记录一个操作结果
    pub async fn record(&self, result: &OpResult) {
        let mut ledger = self.ledger.lock().await;
        ledger.results += 1;
        if let Some(ref err) = result.error {
            error!("{} {} 失败: {}: {}", result.side, result.action, result.name, err);
            ledger.errors += 1;
            if ledger.first_error.is_none() {
                ledger.first_error = Some(format!("{}: {}", result.name, err));
            }
        }
    }

    pub async fn ledger(&self) -> Ledger {
        self.ledger.lock().await.clone()
    }
}
