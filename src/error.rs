//! 错误类型

use thiserror::Error;

/// 同步运行的错误分类
#[derive(Error, Debug)]
pub enum BisyncError {
    /// 配置互相矛盾或非法，未做任何修改
    #[error("配置错误: {0}")]
    Config(String),

    /// 删除比例超出阈值等安全检查失败，未做任何修改
    #[error("安全中止: {0}")]
    SafetyAbort(String),

    /// 另一次运行持有锁
    #[error("会话已被锁定: {0}")]
    Locked(String),

    /// 列表失败、校验失败等严重错误，通常需要 resync 恢复
    #[error("严重错误: {message}")]
    Critical { message: String, listing_related: bool },

    /// 同步完成但部分文件操作失败
    #[error("同步完成，但有 {count} 个错误，首个错误: {first}")]
    PartialFailure { count: usize, first: String },

    #[error("同步已取消")]
    Cancelled,

    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

impl BisyncError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn critical(msg: impl Into<String>) -> Self {
        Self::Critical {
            message: msg.into(),
            listing_related: false,
        }
    }

    /// 列表相关的严重错误，resilient 模式下可在下次运行重试
    pub fn listing(msg: impl Into<String>) -> Self {
        Self::Critical {
            message: msg.into(),
            listing_related: true,
        }
    }

    /// 下次运行无需 resync 即可重试
    pub fn is_retryable(&self, resilient: bool) -> bool {
        match self {
            Self::PartialFailure { .. } | Self::Cancelled | Self::Locked(_) => true,
            Self::SafetyAbort(_) | Self::Config(_) => true,
            Self::Critical {
                listing_related, ..
            } => resilient && *listing_related,
            Self::Storage(_) => resilient,
        }
    }
}

impl serde::Serialize for BisyncError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

pub type BisyncResult<T> = Result<T, BisyncError>;
