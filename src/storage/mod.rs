pub mod local;
pub mod s3;
pub mod webdav;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

pub use local::LocalStorage;
pub use s3::S3Storage;
pub use webdav::WebDavStorage;

// ============ 公共常量 ============

/// 非 IO 操作超时（秒）- stat, delete 等
pub const OP_TIMEOUT_SECS: u64 = 60;
/// IO 操作超时（秒）- read, write 等
pub const IO_TIMEOUT_SECS: u64 = 300;
/// 写入中的临时文件后缀，扫描时总是排除
pub const PARTIAL_SUFFIX: &str = ".bisync-partial";
/// 流式传输的分块大小
pub const CHUNK_SIZE: u64 = 4 * 1024 * 1024;

/// 分块数据流
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Vec<u8>>> + Send>>;

/// 哈希算法
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum HashType {
    #[default]
    None,
    Md5,
    Blake3,
    Xxh3,
}

impl HashType {
    /// 按优先级排列，`Hashes::get_one` 依此顺序选择
    const ALL: [HashType; 3] = [HashType::Md5, HashType::Blake3, HashType::Xxh3];

    fn bit(self) -> u8 {
        match self {
            HashType::None => 0,
            HashType::Md5 => 1,
            HashType::Blake3 => 2,
            HashType::Xxh3 => 4,
        }
    }
}

impl std::fmt::Display for HashType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HashType::None => write!(f, "none"),
            HashType::Md5 => write!(f, "md5"),
            HashType::Blake3 => write!(f, "blake3"),
            HashType::Xxh3 => write!(f, "xxh3"),
        }
    }
}

/// 存储支持的哈希集合
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Hashes(u8);

impl Hashes {
    pub fn new(types: &[HashType]) -> Self {
        Self(types.iter().fold(0, |acc, t| acc | t.bit()))
    }

    pub fn none() -> Self {
        Self(0)
    }

    pub fn contains(&self, ht: HashType) -> bool {
        ht != HashType::None && self.0 & ht.bit() != 0
    }

    /// 两侧共同支持的哈希
    pub fn overlap(&self, other: Hashes) -> Hashes {
        Hashes(self.0 & other.0)
    }

    pub fn count(&self) -> usize {
        self.0.count_ones() as usize
    }

    /// 确定性地选出一个哈希类型，集合为空时返回 `HashType::None`
    pub fn get_one(&self) -> HashType {
        HashType::ALL
            .iter()
            .copied()
            .find(|t| self.contains(*t))
            .unwrap_or(HashType::None)
    }
}

/// 存储能力声明
#[derive(Debug, Clone)]
pub struct Features {
    /// 修改时间精度，`None` 表示不支持修改时间
    pub precision: Option<Duration>,
    pub hashes: Hashes,
    /// 计算哈希需要读取整个文件
    pub slow_hash: bool,
    pub can_set_modtime: bool,
}

/// 后端原生提供的校验和
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checksum {
    pub typ: HashType,
    pub value: String,
}

/// 文件信息
#[derive(Debug, Clone)]
pub struct FileInfo {
    pub path: String,
    /// -1 表示大小未知
    pub size: i64,
    pub modified_time: Option<DateTime<Utc>>,
    pub is_dir: bool,
    pub checksum: Option<Checksum>,
}

/// 文件元数据（用于快速检查）
#[derive(Debug, Clone)]
pub struct FileMeta {
    pub size: i64,
    pub modified_time: Option<DateTime<Utc>>,
    pub is_dir: bool,
    pub etag: Option<String>,
}

/// 存储抽象接口
#[async_trait]
pub trait Storage: Send + Sync {
    /// 递归列出所有文件和目录
    async fn list_files(&self) -> Result<Vec<FileInfo>>;

    /// 获取文件元数据
    async fn stat(&self, path: &str) -> Result<Option<FileMeta>>;

    /// 读取整个文件
    async fn read(&self, path: &str) -> Result<Vec<u8>>;

    /// 读取文件的一部分，到达文件末尾时返回的数据可能更短
    async fn read_range(&self, path: &str, offset: u64, length: u64) -> Result<Vec<u8>> {
        let data = self.read(path).await?;
        let start = (offset as usize).min(data.len());
        let end = (offset.saturating_add(length) as usize).min(data.len());
        Ok(data[start..end].to_vec())
    }

    /// 写入整个文件
    async fn write(&self, path: &str, data: Vec<u8>) -> Result<()>;

    /// 流式写入（用于大文件）
    async fn write_stream(
        &self,
        path: &str,
        mut stream: ByteStream,
        _total_size: Option<u64>,
    ) -> Result<()> {
        // 默认实现：收集所有数据后写入
        let mut data = Vec::new();
        while let Some(chunk) = stream.next().await {
            data.extend(chunk?);
        }
        self.write(path, data).await
    }

    /// 设置修改时间
    async fn set_modtime(&self, path: &str, _time: DateTime<Utc>) -> Result<()> {
        Err(anyhow::anyhow!("{} 不支持设置修改时间: {}", self.name(), path))
    }

    /// 计算文件哈希，不支持该类型时返回 None
    async fn hash(&self, path: &str, ht: HashType) -> Result<Option<String>> {
        if !self.features().hashes.contains(ht) {
            return Ok(None);
        }
        let data = self.read(path).await?;
        Ok(compute_hash(ht, &data))
    }

    /// 删除文件（不存在时不报错）
    async fn delete(&self, path: &str) -> Result<()>;

    /// 创建目录
    async fn create_dir(&self, path: &str) -> Result<()>;

    /// 删除空目录，目录不为空时返回 false
    async fn remove_empty_dir(&self, path: &str) -> Result<bool>;

    /// 复制文件（同一存储内）
    async fn copy(&self, from: &str, to: &str) -> Result<()> {
        let data = self.read(from).await?;
        self.write(to, data).await
    }

    /// 移动文件（同一存储内）
    async fn rename(&self, from: &str, to: &str) -> Result<()> {
        self.copy(from, to).await?;
        self.delete(from).await
    }

    /// 存储能力
    fn features(&self) -> &Features;

    /// 获取存储名称（用于日志和会话名）
    fn name(&self) -> &str;
}

/// 在内存中计算哈希
pub fn compute_hash(ht: HashType, data: &[u8]) -> Option<String> {
    match ht {
        HashType::Blake3 => Some(blake3::hash(data).to_hex().to_string()),
        HashType::Xxh3 => Some(format!("{:032x}", xxhash_rust::xxh3::xxh3_128(data))),
        HashType::Md5 | HashType::None => None,
    }
}

/// 增量哈希，用于流式传输和大文件
pub enum StreamHasher {
    Blake3(Box<blake3::Hasher>),
    Xxh3(Box<xxhash_rust::xxh3::Xxh3>),
}

impl StreamHasher {
    /// 不支持增量计算的类型返回 None
    pub fn new(ht: HashType) -> Option<Self> {
        match ht {
            HashType::Blake3 => Some(Self::Blake3(Box::new(blake3::Hasher::new()))),
            HashType::Xxh3 => Some(Self::Xxh3(Box::new(xxhash_rust::xxh3::Xxh3::new()))),
            HashType::Md5 | HashType::None => None,
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        match self {
            Self::Blake3(h) => {
                h.update(data);
            }
            Self::Xxh3(h) => h.update(data),
        }
    }

    pub fn finish(self) -> String {
        match self {
            Self::Blake3(h) => h.finalize().to_hex().to_string(),
            Self::Xxh3(h) => format!("{:032x}", h.digest128()),
        }
    }
}

/// 通过 opendal Writer 分块上传，失败时中止上传
pub(crate) async fn write_opendal_stream(
    operator: &opendal::Operator,
    path: &str,
    mut stream: ByteStream,
) -> Result<()> {
    let mut writer = operator.writer(path).await?;
    while let Some(chunk) = stream.next().await {
        let result = match chunk {
            Ok(data) => writer.write(data).await.map_err(anyhow::Error::from),
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            let _ = writer.abort().await;
            return Err(e);
        }
    }
    writer.close().await?;
    Ok(())
}

/// 根据配置创建存储实例
pub async fn create_storage(config: &crate::config::StorageConfig) -> Result<Arc<dyn Storage>> {
    use crate::config::StorageType;

    match config.typ {
        StorageType::Local => {
            let path = config
                .path
                .as_ref()
                .ok_or_else(|| anyhow::anyhow!("Local storage requires path"))?;
            tracing::info!("初始化本地存储: {}", path);
            Ok(Arc::new(LocalStorage::new(path)?) as Arc<dyn Storage>)
        }
        StorageType::S3 => {
            let bucket = config
                .bucket
                .as_ref()
                .ok_or_else(|| anyhow::anyhow!("S3 storage requires bucket"))?;
            let region = config
                .region
                .as_ref()
                .ok_or_else(|| anyhow::anyhow!("S3 storage requires region"))?;
            let access_key = config
                .access_key
                .as_ref()
                .ok_or_else(|| anyhow::anyhow!("S3 storage requires accessKey"))?;
            let secret_key = config
                .secret_key
                .as_ref()
                .ok_or_else(|| anyhow::anyhow!("S3 storage requires secretKey"))?;
            tracing::info!("初始化S3存储: bucket={}, region={}", bucket, region);
            Ok(Arc::new(
                S3Storage::new(
                    bucket,
                    region,
                    access_key,
                    secret_key,
                    config.endpoint.clone(),
                    config.prefix.clone(),
                )
                .await?,
            ) as Arc<dyn Storage>)
        }
        StorageType::WebDav => {
            let endpoint = config
                .webdav_endpoint
                .as_ref()
                .ok_or_else(|| anyhow::anyhow!("WebDAV storage requires endpoint"))?;
            let username = config
                .username
                .as_ref()
                .ok_or_else(|| anyhow::anyhow!("WebDAV storage requires username"))?;
            let password = config
                .password
                .as_ref()
                .ok_or_else(|| anyhow::anyhow!("WebDAV storage requires password"))?;
            tracing::info!("创建WebDAV存储: endpoint={}, root={:?}", endpoint, config.root);
            Ok(Arc::new(
                WebDavStorage::new(endpoint, username, password, config.root.clone()).await?,
            ) as Arc<dyn Storage>)
        }
    }
}
