use super::{
    write_opendal_stream, ByteStream, Checksum, FileInfo, FileMeta, Features, HashType, Hashes,
    Storage, IO_TIMEOUT_SECS,
    OP_TIMEOUT_SECS,
};
use anyhow::Result;
use async_trait::async_trait;
use futures::TryStreamExt;
use opendal::{layers::TimeoutLayer, Metakey, Operator};
use std::time::Duration;

pub struct S3Storage {
    operator: Operator,
    name: String,
    features: Features,
}

impl S3Storage {
    pub async fn new(
        bucket: &str,
        region: &str,
        access_key: &str,
        secret_key: &str,
        endpoint: Option<String>,
        prefix: Option<String>,
    ) -> Result<Self> {
        use opendal::services::S3;

        let mut builder = S3::default()
            .bucket(bucket)
            .region(region)
            .access_key_id(access_key)
            .secret_access_key(secret_key);

        if let Some(ref ep) = endpoint {
            builder = builder.endpoint(ep);
        }

        if let Some(ref p) = prefix {
            builder = builder.root(p);
        }

        // 添加超时层
        let operator = Operator::new(builder)?
            .layer(
                TimeoutLayer::default()
                    .with_timeout(Duration::from_secs(OP_TIMEOUT_SECS))
                    .with_io_timeout(Duration::from_secs(IO_TIMEOUT_SECS)),
            )
            .finish();

        let name = format!(
            "s3://{}{}",
            bucket,
            prefix
                .as_deref()
                .map(|p| format!("/{}", p))
                .unwrap_or_default()
        );

        // 上传时间即修改时间，无法回写原始时间
        Ok(Self {
            operator,
            name,
            features: Features {
                precision: None,
                hashes: Hashes::new(&[HashType::Md5]),
                slow_hash: false,
                can_set_modtime: false,
            },
        })
    }
}

/// 单段上传的 ETag 就是内容 MD5，分段上传（带 `-N` 后缀）的不是
fn etag_md5(etag: Option<&str>) -> Option<String> {
    let etag = etag?.trim_matches('"');
    if etag.len() == 32 && etag.chars().all(|c| c.is_ascii_hexdigit()) {
        Some(etag.to_lowercase())
    } else {
        None
    }
}

#[async_trait]
impl Storage for S3Storage {
    async fn list_files(&self) -> Result<Vec<FileInfo>> {
        let mut files = Vec::new();

        // 使用 lister_with 进行递归列表
        let mut lister = self
            .operator
            .lister_with("")
            .recursive(true)
            .metakey(
                Metakey::ContentLength | Metakey::LastModified | Metakey::Mode | Metakey::Etag,
            )
            .await?;

        while let Some(entry) = lister.try_next().await? {
            let path_str = entry.path().to_string();

            // 跳过根目录
            if path_str.is_empty() || path_str == "/" {
                continue;
            }

            let meta = entry.metadata();

            files.push(FileInfo {
                path: path_str.trim_start_matches('/').trim_end_matches('/').to_string(),
                size: meta.content_length() as i64,
                modified_time: meta.last_modified(),
                is_dir: meta.is_dir(),
                checksum: etag_md5(meta.etag()).map(|value| Checksum {
                    typ: HashType::Md5,
                    value,
                }),
            });
        }

        Ok(files)
    }

    async fn stat(&self, path: &str) -> Result<Option<FileMeta>> {
        match self.operator.stat(path).await {
            Ok(meta) => Ok(Some(FileMeta {
                size: meta.content_length() as i64,
                modified_time: meta.last_modified(),
                is_dir: meta.is_dir(),
                etag: meta.etag().map(|s| s.trim_matches('"').to_string()),
            })),
            Err(e) if e.kind() == opendal::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn read(&self, path: &str) -> Result<Vec<u8>> {
        let data = self.operator.read(path).await?;
        Ok(data.to_vec())
    }

    async fn write(&self, path: &str, data: Vec<u8>) -> Result<()> {
        self.operator.write(path, data).await?;
        Ok(())
    }

    async fn read_range(&self, path: &str, offset: u64, length: u64) -> Result<Vec<u8>> {
        let data = self
            .operator
            .read_with(path)
            .range(offset..offset + length)
            .await?;
        Ok(data.to_vec())
    }

    async fn write_stream(
        &self,
        path: &str,
        stream: ByteStream,
        _total_size: Option<u64>,
    ) -> Result<()> {
        write_opendal_stream(&self.operator, path, stream).await
    }

    async fn hash(&self, path: &str, ht: HashType) -> Result<Option<String>> {
        if ht != HashType::Md5 {
            return Ok(None);
        }
        let meta = self.stat(path).await?;
        Ok(meta.and_then(|m| etag_md5(m.etag.as_deref())))
    }

    async fn delete(&self, path: &str) -> Result<()> {
        // S3 删除不存在的文件不会报错
        self.operator.delete(path).await?;
        Ok(())
    }

    async fn create_dir(&self, path: &str) -> Result<()> {
        // S3 不需要真正创建目录，但为了兼容性，创建一个占位对象
        let dir_path = if path.ends_with('/') {
            path.to_string()
        } else {
            format!("{}/", path)
        };
        self.operator.write(&dir_path, Vec::<u8>::new()).await?;
        Ok(())
    }

    async fn remove_empty_dir(&self, path: &str) -> Result<bool> {
        let dir_path = format!("{}/", path.trim_end_matches('/'));
        let mut lister = self
            .operator
            .lister_with(&dir_path)
            .recursive(true)
            .await?;

        while let Some(entry) = lister.try_next().await? {
            // 目录自身和子目录占位对象不算内容
            if entry.path() != dir_path && !entry.metadata().is_dir() {
                return Ok(false);
            }
        }

        self.operator.remove_all(&dir_path).await?;
        Ok(true)
    }

    fn features(&self) -> &Features {
        &self.features
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::etag_md5;

    #[test]
    fn test_etag_md5_only_for_single_part() {
        assert_eq!(
            etag_md5(Some("\"9E107D9D372BB6826BD81D3542A419D6\"")).as_deref(),
            Some("9e107d9d372bb6826bd81d3542a419d6")
        );
        assert_eq!(etag_md5(Some("\"9e107d9d372bb6826bd81d3542a419d6-3\"")), None);
        assert_eq!(etag_md5(None), None);
    }
}
