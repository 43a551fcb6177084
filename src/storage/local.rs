use super::{
    ByteStream, FileInfo, FileMeta, Features, HashType, Hashes, Storage, StreamHasher,
    CHUNK_SIZE, PARTIAL_SUFFIX,
};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use walkdir::WalkDir;

pub struct LocalStorage {
    base_path: PathBuf,
    name: String,
    features: Features,
}

impl LocalStorage {
    pub fn new(path: &str) -> Result<Self> {
        let base_path = PathBuf::from(path);
        if !base_path.exists() {
            std::fs::create_dir_all(&base_path)?;
        }
        let name = format!("local:{}", path);
        Ok(Self {
            base_path,
            name,
            features: Features {
                precision: Some(Duration::from_nanos(1)),
                hashes: Hashes::new(&[HashType::Blake3, HashType::Xxh3]),
                slow_hash: true,
                can_set_modtime: true,
            },
        })
    }

    fn resolve_path(&self, path: &str) -> PathBuf {
        let path = path.trim_start_matches('/').trim_start_matches('\\');
        if path.is_empty() {
            self.base_path.clone()
        } else {
            self.base_path.join(path)
        }
    }

    /// 规范化路径分隔符（统一使用 /）
    fn normalize_path(path: &str) -> String {
        path.replace('\\', "/")
    }
}

/// 流式计算文件哈希，避免整个文件读入内存
fn hash_file(path: &Path, ht: HashType) -> Result<Option<String>> {
    let Some(mut hasher) = StreamHasher::new(ht) else {
        return Ok(None);
    };
    let mut file = std::fs::File::open(path)?;
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(Some(hasher.finish()))
}

/// 遍历目录树，任何无法读取的条目都使整个列表失败
fn walk(base: &Path) -> Result<Vec<FileInfo>> {
    let mut files = Vec::new();
    for entry in WalkDir::new(base).follow_links(false) {
        let entry = entry.map_err(|e| anyhow!("遍历目录失败: {}", e))?;
        let relative = entry
            .path()
            .strip_prefix(base)
            .map_err(|e| anyhow!("路径不在根目录下 {:?}: {}", entry.path(), e))?;
        // 跳过根目录本身
        if relative.as_os_str().is_empty() {
            continue;
        }
        let relative = relative
            .to_str()
            .ok_or_else(|| anyhow!("文件名不是有效的 UTF-8: {:?}", entry.path()))?;
        let metadata = entry
            .metadata()
            .map_err(|e| anyhow!("读取元数据失败 {:?}: {}", entry.path(), e))?;

        files.push(FileInfo {
            path: LocalStorage::normalize_path(relative),
            size: if metadata.is_dir() { 0 } else { metadata.len() as i64 },
            modified_time: metadata.modified().ok().map(DateTime::<Utc>::from),
            is_dir: metadata.is_dir(),
            checksum: None,
        });
    }
    Ok(files)
}

#[async_trait]
impl Storage for LocalStorage {
    async fn list_files(&self) -> Result<Vec<FileInfo>> {
        let base = self.base_path.clone();

        if !base.exists() {
            return Ok(Vec::new());
        }

        // 使用 spawn_blocking 避免阻塞 async runtime
        tokio::task::spawn_blocking(move || walk(&base)).await?
    }

    async fn stat(&self, path: &str) -> Result<Option<FileMeta>> {
        let full_path = self.resolve_path(path);

        match fs::metadata(&full_path).await {
            Ok(metadata) => Ok(Some(FileMeta {
                size: if metadata.is_dir() { 0 } else { metadata.len() as i64 },
                modified_time: metadata.modified().ok().map(DateTime::<Utc>::from),
                is_dir: metadata.is_dir(),
                etag: None,
            })),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn read(&self, path: &str) -> Result<Vec<u8>> {
        let data = fs::read(self.resolve_path(path)).await?;
        Ok(data)
    }

    async fn read_range(&self, path: &str, offset: u64, length: u64) -> Result<Vec<u8>> {
        let mut file = fs::File::open(self.resolve_path(path)).await?;
        file.seek(std::io::SeekFrom::Start(offset)).await?;
        let mut data = Vec::with_capacity(length.min(CHUNK_SIZE) as usize);
        file.take(length).read_to_end(&mut data).await?;
        Ok(data)
    }

    async fn write(&self, path: &str, data: Vec<u8>) -> Result<()> {
        let stream = futures::stream::once(async move { Ok(data) });
        self.write_stream(path, Box::pin(stream), None).await
    }

    async fn write_stream(
        &self,
        path: &str,
        mut stream: ByteStream,
        _total_size: Option<u64>,
    ) -> Result<()> {
        let full_path = self.resolve_path(path);

        if let Some(parent) = full_path.parent() {
            fs::create_dir_all(parent).await?;
        }

        // 使用隐藏的临时文件写入，然后原子重命名
        let file_name = full_path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| anyhow!("无效的文件名: {}", path))?;
        let temp_path = full_path.with_file_name(format!(".{}{}", file_name, PARTIAL_SUFFIX));

        // 写入或重命名失败时清理临时文件
        let guard = scopeguard::guard(temp_path.clone(), |p| {
            let _ = std::fs::remove_file(p);
        });
        let mut file = fs::File::create(&temp_path).await?;
        while let Some(chunk) = stream.next().await {
            file.write_all(&chunk?).await?;
        }
        file.flush().await?;
        drop(file);
        fs::rename(&temp_path, &full_path).await?;
        let _ = scopeguard::ScopeGuard::into_inner(guard);

        Ok(())
    }

    async fn set_modtime(&self, path: &str, time: DateTime<Utc>) -> Result<()> {
        let full_path = self.resolve_path(path);
        let mtime = filetime::FileTime::from_system_time(SystemTime::from(time));
        tokio::task::spawn_blocking(move || filetime::set_file_mtime(&full_path, mtime)).await??;
        Ok(())
    }

    async fn hash(&self, path: &str, ht: HashType) -> Result<Option<String>> {
        if !self.features.hashes.contains(ht) {
            return Ok(None);
        }
        let full_path = self.resolve_path(path);
        tokio::task::spawn_blocking(move || hash_file(&full_path, ht)).await?
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let full_path = self.resolve_path(path);

        match fs::symlink_metadata(&full_path).await {
            Ok(meta) if meta.is_dir() => fs::remove_dir(&full_path).await?,
            Ok(_) => fs::remove_file(&full_path).await?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        Ok(())
    }

    async fn create_dir(&self, path: &str) -> Result<()> {
        let full_path = self.resolve_path(path);
        fs::create_dir_all(&full_path).await?;
        Ok(())
    }

    async fn remove_empty_dir(&self, path: &str) -> Result<bool> {
        let full_path = self.resolve_path(path);
        if full_path == self.base_path {
            return Ok(false);
        }
        if !full_path.exists() {
            return Ok(true);
        }

        // 目录树中只要还有文件就保留；只剩空子目录时整体删除
        let scan_path = full_path.clone();
        let has_files = tokio::task::spawn_blocking(move || {
            WalkDir::new(&scan_path)
                .into_iter()
                // 读不到的条目按有内容处理
                .any(|e| e.map(|e| !e.file_type().is_dir()).unwrap_or(true))
        })
        .await?;

        if has_files {
            return Ok(false);
        }

        fs::remove_dir_all(&full_path).await?;
        Ok(true)
    }

    async fn rename(&self, from: &str, to: &str) -> Result<()> {
        let to_path = self.resolve_path(to);
        if let Some(parent) = to_path.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::rename(self.resolve_path(from), &to_path).await?;
        Ok(())
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
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_write_list_and_modtime() -> Result<()> {
        let dir = TempDir::new()?;
        let storage = LocalStorage::new(dir.path().to_str().unwrap())?;

        storage.write("sub/a.txt", b"hello".to_vec()).await?;
        let t = DateTime::parse_from_rfc3339("2023-05-01T10:00:00.123456789Z")?.with_timezone(&Utc);
        storage.set_modtime("sub/a.txt", t).await?;

        let files = storage.list_files().await?;
        let file = files.iter().find(|f| f.path == "sub/a.txt").unwrap();
        assert_eq!(file.size, 5);
        assert_eq!(file.modified_time, Some(t));
        assert!(files.iter().any(|f| f.path == "sub" && f.is_dir));
        // 临时文件不会残留
        assert!(!files.iter().any(|f| f.path.ends_with(PARTIAL_SUFFIX)));
        Ok(())
    }

    #[tokio::test]
    async fn test_hash_matches_in_memory() -> Result<()> {
        let dir = TempDir::new()?;
        let storage = LocalStorage::new(dir.path().to_str().unwrap())?;
        storage.write("a.bin", vec![7u8; 200_000]).await?;

        let streamed = storage.hash("a.bin", HashType::Blake3).await?;
        assert_eq!(streamed, super::super::compute_hash(HashType::Blake3, &vec![7u8; 200_000]));
        let streamed = storage.hash("a.bin", HashType::Xxh3).await?;
        assert_eq!(streamed, super::super::compute_hash(HashType::Xxh3, &vec![7u8; 200_000]));
        assert_eq!(storage.hash("a.bin", HashType::Md5).await?, None);
        Ok(())
    }

    #[tokio::test]
    async fn test_read_range_and_stream_write() -> Result<()> {
        let dir = TempDir::new()?;
        let storage = LocalStorage::new(dir.path().to_str().unwrap())?;
        storage.write("a.txt", b"0123456789".to_vec()).await?;
        assert_eq!(storage.read_range("a.txt", 2, 3).await?, b"234");
        assert_eq!(storage.read_range("a.txt", 8, 100).await?, b"89");

        let chunks: Vec<Result<Vec<u8>>> = vec![Ok(b"ab".to_vec()), Ok(b"cd".to_vec())];
        storage
            .write_stream("deep/b.txt", Box::pin(futures::stream::iter(chunks)), Some(4))
            .await?;
        assert_eq!(std::fs::read(dir.path().join("deep/b.txt"))?, b"abcd");

        // 流出错时不留下目标文件和临时文件
        let failing: Vec<Result<Vec<u8>>> = vec![Ok(b"x".to_vec()), Err(anyhow!("boom"))];
        let err = storage
            .write_stream("c.txt", Box::pin(futures::stream::iter(failing)), None)
            .await;
        assert!(err.is_err());
        assert!(!dir.path().join("c.txt").exists());
        assert!(!dir.path().join(".c.txt.bisync-partial").exists());
        Ok(())
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_list_fails_on_non_utf8_name() -> Result<()> {
        use std::ffi::OsStr;
        use std::os::unix::ffi::OsStrExt;

        let dir = TempDir::new()?;
        let storage = LocalStorage::new(dir.path().to_str().unwrap())?;
        storage.write("ok.txt", b"x".to_vec()).await?;
        std::fs::write(dir.path().join(OsStr::from_bytes(b"bad\xff.txt")), b"x")?;

        assert!(storage.list_files().await.is_err());
        Ok(())
    }

    #[tokio::test]
    async fn test_remove_empty_dir_keeps_files() -> Result<()> {
        let dir = TempDir::new()?;
        let storage = LocalStorage::new(dir.path().to_str().unwrap())?;
        storage.create_dir("empty/inner").await?;
        storage.write("full/x.txt", b"x".to_vec()).await?;

        assert!(storage.remove_empty_dir("empty").await?);
        assert!(!dir.path().join("empty").exists());
        assert!(!storage.remove_empty_dir("full").await?);
        assert!(dir.path().join("full/x.txt").exists());
        Ok(())
    }
}
