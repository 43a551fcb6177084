//! 列表快照：一侧文件树在某次运行时的状态

use crate::core::Side;
use crate::storage::FileInfo;
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use regex::Regex;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use unicode_normalization::UnicodeNormalization;

/// 列表文件头
pub const LISTING_HEADER: &str = "# bisync listing";
pub const LISTING_VERSION: &str = "v1";
/// 修改时间格式，纳秒精度并带时区偏移
pub const TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.9f%z";

/// 一侧的一个文件或目录
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRecord {
    /// 存储上的实际路径
    pub name: String,
    /// -1 表示未知
    pub size: i64,
    pub mod_time: Option<DateTime<Utc>>,
    /// 空字符串表示未记录哈希
    pub hash: String,
    pub is_dir: bool,
}

impl FileRecord {
    pub fn file(
        name: impl Into<String>,
        size: i64,
        mod_time: Option<DateTime<Utc>>,
        hash: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            size,
            mod_time,
            hash: hash.into(),
            is_dir: false,
        }
    }

    pub fn dir(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            size: -1,
            mod_time: None,
            hash: String::new(),
            is_dir: true,
        }
    }

    pub fn from_info(info: &FileInfo) -> Self {
        if info.is_dir {
            return Self::dir(&info.path);
        }
        Self::file(
            &info.path,
            info.size,
            info.modified_time,
            info.checksum
                .as_ref()
                .map(|c| c.value.clone())
                .unwrap_or_default(),
        )
    }

    fn to_line(&self) -> Result<String> {
        let flag = if self.is_dir { "d" } else { "-" };
        let hash = if self.hash.is_empty() {
            "-"
        } else {
            self.hash.as_str()
        };
        let time = self
            .mod_time
            .map(|t| t.format(TIME_FORMAT).to_string())
            .unwrap_or_else(|| "-".to_string());
        let name = serde_json::to_string(&self.name)?;
        Ok(format!("{} {} {} {} {}", flag, self.size, hash, time, name))
    }

    fn parse_line(line: &str) -> Result<Self> {
        let caps = line_regex()?
            .captures(line)
            .ok_or_else(|| anyhow!("格式不正确"))?;
        let is_dir = &caps[1] == "d";
        let size: i64 = caps[2].parse().context("大小无效")?;
        let hash = match &caps[3] {
            "-" => String::new(),
            h => h.to_string(),
        };
        let mod_time = match &caps[4] {
            "-" => None,
            t => Some(
                DateTime::parse_from_str(t, TIME_FORMAT)
                    .with_context(|| format!("修改时间无效: {}", t))?
                    .with_timezone(&Utc),
            ),
        };
        let name: String = serde_json::from_str(&caps[5]).context("文件名无效")?;

        Ok(Self {
            name,
            size,
            mod_time,
            hash,
            is_dir,
        })
    }
}

/// 有序的路径到记录的映射
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Listing {
    records: BTreeMap<String, FileRecord>,
    normalize: bool,
}

impl Listing {
    /// `normalize` 时以 NFC 形式作为键，使不同后端的同名文件能够配对
    pub fn new(normalize: bool) -> Self {
        Self {
            records: BTreeMap::new(),
            normalize,
        }
    }

    /// 实际文件名对应的键
    pub fn key(&self, name: &str) -> String {
        if self.normalize {
            name.nfc().collect()
        } else {
            name.to_string()
        }
    }

    pub fn insert(&mut self, record: FileRecord) {
        let key = self.key(&record.name);
        self.records.insert(key, record);
    }

    pub fn get(&self, key: &str) -> Option<&FileRecord> {
        self.records.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.records.contains_key(key)
    }

    pub fn remove(&mut self, key: &str) -> Option<FileRecord> {
        self.records.remove(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &FileRecord)> {
        self.records.iter()
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.records.keys()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn file_count(&self) -> usize {
        self.records.values().filter(|r| !r.is_dir).count()
    }

    /// 在 key 写入文件前是否要先腾出位置：该处是目录，或上级路径是文件
    pub fn occupied_for_file(&self, key: &str) -> bool {
        if self.get(key).is_some_and(|r| r.is_dir) {
            return true;
        }
        let prefix = format!("{}/", key);
        let has_children = self
            .records
            .range(prefix.clone()..)
            .next()
            .is_some_and(|(k, _)| k.starts_with(&prefix));
        if has_children {
            return true;
        }
        let mut parent = key;
        while let Some((head, _)) = parent.rsplit_once('/') {
            if self.get(head).is_some_and(|r| !r.is_dir) {
                return true;
            }
            parent = head;
        }
        false
    }

    /// 原子写入：先写临时文件再改名
    pub fn save(&self, path: &Path) -> Result<()> {
        let mut out = format!(
            "{} {} from {}\n",
            LISTING_HEADER,
            LISTING_VERSION,
            Utc::now().format(TIME_FORMAT)
        );
        for record in self.records.values() {
            out.push_str(&record.to_line()?);
            out.push('\n');
        }

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("创建工作目录失败: {:?}", parent))?;
        }
        let tmp = tmp_path(path);
        std::fs::write(&tmp, out).with_context(|| format!("写入列表失败: {:?}", tmp))?;
        std::fs::rename(&tmp, path).with_context(|| format!("保存列表失败: {:?}", path))?;
        Ok(())
    }

    /// 读取列表文件，不存在时返回 None
    pub fn load(path: &Path, normalize: bool) -> Result<Option<Self>> {
        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(anyhow!("读取列表失败 {:?}: {}", path, e)),
        };

        let mut listing = Listing::new(normalize);
        for (index, line) in content.lines().enumerate() {
            let line = line.trim_end_matches('\r');
            if line.trim().is_empty() {
                continue;
            }
            if let Some(rest) = line.strip_prefix(LISTING_HEADER) {
                let version = rest.split_whitespace().next().unwrap_or_default();
                if version != LISTING_VERSION {
                    return Err(anyhow!(
                        "不支持的列表格式版本 {:?}: {:?}",
                        version,
                        path
                    ));
                }
                continue;
            }
            if line.starts_with('#') {
                continue;
            }
            let record = FileRecord::parse_line(line)
                .with_context(|| format!("列表 {:?} 第 {} 行无法解析", path, index + 1))?;
            listing.insert(record);
        }
        Ok(Some(listing))
    }
}

fn line_regex() -> Result<&'static Regex> {
    static LINE_RE: OnceLock<Regex> = OnceLock::new();
    if let Some(re) = LINE_RE.get() {
        return Ok(re);
    }
    let re = Regex::new(r#"^([-d]) (-?\d+) (\S+) (\S+) (".*")$"#)?;
    Ok(LINE_RE.get_or_init(|| re))
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    path.with_file_name(name)
}

/// 把存储名转换为可用作文件名的形式
pub fn canonical_name(name: &str) -> String {
    let replaced: String = name
        .chars()
        .map(|c| match c {
            ':' | '/' | '\\' => '_',
            c => c,
        })
        .collect();
    replaced.trim_matches('_').to_string()
}

/// 会话相关文件的位置
#[derive(Debug, Clone)]
pub struct SessionPaths {
    pub session: String,
    base: PathBuf,
    /// 本次调用的 Path1 在会话名中排在第二位
    swapped: bool,
}

impl SessionPaths {
    /// 会话名与两侧的先后顺序无关
    pub fn new(workdir: &Path, name1: &str, name2: &str) -> Self {
        let c1 = canonical_name(name1);
        let c2 = canonical_name(name2);
        let swapped = c1 > c2;
        let session = if swapped {
            format!("{}..{}", c2, c1)
        } else {
            format!("{}..{}", c1, c2)
        };
        Self {
            base: workdir.join(&session),
            session,
            swapped,
        }
    }

    fn slot(&self, side: Side) -> u8 {
        match (side, self.swapped) {
            (Side::Path1, false) | (Side::Path2, true) => 1,
            _ => 2,
        }
    }

    fn with_suffix(&self, suffix: &str) -> PathBuf {
        let mut name = self.base.as_os_str().to_os_string();
        name.push(suffix);
        PathBuf::from(name)
    }

    pub fn listing(&self, side: Side) -> PathBuf {
        self.with_suffix(&format!(".path{}.lst", self.slot(side)))
    }

    pub fn listing_err(&self, side: Side) -> PathBuf {
        self.with_suffix(&format!(".path{}.lst-err", self.slot(side)))
    }

    pub fn queue_file(&self, label: &str) -> PathBuf {
        self.with_suffix(&format!(".{}.que", label))
    }

    pub fn lock_file(&self) -> PathBuf {
        self.with_suffix(".lck")
    }

    /// 严重错误后把当前列表改名，下次运行必须 resync
    pub fn mark_listings_failed(&self) -> Result<()> {
        for side in [Side::Path1, Side::Path2] {
            let from = self.listing(side);
            if from.exists() {
                std::fs::rename(&from, self.listing_err(side))
                    .with_context(|| format!("重命名列表失败: {:?}", from))?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_occupied_for_file() {
        let mut listing = Listing::new(true);
        listing.insert(FileRecord::dir("d"));
        listing.insert(FileRecord::file("tree/leaf", 1, None, ""));
        listing.insert(FileRecord::file("plain", 1, None, ""));
        listing.insert(FileRecord::file("tree0", 1, None, ""));

        assert!(listing.occupied_for_file("d"));
        assert!(listing.occupied_for_file("tree"));
        assert!(listing.occupied_for_file("plain/inner.txt"));
        assert!(!listing.occupied_for_file("plain"));
        assert!(!listing.occupied_for_file("tre"));
        assert!(!listing.occupied_for_file("new/file.txt"));
    }

    #[test]
    fn test_listing_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("s.path1.lst");

        let mut listing = Listing::new(true);
        let t = DateTime::from_timestamp(1_700_000_000, 123_456_789);
        listing.insert(FileRecord::file("a b/c \"d\".txt", 12, t, "abcd"));
        listing.insert(FileRecord::file("unknown", -1, None, ""));
        listing.insert(FileRecord::dir("a b"));
        listing.save(&path).unwrap();

        let loaded = Listing::load(&path, true).unwrap().unwrap();
        assert_eq!(loaded, listing);
        let rec = loaded.get("a b/c \"d\".txt").unwrap();
        assert_eq!(rec.mod_time, t);
        assert_eq!(rec.hash, "abcd");
        assert_eq!(loaded.file_count(), 2);
    }

    #[test]
    fn test_load_missing_and_malformed() {
        let dir = TempDir::new().unwrap();
        assert!(Listing::load(&dir.path().join("none.lst"), true)
            .unwrap()
            .is_none());

        let bad = dir.path().join("bad.lst");
        std::fs::write(&bad, "# bisync listing v1 from x\n\n- 1 - - \"ok\"\nnot a line\n").unwrap();
        let err = Listing::load(&bad, true).unwrap_err();
        assert!(format!("{:#}", err).contains("第 4 行"));

        let future = dir.path().join("future.lst");
        std::fs::write(&future, "# bisync listing v9 from x\n").unwrap();
        assert!(Listing::load(&future, true).is_err());
    }

    #[test]
    fn test_nfc_keys_pair_up() {
        let mut listing = Listing::new(true);
        // "é" 的分解形式
        listing.insert(FileRecord::file("cafe\u{301}.txt", 1, None, ""));
        assert!(listing.contains("caf\u{e9}.txt"));
        assert_eq!(
            listing.get("caf\u{e9}.txt").unwrap().name,
            "cafe\u{301}.txt"
        );

        let raw = Listing::new(false);
        assert_eq!(raw.key("cafe\u{301}"), "cafe\u{301}");
    }

    #[test]
    fn test_session_name_is_order_independent() {
        let work = Path::new("/work");
        let a = SessionPaths::new(work, "local:/data/a", "s3://bucket/x");
        let b = SessionPaths::new(work, "s3://bucket/x", "local:/data/a");
        assert_eq!(a.session, b.session);
        assert_eq!(a.session, "local__data_a..s3___bucket_x");
        assert_eq!(a.listing(Side::Path1), b.listing(Side::Path2));
        assert_eq!(
            a.listing(Side::Path2),
            PathBuf::from("/work/local__data_a..s3___bucket_x.path2.lst")
        );
        assert_eq!(
            a.lock_file(),
            PathBuf::from("/work/local__data_a..s3___bucket_x.lck")
        );
    }
}
