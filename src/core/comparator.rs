use crate::config::BisyncOptions;
use crate::core::delta::DeltaKind;
use crate::core::listing::FileRecord;
use crate::core::Side;
use crate::error::{BisyncError, BisyncResult};
use crate::storage::{Features, HashType};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, info, warn};

/// 比较请求（来自命令行或任务配置）
#[derive(Debug, Clone, Default)]
pub struct CompareFlags {
    pub size_only: bool,
    pub checksum: bool,
    pub ignore_size: bool,
    /// 显式比较项，逗号分隔
    pub compare: String,
    pub ignore_listing_checksum: bool,
    pub no_slow_hash: bool,
}

impl From<&BisyncOptions> for CompareFlags {
    fn from(opt: &BisyncOptions) -> Self {
        Self {
            size_only: opt.size_only,
            checksum: opt.checksum,
            ignore_size: opt.ignore_size,
            compare: opt.compare.clone(),
            ignore_listing_checksum: opt.ignore_listing_checksum,
            no_slow_hash: opt.no_slow_hash,
        }
    }
}

/// 本次运行生效的比较策略，初始化后不再修改
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompareOpt {
    pub size: bool,
    pub modtime: bool,
    pub checksum: bool,
    pub hash_type1: HashType,
    pub hash_type2: HashType,
    pub no_slow_hash: bool,
}

impl CompareOpt {
    /// 根据请求和两侧能力确定比较策略
    pub fn resolve(flags: &CompareFlags, f1: &Features, f2: &Features) -> BisyncResult<Self> {
        // 默认比较大小和修改时间
        let mut opt = CompareOpt {
            size: true,
            modtime: true,
            checksum: false,
            hash_type1: HashType::None,
            hash_type2: HashType::None,
            no_slow_hash: flags.no_slow_hash,
        };

        if flags.size_only {
            opt.size = true;
            opt.modtime = false;
            opt.checksum = false;
        } else if flags.checksum && !flags.ignore_listing_checksum {
            opt.size = true;
            opt.modtime = false;
            opt.checksum = true;
        }

        if flags.ignore_size {
            opt.size = false;
        }

        opt.apply_compare_flag(&flags.compare)?;

        if opt.checksum && !flags.ignore_listing_checksum {
            opt.set_hash_type(f1, f2);
        }

        // 能力检查，只警告不改变流程
        if opt.modtime && (f1.precision.is_none() || f2.precision.is_none()) {
            warn!("请求比较修改时间，但至少一侧存储不支持修改时间，建议改用 checksum 或 size-only");
        }
        if opt.checksum
            && (opt.hash_type1 == HashType::None || opt.hash_type2 == HashType::None)
        {
            warn!(
                "请求比较校验和，但至少一侧存储不支持校验和: Path1={}, Path2={}",
                opt.hash_type1, opt.hash_type2
            );
        }
        if (flags.checksum || opt.checksum) && flags.ignore_listing_checksum {
            warn!("已设置 ignoreListingChecksum，差异检测将忽略校验和");
        }

        if !opt.size && !opt.modtime && !opt.checksum {
            return Err(BisyncError::config(
                "必须设置至少一种比较方式（size、modtime、checksum 不能全部关闭）",
            ));
        }

        debug!("比较策略: {:?}", opt);
        Ok(opt)
    }

    /// 解析显式比较项，每一项强制开启
    fn apply_compare_flag(&mut self, compare: &str) -> BisyncResult<()> {
        if compare.trim().is_empty() {
            return Ok(());
        }
        for token in compare.split(',') {
            match token.trim().to_lowercase().as_str() {
                "size" => self.size = true,
                "modtime" => self.modtime = true,
                "checksum" => self.checksum = true,
                _ => {
                    return Err(BisyncError::config(format!(
                        "未知的比较项: {}（只能是 size、modtime 或 checksum）",
                        token
                    )))
                }
            }
        }
        Ok(())
    }

    /// 选择哈希类型，优先两侧共同支持的类型
    fn set_hash_type(&mut self, f1: &Features, f2: &Features) {
        if self.no_slow_hash && (f1.slow_hash || f2.slow_hash) {
            info!("至少一侧哈希较慢，不协商共同哈希");
        } else {
            let common = f1.hashes.overlap(f2.hashes);
            if common.count() > 0 && common.get_one() != HashType::None {
                let ht = common.get_one();
                self.hash_type1 = ht;
                self.hash_type2 = ht;
                return;
            }
        }

        warn!("两侧没有共同的哈希类型，回退为比较修改时间和大小");
        self.modtime = true;
        self.size = true;

        // 各侧独立选择哈希，仅用于同侧差异检测
        if self.no_slow_hash && f1.slow_hash {
            info!("Path1 哈希较慢，按 noSlowHash 忽略校验和");
            self.hash_type1 = HashType::None;
        } else {
            self.hash_type1 = f1.hashes.get_one();
            if self.hash_type1 != HashType::None {
                info!("Path1 将使用 {} 检测同侧差异", self.hash_type1);
            }
        }
        if self.no_slow_hash && f2.slow_hash {
            info!("Path2 哈希较慢，按 noSlowHash 忽略校验和");
            self.hash_type2 = HashType::None;
        } else {
            self.hash_type2 = f2.hashes.get_one();
            if self.hash_type2 != HashType::None {
                info!("Path2 将使用 {} 检测同侧差异", self.hash_type2);
            }
        }
    }

    pub fn hash_type(&self, side: Side) -> HashType {
        match side {
            Side::Path1 => self.hash_type1,
            Side::Path2 => self.hash_type2,
        }
    }

    /// 该侧列表是否需要记录哈希
    pub fn wants_hash(&self, side: Side) -> bool {
        self.checksum && self.hash_type(side) != HashType::None
    }
}

/// 修改时间容差
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModifyWindow {
    NotSupported,
    Window(Duration),
}

/// 取两侧精度中较粗的一个
pub fn modify_window(a: &Features, b: &Features) -> ModifyWindow {
    match (a.precision, b.precision) {
        (Some(x), Some(y)) => ModifyWindow::Window(x.max(y)),
        _ => ModifyWindow::NotSupported,
    }
}

/// 大小确定不同时返回 true，任一未知返回 false
pub fn size_differs(a: i64, b: i64) -> bool {
    if a < 0 || b < 0 {
        return false;
    }
    a != b
}

/// 哈希确定不同时返回 true，任一缺失或类型不同返回 false
pub fn hash_differs(a: &str, b: &str, ht1: HashType, ht2: HashType, size1: i64, size2: i64) -> bool {
    if a.is_empty() || b.is_empty() {
        if ht1 != HashType::None && ht2 != HashType::None && !(size1 <= 0 || size2 <= 0) {
            warn!("存储支持哈希但哈希为空 ({}, {})，可能需要 resync", a, b);
        }
        return false;
    }
    if ht1 != ht2 {
        info!("无法比较不同类型的哈希 ({}, {})", ht1, ht2);
        return false;
    }
    a != b
}

fn is_missing(t: Option<DateTime<Utc>>) -> bool {
    match t {
        None => true,
        Some(t) => t.timestamp() == 0 && t.timestamp_subsec_nanos() == 0,
    }
}

/// 修改时间差超过容差时返回 true，任一未知或在容差内返回 false
pub fn time_differs(a: Option<DateTime<Utc>>, b: Option<DateTime<Utc>>, window: ModifyWindow) -> bool {
    let window = match window {
        ModifyWindow::NotSupported => return false,
        ModifyWindow::Window(w) => w,
    };
    if is_missing(a) || is_missing(b) {
        warn!("存储支持修改时间，但修改时间缺失");
        return false;
    }
    let (Some(a), Some(b)) = (a, b) else {
        return false;
    };

    let dt = match (b - a).num_nanoseconds() {
        Some(n) => n.unsigned_abs() as u128,
        None => u128::MAX,
    };
    if dt < window.as_nanos() {
        debug!("修改时间相同（相差 {}ns，容差 {:?}）", dt, window);
        return false;
    }

    debug!("修改时间不同（相差 {}ns）: {}, {}", dt, a, b);
    true
}

/// 文件比较器
#[derive(Debug, Clone)]
pub struct FileComparator {
    opt: CompareOpt,
    window1: ModifyWindow,
    window2: ModifyWindow,
    cross_window: ModifyWindow,
}

impl FileComparator {
    pub fn new(opt: CompareOpt, f1: &Features, f2: &Features) -> Self {
        Self {
            opt,
            window1: modify_window(f1, f1),
            window2: modify_window(f2, f2),
            cross_window: modify_window(f1, f2),
        }
    }

    pub fn opt(&self) -> &CompareOpt {
        &self.opt
    }

    fn window(&self, side: Side) -> ModifyWindow {
        match side {
            Side::Path1 => self.window1,
            Side::Path2 => self.window2,
        }
    }

    /// 比较同一侧的上次快照与当前状态
    pub fn classify(&self, side: Side, prior: &FileRecord, current: &FileRecord) -> DeltaKind {
        // 文件与目录互换视为删除旧路径后新增
        if prior.is_dir || current.is_dir {
            return if prior.is_dir == current.is_dir {
                DeltaKind::Unchanged
            } else {
                DeltaKind::New
            };
        }

        let ht = self.opt.hash_type(side);
        let time_changed =
            self.opt.modtime && time_differs(prior.mod_time, current.mod_time, self.window(side));
        let size_changed = self.opt.size && size_differs(prior.size, current.size);
        let hash_changed = self.opt.checksum
            && hash_differs(&prior.hash, &current.hash, ht, ht, prior.size, current.size);

        if time_changed {
            return if current.mod_time > prior.mod_time {
                DeltaKind::Newer
            } else {
                DeltaKind::Older
            };
        }
        if size_changed || hash_changed {
            DeltaKind::Changed
        } else {
            DeltaKind::Unchanged
        }
    }

    /// 两侧文件按当前比较策略是否相同
    pub fn files_equal(&self, r1: &FileRecord, r2: &FileRecord) -> bool {
        if r1.is_dir || r2.is_dir {
            return r1.is_dir == r2.is_dir;
        }
        if self.opt.size && size_differs(r1.size, r2.size) {
            return false;
        }
        if self.opt.modtime && time_differs(r1.mod_time, r2.mod_time, self.cross_window) {
            return false;
        }
        if self.opt.checksum
            && hash_differs(
                &r1.hash,
                &r2.hash,
                self.opt.hash_type1,
                self.opt.hash_type2,
                r1.size,
                r2.size,
            )
        {
            return false;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Hashes;

    fn local() -> Features {
        Features {
            precision: Some(Duration::from_nanos(1)),
            hashes: Hashes::new(&[HashType::Blake3, HashType::Xxh3]),
            slow_hash: true,
            can_set_modtime: true,
        }
    }

    fn s3() -> Features {
        Features {
            precision: None,
            hashes: Hashes::new(&[HashType::Md5]),
            slow_hash: false,
            can_set_modtime: false,
        }
    }

    fn at(secs: i64, nanos: u32) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp(secs, nanos)
    }

    #[test]
    fn test_size_differs() {
        assert!(!size_differs(-1, 5));
        assert!(!size_differs(5, -1));
        assert!(!size_differs(5, 5));
        assert!(size_differs(5, 6));
        assert!(size_differs(0, 6));
    }

    #[test]
    fn test_hash_differs() {
        let b3 = HashType::Blake3;
        assert!(!hash_differs("", "abc", b3, b3, 3, 3));
        assert!(!hash_differs("abc", "", b3, b3, 3, 3));
        assert!(!hash_differs("abc", "def", b3, HashType::Xxh3, 3, 3));
        assert!(!hash_differs("abc", "abc", b3, b3, 3, 3));
        assert!(hash_differs("abc", "def", b3, b3, 3, 3));
    }

    #[test]
    fn test_time_differs_window_and_symmetry() {
        let window = ModifyWindow::Window(Duration::from_secs(1));
        let a = at(1_700_000_000, 0);
        let b = at(1_700_000_000, 999_999_999);
        let c = at(1_700_000_001, 0);
        assert!(!time_differs(a, b, window));
        assert!(!time_differs(b, a, window));
        assert!(time_differs(a, c, window));
        assert!(time_differs(c, a, window));
        assert_eq!(time_differs(b, c, window), time_differs(c, b, window));
    }

    #[test]
    fn test_time_differs_unknown_is_equal() {
        let window = ModifyWindow::Window(Duration::from_nanos(1));
        assert!(!time_differs(None, at(10, 0), window));
        assert!(!time_differs(at(0, 0), at(10, 0), window));
        assert!(!time_differs(at(5, 0), at(10, 0), ModifyWindow::NotSupported));
        assert!(time_differs(at(5, 0), at(10, 0), window));
    }

    #[test]
    fn test_modify_window_takes_coarser() {
        let mut coarse = local();
        coarse.precision = Some(Duration::from_secs(2));
        assert_eq!(
            modify_window(&local(), &coarse),
            ModifyWindow::Window(Duration::from_secs(2))
        );
        assert_eq!(modify_window(&local(), &s3()), ModifyWindow::NotSupported);
    }

    #[test]
    fn test_resolve_defaults() {
        let opt = CompareOpt::resolve(&CompareFlags::default(), &local(), &local()).unwrap();
        assert!(opt.size && opt.modtime && !opt.checksum);
        assert_eq!(opt.hash_type1, HashType::None);
    }

    #[test]
    fn test_resolve_size_only_and_ignore_size() {
        let flags = CompareFlags {
            size_only: true,
            ..Default::default()
        };
        let opt = CompareOpt::resolve(&flags, &local(), &local()).unwrap();
        assert!(opt.size && !opt.modtime && !opt.checksum);

        let flags = CompareFlags {
            size_only: true,
            ignore_size: true,
            ..Default::default()
        };
        let err = CompareOpt::resolve(&flags, &local(), &local()).unwrap_err();
        assert!(matches!(err, BisyncError::Config(_)));
    }

    #[test]
    fn test_resolve_checksum_common_hash() {
        let flags = CompareFlags {
            checksum: true,
            ..Default::default()
        };
        let opt = CompareOpt::resolve(&flags, &local(), &local()).unwrap();
        assert!(opt.size && !opt.modtime && opt.checksum);
        assert_eq!(opt.hash_type1, HashType::Blake3);
        assert_eq!(opt.hash_type2, HashType::Blake3);
    }

    #[test]
    fn test_resolve_checksum_without_common_hash_falls_back() {
        let flags = CompareFlags {
            checksum: true,
            ..Default::default()
        };
        let opt = CompareOpt::resolve(&flags, &local(), &s3()).unwrap();
        assert!(opt.size && opt.modtime && opt.checksum);
        assert_eq!(opt.hash_type1, HashType::Blake3);
        assert_eq!(opt.hash_type2, HashType::Md5);

        // noSlowHash 下本地侧不计算哈希
        let flags = CompareFlags {
            checksum: true,
            no_slow_hash: true,
            ..Default::default()
        };
        let opt = CompareOpt::resolve(&flags, &local(), &s3()).unwrap();
        assert_eq!(opt.hash_type1, HashType::None);
        assert_eq!(opt.hash_type2, HashType::Md5);
    }

    #[test]
    fn test_resolve_ignore_listing_checksum() {
        let flags = CompareFlags {
            checksum: true,
            ignore_listing_checksum: true,
            ..Default::default()
        };
        let opt = CompareOpt::resolve(&flags, &local(), &local()).unwrap();
        assert!(opt.size && opt.modtime && !opt.checksum);
    }

    #[test]
    fn test_resolve_compare_flag() {
        let flags = CompareFlags {
            size_only: true,
            compare: "size, ModTime".to_string(),
            ..Default::default()
        };
        let opt = CompareOpt::resolve(&flags, &local(), &local()).unwrap();
        assert!(opt.size && opt.modtime && !opt.checksum);

        let flags = CompareFlags {
            compare: "size,inode".to_string(),
            ..Default::default()
        };
        assert!(matches!(
            CompareOpt::resolve(&flags, &local(), &local()),
            Err(BisyncError::Config(_))
        ));
    }

    #[test]
    fn test_resolve_is_deterministic() {
        let flags = CompareFlags {
            checksum: true,
            compare: "modtime".to_string(),
            ..Default::default()
        };
        let a = CompareOpt::resolve(&flags, &local(), &s3()).unwrap();
        let b = CompareOpt::resolve(&flags, &local(), &s3()).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_classify_and_equal() {
        let opt = CompareOpt::resolve(&CompareFlags::default(), &local(), &local()).unwrap();
        let cmp = FileComparator::new(opt, &local(), &local());
        let prior = FileRecord::file("a.txt", 5, at(100, 0), "");
        let newer = FileRecord::file("a.txt", 5, at(200, 0), "");
        let older = FileRecord::file("a.txt", 5, at(50, 0), "");
        let resized = FileRecord::file("a.txt", 6, at(100, 0), "");

        assert_eq!(cmp.classify(Side::Path1, &prior, &prior), DeltaKind::Unchanged);
        assert_eq!(cmp.classify(Side::Path1, &prior, &newer), DeltaKind::Newer);
        assert_eq!(cmp.classify(Side::Path1, &prior, &older), DeltaKind::Older);
        assert_eq!(cmp.classify(Side::Path1, &prior, &resized), DeltaKind::Changed);
        let dir = FileRecord::dir("a.txt");
        assert_eq!(cmp.classify(Side::Path1, &prior, &dir), DeltaKind::New);
        assert_eq!(cmp.classify(Side::Path1, &dir, &prior), DeltaKind::New);
        assert_eq!(cmp.classify(Side::Path1, &dir, &dir), DeltaKind::Unchanged);
        assert!(cmp.files_equal(&prior, &prior));
        assert!(!cmp.files_equal(&prior, &newer));
    }
}
