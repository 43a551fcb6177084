//! 差异分类：上次快照 + 当前列表 → 每个路径的处理方式

use crate::core::comparator::FileComparator;
use crate::core::conflict::{ConflictKind, ConflictRecord};
use crate::core::listing::Listing;
use crate::core::Side;
use crate::error::{BisyncError, BisyncResult};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info};

/// 单侧差异类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DeltaKind {
    New,
    Newer,
    Older,
    /// 大小或哈希不同，但时间未判定先后
    Changed,
    Deleted,
    Unchanged,
    Conflict,
}

impl DeltaKind {
    pub fn is_change(self) -> bool {
        matches!(
            self,
            DeltaKind::New | DeltaKind::Newer | DeltaKind::Older | DeltaKind::Changed
        )
    }
}

/// 单个路径的差异
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeltaRecord {
    pub path: String,
    pub side: Side,
    pub kind: DeltaKind,
}

/// 一侧的全部差异
#[derive(Debug, Clone)]
pub struct SideDeltas {
    pub side: Side,
    pub deltas: BTreeMap<String, DeltaKind>,
    pub deleted_files: usize,
    pub prior_files: usize,
}

impl SideDeltas {
    pub fn get(&self, key: &str) -> Option<DeltaKind> {
        self.deltas.get(key).copied()
    }

    pub fn changes(&self) -> impl Iterator<Item = DeltaRecord> + '_ {
        self.deltas
            .iter()
            .filter(|(_, kind)| **kind != DeltaKind::Unchanged)
            .map(|(path, kind)| DeltaRecord {
                path: path.clone(),
                side: self.side,
                kind: *kind,
            })
    }

    /// 删除比例超过上限时中止
    pub fn check_max_delete(&self, max_delete: i64, force: bool) -> BisyncResult<()> {
        if force || self.prior_files == 0 || self.deleted_files == 0 {
            return Ok(());
        }
        let percent = (self.deleted_files * 100 / self.prior_files) as i64;
        if percent > max_delete {
            return Err(BisyncError::SafetyAbort(format!(
                "{} 删除了 {}/{} 个文件（{}%），超过 maxDelete={}%，如确认请使用 force",
                self.side, self.deleted_files, self.prior_files, percent, max_delete
            )));
        }
        Ok(())
    }
}

/// 对比同一侧的上次快照和当前列表
pub fn classify_side(
    side: Side,
    prior: &Listing,
    current: &Listing,
    comparator: &FileComparator,
) -> SideDeltas {
    let keys: BTreeSet<&String> = prior.keys().chain(current.keys()).collect();
    let mut deltas = BTreeMap::new();
    let mut deleted_files = 0;

    for key in keys {
        let kind = match (prior.get(key), current.get(key)) {
            (None, Some(_)) => DeltaKind::New,
            (Some(before), None) => {
                if !before.is_dir {
                    deleted_files += 1;
                }
                DeltaKind::Deleted
            }
            (Some(before), Some(now)) => {
                // 文件被目录取代，按删除计数
                if !before.is_dir && now.is_dir {
                    deleted_files += 1;
                }
                comparator.classify(side, before, now)
            }
            (None, None) => continue,
        };
        if kind != DeltaKind::Unchanged {
            debug!("{} {:?}: {}", side, kind, key);
        }
        deltas.insert(key.clone(), kind);
    }

    SideDeltas {
        side,
        deltas,
        deleted_files,
        prior_files: prior.file_count(),
    }
}

/// 合并后的处理方式
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    CopyTo(Side),
    DeleteOn(Side),
    MkdirOn(Side),
    RmdirOn(Side),
    Conflict(ConflictKind),
}

/// 合并两侧差异，未列出的路径无需处理
pub fn merge(
    d1: &SideDeltas,
    d2: &SideDeltas,
    current1: &Listing,
    current2: &Listing,
    comparator: &FileComparator,
) -> BTreeMap<String, Verdict> {
    let keys: BTreeSet<&String> = d1.deltas.keys().chain(d2.deltas.keys()).collect();
    let mut verdicts = BTreeMap::new();

    for key in keys {
        let k1 = d1.get(key);
        let k2 = d2.get(key);
        let c1 = current1.get(key);
        let c2 = current2.get(key);
        let changed1 = k1.is_some_and(DeltaKind::is_change);
        let changed2 = k2.is_some_and(DeltaKind::is_change);

        // 两侧当前已一致
        let in_sync = match (c1, c2) {
            (Some(a), Some(b)) => comparator.files_equal(a, b),
            _ => false,
        };

        let verdict = if changed1 && changed2 {
            if in_sync {
                None
            } else if c1.map(|r| r.is_dir) != c2.map(|r| r.is_dir) {
                Some(Verdict::Conflict(ConflictKind::TypeMismatch))
            } else {
                Some(Verdict::Conflict(ConflictKind::BothChanged))
            }
        } else if changed1 {
            propagate(Side::Path1, k2, c1.is_some_and(|r| r.is_dir), in_sync)
        } else if changed2 {
            propagate(Side::Path2, k1, c2.is_some_and(|r| r.is_dir), in_sync)
        } else {
            match (k1, k2) {
                (Some(DeltaKind::Deleted), Some(DeltaKind::Unchanged)) => Some(
                    if c2.is_some_and(|r| r.is_dir) {
                        Verdict::RmdirOn(Side::Path2)
                    } else {
                        Verdict::DeleteOn(Side::Path2)
                    },
                ),
                (Some(DeltaKind::Unchanged), Some(DeltaKind::Deleted)) => Some(
                    if c1.is_some_and(|r| r.is_dir) {
                        Verdict::RmdirOn(Side::Path1)
                    } else {
                        Verdict::DeleteOn(Side::Path1)
                    },
                ),
                _ => None,
            }
        };

        if let Some(v) = verdict {
            verdicts.insert(key.clone(), v);
        }
    }

    info!("合并差异完成: {} 个路径需要处理", verdicts.len());
    verdicts
}

/// 一侧有修改时向另一侧传播
fn propagate(
    from: Side,
    other: Option<DeltaKind>,
    is_dir: bool,
    in_sync: bool,
) -> Option<Verdict> {
    let to = from.other();
    match other {
        Some(DeltaKind::Deleted) if !is_dir => {
            Some(Verdict::Conflict(ConflictKind::ModifiedDeleted { deleted: to }))
        }
        _ if in_sync => None,
        _ if is_dir => Some(Verdict::MkdirOn(to)),
        _ => Some(Verdict::CopyTo(to)),
    }
}

/// 转为冲突记录
pub fn conflict_record(
    key: &str,
    kind: ConflictKind,
    d1: &SideDeltas,
    d2: &SideDeltas,
) -> ConflictRecord {
    ConflictRecord {
        path: key.to_string(),
        kind,
        side1_kind: d1.get(key).unwrap_or(DeltaKind::Unchanged),
        side2_kind: d2.get(key).unwrap_or(DeltaKind::Unchanged),
        resolution: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::comparator::{CompareFlags, CompareOpt};
    use crate::core::listing::FileRecord;
    use crate::storage::{Features, HashType, Hashes};
    use chrono::DateTime;
    use std::time::Duration;

    fn features() -> Features {
        Features {
            precision: Some(Duration::from_nanos(1)),
            hashes: Hashes::new(&[HashType::Blake3]),
            slow_hash: true,
            can_set_modtime: true,
        }
    }

    fn comparator() -> FileComparator {
        let f = features();
        let opt = CompareOpt::resolve(&CompareFlags::default(), &f, &f).unwrap();
        FileComparator::new(opt, &f, &f)
    }

    fn listing(files: &[(&str, i64, i64)]) -> Listing {
        let mut l = Listing::new(true);
        for (name, size, secs) in files {
            l.insert(FileRecord::file(*name, *size, DateTime::from_timestamp(*secs, 0), ""));
        }
        l
    }

    fn run(
        prior1: &Listing,
        now1: &Listing,
        prior2: &Listing,
        now2: &Listing,
    ) -> BTreeMap<String, Verdict> {
        let cmp = comparator();
        let d1 = classify_side(Side::Path1, prior1, now1, &cmp);
        let d2 = classify_side(Side::Path2, prior2, now2, &cmp);
        merge(&d1, &d2, now1, now2, &cmp)
    }

    #[test]
    fn test_classify_side() {
        let cmp = comparator();
        let prior = listing(&[("same", 1, 10), ("gone", 1, 10), ("edit", 1, 10), ("back", 1, 10)]);
        let now = listing(&[("same", 1, 10), ("edit", 2, 20), ("back", 1, 5), ("new", 1, 10)]);
        let d = classify_side(Side::Path1, &prior, &now, &cmp);
        assert_eq!(d.get("same"), Some(DeltaKind::Unchanged));
        assert_eq!(d.get("gone"), Some(DeltaKind::Deleted));
        assert_eq!(d.get("edit"), Some(DeltaKind::Newer));
        assert_eq!(d.get("back"), Some(DeltaKind::Older));
        assert_eq!(d.get("new"), Some(DeltaKind::New));
        assert_eq!(d.deleted_files, 1);
        assert_eq!(d.prior_files, 4);
        assert_eq!(d.changes().count(), 4);
    }

    #[test]
    fn test_merge_one_sided() {
        let prior = listing(&[("a", 1, 10), ("b", 1, 10)]);
        let now1 = listing(&[("a", 2, 20), ("c", 1, 10)]);
        let now2 = listing(&[("a", 1, 10), ("b", 1, 10)]);
        let v = run(&prior, &now1, &prior, &now2);
        assert_eq!(v.get("a"), Some(&Verdict::CopyTo(Side::Path2)));
        assert_eq!(v.get("b"), Some(&Verdict::DeleteOn(Side::Path2)));
        assert_eq!(v.get("c"), Some(&Verdict::CopyTo(Side::Path2)));
    }

    #[test]
    fn test_merge_two_sided() {
        let prior = listing(&[("both", 1, 10), ("del", 1, 10), ("md", 1, 10)]);
        let now1 = listing(&[("both", 2, 20), ("same-new", 3, 30), ("md", 2, 20)]);
        let now2 = listing(&[("both", 3, 30), ("same-new", 3, 30)]);
        let v = run(&prior, &now1, &prior, &now2);
        assert_eq!(
            v.get("both"),
            Some(&Verdict::Conflict(ConflictKind::BothChanged))
        );
        // 两侧新增相同文件
        assert_eq!(v.get("same-new"), None);
        // 两侧都删除
        assert_eq!(v.get("del"), None);
        assert_eq!(
            v.get("md"),
            Some(&Verdict::Conflict(ConflictKind::ModifiedDeleted {
                deleted: Side::Path2
            }))
        );
    }

    #[test]
    fn test_merge_directories() {
        let mut prior = Listing::new(true);
        prior.insert(FileRecord::dir("old"));
        let mut now1 = Listing::new(true);
        now1.insert(FileRecord::dir("fresh"));
        let mut now2 = prior.clone();
        now2.insert(FileRecord::file("fresh", 1, DateTime::from_timestamp(5, 0), ""));
        let mut prior2 = Listing::new(true);
        prior2.insert(FileRecord::dir("old"));

        let v = run(&prior, &now1, &prior2, &now2);
        assert_eq!(v.get("old"), Some(&Verdict::RmdirOn(Side::Path2)));
        assert_eq!(
            v.get("fresh"),
            Some(&Verdict::Conflict(ConflictKind::TypeMismatch))
        );
    }

    #[test]
    fn test_type_change_is_delete_plus_new() {
        let cmp = comparator();
        let prior = listing(&[("x", 1, 10), ("keep", 1, 10)]);
        let mut now1 = listing(&[("keep", 1, 10)]);
        now1.insert(FileRecord::dir("x"));
        let d = classify_side(Side::Path1, &prior, &now1, &cmp);
        assert_eq!(d.get("x"), Some(DeltaKind::New));
        assert_eq!(d.deleted_files, 1);

        let v = run(&prior, &now1, &prior, &prior);
        assert_eq!(v.get("x"), Some(&Verdict::MkdirOn(Side::Path2)));

        // 目录变回文件
        let mut dir_prior = Listing::new(true);
        dir_prior.insert(FileRecord::dir("x"));
        let file_now = listing(&[("x", 1, 10)]);
        let v = run(&dir_prior, &file_now, &dir_prior, &dir_prior);
        assert_eq!(v.get("x"), Some(&Verdict::CopyTo(Side::Path2)));
    }

    #[test]
    fn test_max_delete() {
        let cmp = comparator();
        let files: Vec<(String, i64, i64)> = (0..10).map(|i| (format!("f{}", i), 1, 10)).collect();
        let refs: Vec<(&str, i64, i64)> = files.iter().map(|(n, s, t)| (n.as_str(), *s, *t)).collect();
        let prior = listing(&refs);
        let now = listing(&refs[6..]);
        let d = classify_side(Side::Path1, &prior, &now, &cmp);
        assert_eq!(d.deleted_files, 6);
        assert!(matches!(
            d.check_max_delete(50, false),
            Err(BisyncError::SafetyAbort(_))
        ));
        assert!(d.check_max_delete(50, true).is_ok());
        assert!(d.check_max_delete(60, false).is_ok());
    }
}
