use crate::config::ResyncMode;
use crate::core::delta::DeltaKind;
use crate::core::listing::{FileRecord, Listing};
use crate::core::Side;
use crate::error::{BisyncError, BisyncResult};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::{info, warn};

/// 冲突解决策略
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum ConflictResolve {
    /// 不选胜者，两侧都保留
    #[default]
    None,
    Path1,
    Path2,
    Newer,
    Older,
    Larger,
    Smaller,
    /// 出现冲突即中止
    Abort,
}

impl std::fmt::Display for ConflictResolve {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ConflictResolve::None => "none",
            ConflictResolve::Path1 => "path1",
            ConflictResolve::Path2 => "path2",
            ConflictResolve::Newer => "newer",
            ConflictResolve::Older => "older",
            ConflictResolve::Larger => "larger",
            ConflictResolve::Smaller => "smaller",
            ConflictResolve::Abort => "abort",
        };
        write!(f, "{}", s)
    }
}

/// 失败方的处理方式
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum ConflictLoser {
    /// 追加编号后缀
    #[default]
    Num,
    /// 追加来源侧后缀
    #[value(name = "pathname")]
    PathName,
    /// 直接被胜者覆盖
    Delete,
}

/// 胜者选择规则，冲突解决和 resync 共用
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PickRule {
    Path1,
    Path2,
    Newer,
    Older,
    Larger,
    Smaller,
}

impl PickRule {
    /// 无法判断时返回 None
    pub fn pick(self, r1: &FileRecord, r2: &FileRecord) -> Option<Side> {
        match self {
            PickRule::Path1 => Some(Side::Path1),
            PickRule::Path2 => Some(Side::Path2),
            PickRule::Newer | PickRule::Older => {
                let (t1, t2) = (r1.mod_time?, r2.mod_time?);
                if t1 == t2 {
                    return None;
                }
                let path1_newer = t1 > t2;
                match (self, path1_newer) {
                    (PickRule::Newer, true) | (PickRule::Older, false) => Some(Side::Path1),
                    _ => Some(Side::Path2),
                }
            }
            PickRule::Larger | PickRule::Smaller => {
                if r1.size < 0 || r2.size < 0 || r1.size == r2.size {
                    return None;
                }
                let path1_larger = r1.size > r2.size;
                match (self, path1_larger) {
                    (PickRule::Larger, true) | (PickRule::Smaller, false) => Some(Side::Path1),
                    _ => Some(Side::Path2),
                }
            }
        }
    }
}

impl ConflictResolve {
    fn rule(self) -> Option<PickRule> {
        match self {
            ConflictResolve::Path1 => Some(PickRule::Path1),
            ConflictResolve::Path2 => Some(PickRule::Path2),
            ConflictResolve::Newer => Some(PickRule::Newer),
            ConflictResolve::Older => Some(PickRule::Older),
            ConflictResolve::Larger => Some(PickRule::Larger),
            ConflictResolve::Smaller => Some(PickRule::Smaller),
            ConflictResolve::None | ConflictResolve::Abort => None,
        }
    }
}

impl From<ResyncMode> for PickRule {
    /// resync 未指定模式时以 Path1 为准
    fn from(mode: ResyncMode) -> Self {
        match mode {
            ResyncMode::None | ResyncMode::Path1 => PickRule::Path1,
            ResyncMode::Path2 => PickRule::Path2,
            ResyncMode::Newer => PickRule::Newer,
            ResyncMode::Older => PickRule::Older,
            ResyncMode::Larger => PickRule::Larger,
            ResyncMode::Smaller => PickRule::Smaller,
        }
    }
}

/// 冲突类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ConflictKind {
    /// 两侧都修改且内容不同
    BothChanged,
    /// 一侧修改，另一侧删除
    ModifiedDeleted { deleted: Side },
    /// 一侧是文件，另一侧是目录
    TypeMismatch,
}

/// 失败方处置
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum LoserDisposition {
    Overwrite,
    Rename,
    KeepBoth,
    Skip,
}

/// 冲突裁决结果
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Resolution {
    pub winner: Option<Side>,
    pub disposition: LoserDisposition,
}

/// 冲突记录
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictRecord {
    pub path: String,
    pub kind: ConflictKind,
    pub side1_kind: DeltaKind,
    pub side2_kind: DeltaKind,
    pub resolution: Option<Resolution>,
}

/// 冲突产生的操作，由队列构建器接收
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConflictAction {
    /// 在该侧改名
    Rename { side: Side, from: String, to: String },
    /// 从另一侧复制到该侧，`name` 为源文件名，`target` 为目标文件名
    Copy { to: Side, name: String, target: String },
}

/// 冲突解决器
#[derive(Debug)]
pub struct ConflictResolver {
    resolve: ConflictResolve,
    loser: ConflictLoser,
    suffix1: String,
    suffix2: String,
    keep_extension: bool,
    /// 本次运行已分配的名称
    claimed: HashSet<String>,
}

impl ConflictResolver {
    pub fn new(
        resolve: ConflictResolve,
        loser: ConflictLoser,
        suffix: &str,
        keep_extension: bool,
    ) -> Self {
        let (suffix1, suffix2) = parse_suffix(suffix);
        Self {
            resolve,
            loser,
            suffix1,
            suffix2,
            keep_extension,
            claimed: HashSet::new(),
        }
    }

    /// 选出胜者和失败方处置
    pub fn decide(
        &self,
        record: &ConflictRecord,
        r1: Option<&FileRecord>,
        r2: Option<&FileRecord>,
    ) -> BisyncResult<Resolution> {
        if self.resolve == ConflictResolve::Abort {
            return Err(BisyncError::SafetyAbort(format!(
                "发现冲突且 conflictResolve=abort: {}",
                record.path
            )));
        }

        match record.kind {
            ConflictKind::TypeMismatch => {
                warn!("文件与目录同名，跳过: {}", record.path);
                Ok(Resolution {
                    winner: None,
                    disposition: LoserDisposition::Skip,
                })
            }
            ConflictKind::ModifiedDeleted { deleted } => {
                info!("{} 已删除但另一侧已修改，保留修改: {}", deleted, record.path);
                Ok(Resolution {
                    winner: Some(deleted.other()),
                    disposition: LoserDisposition::Overwrite,
                })
            }
            ConflictKind::BothChanged => {
                let winner = match (self.resolve.rule(), r1, r2) {
                    (Some(rule), Some(r1), Some(r2)) => {
                        let w = rule.pick(r1, r2);
                        if w.is_none() {
                            info!(
                                "无法按 {} 判断胜者，两侧都保留: {}",
                                self.resolve, record.path
                            );
                        }
                        w
                    }
                    _ => None,
                };
                let disposition = match (winner, self.loser) {
                    (None, _) => LoserDisposition::KeepBoth,
                    (Some(_), ConflictLoser::Delete) => LoserDisposition::Overwrite,
                    (Some(_), _) => LoserDisposition::Rename,
                };
                Ok(Resolution {
                    winner,
                    disposition,
                })
            }
        }
    }

    /// 把裁决转换为具体操作
    pub fn plan(
        &mut self,
        record: &ConflictRecord,
        resolution: Resolution,
        listing1: &Listing,
        listing2: &Listing,
    ) -> Vec<ConflictAction> {
        let key = record.path.as_str();
        let name1 = listing1.get(key).map(|r| r.name.clone());
        let name2 = listing2.get(key).map(|r| r.name.clone());
        let mut actions = Vec::new();

        match (resolution.disposition, resolution.winner) {
            (LoserDisposition::Skip, _) => {}
            (LoserDisposition::Overwrite, Some(winner)) => {
                let (src, dst) = match winner {
                    Side::Path1 => (name1, name2),
                    Side::Path2 => (name2, name1),
                };
                if let Some(src) = src {
                    let target = dst.unwrap_or_else(|| src.clone());
                    actions.push(ConflictAction::Copy {
                        to: winner.other(),
                        name: src,
                        target,
                    });
                }
            }
            (LoserDisposition::Rename, Some(winner)) => {
                let loser = winner.other();
                let (win_name, lose_name) = match winner {
                    Side::Path1 => (name1, name2),
                    Side::Path2 => (name2, name1),
                };
                if let (Some(win_name), Some(lose_name)) = (win_name, lose_name) {
                    let renamed = self.conflict_name(&lose_name, loser, listing1, listing2);
                    actions.push(ConflictAction::Rename {
                        side: loser,
                        from: lose_name.clone(),
                        to: renamed.clone(),
                    });
                    actions.push(ConflictAction::Copy {
                        to: loser,
                        name: win_name,
                        target: lose_name,
                    });
                    actions.push(ConflictAction::Copy {
                        to: winner,
                        name: renamed.clone(),
                        target: renamed,
                    });
                }
            }
            // 没有胜者时两份都保留
            (LoserDisposition::KeepBoth, _)
            | (LoserDisposition::Overwrite, None)
            | (LoserDisposition::Rename, None) => {
                if let (Some(name1), Some(name2)) = (name1, name2) {
                    let new1 = self.conflict_name(&name1, Side::Path1, listing1, listing2);
                    let new2 = self.conflict_name(&name2, Side::Path2, listing1, listing2);
                    actions.push(ConflictAction::Rename {
                        side: Side::Path1,
                        from: name1,
                        to: new1.clone(),
                    });
                    actions.push(ConflictAction::Rename {
                        side: Side::Path2,
                        from: name2,
                        to: new2.clone(),
                    });
                    actions.push(ConflictAction::Copy {
                        to: Side::Path2,
                        name: new1.clone(),
                        target: new1,
                    });
                    actions.push(ConflictAction::Copy {
                        to: Side::Path1,
                        name: new2.clone(),
                        target: new2,
                    });
                }
            }
        }

        actions
    }

    fn suffix(&self, side: Side) -> &str {
        match side {
            Side::Path1 => &self.suffix1,
            Side::Path2 => &self.suffix2,
        }
    }

    /// 生成冲突文件名，编号在两侧列表和本次运行中都未被占用
    pub fn conflict_name(
        &mut self,
        name: &str,
        side: Side,
        listing1: &Listing,
        listing2: &Listing,
    ) -> String {
        let suffix = self.suffix(side).to_string();
        if self.loser == ConflictLoser::PathName {
            let candidate = add_suffix(
                name,
                &format!("{}.path{}", suffix, side.index()),
                self.keep_extension,
            );
            self.claimed.insert(listing1.key(&candidate));
            return candidate;
        }

        let mut n = 1u32;
        loop {
            let candidate = add_suffix(name, &format!("{}{}", suffix, n), self.keep_extension);
            let key = listing1.key(&candidate);
            if !listing1.contains(&key) && !listing2.contains(&key) && !self.claimed.contains(&key)
            {
                self.claimed.insert(key);
                return candidate;
            }
            n += 1;
        }
    }
}

/// "sfx" 两侧相同，"sfx1,sfx2" 分别指定
fn parse_suffix(suffix: &str) -> (String, String) {
    let clean = |s: &str| s.trim().trim_start_matches('.').to_string();
    match suffix.split_once(',') {
        Some((a, b)) => (clean(a), clean(b)),
        None => (clean(suffix), clean(suffix)),
    }
}

/// 追加后缀，`keep_extension` 时放在最后一个扩展名之前
fn add_suffix(name: &str, suffix: &str, keep_extension: bool) -> String {
    if keep_extension {
        let base_start = name.rfind('/').map(|i| i + 1).unwrap_or(0);
        if let Some(dot) = name[base_start..].rfind('.') {
            let dot = base_start + dot;
            // 隐藏文件的前导点不算扩展名
            if dot > base_start {
                let (stem, ext) = name.split_at(dot);
                return format!("{}.{}{}", stem, suffix, ext);
            }
        }
    }
    format!("{}.{}", name, suffix)
}
