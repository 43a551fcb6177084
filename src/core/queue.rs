//! 操作队列

use crate::core::conflict::ConflictAction;
use crate::core::listing::SessionPaths;
use crate::core::Side;
use anyhow::{Context, Result};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

/// 一组待处理的文件名，按名称排序
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Queue {
    names: BTreeSet<String>,
    /// 目标名与源名不同时记录（如 unicode 形式不同）
    targets: BTreeMap<String, String>,
}

impl Queue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>) {
        self.names.insert(name.into());
    }

    /// 写入目标侧时使用另一个名称
    pub fn insert_as(&mut self, name: impl Into<String>, target: impl Into<String>) {
        let name = name.into();
        let target = target.into();
        if name != target {
            self.targets.insert(name.clone(), target);
        }
        self.names.insert(name);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.names.contains(name)
    }

    pub fn target<'a>(&'a self, name: &'a str) -> &'a str {
        self.targets.get(name).map(String::as_str).unwrap_or(name)
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &String> {
        self.names.iter()
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// 每行一个名称，含空白、引号或控制字符时用 JSON 引号
    pub fn save(&self, path: &Path) -> Result<()> {
        let mut out = String::new();
        for name in &self.names {
            if needs_quoting(name) {
                out.push_str(&serde_json::to_string(name)?);
            } else {
                out.push_str(name);
            }
            out.push('\n');
        }
        std::fs::write(path, out).with_context(|| format!("保存队列失败: {:?}", path))?;
        Ok(())
    }
}

fn needs_quoting(name: &str) -> bool {
    name.chars()
        .any(|c| c.is_whitespace() || c == '"' || c.is_control())
}

/// 本次运行的全部队列
#[derive(Debug, Clone, Default)]
pub struct QueuePlan {
    pub copy_to_path1: Queue,
    pub copy_to_path2: Queue,
    pub delete_path1: Queue,
    pub delete_path2: Queue,
    pub mkdir_path1: Queue,
    pub mkdir_path2: Queue,
    pub rmdir_path1: Queue,
    pub rmdir_path2: Queue,
    /// 目标位置被其他类型占用的复制，在删除和目录操作之后执行
    pub replace_path1: Queue,
    pub replace_path2: Queue,
    /// 冲突改名 (原名, 新名)，最先执行
    pub rename_path1: Vec<(String, String)>,
    pub rename_path2: Vec<(String, String)>,
}

/// 各队列数量
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueCounts {
    pub copy_to_path1: usize,
    pub copy_to_path2: usize,
    pub delete_path1: usize,
    pub delete_path2: usize,
    pub mkdir_path1: usize,
    pub mkdir_path2: usize,
    pub rmdir_path1: usize,
    pub rmdir_path2: usize,
    pub replace_path1: usize,
    pub replace_path2: usize,
    pub renames: usize,
}

impl QueuePlan {
    pub fn copy_to(&mut self, side: Side) -> &mut Queue {
        match side {
            Side::Path1 => &mut self.copy_to_path1,
            Side::Path2 => &mut self.copy_to_path2,
        }
    }

    pub fn delete_on(&mut self, side: Side) -> &mut Queue {
        match side {
            Side::Path1 => &mut self.delete_path1,
            Side::Path2 => &mut self.delete_path2,
        }
    }

    pub fn mkdir_on(&mut self, side: Side) -> &mut Queue {
        match side {
            Side::Path1 => &mut self.mkdir_path1,
            Side::Path2 => &mut self.mkdir_path2,
        }
    }

    pub fn rmdir_on(&mut self, side: Side) -> &mut Queue {
        match side {
            Side::Path1 => &mut self.rmdir_path1,
            Side::Path2 => &mut self.rmdir_path2,
        }
    }

    pub fn replace_on(&mut self, side: Side) -> &mut Queue {
        match side {
            Side::Path1 => &mut self.replace_path1,
            Side::Path2 => &mut self.replace_path2,
        }
    }

    pub fn renames_on(&mut self, side: Side) -> &mut Vec<(String, String)> {
        match side {
            Side::Path1 => &mut self.rename_path1,
            Side::Path2 => &mut self.rename_path2,
        }
    }

    pub fn apply_conflict(&mut self, action: ConflictAction) {
        match action {
            ConflictAction::Rename { side, from, to } => self.renames_on(side).push((from, to)),
            ConflictAction::Copy { to, name, target } => self.copy_to(to).insert_as(name, target),
        }
    }

    pub fn counts(&self) -> QueueCounts {
        QueueCounts {
            copy_to_path1: self.copy_to_path1.len(),
            copy_to_path2: self.copy_to_path2.len(),
            delete_path1: self.delete_path1.len(),
            delete_path2: self.delete_path2.len(),
            mkdir_path1: self.mkdir_path1.len(),
            mkdir_path2: self.mkdir_path2.len(),
            rmdir_path1: self.rmdir_path1.len(),
            rmdir_path2: self.rmdir_path2.len(),
            replace_path1: self.replace_path1.len(),
            replace_path2: self.replace_path2.len(),
            renames: self.rename_path1.len() + self.rename_path2.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.counts() == QueueCounts::default()
    }

    /// 保存全部队列供审计
    pub fn save(&self, paths: &SessionPaths) -> Result<()> {
        let queues = [
            ("copy2to1", &self.copy_to_path1),
            ("copy1to2", &self.copy_to_path2),
            ("delete1", &self.delete_path1),
            ("delete2", &self.delete_path2),
            ("mkdir1", &self.mkdir_path1),
            ("mkdir2", &self.mkdir_path2),
            ("rmdir1", &self.rmdir_path1),
            ("rmdir2", &self.rmdir_path2),
            ("replace2to1", &self.replace_path1),
            ("replace1to2", &self.replace_path2),
        ];
        for (label, queue) in queues {
            queue.save(&paths.queue_file(label))?;
        }
        for (label, renames) in [("rename1", &self.rename_path1), ("rename2", &self.rename_path2)] {
            let mut queue = Queue::new();
            for (from, to) in renames {
                queue.insert(format!("{} -> {}", from, to));
            }
            queue.save(&paths.queue_file(label))?;
        }
        Ok(())
    }
}
