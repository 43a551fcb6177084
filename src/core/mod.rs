pub mod comparator;
pub mod conflict;
pub mod context;
pub mod delta;
pub mod engine;
pub mod executor;
pub mod listing;
pub mod lock;
pub mod queue;
pub mod scanner;

use serde::Serialize;

pub use comparator::{CompareFlags, CompareOpt, FileComparator, ModifyWindow};
pub use conflict::{ConflictLoser, ConflictRecord, ConflictResolve, ConflictResolver};
pub use context::RunContext;
pub use delta::{DeltaKind, DeltaRecord};
pub use engine::{Bisync, RunReport};
pub use executor::{Action, OpResult, Results};
pub use listing::{FileRecord, Listing, SessionPaths};
pub use lock::SessionLock;
pub use queue::{Queue, QueuePlan};
pub use scanner::{FileScanner, GlobFilter, PathFilter};

/// 同步的一侧
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Path1,
    Path2,
}

impl Side {
    pub fn other(self) -> Side {
        match self {
            Side::Path1 => Side::Path2,
            Side::Path2 => Side::Path1,
        }
    }

    pub fn index(self) -> u8 {
        match self {
            Side::Path1 => 1,
            Side::Path2 => 2,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Path{}", self.index())
    }
}
