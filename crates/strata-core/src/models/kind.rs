//! Model kinds and the capability table that drives kind-specific rules.

use std::fmt;

use serde::{Deserialize, Serialize};

/// How a model materializes its output.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "name", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ModelKind {
    /// Rebuilt from scratch on every run.
    Full,
    IncrementalByTimeRange { time_column: String },
    IncrementalByUniqueKey { unique_key: Vec<String> },
    IncrementalByPartition,
    /// Appends on every run without any key or time bookkeeping.
    IncrementalUnmanaged,
    View,
    /// Inlined into consumers; has no storage of its own.
    Embedded,
    /// Keeps full row history; any restatement rebuilds all of it.
    FullHistoryRestatement { unique_key: Vec<String> },
    Custom { materialization: String },
}

/// Kind discriminant without the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ModelKindName {
    Full,
    IncrementalByTimeRange,
    IncrementalByUniqueKey,
    IncrementalByPartition,
    IncrementalUnmanaged,
    View,
    Embedded,
    FullHistoryRestatement,
    Custom,
}

/// Behavior flags shared by every model of a kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KindCapabilities {
    /// No computed data of its own; never backfilled.
    pub is_symbolic: bool,
    pub is_materialized: bool,
    /// Each bucket reads the output of the bucket before it.
    pub depends_on_past: bool,
    /// Restating any range rebuilds the entire history.
    pub full_history_restatement: bool,
    pub implicitly_forward_only: bool,
}

const fn caps(
    is_symbolic: bool,
    is_materialized: bool,
    depends_on_past: bool,
    full_history_restatement: bool,
    implicitly_forward_only: bool,
) -> KindCapabilities {
    KindCapabilities {
        is_symbolic,
        is_materialized,
        depends_on_past,
        full_history_restatement,
        implicitly_forward_only,
    }
}

impl ModelKindName {
    pub const fn capabilities(self) -> KindCapabilities {
        match self {
            ModelKindName::Full => caps(false, true, false, false, false),
            ModelKindName::IncrementalByTimeRange => caps(false, true, false, false, false),
            ModelKindName::IncrementalByUniqueKey => caps(false, true, true, true, false),
            ModelKindName::IncrementalByPartition => caps(false, true, true, true, false),
            ModelKindName::IncrementalUnmanaged => caps(false, true, true, true, false),
            ModelKindName::View => caps(true, false, false, false, false),
            ModelKindName::Embedded => caps(true, false, false, false, false),
            ModelKindName::FullHistoryRestatement => caps(false, true, true, true, true),
            ModelKindName::Custom => caps(false, true, false, false, false),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ModelKindName::Full => "FULL",
            ModelKindName::IncrementalByTimeRange => "INCREMENTAL_BY_TIME_RANGE",
            ModelKindName::IncrementalByUniqueKey => "INCREMENTAL_BY_UNIQUE_KEY",
            ModelKindName::IncrementalByPartition => "INCREMENTAL_BY_PARTITION",
            ModelKindName::IncrementalUnmanaged => "INCREMENTAL_UNMANAGED",
            ModelKindName::View => "VIEW",
            ModelKindName::Embedded => "EMBEDDED",
            ModelKindName::FullHistoryRestatement => "FULL_HISTORY_RESTATEMENT",
            ModelKindName::Custom => "CUSTOM",
        }
    }
}

impl fmt::Display for ModelKindName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl ModelKind {
    pub fn name(&self) -> ModelKindName {
        match self {
            ModelKind::Full => ModelKindName::Full,
            ModelKind::IncrementalByTimeRange { .. } => ModelKindName::IncrementalByTimeRange,
            ModelKind::IncrementalByUniqueKey { .. } => ModelKindName::IncrementalByUniqueKey,
            ModelKind::IncrementalByPartition => ModelKindName::IncrementalByPartition,
            ModelKind::IncrementalUnmanaged => ModelKindName::IncrementalUnmanaged,
            ModelKind::View => ModelKindName::View,
            ModelKind::Embedded => ModelKindName::Embedded,
            ModelKind::FullHistoryRestatement { .. } => ModelKindName::FullHistoryRestatement,
            ModelKind::Custom { .. } => ModelKindName::Custom,
        }
    }

    pub fn capabilities(&self) -> KindCapabilities {
        self.name().capabilities()
    }

    pub fn time_column(&self) -> Option<&str> {
        match self {
            ModelKind::IncrementalByTimeRange { time_column } => Some(time_column),
            _ => None,
        }
    }
}
