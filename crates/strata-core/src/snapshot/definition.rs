//! Snapshots: versioned, fingerprinted instances of a model definition.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::models::ModelDefinition;
use crate::snapshot::fingerprint::{hash_values, Fingerprint};
use crate::snapshot::intervals::Intervals;
use crate::time::Timestamp;

/// Name plus fingerprint identifier; unique per snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SnapshotId {
    pub name: String,
    pub identifier: String,
}

impl SnapshotId {
    pub fn new(name: &str, identifier: &str) -> Self {
        Self {
            name: name.to_string(),
            identifier: identifier.to_string(),
        }
    }
}

impl fmt::Display for SnapshotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.name, self.identifier)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SnapshotChangeCategory {
    Breaking,
    NonBreaking,
    ForwardOnly,
    IndirectBreaking,
    IndirectNonBreaking,
    Metadata,
}

impl SnapshotChangeCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            SnapshotChangeCategory::Breaking => "BREAKING",
            SnapshotChangeCategory::NonBreaking => "NON_BREAKING",
            SnapshotChangeCategory::ForwardOnly => "FORWARD_ONLY",
            SnapshotChangeCategory::IndirectBreaking => "INDIRECT_BREAKING",
            SnapshotChangeCategory::IndirectNonBreaking => "INDIRECT_NON_BREAKING",
            SnapshotChangeCategory::Metadata => "METADATA",
        }
    }

    /// Categories that start a new storage lineage.
    pub fn is_breaking(self) -> bool {
        matches!(
            self,
            SnapshotChangeCategory::Breaking | SnapshotChangeCategory::IndirectBreaking
        )
    }

    pub fn is_non_breaking(self) -> bool {
        matches!(
            self,
            SnapshotChangeCategory::NonBreaking | SnapshotChangeCategory::IndirectNonBreaking
        )
    }

    pub fn is_indirect(self) -> bool {
        matches!(
            self,
            SnapshotChangeCategory::IndirectBreaking | SnapshotChangeCategory::IndirectNonBreaking
        )
    }
}

impl fmt::Display for SnapshotChangeCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One versioned instance of a model definition.
///
/// `version` names the storage lineage and only moves on breaking changes.
/// `revision` names the data generation inside that lineage: representative
/// interval history is keyed by `(name, revision)`, provisional history by
/// snapshot id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub name: String,
    pub fingerprint: Fingerprint,
    pub node: ModelDefinition,
    pub parents: Vec<SnapshotId>,
    #[serde(default)]
    pub change_category: Option<SnapshotChangeCategory>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub revision: Option<String>,
    #[serde(default)]
    pub effective_from: Option<Timestamp>,
    pub created_ts: Timestamp,
    #[serde(skip)]
    pub intervals: Intervals,
    #[serde(skip)]
    pub dev_intervals: Intervals,
}

impl Snapshot {
    pub fn new(
        node: ModelDefinition,
        fingerprint: Fingerprint,
        mut parents: Vec<SnapshotId>,
        created_ts: Timestamp,
    ) -> Self {
        parents.sort();
        Self {
            name: node.name.clone(),
            fingerprint,
            node,
            parents,
            change_category: None,
            version: None,
            revision: None,
            effective_from: None,
            created_ts,
            intervals: Intervals::new(),
            dev_intervals: Intervals::new(),
        }
    }

    pub fn id(&self) -> SnapshotId {
        SnapshotId::new(&self.name, &self.fingerprint.identifier())
    }

    pub fn is_categorized(&self) -> bool {
        self.change_category.is_some()
    }

    pub fn is_forward_only(&self) -> bool {
        self.change_category == Some(SnapshotChangeCategory::ForwardOnly)
    }

    pub fn is_symbolic(&self) -> bool {
        self.node.is_symbolic()
    }

    pub fn depends_on_past(&self) -> bool {
        self.node.depends_on_past()
    }

    /// Key of the representative interval history.
    pub fn storage_revision(&self) -> String {
        self.revision
            .clone()
            .unwrap_or_else(|| self.fingerprint.to_version())
    }

    /// Interval history matching the given deployability.
    pub fn history(&self, deployable: bool) -> &Intervals {
        if deployable {
            &self.intervals
        } else {
            &self.dev_intervals
        }
    }

    /// Assign a category and derive version and revision from it.
    ///
    /// `previous` is the snapshot this one replaces in the target
    /// environment, if any.
    pub fn categorize_as(
        &mut self,
        category: SnapshotChangeCategory,
        previous: Option<&Snapshot>,
    ) {
        let previous_version = previous.and_then(|p| p.version.clone());
        let previous_revision = previous.and_then(|p| p.revision.clone());
        let lineage = || {
            hash_values([
                "lineage",
                self.name.as_str(),
                previous_version.as_deref().unwrap_or_default(),
            ])
        };

        let (version, revision) = match category {
            SnapshotChangeCategory::Breaking | SnapshotChangeCategory::IndirectBreaking => {
                let version = lineage();
                let revision = if self.node.is_forward_only() {
                    version.clone()
                } else {
                    self.fingerprint.to_version()
                };
                (version, revision)
            }
            SnapshotChangeCategory::NonBreaking => (
                previous_version.clone().unwrap_or_else(lineage),
                self.fingerprint.to_version(),
            ),
            SnapshotChangeCategory::ForwardOnly
            | SnapshotChangeCategory::IndirectNonBreaking
            | SnapshotChangeCategory::Metadata => (
                previous_version.clone().unwrap_or_else(lineage),
                previous_revision.unwrap_or_else(|| self.fingerprint.to_version()),
            ),
        };

        self.change_category = Some(category);
        self.version = Some(version);
        self.revision = Some(revision);
    }

    /// Drop any category and the version it implied.
    pub fn uncategorize(&mut self) {
        self.change_category = None;
        self.version = None;
        self.revision = None;
    }

    /// Same snapshot without interval history, as persisted.
    pub fn without_intervals(&self) -> Snapshot {
        Snapshot {
            intervals: Intervals::new(),
            dev_intervals: Intervals::new(),
            ..self.clone()
        }
    }
}
