//! Deployment environments and the naming collaborator.

use serde::{Deserialize, Serialize};

use crate::snapshot::{Snapshot, SnapshotId};
use crate::time::Timestamp;

/// Where the environment name is appended when building view names.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvironmentSuffixTarget {
    #[default]
    Schema,
    Table,
    Catalog,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentNamingInfo {
    pub name: String,
    #[serde(default)]
    pub suffix_target: EnvironmentSuffixTarget,
    /// Whether this is the production environment, whose views carry no suffix.
    #[serde(default)]
    pub is_prod: bool,
}

/// A named deployment target and the snapshots promoted into it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Environment {
    pub name: String,
    pub snapshots: Vec<SnapshotId>,
    pub start_at: Timestamp,
    #[serde(default)]
    pub end_at: Option<Timestamp>,
    pub plan_id: String,
    #[serde(default)]
    pub previous_plan_id: Option<String>,
    #[serde(default)]
    pub expiration_ts: Option<Timestamp>,
    pub finalized_ts: Timestamp,
    #[serde(default)]
    pub suffix_target: EnvironmentSuffixTarget,
}

impl Environment {
    pub fn is_expired(&self, now: Timestamp) -> bool {
        self.expiration_ts.is_some_and(|expiration| expiration <= now)
    }

    pub fn naming_info(&self, prod_name: &str) -> EnvironmentNamingInfo {
        EnvironmentNamingInfo {
            name: self.name.clone(),
            suffix_target: self.suffix_target,
            is_prod: self.name == prod_name,
        }
    }

    pub fn contains(&self, id: &SnapshotId) -> bool {
        self.snapshots.iter().any(|s| s == id)
    }
}

/// Maps snapshots and environments to storage identifiers.
///
/// The planner only asks for names; how they are built belongs to the
/// implementation.
pub trait TableNaming {
    /// Physical table holding a snapshot's data. Non-deployable snapshots
    /// write to a provisional table of their own.
    fn physical_table(&self, snapshot: &Snapshot, deployable: bool) -> String;

    /// User-facing view name for a model inside an environment.
    fn view_name(&self, model: &str, naming: &EnvironmentNamingInfo) -> String;
}

/// Names physical tables `<schema>.<model>__<revision>` and suffixes views
/// according to the environment's suffix target.
#[derive(Debug, Clone)]
pub struct DefaultTableNaming {
    pub physical_schema: String,
}

impl Default for DefaultTableNaming {
    fn default() -> Self {
        Self {
            physical_schema: "strata".to_string(),
        }
    }
}

impl TableNaming for DefaultTableNaming {
    fn physical_table(&self, snapshot: &Snapshot, deployable: bool) -> String {
        let base = snapshot.name.replace('.', "__");
        let generation = if deployable {
            snapshot
                .revision
                .clone()
                .unwrap_or_else(|| snapshot.fingerprint.to_version())
        } else {
            format!("{}__dev", snapshot.fingerprint.identifier())
        };
        format!("{}.{base}__{generation}", self.physical_schema)
    }

    fn view_name(&self, model: &str, naming: &EnvironmentNamingInfo) -> String {
        if naming.is_prod {
            return model.to_string();
        }
        let mut parts: Vec<String> = model.split('.').map(str::to_string).collect();
        let suffix = format!("__{}", naming.name);
        let index = match (naming.suffix_target, parts.len()) {
            (EnvironmentSuffixTarget::Table, len) => len - 1,
            (EnvironmentSuffixTarget::Catalog, _) => 0,
            (EnvironmentSuffixTarget::Schema, 1) => {
                parts.insert(0, "default".to_string());
                0
            }
            (EnvironmentSuffixTarget::Schema, len) => len - 2,
        };
        parts[index].push_str(&suffix);
        parts.join(".")
    }
}
