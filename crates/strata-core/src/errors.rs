//! Error types for the Strata planning core.

use crate::snapshot::SnapshotId;

fn format_ids(ids: &[SnapshotId]) -> String {
    ids.iter()
        .map(|id| id.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Top-level error enum for the Strata planning core.
#[derive(Debug, thiserror::Error)]
pub enum StrataError {
    #[error(
        "Inconsistent diff: '{model}' depends on '{dependency}', which is neither defined \
         locally nor present in environment '{environment}'"
    )]
    InconsistentDiff {
        model: String,
        dependency: String,
        environment: String,
    },

    #[error("Dependency cycle detected among: {}", .0.join(", "))]
    CyclicDependency(Vec<String>),

    #[error("Missing fingerprint for dependency '{dependency}' of '{model}'")]
    MissingFingerprint { model: String, dependency: String },

    #[error("Plan has uncategorized changes that need a category choice: {}", format_ids(.0))]
    Uncategorized(Vec<SnapshotId>),

    #[error(
        "Environment '{environment}' changed since the plan was built \
         (expected plan {expected:?}, found {found:?})"
    )]
    StaleBase {
        environment: String,
        expected: Option<String>,
        found: Option<String>,
    },

    #[error("No changes to plan: environment '{0}' is up to date with the local definitions")]
    NoChanges(String),

    #[error("Invalid override for '{model}': {reason}")]
    InvalidOverride { model: String, reason: String },

    #[error("Invalid schedule '{expression}': {reason}")]
    InvalidSchedule { expression: String, reason: String },

    #[error("Invalid time value: '{0}'")]
    InvalidTime(String),

    #[error("Environment '{0}' cannot be invalidated")]
    ProtectedEnvironment(String),

    #[error("Evaluation of {snapshot} failed: {reason}")]
    Evaluation { snapshot: SnapshotId, reason: String },

    #[error("Config error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl StrataError {
    /// Whether rebuilding the plan against fresh state may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StrataError::StaleBase { .. })
    }
}

pub type StrataResult<T> = Result<T, StrataError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stale_base_is_retryable() {
        let err = StrataError::StaleBase {
            environment: "dev".to_string(),
            expected: Some("a".to_string()),
            found: Some("b".to_string()),
        };
        assert!(err.is_retryable());
        assert!(!StrataError::NoChanges("dev".to_string()).is_retryable());
    }

    #[test]
    fn test_uncategorized_message_lists_snapshots() {
        let err = StrataError::Uncategorized(vec![
            SnapshotId::new("db.a", "1"),
            SnapshotId::new("db.b", "2"),
        ]);
        let message = err.to_string();
        assert!(message.contains("db.a"));
        assert!(message.contains("db.b"));
    }
}
