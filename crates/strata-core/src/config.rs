//! Planner configuration, loaded from JSON.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::environment::EnvironmentSuffixTarget;
use crate::errors::{StrataError, StrataResult};
use crate::snapshot::CategorizerConfig;
use crate::time::{parse_time, Timestamp, WEEK_MS};

pub const DEFAULT_PROD_ENVIRONMENT: &str = "prod";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlannerConfig {
    pub categorizer: CategorizerConfig,
    /// Backfill non-deployable snapshots in development environments
    /// against their provisional history.
    pub enable_preview: bool,
    pub restate_downstream: bool,
    /// Time-like value used when nothing else determines a plan start.
    pub default_start: Option<String>,
    pub environment_ttl: i64,
    pub snapshot_ttl: i64,
    pub prod_environment: String,
    pub environment_suffix_target: EnvironmentSuffixTarget,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            categorizer: CategorizerConfig::default(),
            enable_preview: true,
            restate_downstream: true,
            default_start: None,
            environment_ttl: WEEK_MS,
            snapshot_ttl: WEEK_MS,
            prod_environment: DEFAULT_PROD_ENVIRONMENT.to_string(),
            environment_suffix_target: EnvironmentSuffixTarget::default(),
        }
    }
}

impl PlannerConfig {
    pub fn from_json(raw: &str) -> StrataResult<Self> {
        let config: PlannerConfig = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> StrataResult<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json(&raw)
    }

    fn validate(&self) -> StrataResult<()> {
        if self.prod_environment.trim().is_empty() {
            return Err(StrataError::Config(
                "prod_environment must not be empty".to_string(),
            ));
        }
        if self.environment_ttl <= 0 || self.snapshot_ttl <= 0 {
            return Err(StrataError::Config("ttl values must be positive".to_string()));
        }
        if let Some(start) = &self.default_start {
            parse_time(start, 0).map_err(|_| {
                StrataError::Config(format!("default_start '{start}' is not a valid time"))
            })?;
        }
        Ok(())
    }

    pub fn default_start_ts(&self, now: Timestamp) -> StrataResult<Option<Timestamp>> {
        self.default_start
            .as_deref()
            .map(|value| parse_time(value, now))
            .transpose()
    }

    pub fn is_prod(&self, environment: &str) -> bool {
        environment == self.prod_environment
    }
}
