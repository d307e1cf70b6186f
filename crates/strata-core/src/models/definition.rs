//! Model definitions as supplied by the definition source.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::cron::CronSchedule;
use crate::errors::StrataResult;
use crate::models::kind::{KindCapabilities, ModelKind};
use crate::time::Timestamp;

pub const DEFAULT_CRON: &str = "@daily";

fn default_cron() -> String {
    DEFAULT_CRON.to_string()
}

/// One output column of a SQL computation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Projection {
    pub alias: String,
    pub expression: String,
    #[serde(default)]
    pub data_type: Option<String>,
}

impl Projection {
    pub fn new(alias: &str, expression: &str) -> Self {
        Self {
            alias: alias.to_string(),
            expression: expression.to_string(),
            data_type: None,
        }
    }

    pub fn typed(alias: &str, expression: &str, data_type: &str) -> Self {
        Self {
            data_type: Some(data_type.to_string()),
            ..Self::new(alias, expression)
        }
    }
}

/// The logic that produces a model's rows.
///
/// SQL arrives pre-structured by the loader: the projection list is compared
/// column by column, the rest of the statement (sources, joins, filters) is an
/// opaque `body`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Computation {
    Sql {
        projections: Vec<Projection>,
        body: String,
    },
    Opaque {
        source: String,
    },
}

impl Computation {
    pub fn sql(projections: Vec<Projection>, body: &str) -> Self {
        Computation::Sql {
            projections,
            body: body.to_string(),
        }
    }

    pub fn opaque(source: &str) -> Self {
        Computation::Opaque {
            source: source.to_string(),
        }
    }

    pub fn is_sql(&self) -> bool {
        matches!(self, Computation::Sql { .. })
    }
}

/// A named, dependency-linked transformation.
///
/// Definitions are values: an edit produces a new definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelDefinition {
    pub name: String,
    pub kind: ModelKind,
    pub computation: Computation,
    #[serde(default = "default_cron")]
    pub cron: String,
    #[serde(default)]
    pub start: Option<Timestamp>,
    #[serde(default)]
    pub end: Option<Timestamp>,
    #[serde(default)]
    pub lookback: u32,
    #[serde(default)]
    pub partitioned_by: Vec<String>,
    #[serde(default)]
    pub depends_on: BTreeSet<String>,
    /// The computation reads its own previous output.
    #[serde(default)]
    pub depends_on_self: bool,
    #[serde(default)]
    pub forward_only: bool,
    #[serde(default)]
    pub disabled: bool,
    #[serde(default)]
    pub owner: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Free-form value whose only purpose is to force a new fingerprint.
    #[serde(default)]
    pub stamp: Option<String>,
}

impl ModelDefinition {
    pub fn new(name: &str, kind: ModelKind, computation: Computation) -> Self {
        Self {
            name: name.to_string(),
            kind,
            computation,
            cron: default_cron(),
            start: None,
            end: None,
            lookback: 0,
            partitioned_by: Vec::new(),
            depends_on: BTreeSet::new(),
            depends_on_self: false,
            forward_only: false,
            disabled: false,
            owner: None,
            description: None,
            tags: Vec::new(),
            stamp: None,
        }
    }

    pub fn with_cron(mut self, cron: &str) -> Self {
        self.cron = cron.to_string();
        self
    }

    pub fn with_start(mut self, start: Timestamp) -> Self {
        self.start = Some(start);
        self
    }

    pub fn with_end(mut self, end: Timestamp) -> Self {
        self.end = Some(end);
        self
    }

    pub fn with_lookback(mut self, lookback: u32) -> Self {
        self.lookback = lookback;
        self
    }

    pub fn with_depends_on<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on = deps.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_forward_only(mut self, forward_only: bool) -> Self {
        self.forward_only = forward_only;
        self
    }

    pub fn with_owner(mut self, owner: &str) -> Self {
        self.owner = Some(owner.to_string());
        self
    }

    pub fn with_description(mut self, description: &str) -> Self {
        self.description = Some(description.to_string());
        self
    }

    pub fn with_stamp(mut self, stamp: &str) -> Self {
        self.stamp = Some(stamp.to_string());
        self
    }

    pub fn schedule(&self) -> StrataResult<CronSchedule> {
        CronSchedule::parse(&self.cron)
    }

    pub fn capabilities(&self) -> KindCapabilities {
        self.kind.capabilities()
    }

    pub fn is_forward_only(&self) -> bool {
        self.forward_only || self.capabilities().implicitly_forward_only
    }

    pub fn depends_on_past(&self) -> bool {
        self.depends_on_self || self.capabilities().depends_on_past
    }

    pub fn is_symbolic(&self) -> bool {
        self.capabilities().is_symbolic
    }

    /// Values that determine the rows this model computes.
    pub(crate) fn data_fields(&self) -> Vec<String> {
        let mut fields = vec![
            self.name.clone(),
            serde_json::to_string(&self.kind).unwrap_or_else(|_| self.kind.name().to_string()),
        ];
        match &self.computation {
            Computation::Sql { projections, body } => {
                fields.push("sql".to_string());
                for projection in projections {
                    fields.push(projection.alias.clone());
                    fields.push(projection.expression.clone());
                    fields.push(projection.data_type.clone().unwrap_or_default());
                }
                fields.push(body.clone());
            }
            Computation::Opaque { source } => {
                fields.push("opaque".to_string());
                fields.push(source.clone());
            }
        }
        fields.push(self.cron.clone());
        fields.push(self.lookback.to_string());
        fields.push(self.partitioned_by.join(","));
        fields.push(self.depends_on_self.to_string());
        fields.push(self.stamp.clone().unwrap_or_default());
        fields
    }

    /// Values that describe the model without affecting its rows.
    pub(crate) fn metadata_fields(&self) -> Vec<String> {
        let mut tags = self.tags.clone();
        tags.sort();
        vec![
            self.owner.clone().unwrap_or_default(),
            self.description.clone().unwrap_or_default(),
            tags.join(","),
            self.forward_only.to_string(),
            self.disabled.to_string(),
            self.start.map(|ts| ts.to_string()).unwrap_or_default(),
            self.end.map(|ts| ts.to_string()).unwrap_or_default(),
        ]
    }
}
