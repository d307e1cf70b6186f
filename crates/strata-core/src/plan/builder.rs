//! Accumulates planning choices and rebuilds the plan from scratch on
//! every `build()`.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use indexmap::IndexMap;
use tracing::{debug, info};

use crate::config::PlannerConfig;
use crate::dag::Dag;
use crate::environment::{Environment, EnvironmentNamingInfo};
use crate::errors::{StrataError, StrataResult};
use crate::models::ModelDefinition;
use crate::plan::context_diff::{check_dependencies, ContextDiff};
use crate::plan::definition::Plan;
use crate::plan::deployability::DeployabilityIndex;
use crate::plan::scheduler::{expand_restatements, latest_bucket_start, IntervalScheduler};
use crate::plan::selector::select;
use crate::snapshot::{
    fingerprint_all, Categorizer, Fingerprint, Interval, Snapshot, SnapshotChangeCategory,
    SnapshotId,
};
use crate::store::StateReader;
use crate::time::{format_ts, IntervalUnit, Timestamp};

/// Target snapshot set with categories, before any scheduling.
struct Prepared {
    /// The target environment, when it exists and has not expired.
    target: Option<Environment>,
    /// The environment the diff is taken against.
    base: Option<Environment>,
    previous: IndexMap<String, Snapshot>,
    restating: bool,
    dag: Dag,
    order: Vec<String>,
    snapshots: IndexMap<String, Snapshot>,
    /// Names whose snapshot the state store has not seen.
    new_names: HashSet<String>,
}

/// Mutable accumulator of planning choices for one environment.
pub struct PlanBuilder<'a> {
    state: &'a dyn StateReader,
    definitions: IndexMap<String, ModelDefinition>,
    environment: String,
    config: PlannerConfig,
    now: Timestamp,
    choices: HashMap<String, SnapshotChangeCategory>,
    start: Option<Timestamp>,
    end: Option<Timestamp>,
    effective_from: Option<Timestamp>,
    selected: Option<Vec<String>>,
    backfill: Option<Vec<String>>,
    restatements: Vec<(String, Interval)>,
    forward_only: bool,
    empty_backfill: bool,
    enable_preview: bool,
    create_from: String,
}

impl<'a> PlanBuilder<'a> {
    /// Disabled definitions are left out, which removes them from the
    /// environment.
    pub fn new<I>(
        state: &'a dyn StateReader,
        definitions: I,
        environment: &str,
        config: PlannerConfig,
        now: Timestamp,
    ) -> Self
    where
        I: IntoIterator<Item = ModelDefinition>,
    {
        let mut definitions: IndexMap<String, ModelDefinition> = definitions
            .into_iter()
            .filter(|definition| !definition.disabled)
            .map(|definition| (definition.name.clone(), definition))
            .collect();
        definitions.sort_keys();
        Self {
            state,
            definitions,
            environment: environment.to_string(),
            enable_preview: config.enable_preview,
            create_from: config.prod_environment.clone(),
            config,
            now,
            choices: HashMap::new(),
            start: None,
            end: None,
            effective_from: None,
            selected: None,
            backfill: None,
            restatements: Vec::new(),
            forward_only: false,
            empty_backfill: false,
        }
    }

    pub fn environment(&self) -> &str {
        &self.environment
    }

    fn invalid(&self, model: &str, reason: &str) -> StrataError {
        StrataError::InvalidOverride {
            model: model.to_string(),
            reason: reason.to_string(),
        }
    }

    /// Record a manual category for a directly modified unit.
    ///
    /// Only BREAKING and NON_BREAKING can be chosen, and only for a unit
    /// whose data changed in this plan.
    pub fn set_choice(
        &mut self,
        name: &str,
        category: SnapshotChangeCategory,
    ) -> StrataResult<&mut Self> {
        if !matches!(
            category,
            SnapshotChangeCategory::Breaking | SnapshotChangeCategory::NonBreaking
        ) {
            return Err(self.invalid(name, "only BREAKING or NON_BREAKING can be chosen"));
        }
        let prepared = self.prepare()?;
        let Some(snapshot) = prepared.snapshots.get(name) else {
            return Err(self.invalid(name, "unit is not part of the plan"));
        };
        let Some(previous) = prepared.previous.get(name) else {
            return Err(self.invalid(name, "unit is new to the environment"));
        };
        if snapshot.fingerprint.data_hash == previous.fingerprint.data_hash {
            return Err(self.invalid(name, "unit has no direct data change"));
        }
        if !prepared.new_names.contains(name) {
            return Err(self.invalid(name, "snapshot was already categorized by an earlier plan"));
        }
        if snapshot.node.is_forward_only() || self.forward_only {
            return Err(self.invalid(name, "forward-only changes cannot be recategorized"));
        }
        debug!(model = name, %category, "category chosen");
        self.choices.insert(name.to_string(), category);
        Ok(self)
    }

    pub fn set_start(&mut self, start: Timestamp) -> &mut Self {
        self.start = Some(start);
        self
    }

    pub fn set_end(&mut self, end: Timestamp) -> &mut Self {
        self.end = Some(end);
        self
    }

    /// Cutover point for forward-only changes.
    pub fn set_effective_from(&mut self, effective_from: Timestamp) -> &mut Self {
        self.effective_from = Some(effective_from);
        self
    }

    pub fn select_models<I, S>(&mut self, patterns: I) -> &mut Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.selected = Some(patterns.into_iter().map(Into::into).collect());
        self
    }

    /// Restrict backfill without affecting which definitions are planned.
    pub fn backfill_models<I, S>(&mut self, patterns: I) -> &mut Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.backfill = Some(patterns.into_iter().map(Into::into).collect());
        self
    }

    /// Request recomputation of `range` for every unit matched by `pattern`.
    pub fn restate(&mut self, pattern: &str, range: Interval) -> StrataResult<&mut Self> {
        if range.0 >= range.1 {
            return Err(self.invalid(pattern, "restatement range is empty"));
        }
        let mut known = Dag::new();
        for definition in self.definitions.values() {
            known.add(&definition.name, &definition.depends_on);
        }
        if let Some(environment) = self.base_environment()? {
            for id in &environment.snapshots {
                known.add(&id.name, Vec::<String>::new());
            }
        }
        let matched = select(&[pattern.to_string()], &known)?;
        if matched.is_empty() {
            return Err(self.invalid(pattern, "no such model"));
        }
        for name in matched {
            self.restatements.push((name, range));
        }
        Ok(self)
    }

    pub fn set_forward_only(&mut self, forward_only: bool) -> &mut Self {
        self.forward_only = forward_only;
        self
    }

    /// Mark missing intervals complete without evaluating them.
    pub fn set_empty_backfill(&mut self, empty_backfill: bool) -> &mut Self {
        self.empty_backfill = empty_backfill;
        self
    }

    pub fn set_enable_preview(&mut self, enable_preview: bool) -> &mut Self {
        self.enable_preview = enable_preview;
        self
    }

    /// Environment a new target environment is diffed against.
    pub fn set_create_from(&mut self, environment: &str) -> &mut Self {
        self.create_from = environment.to_string();
        self
    }

    fn is_prod(&self) -> bool {
        self.config.is_prod(&self.environment)
    }

    fn live_environment(&self, name: &str) -> StrataResult<Option<Environment>> {
        Ok(self
            .state
            .get_environment(name)?
            .filter(|environment| !environment.is_expired(self.now)))
    }

    fn base_environment(&self) -> StrataResult<Option<Environment>> {
        match self.live_environment(&self.environment)? {
            Some(environment) => Ok(Some(environment)),
            None => self.live_environment(&self.create_from),
        }
    }

    fn snapshots_by_name(&self, ids: &[SnapshotId]) -> StrataResult<IndexMap<String, Snapshot>> {
        let mut by_name: IndexMap<String, Snapshot> = self
            .state
            .get_snapshots(ids)?
            .into_values()
            .map(|snapshot| (snapshot.name.clone(), snapshot))
            .collect();
        by_name.sort_keys();
        Ok(by_name)
    }

    /// Definitions to fingerprint. Restatement plans keep the environment's
    /// definitions; selections mix local and environment definitions.
    fn candidate_definitions(
        &self,
        previous: &IndexMap<String, Snapshot>,
        restating: bool,
    ) -> StrataResult<IndexMap<String, ModelDefinition>> {
        let recorded: IndexMap<String, ModelDefinition> = previous
            .iter()
            .map(|(name, snapshot)| (name.clone(), snapshot.node.clone()))
            .collect();
        if restating {
            return Ok(recorded);
        }
        let Some(patterns) = &self.selected else {
            return Ok(self.definitions.clone());
        };

        let mut local = Dag::new();
        for definition in self.definitions.values() {
            local.add(&definition.name, &definition.depends_on);
        }
        let mut everything = local.clone();
        for (name, definition) in &recorded {
            if !self.definitions.contains_key(name) {
                everything.add(name, &definition.depends_on);
            }
        }
        let selected = select(patterns, &everything)?;
        let needed: BTreeSet<String> = selected
            .iter()
            .filter(|name| self.definitions.contains_key(*name))
            .flat_map(|name| local.upstream(name))
            .collect();

        let mut result = IndexMap::new();
        for (name, definition) in &self.definitions {
            if selected.contains(name) {
                result.insert(name.clone(), definition.clone());
            } else if let Some(recorded) = recorded.get(name) {
                result.insert(name.clone(), recorded.clone());
            } else if needed.contains(name) {
                result.insert(name.clone(), definition.clone());
            }
        }
        for (name, definition) in &recorded {
            if !self.definitions.contains_key(name) && !selected.contains(name) {
                result.insert(name.clone(), definition.clone());
            }
        }
        result.sort_keys();
        Ok(result)
    }

    fn prepare(&self) -> StrataResult<Prepared> {
        let target = self.live_environment(&self.environment)?;
        let base = match &target {
            Some(environment) => Some(environment.clone()),
            None => self.live_environment(&self.create_from)?,
        };
        let previous = match &base {
            Some(environment) => self.snapshots_by_name(&environment.snapshots)?,
            None => IndexMap::new(),
        };
        let restating = !self.restatements.is_empty() && base.is_some();
        let definitions = self.candidate_definitions(&previous, restating)?;

        let local_names: HashSet<&str> = definitions.keys().map(String::as_str).collect();
        let recorded_names: HashSet<&str> = previous.keys().map(String::as_str).collect();
        check_dependencies(
            definitions.values(),
            &local_names,
            &recorded_names,
            &self.environment,
        )?;

        let mut dag = Dag::new();
        for definition in definitions.values() {
            dag.add(&definition.name, &definition.depends_on);
        }
        let external: HashMap<String, Fingerprint> = previous
            .iter()
            .filter(|(name, _)| !definitions.contains_key(*name))
            .map(|(name, snapshot)| (name.clone(), snapshot.fingerprint.clone()))
            .collect();
        let fingerprints = fingerprint_all(&dag, &definitions, &external)?;
        let order = dag.sorted()?;

        let ids: Vec<SnapshotId> = fingerprints
            .iter()
            .map(|(name, fingerprint)| SnapshotId::new(name, &fingerprint.identifier()))
            .collect();
        let stored = self.state.get_snapshots(&ids)?;

        let mut snapshots: IndexMap<String, Snapshot> = IndexMap::with_capacity(order.len());
        let mut new_names: HashSet<String> = HashSet::new();
        for name in &order {
            let Some(definition) = definitions.get(name) else {
                // Dependency that only exists in the environment.
                if let Some(snapshot) = previous.get(name) {
                    snapshots.insert(name.clone(), snapshot.clone());
                }
                continue;
            };
            let fingerprint = fingerprints.get(name).cloned().ok_or_else(|| {
                StrataError::MissingFingerprint {
                    model: name.clone(),
                    dependency: name.clone(),
                }
            })?;
            let id = SnapshotId::new(name, &fingerprint.identifier());
            if let Some(existing) = stored.get(&id) {
                snapshots.insert(name.clone(), existing.clone());
                continue;
            }
            let parents: Vec<SnapshotId> = definition
                .depends_on
                .iter()
                .filter_map(|dependency| snapshots.get(dependency).map(Snapshot::id))
                .collect();
            snapshots.insert(
                name.clone(),
                Snapshot::new(definition.clone(), fingerprint, parents, self.now),
            );
            new_names.insert(name.clone());
        }

        let previous_by_name: HashMap<String, Snapshot> = previous
            .iter()
            .map(|(name, snapshot)| (name.clone(), snapshot.clone()))
            .collect();
        Categorizer {
            config: &self.config.categorizer,
            choices: &self.choices,
            forward_only_plan: self.forward_only,
        }
        .run(&order, &dag, &mut snapshots, &previous_by_name, &new_names);

        for name in &new_names {
            let Some(snapshot) = snapshots.get_mut(name) else {
                continue;
            };
            if !snapshot.is_categorized() {
                continue;
            }
            snapshot.intervals = self
                .state
                .get_representative_intervals(name, &snapshot.storage_revision())?;
            if snapshot.is_forward_only() {
                snapshot.effective_from = Some(match self.effective_from {
                    Some(effective_from) => effective_from,
                    None => latest_bucket_start(snapshot, self.now)?,
                });
            }
        }

        Ok(Prepared {
            target,
            base,
            previous,
            restating,
            dag,
            order,
            snapshots,
            new_names,
        })
    }

    fn resolve_start(
        &self,
        prepared: &Prepared,
        changed: &HashSet<String>,
    ) -> StrataResult<Timestamp> {
        if let Some(start) = self.start {
            return Ok(start);
        }
        let cutovers: Vec<&Snapshot> = prepared
            .snapshots
            .values()
            .filter(|snapshot| changed.contains(&snapshot.name) && snapshot.is_forward_only())
            .collect();
        if !cutovers.is_empty() {
            if let Some(effective_from) = self.effective_from {
                return Ok(effective_from);
            }
            if !self.is_prod() && self.enable_preview {
                if let Some(start) = earliest_latest_bucket(&cutovers, self.now)? {
                    return Ok(start);
                }
            }
        }
        if let Some(environment) = &prepared.base {
            return Ok(environment.start_at);
        }
        if let Some(start) = prepared.snapshots.values().filter_map(|s| s.node.start).min() {
            return Ok(start);
        }
        if let Some(start) = self.config.default_start_ts(self.now)? {
            return Ok(start);
        }
        let materialized: Vec<&Snapshot> = prepared
            .snapshots
            .values()
            .filter(|snapshot| !snapshot.is_symbolic())
            .collect();
        Ok(earliest_latest_bucket(&materialized, self.now)?
            .unwrap_or_else(|| IntervalUnit::Day.prev(IntervalUnit::Day.floor(self.now))))
    }

    fn production_snapshots(&self, prepared: &Prepared) -> StrataResult<HashMap<String, Snapshot>> {
        let prod_name = &self.config.prod_environment;
        if prepared.base.as_ref().is_some_and(|env| &env.name == prod_name) {
            return Ok(prepared
                .previous
                .iter()
                .map(|(name, snapshot)| (name.clone(), snapshot.clone()))
                .collect());
        }
        let Some(prod) = self.live_environment(prod_name)? else {
            return Ok(HashMap::new());
        };
        Ok(self.snapshots_by_name(&prod.snapshots)?.into_iter().collect())
    }

    /// Build a fresh plan from the definitions, the stored state and every
    /// choice made so far.
    pub fn build(&self) -> StrataResult<Plan> {
        let prepared = self.prepare()?;
        let is_prod = self.is_prod();
        let base_plan_id = prepared.target.as_ref().map(|env| env.plan_id.clone());
        let create_from = prepared
            .base
            .as_ref()
            .map_or_else(|| self.create_from.clone(), |env| env.name.clone());

        let context_diff = ContextDiff::compute(
            &self.environment,
            &create_from,
            prepared.target.is_none(),
            base_plan_id.clone(),
            &prepared.snapshots,
            &prepared.previous,
        );
        let changed: HashSet<String> = context_diff
            .added
            .iter()
            .chain(context_diff.modified.keys())
            .cloned()
            .collect();

        let start = self.resolve_start(&prepared, &changed)?;
        let end = self.end.or_else(|| prepared.base.as_ref().and_then(|env| env.end_at));
        if end.is_some_and(|end| end <= start) {
            return Err(self.invalid(
                &self.environment,
                &format!("plan start {} is not before its end", format_ts(start)),
            ));
        }

        let restated: BTreeMap<String, Interval> = expand_restatements(
            &self.restatements,
            &prepared.snapshots,
            &prepared.dag,
            self.config.restate_downstream,
            self.now,
        )?;
        for (name, (restated_start, restated_end)) in &restated {
            info!(
                model = %name,
                start = %format_ts(*restated_start),
                end = %format_ts(*restated_end),
                "restating"
            );
        }

        let deployability_index = if is_prod {
            DeployabilityIndex::all_deployable()
        } else {
            let restated_names: BTreeSet<String> = restated.keys().cloned().collect();
            DeployabilityIndex::compute(
                &prepared.order,
                &prepared.dag,
                &prepared.snapshots,
                &self.production_snapshots(&prepared)?,
                &restated_names,
                start,
                prepared.base.as_ref().map(|env| env.start_at),
            )
        };

        let backfill = match (&self.backfill, &self.selected) {
            (Some(patterns), _) | (None, Some(patterns)) => Some(select(patterns, &prepared.dag)?),
            (None, None) => None,
        };
        let missing_intervals = IntervalScheduler {
            snapshots: &prepared.snapshots,
            dag: &prepared.dag,
            deployability: &deployability_index,
            changed: &changed,
            backfill: backfill.as_ref(),
            restatements: &restated,
            restatement_only: prepared.restating,
            start,
            end,
            explicit_end: self.end.is_some(),
            now: self.now,
            is_dev: !is_prod,
            enable_preview: self.enable_preview,
        }
        .missing_intervals()?;

        if !context_diff.has_changes()
            && restated.is_empty()
            && self.selected.is_none()
            && self.backfill.is_none()
            && missing_intervals.is_empty()
        {
            return Err(StrataError::NoChanges(self.environment.clone()));
        }

        let restatements: BTreeMap<SnapshotId, Interval> = restated
            .into_iter()
            .filter_map(|(name, range)| prepared.snapshots.get(&name).map(|s| (s.id(), range)))
            .collect();
        let new_snapshots: Vec<SnapshotId> = prepared
            .snapshots
            .values()
            .filter(|snapshot| prepared.new_names.contains(&snapshot.name))
            .map(Snapshot::id)
            .collect();
        let environment_naming = match &prepared.target {
            Some(environment) => environment.naming_info(&self.config.prod_environment),
            None => EnvironmentNamingInfo {
                name: self.environment.clone(),
                suffix_target: self.config.environment_suffix_target,
                is_prod,
            },
        };

        let mut plan = Plan {
            plan_id: String::new(),
            environment: self.environment.clone(),
            environment_naming,
            context_diff,
            snapshots: prepared.snapshots,
            new_snapshots,
            deployability_index,
            missing_intervals,
            restatements,
            start,
            end,
            execution_time: self.now,
            empty_backfill: self.empty_backfill,
            forward_only: self.forward_only,
            is_dev: !is_prod,
            base_plan_id,
            environment_ttl: (!is_prod).then_some(self.config.environment_ttl),
        };
        plan.plan_id = plan.compute_id();

        info!(
            environment = %plan.environment,
            plan_id = %plan.plan_id,
            new_snapshots = plan.new_snapshots.len(),
            missing = plan.missing_intervals.len(),
            start = %format_ts(plan.start),
            "plan built"
        );
        Ok(plan)
    }
}

/// Earliest "most recent fully elapsed bucket" start among `snapshots`.
fn earliest_latest_bucket(
    snapshots: &[&Snapshot],
    now: Timestamp,
) -> StrataResult<Option<Timestamp>> {
    let mut earliest: Option<Timestamp> = None;
    for snapshot in snapshots {
        let start = latest_bucket_start(snapshot, now)?;
        earliest = Some(earliest.map_or(start, |current| current.min(start)));
    }
    Ok(earliest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::environment::{DefaultTableNaming, EnvironmentSuffixTarget};
    use crate::models::Computation;
    use crate::plan::PlanApplier;
    use crate::snapshot::{AutoCategorizationMode, SnapshotChangeCategory::*};
    use crate::store::{InMemoryStateStore, StateSync};
    use crate::test_utils::{apply, sql_model, ts, RecordingEvaluator};

    fn orders(columns: &[&str]) -> ModelDefinition {
        sql_model("db.orders", columns).with_start(ts("2023-01-01"))
    }

    fn report(columns: &[&str]) -> ModelDefinition {
        sql_model("db.report", columns)
            .with_depends_on(["db.orders"])
            .with_start(ts("2023-01-01"))
    }

    fn builder<'a>(
        state: &'a InMemoryStateStore,
        definitions: Vec<ModelDefinition>,
        environment: &str,
        now: &str,
    ) -> PlanBuilder<'a> {
        PlanBuilder::new(state, definitions, environment, PlannerConfig::default(), ts(now))
    }

    /// Production holding `definitions`, complete through 2023-01-07.
    fn seeded(definitions: Vec<ModelDefinition>) -> InMemoryStateStore {
        let state = InMemoryStateStore::new();
        let plan = builder(&state, definitions, "prod", "2023-01-08").build().unwrap();
        apply(&state, &plan, ts("2023-01-08"));
        state
    }

    fn days(plan: &Plan, name: &str) -> Vec<Interval> {
        plan.missing_intervals
            .iter()
            .find(|entry| entry.snapshot_id.name == name)
            .map(|entry| entry.intervals.clone())
            .unwrap_or_default()
    }

    fn daily(from: &str, to: &str) -> Vec<Interval> {
        IntervalUnit::Day.buckets(ts(from), ts(to))
    }

    #[test]
    fn test_first_plan_backfills_from_declared_start() {
        let state = InMemoryStateStore::new();
        let plan = builder(&state, vec![orders(&["id"])], "prod", "2023-01-08")
            .build()
            .unwrap();
        assert!(plan.has_changes());
        assert!(plan.context_diff.is_new_environment);
        assert_eq!(plan.start, ts("2023-01-01"));
        assert_eq!(days(&plan, "db.orders"), daily("2023-01-01", "2023-01-08"));
        assert_eq!(plan.snapshots["db.orders"].change_category, Some(Breaking));
        assert!(plan.base_plan_id.is_none());
    }

    #[test]
    fn test_non_breaking_change_recomputes_full_history() {
        let state = seeded(vec![orders(&["id"])]);
        let plan = builder(&state, vec![orders(&["id", "amount"])], "prod", "2023-01-08 15:00")
            .build()
            .unwrap();

        assert_eq!(plan.snapshots["db.orders"].change_category, Some(NonBreaking));
        assert!(!plan.is_new_version("db.orders"));
        assert_eq!(days(&plan, "db.orders"), daily("2023-01-01", "2023-01-08"));
        assert!(plan.requires_backfill());
    }

    #[test]
    fn test_forward_only_change_computes_latest_bucket() {
        let state = seeded(vec![orders(&["id"])]);
        let changed = orders(&["id", "amount"]).with_forward_only(true);

        let prod = builder(&state, vec![changed.clone()], "prod", "2023-01-08 15:00")
            .build()
            .unwrap();
        let snapshot = &prod.snapshots["db.orders"];
        assert_eq!(snapshot.change_category, Some(ForwardOnly));
        assert_eq!(snapshot.effective_from, Some(ts("2023-01-07")));
        assert_eq!(
            days(&prod, "db.orders"),
            vec![(ts("2023-01-07"), ts("2023-01-08"))]
        );
        assert!(prod.missing_intervals[0].deployable);

        let dev = builder(&state, vec![changed], "dev", "2023-01-08 15:00")
            .build()
            .unwrap();
        assert_eq!(
            days(&dev, "db.orders"),
            vec![(ts("2023-01-07"), ts("2023-01-08"))]
        );
        assert!(!dev.missing_intervals[0].deployable);
        assert!(dev.context_diff.is_new_environment);
    }

    #[test]
    fn test_restatement_round_trip() {
        let state = seeded(vec![orders(&["id"])]);
        let range = (ts("2023-01-07"), ts("2023-01-08"));
        let mut restating = builder(&state, vec![orders(&["id"])], "prod", "2023-01-08 15:00");
        restating.restate("db.orders", range).unwrap();
        let plan = restating.build().unwrap();

        assert!(!plan.has_changes());
        assert!(plan.requires_backfill());
        assert_eq!(days(&plan, "db.orders"), vec![range]);
        let before = state
            .get_environment("prod")
            .unwrap()
            .unwrap()
            .snapshots;
        assert!(before.contains(&plan.snapshots["db.orders"].id()));

        let report = apply(&state, &plan, ts("2023-01-08 15:00"));
        assert_eq!(report.completed.len(), 1);
        let stored = state.get_snapshots(&before).unwrap();
        assert_eq!(
            stored[&before[0]].intervals.as_slice(),
            &[(ts("2023-01-01"), ts("2023-01-08"))]
        );
    }

    #[test]
    fn test_restatement_ignores_pending_changes_and_unknown_models() {
        let state = seeded(vec![orders(&["id"])]);
        let mut restating =
            builder(&state, vec![orders(&["id", "amount"])], "prod", "2023-01-08 15:00");
        assert!(matches!(
            restating.restate("db.unknown", (ts("2023-01-01"), ts("2023-01-02"))),
            Err(StrataError::InvalidOverride { .. })
        ));
        restating
            .restate("db.*", (ts("2023-01-03"), ts("2023-01-04")))
            .unwrap();
        let plan = restating.build().unwrap();
        assert!(plan.new_snapshots.is_empty());
        assert_eq!(
            days(&plan, "db.orders"),
            vec![(ts("2023-01-03"), ts("2023-01-04"))]
        );
    }

    #[test]
    fn test_forward_only_parent_takes_precedence() {
        let state = seeded(vec![orders(&["id"]), report(&["id"])]);
        let plan = builder(
            &state,
            vec![
                orders(&["id", "amount"]).with_forward_only(true),
                report(&["id", "total"]),
            ],
            "prod",
            "2023-01-08 15:00",
        )
        .build()
        .unwrap();
        assert_eq!(plan.snapshots["db.orders"].change_category, Some(ForwardOnly));
        assert_eq!(plan.snapshots["db.report"].change_category, Some(ForwardOnly));
    }

    #[test]
    fn test_choice_retraction_recomputes_downstream() {
        let state = seeded(vec![orders(&["id"]), report(&["id"])]);
        let mut planner = builder(
            &state,
            vec![orders(&["id", "amount"]), report(&["id"])],
            "prod",
            "2023-01-08 15:00",
        );

        planner.set_choice("db.orders", Breaking).unwrap();
        let breaking = planner.build().unwrap();
        assert_eq!(breaking.snapshots["db.report"].change_category, Some(IndirectBreaking));
        assert!(breaking.is_new_version("db.orders"));
        assert!(breaking.is_new_version("db.report"));

        planner.set_choice("db.orders", NonBreaking).unwrap();
        let non_breaking = planner.build().unwrap();
        assert_eq!(
            non_breaking.snapshots["db.report"].change_category,
            Some(IndirectNonBreaking)
        );
        assert!(!non_breaking.is_new_version("db.orders"));
        assert!(!non_breaking.is_new_version("db.report"));
        assert_eq!(days(&non_breaking, "db.report"), Vec::<Interval>::new());
    }

    #[test]
    fn test_invalid_choices_are_rejected() {
        let state = seeded(vec![orders(&["id"]), report(&["id"])]);
        let mut planner = builder(
            &state,
            vec![orders(&["id", "amount"]), report(&["id"])],
            "prod",
            "2023-01-08 15:00",
        );
        for (name, category) in [
            ("db.report", Breaking),
            ("db.orders", ForwardOnly),
            ("db.missing", NonBreaking),
        ] {
            assert!(
                matches!(
                    planner.set_choice(name, category),
                    Err(StrataError::InvalidOverride { .. })
                ),
                "{name}"
            );
        }
    }

    #[test]
    fn test_concurrent_breaking_drafts_share_version() {
        let state = seeded(vec![orders(&["id"])]);
        let draft = |expression: &str, environment: &str| {
            let mut model = orders(&["id"]);
            model.computation = Computation::sql(
                vec![crate::models::Projection::new("id", expression)],
                "FROM raw.db.orders",
            );
            builder(&state, vec![model], environment, "2023-01-08 15:00")
                .build()
                .unwrap()
        };
        let first = draft("id + 1", "dev_a");
        let second = draft("id * 2", "dev_b");
        let (a, b) = (&first.snapshots["db.orders"], &second.snapshots["db.orders"]);
        assert_eq!(a.change_category, Some(Breaking));
        assert_eq!(b.change_category, Some(Breaking));
        assert_ne!(a.id(), b.id());
        assert_eq!(a.version, b.version);
    }

    #[test]
    fn test_no_changes() {
        let state = seeded(vec![orders(&["id"])]);
        let result = builder(&state, vec![orders(&["id"])], "prod", "2023-01-08 10:00").build();
        assert!(matches!(result, Err(StrataError::NoChanges(_))));

        let next_day = builder(&state, vec![orders(&["id"])], "prod", "2023-01-09 10:00")
            .build()
            .unwrap();
        assert!(!next_day.has_changes());
        assert_eq!(
            days(&next_day, "db.orders"),
            vec![(ts("2023-01-08"), ts("2023-01-09"))]
        );
    }

    #[test]
    fn test_build_is_deterministic() {
        let state = seeded(vec![orders(&["id"]), report(&["id"])]);
        let planner = builder(
            &state,
            vec![orders(&["id", "amount"]), report(&["id"])],
            "dev",
            "2023-01-08 15:00",
        );
        let first = planner.build().unwrap();
        let second = planner.build().unwrap();
        assert_eq!(first.plan_id, second.plan_id);
        assert_eq!(first.missing_intervals, second.missing_intervals);
    }

    #[test]
    fn test_selection_keeps_unselected_definitions() {
        let state = seeded(vec![orders(&["id"]), report(&["id"])]);
        let mut planner = builder(
            &state,
            vec![
                orders(&["id", "amount"]),
                report(&["id", "total"]),
                sql_model("db.extra", &["id"]),
            ],
            "prod",
            "2023-01-08 15:00",
        );
        planner.select_models(["db.orders"]);
        let plan = planner.build().unwrap();

        assert!(!plan.snapshots.contains_key("db.extra"));
        assert_eq!(
            plan.directly_modified(),
            BTreeSet::from(["db.orders".to_string()])
        );
        assert_eq!(
            plan.indirectly_modified(),
            BTreeSet::from(["db.report".to_string()])
        );
        assert_eq!(plan.snapshots["db.report"].node, report(&["id"]));
        assert!(plan
            .missing_intervals
            .iter()
            .all(|entry| entry.snapshot_id.name == "db.orders"));
    }

    #[test]
    fn test_missing_dependency_is_inconsistent() {
        let state = InMemoryStateStore::new();
        let result = builder(
            &state,
            vec![sql_model("db.report", &["id"]).with_depends_on(["db.nowhere"])],
            "prod",
            "2023-01-08",
        )
        .build();
        assert!(matches!(result, Err(StrataError::InconsistentDiff { .. })));
    }

    #[test]
    fn test_undecidable_change_needs_choice() {
        let opaque = |source: &str| {
            let mut model = orders(&["id"]);
            model.computation = Computation::opaque(source);
            model
        };
        let state = seeded(vec![opaque("def run(): return 1")]);
        let mut config = PlannerConfig::default();
        config.categorizer.opaque = AutoCategorizationMode::Full;
        let mut planner = PlanBuilder::new(
            &state,
            vec![opaque("def run(): return 2")],
            "prod",
            config,
            ts("2023-01-08 15:00"),
        );
        let plan = planner.build().unwrap();
        assert_eq!(plan.uncategorized().len(), 1);
        assert!(matches!(
            plan.ensure_categorized(),
            Err(StrataError::Uncategorized(_))
        ));

        planner.set_choice("db.orders", NonBreaking).unwrap();
        let plan = planner.build().unwrap();
        assert!(plan.ensure_categorized().is_ok());
        assert_eq!(days(&plan, "db.orders"), daily("2023-01-01", "2023-01-08"));
    }

    #[test]
    fn test_start_after_end_is_rejected() {
        let state = InMemoryStateStore::new();
        let mut planner = builder(&state, vec![orders(&["id"])], "prod", "2023-01-08");
        planner.set_start(ts("2023-01-05")).set_end(ts("2023-01-03"));
        assert!(matches!(
            planner.build(),
            Err(StrataError::InvalidOverride { .. })
        ));
    }

    #[test]
    fn test_dev_restatement_leaves_prod_history_untouched() {
        let state = seeded(vec![orders(&["id"])]);
        let mirror = builder(&state, vec![orders(&["id"])], "dev", "2023-01-08 12:00")
            .build()
            .unwrap();
        assert!(mirror.missing_intervals.is_empty());
        apply(&state, &mirror, ts("2023-01-08 12:00"));

        let range = (ts("2023-01-03"), ts("2023-01-04"));
        let mut restating = builder(&state, vec![orders(&["id"])], "dev", "2023-01-08 15:00");
        restating.restate("db.orders", range).unwrap();
        let plan = restating.build().unwrap();
        assert_eq!(days(&plan, "db.orders"), vec![range]);
        assert!(!plan.missing_intervals[0].deployable);
        let targets = plan.physical_targets(&DefaultTableNaming::default());
        assert!(!targets[0].deployable);

        let mut without_preview =
            builder(&state, vec![orders(&["id"])], "dev", "2023-01-08 15:00");
        without_preview.set_enable_preview(false);
        without_preview.restate("db.orders", range).unwrap();
        assert_eq!(days(&without_preview.build().unwrap(), "db.orders"), vec![range]);

        let result = PlanApplier::new(&state).apply(
            &plan,
            &RecordingEvaluator::failing_on("db.orders"),
            ts("2023-01-08 15:00"),
        );
        assert!(matches!(result, Err(StrataError::Evaluation { .. })));
        let report = apply(&state, &plan, ts("2023-01-08 15:00"));
        assert!(report.completed.iter().all(|task| !task.deployable));

        let id = plan.snapshots["db.orders"].id();
        let stored = state.get_snapshots(&[id.clone()]).unwrap();
        assert_eq!(
            stored[&id].intervals.as_slice(),
            &[(ts("2023-01-01"), ts("2023-01-08"))]
        );
        assert_eq!(stored[&id].dev_intervals.as_slice(), &[range]);

        let prod = builder(&state, vec![orders(&["id"])], "prod", "2023-01-08 15:00").build();
        assert!(matches!(prod, Err(StrataError::NoChanges(_))));
    }

    #[test]
    fn test_breaking_parent_makes_changed_child_breaking() {
        let state = seeded(vec![orders(&["id", "name"]), report(&["id"])]);
        let plan = builder(
            &state,
            vec![orders(&["id"]), report(&["id", "extra"])],
            "prod",
            "2023-01-08 15:00",
        )
        .build()
        .unwrap();

        assert_eq!(plan.snapshots["db.orders"].change_category, Some(Breaking));
        assert_eq!(plan.snapshots["db.report"].change_category, Some(Breaking));
        assert!(plan.is_new_version("db.orders"));
        assert!(plan.is_new_version("db.report"));
        assert_eq!(days(&plan, "db.report"), daily("2023-01-01", "2023-01-08"));
    }

    #[test]
    fn test_naming_follows_existing_environment() {
        let state = seeded(vec![orders(&["id"])]);
        let dev = builder(&state, vec![orders(&["id"])], "dev", "2023-01-08 12:00")
            .build()
            .unwrap();
        apply(&state, &dev, ts("2023-01-08 12:00"));
        let mut stored = state.get_environment("dev").unwrap().unwrap();
        stored.suffix_target = EnvironmentSuffixTarget::Table;
        state.promote(&stored, Some(dev.plan_id.as_str())).unwrap();

        let plan = builder(&state, vec![orders(&["id", "amount"])], "dev", "2023-01-08 15:00")
            .build()
            .unwrap();
        assert_eq!(plan.environment_naming.suffix_target, EnvironmentSuffixTarget::Table);
        assert!(!plan.environment_naming.is_prod);
        let targets = plan.physical_targets(&DefaultTableNaming::default());
        assert_eq!(targets[0].view_name, "db.orders__dev");
    }
}
