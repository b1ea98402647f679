//! Plan types and construction.
//!
//! A [`Plan`] lists one [`Action`] per declared or recorded resource, in an
//! order the executor can follow: declared resources in topological order,
//! then deletes of resources that are no longer declared, dependents first.
//! A delete that a replacement has to wait for is moved ahead of it.
//!
//! A replacement runs in two steps. Its old object is deleted once every
//! recorded object that depends on it is gone (`teardown_after`), and the new
//! object is created once its declared dependencies are applied.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::{debug, info};
use uuid::Uuid;

use crate::context::RunContext;
use crate::error::PlanError;
use crate::graph::ResourceGraph;
use crate::model::{
    Lifecycle, PlannedProperties, Properties, ReplaceTolerance, ResourceKind, schema_for,
};
use crate::provider::ProviderRegistry;
use crate::state::{StateRecord, StateSnapshot};

use super::diff::{DiffDetail, DiffEngine};

/// What an action does to its resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    /// Create a resource that has no record.
    Create,
    /// Update a resource in place.
    Update,
    /// Delete the recorded resource, then create it again.
    Replace,
    /// Delete a resource that is no longer declared.
    Delete,
    /// Nothing to do.
    Noop,
}

/// A single planned action.
#[derive(Debug, Clone, Serialize)]
pub struct Action {
    /// Resource name.
    pub resource: String,
    /// Resource kind (the recorded kind for deletes).
    pub kind: ResourceKind,
    /// What to do.
    pub operation: Operation,
    /// Resources whose actions must be applied first.
    pub dependencies: BTreeSet<String>,
    /// For a replacement, recorded dependents whose old objects must be
    /// deleted before this resource's old object is.
    pub teardown_after: BTreeSet<String>,
    /// Declared properties, references unresolved.
    #[serde(skip)]
    pub desired: Properties,
    /// Declared properties as far as they are known at plan time.
    pub planned: PlannedProperties,
    /// Identifier of the recorded remote object, if any.
    pub provider_id: Option<String>,
    /// Why this action was chosen.
    pub reason: String,
    /// Per-field differences.
    pub details: Vec<DiffDetail>,
}

/// Number of actions per operation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PlanSummary {
    /// Creates.
    pub create: usize,
    /// In-place updates.
    pub update: usize,
    /// Replacements.
    pub replace: usize,
    /// Deletes.
    pub delete: usize,
    /// Unchanged resources.
    pub noop: usize,
}

/// An immutable, ordered plan.
#[derive(Debug, Serialize)]
pub struct Plan {
    id: Uuid,
    created_at: DateTime<Utc>,
    project: String,
    environment: String,
    fingerprint: String,
    actions: Vec<Action>,
}

/// Builds plans from a resource graph and the recorded state.
#[derive(Debug)]
pub struct Planner<'a> {
    registry: &'a ProviderRegistry,
}

impl<'a> Planner<'a> {
    /// Creates a planner that consults the given providers.
    #[must_use]
    pub const fn new(registry: &'a ProviderRegistry) -> Self {
        Self { registry }
    }

    /// Computes the plan that converges `state` to `graph`.
    ///
    /// `fingerprint` identifies the declaration the plan was computed from.
    ///
    /// # Errors
    ///
    /// Returns [`PlanError::MissingProvider`] if a kind has no provider and
    /// [`PlanError::Conflict`] if a replacement would be forced on a
    /// dependent that cannot tolerate it.
    pub fn plan(
        &self,
        ctx: &mut RunContext,
        graph: &ResourceGraph,
        state: &StateSnapshot,
        fingerprint: &str,
    ) -> Result<Plan, PlanError> {
        let mut engine = DiffEngine::new(state);
        let mut actions = Vec::with_capacity(graph.len() + state.resources.len());

        for resource in graph.topological_order() {
            let provider = self.registry.get(resource.kind)?;
            let diff = engine.diff(resource, provider.as_ref());

            actions.push(Action {
                resource: resource.name.clone(),
                kind: resource.kind,
                operation: diff.operation,
                dependencies: graph
                    .dependencies_of(&resource.name)
                    .into_iter()
                    .map(String::from)
                    .collect(),
                teardown_after: BTreeSet::new(),
                desired: resource.properties.clone(),
                planned: diff.planned,
                provider_id: state.get(&resource.name).map(|r| r.provider_id.clone()),
                reason: diff.reason,
                details: diff.details,
            });
        }

        check_conflicts(graph, &actions)?;

        let changed: HashMap<&str, Operation> = actions
            .iter()
            .filter(|a| a.operation != Operation::Noop)
            .map(|a| (a.resource.as_str(), a.operation))
            .collect();
        let deletes = plan_deletes(graph, state, &changed);
        for (record, _) in &deletes {
            self.registry.get(record.kind)?;
        }
        actions.extend(deletes.into_iter().map(|(record, dependencies)| delete_action(record, dependencies)));
        assign_teardowns(state, &mut actions);
        let actions = execution_order(actions);

        for action in &actions {
            ctx.set_lifecycle(&action.resource, Lifecycle::Planned);
        }

        let plan = Plan {
            id: Uuid::new_v4(),
            created_at: Utc::now(),
            project: ctx.project().to_string(),
            environment: ctx.environment().to_string(),
            fingerprint: fingerprint.to_string(),
            actions,
        };
        info!("Plan {}: {}", plan.id, plan.summary());
        Ok(plan)
    }
}

/// Rejects replacements whose in-place-updated dependents forbid them.
fn check_conflicts(graph: &ResourceGraph, actions: &[Action]) -> Result<(), PlanError> {
    let by_name: HashMap<&str, &Action> = actions.iter().map(|a| (a.resource.as_str(), a)).collect();

    for action in actions.iter().filter(|a| a.operation == Operation::Replace) {
        for dependent in graph.dependents_of(&action.resource) {
            let Some(dep_action) = by_name.get(dependent) else {
                continue;
            };
            if dep_action.operation == Operation::Update
                && schema_for(dep_action.kind).replace_tolerance == ReplaceTolerance::Forbids
            {
                return Err(PlanError::Conflict {
                    resource: action.resource.clone(),
                    dependent: dep_action.resource.clone(),
                    dependent_kind: dep_action.kind.to_string(),
                });
            }
        }
    }
    Ok(())
}

/// Orders the deletes of recorded resources that are no longer declared.
///
/// A delete depends on the changes of every resource whose recorded
/// dependencies include it, so dependents go first.
fn plan_deletes<'s>(
    graph: &ResourceGraph,
    state: &'s StateSnapshot,
    changed: &HashMap<&str, Operation>,
) -> Vec<(&'s StateRecord, BTreeSet<String>)> {
    let removed: BTreeMap<&str, &StateRecord> = state
        .resources
        .values()
        .filter(|r| !graph.contains(&r.name))
        .map(|r| (r.name.as_str(), r))
        .collect();

    let mut dependencies: BTreeMap<&str, BTreeSet<String>> = BTreeMap::new();
    for name in removed.keys().copied() {
        let deps = state
            .resources
            .values()
            .filter(|other| other.dependencies.contains(name))
            .filter(|other| removed.contains_key(other.name.as_str()) || changed.contains_key(other.name.as_str()))
            .map(|other| other.name.clone())
            .collect();
        dependencies.insert(name, deps);
    }

    // Kahn over the removed subset, ties broken by name.
    let mut waiting: BTreeMap<&str, usize> = dependencies
        .iter()
        .map(|(name, deps)| {
            let count = deps.iter().filter(|d| removed.contains_key(d.as_str())).count();
            (*name, count)
        })
        .collect();
    let mut ready: BTreeSet<&str> = waiting
        .iter()
        .filter(|(_, count)| **count == 0)
        .map(|(name, _)| *name)
        .collect();
    let mut order = Vec::with_capacity(removed.len());

    while let Some(name) = ready.pop_first() {
        waiting.remove(name);
        order.push(name);
        if let Some(record) = removed.get(name) {
            for target in &record.dependencies {
                if let Some(count) = waiting.get_mut(target.as_str()) {
                    *count -= 1;
                    if *count == 0 {
                        ready.insert(target.as_str());
                    }
                }
            }
        }
    }
    // Recorded dependencies should be acyclic; keep anything left in name order.
    order.extend(waiting.keys().copied());

    order
        .into_iter()
        .filter_map(|name| {
            let record = removed.get(name)?;
            let deps = dependencies.remove(name).unwrap_or_default();
            debug!("{name}: delete after {deps:?}");
            Some((*record, deps))
        })
        .collect()
}

/// Makes each replacement wait for the removal of every recorded object that
/// still depends on the one it deletes.
fn assign_teardowns(state: &StateSnapshot, actions: &mut [Action]) {
    let removing: BTreeSet<String> = actions
        .iter()
        .filter(|a| matches!(a.operation, Operation::Delete | Operation::Replace))
        .map(|a| a.resource.clone())
        .collect();

    for action in actions.iter_mut().filter(|a| a.operation == Operation::Replace) {
        let teardown: BTreeSet<String> = state
            .resources
            .values()
            .filter(|r| r.dependencies.contains(&action.resource) && removing.contains(&r.name))
            .map(|r| r.name.clone())
            .collect();
        if !teardown.is_empty() {
            debug!("{}: old object deleted after {teardown:?}", action.resource);
        }
        action.teardown_after = teardown;
    }
}

/// Stable topological sort over dependencies and waits on deletes.
///
/// Among ready actions the earliest one goes first, so an order that is
/// already valid is kept unchanged.
fn execution_order(actions: Vec<Action>) -> Vec<Action> {
    let position: HashMap<&str, usize> = actions
        .iter()
        .enumerate()
        .map(|(i, a)| (a.resource.as_str(), i))
        .collect();

    let mut followers = vec![Vec::new(); actions.len()];
    let mut waiting = vec![0_usize; actions.len()];
    for (i, action) in actions.iter().enumerate() {
        let deletes = action
            .teardown_after
            .iter()
            .filter(|name| {
                position
                    .get(name.as_str())
                    .is_some_and(|&p| actions[p].operation == Operation::Delete)
            });
        let prerequisites: BTreeSet<usize> = action
            .dependencies
            .iter()
            .chain(deletes)
            .filter_map(|name| position.get(name.as_str()).copied())
            .collect();
        waiting[i] = prerequisites.len();
        for p in prerequisites {
            followers[p].push(i);
        }
    }

    let mut ready: BTreeSet<usize> = (0..actions.len()).filter(|&i| waiting[i] == 0).collect();
    let mut placed = vec![false; actions.len()];
    let mut order = Vec::with_capacity(actions.len());
    while let Some(i) = ready.pop_first() {
        placed[i] = true;
        order.push(i);
        for &f in &followers[i] {
            waiting[f] -= 1;
            if waiting[f] == 0 {
                ready.insert(f);
            }
        }
    }
    order.extend((0..actions.len()).filter(|&i| !placed[i]));

    let mut slots: Vec<Option<Action>> = actions.into_iter().map(Some).collect();
    order.into_iter().filter_map(|i| slots[i].take()).collect()
}

fn delete_action(record: &StateRecord, dependencies: BTreeSet<String>) -> Action {
    Action {
        resource: record.name.clone(),
        kind: record.kind,
        operation: Operation::Delete,
        dependencies,
        teardown_after: BTreeSet::new(),
        desired: Properties::new(),
        planned: PlannedProperties::new(),
        provider_id: Some(record.provider_id.clone()),
        reason: String::from("no longer declared"),
        details: record
            .properties
            .iter()
            .map(|(field, value)| DiffDetail {
                field: field.clone(),
                old_value: Some(value.to_string()),
                new_value: None,
            })
            .collect(),
    }
}

impl Plan {
    /// Unique identifier of this plan.
    #[must_use]
    pub const fn id(&self) -> Uuid {
        self.id
    }

    /// When the plan was computed.
    #[must_use]
    pub const fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Project name.
    #[must_use]
    pub fn project(&self) -> &str {
        &self.project
    }

    /// Environment name.
    #[must_use]
    pub fn environment(&self) -> &str {
        &self.environment
    }

    /// Hash of the declaration this plan was computed from.
    #[must_use]
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    /// All actions, in execution order.
    #[must_use]
    pub fn actions(&self) -> &[Action] {
        &self.actions
    }

    /// Actions that change something.
    pub fn changes(&self) -> impl Iterator<Item = &Action> + '_ {
        self.actions.iter().filter(|a| a.operation != Operation::Noop)
    }

    /// Finds the action for a resource.
    #[must_use]
    pub fn action(&self, resource: &str) -> Option<&Action> {
        self.actions.iter().find(|a| a.resource == resource)
    }

    /// Returns true if the plan changes nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.changes().next().is_none()
    }

    /// Counts actions per operation.
    #[must_use]
    pub fn summary(&self) -> PlanSummary {
        self.actions
            .iter()
            .fold(PlanSummary::default(), |mut summary, action| {
                match action.operation {
                    Operation::Create => summary.create += 1,
                    Operation::Update => summary.update += 1,
                    Operation::Replace => summary.replace += 1,
                    Operation::Delete => summary.delete += 1,
                    Operation::Noop => summary.noop += 1,
                }
                summary
            })
    }

    /// Consumes the plan, yielding its actions.
    #[must_use]
    pub fn into_actions(self) -> Vec<Action> {
        self.actions
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Replace => "replace",
            Self::Delete => "delete",
            Self::Noop => "noop",
        };
        write!(f, "{s}")
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {} '{}'", self.operation, self.kind, self.resource)?;
        if !self.reason.is_empty() {
            write!(f, " ({})", self.reason)?;
        }
        Ok(())
    }
}

impl std::fmt::Display for PlanSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} to create, {} to update, {} to replace, {} to delete, {} unchanged",
            self.create, self.update, self.replace, self.delete, self.noop
        )
    }
}

impl std::fmt::Display for Plan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_empty() {
            return write!(f, "No changes required");
        }

        writeln!(f, "Plan {} ({}):", self.id, self.summary())?;
        for (i, action) in self.changes().enumerate() {
            writeln!(f, "  {}. {action}", i + 1)?;
        }
        Ok(())
    }
}
