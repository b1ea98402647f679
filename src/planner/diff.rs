//! Diff engine for comparing desired resources with recorded state.
//!
//! Each declared resource is resolved against the outputs already recorded
//! for its dependencies, then compared with its state record. References to
//! resources that are about to be created or replaced resolve to
//! [`PlannedValue::Unknown`].

use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

use crate::model::{
    DiffPolicy, KindSchema, OutputRef, PlannedProperties, PlannedValue, Properties, Resource,
};
use crate::provider::Provider;
use crate::state::{StateRecord, StateSnapshot};

use super::plan::Operation;

/// Detail about a specific difference.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct DiffDetail {
    /// Field that differs.
    pub field: String,
    /// Recorded value.
    pub old_value: Option<String>,
    /// Desired value.
    pub new_value: Option<String>,
}

/// Planning decision for one declared resource.
#[derive(Debug, Clone)]
pub struct ResourceDiff {
    /// Resource name.
    pub name: String,
    /// Operation needed to converge.
    pub operation: Operation,
    /// Desired properties with known references substituted.
    pub planned: PlannedProperties,
    /// Per-field differences.
    pub details: Vec<DiffDetail>,
    /// Why this operation was chosen.
    pub reason: String,
}

/// Engine for computing diffs between desired and recorded state.
///
/// The engine is stateful across one planning pass: resources must be fed in
/// topological order so that the outputs of resources being created or
/// replaced are known to be unknown by the time their dependents are diffed.
#[derive(Debug)]
pub struct DiffEngine<'a> {
    state: &'a StateSnapshot,
    pending: BTreeSet<String>,
}

impl<'a> DiffEngine<'a> {
    /// Creates a diff engine over a state snapshot.
    #[must_use]
    pub const fn new(state: &'a StateSnapshot) -> Self {
        Self {
            state,
            pending: BTreeSet::new(),
        }
    }

    /// Resolves references against recorded outputs.
    ///
    /// A reference is unknown if its target is being created or replaced in
    /// this plan, or if the target's record lacks the output.
    #[must_use]
    pub fn plan_properties(&self, properties: &Properties) -> PlannedProperties {
        let lookup = |r: &OutputRef| -> Option<String> {
            if self.pending.contains(&r.resource) {
                return None;
            }
            self.state
                .get(&r.resource)
                .and_then(|record| record.outputs.get(&r.output).cloned())
        };

        properties
            .iter()
            .map(|(key, value)| {
                let planned = value
                    .resolve(&lookup)
                    .map_or(PlannedValue::Unknown, PlannedValue::Known);
                (key.clone(), planned)
            })
            .collect()
    }

    /// Diffs one declared resource.
    pub fn diff(&mut self, resource: &Resource, provider: &dyn Provider) -> ResourceDiff {
        let planned = self.plan_properties(&resource.properties);

        let Some(record) = self.state.get(&resource.name) else {
            debug!("{}: no record, create", resource.name);
            self.pending.insert(resource.name.clone());
            let details = planned
                .iter()
                .map(|(field, value)| DiffDetail {
                    field: field.clone(),
                    old_value: None,
                    new_value: Some(value.to_string()),
                })
                .collect();
            return ResourceDiff {
                name: resource.name.clone(),
                operation: Operation::Create,
                planned,
                details,
                reason: String::from("not yet created"),
            };
        };

        let details = field_details(record, &planned);

        let (operation, reason) = if record.kind == resource.kind {
            match provider.diff_policy(&record.properties, &planned) {
                DiffPolicy::Noop => (Operation::Noop, String::from("up to date")),
                DiffPolicy::Update => (
                    Operation::Update,
                    format!("changed: {}", changed_names(&details)),
                ),
                DiffPolicy::Replace => (
                    Operation::Replace,
                    format!("replacement forced by: {}", changed_names(&details)),
                ),
            }
        } else {
            (
                Operation::Replace,
                format!("kind changed from {} to {}", record.kind, resource.kind),
            )
        };

        debug!("{}: {operation} ({reason})", resource.name);
        if operation == Operation::Replace {
            self.pending.insert(resource.name.clone());
        }

        ResourceDiff {
            name: resource.name.clone(),
            operation,
            planned,
            details,
            reason,
        }
    }
}

fn field_details(record: &StateRecord, planned: &PlannedProperties) -> Vec<DiffDetail> {
    let old: BTreeMap<&str, String> = record
        .properties
        .iter()
        .map(|(k, v)| (k.as_str(), v.to_string()))
        .collect();

    KindSchema::changed_fields(&record.properties, planned)
        .into_iter()
        .map(|field| DiffDetail {
            old_value: old.get(field.as_str()).cloned(),
            new_value: planned.get(&field).map(ToString::to_string),
            field,
        })
        .collect()
}

fn changed_names(details: &[DiffDetail]) -> String {
    details
        .iter()
        .map(|d| d.field.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}
