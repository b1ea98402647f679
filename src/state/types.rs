//! State types for recorded infrastructure.
//!
//! A [`StateSnapshot`] is the whole persisted document: one [`StateRecord`]
//! per logical resource name plus a bounded run history. Records change only
//! after the provider confirmed the corresponding operation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use uuid::Uuid;

use crate::config::ConfigHasher;
use crate::error::StateError;
use crate::model::{OutputRef, Properties, ResourceKind, Value};
use crate::provider::Outputs;

/// Current version of the state format.
pub const STATE_VERSION: &str = "1";

/// Number of history entries kept in a snapshot.
pub const MAX_HISTORY: usize = 100;

/// The complete recorded state of a project environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateSnapshot {
    /// State format version.
    pub version: String,
    /// Project name.
    pub project: String,
    /// Environment name.
    pub environment: String,
    /// Incremented on every save.
    #[serde(default)]
    pub serial: u64,
    /// When the snapshot was last saved.
    pub last_updated: DateTime<Utc>,
    /// Records keyed by logical resource name.
    #[serde(default)]
    pub resources: BTreeMap<String, StateRecord>,
    /// Recent runs, oldest first.
    #[serde(default)]
    pub history: Vec<RunHistoryEntry>,
    /// Stack outputs evaluated after the last run.
    #[serde(default)]
    pub outputs: BTreeMap<String, String>,
}

/// What the state store knows about one applied resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateRecord {
    /// Logical name.
    pub name: String,
    /// Resource kind.
    pub kind: ResourceKind,
    /// Identifier assigned by the provider.
    pub provider_id: String,
    /// Last applied properties, with references resolved.
    pub properties: Properties,
    /// Outputs reported by the provider.
    #[serde(default)]
    pub outputs: Outputs,
    /// Resources this one referenced when it was applied.
    #[serde(default)]
    pub dependencies: BTreeSet<String>,
    /// Hash of `properties`.
    pub properties_hash: String,
    /// When the remote object was created.
    pub created_at: DateTime<Utc>,
    /// When the record last changed.
    pub updated_at: DateTime<Utc>,
}

/// Kind of run recorded in the history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunOperation {
    /// Converge to the declared resources.
    Apply,
    /// Remove every recorded resource.
    Destroy,
}

/// Overall outcome of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Every action applied.
    Success,
    /// Some actions applied, others failed, were blocked or skipped.
    PartialFailure,
    /// Nothing applied and at least one action did not succeed.
    Failure,
}

/// A single entry in the run history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunHistoryEntry {
    /// Run identifier.
    pub run_id: Uuid,
    /// When the run finished.
    pub timestamp: DateTime<Utc>,
    /// Kind of run.
    pub operation: RunOperation,
    /// Outcome.
    pub status: RunStatus,
    /// Resources changed by the run.
    #[serde(default)]
    pub applied: Vec<String>,
    /// Resources whose action failed.
    #[serde(default)]
    pub failed: Vec<String>,
}

impl StateSnapshot {
    /// Creates an empty snapshot.
    #[must_use]
    pub fn new(project: &str, environment: &str) -> Self {
        Self {
            version: STATE_VERSION.to_string(),
            project: project.to_string(),
            environment: environment.to_string(),
            serial: 0,
            last_updated: Utc::now(),
            resources: BTreeMap::new(),
            history: Vec::new(),
            outputs: BTreeMap::new(),
        }
    }

    /// Evaluates stack outputs against the recorded resource outputs.
    ///
    /// Outputs that reference a resource without a record are left out.
    #[must_use]
    pub fn evaluate_outputs(&self, declared: &BTreeMap<String, Value>) -> BTreeMap<String, String> {
        let lookup = |r: &OutputRef| {
            self.get(&r.resource)
                .and_then(|record| record.outputs.get(&r.output))
                .cloned()
        };

        declared
            .iter()
            .filter_map(|(name, value)| {
                let text = match value.resolve(&lookup)? {
                    Value::String(s) => s,
                    other => other.to_string(),
                };
                Some((name.clone(), text))
            })
            .collect()
    }

    /// Rejects snapshots written in another format version.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::VersionMismatch`] on a different version.
    pub fn check_version(&self) -> Result<(), StateError> {
        if self.version == STATE_VERSION {
            Ok(())
        } else {
            Err(StateError::VersionMismatch {
                expected: STATE_VERSION.to_string(),
                found: self.version.clone(),
            })
        }
    }

    /// Gets a record by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&StateRecord> {
        self.resources.get(name)
    }

    /// Adds or replaces a record.
    pub fn upsert(&mut self, record: StateRecord) {
        self.resources.insert(record.name.clone(), record);
    }

    /// Removes a record by name.
    pub fn remove(&mut self, name: &str) -> Option<StateRecord> {
        self.resources.remove(name)
    }

    /// Marks the snapshot as about to be saved.
    pub fn touch(&mut self) {
        self.serial += 1;
        self.last_updated = Utc::now();
    }

    /// Adds a history entry, dropping the oldest beyond [`MAX_HISTORY`].
    pub fn add_history(&mut self, entry: RunHistoryEntry) {
        self.history.push(entry);
        if self.history.len() > MAX_HISTORY {
            let excess = self.history.len() - MAX_HISTORY;
            self.history.drain(..excess);
        }
    }

    /// Returns all recorded names.
    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        self.resources.keys().map(String::as_str).collect()
    }

    /// Returns true if nothing is recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }
}

impl StateRecord {
    /// Creates a record for a freshly applied resource.
    #[must_use]
    pub fn new(
        name: &str,
        kind: ResourceKind,
        provider_id: &str,
        properties: Properties,
        outputs: Outputs,
        dependencies: BTreeSet<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            name: name.to_string(),
            kind,
            provider_id: provider_id.to_string(),
            properties_hash: ConfigHasher::hash_properties(&properties),
            properties,
            outputs,
            dependencies,
            created_at: now,
            updated_at: now,
        }
    }

    /// Keeps the creation time of the record this one supersedes.
    #[must_use]
    pub const fn created(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self
    }
}

impl RunHistoryEntry {
    /// Creates a history entry stamped now.
    #[must_use]
    pub fn new(
        run_id: Uuid,
        operation: RunOperation,
        status: RunStatus,
        applied: Vec<String>,
        failed: Vec<String>,
    ) -> Self {
        Self {
            run_id,
            timestamp: Utc::now(),
            operation,
            status,
            applied,
            failed,
        }
    }
}

impl std::fmt::Display for RunOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let op = match self {
            Self::Apply => "apply",
            Self::Destroy => "destroy",
        };
        write!(f, "{op}")
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let status = match self {
            Self::Success => "success",
            Self::PartialFailure => "partial failure",
            Self::Failure => "failure",
        };
        write!(f, "{status}")
    }
}
