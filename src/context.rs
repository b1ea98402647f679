//! Per-run bookkeeping.
//!
//! A [`RunContext`] is created for every plan or apply and handed to the
//! graph builder, the planner and the executor. It carries the run identity,
//! the cancellation signal and the lifecycle of every resource touched by the
//! run. Nothing here outlives the run.

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use crate::model::Lifecycle;

/// Bookkeeping for a single provisioning run.
#[derive(Debug)]
pub struct RunContext {
    run_id: Uuid,
    project: String,
    environment: String,
    started_at: DateTime<Utc>,
    cancel: CancellationToken,
    lifecycles: BTreeMap<String, Lifecycle>,
}

impl RunContext {
    /// Creates a context for a new run.
    #[must_use]
    pub fn new(project: &str, environment: &str) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            project: project.to_string(),
            environment: environment.to_string(),
            started_at: Utc::now(),
            cancel: CancellationToken::new(),
            lifecycles: BTreeMap::new(),
        }
    }

    /// Unique identifier of this run.
    #[must_use]
    pub const fn run_id(&self) -> Uuid {
        self.run_id
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

    /// When the run started.
    #[must_use]
    pub const fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Returns a handle that cancels this run when triggered.
    ///
    /// Cancelling stops the dispatch of new actions; in-flight actions still
    /// complete and are persisted.
    #[must_use]
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Cancels the run.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Returns true once the run has been cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Records a lifecycle transition.
    pub fn set_lifecycle(&mut self, resource: &str, lifecycle: Lifecycle) {
        debug!("{resource}: {lifecycle}");
        self.lifecycles.insert(resource.to_string(), lifecycle);
    }

    /// Returns the lifecycle of a resource, if the run has seen it.
    #[must_use]
    pub fn lifecycle(&self, resource: &str) -> Option<Lifecycle> {
        self.lifecycles.get(resource).copied()
    }

    /// Returns every resource currently in the given lifecycle.
    #[must_use]
    pub fn resources_in(&self, lifecycle: Lifecycle) -> Vec<&str> {
        self.lifecycles
            .iter()
            .filter(|(_, l)| **l == lifecycle)
            .map(|(name, _)| name.as_str())
            .collect()
    }
}
