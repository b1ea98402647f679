//! Reconciler driving plan and apply runs.
//!
//! This module ties the pieces together: it loads the recorded state, builds
//! the dependency graph from the declaration, computes a plan and hands it to
//! the executor while holding the state lock.

use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::config::{ConfigHasher, ConfigValidator, DeployConfig};
use crate::context::RunContext;
use crate::error::Result;
use crate::graph::GraphBuilder;
use crate::model::{Resource, Value};
use crate::planner::{ExecutionReport, ExecutorSettings, Plan, PlanExecutor, Planner};
use crate::provider::ProviderRegistry;
use crate::state::{
    RunHistoryEntry, RunOperation, StateSnapshot, StateStore, generate_holder_id,
    holder_or_generated,
};

/// Reconciles declared resources with the recorded state.
pub struct Reconciler {
    /// Declaration.
    config: DeployConfig,
    /// Providers for every kind.
    registry: ProviderRegistry,
    /// Where the state lives.
    store: Arc<dyn StateStore>,
    /// Concurrency and retries.
    settings: ExecutorSettings,
    /// Name recorded in the state lock.
    holder: String,
}

impl Reconciler {
    /// Creates a reconciler. Executor settings come from the configuration.
    #[must_use]
    pub fn new(config: DeployConfig, registry: ProviderRegistry, store: Arc<dyn StateStore>) -> Self {
        let settings = ExecutorSettings {
            concurrency: config.execution.concurrency,
            retry: config.retry_policy(),
        };
        Self {
            config,
            registry,
            store,
            settings,
            holder: generate_holder_id(),
        }
    }

    /// Overrides the executor settings.
    #[must_use]
    pub const fn with_settings(mut self, settings: ExecutorSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Sets the lock holder name. An empty name keeps a generated one.
    #[must_use]
    pub fn with_holder(mut self, holder: &str) -> Self {
        self.holder = holder_or_generated(holder);
        self
    }

    /// The declaration being reconciled.
    #[must_use]
    pub const fn config(&self) -> &DeployConfig {
        &self.config
    }

    /// Creates a run context for this project environment.
    #[must_use]
    pub fn context(&self) -> RunContext {
        RunContext::new(&self.config.project.name, &self.config.project.environment)
    }

    /// Loads the recorded state, or an empty snapshot if none exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the state cannot be read or is corrupted.
    pub async fn load_state(&self) -> Result<StateSnapshot> {
        let state = self.store.load().await?.unwrap_or_else(|| {
            debug!("No recorded state at {}", self.store.location());
            StateSnapshot::new(&self.config.project.name, &self.config.project.environment)
        });
        Ok(state)
    }

    /// Computes the plan that would converge the recorded state, without
    /// calling any provider.
    ///
    /// # Errors
    ///
    /// Returns an error if the declaration is invalid, the state is
    /// corrupted, or the graph or plan cannot be built.
    pub async fn plan(&self, ctx: &mut RunContext) -> Result<Plan> {
        ConfigValidator::new().validate(&self.config)?;
        let state = self.load_state().await?;
        self.plan_against(ctx, self.config.resources(), &self.config.outputs, &state)
    }

    /// Plans and executes the changes needed to converge.
    ///
    /// # Errors
    ///
    /// Returns an error if planning fails, the state lock is held by someone
    /// else, or the state cannot be read. Provider failures are reported in
    /// the [`ExecutionReport`].
    pub async fn apply(&self, ctx: &mut RunContext) -> Result<ExecutionReport> {
        ConfigValidator::new().validate(&self.config)?;
        self.run(ctx, self.config.resources(), &self.config.outputs, RunOperation::Apply)
            .await
    }

    /// Deletes every recorded resource.
    ///
    /// # Errors
    ///
    /// Same as [`Self::apply`].
    pub async fn destroy(&self, ctx: &mut RunContext) -> Result<ExecutionReport> {
        self.run(ctx, Vec::new(), &BTreeMap::new(), RunOperation::Destroy)
            .await
    }

    fn plan_against(
        &self,
        ctx: &mut RunContext,
        resources: Vec<Resource>,
        outputs: &BTreeMap<String, Value>,
        state: &StateSnapshot,
    ) -> Result<Plan> {
        let graph = GraphBuilder::new().build(ctx, resources)?;
        graph.check_outputs(outputs)?;
        let fingerprint = ConfigHasher::hash_config(&self.config);
        let plan = Planner::new(&self.registry).plan(ctx, &graph, state, &fingerprint)?;

        info!(
            "Plan {} for {}/{}: {}",
            plan.id(),
            plan.project(),
            plan.environment(),
            plan.summary()
        );
        Ok(plan)
    }

    async fn run(
        &self,
        ctx: &mut RunContext,
        resources: Vec<Resource>,
        outputs: &BTreeMap<String, Value>,
        operation: RunOperation,
    ) -> Result<ExecutionReport> {
        info!(
            "Starting {operation} for {}/{} (run {})",
            self.config.project.name,
            self.config.project.environment,
            ctx.run_id()
        );

        let lock = self
            .store
            .acquire_lock(&self.holder, Some(ctx.run_id()))
            .await?;
        debug!("Acquired state lock {}", lock.lock_id);

        let result = self.run_locked(ctx, resources, outputs, operation).await;

        if let Err(e) = self.store.release_lock(&lock.lock_id).await {
            warn!("Failed to release state lock {}: {e}", lock.lock_id);
        }
        result
    }

    async fn run_locked(
        &self,
        ctx: &mut RunContext,
        resources: Vec<Resource>,
        outputs: &BTreeMap<String, Value>,
        operation: RunOperation,
    ) -> Result<ExecutionReport> {
        let state = self.load_state().await?;
        let plan = self.plan_against(ctx, resources, outputs, &state)?;

        let executor = PlanExecutor::new(self.registry.clone(), self.settings);
        let mut report = executor
            .execute(ctx, plan, Arc::clone(&self.store), state)
            .await?;

        let entry = RunHistoryEntry::new(
            report.run_id,
            operation,
            report.status,
            report.applied().into_iter().map(String::from).collect(),
            report.failed().into_iter().map(String::from).collect(),
        );
        report.snapshot.add_history(entry);
        report.outputs = report.snapshot.evaluate_outputs(outputs);
        report.snapshot.outputs.clone_from(&report.outputs);
        report.snapshot.touch();

        if let Err(e) = self.store.save(&report.snapshot).await {
            error!("Failed to save run history: {e}");
            report.state_errors.push(e.to_string());
        }

        info!("{operation} finished with status {}", report.status);
        Ok(report)
    }
}

impl std::fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler")
            .field("project", &self.config.project.name)
            .field("environment", &self.config.project.environment)
            .field("state", &self.store.location())
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}
