//! Plan executor.
//!
//! The executor walks a [`Plan`] with a bounded pool of tokio tasks. An
//! action is dispatched once every dependency is applied; a failure blocks
//! everything downstream of it while independent branches keep going. Every
//! confirmed provider call is recorded through the [`StateWriter`] before its
//! dependents are released.
//!
//! A replacement is dispatched twice: first to delete the old object, once
//! the recorded dependents listed in `teardown_after` are gone, then to create
//! the new one, once its dependencies are applied.

use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::DEFAULT_CONCURRENCY;
use crate::context::RunContext;
use crate::error::{DeployError, ProviderError, Result};
use crate::model::{Lifecycle, OutputRef, Properties, ResourceKind};
use crate::provider::{Outputs, Provider, ProviderRegistry};
use crate::state::{
    RunStatus, StateMutation, StateRecord, StateSnapshot, StateStore, StateWriter,
};

use super::plan::{Action, Operation, Plan};

/// Retry behavior for idempotent providers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub initial_backoff: Duration,
    /// Upper bound on the delay.
    pub max_backoff: Duration,
}

/// Executor settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutorSettings {
    /// Maximum number of actions in flight.
    pub concurrency: usize,
    /// Retry policy; `None` disables retries.
    pub retry: Option<RetryPolicy>,
}

/// Where an action ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionState {
    /// Not yet dispatched.
    Pending,
    /// Provider call running.
    InFlight,
    /// Done and recorded.
    Applied,
    /// The provider call failed.
    Failed,
    /// A dependency failed or was blocked.
    Blocked,
    /// Never dispatched because the run was cancelled.
    Skipped,
}

/// Final state of one action.
#[derive(Debug, Clone, Serialize)]
pub struct ActionOutcome {
    /// Resource name.
    pub resource: String,
    /// Resource kind.
    pub kind: ResourceKind,
    /// Planned operation.
    pub operation: Operation,
    /// Final state.
    pub state: ActionState,
    /// Provider calls made, retries included.
    pub attempts: u32,
    /// Failure message, for failed and blocked actions.
    pub error: Option<String>,
}

/// Result of executing a plan.
#[derive(Debug, Serialize)]
pub struct ExecutionReport {
    /// Run that executed the plan.
    pub run_id: Uuid,
    /// Plan that was executed.
    pub plan_id: Uuid,
    /// Overall outcome.
    pub status: RunStatus,
    /// One outcome per action, in plan order.
    pub outcomes: Vec<ActionOutcome>,
    /// Number of state saves.
    pub state_writes: usize,
    /// State saves that failed.
    pub state_errors: Vec<String>,
    /// Stack outputs evaluated after the run.
    pub outputs: BTreeMap<String, String>,
    /// State after the run.
    #[serde(skip)]
    pub snapshot: StateSnapshot,
}

/// Executes plans against providers.
#[derive(Debug, Clone)]
pub struct PlanExecutor {
    registry: ProviderRegistry,
    settings: ExecutorSettings,
}

/// What a finished action asks the state writer to do.
enum Completion {
    Upserted(StateRecord),
    Removed,
    /// The old object of a replacement is gone; the create step is next.
    TornDown,
}

/// Everything a spawned action needs.
struct Job {
    index: usize,
    action: Action,
    properties: Properties,
    provider: Arc<dyn Provider>,
    previous: Option<(StateRecord, Arc<dyn Provider>)>,
    retry: Option<RetryPolicy>,
    teardown: bool,
}

struct JobResult {
    index: usize,
    outcome: std::result::Result<Completion, ProviderError>,
    attempts: u32,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            retry: None,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (1-based), doubling up to the cap.
    #[must_use]
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = 2_u32.saturating_pow(retry.saturating_sub(1));
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

impl ActionState {
    /// Returns true for states an action can no longer leave.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending | Self::InFlight)
    }
}

impl std::fmt::Display for ActionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::InFlight => "in flight",
            Self::Applied => "applied",
            Self::Failed => "failed",
            Self::Blocked => "blocked",
            Self::Skipped => "skipped",
        };
        write!(f, "{s}")
    }
}

impl ExecutionReport {
    fn names_where(&self, pred: impl Fn(&ActionOutcome) -> bool) -> Vec<&str> {
        self.outcomes
            .iter()
            .filter(|o| pred(o))
            .map(|o| o.resource.as_str())
            .collect()
    }

    /// Resources changed by the run.
    #[must_use]
    pub fn applied(&self) -> Vec<&str> {
        self.names_where(|o| o.state == ActionState::Applied && o.operation != Operation::Noop)
    }

    /// Resources whose action failed.
    #[must_use]
    pub fn failed(&self) -> Vec<&str> {
        self.names_where(|o| o.state == ActionState::Failed)
    }

    /// Resources not attempted because a dependency did not apply.
    #[must_use]
    pub fn blocked(&self) -> Vec<&str> {
        self.names_where(|o| o.state == ActionState::Blocked)
    }

    /// Resources not attempted because the run was cancelled.
    #[must_use]
    pub fn skipped(&self) -> Vec<&str> {
        self.names_where(|o| o.state == ActionState::Skipped)
    }

    /// Resources that needed no change.
    #[must_use]
    pub fn unchanged(&self) -> Vec<&str> {
        self.names_where(|o| o.operation == Operation::Noop)
    }

    /// Finds the outcome for a resource.
    #[must_use]
    pub fn outcome(&self, resource: &str) -> Option<&ActionOutcome> {
        self.outcomes.iter().find(|o| o.resource == resource)
    }

    /// Returns true if every action applied.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Success
    }
}

impl PlanExecutor {
    /// Creates an executor.
    #[must_use]
    pub fn new(registry: ProviderRegistry, settings: ExecutorSettings) -> Self {
        let settings = ExecutorSettings {
            concurrency: settings.concurrency.max(1),
            ..settings
        };
        Self { registry, settings }
    }

    /// Executes a plan, consuming it.
    ///
    /// Provider failures do not make this return an error; they are reported
    /// per action in the [`ExecutionReport`].
    ///
    /// # Errors
    ///
    /// Returns an error if a provider is missing for a planned kind (before
    /// any provider call), if the state writer stops, or if an action task
    /// panics.
    pub async fn execute(
        &self,
        ctx: &mut RunContext,
        plan: Plan,
        store: Arc<dyn StateStore>,
        snapshot: StateSnapshot,
    ) -> Result<ExecutionReport> {
        let plan_id = plan.id();
        let actions = plan.into_actions();
        info!(
            "Executing plan {plan_id} with {} actions (concurrency {})",
            actions.len(),
            self.settings.concurrency
        );

        let mut providers: HashMap<ResourceKind, Arc<dyn Provider>> = HashMap::new();
        for action in &actions {
            if !providers.contains_key(&action.kind) {
                providers.insert(action.kind, self.registry.get(action.kind)?);
            }
        }
        for record in snapshot.resources.values() {
            if let Ok(provider) = self.registry.get(record.kind) {
                providers.entry(record.kind).or_insert(provider);
            }
        }

        let mut run = Run::new(actions, &snapshot);
        let writer = StateWriter::spawn(store, snapshot);
        let cancel = ctx.cancellation_token();
        let mut tasks: JoinSet<JobResult> = JoinSet::new();

        loop {
            if !cancel.is_cancelled() {
                self.dispatch(&mut run, &providers, &mut tasks, ctx);
            }

            if tasks.is_empty() {
                break;
            }

            let joined = if cancel.is_cancelled() {
                tasks.join_next().await
            } else {
                tokio::select! {
                    joined = tasks.join_next() => joined,
                    () = cancel.cancelled() => {
                        warn!("Run cancelled; waiting for {} in-flight actions", tasks.len());
                        continue;
                    }
                }
            };
            let Some(joined) = joined else {
                break;
            };
            let completed = match joined {
                Ok(result) => run.complete(ctx, &writer, result).await,
                Err(e) => Err(DeployError::internal(format!("Action task failed: {e}"))),
            };
            if let Err(e) = completed {
                drain(&run, &mut tasks).await;
                return Err(e);
            }
        }

        run.settle(cancel.is_cancelled());
        let outcome = writer.finish().await?;

        let outcomes = run.into_outcomes();
        let status = status_of(&outcomes);
        let report = ExecutionReport {
            run_id: ctx.run_id(),
            plan_id,
            status,
            outcomes,
            state_writes: outcome.writes,
            state_errors: outcome.errors,
            outputs: BTreeMap::new(),
            snapshot: outcome.snapshot,
        };
        info!(
            "Plan {plan_id} finished: {status} ({} applied, {} failed, {} blocked, {} skipped)",
            report.applied().len(),
            report.failed().len(),
            report.blocked().len(),
            report.skipped().len()
        );
        Ok(report)
    }

    /// Starts every ready action while there is capacity.
    fn dispatch(
        &self,
        run: &mut Run,
        providers: &HashMap<ResourceKind, Arc<dyn Provider>>,
        tasks: &mut JoinSet<JobResult>,
        ctx: &mut RunContext,
    ) {
        let mut progressed = true;
        while progressed {
            progressed = false;
            for index in 0..run.actions.len() {
                if tasks.len() >= self.settings.concurrency {
                    return;
                }
                if run.states[index] != ActionState::Pending {
                    continue;
                }

                if run.awaits_teardown(index) {
                    if !run.teardown_ready(index) {
                        continue;
                    }
                    match prepare_teardown(run, index, providers, self.settings.retry) {
                        Ok(job) => {
                            info!("{}: replace started, deleting old object", job.action.resource);
                            run.states[index] = ActionState::InFlight;
                            tasks.spawn(run_job(job));
                        }
                        Err(e) => {
                            error!("{}: {e}", run.actions[index].resource);
                            run.fail(index, e.to_string());
                            progressed = true;
                        }
                    }
                    continue;
                }
                if !run.is_ready(index) {
                    continue;
                }

                let action = &run.actions[index];
                if action.operation == Operation::Noop {
                    debug!("{}: unchanged", action.resource);
                    run.states[index] = ActionState::Applied;
                    ctx.set_lifecycle(&action.resource, Lifecycle::Applied);
                    progressed = true;
                    continue;
                }

                match self.prepare(run, index, providers) {
                    Ok(job) => {
                        info!("{}: {} started", job.action.resource, job.action.operation);
                        run.states[index] = ActionState::InFlight;
                        tasks.spawn(run_job(job));
                    }
                    Err(e) => {
                        error!("{}: {e}", run.actions[index].resource);
                        run.fail(index, e.to_string());
                        progressed = true;
                    }
                }
            }
        }
    }

    /// Resolves references and picks providers for an action.
    fn prepare(
        &self,
        run: &Run,
        index: usize,
        providers: &HashMap<ResourceKind, Arc<dyn Provider>>,
    ) -> std::result::Result<Job, ProviderError> {
        let action = &run.actions[index];
        let provider_for = |kind: ResourceKind| {
            providers
                .get(&kind)
                .cloned()
                .ok_or_else(|| ProviderError::operation(
                    action.operation.to_string(),
                    &action.resource,
                    format!("no provider registered for {kind}"),
                ))
        };

        let properties = run.resolve(action)?;
        let previous = match run.records.get(&action.resource) {
            Some(record) => Some((record.clone(), provider_for(record.kind)?)),
            None => None,
        };

        Ok(Job {
            index,
            action: action.clone(),
            properties,
            provider: provider_for(action.kind)?,
            previous,
            retry: self.settings.retry,
            teardown: false,
        })
    }
}

/// Builds the job that deletes the old object of a replacement.
///
/// References are not resolved; the create step does that later.
fn prepare_teardown(
    run: &Run,
    index: usize,
    providers: &HashMap<ResourceKind, Arc<dyn Provider>>,
    retry: Option<RetryPolicy>,
) -> std::result::Result<Job, ProviderError> {
    let action = &run.actions[index];
    let record = run
        .records
        .get(&action.resource)
        .ok_or_else(|| missing_record(action))?;
    let old_provider = providers.get(&record.kind).cloned().ok_or_else(|| {
        ProviderError::operation(
            action.operation.to_string(),
            &action.resource,
            format!("no provider registered for {}", record.kind),
        )
    })?;

    Ok(Job {
        index,
        action: action.clone(),
        properties: Properties::new(),
        provider: Arc::clone(&old_provider),
        previous: Some((record.clone(), old_provider)),
        retry,
        teardown: true,
    })
}

/// Waits for in-flight actions after the run has to stop early.
///
/// Their provider calls complete, but nothing more can be recorded.
async fn drain(run: &Run, tasks: &mut JoinSet<JobResult>) {
    if tasks.is_empty() {
        return;
    }
    warn!("Waiting for {} in-flight actions before stopping", tasks.len());
    while let Some(joined) = tasks.join_next().await {
        if let Ok(result) = joined {
            warn!(
                "{}: finished after the run stopped; its outcome is not recorded",
                run.actions[result.index].resource
            );
        }
    }
}

fn missing_record(action: &Action) -> ProviderError {
    ProviderError::operation(
        action.operation.to_string(),
        &action.resource,
        "no recorded object to act on",
    )
}

/// Per-run bookkeeping of the coordinator.
struct Run {
    actions: Vec<Action>,
    states: Vec<ActionState>,
    attempts: Vec<u32>,
    errors: Vec<Option<String>>,
    index: HashMap<String, usize>,
    dependents: Vec<Vec<usize>>,
    outputs: BTreeMap<String, Outputs>,
    records: BTreeMap<String, StateRecord>,
    torn_down: Vec<bool>,
}

impl Run {
    fn new(actions: Vec<Action>, snapshot: &StateSnapshot) -> Self {
        let index: HashMap<String, usize> = actions
            .iter()
            .enumerate()
            .map(|(i, a)| (a.resource.clone(), i))
            .collect();

        let mut dependents = vec![Vec::new(); actions.len()];
        for (i, action) in actions.iter().enumerate() {
            for dep in action.dependencies.iter().chain(&action.teardown_after) {
                if let Some(&d) = index.get(dep) {
                    dependents[d].push(i);
                }
            }
        }

        let n = actions.len();
        Self {
            actions,
            states: vec![ActionState::Pending; n],
            attempts: vec![0; n],
            errors: vec![None; n],
            index,
            dependents,
            outputs: snapshot
                .resources
                .iter()
                .map(|(name, record)| (name.clone(), record.outputs.clone()))
                .collect(),
            records: snapshot.resources.clone(),
            torn_down: vec![false; n],
        }
    }

    fn is_ready(&self, index: usize) -> bool {
        self.actions[index].dependencies.iter().all(|dep| {
            self.index
                .get(dep)
                .is_none_or(|&d| self.states[d] == ActionState::Applied)
        })
    }

    /// A replacement whose old object still exists.
    fn awaits_teardown(&self, index: usize) -> bool {
        self.actions[index].operation == Operation::Replace && !self.torn_down[index]
    }

    /// Whether the named resource's old object is gone (or never planned to go).
    fn is_torn_down(&self, name: &str) -> bool {
        self.index.get(name).is_none_or(|&i| match self.actions[i].operation {
            Operation::Replace => self.torn_down[i],
            _ => self.states[i] == ActionState::Applied,
        })
    }

    /// The old object of a replacement may be deleted once its recorded
    /// dependents are gone and its other dependencies are applied.
    ///
    /// A dependency that is itself waiting for this teardown is not waited on.
    fn teardown_ready(&self, index: usize) -> bool {
        let action = &self.actions[index];
        action.teardown_after.iter().all(|name| self.is_torn_down(name))
            && action.dependencies.iter().all(|dep| {
                self.index.get(dep).is_none_or(|&d| {
                    self.states[d] == ActionState::Applied
                        || self.actions[d].teardown_after.contains(&action.resource)
                })
            })
    }

    /// Substitutes references with the outputs of applied dependencies.
    fn resolve(&self, action: &Action) -> std::result::Result<Properties, ProviderError> {
        let lookup = |r: &OutputRef| {
            self.outputs
                .get(&r.resource)
                .and_then(|outputs| outputs.get(&r.output))
                .cloned()
        };

        action
            .desired
            .iter()
            .map(|(key, value)| {
                value
                    .resolve(&lookup)
                    .map(|v| (key.clone(), v))
                    .ok_or_else(|| {
                        let mut refs = Vec::new();
                        value.collect_references(&mut refs);
                        let missing = refs
                            .into_iter()
                            .find(|r| lookup(r).is_none())
                            .map_or_else(|| key.clone(), |r| r.to_string());
                        ProviderError::UnresolvedReference {
                            resource: action.resource.clone(),
                            reference: missing,
                        }
                    })
            })
            .collect()
    }

    /// Marks an action failed and blocks everything downstream of it.
    fn fail(&mut self, index: usize, message: String) {
        self.states[index] = ActionState::Failed;
        self.errors[index] = Some(message);

        let mut stack = self.dependents[index].clone();
        while let Some(next) = stack.pop() {
            if self.states[next] != ActionState::Pending {
                continue;
            }
            warn!(
                "{}: blocked by failure of {}",
                self.actions[next].resource, self.actions[index].resource
            );
            self.states[next] = ActionState::Blocked;
            self.errors[next] = Some(format!(
                "dependency '{}' did not apply",
                self.actions[index].resource
            ));
            stack.extend(self.dependents[next].iter().copied());
        }
    }

    /// Records the result of a finished action.
    async fn complete(
        &mut self,
        ctx: &mut RunContext,
        writer: &StateWriter,
        result: JobResult,
    ) -> Result<()> {
        let index = result.index;
        self.attempts[index] += result.attempts;
        let name = self.actions[index].resource.clone();

        match result.outcome {
            Ok(Completion::Upserted(record)) => {
                info!("{name}: {} applied", self.actions[index].operation);
                self.outputs.insert(name.clone(), record.outputs.clone());
                self.records.insert(name.clone(), record.clone());
                writer.submit(StateMutation::Upsert(record)).await?;
                self.states[index] = ActionState::Applied;
                ctx.set_lifecycle(&name, Lifecycle::Applied);
            }
            Ok(Completion::Removed) => {
                info!("{name}: deleted");
                self.forget(&name);
                writer.submit(StateMutation::Remove(name.clone())).await?;
                self.states[index] = ActionState::Applied;
                ctx.set_lifecycle(&name, Lifecycle::Destroyed);
            }
            Ok(Completion::TornDown) => {
                info!("{name}: old object deleted");
                self.forget(&name);
                self.torn_down[index] = true;
                self.states[index] = ActionState::Pending;
                writer.submit(StateMutation::Remove(name.clone())).await?;
            }
            Err(e) => {
                error!("{name}: {} failed: {e}", self.actions[index].operation);
                self.fail(index, e.to_string());
            }
        }
        Ok(())
    }

    fn forget(&mut self, name: &str) {
        self.outputs.remove(name);
        self.records.remove(name);
    }

    /// Closes out actions that never ran.
    fn settle(&mut self, cancelled: bool) {
        for (i, state) in self.states.iter_mut().enumerate() {
            if *state == ActionState::Pending {
                *state = if cancelled {
                    ActionState::Skipped
                } else {
                    ActionState::Blocked
                };
                if cancelled {
                    warn!("{}: skipped, run cancelled", self.actions[i].resource);
                }
            }
        }
    }

    fn into_outcomes(self) -> Vec<ActionOutcome> {
        self.actions
            .into_iter()
            .zip(self.states)
            .zip(self.attempts)
            .zip(self.errors)
            .map(|(((action, state), attempts), error)| ActionOutcome {
                resource: action.resource,
                kind: action.kind,
                operation: action.operation,
                state,
                attempts,
                error,
            })
            .collect()
    }
}

fn status_of(outcomes: &[ActionOutcome]) -> RunStatus {
    let unsuccessful = outcomes.iter().any(|o| o.state != ActionState::Applied);
    let changed = outcomes
        .iter()
        .any(|o| o.state == ActionState::Applied && o.operation != Operation::Noop);

    match (unsuccessful, changed) {
        (false, _) => RunStatus::Success,
        (true, true) => RunStatus::PartialFailure,
        (true, false) => RunStatus::Failure,
    }
}

/// Runs one provider operation with the configured retries.
///
/// Only idempotent providers are retried, and only for operation failures.
async fn with_retry<T, F, Fut>(
    provider: &dyn Provider,
    policy: Option<RetryPolicy>,
    attempts: &mut u32,
    mut call: F,
) -> std::result::Result<T, ProviderError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = std::result::Result<T, ProviderError>>,
{
    let max_attempts = match policy {
        Some(p) if provider.is_idempotent() => p.max_attempts.max(1),
        _ => 1,
    };

    let mut tries = 0;
    loop {
        tries += 1;
        *attempts += 1;
        match call().await {
            Err(e @ ProviderError::Operation { .. }) if tries < max_attempts => {
                let delay = policy.map_or(Duration::ZERO, |p| p.backoff(tries));
                warn!("Attempt {tries}/{max_attempts} failed: {e}; retrying in {delay:?}");
                tokio::time::sleep(delay).await;
            }
            other => return other,
        }
    }
}

/// Deletes a remote object; a missing object counts as deleted.
async fn delete_remote(
    provider: &dyn Provider,
    provider_id: &str,
    policy: Option<RetryPolicy>,
    attempts: &mut u32,
) -> std::result::Result<(), ProviderError> {
    match with_retry(provider, policy, attempts, || provider.delete(provider_id)).await {
        Err(ProviderError::NotFound { .. }) => {
            warn!("{provider_id} was already gone");
            Ok(())
        }
        other => other,
    }
}

/// Creates the remote object for an action and builds its record.
async fn create_record(
    provider: &dyn Provider,
    action: &Action,
    properties: &Properties,
    policy: Option<RetryPolicy>,
    attempts: &mut u32,
) -> std::result::Result<StateRecord, ProviderError> {
    let created = with_retry(provider, policy, attempts, || {
        provider.create(&action.resource, properties)
    })
    .await?;

    Ok(StateRecord::new(
        &action.resource,
        action.kind,
        &created.provider_id,
        properties.clone(),
        created.outputs,
        action.dependencies.clone(),
    ))
}

async fn run_job(job: Job) -> JobResult {
    let Job {
        index,
        action,
        properties,
        provider,
        previous,
        retry,
        teardown,
    } = job;
    let mut attempts = 0;

    let outcome = match (action.operation, previous.as_ref()) {
        (Operation::Replace | Operation::Delete, Some((record, old_provider)))
            if teardown || action.operation == Operation::Delete =>
        {
            let completion = if teardown {
                Completion::TornDown
            } else {
                Completion::Removed
            };
            delete_remote(old_provider.as_ref(), &record.provider_id, retry, &mut attempts)
                .await
                .map(|()| completion)
        }
        (Operation::Create | Operation::Replace, _) if !teardown => {
            create_record(provider.as_ref(), &action, &properties, retry, &mut attempts)
                .await
                .map(Completion::Upserted)
        }
        (Operation::Update, Some((record, _))) => {
            let provider_id = record.provider_id.as_str();
            with_retry(provider.as_ref(), retry, &mut attempts, || {
                provider.update(provider_id, &properties)
            })
            .await
            .map(|outputs| {
                Completion::Upserted(
                    StateRecord::new(
                        &action.resource,
                        action.kind,
                        provider_id,
                        properties.clone(),
                        outputs,
                        action.dependencies.clone(),
                    )
                    .created(record.created_at),
                )
            })
        }
        (Operation::Noop, _) => Err(ProviderError::operation(
            "noop",
            &action.resource,
            "noop actions are not dispatched",
        )),
        _ => Err(missing_record(&action)),
    };

    JobResult {
        index,
        outcome,
        attempts,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::GraphBuilder;
    use crate::model::{Resource, Value};
    use crate::planner::Planner;
    use crate::provider::{MockProvider, ProviderOp, ProviderResource, SimulatedCloud};
    use crate::state::LocalStateStore;
    use std::collections::BTreeSet;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tempfile::TempDir;

    fn network() -> Resource {
        Resource::new("network", ResourceKind::Network)
    }

    fn firewall() -> Resource {
        Resource::new("fw", ResourceKind::Firewall)
            .with_property("network", "${network.self_link}")
            .with_property("allows", Value::List(vec![]))
    }

    fn disk(zone: &str) -> Resource {
        Resource::new("disk", ResourceKind::Disk)
            .with_property("zone", zone)
            .with_property("size", 200_i64)
    }

    fn plan_for(registry: &ProviderRegistry, resources: Vec<Resource>, state: &StateSnapshot) -> Plan {
        let mut ctx = RunContext::new("p", "dev");
        let graph = GraphBuilder::new()
            .build(&mut ctx, resources)
            .expect("graph builds");
        Planner::new(registry)
            .plan(&mut ctx, &graph, state, "fp")
            .expect("plan")
    }

    fn local_store(temp: &TempDir) -> Arc<dyn StateStore> {
        Arc::new(LocalStateStore::with_base_dir(temp.path()))
    }

    async fn apply(
        registry: &ProviderRegistry,
        settings: ExecutorSettings,
        resources: Vec<Resource>,
        store: Arc<dyn StateStore>,
        state: StateSnapshot,
    ) -> ExecutionReport {
        let plan = plan_for(registry, resources, &state);
        let mut ctx = RunContext::new("p", "dev");
        PlanExecutor::new(registry.clone(), settings)
            .execute(&mut ctx, plan, store, state)
            .await
            .expect("executes")
    }

    #[tokio::test]
    async fn test_creates_and_resolves_references() {
        let temp = TempDir::new().expect("temp dir");
        let store = local_store(&temp);
        let cloud = SimulatedCloud::new();

        let report = apply(
            &cloud.registry(),
            ExecutorSettings::default(),
            vec![network(), firewall()],
            store.clone(),
            StateSnapshot::new("p", "dev"),
        )
        .await;

        assert!(report.is_success());
        assert_eq!(report.applied(), vec!["network", "fw"]);
        assert_eq!(report.state_writes, 2);

        let link = report.snapshot.get("network").expect("network recorded").outputs["self_link"].clone();
        let fw = cloud.object_named("fw").expect("fw created");
        assert_eq!(fw.properties["network"], Value::String(link));

        let saved = store.load().await.expect("load").expect("state saved");
        assert_eq!(saved.names(), vec!["fw", "network"]);
        assert_eq!(
            saved.get("fw").map(|r| r.dependencies.clone()),
            Some(BTreeSet::from(["network".to_string()]))
        );
    }

    #[tokio::test]
    async fn test_failure_blocks_dependents_and_records_nothing() {
        let temp = TempDir::new().expect("temp dir");
        let store = local_store(&temp);
        let cloud = SimulatedCloud::new();
        cloud.fail_always(ProviderOp::Create, "network");

        let report = apply(
            &cloud.registry(),
            ExecutorSettings::default(),
            vec![network(), firewall()],
            store.clone(),
            StateSnapshot::new("p", "dev"),
        )
        .await;

        assert_eq!(report.status, RunStatus::Failure);
        assert_eq!(report.failed(), vec!["network"]);
        assert_eq!(report.blocked(), vec!["fw"]);
        assert!(cloud.calls().iter().all(|c| c.name != "fw"));
        assert!(store.load().await.expect("load").is_none());
    }

    #[tokio::test]
    async fn test_independent_branch_continues() {
        let temp = TempDir::new().expect("temp dir");
        let store = local_store(&temp);
        let cloud = SimulatedCloud::new();
        cloud.fail_always(ProviderOp::Create, "network");

        let report = apply(
            &cloud.registry(),
            ExecutorSettings::default(),
            vec![network(), firewall(), disk("us-east1-b")],
            store.clone(),
            StateSnapshot::new("p", "dev"),
        )
        .await;

        assert_eq!(report.status, RunStatus::PartialFailure);
        assert_eq!(report.applied(), vec!["disk"]);
        assert_eq!(report.blocked(), vec!["fw"]);

        let saved = store.load().await.expect("load").expect("state saved");
        assert_eq!(saved.names(), vec!["disk"]);
    }

    #[tokio::test]
    async fn test_idempotent_provider_is_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);

        let mut mock = MockProvider::new();
        mock.expect_kind().return_const(ResourceKind::Address);
        mock.expect_is_idempotent().return_const(true);
        mock.expect_create().times(3).returning(move |name, _| {
            if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(ProviderError::operation("create", name, "transient"))
            } else {
                Ok(ProviderResource {
                    provider_id: format!("address/{name}"),
                    outputs: Outputs::new(),
                })
            }
        });
        let registry = ProviderRegistry::new().with(Arc::new(mock));

        let temp = TempDir::new().expect("temp dir");
        let settings = ExecutorSettings {
            concurrency: 1,
            retry: Some(RetryPolicy {
                max_attempts: 3,
                initial_backoff: Duration::from_millis(1),
                max_backoff: Duration::from_millis(5),
            }),
        };
        let report = apply(
            &registry,
            settings,
            vec![Resource::new("addr", ResourceKind::Address).with_property("region", "us-east1")],
            local_store(&temp),
            StateSnapshot::new("p", "dev"),
        )
        .await;

        assert!(report.is_success());
        assert_eq!(report.outcome("addr").map(|o| o.attempts), Some(3));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_no_retry_without_policy() {
        let mut mock = MockProvider::new();
        mock.expect_kind().return_const(ResourceKind::Address);
        mock.expect_is_idempotent().return_const(true);
        mock.expect_create()
            .times(1)
            .returning(|name, _| Err(ProviderError::operation("create", name, "quota exceeded")));
        let registry = ProviderRegistry::new().with(Arc::new(mock));

        let temp = TempDir::new().expect("temp dir");
        let report = apply(
            &registry,
            ExecutorSettings::default(),
            vec![Resource::new("addr", ResourceKind::Address).with_property("region", "us-east1")],
            local_store(&temp),
            StateSnapshot::new("p", "dev"),
        )
        .await;

        let outcome = report.outcome("addr").expect("outcome");
        assert_eq!(outcome.state, ActionState::Failed);
        assert_eq!(outcome.attempts, 1);
        assert!(outcome.error.as_deref().is_some_and(|e| e.contains("quota exceeded")));
    }

    #[tokio::test]
    async fn test_concurrency_is_bounded() {
        let temp = TempDir::new().expect("temp dir");
        let cloud = SimulatedCloud::new().with_latency(Duration::from_millis(20));
        let addresses = (0..6)
            .map(|i| Resource::new(format!("addr{i}"), ResourceKind::Address).with_property("region", "us-east1"))
            .collect();

        let report = apply(
            &cloud.registry(),
            ExecutorSettings {
                concurrency: 2,
                retry: None,
            },
            addresses,
            local_store(&temp),
            StateSnapshot::new("p", "dev"),
        )
        .await;

        assert!(report.is_success());
        assert_eq!(report.applied().len(), 6);
        assert!(cloud.max_in_flight() <= 2);
        assert!(cloud.max_in_flight() >= 1);
    }

    #[tokio::test]
    async fn test_cancel_before_start_skips_everything() {
        let temp = TempDir::new().expect("temp dir");
        let cloud = SimulatedCloud::new();
        let registry = cloud.registry();
        let state = StateSnapshot::new("p", "dev");
        let plan = plan_for(&registry, vec![network(), firewall()], &state);

        let mut ctx = RunContext::new("p", "dev");
        ctx.cancel();
        let report = PlanExecutor::new(registry, ExecutorSettings::default())
            .execute(&mut ctx, plan, local_store(&temp), state)
            .await
            .expect("executes");

        assert_eq!(report.skipped(), vec!["network", "fw"]);
        assert_eq!(report.status, RunStatus::Failure);
        assert!(cloud.calls().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_lets_in_flight_action_finish() {
        let temp = TempDir::new().expect("temp dir");
        let store = local_store(&temp);
        let cloud = SimulatedCloud::new().with_latency(Duration::from_millis(100));
        let registry = cloud.registry();
        let state = StateSnapshot::new("p", "dev");
        let plan = plan_for(&registry, vec![network(), firewall()], &state);

        let mut ctx = RunContext::new("p", "dev");
        let token = ctx.cancellation_token();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            token.cancel();
        });

        let report = PlanExecutor::new(registry, ExecutorSettings::default())
            .execute(&mut ctx, plan, store.clone(), state)
            .await
            .expect("executes");

        assert_eq!(report.applied(), vec!["network"]);
        assert_eq!(report.skipped(), vec!["fw"]);
        assert_eq!(report.status, RunStatus::PartialFailure);

        let saved = store.load().await.expect("load").expect("state saved");
        assert_eq!(saved.names(), vec!["network"]);
    }

    #[tokio::test]
    async fn test_replace_and_delete() {
        let temp = TempDir::new().expect("temp dir");
        let store = local_store(&temp);
        let cloud = SimulatedCloud::new();
        let registry = cloud.registry();

        let first = apply(
            &registry,
            ExecutorSettings::default(),
            vec![network(), firewall(), disk("us-east1-b")],
            store.clone(),
            StateSnapshot::new("p", "dev"),
        )
        .await;
        assert!(first.is_success());
        let old_disk = first.snapshot.get("disk").expect("disk").provider_id.clone();

        let second = apply(
            &registry,
            ExecutorSettings::default(),
            vec![network(), disk("us-west1-a")],
            store.clone(),
            first.snapshot,
        )
        .await;

        assert!(second.is_success());
        assert_eq!(second.outcome("disk").map(|o| o.operation), Some(Operation::Replace));
        assert_eq!(second.outcome("fw").map(|o| o.operation), Some(Operation::Delete));
        assert_eq!(second.unchanged(), vec!["network"]);

        assert!(cloud.object_named("fw").is_none());
        assert!(!cloud.objects().contains_key(&old_disk));
        let new_disk = second.snapshot.get("disk").expect("disk");
        assert_ne!(new_disk.provider_id, old_disk);
        assert_eq!(new_disk.properties["zone"], Value::from("us-west1-a"));
        assert_eq!(second.snapshot.names(), vec!["disk", "network"]);
    }

    fn position(cloud: &SimulatedCloud, op: ProviderOp, name: &str, after: usize) -> usize {
        cloud
            .calls()
            .iter()
            .enumerate()
            .skip(after)
            .find(|(_, c)| c.op == op && c.name == name)
            .map(|(i, _)| i)
            .expect("call made")
    }

    #[tokio::test]
    async fn test_replace_deletes_after_removed_dependent() {
        let temp = TempDir::new().expect("temp dir");
        let store = local_store(&temp);
        let cloud = SimulatedCloud::new();
        let registry = cloud.registry();

        let first = apply(
            &registry,
            ExecutorSettings::default(),
            vec![network(), firewall()],
            store.clone(),
            StateSnapshot::new("p", "dev"),
        )
        .await;
        assert!(first.is_success());
        let before = cloud.calls().len();

        let second = apply(
            &registry,
            ExecutorSettings::default(),
            vec![network().with_property("mtu", 1500_i64)],
            store.clone(),
            first.snapshot,
        )
        .await;

        assert!(second.is_success());
        assert_eq!(second.outcome("network").map(|o| o.operation), Some(Operation::Replace));
        assert_eq!(second.outcome("network").map(|o| o.attempts), Some(2));

        let fw_deleted = position(&cloud, ProviderOp::Delete, "fw", before);
        let network_deleted = position(&cloud, ProviderOp::Delete, "network", before);
        let network_created = position(&cloud, ProviderOp::Create, "network", before);
        assert!(fw_deleted < network_deleted);
        assert!(network_deleted < network_created);

        assert_eq!(second.state_writes, 3);
        assert_eq!(second.snapshot.names(), vec!["network"]);
        let saved = store.load().await.expect("load").expect("state saved");
        assert_eq!(saved.names(), vec!["network"]);
    }

    #[tokio::test]
    async fn test_replaced_dependent_is_torn_down_first_and_recreated_last() {
        let temp = TempDir::new().expect("temp dir");
        let store = local_store(&temp);
        let cloud = SimulatedCloud::new();
        let registry = cloud.registry();

        let first = apply(
            &registry,
            ExecutorSettings::default(),
            vec![network(), firewall()],
            store.clone(),
            StateSnapshot::new("p", "dev"),
        )
        .await;
        let before = cloud.calls().len();

        let second = apply(
            &registry,
            ExecutorSettings::default(),
            vec![network().with_property("mtu", 1500_i64), firewall()],
            store.clone(),
            first.snapshot,
        )
        .await;

        assert!(second.is_success());
        assert_eq!(second.outcome("fw").map(|o| o.operation), Some(Operation::Replace));

        let order = [
            position(&cloud, ProviderOp::Delete, "fw", before),
            position(&cloud, ProviderOp::Delete, "network", before),
            position(&cloud, ProviderOp::Create, "network", before),
            position(&cloud, ProviderOp::Create, "fw", before),
        ];
        assert!(order.windows(2).all(|w| w[0] < w[1]), "call order {order:?}");

        let link = second.snapshot.get("network").expect("network").outputs["self_link"].clone();
        let fw = cloud.object_named("fw").expect("fw recreated");
        assert_eq!(fw.properties["network"], Value::String(link));
    }

    #[tokio::test]
    async fn test_failed_dependent_delete_keeps_replaced_object() {
        let temp = TempDir::new().expect("temp dir");
        let store = local_store(&temp);
        let cloud = SimulatedCloud::new();
        let registry = cloud.registry();

        let first = apply(
            &registry,
            ExecutorSettings::default(),
            vec![network(), firewall()],
            store.clone(),
            StateSnapshot::new("p", "dev"),
        )
        .await;
        let old_network = first.snapshot.get("network").expect("network").provider_id.clone();
        cloud.fail_always(ProviderOp::Delete, "fw");

        let second = apply(
            &registry,
            ExecutorSettings::default(),
            vec![network().with_property("mtu", 1500_i64)],
            store.clone(),
            first.snapshot,
        )
        .await;

        assert_eq!(second.failed(), vec!["fw"]);
        assert_eq!(second.blocked(), vec!["network"]);
        assert!(cloud.objects().contains_key(&old_network));
        assert_eq!(second.snapshot.names(), vec!["fw", "network"]);
    }

    /// Provider whose create takes as long as the object's name says.
    #[derive(Debug, Default)]
    struct StaggeredProvider {
        finished: std::sync::Mutex<Vec<String>>,
    }

    #[async_trait::async_trait]
    impl Provider for StaggeredProvider {
        fn kind(&self) -> ResourceKind {
            ResourceKind::Address
        }

        async fn create(
            &self,
            name: &str,
            _properties: &Properties,
        ) -> std::result::Result<ProviderResource, ProviderError> {
            let millis = match name {
                "fast" => 0,
                "slow" => 50,
                _ => 150,
            };
            tokio::time::sleep(Duration::from_millis(millis)).await;
            self.finished.lock().unwrap().push(name.to_string());
            Ok(ProviderResource {
                provider_id: format!("address/{name}"),
                outputs: Outputs::new(),
            })
        }

        async fn update(
            &self,
            _provider_id: &str,
            _properties: &Properties,
        ) -> std::result::Result<Outputs, ProviderError> {
            Ok(Outputs::new())
        }

        async fn delete(&self, _provider_id: &str) -> std::result::Result<(), ProviderError> {
            Ok(())
        }
    }

    /// State store whose saves bring the writer task down.
    #[derive(Debug)]
    struct CrashingStore;

    #[async_trait::async_trait]
    impl StateStore for CrashingStore {
        async fn load(&self) -> Result<Option<StateSnapshot>> {
            Ok(None)
        }

        async fn save(&self, _state: &StateSnapshot) -> Result<()> {
            panic!("state volume vanished");
        }

        async fn acquire_lock(
            &self,
            holder: &str,
            run_id: Option<Uuid>,
        ) -> Result<crate::state::LockInfo> {
            Ok(crate::state::LockInfo::new(holder).for_run(run_id))
        }

        async fn release_lock(&self, _lock_id: &str) -> Result<()> {
            Ok(())
        }

        async fn get_lock_info(&self) -> Result<Option<crate::state::LockInfo>> {
            Ok(None)
        }

        fn backend_type(&self) -> &'static str {
            "crashing"
        }

        fn location(&self) -> String {
            String::from("nowhere")
        }
    }

    #[tokio::test]
    async fn test_writer_failure_waits_for_in_flight_actions() {
        let provider = Arc::new(StaggeredProvider::default());
        let registry = ProviderRegistry::new().with(provider.clone());
        let addresses: Vec<_> = ["fast", "slow", "slowest"]
            .into_iter()
            .map(|name| Resource::new(name, ResourceKind::Address).with_property("region", "us-east1"))
            .collect();
        let state = StateSnapshot::new("p", "dev");
        let plan = plan_for(&registry, addresses, &state);

        let mut ctx = RunContext::new("p", "dev");
        let result = PlanExecutor::new(registry, ExecutorSettings::default())
            .execute(&mut ctx, plan, Arc::new(CrashingStore), state)
            .await;

        assert!(result.is_err());
        let finished = provider.finished.lock().unwrap().clone();
        assert_eq!(finished, vec!["fast", "slow", "slowest"]);
    }

    #[test]
    fn test_backoff_is_capped() {
        let policy = RetryPolicy {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(350),
        };

        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(200));
        assert_eq!(policy.backoff(3), Duration::from_millis(350));
        assert_eq!(policy.backoff(10), Duration::from_millis(350));
    }
}
