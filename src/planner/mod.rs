//! Planning and execution of changes.
//!
//! This module compares declared resources with recorded state, orders the
//! resulting actions into a [`Plan`], and executes plans against providers.

mod diff;
mod executor;
mod plan;

pub use diff::{DiffDetail, DiffEngine, ResourceDiff};
pub use executor::{
    ActionOutcome, ActionState, ExecutionReport, ExecutorSettings, PlanExecutor, RetryPolicy,
};
pub use plan::{Action, Operation, Plan, PlanSummary, Planner};
