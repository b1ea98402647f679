// ============================================================================
// Strict linting - Dangerous or non-idiomatic practices are forbidden
// ============================================================================

#![deny(missing_docs)]                // All public items must be documented
#![deny(dead_code)]                   // Unused code is forbidden
#![deny(non_camel_case_types)]        // Types must follow CamelCase convention

// Additional strictness - Leave nothing unchecked
#![deny(unused_imports)]              // Unused imports are forbidden
#![deny(unused_variables)]            // Unused variables are forbidden
#![deny(unused_must_use)]             // Must handle Result and Option explicitly
#![deny(non_snake_case)]              // Variables and functions must be snake_case
#![deny(non_upper_case_globals)]      // Constants must be UPPER_CASE
#![deny(nonstandard_style)]           // Non-standard code style is forbidden

// Clippy lints (warnings only)
#![warn(clippy::all)]                 // All standard Clippy lints
#![warn(clippy::pedantic)]            // Very strict Clippy lints
#![warn(clippy::nursery)]             // Experimental lints
#![warn(clippy::unwrap_used)]         // unwrap() warning
#![warn(clippy::expect_used)]         // expect() warning
#![warn(clippy::panic)]               // panic!() warning
#![warn(clippy::print_stdout)]        // println!() warning
#![warn(clippy::todo)]                // TODO warning
#![warn(clippy::unimplemented)]       // unimplemented!() warning
#![warn(clippy::missing_const_for_fn)] // Force const when possible
#![warn(clippy::unwrap_in_result)]    // unwrap() in Result warning
#![warn(clippy::module_inception)]    // Module with same name as crate warning
#![warn(clippy::redundant_clone)]     // Useless clones warning
#![warn(clippy::shadow_unrelated)]    // Shadowing unrelated variables warning
#![warn(clippy::too_many_arguments)]  // Limit function arguments
#![warn(clippy::cognitive_complexity)] // Limit cognitive complexity

// Safety and robustness lints
#![deny(overflowing_literals)]        // Overflowing literals are forbidden
#![deny(arithmetic_overflow)]         // Arithmetic overflow is forbidden

// Tests may unwrap freely
#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used, clippy::panic))]

// ============================================================================
// Crate Documentation
// ============================================================================

//! # gcp-gpu-deploy
//!
//! A declarative, idempotent reconciliation engine for a GPU virtual machine
//! stack: a static address, a network, a firewall rule, a boot disk and an
//! instance with an attached accelerator.
//!
//! ## Overview
//!
//! Resources are declared in `gcpgpu.deploy.yaml`. Properties may reference
//! outputs of other resources with `${name.output}`; every reference is a
//! dependency edge. A run:
//!
//! 1. builds and checks the dependency graph (no provider calls),
//! 2. diffs each resource against its state record and produces a plan of
//!    create, update, replace and delete actions,
//! 3. executes the plan concurrently in dependency order, recording every
//!    confirmed provider call in the state store.
//!
//! A failed action blocks only its dependents; the run ends with a report
//! listing applied, failed, blocked and skipped resources, and re-running
//! re-attempts only what remains.
//!
//! ## Modules
//!
//! - [`model`]: Resources, property values and the per-kind schema
//! - [`graph`]: Dependency graph construction and ordering
//! - [`config`]: Configuration parsing and validation
//! - [`planner`]: Diff computation, planning and plan execution
//! - [`provider`]: The provider capability and a simulated cloud
//! - [`state`]: State storage backends (local, S3)
//! - [`reconciler`]: Plan/apply/destroy entry points
//! - [`cli`]: Command-line interface
//!
//! ## Example
//!
//! ```yaml
//! project:
//!   name: gpu-batch
//!
//! resources:
//!   - name: network
//!     kind: network
//!   - name: firewall
//!     kind: firewall
//!     properties:
//!       network: "${network.id}"
//!       allows:
//!         - protocol: tcp
//!           ports: ["22"]
//! ```

// ============================================================================
// Modules
// ============================================================================

pub mod cli;
pub mod config;
pub mod context;
pub mod error;
pub mod graph;
pub mod model;
pub mod planner;
pub mod provider;
pub mod reconciler;
pub mod state;

// ============================================================================
// Re-exports
// ============================================================================

pub use cli::{Cli, Commands, OutputFormatter};
pub use config::{ConfigHasher, ConfigParser, ConfigValidator, DeployConfig};
pub use context::RunContext;
pub use error::{DeployError, Result};
pub use graph::{GraphBuilder, ResourceGraph};
pub use model::{Resource, ResourceKind, Value};
pub use planner::{ExecutionReport, Plan, PlanExecutor, Planner};
pub use provider::{Provider, ProviderRegistry, SimulatedCloud};
pub use reconciler::Reconciler;
pub use state::{LocalStateStore, S3StateStore, StateSnapshot, StateStore};
