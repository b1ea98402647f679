//! Resource dependency graph.
//!
//! This module turns declared resources into a validated directed acyclic
//! graph whose edges follow output references.

mod builder;

pub use builder::{GraphBuilder, ResourceGraph};
