//! Configuration module for the deployment engine.
//!
//! This module handles all configuration-related functionality:
//! - Parsing and deserializing `gcpgpu.deploy.yaml`
//! - Validation of configuration values
//! - Computing hashes for change detection and plan fingerprints

mod hash;
mod parser;
mod spec;
mod validator;

pub use hash::ConfigHasher;
pub use parser::{ConfigParser, DEFAULT_CONFIG_FILES, find_config_file};
pub use spec::{
    DEFAULT_CONCURRENCY, DeployConfig, ExecutionConfig, ProjectConfig, ResourceDecl, RetryConfig,
    StateBackend, StateConfig,
};
pub use validator::{ConfigValidator, ValidationError, ValidationResult};
