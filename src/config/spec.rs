//! Configuration specification types for the deployment engine.
//!
//! This module defines the structs that map to the `gcpgpu.deploy.yaml` file.
//! The file declares the desired resources; everything else (state backend,
//! execution settings) has defaults.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

use crate::model::{Properties, Resource, ResourceKind, Value};
use crate::planner::RetryPolicy;

/// Default number of concurrent provider calls.
pub const DEFAULT_CONCURRENCY: usize = 4;

/// The root configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeployConfig {
    /// Project-level configuration.
    pub project: ProjectConfig,
    /// State backend configuration.
    #[serde(default)]
    pub state: StateConfig,
    /// Executor settings.
    #[serde(default)]
    pub execution: ExecutionConfig,
    /// Declared resources, in declaration order.
    #[serde(default)]
    pub resources: Vec<ResourceDecl>,
    /// Stack outputs, usually references such as `${addr.address}`,
    /// evaluated after every run.
    #[serde(default)]
    pub outputs: BTreeMap<String, Value>,
}

/// Project-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProjectConfig {
    /// Unique name for the project.
    pub name: String,
    /// Environment (e.g., "dev", "staging", "prod").
    #[serde(default = "default_environment")]
    pub environment: String,
}

/// State backend configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct StateConfig {
    /// Backend type (local or s3).
    #[serde(default)]
    pub backend: StateBackend,
    /// S3 bucket name (required for s3 backend).
    #[serde(default)]
    pub bucket: Option<String>,
    /// S3 key prefix (optional).
    #[serde(default)]
    pub prefix: Option<String>,
    /// S3 region (optional, uses AWS default if not specified).
    #[serde(default)]
    pub region: Option<String>,
    /// Local state directory (for local backend).
    #[serde(default)]
    pub path: Option<String>,
}

/// State backend types.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StateBackend {
    /// Local file-based state storage.
    #[default]
    Local,
    /// AWS S3-based state storage.
    S3,
}

/// Executor settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExecutionConfig {
    /// Maximum number of provider calls in flight.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Retry settings, applied to idempotent providers only.
    #[serde(default)]
    pub retry: Option<RetryConfig>,
}

/// Retry settings for failed provider calls.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RetryConfig {
    /// Total attempts, including the first one.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Delay before the first retry.
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    /// Upper bound on the delay between attempts.
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

/// One declared resource.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResourceDecl {
    /// Logical name, unique within the file.
    pub name: String,
    /// Resource kind.
    pub kind: ResourceKind,
    /// Desired properties; strings of the form `${name.output}` are references.
    #[serde(default)]
    pub properties: Properties,
}

fn default_environment() -> String {
    String::from("dev")
}

const fn default_concurrency() -> usize {
    DEFAULT_CONCURRENCY
}

const fn default_max_attempts() -> u32 {
    3
}

const fn default_initial_backoff_ms() -> u64 {
    500
}

const fn default_max_backoff_ms() -> u64 {
    10_000
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            retry: None,
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

impl RetryConfig {
    /// Converts to the executor's retry policy.
    #[must_use]
    pub const fn to_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            initial_backoff: Duration::from_millis(self.initial_backoff_ms),
            max_backoff: Duration::from_millis(self.max_backoff_ms),
        }
    }
}

impl ResourceDecl {
    /// Converts the declaration into a model resource.
    #[must_use]
    pub fn to_resource(&self) -> Resource {
        let mut resource = Resource::new(&self.name, self.kind);
        resource.properties = self.properties.clone();
        resource
    }
}

impl DeployConfig {
    /// Returns the declared resources as model resources, in declaration order.
    #[must_use]
    pub fn resources(&self) -> Vec<Resource> {
        self.resources.iter().map(ResourceDecl::to_resource).collect()
    }

    /// Finds a declaration by name.
    #[must_use]
    pub fn get_resource(&self, name: &str) -> Option<&ResourceDecl> {
        self.resources.iter().find(|r| r.name == name)
    }

    /// Returns the retry policy, if one is configured.
    #[must_use]
    pub fn retry_policy(&self) -> Option<RetryPolicy> {
        self.execution.retry.as_ref().map(RetryConfig::to_policy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Value;

    #[test]
    fn test_defaults() {
        let config: DeployConfig = serde_yaml::from_str("project:\n  name: gpu-batch\n")
            .expect("minimal config parses");

        assert_eq!(config.project.environment, "dev");
        assert_eq!(config.state.backend, StateBackend::Local);
        assert_eq!(config.execution.concurrency, DEFAULT_CONCURRENCY);
        assert!(config.retry_policy().is_none());
        assert!(config.resources.is_empty());
        assert!(config.outputs.is_empty());
    }

    #[test]
    fn test_stack_outputs() {
        let yaml = r#"
project:
  name: gpu-batch
resources:
  - name: addr
    kind: address
    properties:
      region: us-east1
outputs:
  instance_ip: "${addr.address}"
  region: us-east1
"#;
        let config: DeployConfig = serde_yaml::from_str(yaml).expect("config parses");

        assert_eq!(config.outputs["instance_ip"], Value::from("${addr.address}"));
        assert!(matches!(config.outputs["instance_ip"], Value::Reference(_)));
        assert_eq!(config.outputs["region"], Value::from("us-east1"));
    }

    #[test]
    fn test_resource_conversion() {
        let yaml = r#"
project:
  name: gpu-batch
resources:
  - name: network
    kind: network
  - name: firewall
    kind: firewall
    properties:
      network: "${network.id}"
      priority: 1000
"#;
        let config: DeployConfig = serde_yaml::from_str(yaml).expect("config parses");
        let resources = config.resources();

        assert_eq!(resources.len(), 2);
        assert_eq!(resources[1].kind, ResourceKind::Firewall);
        assert_eq!(
            resources[1].properties.get("priority"),
            Some(&Value::Integer(1000))
        );
        assert_eq!(
            resources[1].dependency_names().into_iter().collect::<Vec<_>>(),
            vec!["network".to_string()]
        );
        assert!(config.get_resource("network").is_some());
    }

    #[test]
    fn test_retry_policy() {
        let yaml = r"
project:
  name: gpu-batch
execution:
  concurrency: 2
  retry:
    max_attempts: 5
";
        let config: DeployConfig = serde_yaml::from_str(yaml).expect("config parses");
        let policy = config.retry_policy().expect("retry configured");

        assert_eq!(config.execution.concurrency, 2);
        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.initial_backoff, Duration::from_millis(500));
        assert_eq!(policy.max_backoff, Duration::from_secs(10));
    }
}
