//! Configuration validation for deployment files.
//!
//! This module checks the parts of a configuration that the graph builder does
//! not: project naming, backend settings, execution limits and resource names.
//! Property bags are checked later against each kind's schema.

use crate::error::{ConfigError, DeployError, Result};
use std::collections::HashSet;
use tracing::debug;

use super::spec::{DeployConfig, ExecutionConfig, ProjectConfig, ResourceDecl, StateBackend, StateConfig};

/// Validator for deployment configurations.
#[derive(Debug, Default)]
pub struct ConfigValidator;

/// Validation result containing all errors found.
#[derive(Debug, Default)]
pub struct ValidationResult {
    /// List of validation errors.
    pub errors: Vec<ValidationError>,
    /// List of warnings (non-fatal issues).
    pub warnings: Vec<String>,
}

/// A single validation error.
#[derive(Debug)]
pub struct ValidationError {
    /// The field path that failed validation.
    pub field: String,
    /// The error message.
    pub message: String,
}

impl ConfigValidator {
    /// Creates a new validator.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Validates a deployment configuration.
    ///
    /// # Errors
    ///
    /// Returns the first validation error if any were found.
    pub fn validate(&self, config: &DeployConfig) -> Result<ValidationResult> {
        let mut result = ValidationResult::default();

        Self::validate_project(&config.project, &mut result);
        Self::validate_state(&config.state, &mut result);
        Self::validate_execution(&config.execution, &mut result);
        Self::validate_resources(&config.resources, &mut result);

        match result.errors.first() {
            None => {
                debug!("Configuration validation passed");
                Ok(result)
            }
            Some(first_error) => Err(DeployError::Config(ConfigError::validation(
                first_error.message.clone(),
                first_error.field.clone(),
            ))),
        }
    }

    /// Validates project configuration.
    fn validate_project(project: &ProjectConfig, result: &mut ValidationResult) {
        if project.name.is_empty() {
            result.push_error("project.name", "Project name cannot be empty");
        } else if !is_valid_name(&project.name) {
            result.push_error(
                "project.name",
                format!(
                    "Project name '{}' is invalid. Must be lowercase alphanumeric with hyphens.",
                    project.name
                ),
            );
        }

        if project.environment.is_empty() {
            result.push_error("project.environment", "Environment cannot be empty");
        }
    }

    /// Validates state configuration.
    fn validate_state(state: &StateConfig, result: &mut ValidationResult) {
        match state.backend {
            StateBackend::S3 => {
                if state.bucket.as_deref().is_none_or(str::is_empty) {
                    result.push_error(
                        "state.bucket",
                        "S3 bucket name is required when using S3 backend",
                    );
                }
            }
            StateBackend::Local => {
                if state.bucket.is_some() {
                    result
                        .warnings
                        .push(String::from("state.bucket is ignored by the local backend"));
                }
            }
        }
    }

    /// Validates executor settings.
    fn validate_execution(execution: &ExecutionConfig, result: &mut ValidationResult) {
        if execution.concurrency == 0 {
            result.push_error("execution.concurrency", "Concurrency must be at least 1");
        }

        if let Some(retry) = &execution.retry {
            if retry.max_attempts == 0 {
                result.push_error(
                    "execution.retry.max_attempts",
                    "Retry attempts must be at least 1",
                );
            }
            if retry.initial_backoff_ms > retry.max_backoff_ms {
                result.push_error(
                    "execution.retry.initial_backoff_ms",
                    format!(
                        "Initial backoff ({}ms) exceeds max backoff ({}ms)",
                        retry.initial_backoff_ms, retry.max_backoff_ms
                    ),
                );
            }
        }
    }

    /// Validates resource names.
    fn validate_resources(resources: &[ResourceDecl], result: &mut ValidationResult) {
        if resources.is_empty() {
            result
                .warnings
                .push(String::from("No resources defined in configuration"));
            return;
        }

        let mut seen_names = HashSet::new();

        for (i, resource) in resources.iter().enumerate() {
            let field = format!("resources[{i}].name");

            if !seen_names.insert(resource.name.as_str()) {
                result.push_error(&field, format!("Duplicate resource name: {}", resource.name));
            }

            if !is_valid_name(&resource.name) {
                result.push_error(
                    &field,
                    format!(
                        "Resource name '{}' is invalid. Must be lowercase alphanumeric with hyphens.",
                        resource.name
                    ),
                );
            }
        }
    }
}

/// Checks if a name is valid (lowercase alphanumeric with hyphens, starting
/// with a letter).
fn is_valid_name(name: &str) -> bool {
    let mut chars = name.chars();

    // First character must be a letter
    if !chars.next().is_some_and(|c| c.is_ascii_lowercase()) {
        return false;
    }

    if !chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-') {
        return false;
    }

    !name.ends_with('-') && !name.contains("--")
}

impl ValidationResult {
    fn push_error(&mut self, field: &str, message: impl Into<String>) {
        self.errors.push(ValidationError {
            field: field.to_string(),
            message: message.into(),
        });
    }

    /// Returns true if validation passed (no errors).
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigParser;

    fn parse(yaml: &str) -> DeployConfig {
        ConfigParser::new()
            .parse_yaml(yaml, None)
            .expect("test config parses")
    }

    #[test]
    fn test_valid_name() {
        assert!(is_valid_name("vm"));
        assert!(is_valid_name("gpu-vm-1"));
        assert!(is_valid_name("a"));
    }

    #[test]
    fn test_invalid_name() {
        assert!(!is_valid_name(""));
        assert!(!is_valid_name("Gpu-Vm")); // uppercase
        assert!(!is_valid_name("1-vm")); // starts with number
        assert!(!is_valid_name("gpu_vm")); // underscore
        assert!(!is_valid_name("vm-")); // ends with hyphen
        assert!(!is_valid_name("gpu--vm")); // consecutive hyphens
    }

    #[test]
    fn test_valid_config() {
        let config = parse(
            r"
project:
  name: gpu-batch
resources:
  - name: network
    kind: network
",
        );
        let result = ConfigValidator::new().validate(&config).expect("valid");
        assert!(result.is_valid());
        assert!(result.warnings.is_empty());
    }

    #[test]
    fn test_empty_resources_warns() {
        let config = parse("project:\n  name: gpu-batch\n");
        let result = ConfigValidator::new().validate(&config).expect("valid");
        assert_eq!(result.warnings.len(), 1);
    }

    #[test]
    fn test_s3_requires_bucket() {
        let config = parse(
            r"
project:
  name: gpu-batch
state:
  backend: s3
",
        );
        let err = ConfigValidator::new()
            .validate(&config)
            .expect_err("bucket missing");
        assert!(matches!(
            err,
            DeployError::Config(ConfigError::ValidationError { field: Some(ref f), .. }) if f == "state.bucket"
        ));
    }

    #[test]
    fn test_zero_concurrency() {
        let config = parse(
            r"
project:
  name: gpu-batch
execution:
  concurrency: 0
",
        );
        assert!(ConfigValidator::new().validate(&config).is_err());
    }

    #[test]
    fn test_backoff_ordering() {
        let config = parse(
            r"
project:
  name: gpu-batch
execution:
  retry:
    initial_backoff_ms: 5000
    max_backoff_ms: 100
",
        );
        assert!(ConfigValidator::new().validate(&config).is_err());
    }

    #[test]
    fn test_duplicate_resource_names() {
        let config = parse(
            r"
project:
  name: gpu-batch
resources:
  - name: vm
    kind: instance
  - name: vm
    kind: disk
",
        );
        let err = ConfigValidator::new()
            .validate(&config)
            .expect_err("duplicate");
        assert!(err.to_string().contains("Duplicate resource name"));
    }
}
