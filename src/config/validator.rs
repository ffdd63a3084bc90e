//! Configuration validation for stack definitions.
//!
//! This module checks field-level rules and duplicate names before a graph is
//! built. Problems that span stacks (cycles, unresolved references) are left
//! to the graph builder and resolver, which report them with resource
//! addresses.

use crate::error::{ConfigError, Result};
use std::collections::HashSet;
use tracing::debug;

use super::spec::{ApplyConfig, InfraConfig, ProjectConfig, StackConfig, StateBackendKind, StateConfig};
use crate::graph::{AttributeValue, Reference};
use crate::state::MAX_LOCK_TTL_SECS;

/// Validator for stack configurations.
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

impl ValidationResult {
    fn error(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.errors.push(ValidationError {
            field: field.into(),
            message: message.into(),
        });
    }
}

impl ConfigValidator {
    /// Creates a new validator.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Validates a configuration.
    ///
    /// # Errors
    ///
    /// Returns the first error found as a validation error.
    pub fn validate(&self, config: &InfraConfig) -> Result<ValidationResult> {
        let result = self.check(config);

        if let Some(first_error) = result.errors.first() {
            return Err(ConfigError::validation(first_error.message.clone(), first_error.field.clone()).into());
        }

        debug!("Configuration validation passed");
        Ok(result)
    }

    /// Collects every error and warning without failing.
    #[must_use]
    pub fn check(&self, config: &InfraConfig) -> ValidationResult {
        let mut result = ValidationResult::default();

        Self::validate_project(&config.project, &mut result);
        Self::validate_state(&config.state, &mut result);
        Self::validate_apply(&config.apply, &mut result);
        Self::validate_stacks(&config.stacks, &mut result);

        result
    }

    fn validate_project(project: &ProjectConfig, result: &mut ValidationResult) {
        if project.name.is_empty() {
            result.error("project.name", "Project name cannot be empty");
        } else if !is_valid_name(&project.name) {
            result.error(
                "project.name",
                format!(
                    "Project name '{}' is invalid. Must be lowercase alphanumeric with hyphens.",
                    project.name
                ),
            );
        }

        if project.environment.is_empty() {
            result.error("project.environment", "Environment cannot be empty");
        } else if !is_valid_name(&project.environment) {
            result.error(
                "project.environment",
                format!("Environment '{}' is invalid", project.environment),
            );
        }
    }

    fn validate_state(state: &StateConfig, result: &mut ValidationResult) {
        match state.backend {
            StateBackendKind::S3 => {
                if state.bucket.as_ref().is_none_or(String::is_empty) {
                    result.error("state.bucket", "S3 bucket name is required when using S3 backend");
                }
            }
            StateBackendKind::Local => {
                if state.bucket.is_some() {
                    result
                        .warnings
                        .push(String::from("state.bucket: ignored by the local backend"));
                }
            }
        }

        if state.lock_ttl_secs == 0 {
            result.error("state.lock_ttl_secs", "Lock TTL must be at least 1 second");
        } else if state.lock_ttl_secs > MAX_LOCK_TTL_SECS {
            result.error(
                "state.lock_ttl_secs",
                format!("Lock TTL must not exceed {MAX_LOCK_TTL_SECS} seconds"),
            );
        }
    }

    fn validate_apply(apply: &ApplyConfig, result: &mut ValidationResult) {
        if apply.parallelism == 0 {
            result.error("apply.parallelism", "Parallelism must be at least 1");
        }

        if apply.operation_timeout_secs == 0 {
            result.error("apply.operation_timeout_secs", "Operation timeout must be at least 1 second");
        }

        if let Some(engine) = &apply.engine
            && engine.first().is_none_or(String::is_empty)
        {
            result.error("apply.engine", "Engine command line cannot be empty");
        }
    }

    fn validate_stacks(stacks: &[StackConfig], result: &mut ValidationResult) {
        if stacks.is_empty() {
            result.warnings.push(String::from("No stacks defined in configuration"));
            return;
        }

        let mut seen_stacks = HashSet::new();

        for (i, stack) in stacks.iter().enumerate() {
            let prefix = format!("stacks[{i}]");

            if !seen_stacks.insert(stack.name.as_str()) {
                result.error(format!("{prefix}.name"), format!("Duplicate stack name: {}", stack.name));
            }

            if !is_valid_name(&stack.name) {
                result.error(
                    format!("{prefix}.name"),
                    format!(
                        "Stack name '{}' is invalid. Must be lowercase alphanumeric with hyphens.",
                        stack.name
                    ),
                );
            }

            if stack.resources.is_empty() {
                result.warnings.push(format!("{prefix}: stack '{}' declares no resources", stack.name));
            }

            let mut seen_ids = HashSet::new();

            for (j, resource) in stack.resources.iter().enumerate() {
                let field = format!("{prefix}.resources[{j}]");

                if !seen_ids.insert(resource.id.as_str()) {
                    result.error(
                        format!("{field}.id"),
                        format!("Duplicate resource id '{}' in stack '{}'", resource.id, stack.name),
                    );
                }

                if !is_valid_identifier(&resource.id) {
                    result.error(
                        format!("{field}.id"),
                        format!(
                            "Resource id '{}' is invalid. Must start with a letter and contain only letters, digits, '-' or '_'.",
                            resource.id
                        ),
                    );
                }

                if resource.resource_type.trim().is_empty() {
                    result.error(format!("{field}.type"), "Resource type cannot be empty");
                }

                for (name, value) in &resource.attributes {
                    Self::validate_value(value, &format!("{field}.attributes.{name}"), result);
                }
            }

            for (name, value) in &stack.outputs {
                Self::validate_value(value, &format!("{prefix}.outputs.{name}"), result);
            }
        }
    }

    fn validate_value(value: &AttributeValue, field: &str, result: &mut ValidationResult) {
        for reference in value.references() {
            if let Some(message) = malformed(reference) {
                result.error(field, message);
            }
        }
    }
}

fn malformed(reference: &Reference) -> Option<&'static str> {
    if reference.ref_stack.is_none() && reference.ref_resource_id.is_none() {
        return Some("Stack output reference requires refStack");
    }
    if reference.ref_output.is_empty() {
        return Some("Reference refOutput cannot be empty");
    }
    if reference.ref_stack.as_ref().is_some_and(String::is_empty) {
        return Some("Reference refStack cannot be empty");
    }
    if reference.ref_resource_id.as_ref().is_some_and(String::is_empty) {
        return Some("Reference refResourceId cannot be empty");
    }
    None
}

/// Validates that a name follows the naming convention.
/// Names must be lowercase alphanumeric with hyphens, starting with a letter.
fn is_valid_name(name: &str) -> bool {
    let mut chars = name.chars();

    match chars.next() {
        Some(first) if first.is_ascii_lowercase() => {}
        _ => return false,
    }

    if !chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-') {
        return false;
    }

    !name.ends_with('-') && !name.contains("--")
}

/// Resource ids are looser than names: mixed case and underscores are allowed,
/// but never the `/` address separator.
fn is_valid_identifier(id: &str) -> bool {
    let mut chars = id.chars();

    match chars.next() {
        Some(first) if first.is_ascii_alphabetic() => {}
        _ => return false,
    }

    chars.all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

impl ValidationResult {
    /// Returns true if validation passed (no errors).
    #[must_use]
    pub const fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// Returns the number of errors.
    #[must_use]
    pub const fn error_count(&self) -> usize {
        self.errors.len()
    }

    /// Returns the number of warnings.
    #[must_use]
    pub const fn warning_count(&self) -> usize {
        self.warnings.len()
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
    use crate::graph::GraphBuilder;

    fn parse(yaml: &str) -> InfraConfig {
        ConfigParser::new().parse_yaml(yaml, None).unwrap()
    }

    #[test]
    fn test_valid_name() {
        assert!(is_valid_name("net"));
        assert!(is_valid_name("shop-prod-2"));
        assert!(is_valid_name("a"));
    }

    #[test]
    fn test_invalid_name() {
        assert!(!is_valid_name(""));
        assert!(!is_valid_name("Net")); // uppercase
        assert!(!is_valid_name("1net")); // starts with number
        assert!(!is_valid_name("net_a")); // underscore
        assert!(!is_valid_name("net-")); // ends with hyphen
        assert!(!is_valid_name("net--a")); // consecutive hyphens
    }

    #[test]
    fn test_identifier() {
        assert!(is_valid_identifier("public_subnet"));
        assert!(is_valid_identifier("Vpc-1"));
        assert!(!is_valid_identifier("net/vpc"));
        assert!(!is_valid_identifier("_vpc"));
    }

    #[test]
    fn test_valid_config() {
        let config = parse(
            r"
project:
  name: shop
stacks:
  - name: net
    resources:
      - id: vpc
        type: aws_vpc
",
        );
        let result = ConfigValidator::new().validate(&config).unwrap();
        assert!(result.is_valid());
        assert_eq!(result.warning_count(), 0);
    }

    #[test]
    fn test_collects_every_error() {
        let config = parse(
            r#"
project:
  name: Shop
state:
  backend: s3
apply:
  parallelism: 0
  engine: []
stacks:
  - name: net
    resources:
      - id: vpc
        type: ""
        attributes:
          peer: { refResourceId: "", refOutput: id }
"#,
        );
        let result = ConfigValidator::new().check(&config);
        let fields: Vec<&str> = result.errors.iter().map(|e| e.field.as_str()).collect();
        assert_eq!(
            fields,
            [
                "project.name",
                "state.bucket",
                "apply.parallelism",
                "apply.engine",
                "stacks[0].resources[0].type",
                "stacks[0].resources[0].attributes.peer",
            ]
        );

        let err = ConfigValidator::new().validate(&config).unwrap_err();
        assert!(err.to_string().contains("Project name 'Shop' is invalid"));
    }

    #[test]
    fn test_lock_ttl_upper_bound() {
        let config = parse(
            r"
project:
  name: shop
state:
  lock_ttl_secs: 10000000000000
stacks: []
",
        );
        let result = ConfigValidator::new().check(&config);
        assert_eq!(result.error_count(), 1);
        assert_eq!(result.errors[0].field, "state.lock_ttl_secs");
        assert!(result.errors[0].message.contains(&MAX_LOCK_TTL_SECS.to_string()));
    }

    #[test]
    fn test_duplicates_and_bare_references() {
        let config = parse(
            r"
project:
  name: shop
stacks:
  - name: net
    resources:
      - id: vpc
        type: aws_vpc
      - id: vpc
        type: aws_vpc
        attributes:
          peer: { refOutput: subnetId }
  - name: net
    resources:
      - id: vpc
        type: aws_vpc
",
        );
        let result = ConfigValidator::new().check(&config);
        let messages: Vec<String> = result.errors.iter().map(ToString::to_string).collect();
        assert_eq!(
            messages,
            [
                "stacks[0].resources[1].id: Duplicate resource id 'vpc' in stack 'net'",
                "stacks[0].resources[1].attributes.peer: Stack output reference requires refStack",
                "stacks[1].name: Duplicate stack name: net",
            ]
        );
    }

    #[test]
    fn test_init_template_is_valid() {
        let config = parse(include_str!("../../templates/terrastack.yaml"));
        let result = ConfigValidator::new().validate(&config).unwrap();
        assert_eq!(result.warning_count(), 0);

        let mut builder = GraphBuilder::new();
        for stack in config.to_stacks() {
            builder.register(stack);
        }
        let graph = builder.build().unwrap();
        assert_eq!(graph.len(), 3);
        assert_eq!(graph.stack_dependencies("app"), ["network"]);
    }

    #[test]
    fn test_warnings_do_not_fail() {
        let config = parse("project:\n  name: shop\n");
        let result = ConfigValidator::new().validate(&config).unwrap();
        assert_eq!(result.warning_count(), 1);
    }
}
