//! Configuration module for Terrastack.
//!
//! This module handles all configuration-related functionality:
//! - Parsing and deserializing `terrastack.yaml`
//! - Validation of configuration values
//! - Content hashing for change detection

mod hash;
mod parser;
mod spec;
mod validator;

pub use hash::{ContentHasher, canonicalize};
pub use parser::{ConfigParser, DEFAULT_CONFIG_FILES, apply_env_overrides, find_config_file};
pub use spec::{ApplyConfig, InfraConfig, ProjectConfig, StackConfig, StateBackendKind, StateConfig};
pub use validator::{ConfigValidator, ValidationError, ValidationResult};
