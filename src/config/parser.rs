//! Configuration parser for loading configuration files.
//!
//! This module handles loading configuration from YAML files and environment
//! variables, with proper precedence and error handling.

use crate::error::{ConfigError, Result, TerrastackError};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use super::spec::{InfraConfig, StateBackendKind};

/// Configuration parser for loading stack definitions.
#[derive(Debug, Default)]
pub struct ConfigParser {
    /// Base path for resolving `.env`.
    base_path: Option<PathBuf>,
}

impl ConfigParser {
    /// Creates a new configuration parser.
    #[must_use]
    pub const fn new() -> Self {
        Self { base_path: None }
    }

    /// Sets the base path used to locate the `.env` file.
    #[must_use]
    pub fn with_base_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.base_path = Some(path.into());
        self
    }

    /// Loads configuration from a YAML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load_file(&self, path: impl AsRef<Path>) -> Result<InfraConfig> {
        let path = path.as_ref();
        info!("Loading configuration from: {}", path.display());

        if !path.exists() {
            return Err(TerrastackError::Config(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            }));
        }

        let content = std::fs::read_to_string(path).map_err(|e| {
            TerrastackError::Config(ConfigError::ParseError {
                message: format!("Failed to read file: {e}"),
                location: Some(path.display().to_string()),
            })
        })?;

        self.parse_yaml(&content, Some(path))
    }

    /// Parses configuration from a YAML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the YAML is invalid.
    pub fn parse_yaml(&self, content: &str, source: Option<&Path>) -> Result<InfraConfig> {
        debug!("Parsing YAML configuration");

        let config: InfraConfig = serde_yaml::from_str(content).map_err(|e| {
            let location = match (source, e.location()) {
                (Some(p), Some(at)) => Some(format!("{}:{}:{}", p.display(), at.line(), at.column())),
                (Some(p), None) => Some(p.display().to_string()),
                (None, Some(at)) => Some(format!("line {}, column {}", at.line(), at.column())),
                (None, None) => None,
            };
            TerrastackError::Config(ConfigError::ParseError {
                message: format!("YAML parse error: {e}"),
                location,
            })
        })?;

        debug!(
            "Parsed configuration for project {} with {} stacks",
            config.project.name,
            config.stacks.len()
        );
        Ok(config)
    }

    /// Loads configuration with environment variable overrides.
    ///
    /// Environment variables are checked in the format
    /// `TERRASTACK_<SECTION>_<KEY>` (e.g., `TERRASTACK_STATE_BUCKET`).
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed, or an override
    /// holds an invalid value.
    pub fn load_with_env(&self, path: impl AsRef<Path>) -> Result<InfraConfig> {
        let mut config = self.load_file(path)?;
        apply_env_overrides(&mut config, |name| std::env::var(name).ok())?;
        Ok(config)
    }

    /// Loads the .env file if present.
    ///
    /// # Errors
    ///
    /// Returns an error if the .env file exists but cannot be loaded.
    pub fn load_dotenv(&self) -> Result<()> {
        let env_path = self
            .base_path
            .as_ref()
            .map_or_else(|| PathBuf::from(".env"), |p| p.join(".env"));

        if env_path.exists() {
            info!("Loading environment from: {}", env_path.display());
            dotenvy::from_path(&env_path).map_err(|e| {
                TerrastackError::Config(ConfigError::ParseError {
                    message: format!("Failed to load .env file: {e}"),
                    location: Some(env_path.display().to_string()),
                })
            })?;
        } else {
            debug!(".env file not found at: {}", env_path.display());
        }

        Ok(())
    }
}

/// Applies `TERRASTACK_*` overrides read through `lookup`.
///
/// # Errors
///
/// Returns a validation error when an override cannot be parsed.
pub fn apply_env_overrides<F>(config: &mut InfraConfig, lookup: F) -> Result<()>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(name) = lookup("TERRASTACK_PROJECT_NAME") {
        debug!("Overriding project.name from environment");
        config.project.name = name;
    }

    if let Some(env) = lookup("TERRASTACK_ENVIRONMENT") {
        debug!("Overriding project.environment from environment");
        config.project.environment = env;
    }

    if let Some(backend) = lookup("TERRASTACK_STATE_BACKEND") {
        debug!("Overriding state.backend from environment");
        config.state.backend = match backend.to_ascii_lowercase().as_str() {
            "local" => StateBackendKind::Local,
            "s3" => StateBackendKind::S3,
            other => {
                return Err(ConfigError::validation(
                    format!("Unknown state backend '{other}', expected local or s3"),
                    "TERRASTACK_STATE_BACKEND",
                )
                .into());
            }
        };
    }

    if let Some(path) = lookup("TERRASTACK_STATE_PATH") {
        debug!("Overriding state.path from environment");
        config.state.path = Some(path);
    }

    if let Some(bucket) = lookup("TERRASTACK_STATE_BUCKET") {
        debug!("Overriding state.bucket from environment");
        config.state.bucket = Some(bucket);
    }

    if let Some(prefix) = lookup("TERRASTACK_STATE_PREFIX") {
        debug!("Overriding state.prefix from environment");
        config.state.prefix = Some(prefix);
    }

    if let Some(region) = lookup("TERRASTACK_STATE_REGION") {
        debug!("Overriding state.region from environment");
        config.state.region = Some(region);
    }

    if let Some(table) = lookup("TERRASTACK_STATE_LOCK_TABLE") {
        debug!("Overriding state.lock_table from environment");
        config.state.lock_table = Some(table);
    }

    if let Some(ttl) = lookup("TERRASTACK_STATE_LOCK_TTL_SECS") {
        debug!("Overriding state.lock_ttl_secs from environment");
        config.state.lock_ttl_secs = ttl.parse().map_err(|_| {
            ConfigError::validation(format!("Invalid lock TTL '{ttl}'"), "TERRASTACK_STATE_LOCK_TTL_SECS")
        })?;
    }

    Ok(())
}

/// Default configuration file names to search for.
pub const DEFAULT_CONFIG_FILES: &[&str] = &["terrastack.yaml", "terrastack.yml"];

/// Finds the configuration file in the current directory or parent directories.
///
/// # Errors
///
/// Returns an error if no configuration file is found.
pub fn find_config_file(start_dir: impl AsRef<Path>) -> Result<PathBuf> {
    let start = start_dir.as_ref();
    let mut current = start.to_path_buf();

    loop {
        for filename in DEFAULT_CONFIG_FILES {
            let config_path = current.join(filename);
            if config_path.exists() {
                info!("Found configuration file: {}", config_path.display());
                return Ok(config_path);
            }
        }

        if !current.pop() {
            break;
        }
    }

    Err(TerrastackError::Config(ConfigError::FileNotFound {
        path: start.join(DEFAULT_CONFIG_FILES[0]),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_parse_minimal_config() {
        let yaml = r"
project:
  name: test-project
state:
  backend: local
stacks: []
";
        let config = ConfigParser::new().parse_yaml(yaml, None).unwrap();
        assert_eq!(config.project.name, "test-project");
        assert_eq!(config.project.environment, "dev");
        assert!(config.stacks.is_empty());
    }

    #[test]
    fn test_parse_full_config() {
        let yaml = r"
project:
  name: shop
  environment: prod
state:
  backend: s3
  bucket: shop-state
  prefix: shop/prod
  lock_ttl_secs: 120
apply:
  parallelism: 8
  engine: [./engine, --verbose]
stacks:
  - name: net
    backend:
      bucket: shop-state
      key: net.json
    resources:
      - id: vpc
        type: aws_vpc
";
        let config = ConfigParser::new().parse_yaml(yaml, None).unwrap();
        assert_eq!(config.state.backend, StateBackendKind::S3);
        assert_eq!(config.state.lock_ttl_secs, 120);
        assert_eq!(config.apply.parallelism, 8);
        assert_eq!(config.apply.engine.as_deref().map(<[String]>::len), Some(2));
        assert_eq!(config.stacks[0].backend.as_ref().and_then(|b| b.key.as_deref()), Some("net.json"));
    }

    #[test]
    fn test_parse_error_reports_location() {
        let err = ConfigParser::new()
            .parse_yaml("project:\n  name: [unterminated", Some(Path::new("terrastack.yaml")))
            .unwrap_err();
        match err {
            TerrastackError::Config(ConfigError::ParseError { location, .. }) => {
                assert!(location.unwrap().starts_with("terrastack.yaml"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_env_overrides() {
        let mut config = ConfigParser::new().parse_yaml("project:\n  name: shop\n", None).unwrap();
        let vars: HashMap<&str, &str> = HashMap::from([
            ("TERRASTACK_ENVIRONMENT", "staging"),
            ("TERRASTACK_STATE_BACKEND", "S3"),
            ("TERRASTACK_STATE_BUCKET", "shared-state"),
            ("TERRASTACK_STATE_LOCK_TTL_SECS", "45"),
        ]);
        apply_env_overrides(&mut config, |name| vars.get(name).map(|v| (*v).to_string())).unwrap();

        assert_eq!(config.project.name, "shop");
        assert_eq!(config.project.environment, "staging");
        assert_eq!(config.state.backend, StateBackendKind::S3);
        assert_eq!(config.state.bucket.as_deref(), Some("shared-state"));
        assert_eq!(config.state.lock_ttl_secs, 45);
    }

    #[test]
    fn test_invalid_override_rejected() {
        let mut config = ConfigParser::new().parse_yaml("project:\n  name: shop\n", None).unwrap();
        let result = apply_env_overrides(&mut config, |name| {
            (name == "TERRASTACK_STATE_BACKEND").then(|| String::from("consul"))
        });
        assert!(result.is_err());
    }

    #[test]
    fn test_find_config_file_walks_parents() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("terrastack.yaml"), "project:\n  name: shop\n").unwrap();
        let nested = dir.path().join("stacks").join("net");
        std::fs::create_dir_all(&nested).unwrap();

        let found = find_config_file(&nested).unwrap();
        assert_eq!(found, dir.path().join("terrastack.yaml"));

        let config = ConfigParser::new().with_base_path(dir.path()).load_with_env(&found).unwrap();
        assert_eq!(config.project.name, "shop");
    }

    #[test]
    fn test_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = ConfigParser::new().load_file(dir.path().join("nope.yaml")).unwrap_err();
        assert!(matches!(err, TerrastackError::Config(ConfigError::FileNotFound { .. })));
    }
}
