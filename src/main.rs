//! Terrastack CLI entrypoint.
//!
//! This is the main entrypoint for the terrastack command-line tool.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use terrastack::cli::{Cli, Commands, OutputFormatter, StateCommands};
use terrastack::config::{ConfigParser, ConfigValidator, InfraConfig, StateBackendKind, find_config_file};
use terrastack::error::{ConfigError, EXIT_SUCCESS, Result, StateError, TerrastackError};
use terrastack::provisioner::{ExternalCommandProvisioner, ResourceProvisioner};
use terrastack::session::Session;
use terrastack::state::{
    BackendKey, LocalStateBackend, LockToken, S3StateBackend, STATE_DIR, StateBackend, generate_holder_id,
};

use clap::Parser;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

/// Main entrypoint.
fn main() -> ExitCode {
    let cli = Cli::parse();

    init_logging(cli.verbose, cli.log_json);

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Failed to create async runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(cli)) {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            error!("{e}");
            eprintln!("Error: {e}");
            if let Some(delay) = e.retry_delay_secs() {
                eprintln!("This error is transient; retry in about {delay}s.");
            }
            ExitCode::from(e.exit_code())
        }
    }
}

/// Initializes the logging system.
///
/// `RUST_LOG` is honoured unless `--verbose` is given.
fn init_logging(verbose: bool, json: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Main async entry point.
async fn run(cli: Cli) -> Result<u8> {
    let formatter = OutputFormatter::new(cli.output);

    match cli.command {
        Commands::Init { path, force } => cmd_init(&path, force),
        Commands::Validate { warnings } => cmd_validate(cli.config.as_ref(), warnings, &formatter),
        Commands::Graph => cmd_graph(cli.config.as_ref(), &formatter),
        Commands::Plan { out } => cmd_plan(cli.config.as_ref(), out.as_deref(), &formatter).await,
        Commands::Apply {
            yes,
            engine,
            parallelism,
            timeout,
        } => {
            let overrides = ApplyOverrides {
                engine,
                parallelism,
                timeout,
            };
            cmd_apply(cli.config.as_ref(), yes, overrides, &formatter).await
        }
        Commands::State { command } => cmd_state(cli.config.as_ref(), command, &formatter).await,
    }
}

/// Command-line overrides for `apply`.
struct ApplyOverrides {
    engine: Option<String>,
    parallelism: Option<usize>,
    timeout: Option<u64>,
}

/// Initialize a new project.
fn cmd_init(path: &Path, force: bool) -> Result<u8> {
    info!("Initializing new Terrastack project in: {}", path.display());

    let config_path = path.join("terrastack.yaml");
    let gitignore_path = path.join(".gitignore");

    if !force && config_path.exists() {
        eprintln!("Configuration file already exists: {}", config_path.display());
        eprintln!("Use --force to overwrite.");
        return Ok(EXIT_SUCCESS);
    }

    if !path.exists() {
        std::fs::create_dir_all(path)?;
    }

    std::fs::write(&config_path, include_str!("../templates/terrastack.yaml"))?;
    eprintln!("Created: {}", config_path.display());

    let state_entry = format!("{STATE_DIR}/");
    if gitignore_path.exists() {
        let existing = std::fs::read_to_string(&gitignore_path)?;
        let missing: Vec<&str> = [".env", state_entry.as_str()]
            .into_iter()
            .filter(|entry| !existing.lines().any(|line| line.trim() == *entry))
            .collect();
        if !missing.is_empty() {
            let mut file = std::fs::OpenOptions::new().append(true).open(&gitignore_path)?;
            writeln!(file, "\n# Terrastack")?;
            for entry in missing {
                writeln!(file, "{entry}")?;
            }
            eprintln!("Updated: {}", gitignore_path.display());
        }
    } else {
        std::fs::write(&gitignore_path, format!(".env\n{state_entry}\n"))?;
        eprintln!("Created: {}", gitignore_path.display());
    }

    eprintln!("\nProject initialized successfully!");
    eprintln!("Next steps:");
    eprintln!("  1. Edit terrastack.yaml with your stacks");
    eprintln!("  2. Run 'terrastack validate' to check the configuration");
    eprintln!("  3. Run 'terrastack plan' to see what would change");
    eprintln!("  4. Configure apply.engine and run 'terrastack apply'");

    Ok(EXIT_SUCCESS)
}

/// Validate configuration and the dependency graph.
fn cmd_validate(config_path: Option<&PathBuf>, show_warnings: bool, formatter: &OutputFormatter) -> Result<u8> {
    let (config_file, parser) = open_parser(config_path)?;
    info!("Validating configuration: {}", config_file.display());

    let config = parser.load_with_env(&config_file)?;

    let result = ConfigValidator::new().check(&config);
    if let Some(first) = result.errors.first() {
        eprintln!("Configuration has {} error(s):", result.error_count());
        for error in &result.errors {
            eprintln!("  - {error}");
        }
        return Err(ConfigError::validation(first.message.clone(), first.field.clone()).into());
    }

    let graph = session(&config).build()?;
    debug!("Graph has {} resources and {} edges", graph.len(), graph.edge_count());

    emit(&formatter.format_validation(&config, &result, show_warnings))?;
    Ok(EXIT_SUCCESS)
}

/// Show the dependency graph.
fn cmd_graph(config_path: Option<&PathBuf>, formatter: &OutputFormatter) -> Result<u8> {
    let (_, config) = load_config(config_path)?;
    let graph = session(&config).build()?;
    emit(&formatter.format_graph(&graph))?;
    Ok(EXIT_SUCCESS)
}

/// Compute and display the plan.
async fn cmd_plan(config_path: Option<&PathBuf>, out: Option<&Path>, formatter: &OutputFormatter) -> Result<u8> {
    let (config_file, config) = load_config(config_path)?;
    let backend = open_backend(&config, &config_file).await?;

    let outcome = session(&config).plan(backend.as_ref()).await?;

    if let Some(out) = out {
        std::fs::write(out, outcome.document.to_json()?)?;
        eprintln!("Plan written to {}", out.display());
    }

    emit(&formatter.format_plan(&outcome.document))?;
    Ok(EXIT_SUCCESS)
}

/// Plan and apply.
async fn cmd_apply(
    config_path: Option<&PathBuf>,
    auto_approve: bool,
    overrides: ApplyOverrides,
    formatter: &OutputFormatter,
) -> Result<u8> {
    let (config_file, mut config) = load_config(config_path)?;
    if let Some(parallelism) = overrides.parallelism {
        config.apply.parallelism = parallelism;
    }
    if let Some(timeout) = overrides.timeout {
        config.apply.operation_timeout_secs = timeout;
    }

    let provisioner = engine(&config, overrides.engine.as_deref())?;
    let backend = open_backend(&config, &config_file).await?;
    let session = session(&config);

    let preview = session.plan(backend.as_ref()).await?;
    if !preview.document.has_changes() {
        emit(&formatter.format_plan(&preview.document))?;
        return Ok(EXIT_SUCCESS);
    }

    if !formatter.is_json() {
        emit(&formatter.format_plan(&preview.document))?;
    }

    if !auto_approve && !confirm("Do you want to apply this plan? [y/N]: ")? {
        eprintln!("Apply cancelled.");
        return Ok(EXIT_SUCCESS);
    }

    let cancel = session.cancel_signal();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, finishing in-flight operations");
            cancel.cancel();
        }
    });

    let report = session.apply(backend.as_ref(), provisioner).await?;
    if report.plan.fingerprint != preview.document.fingerprint {
        warn!("State changed between preview and apply; the applied plan differs from the one shown");
    }

    emit(&formatter.format_report(&report))?;
    Ok(report.exit_code())
}

/// State management commands.
async fn cmd_state(config_path: Option<&PathBuf>, command: StateCommands, formatter: &OutputFormatter) -> Result<u8> {
    let (config_file, config) = load_config(config_path)?;
    let backend = open_backend(&config, &config_file).await?;
    let key = BackendKey::new(&config.project.name, &config.project.environment);

    match command {
        StateCommands::Show => {
            let snapshot = backend.read_snapshot(&key).await?;
            emit(&formatter.format_snapshot(&snapshot))?;
        }
        StateCommands::Lock { holder } => {
            let holder = holder.unwrap_or_else(generate_holder_id);
            let ttl = Duration::from_secs(config.state.lock_ttl_secs);
            let token = backend.acquire_lock(&key, &holder, ttl).await?;
            info!("Locked {key} as {}", token.holder);
            let lock = backend.lock_info(&key).await?;
            emit(&formatter.format_lock(lock.as_ref()))?;
        }
        StateCommands::Unlock { token, force } => {
            if force {
                if backend.force_unlock(&key).await? {
                    eprintln!("State forcefully unlocked.");
                } else {
                    eprintln!("State was not locked.");
                }
            } else if let Some(token) = token {
                let held = held_token(backend.as_ref(), &key, token).await?;
                backend.release_lock(&key, &held).await?;
                eprintln!("State unlocked.");
            } else {
                return Err(ConfigError::validation_general("Provide --token or use --force").into());
            }
        }
        StateCommands::Renew { token } => {
            let held = held_token(backend.as_ref(), &key, token).await?;
            let lock = backend.renew_lock(&key, &held).await?;
            emit(&formatter.format_lock(Some(&lock)))?;
        }
    }

    Ok(EXIT_SUCCESS)
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Writes command output to stdout.
fn emit(text: &str) -> Result<()> {
    let mut stdout = std::io::stdout().lock();
    stdout.write_all(text.as_bytes())?;
    if !text.ends_with('\n') {
        stdout.write_all(b"\n")?;
    }
    stdout.flush()?;
    Ok(())
}

/// Asks a yes/no question on stderr.
fn confirm(prompt: &str) -> Result<bool> {
    eprint!("{prompt}");
    std::io::stderr().flush()?;

    let mut input = String::new();
    std::io::stdin().read_line(&mut input)?;
    Ok(input.trim().eq_ignore_ascii_case("y"))
}

/// Resolves the configuration file path and prepares a parser next to it.
fn open_parser(config_path: Option<&PathBuf>) -> Result<(PathBuf, ConfigParser)> {
    let config_file = config_path.map_or_else(|| find_config_file("."), |path| Ok(path.clone()))?;
    let parser = ConfigParser::new().with_base_path(config_dir(&config_file));
    parser.load_dotenv()?;
    Ok((config_file, parser))
}

/// Loads and validates the configuration.
fn load_config(config_path: Option<&PathBuf>) -> Result<(PathBuf, InfraConfig)> {
    let (config_file, parser) = open_parser(config_path)?;
    debug!("Loading configuration from: {}", config_file.display());

    let config = parser.load_with_env(&config_file)?;
    let result = ConfigValidator::new().validate(&config)?;
    for warning in &result.warnings {
        warn!("{warning}");
    }

    Ok((config_file, config))
}

fn config_dir(config_file: &Path) -> &Path {
    config_file
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."))
}

/// Builds a session holding every configured stack.
fn session(config: &InfraConfig) -> Session {
    let mut session =
        Session::new(&config.project.name, &config.project.environment).with_settings(config.session_settings());
    for stack in config.to_stacks() {
        session.register(stack);
    }
    session
}

/// Creates the state backend named by the configuration.
async fn open_backend(config: &InfraConfig, config_file: &Path) -> Result<Box<dyn StateBackend>> {
    let retry = config.state.lock_retry();

    let backend: Box<dyn StateBackend> = match config.state.backend {
        StateBackendKind::Local => {
            let path = config
                .state
                .path
                .as_ref()
                .map_or_else(|| config_dir(config_file).join(STATE_DIR), PathBuf::from);
            Box::new(LocalStateBackend::with_base_dir(path).with_lock_retry(retry))
        }
        StateBackendKind::S3 => {
            let bucket = config
                .state
                .bucket
                .as_deref()
                .ok_or_else(|| ConfigError::validation("S3 bucket not configured", "state.bucket"))?;
            let backend = S3StateBackend::new(
                bucket,
                config.state.prefix.as_deref(),
                config.state.region.as_deref(),
                config.state.lock_table.as_deref(),
            )
            .await?;
            Box::new(backend.with_lock_retry(retry))
        }
    };

    debug!("Using {} state backend", backend.backend_type());
    Ok(backend)
}

/// Creates the provisioner from `--engine` or `apply.engine`.
fn engine(config: &InfraConfig, command_line: Option<&str>) -> Result<Arc<dyn ResourceProvisioner>> {
    let words: Vec<String> = match command_line {
        Some(line) => line.split_whitespace().map(str::to_string).collect(),
        None => config.apply.engine.clone().unwrap_or_default(),
    };

    let provisioner = ExternalCommandProvisioner::from_command_line(&words)
        .ok_or_else(|| ConfigError::validation("No apply engine configured; set apply.engine or pass --engine", "apply.engine"))?;
    debug!("Applying through {}", provisioner.program());
    Ok(Arc::new(provisioner))
}

/// Rebuilds the token of the current lock from its printed value.
async fn held_token(backend: &dyn StateBackend, key: &BackendKey, token: String) -> Result<LockToken> {
    let lock = backend.lock_info(key).await?.ok_or_else(|| StateError::LockFailed {
        message: format!("{key} is not locked"),
    })?;

    if lock.token != token {
        return Err(TerrastackError::State(StateError::LockFailed {
            message: format!("Token does not match the current lock on {key}, held by {}", lock.holder),
        }));
    }

    Ok(lock.token_for(key))
}
