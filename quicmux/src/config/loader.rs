//! Configuration loading and parsing.
//!
//! Precedence, lowest first: defaults, TOML file, `QUICMUX_` environment
//! variables, command-line flags.

use anyhow::{Context, Result};
use clap::{CommandFactory, FromArgMatches, Parser};
use config::{Config as ConfigLoader, Environment};
use std::path::Path;

use super::ServerConfig;

/// Command-line interface for the server.
#[derive(Parser, Debug, Clone, Default)]
#[command(author, version, about, long_about = None)]
pub struct CliArgs {
    /// Path to configuration file (TOML format)
    #[arg(long, short = 'c', default_value = "quicmux.toml")]
    pub config: String,

    /// Host address to bind to (overrides config file)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides config file)
    #[arg(long)]
    pub port: Option<u16>,

    /// Log level (overrides config file)
    #[arg(long)]
    pub log_level: Option<String>,

    /// Number of shard threads (overrides config file)
    #[arg(long)]
    pub shards: Option<usize>,

    /// Validate configuration and exit
    #[arg(long)]
    pub validate: bool,

    /// Print default configuration and exit
    #[arg(long)]
    pub print_default_config: bool,
}

/// Parse the process arguments and load the server configuration.
///
/// `--print-default-config` and `--validate` exit the process.
pub fn load_config() -> Result<ServerConfig> {
    let matches = CliArgs::command().get_matches();
    let cli =
        CliArgs::from_arg_matches(&matches).context("Failed to parse command-line arguments")?;

    if cli.print_default_config {
        print_default_config()?;
        std::process::exit(0);
    }

    let config = resolve_config(&cli, process_env())?;

    if cli.validate {
        println!("Configuration is valid");
        std::process::exit(0);
    }

    Ok(config)
}

/// File, then `env`, then CLI overrides, then validation.
pub fn resolve_config(cli: &CliArgs, env: Environment) -> Result<ServerConfig> {
    let mut config = load_config_file(Path::new(&cli.config))?;
    apply_env_overrides(&mut config, env)?;
    apply_cli_overrides(&mut config, cli);

    config.validate().map_err(|errors| {
        anyhow::anyhow!("Configuration validation failed:\n{}", errors.join("\n"))
    })?;

    Ok(config)
}

/// Environment variables use the `QUICMUX_` prefix and `__` between
/// sections, e.g. `QUICMUX_GLOBAL__NETIO__SHARDS=4`.
pub fn process_env() -> Environment {
    Environment::with_prefix("QUICMUX")
        .prefix_separator("_")
        .separator("__")
}

fn load_config_file(path: &Path) -> Result<ServerConfig> {
    if !path.exists() {
        tracing::warn!(
            config_path = %path.display(),
            "Configuration file not found, using defaults"
        );
        return Ok(ServerConfig::default());
    }

    let config_str = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    toml::from_str(&config_str)
        .with_context(|| format!("Failed to parse TOML config: {}", path.display()))
}

fn apply_env_overrides(config: &mut ServerConfig, env: Environment) -> Result<()> {
    let env_config = ConfigLoader::builder()
        .add_source(env)
        .build()
        .context("Failed to load environment variables")?;

    if let Ok(host) = env_config.get_string("global.network.host") {
        config.global.network.host = host;
    }
    if let Ok(port) = env_config.get_int("global.network.port") {
        config.global.network.port = u16::try_from(port)
            .with_context(|| format!("QUICMUX_GLOBAL__NETWORK__PORT out of range: {}", port))?;
    }
    if let Ok(level) = env_config.get_string("global.logging.level") {
        match level.parse() {
            Ok(parsed) => config.global.logging.level = parsed,
            Err(e) => tracing::warn!(error = %e, "Ignoring log level from environment"),
        }
    }
    if let Ok(shards) = env_config.get_int("global.netio.shards") {
        config.global.netio.shards = usize::try_from(shards)
            .with_context(|| format!("QUICMUX_GLOBAL__NETIO__SHARDS out of range: {}", shards))?;
    }
    if let Ok(path) = env_config.get_string("global.tls.key_path") {
        config.global.tls.key_path = Some(path.into());
    }
    if let Ok(endpoint) = env_config.get_string("global.telemetry.otlp_endpoint") {
        config.global.telemetry.otlp_endpoint = endpoint;
    }
    if let Ok(timeout) = env_config.get_int("loopback.idle_timeout_ms") {
        config.loopback.idle_timeout_ms = u64::try_from(timeout).with_context(|| {
            format!("QUICMUX_LOOPBACK__IDLE_TIMEOUT_MS out of range: {}", timeout)
        })?;
    }

    Ok(())
}

fn apply_cli_overrides(config: &mut ServerConfig, cli: &CliArgs) {
    if let Some(ref host) = cli.host {
        config.global.network.host = host.clone();
    }

    if let Some(port) = cli.port {
        config.global.network.port = port;
    }

    if let Some(shards) = cli.shards {
        config.global.netio.shards = shards;
    }

    if let Some(ref level_str) = cli.log_level {
        if let Ok(level) = level_str.parse() {
            config.global.logging.level = level;
        } else {
            tracing::warn!(level = %level_str, "Invalid log level specified, ignoring");
        }
    }
}

fn print_default_config() -> Result<()> {
    let default_config = ServerConfig::default();
    let toml_str =
        toml::to_string_pretty(&default_config).context("Failed to serialize default config")?;
    println!("{}", toml_str);
    Ok(())
}
