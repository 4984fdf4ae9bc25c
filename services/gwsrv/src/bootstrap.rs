//! Service Bootstrap and Initialization
//!
//! Command-line arguments, configuration loading and logging setup.

use std::path::PathBuf;

use clap::Parser;
use common::{load_layered, ConfigSource, LogConfig, LogGuard};
use tracing::{debug, info};

use crate::config::{GatewayConfig, DEFAULT_CONFIG_PATH, ENV_PREFIX};
use crate::error::{GwError, Result};

pub const SERVICE_NAME: &str = "gwsrv";

/// Command-line arguments for gwsrv
#[derive(Parser, Debug, Clone)]
#[command(
    name = "gwsrv",
    version = env!("CARGO_PKG_VERSION"),
    about = "Modbus TCP gateway for a serial inverter/battery controller",
    long_about = None
)]
pub struct Args {
    /// Configuration file (YAML)
    #[arg(short = 'c', long, env = "GWSRV_CONFIG")]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, default_value = "info")]
    pub log_level: String,

    /// Directory for rolling log files; console only when absent
    #[arg(long, env = "GWSRV_LOG_DIR")]
    pub log_dir: Option<PathBuf>,

    /// Disable colored output
    #[arg(long)]
    pub no_color: bool,

    /// Validation mode - only validate configuration without starting service
    #[arg(long)]
    pub validate: bool,

    /// Print the effective configuration as YAML and exit
    #[arg(long)]
    pub dump_config: bool,
}

impl Args {
    /// Config source: an explicitly given file must exist
    pub fn config_source(&self) -> ConfigSource {
        match &self.config {
            Some(path) => ConfigSource::new(path, ENV_PREFIX).required(true),
            None => ConfigSource::new(DEFAULT_CONFIG_PATH, ENV_PREFIX),
        }
    }
}

/// Initialize logging system with command-line arguments
pub fn initialize_logging(args: &Args) -> Result<LogGuard> {
    let config = LogConfig {
        service_name: SERVICE_NAME.to_string(),
        log_dir: args.log_dir.clone(),
        level: common::logging::parse_level(&args.log_level),
        ansi: !args.no_color,
    };
    Ok(common::logging::init_with_config(config)?)
}

/// Load and validate the layered configuration
pub fn load_config(source: &ConfigSource) -> Result<GatewayConfig> {
    debug!("Loading configuration from {}", source.file.display());
    let config: GatewayConfig = load_layered(source)?;
    config.validate()?;
    info!(
        "Configuration loaded: {} register ranges, queue capacity {}",
        config.registers.ranges.len(),
        config.queue.capacity
    );
    Ok(config)
}

/// Effective configuration rendered as YAML
pub fn dump_config(config: &GatewayConfig) -> Result<String> {
    serde_yaml::to_string(config).map_err(|e| GwError::config(e.to_string()))
}
