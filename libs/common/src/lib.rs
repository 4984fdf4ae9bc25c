//! Shared service library
//!
//! Provides the plumbing every gateway service needs before it can do real work:
//! - logging initialisation (console + daily rolling file)
//! - layered configuration loading (defaults, YAML file, environment)

pub mod config_loader;
pub mod error;
pub mod logging;

pub use config_loader::{load_layered, ConfigSource};
pub use error::{CommonError, Result};
pub use logging::{LogConfig, LogGuard};
