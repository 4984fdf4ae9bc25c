//! Layered configuration loading
//!
//! Priority (highest to lowest):
//! 1. Environment variables (prefixed, `__` separates nested keys)
//! 2. YAML configuration file
//! 3. Built-in defaults of the target type

use std::path::{Path, PathBuf};

use figment::{
    providers::{Env, Format, Serialized, Yaml},
    Figment,
};
use serde::{de::DeserializeOwned, Serialize};
use tracing::{debug, info};

use crate::error::{CommonError, Result};

/// Where a service looks for its configuration
#[derive(Debug, Clone)]
pub struct ConfigSource {
    /// YAML file path
    pub file: PathBuf,
    /// Fail when the file does not exist (set when the path was given explicitly)
    pub required: bool,
    /// Environment variable prefix, e.g. `GWSRV_`
    pub env_prefix: String,
}

impl ConfigSource {
    pub fn new(file: impl Into<PathBuf>, env_prefix: impl Into<String>) -> Self {
        Self {
            file: file.into(),
            required: false,
            env_prefix: env_prefix.into(),
        }
    }

    /// Mark the file as mandatory
    pub fn required(mut self, required: bool) -> Self {
        self.required = required;
        self
    }
}

/// Build the figment for a source without extracting it
pub fn figment_for<T>(source: &ConfigSource) -> Result<Figment>
where
    T: Serialize + Default,
{
    let path: &Path = source.file.as_path();
    if !path.exists() {
        if source.required {
            return Err(CommonError::Config(format!(
                "Configuration file not found: {}",
                path.display()
            )));
        }
        debug!("Config file {} not present, using defaults", path.display());
    }

    Ok(Figment::from(Serialized::defaults(T::default()))
        .merge(Yaml::file(path))
        .merge(Env::prefixed(&source.env_prefix).split("__")))
}

/// Load configuration from defaults, the YAML file and the environment
pub fn load_layered<T>(source: &ConfigSource) -> Result<T>
where
    T: Serialize + DeserializeOwned + Default,
{
    let config = figment_for::<T>(source)?
        .extract()
        .map_err(|e| CommonError::Config(format!("Failed to load configuration: {}", e)))?;
    info!(
        "Configuration loaded (file: {}, env prefix: {})",
        source.file.display(),
        source.env_prefix
    );
    Ok(config)
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use serde::Deserialize;
    use std::io::Write;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Sample {
        name: String,
        port: u16,
        nested: Nested,
    }

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Nested {
        interval_ms: u64,
    }

    impl Default for Sample {
        fn default() -> Self {
            Self {
                name: "default".to_string(),
                port: 502,
                nested: Nested { interval_ms: 1000 },
            }
        }
    }

    #[test]
    fn test_missing_optional_file_uses_defaults() {
        let source = ConfigSource::new("/nonexistent/sample.yaml", "COMMON_TEST_NONE_");
        let loaded: Sample = load_layered(&source).unwrap();
        assert_eq!(loaded, Sample::default());
    }

    #[test]
    fn test_missing_required_file_fails() {
        let source =
            ConfigSource::new("/nonexistent/sample.yaml", "COMMON_TEST_REQ_").required(true);
        let err = load_layered::<Sample>(&source).unwrap_err();
        assert!(err.to_string().contains("not found"));
    }

    #[test]
    fn test_yaml_overrides_defaults() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(file, "port: 1502\nnested:\n  interval_ms: 250").unwrap();

        let source = ConfigSource::new(file.path(), "COMMON_TEST_YAML_");
        let loaded: Sample = load_layered(&source).unwrap();
        assert_eq!(loaded.name, "default");
        assert_eq!(loaded.port, 1502);
        assert_eq!(loaded.nested.interval_ms, 250);
    }

    #[test]
    fn test_env_overrides_yaml() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(file, "port: 1502").unwrap();
        std::env::set_var("COMMON_TEST_ENV_PORT", "2502");
        std::env::set_var("COMMON_TEST_ENV_NESTED__INTERVAL_MS", "50");

        let source = ConfigSource::new(file.path(), "COMMON_TEST_ENV_");
        let loaded: Sample = load_layered(&source).unwrap();
        assert_eq!(loaded.port, 2502);
        assert_eq!(loaded.nested.interval_ms, 50);

        std::env::remove_var("COMMON_TEST_ENV_PORT");
        std::env::remove_var("COMMON_TEST_ENV_NESTED__INTERVAL_MS");
    }
}
