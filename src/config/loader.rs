//! Configuration Loader
//!
//! Layered loading with the `config` crate, later layers winning:
//!
//! 1. built-in defaults ([`DispatchConfig::default`])
//! 2. TOML file: `DISPATCH_CONFIG_PATH`, else `config/dispatch.toml` if present
//! 3. environment: `DISPATCH__RABBITMQ__URL`, `DISPATCH__RECONCILIATION__BATCH_SIZE`, ...
//!
//! A `.env` file in the working directory is loaded first with `dotenvy`.

use std::path::{Path, PathBuf};

use config::{Config, Environment, File, FileFormat};
use tracing::{debug, info};

use super::error::{ConfigResult, ConfigurationError};
use super::DispatchConfig;

pub const CONFIG_PATH_ENV: &str = "DISPATCH_CONFIG_PATH";
pub const DEFAULT_CONFIG_PATH: &str = "config/dispatch.toml";
pub const ENV_PREFIX: &str = "DISPATCH";
const ENV_SEPARATOR: &str = "__";

#[derive(Debug, Clone, Default)]
pub struct ConfigLoader {
    file: Option<PathBuf>,
    file_required: bool,
    env_source: Option<config::Map<String, String>>,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load `path`; fails if it does not exist
    pub fn with_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.file = Some(path.into());
        self.file_required = true;
        self
    }

    /// Load `path` only if it exists
    pub fn with_optional_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.file = Some(path.into());
        self.file_required = false;
        self
    }

    /// Read overrides from `vars` instead of the process environment
    pub fn with_env_source(mut self, vars: config::Map<String, String>) -> Self {
        self.env_source = Some(vars);
        self
    }

    pub fn load(&self) -> ConfigResult<DispatchConfig> {
        let mut builder = Config::builder().add_source(Config::try_from(&DispatchConfig::default())?);

        if let Some(path) = &self.file {
            if self.file_required && !path.exists() {
                return Err(ConfigurationError::ConfigFileNotFound { path: path.clone() });
            }
            debug!(path = %path.display(), "Adding configuration file");
            builder = builder.add_source(
                File::from(path.as_path())
                    .format(FileFormat::Toml)
                    .required(self.file_required),
            );
        }

        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator(ENV_SEPARATOR)
                .separator(ENV_SEPARATOR)
                .try_parsing(true)
                .source(self.env_source.clone()),
        );

        let config: DispatchConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }
}

/// Load configuration for the running process
pub fn load_config() -> ConfigResult<DispatchConfig> {
    if let Ok(path) = dotenvy::dotenv() {
        debug!(path = %path.display(), "Loaded .env file");
    }

    let loader = match std::env::var(CONFIG_PATH_ENV) {
        Ok(path) => ConfigLoader::new().with_file(path),
        Err(_) => ConfigLoader::new().with_optional_file(Path::new(DEFAULT_CONFIG_PATH)),
    };
    let config = loader.load()?;

    let redacted = config.redacted();
    info!(
        database_url = %redacted.database.url,
        rabbitmq_url = %redacted.rabbitmq.url,
        exchange = %config.rabbitmq.exchange,
        queue = %config.rabbitmq.queue,
        "Configuration loaded"
    );
    Ok(config)
}
