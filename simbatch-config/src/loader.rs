//! Configuration loading and environment variable handling

use std::path::Path;
use std::str::FromStr;

use crate::domains::coordinator::{ConcurrencyModel, CoordinatorConfig, RoundFailurePolicy};
use crate::domains::logging::{LogFormat, LogLevel, LoggingConfig};
use crate::domains::protocol::ProtocolConfig;
use crate::domains::utils::parse_optional_seconds;
use crate::domains::worker::WorkerConfig;
use crate::domains::SimbatchConfig;
use crate::error::{ConfigError, ConfigResult};

/// Configuration loader with environment variable support
pub struct ConfigLoader {
    /// Environment variable prefix
    prefix: String,
}

impl ConfigLoader {
    /// Create a new config loader with default prefix
    pub fn new() -> Self {
        Self {
            prefix: "SIMBATCH".to_string(),
        }
    }

    /// Create a new config loader with custom prefix
    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// Load configuration from a YAML file with environment overrides
    pub fn from_file(&self, path: impl AsRef<Path>) -> ConfigResult<SimbatchConfig> {
        let content = std::fs::read_to_string(path)?;
        let mut config: SimbatchConfig = serde_yaml::from_str(&content)?;

        // Apply environment variable overrides
        self.apply_env_overrides(&mut config)?;

        // Validate all domains
        config.validate_all()?;

        Ok(config)
    }

    /// Load configuration from environment variables only
    pub fn from_env(&self) -> ConfigResult<SimbatchConfig> {
        let mut config = SimbatchConfig::default();
        self.apply_env_overrides(&mut config)?;
        config.validate_all()?;
        Ok(config)
    }

    /// Load configuration with fallback chain
    pub fn load(&self, config_path: Option<impl AsRef<Path>>) -> ConfigResult<SimbatchConfig> {
        match config_path {
            Some(path) => self.from_file(path),
            None => self.from_env(),
        }
    }

    /// Apply environment variable overrides to configuration
    fn apply_env_overrides(&self, config: &mut SimbatchConfig) -> ConfigResult<()> {
        self.apply_coordinator_overrides(&mut config.coordinator)?;
        self.apply_worker_overrides(&mut config.worker)?;
        self.apply_protocol_overrides(&mut config.protocol)?;
        self.apply_logging_overrides(&mut config.logging)?;
        Ok(())
    }

    /// Apply coordinator config overrides
    fn apply_coordinator_overrides(&self, config: &mut CoordinatorConfig) -> ConfigResult<()> {
        if let Ok(address) = self.get_env_var("COORDINATOR_BIND_ADDRESS") {
            config.bind_address = address;
        }

        if let Some(port) = self.parse_env_var("COORDINATOR_PORT")? {
            config.port = port;
        }

        if let Some(nb_client) = self.parse_env_var("COORDINATOR_NB_CLIENT")? {
            config.nb_client = nb_client;
        }

        if let Some(batch_size) = self.parse_env_var("COORDINATOR_BATCH_SIZE")? {
            config.batch_size = batch_size;
        }

        if let Some(steps) = self.parse_env_var("COORDINATOR_SIMULATIONS_PER_STEP")? {
            config.simulations_per_step = steps;
        }

        if let Ok(timeout) = self.get_env_var("COORDINATOR_RECEIVE_TIMEOUT") {
            config.receive_timeout = parse_optional_seconds(&timeout).map_err(|e| {
                ConfigError::EnvError(format!("Invalid COORDINATOR_RECEIVE_TIMEOUT: {}", e))
            })?;
        }

        if let Ok(policy) = self.get_env_var("COORDINATOR_ROUND_FAILURE_POLICY") {
            config.round_failure_policy = RoundFailurePolicy::from_str(&policy)
                .map_err(|e| ConfigError::EnvError(format!("Invalid COORDINATOR_ROUND_FAILURE_POLICY: {}", e)))?;
        }

        if let Ok(model) = self.get_env_var("COORDINATOR_CONCURRENCY") {
            config.concurrency = ConcurrencyModel::from_str(&model)
                .map_err(|e| ConfigError::EnvError(format!("Invalid COORDINATOR_CONCURRENCY: {}", e)))?;
        }

        if let Ok(location) = self.get_env_var("STORE_LOCATION") {
            config.store_location = Some(location.into());
        }

        Ok(())
    }

    /// Apply worker config overrides
    fn apply_worker_overrides(&self, config: &mut WorkerConfig) -> ConfigResult<()> {
        if let Ok(address) = self.get_env_var("WORKER_COORDINATOR_ADDRESS") {
            config.coordinator_address = address;
        }

        if let Some(port) = self.parse_env_var("WORKER_PORT")? {
            config.port = port;
        }

        if let Some(id) = self.parse_env_var("WORKER_INSTANCE_ID")? {
            config.instance_id = Some(id);
        }

        if let Ok(timeout) = self.get_env_var("WORKER_RECEIVE_TIMEOUT") {
            config.receive_timeout = parse_optional_seconds(&timeout).map_err(|e| {
                ConfigError::EnvError(format!("Invalid WORKER_RECEIVE_TIMEOUT: {}", e))
            })?;
        }

        Ok(())
    }

    /// Apply protocol config overrides
    fn apply_protocol_overrides(&self, config: &mut ProtocolConfig) -> ConfigResult<()> {
        if let Some(max_frame_bytes) = self.parse_env_var("MAX_FRAME_BYTES")? {
            config.max_frame_bytes = max_frame_bytes;
        }
        Ok(())
    }

    /// Apply logging config overrides
    fn apply_logging_overrides(&self, config: &mut LoggingConfig) -> ConfigResult<()> {
        if let Ok(log_level) = self.get_env_var("LOG_LEVEL") {
            config.level = LogLevel::from_str(&log_level)
                .map_err(|_| ConfigError::EnvError(format!("Invalid LOG_LEVEL: {}", log_level)))?;
        }

        if let Ok(format) = self.get_env_var("LOG_FORMAT") {
            config.format = LogFormat::from_str(&format)
                .map_err(|_| ConfigError::EnvError(format!("Invalid LOG_FORMAT: {}", format)))?;
        }

        Ok(())
    }

    /// Parse an optional prefixed variable
    fn parse_env_var<T>(&self, name: &str) -> ConfigResult<Option<T>>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.get_env_var(name) {
            Ok(raw) => raw
                .parse()
                .map(Some)
                .map_err(|e| ConfigError::EnvError(format!("Invalid {}: {}", name, e))),
            Err(_) => Ok(None),
        }
    }

    /// Get environment variable with prefix
    fn get_env_var(&self, name: &str) -> Result<String, std::env::VarError> {
        std::env::var(format!("{}_{}", self.prefix, name))
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}
