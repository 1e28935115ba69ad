//! Domain-specific configuration modules

pub mod coordinator;
pub mod logging;
pub mod protocol;
pub mod utils;
pub mod worker;

use crate::error::ConfigResult;
use crate::validation::Validatable;
use serde::{Deserialize, Serialize};

/// Main simbatch configuration combining all domains
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct SimbatchConfig {
    /// Coordinator configuration
    #[serde(default)]
    pub coordinator: coordinator::CoordinatorConfig,

    /// Worker configuration
    #[serde(default)]
    pub worker: worker::WorkerConfig,

    /// Wire protocol limits
    #[serde(default)]
    pub protocol: protocol::ProtocolConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: logging::LoggingConfig,
}

impl SimbatchConfig {
    /// Validate all domain configurations
    pub fn validate_all(&self) -> ConfigResult<()> {
        self.coordinator.validate()?;
        self.worker.validate()?;
        self.protocol.validate()?;
        self.logging.validate()?;
        Ok(())
    }

    /// Generate a sample configuration file
    pub fn generate_sample() -> ConfigResult<String> {
        Ok(serde_yaml::to_string(&SimbatchConfig::default())?)
    }
}
