//! Worker configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::ConfigResult;
use crate::validation::{validate_positive, validate_required_string, Validatable};

/// Worker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Coordinator host
    #[serde(default = "default_coordinator_address")]
    pub coordinator_address: String,

    /// Coordinator port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Self-chosen instance id; the coordinator assigns one when absent
    #[serde(default)]
    pub instance_id: Option<u32>,

    /// Bounded wait for coordinator frames. Workers idle between batches,
    /// so this is disabled by default.
    #[serde(with = "crate::domains::utils::serde_duration_option", default)]
    pub receive_timeout: Option<Duration>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            coordinator_address: default_coordinator_address(),
            port: default_port(),
            instance_id: None,
            receive_timeout: None,
        }
    }
}

impl WorkerConfig {
    /// `address:port` of the coordinator
    pub fn coordinator_endpoint(&self) -> String {
        format!("{}:{}", self.coordinator_address, self.port)
    }
}

impl Validatable for WorkerConfig {
    fn validate(&self) -> ConfigResult<()> {
        validate_required_string(&self.coordinator_address, "coordinator_address", self.domain_name())?;
        validate_positive(self.port, "port", self.domain_name())?;
        if let Some(id) = self.instance_id {
            validate_positive(id, "instance_id", self.domain_name())?;
        }
        Ok(())
    }

    fn domain_name(&self) -> &'static str {
        "worker"
    }
}

fn default_coordinator_address() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    10000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_defaults() {
        let config = WorkerConfig::default();
        assert_eq!(config.coordinator_endpoint(), "127.0.0.1:10000");
        assert_eq!(config.instance_id, None);
        assert_eq!(config.receive_timeout, None);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_worker_validation() {
        let mut config = WorkerConfig::default();
        config.instance_id = Some(0);
        assert!(config.validate().is_err());

        let mut config = WorkerConfig::default();
        config.port = 0;
        assert!(config.validate().is_err());
    }
}
