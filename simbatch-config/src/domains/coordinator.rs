//! Coordinator configuration

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigResult;
use crate::validation::{validate_positive, validate_required_string, Validatable};

/// Coordinator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Address the coordinator listens on
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    /// Listening port, 0 picks an ephemeral port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Number of workers to accept
    #[serde(default = "default_nb_client")]
    pub nb_client: usize,

    /// Upper bound on `nb_client`
    #[serde(default = "default_max_client_count")]
    pub max_client_count: usize,

    /// Sample references per batch
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Simulation sub-steps per produced sample
    #[serde(default = "default_simulations_per_step")]
    pub simulations_per_step: u32,

    /// Whether workers may request predictions while stepping
    #[serde(default = "crate::domains::utils::default_false")]
    pub allow_prediction_requests: bool,

    /// Sample store location pushed to workers
    #[serde(default)]
    pub store_location: Option<PathBuf>,

    /// Store partition workers synchronize to after the handshake
    #[serde(default = "default_store_partition")]
    pub store_partition: String,

    /// Bounded wait for every frame from a worker
    #[serde(
        with = "crate::domains::utils::serde_duration_option",
        default = "default_receive_timeout"
    )]
    pub receive_timeout: Option<Duration>,

    /// What a failing worker does to the round
    #[serde(default)]
    pub round_failure_policy: RoundFailurePolicy,

    /// Execution model for per-worker conversations
    #[serde(default)]
    pub concurrency: ConcurrencyModel,

    /// Parameters forwarded to every worker's environment
    #[serde(default = "default_environment_parameters")]
    pub environment_parameters: JsonValue,
}

/// Outcome of a worker failure during a round
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoundFailurePolicy {
    /// Finish the round, drop the worker, fail the batch
    #[default]
    Abort,
    /// Drop the worker and keep filling the batch with the others
    Skip,
}

/// Execution model for per-worker conversations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConcurrencyModel {
    /// Cooperative tasks on the tokio runtime
    #[default]
    Tasks,
    /// One OS thread per conversation with blocking sockets
    Threads,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_port(),
            nb_client: default_nb_client(),
            max_client_count: default_max_client_count(),
            batch_size: default_batch_size(),
            simulations_per_step: default_simulations_per_step(),
            allow_prediction_requests: false,
            store_location: None,
            store_partition: default_store_partition(),
            receive_timeout: default_receive_timeout(),
            round_failure_policy: RoundFailurePolicy::default(),
            concurrency: ConcurrencyModel::default(),
            environment_parameters: default_environment_parameters(),
        }
    }
}

impl CoordinatorConfig {
    /// Workers actually accepted: `min(nb_client, max_client_count)`
    pub fn client_count(&self) -> usize {
        self.nb_client.min(self.max_client_count)
    }

    /// `address:port` to bind
    pub fn listen_address(&self) -> String {
        format!("{}:{}", self.bind_address, self.port)
    }
}

impl FromStr for RoundFailurePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "abort" => Ok(RoundFailurePolicy::Abort),
            "skip" => Ok(RoundFailurePolicy::Skip),
            _ => Err(format!("Invalid round failure policy: {}", s)),
        }
    }
}

impl FromStr for ConcurrencyModel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "tasks" | "async" => Ok(ConcurrencyModel::Tasks),
            "threads" | "threaded" => Ok(ConcurrencyModel::Threads),
            _ => Err(format!("Invalid concurrency model: {}", s)),
        }
    }
}

impl Validatable for CoordinatorConfig {
    fn validate(&self) -> ConfigResult<()> {
        validate_required_string(&self.bind_address, "bind_address", self.domain_name())?;
        validate_positive(self.nb_client, "nb_client", self.domain_name())?;
        validate_positive(self.max_client_count, "max_client_count", self.domain_name())?;
        validate_positive(self.batch_size, "batch_size", self.domain_name())?;
        validate_positive(self.simulations_per_step, "simulations_per_step", self.domain_name())?;
        validate_required_string(&self.store_partition, "store_partition", self.domain_name())?;

        if !self.environment_parameters.is_object() {
            return Err(self.validation_error("environment_parameters must be a mapping"));
        }

        if self.nb_client > self.max_client_count {
            log::warn!(
                "nb_client {} exceeds max_client_count {}; only {} workers will be accepted",
                self.nb_client,
                self.max_client_count,
                self.client_count()
            );
        }

        Ok(())
    }

    fn domain_name(&self) -> &'static str {
        "coordinator"
    }
}

// Default value functions
fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    10000
}

fn default_nb_client() -> usize {
    5
}

fn default_max_client_count() -> usize {
    10
}

fn default_batch_size() -> usize {
    10
}

fn default_simulations_per_step() -> u32 {
    1
}

fn default_store_partition() -> String {
    "training".to_string()
}

fn default_receive_timeout() -> Option<Duration> {
    Some(Duration::from_secs(300)) // 5 minutes
}

fn default_environment_parameters() -> JsonValue {
    JsonValue::Object(Default::default())
}
