//! Domain-driven configuration for simbatch
//!
//! Configuration is split by concern (coordinator, worker, protocol,
//! logging), loaded from YAML and overridden from `SIMBATCH_*` environment
//! variables.

pub mod error;
pub mod loader;
pub mod validation;

// Domain-specific configuration modules
pub mod domains;

// Re-export main types
pub use error::{ConfigError, ConfigResult};
pub use loader::ConfigLoader;

// Re-export domain configurations
pub use domains::{
    coordinator::{ConcurrencyModel, CoordinatorConfig, RoundFailurePolicy},
    logging::{LogFormat, LogLevel, LoggingConfig},
    protocol::ProtocolConfig,
    worker::WorkerConfig,
    SimbatchConfig,
};

// Re-export utilities
pub use domains::utils::{serde_duration, serde_duration_option};
