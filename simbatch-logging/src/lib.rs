//! Logging setup for simbatch
//!
//! Libraries emit through `tracing` (and `log` in the wire crate, bridged by
//! the subscriber); binaries install a subscriber once with the helpers here.

pub mod init;

pub use init::{build_env_filter, init_logging_from_config, init_simple_tracing, init_worker_tracing};
