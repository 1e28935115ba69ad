//! Batch production over the simbatch protocol
//!
//! This crate provides the worker client, which drives one simulation
//! environment on behalf of a coordinator, and the coordinator, which accepts
//! N workers and assembles batches of sample references from them. Both run
//! over either cooperative tokio tasks or one OS thread per conversation.

pub mod coordinator;
pub mod environment;
pub mod error;
pub mod runner;
pub mod services;
pub mod store;
pub mod worker;

// Re-export commonly used types
pub use coordinator::{
    Batch, BlockingCoordinator, ClientSlot, Coordinator, CoordinatorHandler, CoordinatorState,
    TaskCoordinator, ThreadCoordinator,
};
pub use environment::{CoordinatorLink, Environment, StepContext};
pub use error::{CoordinatorError, EnvironmentError, StoreError, WorkerError};
pub use runner::{Conversation, ConversationOutcome, RoundAction, RoundRunner, TaskRunner, ThreadRunner};
pub use services::{CoordinatorServices, PredictionService, VisualizationSink};
pub use store::{JsonDirStore, MemoryStore, SampleStore};
pub use worker::{StopHandle, WorkerClient, WorkerSettings, WorkerState};

use simbatch_config::ProtocolConfig;
use simbatch_ipc::FrameLimits;

/// Frame limits described by the protocol configuration
pub fn frame_limits(protocol: &ProtocolConfig) -> FrameLimits {
    FrameLimits {
        max_frame_bytes: protocol.max_frame_bytes,
        max_parts: protocol.max_parts,
        max_depth: protocol.max_list_depth,
    }
}
