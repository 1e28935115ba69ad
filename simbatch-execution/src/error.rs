//! Error types for batch production

use simbatch_ipc::IpcError;
use thiserror::Error;

/// Errors raised by a simulation environment
#[derive(Error, Debug)]
pub enum EnvironmentError {
    /// Optional hook left unimplemented
    #[error("{0} is not implemented")]
    NotImplemented(&'static str),

    #[error("Prediction requests are not allowed by the coordinator")]
    PredictionsDisabled,

    /// Request sent to the coordinator failed
    #[error("Coordinator link error: {0}")]
    Link(#[from] IpcError),

    #[error(transparent)]
    Domain(#[from] anyhow::Error),
}

/// Sample store errors
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Line {line} not found in partition '{partition}'")]
    MissingLine { partition: String, line: i64 },

    #[error("Store IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Store serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Store lock poisoned")]
    Poisoned,
}

/// Worker client errors
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("IPC error: {0}")]
    Ipc(#[from] IpcError),

    #[error("Environment error: {0}")]
    Environment(#[from] EnvironmentError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Handshake error: {0}")]
    Handshake(String),
}

/// Coordinator errors
#[derive(Error, Debug)]
pub enum CoordinatorError {
    /// Listener-level failure
    #[error("IPC error: {0}")]
    Ipc(#[from] IpcError),

    /// A worker's first frame did not identify it
    #[error("Handshake error: {0}")]
    Handshake(String),

    /// Conversation with one worker failed
    #[error("Client {client_id} failed: {source}")]
    Client {
        client_id: u32,
        #[source]
        source: IpcError,
    },

    /// Conversation ended without an outcome (panic or thread spawn failure)
    #[error("Client {client_id} conversation lost: {reason}")]
    Lost { client_id: u32, reason: String },

    /// Worker answered the shutdown sequence with something other than `exit`
    #[error("Client {client_id} was supposed to exit, sent {received}")]
    ShutdownViolation { client_id: u32, received: String },

    #[error("Two workers claimed instance id {0}")]
    DuplicateClient(u32),

    #[error("Unknown client {0}")]
    UnknownClient(u32),

    #[error("No workers left to schedule")]
    NoWorkers,

    #[error("Invalid coordinator state: {0}")]
    InvalidState(String),
}

impl CoordinatorError {
    /// Client the error is attributed to, if any
    pub fn client_id(&self) -> Option<u32> {
        match self {
            CoordinatorError::Client { client_id, .. }
            | CoordinatorError::Lost { client_id, .. }
            | CoordinatorError::ShutdownViolation { client_id, .. }
            | CoordinatorError::DuplicateClient(client_id)
            | CoordinatorError::UnknownClient(client_id) => Some(*client_id),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_attribution() {
        let err = CoordinatorError::Client {
            client_id: 3,
            source: IpcError::Timeout,
        };
        assert_eq!(err.client_id(), Some(3));
        assert_eq!(err.to_string(), "Client 3 failed: Timeout waiting for response");
        assert_eq!(CoordinatorError::NoWorkers.client_id(), None);
    }

    #[test]
    fn test_environment_error_wraps_domain_errors() {
        let err: EnvironmentError = anyhow::anyhow!("mesh diverged").into();
        assert_eq!(err.to_string(), "mesh diverged");
        let err: WorkerError = err.into();
        assert!(err.to_string().starts_with("Environment error"));
    }
}
