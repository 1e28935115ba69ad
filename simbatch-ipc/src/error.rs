//! IPC error types

use std::io::ErrorKind;
use thiserror::Error;

use crate::codec::{DecodeError, EncodeError};

/// IPC error types
#[derive(Debug, Error)]
pub enum IpcError {
    /// Outgoing value could not be encoded
    #[error("Encode error: {0}")]
    Encode(#[from] EncodeError),

    /// Incoming frame was malformed
    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    /// IO error
    #[error("IO error: {0}")]
    Io(String),

    /// Peer closed the connection
    #[error("Connection closed")]
    ConnectionClosed,

    /// Timeout waiting for a frame
    #[error("Timeout waiting for response")]
    Timeout,

    /// A frame arrived that the current exchange does not allow
    #[error("Unexpected message: expected {expected}, received {received}")]
    UnexpectedMessage { expected: String, received: String },

    /// The exchange broke a protocol rule
    #[error("Protocol violation: {0}")]
    Protocol(String),

    /// A collaborator invoked on behalf of the peer failed
    #[error("Collaborator error: {0:#}")]
    External(#[source] anyhow::Error),
}

impl IpcError {
    pub fn unexpected(expected: impl Into<String>, received: impl Into<String>) -> Self {
        IpcError::UnexpectedMessage {
            expected: expected.into(),
            received: received.into(),
        }
    }

    /// Socket-level failure: closed, reset or timed out
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            IpcError::Io(_) | IpcError::ConnectionClosed | IpcError::Timeout
        )
    }

    /// Malformed or unsupported value
    pub fn is_codec(&self) -> bool {
        matches!(self, IpcError::Encode(_) | IpcError::Decode(_))
    }

    /// Unexpected token or broken exchange
    pub fn is_protocol(&self) -> bool {
        matches!(
            self,
            IpcError::UnexpectedMessage { .. }
                | IpcError::Protocol(_)
                | IpcError::Decode(DecodeError::UnknownCommand(_))
        )
    }
}

impl From<std::io::Error> for IpcError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            ErrorKind::UnexpectedEof
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe => IpcError::ConnectionClosed,
            ErrorKind::TimedOut | ErrorKind::WouldBlock => IpcError::Timeout,
            _ => IpcError::Io(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert!(IpcError::Io("network error".to_string()).is_transport());
        assert!(IpcError::Timeout.is_transport());
        assert!(IpcError::ConnectionClosed.is_transport());
        assert!(!IpcError::Protocol("bad reply".to_string()).is_transport());

        assert!(IpcError::from(DecodeError::EmptyFrame).is_codec());
        assert!(IpcError::from(DecodeError::UnknownCommand("halt".into())).is_protocol());
        assert!(IpcError::unexpected("command", "int value").is_protocol());
        assert!(!IpcError::Timeout.is_protocol());
    }

    #[test]
    fn test_io_error_mapping() {
        let eof = std::io::Error::new(ErrorKind::UnexpectedEof, "eof");
        assert!(matches!(IpcError::from(eof), IpcError::ConnectionClosed));

        let timeout = std::io::Error::new(ErrorKind::WouldBlock, "would block");
        assert!(matches!(IpcError::from(timeout), IpcError::Timeout));

        let other = std::io::Error::new(ErrorKind::PermissionDenied, "denied");
        assert!(matches!(IpcError::from(other), IpcError::Io(_)));
    }

    #[test]
    fn test_external_error_keeps_context() {
        let err = IpcError::External(anyhow::anyhow!("model not loaded").context("prediction"));
        assert_eq!(err.to_string(), "Collaborator error: prediction: model not loaded");
    }
}
