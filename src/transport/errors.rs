// src/transport/errors.rs

use thiserror::Error;

/// Faults raised by a transport implementation.
///
/// These never leave the crate: the messenger translates them into
/// [`MessengerError`](crate::messaging::MessengerError) with the context of the
/// operation that hit them.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("broker unreachable: {0}")]
    Unreachable(String),

    #[error("invalid broker address: {0}")]
    InvalidAddress(String),

    #[error("transport library failed to initialize: {0}")]
    LibraryInit(String),

    #[error("invalid destination: {0}")]
    InvalidDestination(String),

    #[error("rejected by broker: {0}")]
    Rejected(String),

    #[error("transport endpoint closed: {0}")]
    Closed(String),

    #[error("frame codec error: {0}")]
    Codec(String),

    #[error("{0}")]
    Other(String),
}

pub type TransportResult<T> = std::result::Result<T, TransportError>;

impl From<serde_json::Error> for TransportError {
    fn from(error: serde_json::Error) -> Self {
        TransportError::Codec(error.to_string())
    }
}

impl From<lapin::Error> for TransportError {
    fn from(error: lapin::Error) -> Self {
        match &error {
            lapin::Error::IOError(_) => TransportError::Unreachable(error.to_string()),
            lapin::Error::InvalidChannelState(_) | lapin::Error::InvalidConnectionState(_) => {
                TransportError::Closed(error.to_string())
            }
            lapin::Error::ProtocolError(_) => TransportError::Rejected(error.to_string()),
            _ => TransportError::Other(error.to_string()),
        }
    }
}
