// src/messaging/errors.rs

use std::time::Duration;

use thiserror::Error;

use crate::transport::TransportError;

/// Every failure a [`Messenger`](super::Messenger) operation can report.
#[derive(Debug, Error)]
pub enum MessengerError {
    #[error("transport library initialization failed: {0}")]
    LibraryInit(String),

    #[error("broker connection error: {0}")]
    Connection(String),

    #[error("messenger is already connected")]
    AlreadyConnected,

    #[error("messenger is not connected")]
    NotConnected,

    #[error("invalid destination: {0}")]
    Destination(String),

    #[error("invalid handle: {0}")]
    InvalidHandle(String),

    #[error("message serialization error: {0}")]
    Serialization(String),

    #[error("broker transport error: {0}")]
    Transport(String),

    #[error("no message received within {0:?}")]
    Timeout(Duration),

    #[error("unknown error: {0}")]
    Unknown(String),
}

pub type Result<T> = std::result::Result<T, MessengerError>;

impl MessengerError {
    /// Translates a fault raised while establishing the connection or session.
    pub(crate) fn from_connect(error: TransportError) -> Self {
        match error {
            TransportError::Unreachable(detail)
            | TransportError::InvalidAddress(detail)
            | TransportError::Rejected(detail)
            | TransportError::Closed(detail) => MessengerError::Connection(detail),
            TransportError::LibraryInit(detail) => MessengerError::LibraryInit(detail),
            other => other.into(),
        }
    }

    /// Translates a fault raised while attaching a producer or consumer.
    pub(crate) fn from_attach(error: TransportError) -> Self {
        match error {
            TransportError::InvalidDestination(detail) | TransportError::Rejected(detail) => {
                MessengerError::Destination(detail)
            }
            other => other.into(),
        }
    }
}

// Default translation for faults raised during message operations
impl From<TransportError> for MessengerError {
    fn from(error: TransportError) -> Self {
        match error {
            TransportError::Unreachable(detail)
            | TransportError::Rejected(detail)
            | TransportError::Closed(detail) => MessengerError::Transport(detail),
            TransportError::InvalidAddress(detail) => MessengerError::Connection(detail),
            TransportError::LibraryInit(detail) => MessengerError::LibraryInit(detail),
            TransportError::InvalidDestination(detail) => MessengerError::Destination(detail),
            TransportError::Codec(detail) => MessengerError::Serialization(detail),
            TransportError::Other(detail) => MessengerError::Unknown(detail),
        }
    }
}

impl From<serde_json::Error> for MessengerError {
    fn from(error: serde_json::Error) -> Self {
        MessengerError::Serialization(error.to_string())
    }
}
