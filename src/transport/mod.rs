// src/transport/mod.rs
// The seam between the messenger and a concrete broker client library.
// Everything below these traits may fail with TransportError; nothing above
// them ever sees a raw library error.

pub mod amqp;
pub mod errors;
pub mod frame;
pub mod library;
pub mod mock;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use url::Url;

pub use errors::{TransportError, TransportResult};
pub use frame::Frame;
pub use library::LibraryGuard;

use crate::properties::{ConnectionOptions, DestinationOptions};

/// A validated broker URI such as `amqp://user:pw@host:5672/%2f` or `mock://broker`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerAddress {
    url: Url,
}

impl BrokerAddress {
    pub fn parse(address: &str) -> TransportResult<Self> {
        let url = Url::parse(address.trim())
            .map_err(|e| TransportError::InvalidAddress(format!("'{}': {}", address, e)))?;
        if url.host_str().map_or(true, str::is_empty) {
            return Err(TransportError::InvalidAddress(format!(
                "'{}' has no broker host",
                address
            )));
        }
        Ok(Self { url })
    }

    pub fn scheme(&self) -> &str {
        self.url.scheme()
    }

    pub fn host(&self) -> &str {
        self.url.host_str().unwrap_or_default()
    }

    pub fn as_str(&self) -> &str {
        self.url.as_str()
    }

    /// The address with any password masked, for logging.
    pub fn redacted(&self) -> String {
        let mut url = self.url.clone();
        if url.password().is_some() {
            let _ = url.set_password(Some("****"));
        }
        url.to_string()
    }
}

impl fmt::Display for BrokerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.redacted())
    }
}

/// Identifies a producer or consumer inside one transport session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EndpointId(pub u64);

/// Entry point of a transport library.
#[async_trait]
pub trait TransportConnector: Send + Sync {
    /// Key under which this library's process-wide state is reference counted.
    fn library_key(&self) -> String;

    /// One-time, process-wide library setup.
    fn initialize_library(&self) -> TransportResult<()> {
        Ok(())
    }

    /// Matching teardown, run when the last user releases the library.
    fn shutdown_library(&self) {}

    async fn connect(
        &self,
        address: &BrokerAddress,
        options: &ConnectionOptions,
    ) -> TransportResult<Box<dyn TransportConnection>>;
}

#[async_trait]
pub trait TransportConnection: Send + Sync {
    /// Begins message delivery on this connection.
    async fn start(&mut self) -> TransportResult<()>;

    async fn create_session(&mut self, transacted: bool) -> TransportResult<Box<dyn TransportSession>>;

    /// Suspends message delivery.
    async fn stop(&mut self) -> TransportResult<()>;

    async fn close(&mut self, timeout: Duration) -> TransportResult<()>;
}

/// A broker session. Implementations are used by one task at a time.
#[async_trait]
pub trait TransportSession: Send {
    async fn create_producer(
        &mut self,
        destination: &str,
        options: &DestinationOptions,
    ) -> TransportResult<EndpointId>;

    async fn create_consumer(
        &mut self,
        destination: &str,
        options: &DestinationOptions,
    ) -> TransportResult<EndpointId>;

    async fn send(&mut self, producer: EndpointId, frame: Frame) -> TransportResult<()>;

    /// Waits for the next frame. Must be cancel-safe: dropping the future
    /// before it resolves consumes nothing.
    async fn receive(&mut self, consumer: EndpointId) -> TransportResult<Frame>;

    async fn commit(&mut self) -> TransportResult<()>;

    async fn rollback(&mut self) -> TransportResult<()>;

    async fn close_producer(&mut self, producer: EndpointId) -> TransportResult<()>;

    async fn close_consumer(&mut self, consumer: EndpointId) -> TransportResult<()>;

    /// Closes the session; uncommitted work is discarded by the broker.
    async fn close(&mut self) -> TransportResult<()>;
}

/// Picks the transport for an address by its URI scheme.
///
/// `mock://` addresses get a fresh in-process broker.
pub fn connector_for(address: &str) -> TransportResult<Arc<dyn TransportConnector>> {
    let address = BrokerAddress::parse(address)?;
    match address.scheme() {
        "amqp" | "amqps" => Ok(Arc::new(amqp::AmqpConnector::new())),
        "mock" => Ok(Arc::new(mock::MockBroker::new().connector())),
        other => Err(TransportError::InvalidAddress(format!(
            "no transport for scheme '{}'",
            other
        ))),
    }
}
