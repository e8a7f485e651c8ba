// src/messaging/connection.rs
// Owns the single broker connection and its single transacted session

use std::sync::Arc;
use std::time::Duration;

use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use super::errors::{MessengerError, Result};
use super::session::TransactedSession;
use crate::properties::{ConnectionOptions, Properties};
use crate::transport::{
    BrokerAddress, EndpointId, LibraryGuard, TransportConnection, TransportConnector, TransportError,
};

const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connected,
    Started,
    ShuttingDown,
}

pub struct ConnectionManager {
    connector: Arc<dyn TransportConnector>,
    state: ConnectionState,
    address: Option<BrokerAddress>,
    properties: Properties,
    options: ConnectionOptions,
    connection: Option<Box<dyn TransportConnection>>,
    session: Option<Arc<TransactedSession>>,
    library: Option<LibraryGuard>,
}

impl ConnectionManager {
    pub fn new(connector: Arc<dyn TransportConnector>) -> Self {
        ConnectionManager {
            connector,
            state: ConnectionState::Disconnected,
            address: None,
            properties: Properties::default(),
            options: ConnectionOptions::default(),
            connection: None,
            session: None,
            library: None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn address(&self) -> Option<&BrokerAddress> {
        self.address.as_ref()
    }

    /// Properties given to `connect`; senders and receivers inherit them.
    pub fn properties(&self) -> &Properties {
        &self.properties
    }

    pub fn options(&self) -> &ConnectionOptions {
        &self.options
    }

    /// The shared session, while the connection is started.
    pub fn session(&self) -> Result<Arc<TransactedSession>> {
        match (&self.state, &self.session) {
            (ConnectionState::Started, Some(session)) => Ok(session.clone()),
            _ => Err(MessengerError::NotConnected),
        }
    }

    /// Opens the connection and its transacted session. On failure nothing
    /// stays open and the manager is back to `Disconnected`.
    pub async fn connect(&mut self, broker_address: &str, properties: &Properties) -> Result<()> {
        if self.state != ConnectionState::Disconnected {
            return Err(MessengerError::AlreadyConnected);
        }

        let address = BrokerAddress::parse(broker_address).map_err(MessengerError::from_connect)?;
        let options = ConnectionOptions::from_properties(properties);
        let library = LibraryGuard::acquire(self.connector.clone()).map_err(MessengerError::from_connect)?;

        let mut connection = self.establish_connection(&address, &options).await?;
        self.state = ConnectionState::Connected;

        match Self::open_session(connection.as_mut(), &options).await {
            Ok(session) => {
                info!(broker = %address, commit_mode = ?options.commit_mode, "Messenger connection started");
                self.state = ConnectionState::Started;
                self.address = Some(address);
                self.properties = properties.clone();
                self.options = options;
                self.connection = Some(connection);
                self.session = Some(Arc::new(session));
                self.library = Some(library);
                Ok(())
            }
            Err(fault) => {
                error!(broker = %address, error = %fault, "Failed to open session, closing connection");
                if let Err(close_fault) = connection.close(options.close_timeout).await {
                    warn!(error = %close_fault, "Connection close after failed session also failed");
                }
                self.state = ConnectionState::Disconnected;
                drop(library);
                Err(MessengerError::from_connect(fault))
            }
        }
    }

    async fn open_session(
        connection: &mut dyn TransportConnection,
        options: &ConnectionOptions,
    ) -> std::result::Result<TransactedSession, TransportError> {
        connection.start().await?;
        let transport = connection.create_session(true).await?;
        Ok(TransactedSession::new(transport, options.commit_mode))
    }

    async fn establish_connection(
        &self,
        address: &BrokerAddress,
        options: &ConnectionOptions,
    ) -> Result<Box<dyn TransportConnection>> {
        let mut attempts = 0;
        let mut delay = options.connect_retry_delay;

        loop {
            attempts += 1;
            info!("Attempting to connect to broker at {}", address);

            match self.connector.connect(address, options).await {
                Ok(connection) => {
                    debug!(attempts, "Connected to broker");
                    return Ok(connection);
                }
                Err(TransportError::Unreachable(detail)) if attempts < options.connect_attempts => {
                    error!(
                        "Failed to connect to broker (attempt {}/{}): {}",
                        attempts, options.connect_attempts, detail
                    );

                    // Exponential backoff with jitter
                    let jitter = (rand::random::<f64>() * 0.3 - 0.15) * delay.as_secs_f64();
                    let sleep_time = Duration::from_secs_f64((delay.as_secs_f64() + jitter).max(0.0));
                    info!("Waiting {:?} before next connect attempt", sleep_time);
                    sleep(sleep_time).await;

                    delay = std::cmp::min(delay * 2, MAX_RECONNECT_DELAY);
                }
                Err(fault) => {
                    error!(attempts, error = %fault, "Giving up on broker connection");
                    return Err(MessengerError::from_connect(fault));
                }
            }
        }
    }

    /// Tears everything down: pending work is resolved, the listed producers
    /// and consumers are closed, then the session and the connection. Every
    /// step is attempted; the first failure is returned.
    pub async fn shutdown(&mut self, producers: &[EndpointId], consumers: &[EndpointId]) -> Result<()> {
        if self.state != ConnectionState::Started {
            return Err(MessengerError::NotConnected);
        }
        self.state = ConnectionState::ShuttingDown;
        info!("Shutting down messenger connection");

        let mut first_error: Option<MessengerError> = None;
        let mut record = |outcome: Result<()>, step: &str| {
            if let Err(fault) = outcome {
                error!(step, error = %fault, "Shutdown step failed");
                first_error.get_or_insert(fault);
            }
        };

        if let Some(session) = self.session.take() {
            record(session.resolve(self.options.shutdown_commit).await, "resolve transaction");
            for producer in producers {
                record(session.close_producer(*producer).await, "close producer");
            }
            for consumer in consumers {
                record(session.close_consumer(*consumer).await, "close consumer");
            }
            record(session.close().await, "close session");
        }

        if let Some(mut connection) = self.connection.take() {
            record(connection.stop().await.map_err(Into::into), "stop connection");
            record(
                connection.close(self.options.close_timeout).await.map_err(Into::into),
                "close connection",
            );
        }

        self.library.take();
        self.state = ConnectionState::Disconnected;

        match first_error {
            Some(fault) => Err(fault),
            None => {
                info!("Messenger connection closed");
                Ok(())
            }
        }
    }
}
