// src/messaging/messenger.rs
// The caller-facing contract and its broker-backed implementation

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Notify, RwLock, RwLockReadGuard};
use tracing::{error, info, warn};
use uuid::Uuid;

use super::connection::ConnectionManager;
use super::destination::Destination;
use super::errors::{MessengerError, Result};
use super::handle::{HandleRegistry, ReceiverHandle, SenderHandle};
use super::receiver::ReceiverBinding;
use super::sender::SenderBinding;
use super::session::TransactionState;
use crate::message::Message;
use crate::properties::{DestinationOptions, Properties};
use crate::transport::{self, EndpointId, TransportConnector};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessengerState {
    Uninitialized,
    Ready,
    /// Reached by Shutdown and never left.
    Terminated,
}

/// Uniform request/response contract for talking to a message broker.
///
/// Every operation reports failure through [`MessengerError`]; transport
/// faults are translated before they get here.
#[async_trait]
pub trait Messenger: Send + Sync {
    /// Connects to the broker and opens the one transacted session.
    async fn connect(&self, broker_address: &str, properties: &Properties) -> Result<()>;

    async fn create_sender(&self, destination: &str, properties: &Properties) -> Result<SenderHandle>;

    async fn create_receiver(&self, destination: &str, properties: &Properties) -> Result<ReceiverHandle>;

    async fn send_message(&self, sender: SenderHandle, message: &Message) -> Result<()>;

    /// Waits for the next message, bounded by the receiver's `receive.timeout.ms` if set.
    async fn receive_message(&self, receiver: ReceiverHandle) -> Result<Message>;

    /// Like [`receive_message`](Messenger::receive_message) with an explicit bound.
    async fn receive_message_timeout(&self, receiver: ReceiverHandle, timeout: Duration) -> Result<Message>;

    /// Closing an already closed handle succeeds.
    async fn close_sender(&self, sender: SenderHandle) -> Result<()>;

    async fn close_receiver(&self, receiver: ReceiverHandle) -> Result<()>;

    /// Commits the session's pending work (`commit.mode=manual`).
    async fn commit(&self) -> Result<()>;

    /// Rolls back the session's pending work; received messages are redelivered.
    async fn rollback(&self) -> Result<()>;

    async fn shutdown(&self) -> Result<()>;

    async fn state(&self) -> MessengerState;
}

struct Lifecycle {
    state: MessengerState,
    connection: ConnectionManager,
}

/// [`Messenger`] over any [`TransportConnector`].
///
/// Message operations share the lifecycle lock; Connect and Shutdown take it
/// exclusively, so Shutdown waits for in-flight calls to finish. Pending
/// receives are abandoned when Shutdown starts.
pub struct BrokerMessenger {
    id: Uuid,
    lifecycle: RwLock<Lifecycle>,
    senders: Mutex<HandleRegistry<SenderHandle, SenderBinding>>,
    receivers: Mutex<HandleRegistry<ReceiverHandle, ReceiverBinding>>,
    closing: AtomicBool,
    closing_signal: Notify,
}

impl BrokerMessenger {
    pub fn new(connector: Arc<dyn TransportConnector>) -> Self {
        let id = Uuid::new_v4();
        BrokerMessenger {
            id,
            lifecycle: RwLock::new(Lifecycle {
                state: MessengerState::Uninitialized,
                connection: ConnectionManager::new(connector),
            }),
            senders: Mutex::new(HandleRegistry::new(id)),
            receivers: Mutex::new(HandleRegistry::new(id)),
            closing: AtomicBool::new(false),
            closing_signal: Notify::new(),
        }
    }

    /// A messenger whose transport is chosen by the address scheme.
    pub fn for_address(broker_address: &str) -> Result<Self> {
        let connector = transport::connector_for(broker_address).map_err(MessengerError::from_connect)?;
        Ok(Self::new(connector))
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// State of the session's transaction, while connected.
    pub async fn transaction_state(&self) -> Option<TransactionState> {
        let lifecycle = self.lifecycle.read().await;
        match lifecycle.connection.session() {
            Ok(session) => Some(session.transaction_state().await),
            Err(_) => None,
        }
    }

    async fn ready(&self) -> Result<RwLockReadGuard<'_, Lifecycle>> {
        if self.closing.load(Ordering::SeqCst) {
            return Err(MessengerError::NotConnected);
        }
        let lifecycle = self.lifecycle.read().await;
        if lifecycle.state != MessengerState::Ready {
            return Err(MessengerError::NotConnected);
        }
        Ok(lifecycle)
    }

    // Registry updates cannot panic half way, so a poisoned lock is still consistent
    fn senders(&self) -> MutexGuard<'_, HandleRegistry<SenderHandle, SenderBinding>> {
        self.senders.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn receivers(&self) -> MutexGuard<'_, HandleRegistry<ReceiverHandle, ReceiverBinding>> {
        self.receivers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn receive_with(&self, receiver: ReceiverHandle, timeout: Option<Duration>) -> Result<Message> {
        let lifecycle = self.ready().await?;
        let binding = self.receivers().get(&receiver)?;
        let session = lifecycle.connection.session()?;

        // Registered before the flag is checked so a Shutdown in between is seen
        let shutdown_started = self.closing_signal.notified();
        if self.closing.load(Ordering::SeqCst) {
            return Err(MessengerError::NotConnected);
        }

        tokio::select! {
            received = binding.receive(&session, timeout) => received,
            _ = shutdown_started => {
                warn!(destination = %binding.destination, "Receive abandoned, messenger is shutting down");
                Err(MessengerError::NotConnected)
            }
        }
    }
}

#[async_trait]
impl Messenger for BrokerMessenger {
    async fn connect(&self, broker_address: &str, properties: &Properties) -> Result<()> {
        let mut lifecycle = self.lifecycle.write().await;
        match lifecycle.state {
            MessengerState::Ready => return Err(MessengerError::AlreadyConnected),
            MessengerState::Terminated => return Err(MessengerError::NotConnected),
            MessengerState::Uninitialized => {}
        }

        match lifecycle.connection.connect(broker_address, properties).await {
            Ok(()) => {
                lifecycle.state = MessengerState::Ready;
                info!(messenger = %self.id, "Messenger ready");
                Ok(())
            }
            Err(fault) => {
                lifecycle.state = MessengerState::Uninitialized;
                error!(messenger = %self.id, error = %fault, "Messenger failed to connect");
                Err(fault)
            }
        }
    }

    async fn create_sender(&self, destination: &str, properties: &Properties) -> Result<SenderHandle> {
        let lifecycle = self.ready().await?;
        let destination = Destination::parse(destination)?;
        let options = DestinationOptions::resolve(lifecycle.connection.properties(), properties);
        let session = lifecycle.connection.session()?;

        let binding = SenderBinding::attach(&session, destination, options).await?;
        let handle = self.senders().insert(binding);
        Ok(handle)
    }

    async fn create_receiver(&self, destination: &str, properties: &Properties) -> Result<ReceiverHandle> {
        let lifecycle = self.ready().await?;
        let destination = Destination::parse(destination)?;
        let options = DestinationOptions::resolve(lifecycle.connection.properties(), properties);
        let session = lifecycle.connection.session()?;

        let binding = ReceiverBinding::attach(&session, destination, options).await?;
        let handle = self.receivers().insert(binding);
        Ok(handle)
    }

    async fn send_message(&self, sender: SenderHandle, message: &Message) -> Result<()> {
        let lifecycle = self.ready().await?;
        let binding = self.senders().get(&sender)?;
        let session = lifecycle.connection.session()?;
        binding
            .send(&session, message, lifecycle.connection.options().max_frame_size)
            .await
    }

    async fn receive_message(&self, receiver: ReceiverHandle) -> Result<Message> {
        self.receive_with(receiver, None).await
    }

    async fn receive_message_timeout(&self, receiver: ReceiverHandle, timeout: Duration) -> Result<Message> {
        self.receive_with(receiver, Some(timeout)).await
    }

    async fn close_sender(&self, sender: SenderHandle) -> Result<()> {
        let lifecycle = self.ready().await?;
        let open = self.senders().open_binding(&sender)?;
        let binding = match open {
            Some(binding) => binding,
            None => return Ok(()),
        };

        // The handle stays open if the endpoint could not be detached
        let session = lifecycle.connection.session()?;
        binding.detach(&session).await?;
        self.senders().close(&sender)?;
        Ok(())
    }

    async fn close_receiver(&self, receiver: ReceiverHandle) -> Result<()> {
        let lifecycle = self.ready().await?;
        let open = self.receivers().open_binding(&receiver)?;
        let binding = match open {
            Some(binding) => binding,
            None => return Ok(()),
        };

        // The handle stays open if the endpoint could not be detached
        let session = lifecycle.connection.session()?;
        binding.detach(&session).await?;
        self.receivers().close(&receiver)?;
        Ok(())
    }

    async fn commit(&self) -> Result<()> {
        let lifecycle = self.ready().await?;
        lifecycle.connection.session()?.commit().await
    }

    async fn rollback(&self) -> Result<()> {
        let lifecycle = self.ready().await?;
        lifecycle.connection.session()?.rollback().await
    }

    async fn shutdown(&self) -> Result<()> {
        if self.lifecycle.read().await.state != MessengerState::Ready {
            return Err(MessengerError::NotConnected);
        }

        // Turn away new calls and wake pending receives, then wait for the rest
        self.closing.store(true, Ordering::SeqCst);
        self.closing_signal.notify_waiters();
        let mut lifecycle = self.lifecycle.write().await;
        if lifecycle.state != MessengerState::Ready {
            return Err(MessengerError::NotConnected);
        }

        let producers: Vec<EndpointId> = self
            .senders()
            .close_all()
            .into_iter()
            .map(|(_, binding)| binding.producer)
            .collect();
        let consumers: Vec<EndpointId> = self
            .receivers()
            .close_all()
            .into_iter()
            .map(|(_, binding)| binding.consumer)
            .collect();

        let outcome = lifecycle.connection.shutdown(&producers, &consumers).await;
        lifecycle.state = MessengerState::Terminated;
        match &outcome {
            Ok(()) => info!(messenger = %self.id, "Messenger terminated"),
            Err(fault) => error!(messenger = %self.id, error = %fault, "Messenger terminated with errors"),
        }
        outcome
    }

    async fn state(&self) -> MessengerState {
        self.lifecycle.read().await.state
    }
}

impl Drop for BrokerMessenger {
    fn drop(&mut self) {
        if self.lifecycle.get_mut().state == MessengerState::Ready {
            warn!(messenger = %self.id, "Messenger dropped without Shutdown; broker resources were not released");
        }
    }
}
