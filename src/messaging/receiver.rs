// src/messaging/receiver.rs

use std::time::Duration;

use tracing::{debug, instrument};

use super::destination::Destination;
use super::errors::Result;
use super::session::TransactedSession;
use crate::message::Message;
use crate::properties::DestinationOptions;
use crate::transport::EndpointId;

/// What a [`ReceiverHandle`](super::ReceiverHandle) stands for: a consumer on
/// the shared session, bound to one destination.
#[derive(Debug, Clone)]
pub struct ReceiverBinding {
    pub destination: Destination,
    pub consumer: EndpointId,
    pub options: DestinationOptions,
}

impl ReceiverBinding {
    pub async fn attach(
        session: &TransactedSession,
        destination: Destination,
        options: DestinationOptions,
    ) -> Result<Self> {
        let consumer = session.create_consumer(destination.as_str(), &options).await?;
        debug!(
            %destination,
            ?consumer,
            prefetch = options.prefetch_count,
            timeout = ?options.receive_timeout,
            "Receiver attached"
        );
        Ok(Self {
            destination,
            consumer,
            options,
        })
    }

    /// Next message for the destination. `timeout` overrides the configured wait.
    #[instrument(skip_all, fields(destination = %self.destination))]
    pub async fn receive(
        &self,
        session: &TransactedSession,
        timeout: Option<Duration>,
    ) -> Result<Message> {
        let wait = timeout.or(self.options.receive_timeout);
        let frame = session.receive(self.consumer, wait).await?;
        debug!(message_id = %frame.message_id, bytes = frame.body.len(), "Message received");
        Ok(frame.into_message())
    }

    pub async fn detach(&self, session: &TransactedSession) -> Result<()> {
        session.close_consumer(self.consumer).await?;
        debug!(destination = %self.destination, "Receiver detached");
        Ok(())
    }
}
