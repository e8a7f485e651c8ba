// src/messaging/sender.rs

use tracing::{debug, instrument};

use super::destination::Destination;
use super::errors::Result;
use super::session::TransactedSession;
use crate::message::Message;
use crate::properties::DestinationOptions;
use crate::transport::{EndpointId, Frame};

/// What a [`SenderHandle`](super::SenderHandle) stands for: a producer on the
/// shared session, bound to one destination.
#[derive(Debug, Clone)]
pub struct SenderBinding {
    pub destination: Destination,
    pub producer: EndpointId,
    pub options: DestinationOptions,
}

impl SenderBinding {
    pub async fn attach(
        session: &TransactedSession,
        destination: Destination,
        options: DestinationOptions,
    ) -> Result<Self> {
        let producer = session.create_producer(destination.as_str(), &options).await?;
        debug!(%destination, ?producer, durable = options.durable, "Sender attached");
        Ok(Self {
            destination,
            producer,
            options,
        })
    }

    /// Frames `message` and hands it to the session, which applies the commit mode.
    #[instrument(skip_all, fields(destination = %self.destination))]
    pub async fn send(
        &self,
        session: &TransactedSession,
        message: &Message,
        max_frame_size: usize,
    ) -> Result<()> {
        let frame = Frame::from_message(message, max_frame_size)?;
        let message_id = frame.message_id;
        session.send(self.producer, frame).await?;
        debug!(%message_id, bytes = message.payload.len(), "Message sent");
        Ok(())
    }

    pub async fn detach(&self, session: &TransactedSession) -> Result<()> {
        session.close_producer(self.producer).await?;
        debug!(destination = %self.destination, "Sender detached");
        Ok(())
    }
}
