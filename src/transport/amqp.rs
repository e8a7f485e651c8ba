// src/transport/amqp.rs
// AMQP 0-9-1 transport on top of lapin. A session is a channel in tx mode;
// producers publish through the default exchange straight to the queue.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use futures_lite::StreamExt;
use lapin::{
    options::*,
    types::{AMQPValue, FieldTable, ShortString},
    BasicProperties, Channel, Connection, ConnectionProperties, Consumer,
};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::errors::{TransportError, TransportResult};
use super::frame::Frame;
use super::{BrokerAddress, EndpointId, TransportConnection, TransportConnector, TransportSession};
use crate::properties::{ConnectionOptions, DestinationOptions};

#[derive(Debug, Default)]
pub struct AmqpConnector;

impl AmqpConnector {
    pub fn new() -> Self {
        AmqpConnector
    }
}

#[async_trait]
impl TransportConnector for AmqpConnector {
    fn library_key(&self) -> String {
        "lapin".to_string()
    }

    async fn connect(
        &self,
        address: &BrokerAddress,
        options: &ConnectionOptions,
    ) -> TransportResult<Box<dyn TransportConnection>> {
        info!("Connecting to AMQP broker at {}", address);
        let connection = Connection::connect(address.as_str(), ConnectionProperties::default())
            .await
            .map_err(|e| match e {
                lapin::Error::ProtocolError(_) => {
                    TransportError::Unreachable(format!("{} refused the connection: {}", address, e))
                }
                other => other.into(),
            })?;

        Ok(Box::new(AmqpConnection {
            connection,
            optimize_acknowledge: options.optimize_acknowledge,
        }))
    }
}

pub struct AmqpConnection {
    connection: Connection,
    optimize_acknowledge: bool,
}

#[async_trait]
impl TransportConnection for AmqpConnection {
    async fn start(&mut self) -> TransportResult<()> {
        // AMQP connections deliver as soon as they are open
        if !self.connection.status().connected() {
            return Err(TransportError::Closed("connection dropped before start".to_string()));
        }
        Ok(())
    }

    async fn create_session(&mut self, transacted: bool) -> TransportResult<Box<dyn TransportSession>> {
        let channel = self.connection.create_channel().await?;
        if transacted {
            channel.tx_select().await?;
        }
        debug!(channel_id = channel.id(), transacted, "Opened AMQP session");

        Ok(Box::new(AmqpSession {
            channel,
            transacted,
            optimize_acknowledge: self.optimize_acknowledge,
            next_endpoint: 0,
            producers: HashMap::new(),
            consumers: HashMap::new(),
            unsettled: Vec::new(),
        }))
    }

    async fn stop(&mut self) -> TransportResult<()> {
        Ok(())
    }

    async fn close(&mut self, timeout: Duration) -> TransportResult<()> {
        if !self.connection.status().connected() {
            return Ok(());
        }
        match tokio::time::timeout(timeout, self.connection.close(200, "messenger shutdown")).await {
            Ok(result) => Ok(result?),
            Err(_) => {
                warn!("AMQP connection did not close within {:?}", timeout);
                Err(TransportError::Other(format!("close timed out after {:?}", timeout)))
            }
        }
    }
}

struct AmqpConsumer {
    tag: String,
    consumer: Consumer,
    no_ack: bool,
}

pub struct AmqpSession {
    channel: Channel,
    transacted: bool,
    optimize_acknowledge: bool,
    next_endpoint: u64,
    producers: HashMap<EndpointId, String>,
    consumers: HashMap<EndpointId, AmqpConsumer>,
    /// Delivery tags handed to the caller and not yet settled with the broker.
    unsettled: Vec<u64>,
}

impl AmqpSession {
    fn allocate(&mut self) -> EndpointId {
        self.next_endpoint += 1;
        EndpointId(self.next_endpoint)
    }

    async fn declare(&self, destination: &str, options: &DestinationOptions) -> TransportResult<()> {
        self.channel
            .queue_declare(
                destination,
                QueueDeclareOptions {
                    durable: options.durable,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| TransportError::InvalidDestination(format!("'{}': {}", destination, e)))?;
        Ok(())
    }
}

#[async_trait]
impl TransportSession for AmqpSession {
    async fn create_producer(
        &mut self,
        destination: &str,
        options: &DestinationOptions,
    ) -> TransportResult<EndpointId> {
        self.declare(destination, options).await?;
        let id = self.allocate();
        self.producers.insert(id, destination.to_string());
        Ok(id)
    }

    async fn create_consumer(
        &mut self,
        destination: &str,
        options: &DestinationOptions,
    ) -> TransportResult<EndpointId> {
        self.declare(destination, options).await?;
        self.channel
            .basic_qos(options.prefetch_count, BasicQosOptions::default())
            .await?;

        let no_ack = self.optimize_acknowledge || options.optimize_acknowledge;
        let tag = format!("messenger-{}", Uuid::new_v4());
        let consumer = self
            .channel
            .basic_consume(
                destination,
                &tag,
                BasicConsumeOptions {
                    no_ack,
                    ..BasicConsumeOptions::default()
                },
                FieldTable::default(),
            )
            .await?;

        let id = self.allocate();
        debug!(destination, consumer_tag = %tag, prefetch = options.prefetch_count, no_ack, "Attached AMQP consumer");
        self.consumers.insert(id, AmqpConsumer { tag, consumer, no_ack });
        Ok(id)
    }

    async fn send(&mut self, producer: EndpointId, frame: Frame) -> TransportResult<()> {
        let destination = self
            .producers
            .get(&producer)
            .ok_or_else(|| TransportError::Closed(format!("producer {:?} is closed", producer)))?;

        let mut headers = FieldTable::default();
        for (key, value) in frame.headers {
            headers.insert(ShortString::from(key), AMQPValue::LongString(value.into()));
        }
        let properties = BasicProperties::default()
            .with_message_id(frame.message_id.to_string().into())
            .with_timestamp(to_amqp_timestamp(frame.timestamp))
            .with_headers(headers);

        let _confirm = self
            .channel
            .basic_publish(
                "",
                destination,
                BasicPublishOptions::default(),
                &frame.body,
                properties,
            )
            .await?;
        Ok(())
    }

    async fn receive(&mut self, consumer: EndpointId) -> TransportResult<Frame> {
        let entry = self
            .consumers
            .get_mut(&consumer)
            .ok_or_else(|| TransportError::Closed(format!("consumer {:?} is closed", consumer)))?;

        let delivery = match entry.consumer.next().await {
            Some(delivery) => delivery?,
            None => return Err(TransportError::Closed(format!("consumer {} was cancelled", entry.tag))),
        };
        // Settled at commit or rollback; nothing may await between taking the
        // delivery and recording it
        if !entry.no_ack {
            self.unsettled.push(delivery.delivery_tag);
        }

        let properties = &delivery.properties;
        let headers: BTreeMap<String, String> = properties
            .headers()
            .as_ref()
            .map(|table| {
                table
                    .inner()
                    .iter()
                    .filter_map(|(key, value)| header_text(value).map(|text| (key.as_str().to_string(), text)))
                    .collect()
            })
            .unwrap_or_default();
        let message_id = properties
            .message_id()
            .as_ref()
            .and_then(|id| Uuid::parse_str(id.as_str()).ok())
            .unwrap_or_else(Uuid::new_v4);
        let timestamp = (*properties.timestamp())
            .and_then(from_amqp_timestamp)
            .unwrap_or_else(Utc::now);

        Ok(Frame {
            message_id,
            timestamp,
            headers,
            body: delivery.data,
        })
    }

    async fn commit(&mut self) -> TransportResult<()> {
        for tag in &self.unsettled {
            self.channel.basic_ack(*tag, BasicAckOptions::default()).await?;
        }
        if self.transacted {
            self.channel.tx_commit().await?;
        }
        self.unsettled.clear();
        Ok(())
    }

    async fn rollback(&mut self) -> TransportResult<()> {
        if self.transacted {
            self.channel.tx_rollback().await?;
        }

        // tx.rollback leaves delivered messages unacknowledged on the channel;
        // hand them back to the queue so they are redelivered.
        for tag in self.unsettled.drain(..) {
            let requeue = BasicNackOptions {
                multiple: false,
                requeue: true,
            };
            self.channel.basic_nack(tag, requeue).await?;
        }
        if self.transacted {
            // Nacks on a tx channel only take effect once committed
            self.channel.tx_commit().await?;
        }
        debug!(channel_id = self.channel.id(), "AMQP transaction rolled back");
        Ok(())
    }

    async fn close_producer(&mut self, producer: EndpointId) -> TransportResult<()> {
        self.producers.remove(&producer);
        Ok(())
    }

    async fn close_consumer(&mut self, consumer: EndpointId) -> TransportResult<()> {
        if let Some(entry) = self.consumers.remove(&consumer) {
            self.channel
                .basic_cancel(&entry.tag, BasicCancelOptions::default())
                .await?;
        }
        Ok(())
    }

    async fn close(&mut self) -> TransportResult<()> {
        self.producers.clear();
        self.consumers.clear();
        if self.channel.status().connected() {
            self.channel.close(200, "session closed").await?;
        }
        Ok(())
    }
}

/// AMQP timestamps are unsigned seconds; instants before the epoch become 0.
fn to_amqp_timestamp(at: DateTime<Utc>) -> u64 {
    u64::try_from(at.timestamp()).unwrap_or(0)
}

fn from_amqp_timestamp(seconds: u64) -> Option<DateTime<Utc>> {
    let seconds = i64::try_from(seconds).ok()?;
    Utc.timestamp_opt(seconds, 0).single()
}

fn header_text(value: &AMQPValue) -> Option<String> {
    match value {
        AMQPValue::LongString(text) => Some(String::from_utf8_lossy(text.as_bytes()).into_owned()),
        AMQPValue::ShortString(text) => Some(text.as_str().to_string()),
        AMQPValue::Boolean(flag) => Some(flag.to_string()),
        AMQPValue::LongInt(number) => Some(number.to_string()),
        AMQPValue::LongLongInt(number) => Some(number.to_string()),
        _ => None,
    }
}
