//! The broker seam.
//!
//! [`Broker`] is the narrow set of operations the messaging layer needs from a
//! message broker: fanout exchanges, durable queues with an optional
//! dead-letter exchange, publishing (plain and transactional) and consumption
//! with explicit acknowledgement. [`crate::AmqpBroker`] talks to RabbitMQ,
//! [`crate::InMemoryBroker`] keeps everything in process for tests.

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::Result;

/// Metadata carried alongside a message body.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageProperties {
    pub message_id: Option<String>,
    pub correlation_id: Option<String>,
    pub app_id: Option<String>,
    pub content_type: Option<String>,
    /// Persistent delivery mode (survives a broker restart).
    pub persistent: bool,
    pub headers: BTreeMap<String, String>,
}

impl MessageProperties {
    /// Returns the header value, treating an empty string as absent.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(name)
            .map(String::as_str)
            .filter(|value| !value.is_empty())
    }
}

/// A message ready to be published.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub properties: MessageProperties,
    pub body: Vec<u8>,
}

/// Settles one delivery with the broker.
#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn ack(&self) -> Result<()>;

    /// Rejects the delivery. Without `requeue` the broker dead-letters it.
    async fn nack(&self, requeue: bool) -> Result<()>;
}

/// A message handed out by a consumer, pending acknowledgement.
pub struct Delivery {
    pub properties: MessageProperties,
    pub body: Vec<u8>,
    /// Set when the broker delivered this message before without an ack.
    pub redelivered: bool,
    acker: Box<dyn Acknowledger>,
}

impl Delivery {
    pub fn new(
        properties: MessageProperties,
        body: Vec<u8>,
        redelivered: bool,
        acker: Box<dyn Acknowledger>,
    ) -> Self {
        Self {
            properties,
            body,
            redelivered,
            acker,
        }
    }

    pub async fn ack(self) -> Result<()> {
        self.acker.ack().await
    }

    pub async fn nack(self, requeue: bool) -> Result<()> {
        self.acker.nack(requeue).await
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("properties", &self.properties)
            .field("body_len", &self.body.len())
            .field("redelivered", &self.redelivered)
            .finish()
    }
}

/// A stream of deliveries from one queue.
#[async_trait]
pub trait DeliveryConsumer: Send {
    /// Waits for the next delivery. `None` means the consumer has ended,
    /// either because it was cancelled or because the connection went away.
    async fn next_delivery(&mut self) -> Option<Result<Delivery>>;

    /// Stops consuming. Unacknowledged deliveries return to the queue.
    async fn cancel(&mut self) -> Result<()>;
}

/// A publish transaction: everything published becomes visible on commit,
/// nothing on rollback.
#[async_trait]
pub trait PublishTransaction: Send {
    async fn publish(&mut self, exchange: &str, message: OutboundMessage) -> Result<()>;

    async fn commit(self: Box<Self>) -> Result<()>;

    async fn rollback(self: Box<Self>) -> Result<()>;
}

/// Declaration of a durable queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSpec {
    pub name: String,
    /// Exchange that receives messages rejected without requeue.
    pub dead_letter_exchange: Option<String>,
    /// Lazy mode keeps messages on disk rather than in memory.
    pub lazy: bool,
}

impl QueueSpec {
    pub fn durable(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            dead_letter_exchange: None,
            lazy: false,
        }
    }

    pub fn with_dead_letter_exchange(mut self, exchange: impl Into<String>) -> Self {
        self.dead_letter_exchange = Some(exchange.into());
        self
    }

    pub fn lazy(mut self) -> Self {
        self.lazy = true;
        self
    }
}

/// Notification about the broker connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// The connection closed unexpectedly.
    Lost(String),
}

#[async_trait]
pub trait Broker: Send + Sync {
    /// Declares a durable fanout exchange. With `passive` set, only checks
    /// that it exists and fails with `TopologyNotFound` otherwise.
    async fn declare_exchange(&self, name: &str, passive: bool) -> Result<()>;

    /// Declares a durable queue. Redeclaring with the same arguments is a no-op.
    async fn declare_queue(&self, spec: &QueueSpec) -> Result<()>;

    /// Binds a queue to a fanout exchange.
    async fn bind_queue(&self, queue: &str, exchange: &str) -> Result<()>;

    async fn publish(&self, exchange: &str, message: OutboundMessage) -> Result<()>;

    async fn begin_publish(&self) -> Result<Box<dyn PublishTransaction>>;

    /// Starts consuming `queue`. A `prefetch` of zero leaves the number of
    /// unacknowledged deliveries unbounded.
    async fn consume(&self, queue: &str, prefetch: u16) -> Result<Box<dyn DeliveryConsumer>>;

    /// Subscribes to connection notifications.
    fn connection_events(&self) -> broadcast::Receiver<ConnectionEvent>;

    /// Replaces a lost connection with a fresh one.
    async fn reconnect(&self) -> Result<()>;

    fn is_connected(&self) -> bool;
}

#[async_trait]
impl<T: Broker + ?Sized> Broker for std::sync::Arc<T> {
    async fn declare_exchange(&self, name: &str, passive: bool) -> Result<()> {
        (**self).declare_exchange(name, passive).await
    }

    async fn declare_queue(&self, spec: &QueueSpec) -> Result<()> {
        (**self).declare_queue(spec).await
    }

    async fn bind_queue(&self, queue: &str, exchange: &str) -> Result<()> {
        (**self).bind_queue(queue, exchange).await
    }

    async fn publish(&self, exchange: &str, message: OutboundMessage) -> Result<()> {
        (**self).publish(exchange, message).await
    }

    async fn begin_publish(&self) -> Result<Box<dyn PublishTransaction>> {
        (**self).begin_publish().await
    }

    async fn consume(&self, queue: &str, prefetch: u16) -> Result<Box<dyn DeliveryConsumer>> {
        (**self).consume(queue, prefetch).await
    }

    fn connection_events(&self) -> broadcast::Receiver<ConnectionEvent> {
        (**self).connection_events()
    }

    async fn reconnect(&self) -> Result<()> {
        (**self).reconnect().await
    }

    fn is_connected(&self) -> bool {
        (**self).is_connected()
    }
}
