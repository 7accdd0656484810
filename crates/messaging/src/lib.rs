//! Reliable topic messaging.
//!
//! Topics are durable fanout exchanges. Every subscribing application owns a
//! durable queue per topic, dead-lettered into a lazy queue once a message has
//! failed on redelivery. The [`MessagingClient`] owns the topic registry and
//! the broker handle; the [`ConnectionSupervisor`] reacts to connection loss.

pub mod amqp;
pub mod broker;
pub mod client;
pub mod envelope;
pub mod error;
pub mod handler;
pub mod memory;
pub mod subscriber;
pub mod supervisor;
pub mod topology;

pub use amqp::AmqpBroker;
pub use broker::{
    Acknowledger, Broker, ConnectionEvent, Delivery, DeliveryConsumer, MessageProperties,
    OutboundMessage, PublishTransaction, QueueSpec,
};
pub use client::{MessagingClient, PublishBatch};
pub use envelope::Envelope;
pub use error::{MessagingError, Result};
pub use handler::{HandlerError, MessageHandler, handler_fn};
pub use memory::InMemoryBroker;
pub use subscriber::{Disposition, SubscribeOptions};
pub use supervisor::{
    ConnectionLossPolicy, ConnectionState, ConnectionSupervisor, ReconnectPolicy, SupervisorSignal,
};
pub use topology::{Topology, TopologyConfig, dead_letter_name, queue_name};
