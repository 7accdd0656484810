//! Exchange and queue layout.
//!
//! For topic `T` and subscribing application `A`:
//!
//! ```text
//! T (fanout) ──> A->T (durable, x-dead-letter-exchange = A->T.deadletter)
//! A->T.deadletter (fanout) ──> A->T.deadletter (durable, lazy)
//! ```

use std::sync::Arc;
use std::time::Duration;

use common::AppId;
use crate::broker::{Broker, QueueSpec};
use crate::{MessagingError, Result};

/// Name of the work queue `app_id` consumes `topic` from.
pub fn queue_name(app_id: &AppId, topic: &str) -> String {
    format!("{}->{}", app_id, topic)
}

/// Name of both the dead-letter exchange and the dead-letter queue.
pub fn dead_letter_name(app_id: &AppId, topic: &str) -> String {
    format!("{}.deadletter", queue_name(app_id, topic))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopologyConfig {
    /// Attempts at declaring a queue before giving up (default: 3).
    pub queue_declare_attempts: u32,
    /// Pause between attempts (default: 30 seconds).
    pub queue_declare_retry_delay: Duration,
}

impl Default for TopologyConfig {
    fn default() -> Self {
        Self {
            queue_declare_attempts: 3,
            queue_declare_retry_delay: Duration::from_secs(30),
        }
    }
}

/// Declares topics and per-application queues. Every operation is idempotent.
#[derive(Clone)]
pub struct Topology {
    broker: Arc<dyn Broker>,
    config: TopologyConfig,
}

impl Topology {
    pub fn new(broker: Arc<dyn Broker>, config: TopologyConfig) -> Self {
        Self { broker, config }
    }

    pub fn config(&self) -> &TopologyConfig {
        &self.config
    }

    /// Creates the fanout exchange for `topic` unless it already exists.
    #[tracing::instrument(skip(self), fields(component = "topology"))]
    pub async fn declare_topic(&self, topic: &str) -> Result<()> {
        match self.broker.declare_exchange(topic, true).await {
            Ok(()) => Ok(()),
            Err(err) if err.is_not_found() => {
                self.broker.declare_exchange(topic, false).await?;
                tracing::info!(topic, "topic declared");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    /// Declares the work queue of `app_id` for `topic` with its dead-letter
    /// pair, and binds it to the topic.
    ///
    /// The topic is owned by its publisher and may not exist yet, so a missing
    /// topic is retried a fixed number of times before failing.
    #[tracing::instrument(skip(self), fields(component = "topology"))]
    pub async fn declare_queue(&self, app_id: &AppId, topic: &str) -> Result<String> {
        let attempts = self.config.queue_declare_attempts.max(1);
        let mut attempt = 1;

        loop {
            match self.try_declare_queue(app_id, topic).await {
                Ok(queue) => return Ok(queue),
                Err(err) if err.is_not_found() && attempt < attempts => {
                    tracing::warn!(
                        topic,
                        attempt,
                        attempts,
                        retry_in = ?self.config.queue_declare_retry_delay,
                        error = %err,
                        "topic not declared yet, retrying queue declaration"
                    );
                    tokio::time::sleep(self.config.queue_declare_retry_delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn try_declare_queue(&self, app_id: &AppId, topic: &str) -> Result<String> {
        let queue = queue_name(app_id, topic);
        let dead_letter = dead_letter_name(app_id, topic);

        self.broker.declare_exchange(&dead_letter, false).await?;
        self.broker
            .declare_queue(&QueueSpec::durable(&dead_letter).lazy())
            .await?;
        self.broker.bind_queue(&dead_letter, &dead_letter).await?;

        self.broker
            .declare_exchange(topic, true)
            .await
            .map_err(|err| match err {
                MessagingError::TopologyNotFound { .. } => MessagingError::TopologyNotFound {
                    kind: "topic",
                    name: topic.to_string(),
                },
                other => other,
            })?;

        self.broker
            .declare_queue(&QueueSpec::durable(&queue).with_dead_letter_exchange(&dead_letter))
            .await?;
        self.broker.bind_queue(&queue, topic).await?;

        tracing::info!(topic, queue = %queue, "queue declared");
        Ok(queue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::InMemoryBroker;

    fn topology(broker: &InMemoryBroker, attempts: u32) -> Topology {
        Topology::new(
            Arc::new(broker.clone()),
            TopologyConfig {
                queue_declare_attempts: attempts,
                queue_declare_retry_delay: Duration::from_secs(30),
            },
        )
    }

    #[test]
    fn names_follow_app_and_topic() {
        let app = AppId::from("billing");
        assert_eq!(queue_name(&app, "user.signup"), "billing->user.signup");
        assert_eq!(
            dead_letter_name(&app, "user.signup"),
            "billing->user.signup.deadletter"
        );
    }

    #[test]
    fn default_config_matches_declared_values() {
        let config = TopologyConfig::default();
        assert_eq!(config.queue_declare_attempts, 3);
        assert_eq!(config.queue_declare_retry_delay, Duration::from_secs(30));
    }

    #[tokio::test]
    async fn declare_topic_is_idempotent() {
        let broker = InMemoryBroker::new();
        let topology = topology(&broker, 3);

        topology.declare_topic("orders").await.unwrap();
        topology.declare_topic("orders").await.unwrap();

        assert!(broker.exchange_exists("orders"));
    }

    #[tokio::test]
    async fn declare_queue_builds_dead_letter_pair() {
        let broker = InMemoryBroker::new();
        let topology = topology(&broker, 3);
        let app = AppId::from("billing");
        topology.declare_topic("orders").await.unwrap();

        let queue = topology.declare_queue(&app, "orders").await.unwrap();
        topology.declare_queue(&app, "orders").await.unwrap();

        assert_eq!(queue, "billing->orders");
        assert!(broker.is_bound("billing->orders", "orders"));
        assert!(broker.is_bound("billing->orders.deadletter", "billing->orders.deadletter"));

        let primary = broker.queue_spec("billing->orders").unwrap();
        assert_eq!(
            primary.dead_letter_exchange.as_deref(),
            Some("billing->orders.deadletter")
        );
        assert!(!primary.lazy);
        assert!(broker.queue_spec("billing->orders.deadletter").unwrap().lazy);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_topic_is_retried_then_fails() {
        let broker = InMemoryBroker::new();
        let topology = topology(&broker, 3);
        let started = tokio::time::Instant::now();

        let err = topology
            .declare_queue(&AppId::from("billing"), "orders")
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            MessagingError::TopologyNotFound { kind: "topic", .. }
        ));
        let waited = started.elapsed();
        assert!(waited >= Duration::from_secs(60) && waited < Duration::from_secs(90));
        assert!(!broker.queue_exists("billing->orders"));
    }

    #[tokio::test(start_paused = true)]
    async fn topic_declared_between_attempts_succeeds() {
        let broker = InMemoryBroker::new();
        let topology = topology(&broker, 3);

        let publisher = {
            let broker = broker.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(10)).await;
                broker.declare_exchange("orders", false).await.unwrap();
            })
        };

        let queue = topology
            .declare_queue(&AppId::from("billing"), "orders")
            .await
            .unwrap();
        publisher.await.unwrap();

        assert_eq!(queue, "billing->orders");
        assert!(broker.is_bound("billing->orders", "orders"));
    }
}
