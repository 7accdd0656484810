//! The delivery loop of one subscription.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use common::AppId;
use futures_util::FutureExt;
use tokio::sync::{Semaphore, watch};
use tokio::task::JoinSet;
use tracing::Instrument;

use crate::Envelope;
use crate::broker::{Delivery, DeliveryConsumer};
use crate::handler::MessageHandler;

/// What happens to a delivery once its handler has returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Ack,
    /// Reject and put back on the queue for one more attempt.
    Requeue,
    /// Reject without requeue; the broker routes it to the dead-letter queue.
    DeadLetter,
}

impl Disposition {
    /// A message gets two attempts: a failure on first delivery requeues it,
    /// a failure on redelivery dead-letters it.
    pub fn decide(handled: bool, redelivered: bool) -> Self {
        match (handled, redelivered) {
            (true, _) => Disposition::Ack,
            (false, false) => Disposition::Requeue,
            (false, true) => Disposition::DeadLetter,
        }
    }

    fn metric_name(self) -> &'static str {
        match self {
            Disposition::Ack => "messages_acked_total",
            Disposition::Requeue => "messages_requeued_total",
            Disposition::DeadLetter => "messages_dead_lettered_total",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubscribeOptions {
    /// Upper bound on unacknowledged deliveries, also the number of handler
    /// invocations running at once. Zero sets no bound on the broker and
    /// handles messages one at a time.
    pub max_concurrent_messages: u16,
}

impl SubscribeOptions {
    pub fn with_max_concurrent_messages(max_concurrent_messages: u16) -> Self {
        Self {
            max_concurrent_messages,
        }
    }

    pub(crate) fn prefetch(&self) -> u16 {
        self.max_concurrent_messages
    }

    pub(crate) fn concurrency(&self) -> usize {
        usize::from(self.max_concurrent_messages.max(1))
    }
}

/// Consumes one queue until stopped or until the consumer ends.
pub(crate) struct DeliveryLoop {
    pub(crate) app_id: AppId,
    pub(crate) topic: String,
    pub(crate) queue: String,
    pub(crate) handler: Arc<dyn MessageHandler>,
    pub(crate) options: SubscribeOptions,
}

impl DeliveryLoop {
    /// Runs until `stop` flips or its sender goes away, or the consumer ends.
    ///
    /// Handler invocations already started are awaited before the consumer is
    /// cancelled, so their ack or nack still reaches the broker. Deliveries
    /// not yet handed to a handler go back to the queue.
    pub(crate) async fn run(
        self,
        mut consumer: Box<dyn DeliveryConsumer>,
        mut stop: watch::Receiver<bool>,
    ) {
        let permits = Arc::new(Semaphore::new(self.options.concurrency()));
        let mut in_flight = JoinSet::new();

        tracing::info!(
            topic = %self.topic,
            queue = %self.queue,
            max_concurrent_messages = self.options.max_concurrent_messages,
            "subscription started"
        );

        loop {
            if *stop.borrow() {
                break;
            }

            let permit = tokio::select! {
                biased;
                _ = stop.changed() => break,
                permit = Arc::clone(&permits).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let next = tokio::select! {
                biased;
                _ = stop.changed() => break,
                next = consumer.next_delivery() => next,
            };

            match next {
                Some(Ok(delivery)) => {
                    let handler = Arc::clone(&self.handler);
                    let app_id = self.app_id.clone();
                    let topic = self.topic.clone();
                    in_flight.spawn(async move {
                        process(handler.as_ref(), &app_id, &topic, delivery).await;
                        drop(permit);
                    });
                }
                Some(Err(err)) => {
                    tracing::error!(topic = %self.topic, error = %err, "consumer failed");
                    break;
                }
                None => {
                    tracing::warn!(topic = %self.topic, "consumer closed by broker");
                    break;
                }
            }

            while let Some(joined) = in_flight.try_join_next() {
                log_task_failure(&self.topic, joined);
            }
        }

        while let Some(joined) = in_flight.join_next().await {
            log_task_failure(&self.topic, joined);
        }

        if let Err(err) = consumer.cancel().await {
            tracing::debug!(topic = %self.topic, error = %err, "consumer cancel failed");
        }
        tracing::info!(topic = %self.topic, "subscription stopped");
    }
}

async fn process(handler: &dyn MessageHandler, app_id: &AppId, topic: &str, delivery: Delivery) {
    let envelope = Envelope::from_properties(&delivery.properties, delivery.redelivered);
    let scope = envelope.request_scope(app_id);
    let span = tracing::info_span!(
        "delivery",
        topic,
        correlation_id = %envelope.correlation_id,
        redelivered = envelope.redelivered,
    );

    // A panicking handler counts as a failed one so the delivery is still settled.
    let result = AssertUnwindSafe(
        handler
            .handle(&scope, &envelope, &delivery.body)
            .instrument(span.clone()),
    )
    .catch_unwind()
    .await
    .unwrap_or_else(|panic| Err(format!("handler panicked: {}", panic_message(&*panic)).into()));

    let disposition = Disposition::decide(result.is_ok(), envelope.redelivered);
    if let Err(err) = &result {
        match disposition {
            Disposition::DeadLetter => {
                tracing::error!(parent: &span, error = %err, "handler failed on redelivery, dead-lettering")
            }
            _ => tracing::warn!(parent: &span, error = %err, "handler failed, requeueing"),
        }
    }

    let settled = match disposition {
        Disposition::Ack => delivery.ack().await,
        Disposition::Requeue => delivery.nack(true).await,
        Disposition::DeadLetter => delivery.nack(false).await,
    };

    match settled {
        Ok(()) => {
            metrics::counter!(disposition.metric_name(), "topic" => topic.to_string()).increment(1)
        }
        // The broker redelivers once the channel is gone.
        Err(err) => {
            tracing::error!(parent: &span, error = %err, ?disposition, "failed to settle delivery")
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}

fn log_task_failure(topic: &str, joined: Result<(), tokio::task::JoinError>) {
    if let Err(err) = joined {
        tracing::error!(topic, error = %err, "delivery task failed");
    }
}
