use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use common::{AppId, RequestScope};
use tokio::sync::{Mutex, RwLock, watch};
use tokio::task::JoinHandle;

use crate::broker::{Broker, PublishTransaction};
use crate::envelope::outbound_message;
use crate::handler::MessageHandler;
use crate::subscriber::{DeliveryLoop, SubscribeOptions};
use crate::topology::{Topology, TopologyConfig, queue_name};
use crate::{MessagingError, Result};

struct Subscription {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

struct Inner {
    app_id: AppId,
    broker: Arc<dyn Broker>,
    topology: Topology,
    topics: RwLock<BTreeSet<String>>,
    subscriptions: Mutex<HashMap<String, Subscription>>,
}

/// Messaging handle of one application.
///
/// Owns the set of topics this process may publish to and the running
/// subscriptions. Cloning is cheap and clones share state.
#[derive(Clone)]
pub struct MessagingClient {
    inner: Arc<Inner>,
}

impl MessagingClient {
    pub fn new(app_id: impl Into<AppId>, broker: Arc<dyn Broker>) -> Self {
        Self::with_topology_config(app_id, broker, TopologyConfig::default())
    }

    pub fn with_topology_config(
        app_id: impl Into<AppId>,
        broker: Arc<dyn Broker>,
        config: TopologyConfig,
    ) -> Self {
        let topology = Topology::new(Arc::clone(&broker), config);
        Self {
            inner: Arc::new(Inner {
                app_id: app_id.into(),
                broker,
                topology,
                topics: RwLock::new(BTreeSet::new()),
                subscriptions: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn app_id(&self) -> &AppId {
        &self.inner.app_id
    }

    pub fn broker(&self) -> &Arc<dyn Broker> {
        &self.inner.broker
    }

    /// Declares `topic` and records it as one this process publishes to.
    #[tracing::instrument(skip(self), fields(component = "messaging", app_id = %self.inner.app_id))]
    pub async fn register_topic(&self, topic: &str) -> Result<()> {
        self.inner.topology.declare_topic(topic).await?;
        self.inner.topics.write().await.insert(topic.to_string());
        Ok(())
    }

    pub async fn registered_topics(&self) -> Vec<String> {
        self.inner.topics.read().await.iter().cloned().collect()
    }

    pub async fn is_registered(&self, topic: &str) -> bool {
        self.inner.topics.read().await.contains(topic)
    }

    /// Declares this application's queue for `topic`. Returns the queue name.
    #[tracing::instrument(skip(self), fields(component = "messaging", app_id = %self.inner.app_id))]
    pub async fn initialize_queue(&self, topic: &str) -> Result<String> {
        self.inner
            .topology
            .declare_queue(&self.inner.app_id, topic)
            .await
    }

    /// Re-declares every registered topic, after the connection was replaced.
    pub async fn restore_topics(&self) -> Result<()> {
        for topic in self.registered_topics().await {
            self.inner.topology.declare_topic(&topic).await?;
        }
        Ok(())
    }

    /// Publishes `payload` to a registered topic as a persistent message.
    #[tracing::instrument(
        skip(self, scope, payload),
        fields(component = "messaging", correlation_id = %scope.correlation_id())
    )]
    pub async fn publish(
        &self,
        scope: &RequestScope,
        topic: &str,
        payload: Vec<u8>,
        content_type: &str,
    ) -> Result<()> {
        self.ensure_registered(topic).await?;
        let message = outbound_message(&self.inner.app_id, scope, payload, content_type);
        self.inner.broker.publish(topic, message).await?;
        metrics::counter!("messages_published_total", "topic" => topic.to_string()).increment(1);
        Ok(())
    }

    /// Starts an atomic batch of publishes.
    pub async fn begin_publish(&self) -> Result<PublishBatch> {
        let transaction = self.inner.broker.begin_publish().await?;
        Ok(PublishBatch {
            client: self.clone(),
            transaction,
            topics: Vec::new(),
        })
    }

    /// Consumes this application's queue for `topic`, handling one message
    /// at a time with no bound on the broker side.
    pub async fn subscribe<H>(&self, topic: &str, handler: H) -> Result<()>
    where
        H: MessageHandler + 'static,
    {
        self.subscribe_with_options(topic, handler, SubscribeOptions::default())
            .await
    }

    /// Consumes this application's queue for `topic`.
    ///
    /// The queue must have been declared with [`Self::initialize_queue`]. A
    /// topic can have one active subscription; a subscription whose consumer
    /// ended, for example on connection loss, can be replaced.
    #[tracing::instrument(skip(self, handler), fields(component = "messaging", app_id = %self.inner.app_id))]
    pub async fn subscribe_with_options<H>(
        &self,
        topic: &str,
        handler: H,
        options: SubscribeOptions,
    ) -> Result<()>
    where
        H: MessageHandler + 'static,
    {
        let mut subscriptions = self.inner.subscriptions.lock().await;
        if subscriptions
            .get(topic)
            .is_some_and(|existing| !existing.task.is_finished())
        {
            return Err(MessagingError::AlreadySubscribed(topic.to_string()));
        }

        let queue = queue_name(&self.inner.app_id, topic);
        let consumer = self
            .inner
            .broker
            .consume(&queue, options.prefetch())
            .await?;

        let (stop, stop_rx) = watch::channel(false);
        let delivery_loop = DeliveryLoop {
            app_id: self.inner.app_id.clone(),
            topic: topic.to_string(),
            queue,
            handler: Arc::new(handler),
            options,
        };
        let task = tokio::spawn(delivery_loop.run(consumer, stop_rx));

        subscriptions.insert(topic.to_string(), Subscription { stop, task });
        Ok(())
    }

    pub async fn is_subscribed(&self, topic: &str) -> bool {
        self.inner
            .subscriptions
            .lock()
            .await
            .get(topic)
            .is_some_and(|subscription| !subscription.task.is_finished())
    }

    /// Stops consuming `topic`. Returns once in-flight handlers have settled
    /// their messages. Returns false if there was no subscription.
    #[tracing::instrument(skip(self), fields(component = "messaging", app_id = %self.inner.app_id))]
    pub async fn unsubscribe(&self, topic: &str) -> bool {
        let subscription = self.inner.subscriptions.lock().await.remove(topic);
        match subscription {
            Some(subscription) => {
                stop_subscription(topic, subscription).await;
                true
            }
            None => false,
        }
    }

    /// Stops every subscription and forgets all registered topics.
    pub async fn clean_up(&self) {
        let subscriptions: Vec<(String, Subscription)> =
            self.inner.subscriptions.lock().await.drain().collect();
        for (topic, subscription) in subscriptions {
            stop_subscription(&topic, subscription).await;
        }
        self.inner.topics.write().await.clear();
    }

    async fn ensure_registered(&self, topic: &str) -> Result<()> {
        if self.is_registered(topic).await {
            Ok(())
        } else {
            Err(MessagingError::UnregisteredTopic {
                app_id: self.inner.app_id.to_string(),
                topic: topic.to_string(),
            })
        }
    }
}

async fn stop_subscription(topic: &str, subscription: Subscription) {
    let _ = subscription.stop.send(true);
    if let Err(err) = subscription.task.await {
        tracing::error!(topic, error = %err, "subscription task failed");
    }
}

/// An atomic group of publishes: all become visible on [`PublishBatch::commit`],
/// none on [`PublishBatch::rollback`] or when the batch is dropped.
pub struct PublishBatch {
    client: MessagingClient,
    transaction: Box<dyn PublishTransaction>,
    topics: Vec<String>,
}

impl PublishBatch {
    pub async fn publish(
        &mut self,
        scope: &RequestScope,
        topic: &str,
        payload: Vec<u8>,
        content_type: &str,
    ) -> Result<()> {
        self.client.ensure_registered(topic).await?;
        let message = outbound_message(self.client.app_id(), scope, payload, content_type);
        self.transaction.publish(topic, message).await?;
        self.topics.push(topic.to_string());
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.topics.len()
    }

    pub fn is_empty(&self) -> bool {
        self.topics.is_empty()
    }

    pub async fn commit(self) -> Result<()> {
        self.transaction.commit().await?;
        for topic in self.topics {
            metrics::counter!("messages_published_total", "topic" => topic).increment(1);
        }
        Ok(())
    }

    pub async fn rollback(self) -> Result<()> {
        self.transaction.rollback().await
    }
}
