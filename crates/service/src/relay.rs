//! Wires one saga between the bus and the saga store.

use std::sync::Arc;

use messaging::{ConnectionState, MessagingClient, SubscribeOptions};
use saga::{PublishOnCompletion, SagaCoordinator, SagaEventListener, key_from_field};
use saga_store::SagaStore;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::SagaSettings;
use crate::error::Result;

type Listener<S> = SagaEventListener<S, PublishOnCompletion>;

/// Consumes the saga's source topic and publishes a completion event to the
/// completed topic once every event of a saga has arrived.
pub struct SagaRelay<S: SagaStore + 'static> {
    client: MessagingClient,
    listener: Arc<Listener<S>>,
    source_topic: String,
    options: SubscribeOptions,
}

impl<S: SagaStore + 'static> SagaRelay<S> {
    /// Declares the topology the saga needs and builds its coordinator.
    ///
    /// Waits for the source topic to be declared by its publisher, retrying
    /// per the client's topology settings.
    #[tracing::instrument(skip_all, fields(component = "relay", saga_name = %settings.name))]
    pub async fn start(settings: &SagaSettings, client: MessagingClient, store: S) -> Result<Self> {
        client.register_topic(&settings.completed_topic).await?;
        let queue = client.initialize_queue(&settings.source_topic).await?;

        let completion = PublishOnCompletion::new(
            client.clone(),
            &settings.completed_topic,
            &settings.completed_event_type,
        );
        let coordinator = SagaCoordinator::new(
            &settings.name,
            settings.event_types.iter().cloned(),
            store,
            completion,
        )
        .with_config(settings.coordinator_config());
        let listener =
            SagaEventListener::new(Arc::new(coordinator), key_from_field(&settings.key_field));

        tracing::info!(%queue, event_types = ?settings.event_types, "saga relay ready");
        Ok(Self {
            client,
            listener: Arc::new(listener),
            source_topic: settings.source_topic.clone(),
            options: settings.subscribe_options(),
        })
    }

    pub fn client(&self) -> &MessagingClient {
        &self.client
    }

    /// Starts consuming the source topic.
    pub async fn subscribe(&self) -> Result<()> {
        self.client
            .subscribe_with_options(
                &self.source_topic,
                Arc::clone(&self.listener),
                self.options,
            )
            .await?;
        Ok(())
    }

    /// Replaces the subscription after every reconnect until the connection
    /// becomes terminal or `connection` closes.
    pub fn spawn_resubscriber(
        self: Arc<Self>,
        mut connection: watch::Receiver<ConnectionState>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            while connection.changed().await.is_ok() {
                let state = connection.borrow_and_update().clone();
                let connected = if state.is_connected() { 1.0 } else { 0.0 };
                metrics::gauge!("broker_connected").set(connected);

                match state {
                    ConnectionState::Connected => self.resubscribe().await,
                    ConnectionState::Terminal { .. } => break,
                    ConnectionState::Reconnecting { .. } => {}
                }
            }
        })
    }

    async fn resubscribe(&self) {
        // The old consumer ended with the connection; wait for its in-flight
        // handlers before consuming again.
        self.client.unsubscribe(&self.source_topic).await;
        match self.subscribe().await {
            Ok(()) => tracing::info!(topic = %self.source_topic, "resubscribed after reconnect"),
            Err(err) => {
                tracing::error!(topic = %self.source_topic, error = %err, "failed to resubscribe")
            }
        }
    }
}
