//! Feeds saga events arriving on a topic into a coordinator.

use std::sync::Arc;

use async_trait::async_trait;
use common::RequestScope;
use messaging::{Envelope, HandlerError, MessageHandler};
use saga_store::{Event, SagaStore};

use crate::completion::CompletionHandler;
use crate::coordinator::SagaCoordinator;
use crate::error::SagaError;

/// Derives the saga key from an event.
pub type KeyExtractor = Arc<dyn Fn(&Event) -> Option<String> + Send + Sync>;

/// Reads the saga key from a string or number field of the event data.
pub fn key_from_field(field: impl Into<String>) -> KeyExtractor {
    let field = field.into();
    Arc::new(move |event: &Event| match event.data.get(&field)? {
        serde_json::Value::String(key) if !key.is_empty() => Some(key.clone()),
        serde_json::Value::Number(key) => Some(key.to_string()),
        _ => None,
    })
}

/// Message handler that decodes each payload as an [`Event`] and adds it to
/// the saga named by its key.
///
/// Event types the saga does not track are acknowledged and ignored. Any
/// other failure is returned to the delivery loop, which requeues the message
/// once and dead-letters it on the second failure.
pub struct SagaEventListener<S, H>
where
    S: SagaStore,
    H: CompletionHandler,
{
    coordinator: Arc<SagaCoordinator<S, H>>,
    saga_key: KeyExtractor,
}

impl<S, H> SagaEventListener<S, H>
where
    S: SagaStore,
    H: CompletionHandler,
{
    pub fn new(coordinator: Arc<SagaCoordinator<S, H>>, saga_key: KeyExtractor) -> Self {
        Self {
            coordinator,
            saga_key,
        }
    }

    pub fn coordinator(&self) -> &Arc<SagaCoordinator<S, H>> {
        &self.coordinator
    }

    async fn on_event(&self, scope: &RequestScope, payload: &[u8]) -> Result<(), SagaError> {
        let event = Event::from_json(payload)?;

        if !self.coordinator.tracks(&event.event_type) {
            tracing::debug!(event_type = %event.event_type, "event not part of saga, ignored");
            return Ok(());
        }

        let saga_key = (self.saga_key)(&event).ok_or_else(|| SagaError::MissingSagaKey {
            event_type: event.event_type.clone(),
        })?;

        self.coordinator.add_event(scope, &saga_key, event).await?;
        Ok(())
    }
}

#[async_trait]
impl<S, H> MessageHandler for SagaEventListener<S, H>
where
    S: SagaStore,
    H: CompletionHandler,
{
    async fn handle(
        &self,
        scope: &RequestScope,
        envelope: &Envelope,
        payload: &[u8],
    ) -> Result<(), HandlerError> {
        self.on_event(scope, payload).await.map_err(|err| {
            tracing::warn!(
                saga_name = %self.coordinator.saga_name(),
                redelivered = envelope.redelivered,
                error = %err,
                "saga event rejected"
            );
            HandlerError::from(err)
        })
    }
}
