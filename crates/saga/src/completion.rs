//! Completion callbacks.

use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use common::RequestScope;
use messaging::MessagingClient;
use saga_store::{Event, Saga};

use crate::error::CompletionError;

/// Invoked once per saga instance when its last required event arrives.
///
/// Runs after the completion is committed and outside any storage
/// transaction. Returning an error marks the saga incomplete again, so the
/// callback may run again once an event for the saga is redelivered.
#[async_trait]
pub trait CompletionHandler: Send + Sync {
    async fn on_completed(&self, scope: &RequestScope, saga: &Saga) -> Result<(), CompletionError>;
}

#[async_trait]
impl<H: CompletionHandler + ?Sized> CompletionHandler for Arc<H> {
    async fn on_completed(&self, scope: &RequestScope, saga: &Saga) -> Result<(), CompletionError> {
        (**self).on_completed(scope, saga).await
    }
}

/// Publishes follow-up events when a saga completes, atomically in one batch.
///
/// Each follow-up event carries the saga name, key and collected events as
/// its data.
#[derive(Clone)]
pub struct PublishOnCompletion {
    client: MessagingClient,
    targets: Vec<(String, String)>,
}

impl PublishOnCompletion {
    /// Publishes an event of `event_type` to `topic`. The topic must be
    /// registered with `client`.
    pub fn new(
        client: MessagingClient,
        topic: impl Into<String>,
        event_type: impl Into<String>,
    ) -> Self {
        Self {
            client,
            targets: vec![(topic.into(), event_type.into())],
        }
    }

    /// Adds another follow-up event to the batch.
    pub fn and_publish(mut self, topic: impl Into<String>, event_type: impl Into<String>) -> Self {
        self.targets.push((topic.into(), event_type.into()));
        self
    }
}

#[async_trait]
impl CompletionHandler for PublishOnCompletion {
    #[tracing::instrument(
        skip_all,
        fields(saga_name = %saga.saga_name, saga_key = %saga.saga_key, events = self.targets.len())
    )]
    async fn on_completed(&self, scope: &RequestScope, saga: &Saga) -> Result<(), CompletionError> {
        let data = serde_json::json!({
            "saga_name": saga.saga_name,
            "saga_key": saga.saga_key,
            "events": serde_json::to_value(&saga.events)?,
        });

        let mut batch = self.client.begin_publish().await?;
        for (topic, event_type) in &self.targets {
            let payload = Event::new(event_type.as_str(), data.clone()).to_json()?;
            if let Err(err) = batch
                .publish(scope, topic, payload, "application/json")
                .await
            {
                if let Err(rollback_err) = batch.rollback().await {
                    tracing::warn!(error = %rollback_err, "failed to roll back follow-up events");
                }
                return Err(err.into());
            }
        }
        batch.commit().await?;

        tracing::info!("follow-up events published");
        Ok(())
    }
}

#[derive(Debug, Default)]
struct InMemoryCompletionState {
    completed: Vec<Saga>,
    fail_on_complete: bool,
}

/// In-memory completion handler for testing. Records every saga it is
/// called with.
#[derive(Debug, Clone, Default)]
pub struct InMemoryCompletionHandler {
    state: Arc<RwLock<InMemoryCompletionState>>,
}

impl InMemoryCompletionHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Configures the handler to fail every call until reset.
    pub fn set_fail_on_complete(&self, fail: bool) {
        self.write().fail_on_complete = fail;
    }

    /// Number of successful completion calls.
    pub fn completion_count(&self) -> usize {
        self.read().completed.len()
    }

    /// Sagas passed to successful completion calls, in call order.
    pub fn completed(&self) -> Vec<Saga> {
        self.read().completed.clone()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, InMemoryCompletionState> {
        self.state.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, InMemoryCompletionState> {
        self.state.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl CompletionHandler for InMemoryCompletionHandler {
    async fn on_completed(&self, _scope: &RequestScope, saga: &Saga) -> Result<(), CompletionError> {
        let mut state = self.write();
        if state.fail_on_complete {
            return Err(format!("completion of {} rejected", saga.saga_key).into());
        }
        state.completed.push(saga.clone());
        Ok(())
    }
}
