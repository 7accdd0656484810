//! Saga coordinator.

use std::time::Instant;

use common::RequestScope;
use saga_store::{Event, IsolationLevel, Saga, SagaStore, SagaStoreError};

use crate::completion::CompletionHandler;
use crate::config::CoordinatorConfig;
use crate::error::{CompletionError, Result, SagaError};
use crate::outcome::AddEventOutcome;

/// Collects the events of one saga definition and fires its completion
/// callback exactly once per saga key.
///
/// Every event is merged into the stored saga under a serializable
/// transaction, so concurrent events for the same key cannot both see the
/// saga as complete. Conflicting commits are retried up to
/// [`CoordinatorConfig::max_commit_attempts`] times.
pub struct SagaCoordinator<S, H>
where
    S: SagaStore,
    H: CompletionHandler,
{
    saga_name: String,
    event_types: Vec<String>,
    store: S,
    completion: H,
    config: CoordinatorConfig,
}

impl<S, H> SagaCoordinator<S, H>
where
    S: SagaStore,
    H: CompletionHandler,
{
    /// Creates a coordinator for the saga `saga_name`, complete once an event
    /// of each of `event_types` has been received.
    pub fn new<I, T>(
        saga_name: impl Into<String>,
        event_types: I,
        store: S,
        completion: H,
    ) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        let mut unique: Vec<String> = Vec::new();
        for event_type in event_types {
            let event_type = event_type.into();
            if !unique.contains(&event_type) {
                unique.push(event_type);
            }
        }

        Self {
            saga_name: saga_name.into(),
            event_types: unique,
            store,
            completion,
            config: CoordinatorConfig::default(),
        }
    }

    pub fn with_config(mut self, config: CoordinatorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn saga_name(&self) -> &str {
        &self.saga_name
    }

    pub fn event_types(&self) -> &[String] {
        &self.event_types
    }

    /// Returns true if `event_type` is one this saga waits for.
    pub fn tracks(&self, event_type: &str) -> bool {
        self.event_types.iter().any(|tracked| tracked == event_type)
    }

    /// Returns the stored saga for `saga_key`, if any event was recorded.
    pub async fn get_saga(&self, saga_key: &str) -> Result<Option<Saga>> {
        Ok(self.store.find(&self.saga_name, saga_key).await?)
    }

    /// Records `event` in the saga for `saga_key`.
    ///
    /// When the event completes the saga, the completion callback runs after
    /// the completion is committed. If the callback fails the saga is marked
    /// incomplete again and the callback error is returned, so redelivering
    /// any of the saga's events retries the completion.
    #[tracing::instrument(
        skip(self, scope, event),
        fields(
            component = "saga",
            saga_name = %self.saga_name,
            event_type = %event.event_type,
            correlation_id = %scope.correlation_id(),
        )
    )]
    pub async fn add_event(
        &self,
        scope: &RequestScope,
        saga_key: &str,
        event: Event,
    ) -> Result<AddEventOutcome> {
        if !self.tracks(&event.event_type) {
            return Err(SagaError::InvalidEventType {
                saga_name: self.saga_name.clone(),
                event_type: event.event_type,
            });
        }

        let started = Instant::now();
        metrics::counter!("saga_events_total", "saga" => self.saga_name.clone()).increment(1);

        let outcome = self.record_event(saga_key, &event).await;
        let outcome = match outcome {
            Ok(AddEventOutcome::Completed(saga)) => self.complete(scope, saga).await,
            Ok(AddEventOutcome::AlreadyCompleted(saga)) => {
                metrics::counter!("saga_already_completed_total", "saga" => self.saga_name.clone())
                    .increment(1);
                tracing::debug!("saga already completed, event ignored");
                Ok(AddEventOutcome::AlreadyCompleted(saga))
            }
            other => other,
        };

        metrics::histogram!("saga_add_event_duration_seconds", "saga" => self.saga_name.clone())
            .record(started.elapsed().as_secs_f64());
        outcome
    }

    /// Read-modify-write of the saga row, retried on commit conflicts.
    async fn record_event(&self, saga_key: &str, event: &Event) -> Result<AddEventOutcome> {
        let attempts = self.config.attempts();
        let mut attempt = 1;

        loop {
            match self.try_record_event(saga_key, event).await {
                Ok(outcome) => return Ok(outcome),
                Err(err) if err.is_conflict() => {
                    metrics::counter!("saga_commit_conflicts_total", "saga" => self.saga_name.clone())
                        .increment(1);
                    if attempt >= attempts {
                        tracing::warn!(attempt, "saga commit conflict, giving up");
                        return Err(SagaError::StorageConflict {
                            saga_name: self.saga_name.clone(),
                            saga_key: saga_key.to_string(),
                            attempts,
                            source: err,
                        });
                    }
                    tracing::debug!(attempt, "saga commit conflict, retrying");
                    attempt += 1;
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    async fn try_record_event(
        &self,
        saga_key: &str,
        event: &Event,
    ) -> std::result::Result<AddEventOutcome, SagaStoreError> {
        let mut tx = self.store.begin(IsolationLevel::Serializable).await?;

        let mut saga = tx
            .find(&self.saga_name, saga_key)
            .await?
            .unwrap_or_else(|| Saga::new(&self.saga_name, saga_key, self.event_types.clone()));

        if saga.completed {
            tx.rollback().await?;
            return Ok(AddEventOutcome::AlreadyCompleted(saga));
        }

        saga.event_types = self.event_types.clone();
        saga.record(event.clone());
        saga.completed = saga.has_all_events();
        saga.touch();

        tx.upsert(&saga).await?;
        tx.commit().await?;

        if saga.completed {
            Ok(AddEventOutcome::Completed(saga))
        } else {
            tracing::debug!(missing = ?saga.missing_event_types(), "event recorded");
            Ok(AddEventOutcome::Pending(saga))
        }
    }

    async fn complete(&self, scope: &RequestScope, saga: Saga) -> Result<AddEventOutcome> {
        match self.completion.on_completed(scope, &saga).await {
            Ok(()) => {
                metrics::counter!("saga_completed_total", "saga" => self.saga_name.clone())
                    .increment(1);
                tracing::info!(saga_key = %saga.saga_key, "saga completed");
                Ok(AddEventOutcome::Completed(saga))
            }
            Err(callback_error) => {
                metrics::counter!("saga_completion_rollbacks_total", "saga" => self.saga_name.clone())
                    .increment(1);
                tracing::warn!(
                    saga_key = %saga.saga_key,
                    error = %callback_error,
                    "completion callback failed, reverting completion"
                );
                Err(self.revert_completion(saga, callback_error).await)
            }
        }
    }

    async fn revert_completion(&self, mut saga: Saga, callback_error: CompletionError) -> SagaError {
        saga.completed = false;
        saga.touch();

        match self.persist_with_retry(&saga).await {
            Ok(()) => SagaError::CompletionFailed {
                saga_name: saga.saga_name,
                saga_key: saga.saga_key,
                source: callback_error,
            },
            Err(err) => {
                tracing::error!(
                    saga_key = %saga.saga_key,
                    error = %err,
                    "failed to revert saga completion"
                );
                SagaError::CompletionRollbackFailed {
                    saga_name: saga.saga_name,
                    saga_key: saga.saga_key,
                    callback_error: callback_error.to_string(),
                    source: err,
                }
            }
        }
    }

    /// Writes `saga`, retrying conflicts and database errors up to the
    /// commit budget. A revert that never lands leaves the saga completed
    /// with no callback run.
    async fn persist_with_retry(&self, saga: &Saga) -> std::result::Result<(), SagaStoreError> {
        let attempts = self.config.attempts();
        let mut attempt = 1;

        loop {
            match self.persist(saga).await {
                Ok(()) => return Ok(()),
                Err(err) if err.is_retryable() && attempt < attempts => {
                    tracing::debug!(attempt, error = %err, "saga revert failed, retrying");
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn persist(&self, saga: &Saga) -> std::result::Result<(), SagaStoreError> {
        let mut tx = self.store.begin(IsolationLevel::ReadCommitted).await?;
        tx.upsert(saga).await?;
        tx.commit().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::completion::InMemoryCompletionHandler;
    use saga_store::InMemorySagaStore;
    use serde_json::json;

    type TestCoordinator = SagaCoordinator<InMemorySagaStore, InMemoryCompletionHandler>;

    fn coordinator(event_types: &[&str]) -> (TestCoordinator, InMemorySagaStore, InMemoryCompletionHandler) {
        let store = InMemorySagaStore::new();
        let completion = InMemoryCompletionHandler::new();
        let coordinator = SagaCoordinator::new(
            "onboarding",
            event_types.iter().copied(),
            store.clone(),
            completion.clone(),
        );
        (coordinator, store, completion)
    }

    fn scope() -> RequestScope {
        RequestScope::new("onboarding-service", "corr-1")
    }

    fn event(event_type: &str) -> Event {
        Event::new(event_type, json!({"user_id": "user-1"}))
    }

    #[tokio::test]
    async fn onboarding_scenario() {
        let (coordinator, store, completion) = coordinator(&["signup", "verify"]);

        let first = coordinator
            .add_event(&scope(), "user-1", event("signup"))
            .await
            .unwrap();
        assert!(matches!(first, AddEventOutcome::Pending(_)));
        assert!(!first.saga().completed);

        let second = coordinator
            .add_event(&scope(), "user-1", event("verify"))
            .await
            .unwrap();
        assert!(second.is_completed());
        assert!(second.saga().completed);
        assert_eq!(completion.completion_count(), 1);

        let duplicate = coordinator
            .add_event(&scope(), "user-1", event("signup"))
            .await
            .unwrap();
        assert!(duplicate.is_already_completed());
        assert_eq!(completion.completion_count(), 1);

        let stored = store.get("onboarding", "user-1").unwrap();
        assert!(stored.completed);
        assert_eq!(stored.events.len(), 2);
    }

    #[tokio::test]
    async fn invalid_event_type_is_rejected_without_writing() {
        let (coordinator, store, _) = coordinator(&["signup", "verify"]);

        let err = coordinator
            .add_event(&scope(), "user-1", event("delete"))
            .await
            .unwrap_err();

        assert!(matches!(err, SagaError::InvalidEventType { ref event_type, .. } if event_type == "delete"));
        assert_eq!(store.commit_count(), 0);
        assert!(coordinator.get_saga("user-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn invalid_event_type_leaves_stored_saga_unchanged() {
        let (coordinator, store, _) = coordinator(&["signup", "verify"]);
        coordinator
            .add_event(&scope(), "user-1", event("signup"))
            .await
            .unwrap();
        let before = store.get("onboarding", "user-1").unwrap();
        let commits = store.commit_count();

        let err = coordinator
            .add_event(&scope(), "user-1", event("delete"))
            .await
            .unwrap_err();

        assert!(matches!(err, SagaError::InvalidEventType { .. }));
        let after = store.get("onboarding", "user-1").unwrap();
        assert_eq!(after, before);
        assert_eq!(after.updated_at, before.updated_at);
        assert_eq!(after.events, before.events);
        assert!(!after.completed);
        assert_eq!(store.commit_count(), commits);
    }

    #[tokio::test]
    async fn latest_event_of_a_type_wins() {
        let (coordinator, _, _) = coordinator(&["signup", "verify"]);

        coordinator
            .add_event(&scope(), "user-1", Event::with_timestamp("signup", json!({"n": 1}), 1))
            .await
            .unwrap();
        let outcome = coordinator
            .add_event(&scope(), "user-1", Event::with_timestamp("signup", json!({"n": 2}), 2))
            .await
            .unwrap();

        let saga = outcome.into_saga();
        assert_eq!(saga.events.len(), 1);
        assert_eq!(saga.event("signup").unwrap().data["n"], 2);
        assert!(!saga.completed);
    }

    #[tokio::test]
    async fn completion_is_order_independent() {
        let orders = [
            ["a", "b", "c"],
            ["a", "c", "b"],
            ["b", "a", "c"],
            ["b", "c", "a"],
            ["c", "a", "b"],
            ["c", "b", "a"],
        ];

        for order in orders {
            let (coordinator, _, completion) = coordinator(&["a", "b", "c"]);
            let mut outcomes = Vec::new();
            for event_type in order {
                outcomes.push(
                    coordinator
                        .add_event(&scope(), "key", event(event_type))
                        .await
                        .unwrap(),
                );
            }

            assert!(!outcomes[0].is_completed(), "{order:?}");
            assert!(!outcomes[1].is_completed(), "{order:?}");
            assert!(outcomes[2].is_completed(), "{order:?}");
            assert_eq!(completion.completion_count(), 1, "{order:?}");
        }
    }

    #[tokio::test]
    async fn failed_callback_reverts_completion_and_retry_succeeds() {
        let (coordinator, store, completion) = coordinator(&["signup", "verify"]);
        coordinator
            .add_event(&scope(), "user-1", event("signup"))
            .await
            .unwrap();

        completion.set_fail_on_complete(true);
        let err = coordinator
            .add_event(&scope(), "user-1", event("verify"))
            .await
            .unwrap_err();
        assert!(matches!(err, SagaError::CompletionFailed { .. }));
        assert!(err.is_completion_failure());

        let reverted = store.get("onboarding", "user-1").unwrap();
        assert!(!reverted.completed);
        assert_eq!(reverted.events.len(), 2);

        completion.set_fail_on_complete(false);
        let retried = coordinator
            .add_event(&scope(), "user-1", event("verify"))
            .await
            .unwrap();
        assert!(retried.is_completed());
        assert_eq!(completion.completion_count(), 1);
        assert!(store.get("onboarding", "user-1").unwrap().completed);
    }

    /// Fails the callback and arms store conflicts for the revert that follows.
    struct ConflictingCompletion {
        store: InMemorySagaStore,
        conflicts: usize,
        calls: std::sync::atomic::AtomicUsize,
    }

    #[async_trait::async_trait]
    impl CompletionHandler for ConflictingCompletion {
        async fn on_completed(&self, _scope: &RequestScope, _saga: &Saga) -> std::result::Result<(), CompletionError> {
            let call = self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            if call == 0 {
                self.store.fail_next_commits(self.conflicts);
                return Err("downstream unavailable".into());
            }
            Ok(())
        }
    }

    fn conflicting_coordinator(
        conflicts: usize,
    ) -> (
        SagaCoordinator<InMemorySagaStore, std::sync::Arc<ConflictingCompletion>>,
        InMemorySagaStore,
        std::sync::Arc<ConflictingCompletion>,
    ) {
        let store = InMemorySagaStore::new();
        let completion = std::sync::Arc::new(ConflictingCompletion {
            store: store.clone(),
            conflicts,
            calls: std::sync::atomic::AtomicUsize::new(0),
        });
        let coordinator = SagaCoordinator::new(
            "onboarding",
            ["signup", "verify"],
            store.clone(),
            std::sync::Arc::clone(&completion),
        );
        (coordinator, store, completion)
    }

    #[tokio::test]
    async fn revert_is_retried_after_a_conflict() {
        let (coordinator, store, completion) = conflicting_coordinator(1);
        coordinator
            .add_event(&scope(), "user-1", event("signup"))
            .await
            .unwrap();

        let err = coordinator
            .add_event(&scope(), "user-1", event("verify"))
            .await
            .unwrap_err();
        assert!(matches!(err, SagaError::CompletionFailed { .. }));
        assert!(!store.get("onboarding", "user-1").unwrap().completed);

        let redelivered = coordinator
            .add_event(&scope(), "user-1", event("verify"))
            .await
            .unwrap();
        assert!(redelivered.is_completed());
        assert_eq!(completion.calls.load(std::sync::atomic::Ordering::SeqCst), 2);
        assert!(store.get("onboarding", "user-1").unwrap().completed);
    }

    #[tokio::test]
    async fn revert_gives_up_after_budget() {
        let (coordinator, store, _) = conflicting_coordinator(2);
        coordinator
            .add_event(&scope(), "user-1", event("signup"))
            .await
            .unwrap();

        let err = coordinator
            .add_event(&scope(), "user-1", event("verify"))
            .await
            .unwrap_err();

        assert!(matches!(err, SagaError::CompletionRollbackFailed { .. }));
        assert!(err.is_completion_failure());
        assert!(store.get("onboarding", "user-1").unwrap().completed);
    }

    #[tokio::test]
    async fn single_conflict_is_retried() {
        let (coordinator, store, completion) = coordinator(&["signup"]);
        store.fail_next_commits(1);

        let outcome = coordinator
            .add_event(&scope(), "user-1", event("signup"))
            .await
            .unwrap();

        assert!(outcome.is_completed());
        assert_eq!(store.commit_count(), 1);
        assert_eq!(completion.completion_count(), 1);
    }

    #[tokio::test]
    async fn conflicts_beyond_budget_are_surfaced() {
        let (coordinator, store, completion) = coordinator(&["signup"]);
        store.fail_next_commits(2);

        let err = coordinator
            .add_event(&scope(), "user-1", event("signup"))
            .await
            .unwrap_err();

        assert!(matches!(err, SagaError::StorageConflict { attempts: 2, .. }));
        assert!(err.is_conflict());
        assert_eq!(store.saga_count(), 0);
        assert_eq!(completion.completion_count(), 0);
    }

    #[tokio::test]
    async fn configured_budget_is_honoured() {
        let (coordinator, store, _) = coordinator(&["signup"]);
        let coordinator = coordinator.with_config(CoordinatorConfig::with_max_commit_attempts(4));
        store.fail_next_commits(3);

        let outcome = coordinator
            .add_event(&scope(), "user-1", event("signup"))
            .await
            .unwrap();

        assert!(outcome.is_completed());
    }

    #[tokio::test]
    async fn keys_are_independent() {
        let (coordinator, _, completion) = coordinator(&["signup", "verify"]);

        for key in ["user-1", "user-2"] {
            coordinator.add_event(&scope(), key, event("signup")).await.unwrap();
        }
        coordinator
            .add_event(&scope(), "user-2", event("verify"))
            .await
            .unwrap();

        assert!(!coordinator.get_saga("user-1").await.unwrap().unwrap().completed);
        assert!(coordinator.get_saga("user-2").await.unwrap().unwrap().completed);
        assert_eq!(completion.completed()[0].saga_key, "user-2");
    }

    #[test]
    fn duplicate_event_types_are_collapsed() {
        let (coordinator, _, _) = coordinator(&["signup", "verify", "signup"]);
        assert_eq!(coordinator.event_types(), ["signup", "verify"]);
        assert!(coordinator.tracks("verify"));
        assert!(!coordinator.tracks("delete"));
    }
}
