use std::collections::BTreeMap;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::Event;

/// Partial progress of one saga instance, keyed by `(saga_name, saga_key)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Saga {
    /// The saga definition this instance belongs to (e.g. "onboarding").
    pub saga_name: String,

    /// Caller-chosen correlation key scoping this instance (e.g. a user id).
    pub saga_key: String,

    /// Event types whose presence completes the saga.
    pub event_types: Vec<String>,

    /// Latest event received per event type.
    pub events: BTreeMap<String, Event>,

    /// Whether every required event type has been received and the completion
    /// has not been rolled back.
    pub completed: bool,

    /// Nanosecond Unix timestamp of the last write.
    pub updated_at: i64,
}

impl Saga {
    /// Creates an empty saga that has not seen any event yet.
    pub fn new(
        saga_name: impl Into<String>,
        saga_key: impl Into<String>,
        event_types: Vec<String>,
    ) -> Self {
        Self {
            saga_name: saga_name.into(),
            saga_key: saga_key.into(),
            event_types,
            events: BTreeMap::new(),
            completed: false,
            updated_at: 0,
        }
    }

    /// Stores `event`, replacing any earlier event of the same type.
    pub fn record(&mut self, event: Event) {
        self.events.insert(event.event_type.clone(), event);
    }

    /// Returns true if an event of every required type has been received.
    ///
    /// Presence based: arrival order and duplicates do not matter.
    pub fn has_all_events(&self) -> bool {
        self.event_types
            .iter()
            .all(|event_type| self.events.contains_key(event_type))
    }

    /// Returns the event received for `event_type`, if any.
    pub fn event(&self, event_type: &str) -> Option<&Event> {
        self.events.get(event_type)
    }

    /// Required event types that have not been received yet.
    pub fn missing_event_types(&self) -> Vec<&str> {
        self.event_types
            .iter()
            .filter(|event_type| !self.events.contains_key(*event_type))
            .map(String::as_str)
            .collect()
    }

    /// Advances `updated_at` to now, strictly past its previous value.
    pub fn touch(&mut self) {
        let now = Utc::now().timestamp_nanos_opt().unwrap_or(i64::MAX);
        self.updated_at = now.max(self.updated_at.saturating_add(1));
    }
}
