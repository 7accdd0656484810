use chrono::Utc;
use serde::{Deserialize, Serialize};

/// An application event as it travels over the bus and is stored in a saga.
///
/// The wire form is `{"EventType": .., "Timestamp": .., "Data": ..}` so events
/// interoperate with existing publishers. `data` is opaque to the coordinator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Event {
    /// The type of the event (e.g., "signup", "verify").
    pub event_type: String,

    /// When the event was created, in Unix seconds.
    pub timestamp: i64,

    /// The event payload.
    #[serde(default)]
    pub data: serde_json::Value,
}

impl Event {
    /// Creates an event stamped with the current time.
    pub fn new(event_type: impl Into<String>, data: serde_json::Value) -> Self {
        Self::with_timestamp(event_type, data, Utc::now().timestamp())
    }

    /// Creates an event with an explicit timestamp.
    pub fn with_timestamp(
        event_type: impl Into<String>,
        data: serde_json::Value,
        timestamp: i64,
    ) -> Self {
        Self {
            event_type: event_type.into(),
            timestamp,
            data,
        }
    }

    /// Decodes an event from its JSON wire form.
    pub fn from_json(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    /// Encodes the event to its JSON wire form.
    pub fn to_json(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}
