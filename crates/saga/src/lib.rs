//! Event-driven saga coordination.
//!
//! A saga waits for one event of each of a fixed set of types, keyed by a
//! saga key such as a user or order id. Events may arrive in any order, on
//! any number of consumers. The [`SagaCoordinator`] merges them into the
//! saga store under serializable transactions and runs the saga's
//! [`CompletionHandler`] exactly once when the set is complete.
//!
//! [`SagaEventListener`] connects a coordinator to a messaging subscription.

pub mod completion;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod listener;
pub mod outcome;

pub use completion::{CompletionHandler, InMemoryCompletionHandler, PublishOnCompletion};
pub use config::CoordinatorConfig;
pub use coordinator::SagaCoordinator;
pub use error::{CompletionError, Result, SagaError};
pub use listener::{KeyExtractor, SagaEventListener, key_from_field};
pub use outcome::AddEventOutcome;
