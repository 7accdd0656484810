pub mod error;
pub mod event;
pub mod memory;
pub mod postgres;
pub mod saga;
pub mod store;

pub use error::{Result, SagaStoreError};
pub use event::Event;
pub use memory::InMemorySagaStore;
pub use postgres::PostgresSagaStore;
pub use saga::Saga;
pub use store::{IsolationLevel, SagaStore, SagaTransaction};
