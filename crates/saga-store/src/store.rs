use async_trait::async_trait;

use crate::{Result, Saga};

/// Transaction isolation requested from the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IsolationLevel {
    /// Each statement sees committed data; concurrent writers do not conflict.
    #[default]
    ReadCommitted,

    /// The transaction behaves as if it ran alone. A concurrent commit touching
    /// the same saga makes this transaction fail with a conflict.
    Serializable,
}

impl IsolationLevel {
    /// The statement that applies this level to a freshly opened SQL transaction.
    pub fn set_transaction_sql(&self) -> &'static str {
        match self {
            IsolationLevel::ReadCommitted => "SET TRANSACTION ISOLATION LEVEL READ COMMITTED",
            IsolationLevel::Serializable => "SET TRANSACTION ISOLATION LEVEL SERIALIZABLE",
        }
    }
}

/// Core trait for saga store implementations.
///
/// A saga store persists one row per `(saga_name, saga_key)`. All mutation
/// goes through a [`SagaTransaction`] so callers can read, modify and write a
/// row atomically. All implementations must be thread-safe (Send + Sync).
#[async_trait]
pub trait SagaStore: Send + Sync {
    /// Opens a transaction with the given isolation level.
    async fn begin(&self, isolation: IsolationLevel) -> Result<Box<dyn SagaTransaction>>;

    /// Reads the committed state of a saga outside any transaction.
    async fn find(&self, saga_name: &str, saga_key: &str) -> Result<Option<Saga>>;
}

/// A unit of work against the saga store.
///
/// Dropping a transaction without calling [`commit`](Self::commit) discards
/// its writes.
#[async_trait]
pub trait SagaTransaction: Send {
    /// Reads a saga as seen by this transaction.
    async fn find(&mut self, saga_name: &str, saga_key: &str) -> Result<Option<Saga>>;

    /// Inserts the saga, or replaces every mutable column of an existing row.
    async fn upsert(&mut self, saga: &Saga) -> Result<()>;

    /// Makes all writes visible atomically.
    ///
    /// Fails with [`SagaStoreError::Conflict`](crate::SagaStoreError::Conflict)
    /// when a serializable transaction lost a race with a concurrent writer.
    async fn commit(self: Box<Self>) -> Result<()>;

    /// Discards all writes.
    async fn rollback(self: Box<Self>) -> Result<()>;
}

#[async_trait]
impl<T: SagaStore + ?Sized> SagaStore for std::sync::Arc<T> {
    async fn begin(&self, isolation: IsolationLevel) -> Result<Box<dyn SagaTransaction>> {
        (**self).begin(isolation).await
    }

    async fn find(&self, saga_name: &str, saga_key: &str) -> Result<Option<Saga>> {
        (**self).find(saga_name, saga_key).await
    }
}
