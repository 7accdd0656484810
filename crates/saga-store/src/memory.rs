use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;

use crate::{IsolationLevel, Result, Saga, SagaStore, SagaStoreError, SagaTransaction};

type RowKey = (String, String);

#[derive(Debug, Clone)]
struct VersionedRow {
    saga: Saga,
    version: u64,
}

#[derive(Debug, Default)]
struct MemoryState {
    rows: HashMap<RowKey, VersionedRow>,
    forced_conflicts: usize,
    commits: usize,
}

/// In-memory saga store implementation for testing.
///
/// Serializable transactions use first-committer-wins: a transaction fails to
/// commit if any row it read or wrote was changed by another commit after the
/// transaction first looked at it. That is the behaviour a PostgreSQL
/// `SERIALIZABLE` transaction shows for single-row read-modify-write.
#[derive(Debug, Clone, Default)]
pub struct InMemorySagaStore {
    state: Arc<Mutex<MemoryState>>,
}

impl InMemorySagaStore {
    /// Creates a new empty in-memory saga store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `count` commits fail with a conflict.
    pub fn fail_next_commits(&self, count: usize) {
        self.lock().forced_conflicts = count;
    }

    /// Returns the number of successful commits.
    pub fn commit_count(&self) -> usize {
        self.lock().commits
    }

    /// Returns the number of stored sagas.
    pub fn saga_count(&self) -> usize {
        self.lock().rows.len()
    }

    /// Returns the committed state of a saga without opening a transaction.
    pub fn get(&self, saga_name: &str, saga_key: &str) -> Option<Saga> {
        self.lock()
            .rows
            .get(&(saga_name.to_string(), saga_key.to_string()))
            .map(|row| row.saga.clone())
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        // A panic while holding the lock cannot leave a row half-written.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl SagaStore for InMemorySagaStore {
    async fn begin(&self, isolation: IsolationLevel) -> Result<Box<dyn SagaTransaction>> {
        Ok(Box::new(InMemoryTransaction {
            store: self.clone(),
            isolation,
            observed: HashMap::new(),
            writes: HashMap::new(),
        }))
    }

    async fn find(&self, saga_name: &str, saga_key: &str) -> Result<Option<Saga>> {
        Ok(self.get(saga_name, saga_key))
    }
}

struct InMemoryTransaction {
    store: InMemorySagaStore,
    isolation: IsolationLevel,
    /// Row version seen when the transaction first touched a key (0 = absent).
    observed: HashMap<RowKey, u64>,
    writes: HashMap<RowKey, Saga>,
}

impl InMemoryTransaction {
    fn observe(&mut self, key: &RowKey, state: &MemoryState) {
        if !self.observed.contains_key(key) {
            let version = state.rows.get(key).map_or(0, |row| row.version);
            self.observed.insert(key.clone(), version);
        }
    }
}

#[async_trait]
impl SagaTransaction for InMemoryTransaction {
    async fn find(&mut self, saga_name: &str, saga_key: &str) -> Result<Option<Saga>> {
        let key = (saga_name.to_string(), saga_key.to_string());
        if let Some(pending) = self.writes.get(&key) {
            return Ok(Some(pending.clone()));
        }

        let store = self.store.clone();
        let state = store.lock();
        self.observe(&key, &state);
        Ok(state.rows.get(&key).map(|row| row.saga.clone()))
    }

    async fn upsert(&mut self, saga: &Saga) -> Result<()> {
        let key = (saga.saga_name.clone(), saga.saga_key.clone());
        {
            let store = self.store.clone();
            let state = store.lock();
            self.observe(&key, &state);
        }
        self.writes.insert(key, saga.clone());
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let InMemoryTransaction {
            store,
            isolation,
            observed,
            writes,
        } = *self;
        let mut state = store.lock();

        if state.forced_conflicts > 0 {
            state.forced_conflicts -= 1;
            let (saga_name, saga_key) = writes
                .keys()
                .chain(observed.keys())
                .next()
                .cloned()
                .unwrap_or_default();
            return Err(SagaStoreError::Conflict {
                saga_name,
                saga_key,
            });
        }

        if isolation == IsolationLevel::Serializable {
            for (key, seen) in &observed {
                let current = state.rows.get(key).map_or(0, |row| row.version);
                if current != *seen {
                    return Err(SagaStoreError::Conflict {
                        saga_name: key.0.clone(),
                        saga_key: key.1.clone(),
                    });
                }
            }
        }

        for (key, saga) in writes {
            let version = state.rows.get(&key).map_or(0, |row| row.version) + 1;
            state.rows.insert(key, VersionedRow { saga, version });
        }
        state.commits += 1;

        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}
