use std::collections::BTreeMap;

use async_trait::async_trait;
use sqlx::{PgPool, Postgres, Row, Transaction, postgres::PgRow};

use crate::{
    Event, IsolationLevel, Result, Saga, SagaStoreError,
    store::{SagaStore, SagaTransaction},
};

const SELECT_SAGA: &str = r#"
    SELECT saga_name, saga_key, timestamp, events, event_types, completed
    FROM saga_manager
    WHERE saga_name = $1 AND saga_key = $2
"#;

const UPSERT_SAGA: &str = r#"
    INSERT INTO saga_manager (saga_name, saga_key, timestamp, events, event_types, completed)
    VALUES ($1, $2, $3, $4::json, $5, $6)
    ON CONFLICT (saga_name, saga_key) DO UPDATE SET
        timestamp = EXCLUDED.timestamp,
        events = EXCLUDED.events,
        event_types = EXCLUDED.event_types,
        completed = EXCLUDED.completed
"#;

/// PostgreSQL-backed saga store implementation.
#[derive(Clone)]
pub struct PostgresSagaStore {
    pool: PgPool,
}

impl PostgresSagaStore {
    /// Creates a new PostgreSQL saga store.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Gets a reference to the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Runs the database migrations.
    pub async fn run_migrations(&self) -> Result<()> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }

    fn row_to_saga(row: PgRow) -> Result<Saga> {
        let events_json: serde_json::Value = row.try_get("events")?;
        let events: BTreeMap<String, Event> = serde_json::from_value(events_json)?;

        Ok(Saga {
            saga_name: row.try_get("saga_name")?,
            saga_key: row.try_get("saga_key")?,
            event_types: row.try_get("event_types")?,
            events,
            completed: row.try_get("completed")?,
            updated_at: row.try_get("timestamp")?,
        })
    }
}

#[async_trait]
impl SagaStore for PostgresSagaStore {
    #[tracing::instrument(skip(self), fields(component = "saga_store"))]
    async fn begin(&self, isolation: IsolationLevel) -> Result<Box<dyn SagaTransaction>> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(isolation.set_transaction_sql())
            .execute(&mut *tx)
            .await?;

        Ok(Box::new(PostgresSagaTransaction {
            tx,
            saga_name: String::new(),
            saga_key: String::new(),
        }))
    }

    #[tracing::instrument(skip(self), fields(component = "saga_store"))]
    async fn find(&self, saga_name: &str, saga_key: &str) -> Result<Option<Saga>> {
        let row: Option<PgRow> = sqlx::query(SELECT_SAGA)
            .bind(saga_name)
            .bind(saga_key)
            .fetch_optional(&self.pool)
            .await?;

        row.map(Self::row_to_saga).transpose()
    }
}

/// An open PostgreSQL transaction. Dropping it rolls back.
struct PostgresSagaTransaction {
    tx: Transaction<'static, Postgres>,
    // Last saga touched, so a failed commit can name it.
    saga_name: String,
    saga_key: String,
}

impl PostgresSagaTransaction {
    fn touch_key(&mut self, saga_name: &str, saga_key: &str) {
        saga_name.clone_into(&mut self.saga_name);
        saga_key.clone_into(&mut self.saga_key);
    }
}

#[async_trait]
impl SagaTransaction for PostgresSagaTransaction {
    async fn find(&mut self, saga_name: &str, saga_key: &str) -> Result<Option<Saga>> {
        self.touch_key(saga_name, saga_key);

        let row: Option<PgRow> = sqlx::query(SELECT_SAGA)
            .bind(saga_name)
            .bind(saga_key)
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(|e| SagaStoreError::from_database(e, saga_name, saga_key))?;

        row.map(PostgresSagaStore::row_to_saga).transpose()
    }

    async fn upsert(&mut self, saga: &Saga) -> Result<()> {
        self.touch_key(&saga.saga_name, &saga.saga_key);
        let events_json = serde_json::to_value(&saga.events)?;

        sqlx::query(UPSERT_SAGA)
            .bind(&saga.saga_name)
            .bind(&saga.saga_key)
            .bind(saga.updated_at)
            .bind(events_json)
            .bind(&saga.event_types)
            .bind(saga.completed)
            .execute(&mut *self.tx)
            .await
            .map_err(|e| SagaStoreError::from_database(e, &saga.saga_name, &saga.saga_key))?;

        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let PostgresSagaTransaction {
            tx,
            saga_name,
            saga_key,
        } = *self;

        tx.commit().await.map_err(|e| {
            let err = SagaStoreError::from_database(e, &saga_name, &saga_key);
            if err.is_conflict() {
                tracing::debug!(%saga_name, %saga_key, "serializable commit conflict");
            }
            err
        })
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        self.tx.rollback().await?;
        Ok(())
    }
}
