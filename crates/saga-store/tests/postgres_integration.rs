//! PostgreSQL integration tests
//!
//! These tests use a shared PostgreSQL container for efficiency.
//! Run with:
//!
//! ```bash
//! cargo test -p saga-store --test postgres_integration -- --test-threads=1
//! ```

use std::sync::Arc;

use saga_store::{Event, IsolationLevel, PostgresSagaStore, Saga, SagaStore, SagaStoreError};
use serde_json::json;
use sqlx::PgPool;
use testcontainers::{ContainerAsync, runners::AsyncRunner};
use testcontainers_modules::postgres::Postgres;
use tokio::sync::OnceCell;

/// Shared container info - container stays alive for all tests
struct ContainerInfo {
    #[allow(dead_code)] // Container must stay alive for tests
    container: ContainerAsync<Postgres>,
    connection_string: String,
}

/// Global shared container
static CONTAINER: OnceCell<Arc<ContainerInfo>> = OnceCell::const_new();

async fn get_container_info() -> Arc<ContainerInfo> {
    CONTAINER
        .get_or_init(|| async {
            let container = Postgres::default().start().await.unwrap();

            let host = container.get_host().await.unwrap();
            let port = container.get_host_port_ipv4(5432).await.unwrap();

            let connection_string =
                format!("postgres://postgres:postgres@{}:{}/postgres", host, port);

            let temp_pool = PgPool::connect(&connection_string).await.unwrap();
            sqlx::raw_sql(include_str!(
                "../../../migrations/001_create_saga_manager_table.sql"
            ))
            .execute(&temp_pool)
            .await
            .unwrap();
            temp_pool.close().await;

            Arc::new(ContainerInfo {
                container,
                connection_string,
            })
        })
        .await
        .clone()
}

/// Get a fresh store with its own pool and a cleared table
async fn get_test_store() -> PostgresSagaStore {
    let info = get_container_info().await;

    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(5)
        .connect(&info.connection_string)
        .await
        .unwrap();

    sqlx::query("TRUNCATE TABLE saga_manager")
        .execute(&pool)
        .await
        .unwrap();

    PostgresSagaStore::new(pool)
}

fn onboarding(key: &str) -> Saga {
    Saga::new("onboarding", key, vec!["signup".into(), "verify".into()])
}

#[tokio::test]
async fn upsert_and_find_round_trips_all_columns() {
    let store = get_test_store().await;

    let mut saga = onboarding("user-1");
    saga.record(Event::with_timestamp("signup", json!({"user_id": "user-1"}), 10));
    saga.touch();

    let mut tx = store.begin(IsolationLevel::Serializable).await.unwrap();
    assert!(tx.find("onboarding", "user-1").await.unwrap().is_none());
    tx.upsert(&saga).await.unwrap();
    tx.commit().await.unwrap();

    let stored = store.find("onboarding", "user-1").await.unwrap().unwrap();
    assert_eq!(stored, saga);
}

#[tokio::test]
async fn upsert_replaces_existing_row() {
    let store = get_test_store().await;
    let mut saga = onboarding("user-2");
    saga.touch();

    let mut tx = store.begin(IsolationLevel::ReadCommitted).await.unwrap();
    tx.upsert(&saga).await.unwrap();
    tx.commit().await.unwrap();

    saga.record(Event::new("signup", json!({})));
    saga.record(Event::new("verify", json!({})));
    saga.completed = true;
    saga.touch();

    let mut tx = store.begin(IsolationLevel::ReadCommitted).await.unwrap();
    tx.upsert(&saga).await.unwrap();
    tx.commit().await.unwrap();

    let stored = store.find("onboarding", "user-2").await.unwrap().unwrap();
    assert!(stored.completed);
    assert_eq!(stored.events.len(), 2);

    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM saga_manager")
        .fetch_one(store.pool())
        .await
        .unwrap();
    assert_eq!(count, 1);
}

#[tokio::test]
async fn rollback_and_drop_discard_writes() {
    let store = get_test_store().await;

    let mut tx = store.begin(IsolationLevel::Serializable).await.unwrap();
    tx.upsert(&onboarding("user-3")).await.unwrap();
    tx.rollback().await.unwrap();

    let mut tx = store.begin(IsolationLevel::Serializable).await.unwrap();
    tx.upsert(&onboarding("user-3")).await.unwrap();
    drop(tx);

    assert!(store.find("onboarding", "user-3").await.unwrap().is_none());
}

#[tokio::test]
async fn concurrent_serializable_writers_conflict() {
    let store = get_test_store().await;

    let mut first = store.begin(IsolationLevel::Serializable).await.unwrap();
    let mut second = store.begin(IsolationLevel::Serializable).await.unwrap();
    assert!(first.find("onboarding", "user-4").await.unwrap().is_none());
    assert!(second.find("onboarding", "user-4").await.unwrap().is_none());

    let mut signup = onboarding("user-4");
    signup.record(Event::new("signup", json!({})));
    first.upsert(&signup).await.unwrap();
    first.commit().await.unwrap();

    let mut verify = onboarding("user-4");
    verify.record(Event::new("verify", json!({})));
    let outcome = match second.upsert(&verify).await {
        Ok(()) => second.commit().await,
        Err(e) => Err(e),
    };

    let err = outcome.unwrap_err();
    assert!(err.is_conflict(), "expected conflict, got {err}");
    assert!(
        matches!(&err, SagaStoreError::Conflict { saga_name, saga_key }
            if saga_name == "onboarding" && saga_key == "user-4"),
        "conflict names the saga: {err}"
    );

    let stored = store.find("onboarding", "user-4").await.unwrap().unwrap();
    assert!(stored.event("signup").is_some());
    assert!(stored.event("verify").is_none());
}

#[tokio::test]
async fn sagas_are_scoped_by_name() {
    let store = get_test_store().await;

    let mut tx = store.begin(IsolationLevel::Serializable).await.unwrap();
    tx.upsert(&onboarding("shared-key")).await.unwrap();
    tx.upsert(&Saga::new("checkout", "shared-key", vec!["paid".into()]))
        .await
        .unwrap();
    tx.commit().await.unwrap();

    let checkout = store.find("checkout", "shared-key").await.unwrap().unwrap();
    assert_eq!(checkout.event_types, vec!["paid".to_string()]);
    assert!(store.find("onboarding", "shared-key").await.unwrap().is_some());
}
