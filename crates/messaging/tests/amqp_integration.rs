//! RabbitMQ integration tests
//!
//! These tests share one RabbitMQ container and run serially.
//! Run with:
//!
//! ```bash
//! cargo test -p messaging --test amqp_integration
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use common::RequestScope;
use messaging::{
    AmqpBroker, Broker, HandlerError, MessagingClient, MessagingError, SubscribeOptions,
    TopologyConfig, dead_letter_name, handler_fn,
};
use serial_test::serial;
use testcontainers::{ContainerAsync, runners::AsyncRunner};
use testcontainers_modules::rabbitmq::RabbitMq;
use tokio::sync::OnceCell;

/// Shared container info - container stays alive for all tests
struct ContainerInfo {
    #[allow(dead_code)] // Container must stay alive for tests
    container: ContainerAsync<RabbitMq>,
    amqp_url: String,
}

/// Global shared container
static CONTAINER: OnceCell<Arc<ContainerInfo>> = OnceCell::const_new();

async fn get_container_info() -> Arc<ContainerInfo> {
    CONTAINER
        .get_or_init(|| async {
            let container = RabbitMq::default().start().await.unwrap();

            let host = container.get_host().await.unwrap();
            let port = container.get_host_port_ipv4(5672).await.unwrap();

            Arc::new(ContainerInfo {
                container,
                amqp_url: format!("amqp://{}:{}", host, port),
            })
        })
        .await
        .clone()
}

async fn get_broker() -> Arc<dyn Broker> {
    let info = get_container_info().await;
    Arc::new(AmqpBroker::connect(info.amqp_url.clone()).await.unwrap())
}

/// Topic names unique per test so queues do not leak between tests.
fn unique_topic(prefix: &str) -> String {
    format!("{}.{}", prefix, uuid::Uuid::new_v4().simple())
}

fn quick_topology() -> TopologyConfig {
    TopologyConfig {
        queue_declare_attempts: 2,
        queue_declare_retry_delay: Duration::from_millis(100),
    }
}

#[tokio::test]
#[serial]
async fn published_message_reaches_handler_with_metadata() {
    let broker = get_broker().await;
    let topic = unique_topic("user.signup");
    let publisher = MessagingClient::new("accounts", Arc::clone(&broker));
    let subscriber = MessagingClient::new("billing", Arc::clone(&broker));

    publisher.register_topic(&topic).await.unwrap();
    subscriber.initialize_queue(&topic).await.unwrap();

    let (seen_tx, mut seen_rx) = tokio::sync::mpsc::unbounded_channel();
    subscriber
        .subscribe(
            &topic,
            handler_fn(move |scope, envelope, payload| {
                let seen_tx = seen_tx.clone();
                async move {
                    seen_tx.send((scope, envelope, payload)).unwrap();
                    Ok::<(), HandlerError>(())
                }
            }),
        )
        .await
        .unwrap();

    let scope = RequestScope::new("accounts", "corr-42").with_user("user-1", ["admin"]);
    publisher
        .publish(&scope, &topic, br#"{"EventType":"signup"}"#.to_vec(), "application/json")
        .await
        .unwrap();

    let (scope, envelope, payload) = tokio::time::timeout(Duration::from_secs(10), seen_rx.recv())
        .await
        .unwrap()
        .unwrap();

    assert_eq!(payload, br#"{"EventType":"signup"}"#);
    assert_eq!(scope.correlation_id(), "corr-42");
    assert_eq!(scope.from_app_id().map(|id| id.as_str()), Some("accounts"));
    assert_eq!(scope.authorized_user_id(), Some("user-1"));
    assert_eq!(envelope.authorized_user_roles, vec!["admin"]);
    assert_eq!(envelope.content_type.as_deref(), Some("application/json"));
    assert!(envelope.message_id.is_some());

    subscriber.clean_up().await;
}

#[tokio::test]
#[serial]
async fn failing_message_is_dead_lettered_after_redelivery() {
    let broker = get_broker().await;
    let topic = unique_topic("orders");
    let client = MessagingClient::new("billing", Arc::clone(&broker));
    client.register_topic(&topic).await.unwrap();
    client.initialize_queue(&topic).await.unwrap();

    let attempts = Arc::new(AtomicUsize::new(0));
    let counted = Arc::clone(&attempts);
    client
        .subscribe_with_options(
            &topic,
            handler_fn(move |_scope, _envelope, _payload| {
                let counted = Arc::clone(&counted);
                async move {
                    counted.fetch_add(1, Ordering::SeqCst);
                    Err::<(), HandlerError>("cannot process".into())
                }
            }),
            SubscribeOptions::with_max_concurrent_messages(1),
        )
        .await
        .unwrap();

    client
        .publish(&RequestScope::for_app("billing"), &topic, b"poison".to_vec(), "text/plain")
        .await
        .unwrap();

    let dead_letter = dead_letter_name(client.app_id(), &topic);
    let mut dead_letters = broker.consume(&dead_letter, 0).await.unwrap();
    let dead = tokio::time::timeout(Duration::from_secs(10), dead_letters.next_delivery())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(dead.body, b"poison");
    dead.ack().await.unwrap();

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(attempts.load(Ordering::SeqCst), 2);

    dead_letters.cancel().await.unwrap();
    client.clean_up().await;
}

#[tokio::test]
#[serial]
async fn batch_publishes_only_on_commit() {
    let broker = get_broker().await;
    let topic = unique_topic("batch");
    let client = MessagingClient::new("billing", Arc::clone(&broker));
    client.register_topic(&topic).await.unwrap();
    client.initialize_queue(&topic).await.unwrap();
    let scope = RequestScope::for_app("billing");

    let mut batch = client.begin_publish().await.unwrap();
    batch.publish(&scope, &topic, b"dropped".to_vec(), "").await.unwrap();
    batch.rollback().await.unwrap();

    let mut batch = client.begin_publish().await.unwrap();
    batch.publish(&scope, &topic, b"one".to_vec(), "").await.unwrap();
    batch.publish(&scope, &topic, b"two".to_vec(), "").await.unwrap();
    batch.commit().await.unwrap();

    let mut consumer = broker
        .consume(&messaging::queue_name(client.app_id(), &topic), 0)
        .await
        .unwrap();
    let mut bodies = Vec::new();
    for _ in 0..2 {
        let delivery = tokio::time::timeout(Duration::from_secs(10), consumer.next_delivery())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        bodies.push(delivery.body.clone());
        delivery.ack().await.unwrap();
    }
    let extra = tokio::time::timeout(Duration::from_millis(500), consumer.next_delivery()).await;

    assert_eq!(bodies, vec![b"one".to_vec(), b"two".to_vec()]);
    assert!(extra.is_err());
    consumer.cancel().await.unwrap();
}

#[tokio::test]
#[serial]
async fn queue_for_missing_topic_fails_after_retries() {
    let broker = get_broker().await;
    let client = MessagingClient::with_topology_config("billing", broker, quick_topology());

    let err = client
        .initialize_queue(&unique_topic("missing"))
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        MessagingError::TopologyNotFound { kind: "topic", .. }
    ));
}

#[tokio::test]
#[serial]
async fn topology_declarations_are_idempotent() {
    let broker = get_broker().await;
    let topic = unique_topic("idempotent");
    let client = MessagingClient::new("billing", Arc::clone(&broker));

    client.register_topic(&topic).await.unwrap();
    client.register_topic(&topic).await.unwrap();
    let first = client.initialize_queue(&topic).await.unwrap();
    let second = client.initialize_queue(&topic).await.unwrap();

    assert_eq!(first, second);
    broker.declare_exchange(&topic, true).await.unwrap();
    assert!(broker.is_connected());
}
