//! AMQP/RabbitMQ broker integration tests using testcontainers.
//!
//! Run with: cargo test --test bus_amqp --features amqp -- --ignored --nocapture
//!
//! These tests spin up RabbitMQ in a container using testcontainers-rs.
//! No manual RabbitMQ setup required.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use switchyard::bus::{AmqpBroker, AmqpOptions, ConnectionState};
use switchyard::{Broker, BrokerError, BrokerEvent, Message, SendOptions};
use testcontainers::{
    core::{IntoContainerPort, WaitFor},
    runners::AsyncRunner,
    GenericImage, ImageExt,
};
use tokio::sync::mpsc;

/// Start RabbitMQ container.
///
/// Returns (container, amqp_url) where amqp_url is suitable for AMQP connection.
async fn start_rabbitmq() -> (testcontainers::ContainerAsync<GenericImage>, String) {
    let image = GenericImage::new("rabbitmq", "3-management")
        .with_exposed_port(5672.tcp())
        .with_wait_for(WaitFor::message_on_stdout("Server startup complete"));

    let container = image
        .with_startup_timeout(Duration::from_secs(60))
        .start()
        .await
        .expect("Failed to start rabbitmq container");

    // Brief delay to ensure RabbitMQ is fully ready
    tokio::time::sleep(Duration::from_secs(2)).await;

    let host_port = container
        .get_host_port_ipv4(5672)
        .await
        .expect("Failed to get mapped port");

    let host = container
        .get_host()
        .await
        .expect("Failed to get container host");

    let amqp_url = format!("amqp://guest:guest@{}:{}", host, host_port);

    println!("RabbitMQ available at: {}", amqp_url);

    (container, amqp_url)
}

async fn connected(url: &str, group: &str, options: AmqpOptions) -> AmqpBroker {
    let broker = AmqpBroker::new(group, options);
    broker.connect(url).await.expect("Failed to connect");
    assert_eq!(broker.state(), ConnectionState::Connected);
    broker
}

fn test_group() -> String {
    format!("test-{}", uuid::Uuid::new_v4())
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_call_and_reply() {
    let (_container, url) = start_rabbitmq().await;
    let group = test_group();

    let server = connected(&url, &group, AmqpOptions::default()).await;
    let client = connected(&url, &group, AmqpOptions::default()).await;

    server.core().on("greet", |msg: Message| async move {
        msg.ack().await?;
        msg.reply(&json!("hello")).await
    });
    server.subscribe(&["greet"]).await.expect("subscribe");

    let reply = client
        .call("greet", &json!("hi"), &SendOptions::default())
        .await
        .expect("call should resolve");

    assert_eq!(reply, json!("hello"));
    assert!(client.core().correlations().is_empty());
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_publish_without_subscribers() {
    let (_container, url) = start_rabbitmq().await;
    let broker = connected(&url, &test_group(), AmqpOptions::default()).await;

    broker
        .publish("ping", &json!("x"), &SendOptions::default())
        .await
        .expect("publish resolves with nothing bound");
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_call_times_out_without_subscriber() {
    let (_container, url) = start_rabbitmq().await;
    let client = connected(&url, &test_group(), AmqpOptions::default()).await;

    let err = client
        .call(
            "greet",
            &json!("hi"),
            &SendOptions::with_expiration(Duration::from_millis(50)),
        )
        .await
        .expect_err("nobody answers");

    assert!(err.is_timeout());
    assert!(client.core().correlations().is_empty());
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_subgroups_each_receive_events() {
    let (_container, url) = start_rabbitmq().await;
    let group = test_group();
    let (tx, mut rx) = mpsc::channel(8);

    let mut subscribers = Vec::new();
    for subgroup in ["cache", "audit"] {
        let options = AmqpOptions {
            subgroup: Some(subgroup.to_string()),
            ..Default::default()
        };
        let broker = connected(&url, &group, options).await;
        let tx = tx.clone();
        broker.core().on("update", move |msg: Message| {
            let tx = tx.clone();
            async move {
                msg.ack().await?;
                let _ = tx.send((subgroup, msg.data().clone())).await;
                Ok(())
            }
        });
        broker.subscribe(&["update"]).await.unwrap();
        subscribers.push(broker);
    }

    let publisher = connected(&url, &group, AmqpOptions::default()).await;
    publisher
        .publish("update", &json!({"id": 1}), &SendOptions::default())
        .await
        .unwrap();

    let mut seen = Vec::new();
    for _ in 0..2 {
        let (subgroup, data) = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("each subgroup receives the event")
            .unwrap();
        assert_eq!(data, json!({"id": 1}));
        seen.push(subgroup);
    }
    seen.sort();
    assert_eq!(seen, vec!["audit", "cache"]);
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_handler_failure_rejects_and_reports() {
    let (_container, url) = start_rabbitmq().await;
    let group = test_group();

    let broker = connected(&url, &group, AmqpOptions::default()).await;
    let attempts = Arc::new(AtomicUsize::new(0));
    let counter = attempts.clone();
    broker.core().on("explode", move |_msg: Message| {
        let counter = counter.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(BrokerError::handler("explode", "boom"))
        }
    });
    let mut events = broker.events();
    broker.subscribe(&["explode"]).await.unwrap();

    broker
        .publish("explode", &json!(null), &SendOptions::default())
        .await
        .unwrap();

    let notice = tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("error event emitted")
        .unwrap();
    assert!(matches!(notice, BrokerEvent::Error(_)));

    // Rejected without requeue: no redelivery.
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(attempts.load(Ordering::SeqCst), 1);
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_subscribe_twice_and_unsubscribe_twice() {
    let (_container, url) = start_rabbitmq().await;
    let broker = connected(&url, &test_group(), AmqpOptions::default()).await;

    broker.subscribe(&["greet"]).await.unwrap();
    broker.subscribe(&["greet"]).await.unwrap();
    assert_eq!(broker.core().subscribed_events(), vec!["greet"]);

    broker.unsubscribe(&["greet"]).await.unwrap();
    broker.unsubscribe(&["greet"]).await.unwrap();
    assert!(broker.core().subscribed_events().is_empty());
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_bad_credentials_are_fatal() {
    let (_container, url) = start_rabbitmq().await;
    let url = url.replace("guest:guest", "guest:wrong");

    let options = AmqpOptions {
        reconnect_timeout: Duration::from_millis(100),
        ..Default::default()
    };
    let broker = AmqpBroker::new(&test_group(), options);

    let result = tokio::time::timeout(Duration::from_secs(10), broker.connect(&url))
        .await
        .expect("fatal failure is not retried forever");

    assert!(result.is_err());
    assert_eq!(broker.state(), ConnectionState::Closed);
}
