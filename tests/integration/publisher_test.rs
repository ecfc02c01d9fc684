use std::collections::HashSet;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use broker_link::message::with_retry_count;
use broker_link::rabbitmq::RabbitMQError;
use broker_link::{PublishOptions, RabbitMQClient};

use crate::support::{test_config, MockBroker};

async fn connected_client(broker: &Arc<MockBroker>) -> RabbitMQClient {
    let client = RabbitMQClient::new(test_config(), broker.transport()).unwrap();
    client.pool().connect().await.unwrap();
    client
}

#[tokio::test(start_paused = true)]
async fn publish_succeeds_after_transient_failures() {
    let broker = MockBroker::new();
    broker.publish_failures.store(3, Ordering::SeqCst);
    let client = connected_client(&broker).await;

    client
        .publish("donations", "created", b"{}", &PublishOptions::default())
        .await
        .unwrap();

    let publishes = broker.publishes();
    let counts: Vec<Option<u32>> = publishes.iter().map(|p| p.retry_count).collect();
    assert_eq!(counts, vec![Some(0), Some(1), Some(2), Some(3)]);
    assert_eq!(publishes.last().unwrap().delivery_mode, Some(2));

    let ids: HashSet<_> = publishes.iter().map(|p| p.message_id.clone()).collect();
    assert_eq!(ids.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn publish_gives_up_after_retry_attempts() {
    let broker = MockBroker::new();
    broker.publish_failures.store(usize::MAX, Ordering::SeqCst);
    let client = connected_client(&broker).await;

    let err = client
        .publish("donations", "created", b"{}", &PublishOptions::default())
        .await
        .unwrap_err();

    assert!(matches!(err, RabbitMQError::PublishError { attempts: 4, .. }));
    assert_eq!(broker.publishes().len(), 4);
}

#[tokio::test(start_paused = true)]
async fn publish_without_pool_fails_after_retries() {
    let broker = MockBroker::new();
    let client = RabbitMQClient::new(test_config(), broker.transport()).unwrap();

    let err = client
        .publish("donations", "created", b"{}", &PublishOptions::default())
        .await
        .unwrap_err();

    assert!(matches!(err, RabbitMQError::PublishError { attempts: 4, .. }));
    assert!(broker.publishes().is_empty());
}

#[tokio::test]
async fn unroutable_publish_counts_as_success() {
    let broker = MockBroker::new();
    broker.unroutable.store(true, Ordering::SeqCst);
    let client = connected_client(&broker).await;

    client
        .publish("donations", "nobody-listens", b"{}", &PublishOptions::default())
        .await
        .unwrap();

    assert_eq!(broker.publishes().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn retry_count_is_seeded_from_headers() {
    let broker = MockBroker::new();
    broker.publish_failures.store(1, Ordering::SeqCst);
    let client = connected_client(&broker).await;

    let options = PublishOptions {
        headers: Some(with_retry_count(None, 2)),
        persistent: false,
        ..PublishOptions::default()
    };
    client.publish("donations", "created", b"{}", &options).await.unwrap();

    let publishes = broker.publishes();
    let counts: Vec<Option<u32>> = publishes.iter().map(|p| p.retry_count).collect();
    assert_eq!(counts, vec![Some(2), Some(3)]);
    assert_eq!(publishes[0].delivery_mode, Some(1));
}

#[tokio::test]
async fn target_exchange_is_declared_but_default_exchange_is_not() {
    let broker = MockBroker::new();
    let client = connected_client(&broker).await;

    client
        .publish("donations", "created", b"{}", &PublishOptions::default())
        .await
        .unwrap();
    client
        .publish("", "reports", b"{}", &PublishOptions::default())
        .await
        .unwrap();

    let exchanges: Vec<String> = broker
        .exchanges
        .lock()
        .unwrap()
        .iter()
        .map(|(_, name)| name.clone())
        .collect();
    assert_eq!(exchanges, vec!["dlx".to_string(), "donations".to_string()]);
}

#[tokio::test]
async fn publishes_are_spread_over_pooled_channels() {
    let broker = MockBroker::new();
    let client = connected_client(&broker).await;

    for _ in 0..3 {
        client
            .publish_json("donations", "created", &serde_json::json!({"amount": 5}), &PublishOptions::default())
            .await
            .unwrap();
    }

    let connections: HashSet<usize> = broker.publishes().iter().map(|p| p.connection).collect();
    assert_eq!(connections, HashSet::from([0, 1, 2]));
}
