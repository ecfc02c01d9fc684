use std::time::Duration;

use broker_link::rabbitmq::ConnectionState;
use broker_link::{ConsumerOptions, Message, Outcome, RabbitMQClient};

use crate::support::{test_config, wait_for, MockBroker};

fn client(broker: &std::sync::Arc<MockBroker>) -> RabbitMQClient {
    RabbitMQClient::new(test_config(), broker.transport()).unwrap()
}

#[tokio::test(start_paused = true)]
async fn simultaneous_failures_run_a_single_reconnect() {
    let broker = MockBroker::new();
    let client = client(&broker);
    client.pool().connect().await.unwrap();
    let reconnector = client.reconnector().clone();

    let (first, second) = tokio::join!(
        reconnector.reconnect("connection 0 closed"),
        reconnector.reconnect("connection 1 closed"),
    );

    assert!(first ^ second);
    assert_eq!(reconnector.reconnect_cycles(), 1);
    assert_eq!(broker.connects(), 6);
    assert_eq!(broker.open_connections(), 3);
    assert_eq!(client.state(), ConnectionState::Connected);
}

#[tokio::test(start_paused = true)]
async fn monitor_rebuilds_pool_after_connection_errors() {
    let broker = MockBroker::new();
    let client = client(&broker);
    client.connect().await.unwrap();

    broker.connection(0).kill();
    broker.connection(1).kill();

    wait_for(|| broker.connects() == 6 && client.state() == ConnectionState::Connected).await;
    tokio::time::sleep(Duration::from_secs(3)).await;

    assert_eq!(client.reconnector().reconnect_cycles(), 1);
    assert_eq!(broker.open_connections(), 3);
    assert_eq!(client.pool().snapshot().unwrap().id, 2);

    client.close().await.unwrap();
    assert_eq!(broker.open_connections(), 0);
}

#[tokio::test(start_paused = true)]
async fn stale_heartbeat_triggers_reconnect_only_after_interval() {
    let broker = MockBroker::new();
    let client = client(&broker);
    client.pool().connect().await.unwrap();
    let reconnector = client.reconnector();

    broker.connection(1).stall();
    assert!(!reconnector.check().await);

    tokio::time::advance(Duration::from_secs(1)).await;
    assert!(!reconnector.check().await);

    tokio::time::advance(Duration::from_millis(1500)).await;
    assert!(reconnector.check().await);

    assert_eq!(reconnector.reconnect_cycles(), 1);
    assert_eq!(broker.connects(), 6);
}

#[tokio::test(start_paused = true)]
async fn writable_pool_keeps_heartbeat_fresh() {
    let broker = MockBroker::new();
    let client = client(&broker);
    client.pool().connect().await.unwrap();
    let reconnector = client.reconnector();

    for _ in 0..5 {
        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(!reconnector.check().await);
    }

    assert_eq!(reconnector.reconnect_cycles(), 0);
    assert_eq!(broker.connects(), 3);
}

#[tokio::test(start_paused = true)]
async fn failed_rebuilds_are_retried_until_success() {
    let broker = MockBroker::new();
    broker
        .connect_plan
        .lock()
        .unwrap()
        .extend([true, true, true, false, false]);
    let client = client(&broker);
    client.pool().connect().await.unwrap();

    assert!(client.reconnector().reconnect("forced").await);

    // Three initial, two refused, three for the rebuilt pool.
    assert_eq!(broker.connects(), 8);
    assert_eq!(broker.open_connections(), 3);
    assert_eq!(client.state(), ConnectionState::Connected);
}

#[tokio::test(start_paused = true)]
async fn close_stops_a_failing_reconnect_loop() {
    let broker = MockBroker::new();
    {
        let mut plan = broker.connect_plan.lock().unwrap();
        plan.extend([true, true, true]);
        plan.extend(std::iter::repeat(false).take(1000));
    }
    let client = client(&broker);
    client.pool().connect().await.unwrap();

    let reconnector = client.reconnector().clone();
    let task = tokio::spawn(async move { reconnector.reconnect("forced").await });

    wait_for(|| broker.connects() >= 6).await;
    client.close().await.unwrap();

    assert!(!task.await.unwrap());
    assert_eq!(client.state(), ConnectionState::Disconnected);
    assert_eq!(broker.open_connections(), 0);
}

#[tokio::test(start_paused = true)]
async fn close_during_rebuild_discards_the_new_pool() {
    let broker = MockBroker::new();
    let client = client(&broker);
    client.pool().connect().await.unwrap();

    // The hook fires on the rebuilt pool's dead-letter exchange declaration,
    // after its connections are open but before it is installed.
    let pool = client.pool().clone();
    broker.on_next_exchange_declare(move || async move {
        pool.close().await.unwrap();
    });

    assert!(!client.reconnector().reconnect("forced").await);

    assert_eq!(broker.connects(), 6);
    assert_eq!(client.state(), ConnectionState::Disconnected);
    assert!(client.pool().snapshot().is_none());
    assert_eq!(broker.open_connections(), 0);
    assert_eq!(broker.open_channels(), 0);
}

#[tokio::test(start_paused = true)]
async fn consumers_are_replayed_once_each_after_reconnect() {
    let broker = MockBroker::new();
    let client = client(&broker);
    client.pool().connect().await.unwrap();

    for queue in ["A", "B"] {
        client
            .register_consumer(queue, |_message: Message| async { Outcome::Ack }, ConsumerOptions::default())
            .await
            .unwrap();
    }
    assert_eq!(broker.consumes().len(), 2);

    assert!(client.reconnector().reconnect("forced").await);

    let mut replayed: Vec<String> = broker
        .consumes()
        .into_iter()
        .filter(|record| record.connection >= 3)
        .map(|record| record.queue)
        .collect();
    replayed.sort();

    assert_eq!(replayed, vec!["A".to_string(), "B".to_string()]);
    assert_eq!(client.consumers().subscription_count(), 4);
    assert_eq!(client.consumers().len().await, 2);
}

#[tokio::test(start_paused = true)]
async fn replayed_consumer_keeps_processing() {
    let broker = MockBroker::new();
    let client = client(&broker);
    client.pool().connect().await.unwrap();
    client
        .register_consumer("receipts", |_message: Message| async { Outcome::Ack }, ConsumerOptions::default())
        .await
        .unwrap();

    assert!(client.reconnector().reconnect("forced").await);
    broker.deliver("receipts", Message::new("receipts", b"{}".to_vec()));

    wait_for(|| broker.settlements().len() == 1).await;
}
