use std::sync::{Arc, Mutex};

use broker_link::message::with_retry_count;
use broker_link::rabbitmq::{ConnectionState, RabbitMQError};
use broker_link::{ConsumerOptions, Message, Outcome, RabbitMQClient};
use lapin::types::AMQPValue;
use serde::Deserialize;

use crate::support::{test_config, wait_for, MockBroker, Settled};

const QUEUE: &str = "donations.created";

async fn connected_client(broker: &Arc<MockBroker>) -> RabbitMQClient {
    let client = RabbitMQClient::new(test_config(), broker.transport()).unwrap();
    client.pool().connect().await.unwrap();
    client
}

fn message_with_retry_count(count: u32) -> Message {
    Message::new("created", b"{}".to_vec()).with_headers(with_retry_count(None, count))
}

#[tokio::test]
async fn queue_is_declared_with_dead_letter_arguments() {
    let broker = MockBroker::new();
    let client = connected_client(&broker).await;

    client
        .register_consumer(QUEUE, |_message: Message| async { Outcome::Ack }, ConsumerOptions::default())
        .await
        .unwrap();

    let queues = broker.queues();
    let main = queues.iter().find(|q| q.name == QUEUE).unwrap();
    assert!(main.durable);

    let argument = |key: &str| {
        main.arguments
            .inner()
            .iter()
            .find(|(k, _)| k.as_str() == key)
            .map(|(_, v)| v.clone())
    };
    assert_eq!(argument("x-dead-letter-exchange"), Some(AMQPValue::LongString("dlx".into())));
    assert_eq!(
        argument("x-dead-letter-routing-key"),
        Some(AMQPValue::LongString("donations.created-dead-letter".into()))
    );

    assert!(queues.iter().any(|q| q.name == "donations.created-dead-letter" && q.durable));
    assert!(broker.bindings.lock().unwrap().contains(&(
        "donations.created-dead-letter".to_string(),
        "dlx".to_string(),
        "donations.created-dead-letter".to_string(),
    )));
}

#[tokio::test]
async fn configured_bindings_are_declared() {
    let broker = MockBroker::new();
    let client = connected_client(&broker).await;

    client
        .register_consumer(
            QUEUE,
            |_message: Message| async { Outcome::Ack },
            ConsumerOptions::default().bind("donations", "created"),
        )
        .await
        .unwrap();

    assert!(broker
        .exchanges
        .lock()
        .unwrap()
        .iter()
        .any(|(_, name)| name == "donations"));
    assert!(broker.bindings.lock().unwrap().contains(&(
        QUEUE.to_string(),
        "donations".to_string(),
        "created".to_string(),
    )));
}

#[tokio::test]
async fn successful_handler_acks() {
    let broker = MockBroker::new();
    let client = connected_client(&broker).await;
    client
        .register_consumer(QUEUE, |_message: Message| async { Outcome::Ack }, ConsumerOptions::default())
        .await
        .unwrap();

    broker.deliver(QUEUE, Message::new("created", b"{}".to_vec()));

    wait_for(|| broker.settlements().len() == 1).await;
    assert_eq!(broker.settlements(), vec![Settled::Acked]);
}

#[tokio::test]
async fn failing_handler_requeues_then_dead_letters() {
    let broker = MockBroker::new();
    let client = connected_client(&broker).await;
    client
        .register_consumer(
            QUEUE,
            |_message: Message| async { Outcome::Retry("receipt service down".to_string()) },
            ConsumerOptions::default(),
        )
        .await
        .unwrap();

    // Redeliver the way the broker would, carrying the count from the last requeue.
    let mut retry_count = 0;
    for delivered in 1..=4 {
        broker.deliver(QUEUE, message_with_retry_count(retry_count));
        wait_for(|| broker.settlements().len() == delivered).await;

        if let Some(Settled::Requeued(next)) = broker.settlements().last() {
            retry_count = *next;
        }
    }

    assert_eq!(
        broker.settlements(),
        vec![
            Settled::Requeued(1),
            Settled::Requeued(2),
            Settled::Requeued(3),
            Settled::Rejected,
        ]
    );
}

#[tokio::test]
async fn panicking_handler_is_retried_and_consumer_survives() {
    let broker = MockBroker::new();
    let client = connected_client(&broker).await;
    client
        .register_consumer(
            QUEUE,
            |message: Message| async move {
                if message.text() == "boom" {
                    panic!("handler blew up");
                }
                Outcome::Ack
            },
            ConsumerOptions::default(),
        )
        .await
        .unwrap();

    broker.deliver(QUEUE, Message::new("created", b"boom".to_vec()));
    wait_for(|| broker.settlements().len() == 1).await;
    broker.deliver(QUEUE, Message::new("created", b"ok".to_vec()));
    wait_for(|| broker.settlements().len() == 2).await;

    assert_eq!(broker.settlements(), vec![Settled::Requeued(1), Settled::Acked]);
}

#[tokio::test]
async fn registration_interrupted_by_reconnect_is_replayed() {
    let broker = MockBroker::new();
    let client = connected_client(&broker).await;

    // Tear the pool down while the consumer's bindings are being declared.
    let pool = client.pool().clone();
    broker.on_next_exchange_declare(move || async move {
        pool.state().store(ConnectionState::Reconnecting);
        if let Some(old) = pool.detach() {
            old.close().await;
        }
    });

    client
        .register_consumer(
            QUEUE,
            |_message: Message| async { Outcome::Ack },
            ConsumerOptions::default().bind("donations", "created"),
        )
        .await
        .unwrap();

    assert_eq!(client.consumers().len().await, 1);
    assert_eq!(client.consumers().subscription_count(), 0);
    assert!(broker.consumes().is_empty());

    let generation = client.pool().open_generation().await.unwrap();
    assert!(client
        .pool()
        .install_if(ConnectionState::Reconnecting, generation)
        .is_ok());

    assert_eq!(client.consumers().replay(|| {}).await, 1);
    assert_eq!(broker.consumes().len(), 1);
    assert!(broker.consumes()[0].connection >= 3);
}

#[tokio::test]
async fn dead_letter_outcome_skips_retries() {
    let broker = MockBroker::new();
    let client = connected_client(&broker).await;
    client
        .register_consumer(
            QUEUE,
            |_message: Message| async { Outcome::DeadLetter("malformed".to_string()) },
            ConsumerOptions::default(),
        )
        .await
        .unwrap();

    broker.deliver(QUEUE, Message::new("created", b"not json".to_vec()));

    wait_for(|| broker.settlements().len() == 1).await;
    assert_eq!(broker.settlements(), vec![Settled::Rejected]);
}

#[tokio::test]
async fn handler_receives_decodable_payload() {
    #[derive(Deserialize)]
    struct Donation {
        amount_cents: u64,
    }

    let broker = MockBroker::new();
    let client = connected_client(&broker).await;
    let seen = Arc::new(Mutex::new(Vec::new()));

    let recorded = seen.clone();
    client
        .register_consumer(
            QUEUE,
            move |message: Message| {
                let recorded = recorded.clone();
                async move {
                    let outcome: Outcome = message
                        .json::<Donation>()
                        .map(|donation| recorded.lock().unwrap().push(donation.amount_cents))
                        .into();
                    outcome
                }
            },
            ConsumerOptions::default(),
        )
        .await
        .unwrap();

    broker.deliver(QUEUE, Message::new("created", br#"{"amount_cents": 2500}"#.to_vec()));

    wait_for(|| broker.settlements().len() == 1).await;
    assert_eq!(*seen.lock().unwrap(), vec![2500]);
    assert_eq!(broker.settlements(), vec![Settled::Acked]);
}

#[tokio::test]
async fn registering_before_connect_fails() {
    let broker = MockBroker::new();
    let client = RabbitMQClient::new(test_config(), broker.transport()).unwrap();

    let result = client
        .register_consumer(QUEUE, |_message: Message| async { Outcome::Ack }, ConsumerOptions::default())
        .await;

    assert!(matches!(result, Err(RabbitMQError::NotConnected(_))));
    assert!(client.consumers().is_empty().await);
}
