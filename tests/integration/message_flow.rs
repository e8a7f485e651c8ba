// Sending and receiving through the in-process broker.

use std::sync::Arc;
use std::time::{Duration, Instant};

use amq_messenger::properties::{MAX_FRAME_SIZE, PREFETCH_COUNT, RECEIVE_TIMEOUT_MS};
use amq_messenger::transport::mock::MockBroker;
use amq_messenger::{BrokerMessenger, Message, Messenger, MessengerError, Properties};

async fn connected(broker: &MockBroker) -> BrokerMessenger {
    let messenger = BrokerMessenger::new(Arc::new(broker.connector()));
    messenger.connect("mock://broker", &Properties::new()).await.unwrap();
    messenger
}

#[tokio::test]
async fn order_goes_out_and_comes_back() {
    let broker = MockBroker::new();
    let messenger = BrokerMessenger::new(Arc::new(broker.connector()));

    messenger.connect("mock://broker", &Properties::new()).await.unwrap();
    let sender = messenger.create_sender("orders", &Properties::new()).await.unwrap();
    messenger
        .send_message(sender, &Message::new("abc").with_header("type", "order"))
        .await
        .unwrap();

    let receiver = messenger.create_receiver("orders", &Properties::new()).await.unwrap();
    let message = messenger.receive_message(receiver).await.unwrap();
    assert_eq!(message.payload, b"abc");
    assert_eq!(message.header("type"), Some("order"));

    messenger.close_sender(sender).await.unwrap();
    messenger.close_receiver(receiver).await.unwrap();
    messenger.shutdown().await.unwrap();
}

#[tokio::test]
async fn headers_and_payload_survive_unchanged() {
    let broker = MockBroker::new();
    let messenger = connected(&broker).await;
    let sender = messenger.create_sender("detections", &Properties::new()).await.unwrap();
    let receiver = messenger.create_receiver("detections", &Properties::new()).await.unwrap();

    let payload: Vec<u8> = (0..=255u8).collect();
    let original = Message::new(payload.clone())
        .with_header("sensor", "north-7")
        .with_header("unicode", "détection ✓")
        .with_header("empty", "");
    messenger.send_message(sender, &original).await.unwrap();

    let received = messenger.receive_message(receiver).await.unwrap();
    assert_eq!(received.payload, payload);
    assert_eq!(received.headers, original.headers);
    assert!(received.message_id.is_some());
    assert!(received.timestamp.is_some());

    messenger.shutdown().await.unwrap();
}

#[tokio::test]
async fn messages_arrive_in_order_per_destination() {
    let broker = MockBroker::new();
    let messenger = connected(&broker).await;
    let orders = messenger.create_sender("orders", &Properties::new()).await.unwrap();
    let refunds = messenger.create_sender("refunds", &Properties::new()).await.unwrap();

    for n in 0..3 {
        messenger.send_message(orders, &Message::new(format!("order-{}", n))).await.unwrap();
    }
    messenger.send_message(refunds, &Message::new("refund-0")).await.unwrap();
    assert_eq!(broker.depth("orders"), 3);
    assert_eq!(broker.depth("refunds"), 1);

    let receiver = messenger.create_receiver("orders", &Properties::new()).await.unwrap();
    for n in 0..3 {
        let message = messenger.receive_message(receiver).await.unwrap();
        assert_eq!(message.payload_str(), Some(format!("order-{}", n).as_str()));
    }

    messenger.shutdown().await.unwrap();
}

#[tokio::test]
async fn configured_timeout_bounds_the_wait() {
    let broker = MockBroker::new();
    let messenger = connected(&broker).await;
    let limit = Duration::from_millis(50);
    let receiver = messenger
        .create_receiver("empty", &Properties::new().with(RECEIVE_TIMEOUT_MS, 50))
        .await
        .unwrap();

    let started = Instant::now();
    let error = messenger.receive_message(receiver).await.unwrap_err();
    let elapsed = started.elapsed();

    assert!(matches!(error, MessengerError::Timeout(waited) if waited == limit));
    assert!(elapsed >= limit, "returned after {:?}", elapsed);
    assert!(elapsed < limit + Duration::from_secs(1), "returned after {:?}", elapsed);

    messenger.shutdown().await.unwrap();
}

#[tokio::test]
async fn explicit_timeout_overrides_the_configured_one() {
    let broker = MockBroker::new();
    let messenger = connected(&broker).await;
    let receiver = messenger
        .create_receiver("empty", &Properties::new().with(RECEIVE_TIMEOUT_MS, 60_000))
        .await
        .unwrap();

    let started = Instant::now();
    let error = messenger
        .receive_message_timeout(receiver, Duration::from_millis(20))
        .await
        .unwrap_err();
    assert!(matches!(error, MessengerError::Timeout(_)));
    assert!(started.elapsed() < Duration::from_secs(5));

    // A timed out receive leaves the session usable
    let sender = messenger.create_sender("empty", &Properties::new()).await.unwrap();
    messenger.send_message(sender, &Message::new("now")).await.unwrap();
    let message = messenger
        .receive_message_timeout(receiver, Duration::from_secs(1))
        .await
        .unwrap();
    assert_eq!(message.payload, b"now");

    messenger.shutdown().await.unwrap();
}

#[tokio::test]
async fn receiver_waits_for_a_later_send() {
    let broker = MockBroker::new();
    let messenger = Arc::new(connected(&broker).await);
    let receiver = messenger.create_receiver("late", &Properties::new()).await.unwrap();

    let producer = {
        let broker = broker.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            let other = connected(&broker).await;
            let sender = other.create_sender("late", &Properties::new()).await.unwrap();
            other.send_message(sender, &Message::new("eventually")).await.unwrap();
            other.shutdown().await.unwrap();
        })
    };

    let message = messenger
        .receive_message_timeout(receiver, Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(message.payload, b"eventually");
    producer.await.unwrap();

    messenger.shutdown().await.unwrap();
}

#[tokio::test]
async fn destination_properties_override_connection_properties() {
    let broker = MockBroker::new();
    let messenger = BrokerMessenger::new(Arc::new(broker.connector()));
    messenger
        .connect(
            "mock://broker",
            &Properties::new().with(RECEIVE_TIMEOUT_MS, 60_000).with(PREFETCH_COUNT, 5),
        )
        .await
        .unwrap();

    let receiver = messenger
        .create_receiver("empty", &Properties::new().with(RECEIVE_TIMEOUT_MS, 10))
        .await
        .unwrap();
    let started = Instant::now();
    assert!(matches!(
        messenger.receive_message(receiver).await,
        Err(MessengerError::Timeout(_))
    ));
    assert!(started.elapsed() < Duration::from_secs(5));

    messenger.shutdown().await.unwrap();
}

#[tokio::test]
async fn invalid_destinations_are_rejected() {
    let broker = MockBroker::new();
    broker.faults().invalid_destinations.push("forbidden".to_string());
    let messenger = connected(&broker).await;

    for name in ["", "has space", "forbidden"] {
        let error = messenger.create_sender(name, &Properties::new()).await.unwrap_err();
        assert!(matches!(error, MessengerError::Destination(_)), "{:?}: {:?}", name, error);
    }
    let too_long = "q".repeat(256);
    assert!(matches!(
        messenger.create_receiver(&too_long, &Properties::new()).await,
        Err(MessengerError::Destination(_))
    ));
    assert_eq!(broker.stats().open_producers, 0);

    messenger.shutdown().await.unwrap();
}

#[tokio::test]
async fn unframeable_messages_are_serialization_errors() {
    let broker = MockBroker::new();
    let messenger = BrokerMessenger::new(Arc::new(broker.connector()));
    messenger
        .connect("mock://broker", &Properties::new().with(MAX_FRAME_SIZE, 16))
        .await
        .unwrap();
    let sender = messenger.create_sender("orders", &Properties::new()).await.unwrap();

    let oversized = Message::new(vec![0u8; 64]);
    assert!(matches!(
        messenger.send_message(sender, &oversized).await,
        Err(MessengerError::Serialization(_))
    ));
    let bad_header = Message::new("x").with_header("", "nameless");
    assert!(matches!(
        messenger.send_message(sender, &bad_header).await,
        Err(MessengerError::Serialization(_))
    ));
    assert_eq!(broker.depth("orders"), 0);
    assert_eq!(broker.stats().commits, 0);

    messenger.shutdown().await.unwrap();
}

#[tokio::test]
async fn corrupt_frames_are_serialization_errors() {
    let broker = MockBroker::new();
    let messenger = connected(&broker).await;
    let receiver = messenger.create_receiver("inbox", &Properties::new()).await.unwrap();

    broker.inject_raw("inbox", b"not a frame".to_vec());
    assert!(matches!(
        messenger.receive_message(receiver).await,
        Err(MessengerError::Serialization(_))
    ));
    // Rolled back with the failed receive, so it is still on the queue
    assert_eq!(broker.depth("inbox"), 1);

    messenger.shutdown().await.unwrap();
}

#[tokio::test]
async fn refused_sends_are_transport_errors() {
    let broker = MockBroker::new();
    let messenger = connected(&broker).await;
    let sender = messenger.create_sender("orders", &Properties::new()).await.unwrap();

    broker.faults().reject_sends = true;
    assert!(matches!(
        messenger.send_message(sender, &Message::new("abc")).await,
        Err(MessengerError::Transport(_))
    ));
    assert_eq!(broker.depth("orders"), 0);

    broker.faults().reject_sends = false;
    messenger.send_message(sender, &Message::new("abc")).await.unwrap();
    assert_eq!(broker.depth("orders"), 1);

    messenger.shutdown().await.unwrap();
}

#[tokio::test]
async fn closed_handles_are_invalid_but_close_again_is_fine() {
    let broker = MockBroker::new();
    let messenger = connected(&broker).await;
    let sender = messenger.create_sender("orders", &Properties::new()).await.unwrap();
    let receiver = messenger.create_receiver("orders", &Properties::new()).await.unwrap();

    messenger.close_sender(sender).await.unwrap();
    messenger.close_sender(sender).await.unwrap();
    messenger.close_receiver(receiver).await.unwrap();
    messenger.close_receiver(receiver).await.unwrap();
    assert_eq!(broker.stats().open_producers, 0);
    assert_eq!(broker.stats().open_consumers, 0);

    assert!(matches!(
        messenger.send_message(sender, &Message::new("abc")).await,
        Err(MessengerError::InvalidHandle(_))
    ));
    assert!(matches!(
        messenger.receive_message(receiver).await,
        Err(MessengerError::InvalidHandle(_))
    ));

    messenger.shutdown().await.unwrap();
}

#[tokio::test]
async fn timeout_holds_while_another_receive_waits() {
    let broker = MockBroker::new();
    let messenger = Arc::new(connected(&broker).await);
    let idle = messenger.create_receiver("idle", &Properties::new()).await.unwrap();
    let other = messenger.create_receiver("other", &Properties::new()).await.unwrap();

    let waiting = {
        let messenger = messenger.clone();
        tokio::spawn(async move { messenger.receive_message(idle).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    let limit = Duration::from_millis(50);
    let started = Instant::now();
    let outcome = tokio::time::timeout(
        Duration::from_secs(2),
        messenger.receive_message_timeout(other, limit),
    )
    .await
    .expect("bounded receive must not wait on the idle one");
    let elapsed = started.elapsed();

    assert!(matches!(outcome, Err(MessengerError::Timeout(_))));
    assert!(elapsed >= limit, "returned after {:?}", elapsed);
    assert!(elapsed < limit + Duration::from_secs(1), "returned after {:?}", elapsed);

    messenger.shutdown().await.unwrap();
    assert!(matches!(waiting.await.unwrap(), Err(MessengerError::NotConnected)));
}

#[tokio::test]
async fn send_reaches_a_receive_waiting_on_the_same_messenger() {
    let broker = MockBroker::new();
    let messenger = Arc::new(connected(&broker).await);
    let sender = messenger.create_sender("inbox", &Properties::new()).await.unwrap();
    let receiver = messenger.create_receiver("inbox", &Properties::new()).await.unwrap();

    let waiting = {
        let messenger = messenger.clone();
        tokio::spawn(async move { messenger.receive_message(receiver).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    tokio::time::timeout(
        Duration::from_secs(2),
        messenger.send_message(sender, &Message::new("hello")),
    )
    .await
    .expect("send must not wait on the pending receive")
    .unwrap();

    let message = tokio::time::timeout(Duration::from_secs(2), waiting)
        .await
        .expect("receive must see the send")
        .unwrap()
        .unwrap();
    assert_eq!(message.payload, b"hello");

    messenger.shutdown().await.unwrap();
}
