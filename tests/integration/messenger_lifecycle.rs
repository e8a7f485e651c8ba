// Lifecycle of a messenger against the in-process broker: connect, shutdown
// and the states in between, with the broker's counters checked for leaks.

use std::sync::Arc;

use amq_messenger::properties::{COMMIT_MODE, CONNECT_ATTEMPTS, CONNECT_RETRY_DELAY_MS};
use amq_messenger::transport::library;
use amq_messenger::transport::mock::MockBroker;
use amq_messenger::transport::TransportConnector;
use amq_messenger::{BrokerMessenger, Message, Messenger, MessengerError, MessengerState, Properties};

fn messenger_on(broker: &MockBroker) -> BrokerMessenger {
    BrokerMessenger::new(Arc::new(broker.connector()))
}

#[tokio::test]
async fn connect_then_shutdown_leaves_nothing_open() {
    let broker = MockBroker::new();
    let messenger = messenger_on(&broker);

    messenger.connect("mock://broker", &Properties::new()).await.unwrap();
    assert_eq!(messenger.state().await, MessengerState::Ready);
    messenger.create_sender("orders", &Properties::new()).await.unwrap();
    messenger.create_receiver("orders", &Properties::new()).await.unwrap();

    messenger.shutdown().await.unwrap();
    assert_eq!(messenger.state().await, MessengerState::Terminated);

    let stats = broker.stats();
    assert_eq!(stats.open_connections, 0);
    assert_eq!(stats.open_sessions, 0);
    assert_eq!(stats.open_producers, 0);
    assert_eq!(stats.open_consumers, 0);
    assert_eq!(stats.library_initializations, 1);
    assert_eq!(stats.library_shutdowns, 1);
    assert_eq!(library::users_of(&broker.connector().library_key()), 0);
}

#[tokio::test]
async fn endpoints_before_connect_make_no_transport_calls() {
    let broker = MockBroker::new();
    let messenger = messenger_on(&broker);

    let sender = messenger.create_sender("orders", &Properties::new()).await;
    assert!(matches!(sender, Err(MessengerError::NotConnected)));
    let receiver = messenger.create_receiver("orders", &Properties::new()).await;
    assert!(matches!(receiver, Err(MessengerError::NotConnected)));
    assert!(matches!(messenger.commit().await, Err(MessengerError::NotConnected)));

    assert_eq!(broker.stats().transport_calls, 0);
    assert_eq!(messenger.state().await, MessengerState::Uninitialized);
}

#[tokio::test]
async fn second_shutdown_is_not_connected_and_silent() {
    let broker = MockBroker::new();
    let messenger = messenger_on(&broker);
    messenger.connect("mock://broker", &Properties::new()).await.unwrap();
    messenger.shutdown().await.unwrap();

    let calls = broker.stats().transport_calls;
    assert!(matches!(messenger.shutdown().await, Err(MessengerError::NotConnected)));
    assert_eq!(broker.stats().transport_calls, calls);
}

#[tokio::test]
async fn shutdown_before_connect_is_not_connected() {
    let broker = MockBroker::new();
    let messenger = messenger_on(&broker);
    assert!(matches!(messenger.shutdown().await, Err(MessengerError::NotConnected)));
    assert_eq!(broker.stats().transport_calls, 0);
}

#[tokio::test]
async fn terminated_is_absorbing() {
    let broker = MockBroker::new();
    let messenger = messenger_on(&broker);
    messenger.connect("mock://broker", &Properties::new()).await.unwrap();
    let sender = messenger.create_sender("orders", &Properties::new()).await.unwrap();
    let receiver = messenger.create_receiver("orders", &Properties::new()).await.unwrap();
    messenger.shutdown().await.unwrap();
    let calls = broker.stats().transport_calls;

    assert!(matches!(
        messenger.connect("mock://broker", &Properties::new()).await,
        Err(MessengerError::NotConnected)
    ));
    assert!(matches!(
        messenger.send_message(sender, &Message::new("late")).await,
        Err(MessengerError::NotConnected)
    ));
    assert!(matches!(
        messenger.receive_message(receiver).await,
        Err(MessengerError::NotConnected)
    ));
    assert!(matches!(messenger.close_sender(sender).await, Err(MessengerError::NotConnected)));
    assert!(matches!(
        messenger.create_sender("orders", &Properties::new()).await,
        Err(MessengerError::NotConnected)
    ));

    assert_eq!(messenger.state().await, MessengerState::Terminated);
    assert_eq!(broker.stats().transport_calls, calls);
}

#[tokio::test]
async fn connecting_twice_is_refused() {
    let broker = MockBroker::new();
    let messenger = messenger_on(&broker);
    messenger.connect("mock://broker", &Properties::new()).await.unwrap();

    let error = messenger.connect("mock://broker", &Properties::new()).await.unwrap_err();
    assert!(matches!(error, MessengerError::AlreadyConnected));
    assert_eq!(messenger.state().await, MessengerState::Ready);
    assert_eq!(broker.stats().open_connections, 1);

    messenger.shutdown().await.unwrap();
}

#[tokio::test]
async fn bad_addresses_are_connection_errors() {
    let broker = MockBroker::new();
    broker.faults().unreachable_hosts.push("nowhere".to_string());
    let messenger = messenger_on(&broker);

    for address in ["", "not a uri", "mock://nowhere"] {
        let error = messenger.connect(address, &Properties::new()).await.unwrap_err();
        assert!(matches!(error, MessengerError::Connection(_)), "{}: {:?}", address, error);
        assert_eq!(messenger.state().await, MessengerState::Uninitialized);
    }

    let stats = broker.stats();
    assert_eq!(stats.open_connections, 0);
    assert_eq!(stats.library_initializations, stats.library_shutdowns);

    assert!(matches!(
        BrokerMessenger::for_address("carrier-pigeon://loft"),
        Err(MessengerError::Connection(_))
    ));
}

#[tokio::test]
async fn unreachable_broker_is_retried_when_configured() {
    let broker = MockBroker::new();
    broker.faults().unreachable_attempts = 2;
    let messenger = messenger_on(&broker);
    let properties = Properties::new()
        .with(CONNECT_ATTEMPTS, 3)
        .with(CONNECT_RETRY_DELAY_MS, 1);

    messenger.connect("mock://broker", &properties).await.unwrap();
    assert_eq!(broker.stats().connect_attempts, 3);
    messenger.shutdown().await.unwrap();
}

#[tokio::test]
async fn library_failure_is_reported_as_such() {
    let broker = MockBroker::new();
    broker.faults().fail_library_init = true;
    let messenger = messenger_on(&broker);

    let error = messenger.connect("mock://broker", &Properties::new()).await.unwrap_err();
    assert!(matches!(error, MessengerError::LibraryInit(_)));
    assert_eq!(broker.stats().connect_attempts, 0);
    assert_eq!(messenger.state().await, MessengerState::Uninitialized);
}

#[tokio::test]
async fn failed_session_leaks_nothing() {
    let broker = MockBroker::new();
    broker.faults().fail_session_creation = true;
    let messenger = messenger_on(&broker);

    assert!(messenger.connect("mock://broker", &Properties::new()).await.is_err());
    let stats = broker.stats();
    assert_eq!(stats.open_connections, 0);
    assert_eq!(stats.open_sessions, 0);
    assert_eq!(stats.library_initializations, stats.library_shutdowns);
}

#[tokio::test]
async fn library_is_initialized_once_for_concurrent_messengers() {
    let broker = MockBroker::new();
    let first = messenger_on(&broker);
    let second = messenger_on(&broker);

    first.connect("mock://broker", &Properties::new()).await.unwrap();
    second.connect("mock://broker", &Properties::new()).await.unwrap();
    assert_eq!(broker.stats().library_initializations, 1);
    assert_eq!(library::users_of(&broker.connector().library_key()), 2);

    first.shutdown().await.unwrap();
    assert_eq!(broker.stats().library_shutdowns, 0);
    second.shutdown().await.unwrap();
    assert_eq!(broker.stats().library_shutdowns, 1);

    // A later cycle initializes again
    let third = messenger_on(&broker);
    third.connect("mock://broker", &Properties::new()).await.unwrap();
    third.shutdown().await.unwrap();
    assert_eq!(broker.stats().library_initializations, 2);
    assert_eq!(broker.stats().library_shutdowns, 2);
}

#[tokio::test]
async fn shutdown_finishes_after_a_failed_rollback() {
    let broker = MockBroker::new();
    let messenger = messenger_on(&broker);
    let manual = Properties::new().with(COMMIT_MODE, "manual");
    messenger.connect("mock://broker", &manual).await.unwrap();
    let sender = messenger.create_sender("orders", &Properties::new()).await.unwrap();
    messenger.create_receiver("orders", &Properties::new()).await.unwrap();
    messenger.send_message(sender, &Message::new("never committed")).await.unwrap();

    broker.faults().fail_rollback = true;
    let outcome = messenger.shutdown().await;
    assert!(matches!(outcome, Err(MessengerError::Transport(_))));
    assert_eq!(messenger.state().await, MessengerState::Terminated);

    // The steps after the failure still ran
    let stats = broker.stats();
    assert_eq!(stats.rollbacks, 1);
    assert_eq!(stats.open_producers, 0);
    assert_eq!(stats.open_consumers, 0);
    assert_eq!(stats.open_sessions, 0);
    assert_eq!(stats.open_connections, 0);
    assert_eq!(stats.library_shutdowns, 1);
    assert_eq!(library::users_of(&broker.connector().library_key()), 0);
    assert_eq!(broker.depth("orders"), 0);
}

#[tokio::test]
async fn shutdown_reports_a_failed_connection_close() {
    let broker = MockBroker::new();
    let messenger = messenger_on(&broker);
    messenger.connect("mock://broker", &Properties::new()).await.unwrap();
    messenger.create_sender("orders", &Properties::new()).await.unwrap();

    broker.faults().fail_connection_close = true;
    let outcome = messenger.shutdown().await;
    assert!(matches!(outcome, Err(MessengerError::Unknown(_))));
    assert_eq!(messenger.state().await, MessengerState::Terminated);

    let stats = broker.stats();
    assert_eq!(stats.open_sessions, 0);
    assert_eq!(stats.open_connections, 0);
    assert_eq!(stats.library_shutdowns, 1);
    assert_eq!(library::users_of(&broker.connector().library_key()), 0);

    // Terminated is final
    let again = messenger.shutdown().await;
    assert!(matches!(again, Err(MessengerError::NotConnected)));
}

#[tokio::test]
async fn shutdown_keeps_the_first_error_when_several_steps_fail() {
    let broker = MockBroker::new();
    let messenger = messenger_on(&broker);
    messenger.connect("mock://broker", &Properties::new()).await.unwrap();
    messenger.create_sender("orders", &Properties::new()).await.unwrap();
    messenger.create_receiver("orders", &Properties::new()).await.unwrap();

    {
        let mut faults = broker.faults();
        faults.fail_endpoint_close = true;
        faults.fail_connection_close = true;
    }
    let outcome = messenger.shutdown().await;
    assert!(matches!(outcome, Err(MessengerError::Transport(_))));
    assert_eq!(messenger.state().await, MessengerState::Terminated);

    // Closing the session still released the endpoints the broker refused to detach
    let stats = broker.stats();
    assert_eq!(stats.open_producers, 0);
    assert_eq!(stats.open_consumers, 0);
    assert_eq!(stats.open_connections, 0);
    assert_eq!(stats.library_shutdowns, 1);
}
