//! End-to-end tests: real clients against a loopback broker.

use event_bus::{
    Broker, BusError, ChannelState, EventBusClient, EventMessage, NetworkServer, ServerConfig, SubscriberEvent,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);

async fn start_broker() -> (Arc<NetworkServer>, SocketAddr) {
    let config = ServerConfig {
        bind_address: "127.0.0.1:0".parse().unwrap(),
        ..ServerConfig::default()
    };
    let server = Arc::new(NetworkServer::bind(config, Broker::new()).await.unwrap());
    let address = server.local_addr();
    let running = server.clone();
    tokio::spawn(async move { running.run().await });
    (server, address)
}

async fn within<F: Future>(future: F) -> F::Output {
    timeout(WAIT, future).await.expect("timed out")
}

async fn wait_for_subscribers(server: &NetworkServer, queue: &str, expected: usize) {
    within(async {
        while server.broker().subscriber_count(queue).await != expected {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
}

async fn wait_for_handlers(server: &NetworkServer, queue: &str, expected: usize) {
    within(async {
        while server.broker().handler_count(queue).await != expected {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
}

fn event_channel() -> (
    impl Fn(SubscriberEvent) + Send + Sync + 'static,
    mpsc::UnboundedReceiver<SubscriberEvent>,
) {
    let (sender, receiver) = mpsc::unbounded_channel();
    (move |event: SubscriberEvent| {
        let _ = sender.send(event);
    }, receiver)
}

async fn next_event(receiver: &mut mpsc::UnboundedReceiver<SubscriberEvent>) -> SubscriberEvent {
    within(receiver.recv()).await.expect("listener dropped")
}

#[tokio::test(flavor = "multi_thread")]
async fn test_publish_is_acknowledged_without_subscribers() {
    let (_server, address) = start_broker().await;
    let client = EventBusClient::connect(address).await.unwrap();

    let publisher = client.add_publisher();
    let published = publisher.publish("nobody-listens", "ping", "hello").unwrap();
    assert!(within(publisher.flush()).await);
    assert!(within(published).await);

    client.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_subscriber_receives_its_queue_in_publish_order() {
    let (server, address) = start_broker().await;
    let consumer = EventBusClient::connect(address).await.unwrap();
    let producer = EventBusClient::connect(address).await.unwrap();

    let (listener, mut events) = event_channel();
    let subscriber = consumer.add_subscriber("tappables", listener).unwrap();
    wait_for_subscribers(&server, "tappables", 1).await;

    let publisher = producer.add_publisher();
    for i in 0..20 {
        publisher.publish("tappables", "spawn", &format!("tile {i}")).unwrap();
        publisher.publish("tappables-other", "spawn", "elsewhere").unwrap();
    }
    assert!(within(publisher.flush()).await);

    for i in 0..20 {
        match next_event(&mut events).await {
            SubscriberEvent::Event(message) => {
                assert_eq!(message.message_type, "spawn");
                assert_eq!(message.data, format!("tile {i}"));
                assert!(message.timestamp > 0);
            }
            SubscriberEvent::Error => panic!("unexpected subscriber error"),
        }
    }
    assert!(events.try_recv().is_err());
    assert_eq!(subscriber.state(), ChannelState::Open);

    producer.close().await;
    consumer.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_request_tries_handlers_in_registration_order() {
    let (_server, address) = start_broker().await;
    let client = EventBusClient::connect(address).await.unwrap();
    let calls = Arc::new(Mutex::new(Vec::new()));

    let log = calls.clone();
    client
        .add_request_handler(
            "q",
            move |_| {
                log.lock().push("h1");
                async { None::<String> }
            },
            || {},
        )
        .unwrap();
    let log = calls.clone();
    client
        .add_request_handler(
            "q",
            move |_| {
                log.lock().push("h2");
                async { Some("x".to_string()) }
            },
            || {},
        )
        .unwrap();

    let sender = client.add_request_sender();
    for _ in 0..3 {
        let response = within(sender.request("q", "t", "d").unwrap()).await;
        assert_eq!(response.as_deref(), Some("x"));
    }
    assert_eq!(*calls.lock(), vec!["h1", "h2", "h1", "h2", "h1", "h2"]);

    client.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_request_without_handlers_resolves_to_none() {
    let (_server, address) = start_broker().await;
    let client = EventBusClient::connect(address).await.unwrap();

    let sender = client.add_request_sender();
    let first = sender.request("unserved", "t", "d").unwrap();
    let second = sender.request("unserved", "t", "d").unwrap();
    assert_eq!(within(first).await, None);
    assert_eq!(within(second).await, None);
    assert_eq!(sender.state(), ChannelState::Open);

    client.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_echo_handler_round_trips_payload() {
    let (server, address) = start_broker().await;
    let handler_client = EventBusClient::connect(address).await.unwrap();
    let requester = EventBusClient::connect(address).await.unwrap();

    handler_client
        .add_request_handler("echo", |event: EventMessage| async move { Some(event.data) }, || {})
        .unwrap();
    wait_for_handlers(&server, "echo", 1).await;

    let sender = requester.add_request_sender();
    let payload = "{\"a\": [1, 2]} : with ~ punctuation !";
    let response = within(sender.request("echo", "echo", payload).unwrap()).await;
    assert_eq!(response.as_deref(), Some(payload));

    let empty = within(sender.request("echo", "echo", "").unwrap()).await;
    assert_eq!(empty.as_deref(), Some(""));

    requester.close().await;
    handler_client.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_unsendable_handler_answer_becomes_not_handled() {
    let (_server, address) = start_broker().await;
    let client = EventBusClient::connect(address).await.unwrap();

    client
        .add_request_handler("q", |_| async { Some("two\nlines".to_string()) }, || {})
        .unwrap();
    let sender = client.add_request_sender();
    assert_eq!(within(sender.request("q", "t", "d").unwrap()).await, None);

    client.close().await;
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
struct SpawnRequest {
    tile_x: i32,
    tile_y: i32,
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
struct SpawnResponse {
    spawned: Vec<String>,
}

#[tokio::test(flavor = "multi_thread")]
async fn test_json_helpers() {
    let (_server, address) = start_broker().await;
    let client = EventBusClient::connect(address).await.unwrap();

    client
        .add_request_handler(
            "tappables",
            |event: EventMessage| async move {
                let response = event.data_json::<SpawnRequest>().ok().map(|request| SpawnResponse {
                    spawned: vec![format!("{}/{}", request.tile_x, request.tile_y)],
                });
                response.and_then(|response| serde_json::to_string(&response).ok())
            },
            || {},
        )
        .unwrap();

    let (listener, mut events) = event_channel();
    client.add_subscriber("spawns", listener).unwrap();

    let sender = client.add_request_sender();
    let response: Option<SpawnResponse> = within(sender.request_json(
        "tappables",
        "spawn",
        &SpawnRequest { tile_x: 3, tile_y: -7 },
    ))
    .await
    .unwrap();
    assert_eq!(response, Some(SpawnResponse { spawned: vec!["3/-7".to_string()] }));

    let publisher = client.add_publisher();
    publisher
        .publish_json("spawns", "spawned", &SpawnRequest { tile_x: 1, tile_y: 2 })
        .unwrap();
    match next_event(&mut events).await {
        SubscriberEvent::Event(message) => {
            assert_eq!(message.data_json::<SpawnRequest>().unwrap(), SpawnRequest { tile_x: 1, tile_y: 2 });
        }
        SubscriberEvent::Error => panic!("unexpected subscriber error"),
    }

    client.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_validation_errors_are_synchronous() {
    let (_server, address) = start_broker().await;
    let client = EventBusClient::connect(address).await.unwrap();

    let publisher = client.add_publisher();
    assert!(matches!(publisher.publish("bad queue", "t", "d"), Err(BusError::Validation(_))));
    assert!(matches!(publisher.publish("q", "-t", "d"), Err(BusError::Validation(_))));
    assert!(matches!(publisher.publish("q", "t", "tab\there"), Err(BusError::Validation(_))));
    assert!(client.add_subscriber("", |_| {}).unwrap_err().is_validation());
    assert!(client.add_request_handler("a:b", |_| async { None::<String> }, || {}).is_err());

    // Nothing was queued, so flush has nothing to wait for.
    assert!(within(publisher.flush()).await);
    client.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_closed_subscriber_stops_receiving() {
    let (server, address) = start_broker().await;
    let client = EventBusClient::connect(address).await.unwrap();

    let (listener, mut events) = event_channel();
    let subscriber = client.add_subscriber("q", listener).unwrap();
    let publisher = client.add_publisher();

    assert!(within(publisher.publish("q", "t", "first").unwrap()).await);
    assert!(matches!(next_event(&mut events).await, SubscriberEvent::Event(_)));

    subscriber.close();
    assert_eq!(subscriber.state(), ChannelState::Closed);
    wait_for_subscribers(&server, "q", 0).await;

    assert!(within(publisher.publish("q", "t", "second").unwrap()).await);
    assert!(events.try_recv().is_err());

    client.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_close_fails_channels_and_rejects_new_ones() {
    let (_server, address) = start_broker().await;
    let client = EventBusClient::connect(address).await.unwrap();

    let (listener, mut events) = event_channel();
    let subscriber = client.add_subscriber("q", listener).unwrap();
    let handler_errors = Arc::new(AtomicUsize::new(0));
    let counter = handler_errors.clone();
    let handler = client
        .add_request_handler("q", |_| async { None::<String> }, move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
    let publisher = client.add_publisher();

    client.close().await;
    assert!(client.is_closed());
    assert_eq!(next_event(&mut events).await, SubscriberEvent::Error);
    assert_eq!(subscriber.state(), ChannelState::Errored);
    assert_eq!(handler.state(), ChannelState::Errored);
    assert_eq!(handler_errors.load(Ordering::SeqCst), 1);
    assert_eq!(publisher.state(), ChannelState::Closed);
    assert!(!within(publisher.publish("q", "t", "d").unwrap()).await);

    let late_publisher = client.add_publisher();
    assert_eq!(late_publisher.state(), ChannelState::Closed);
    assert!(!within(late_publisher.publish("q", "t", "d").unwrap()).await);

    let late_sender = client.add_request_sender();
    assert_eq!(within(late_sender.request("q", "t", "d").unwrap()).await, None);

    let (listener, mut late_events) = event_channel();
    let late_subscriber = client.add_subscriber("q", listener).unwrap();
    assert_eq!(late_subscriber.state(), ChannelState::Errored);
    assert_eq!(next_event(&mut late_events).await, SubscriberEvent::Error);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_broker_shutdown_reaches_consumers() {
    let (server, address) = start_broker().await;
    let client = EventBusClient::connect(address).await.unwrap();

    let (listener, mut events) = event_channel();
    client.add_subscriber("q", listener).unwrap();
    wait_for_subscribers(&server, "q", 1).await;

    server.shutdown();
    assert_eq!(next_event(&mut events).await, SubscriberEvent::Error);
    within(async {
        while !client.is_closed() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    wait_for_subscribers(&server, "q", 0).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_connect_failure() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let address = listener.local_addr().unwrap();
    drop(listener);

    let result = EventBusClient::connect(address).await;
    assert!(matches!(result, Err(BusError::Connect(_))));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_network_stats_track_connections() {
    let (server, address) = start_broker().await;
    let client = EventBusClient::connect(address).await.unwrap();

    let publisher = client.add_publisher();
    assert!(within(publisher.publish("q", "t", "d").unwrap()).await);
    let stats = server.stats();
    assert_eq!(stats.total_connections, 1);
    assert_eq!(stats.active_connections, 1);

    client.close().await;
    within(async {
        while server.stats().active_connections != 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert_eq!(server.broker().stats().await.events_published, 1);
}
