//! Dispatcher behaviour over the in-memory broker.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use syncbus_mom::{
    Body, DispatchError, Dispatcher, DispatcherConfigBuilder, DispatcherEvent, MemoryBroker,
    MemoryTransport, Message, PublishOptions, Qos,
};
use tokio::sync::mpsc;
use tokio_test::{assert_err, assert_ok};

fn config(id: &str) -> DispatcherConfigBuilder {
    DispatcherConfigBuilder::new()
        .client_id(id)
        .topic_prefix("test")
        .echo_timeout(Duration::from_millis(300))
        .response_timeout(Duration::from_millis(300))
        .listener_detach_timeout(Duration::from_millis(100))
}

async fn connect(broker: &MemoryBroker, id: &str) -> Dispatcher {
    let dispatcher = Dispatcher::connect(config(id).build(), Arc::new(broker.transport()))
        .await
        .unwrap();
    dispatcher.when_ready().await;
    dispatcher
}

async fn eventually(mut condition: impl FnMut() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}

// ============================================================================
// Presence
// ============================================================================

#[tokio::test]
async fn test_presence_converges() {
    let broker = MemoryBroker::new();
    let a = connect(&broker, "a").await;
    let b = connect(&broker, "b").await;
    let c = connect(&broker, "c").await;

    for dispatcher in [&a, &b, &c] {
        let d = dispatcher.clone();
        eventually(move || d.active_clients() == vec!["a", "b", "c"]).await;
    }
}

#[tokio::test]
async fn test_bye_on_destroy() {
    let broker = MemoryBroker::new();
    let a = connect(&broker, "a").await;
    let b = connect(&broker, "b").await;
    let (_listener, mut byes) = a.on_channel(DispatcherEvent::Bye);

    let a2 = a.clone();
    eventually(move || a2.is_active_client("b")).await;
    assert_ok!(b.destroy(false).await);

    let gone = tokio::time::timeout(Duration::from_secs(1), byes.recv()).await.unwrap();
    assert_eq!(gone.as_deref(), Some("b"));
    assert!(!a.is_active_client("b"));
    assert!(b.is_destroyed());
    assert!(b.subscriptions().is_empty());
}

#[tokio::test]
async fn test_last_will_removes_crashed_participant() {
    let broker = MemoryBroker::new();
    let a = connect(&broker, "a").await;
    let transport: Arc<MemoryTransport> = Arc::new(broker.transport());
    let crashing = Dispatcher::connect(config("crash").build(), transport.clone())
        .await
        .unwrap();
    crashing.when_ready().await;

    let a2 = a.clone();
    eventually(move || a2.is_active_client("crash")).await;
    transport.kill();
    let a2 = a.clone();
    eventually(move || !a2.is_active_client("crash")).await;
}

#[tokio::test]
async fn test_hello_listener_fires_for_late_joiner() {
    let broker = MemoryBroker::new();
    let a = connect(&broker, "a").await;
    let hellos = Arc::new(AtomicUsize::new(0));
    let counter = hellos.clone();
    let listener = a.on(DispatcherEvent::Hello, move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    let _b = connect(&broker, "b").await;
    let seen = hellos.clone();
    eventually(move || seen.load(Ordering::SeqCst) == 1).await;
    assert!(listener.unregister());
}

// ============================================================================
// Subscriptions and delivery
// ============================================================================

#[tokio::test]
async fn test_subscribe_twice_fails() {
    let broker = MemoryBroker::new();
    let a = connect(&broker, "a").await;

    assert_ok!(a.subscribe("/x/y/", Qos::AtLeastOnce, false, None).await);
    let err = assert_err!(a.subscribe("x/y", Qos::AtLeastOnce, false, None).await);
    assert_eq!(err, DispatchError::AlreadySubscribed("x/y".into()));

    assert!(assert_ok!(a.unsubscribe("x/y").await));
    assert!(!assert_ok!(a.unsubscribe("x/y").await));
}

#[tokio::test]
async fn test_own_messages_filtered_without_echo() {
    let broker = MemoryBroker::new();
    let a = connect(&broker, "a").await;
    let b = connect(&broker, "b").await;

    let (tx_a, mut rx_a) = mpsc::unbounded_channel();
    let (tx_b, mut rx_b) = mpsc::unbounded_channel();
    a.subscribe("news", Qos::AtLeastOnce, false, Some(Arc::new(move |m, echo| {
        let _ = tx_a.send((m, echo));
    })))
    .await
    .unwrap();
    b.subscribe("news", Qos::AtLeastOnce, false, Some(Arc::new(move |m, echo| {
        let _ = tx_b.send((m, echo));
    })))
    .await
    .unwrap();

    a.publish(Message::to("news", "flash"), PublishOptions::new())
        .await
        .unwrap();

    let (message, echo) = tokio::time::timeout(Duration::from_secs(1), rx_b.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(message.body.as_text(), Some("flash"));
    assert_eq!(message.sender(), "a");
    assert!(!echo);

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(rx_a.try_recv().is_err());
}

#[tokio::test]
async fn test_echo_resolves_and_reaches_handler() {
    let broker = MemoryBroker::new();
    let a = connect(&broker, "a").await;
    let echoes = Arc::new(AtomicUsize::new(0));
    let counter = echoes.clone();
    a.subscribe("loop", Qos::AtLeastOnce, true, Some(Arc::new(move |_, echo| {
        if echo {
            counter.fetch_add(1, Ordering::SeqCst);
        }
    })))
    .await
    .unwrap();

    let publication = a
        .publish(Message::to("loop", Body::from(vec![1u8, 2, 3])), PublishOptions::new().echo())
        .await
        .unwrap();
    let echo = publication.echo().await.unwrap();
    assert_eq!(echo.body.as_binary(), Some(&[1u8, 2, 3][..]));
    assert_eq!(echoes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_publish_validates_reply_subscriptions() {
    let broker = MemoryBroker::new();
    let a = connect(&broker, "a").await;

    let err = assert_err!(a.publish(Message::to("t", "x"), PublishOptions::new().echo()).await);
    assert_eq!(err, DispatchError::EchoNotSubscribed("t".into()));

    let err = assert_err!(
        a.publish(Message::to("t", "x").reply_to("r"), PublishOptions::new().response())
            .await
    );
    assert_eq!(err, DispatchError::ReplyToNotSubscribed("r".into()));

    let err = assert_err!(a.publish(Message::to("t", "x"), PublishOptions::new().response()).await);
    assert_eq!(err, DispatchError::MissingReplyTo);
    assert_eq!(a.pending_callbacks(), 0);
}

#[tokio::test]
async fn test_revision_mismatch_dropped() {
    let broker = MemoryBroker::new();
    let a = connect(&broker, "a").await;
    let old = Dispatcher::connect(
        config("old").revision("0").build(),
        Arc::new(broker.transport()),
    )
    .await
    .unwrap();
    old.when_ready().await;

    let received = Arc::new(AtomicUsize::new(0));
    let counter = received.clone();
    a.subscribe("t", Qos::AtLeastOnce, false, Some(Arc::new(move |_, _| {
        counter.fetch_add(1, Ordering::SeqCst);
    })))
    .await
    .unwrap();

    old.publish(Message::to("t", "stale"), PublishOptions::new()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(received.load(Ordering::SeqCst), 0);
    assert!(!a.is_active_client("old"));
}

#[tokio::test]
async fn test_compressed_bodies_arrive_intact() {
    let broker = MemoryBroker::new();
    let sender = Dispatcher::connect(
        config("s").compression_threshold(Some(16)).build(),
        Arc::new(broker.transport()),
    )
    .await
    .unwrap();
    sender.when_ready().await;
    let receiver = connect(&broker, "r").await;

    let (tx, mut rx) = mpsc::unbounded_channel();
    receiver
        .subscribe("big", Qos::AtLeastOnce, false, Some(Arc::new(move |m, _| {
            let _ = tx.send(m);
        })))
        .await
        .unwrap();

    let text = "lorem ipsum ".repeat(200);
    sender.publish(Message::to("big", text.as_str()), PublishOptions::new()).await.unwrap();
    let message = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap();
    assert_eq!(message.head.compress, Some(true));
    assert_eq!(message.body.as_text(), Some(text.as_str()));
}

// ============================================================================
// Request / response correlation
// ============================================================================

#[tokio::test]
async fn test_request_response() {
    let broker = MemoryBroker::new();
    let server = connect(&broker, "server").await;
    let client = connect(&broker, "client").await;

    let (tx, mut requests) = mpsc::unbounded_channel();
    server
        .subscribe("rpc", Qos::AtLeastOnce, false, Some(Arc::new(move |m, _| {
            let _ = tx.send(m);
        })))
        .await
        .unwrap();
    let responder = server.clone();
    tokio::spawn(async move {
        while let Some(request) = requests.recv().await {
            let n: i64 = request.body.parse().unwrap();
            let reply = Message::reply(&request, serde_json::json!(n * 2)).unwrap();
            responder.publish(reply, PublishOptions::new()).await.unwrap();
        }
    });

    client.subscribe("rpc/client", Qos::AtLeastOnce, false, None).await.unwrap();
    let publication = client
        .publish(
            Message::to("rpc", serde_json::json!(21)).reply_to("rpc/client"),
            PublishOptions::new().response(),
        )
        .await
        .unwrap();
    let request_id = publication.message.head.message_id.clone();

    let response = publication.response().await.unwrap();
    assert_eq!(response.body, Body::Json(serde_json::json!(42)));
    assert_eq!(response.head.reference, Some(request_id));
    assert_eq!(response.head.receiver.as_deref(), Some("client"));
    assert_eq!(client.pending_callbacks(), 0);
}

#[tokio::test]
async fn test_unanswered_request_times_out() {
    let broker = MemoryBroker::new();
    let a = connect(&broker, "a").await;
    a.subscribe("reply/a", Qos::AtLeastOnce, false, None).await.unwrap();

    let publication = a
        .publish(
            Message::to("nobody", "ping").reply_to("reply/a"),
            PublishOptions::new().response_timeout(Duration::from_millis(20)),
        )
        .await
        .unwrap();
    let err = publication.response().await.unwrap_err();
    assert!(err.is_timeout());
    assert_eq!(a.pending_callbacks(), 0);
}

#[tokio::test]
async fn test_cancel_resolves_waiter() {
    let broker = MemoryBroker::new();
    let a = connect(&broker, "a").await;
    a.subscribe("reply/a", Qos::AtLeastOnce, false, None).await.unwrap();

    let publication = a
        .publish(
            Message::to("nobody", "ping").reply_to("reply/a"),
            PublishOptions::new().response(),
        )
        .await
        .unwrap();
    let canceller = publication.canceller();
    assert_eq!(a.pending_callbacks(), 1);
    assert!(canceller.cancel());
    assert_eq!(a.pending_callbacks(), 0);
    assert!(publication.response().await.unwrap_err().is_cancelled());
}

#[tokio::test]
async fn test_destroy_drains_pending_callbacks() {
    let broker = MemoryBroker::new();
    let a = connect(&broker, "a").await;
    a.subscribe("reply/a", Qos::AtLeastOnce, false, None).await.unwrap();
    let publication = a
        .publish(
            Message::to("nobody", "ping").reply_to("reply/a"),
            PublishOptions::new().response_timeout(Duration::from_millis(40)),
        )
        .await
        .unwrap();

    assert_ok!(a.destroy(false).await);
    assert_eq!(a.pending_callbacks(), 0);
    assert!(publication.response().await.unwrap_err().is_timeout());
    assert!(broker.connected_clients().is_empty());

    let err = assert_err!(a.publish(Message::to("t", "x"), PublishOptions::new()).await);
    assert_eq!(err, DispatchError::Destroyed);
}
