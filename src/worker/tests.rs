use super::retry::{Backoff, CircuitBreaker, CircuitState, Reconnect};
use super::{CallbackError, ConsumerWorker, WorkerState};
use crate::broker::lock_broker;
use crate::client::QueueClient;
use crate::codec::Message;
use crate::config::{BrokerSettings, DEMO_QUEUE, WorkerSettings};
use crate::sink::MessageSink;
use crate::tests::support::{TestBroker, spawn_broker};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;

fn fast_policy() -> WorkerSettings {
    WorkerSettings {
        initial_backoff_ms: 10,
        max_backoff_ms: 50,
        ..WorkerSettings::default()
    }
}

async fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("timed out waiting for {what}");
}

fn collecting(
    sink: &MessageSink,
) -> impl FnMut(Message) -> Result<(), CallbackError> + Send + use<> {
    let sink = sink.clone();
    move |message| {
        sink.add(message);
        Ok(())
    }
}

/// Close the worker's connection from the broker side; returns its session id.
fn close_worker_session(server: &TestBroker) -> String {
    let broker = lock_broker(&server.broker);
    let (id, session) = broker.sessions.iter().next().expect("worker session");
    let _ = session
        .sender
        .send(tungstenite::protocol::Message::Close(None));
    id.clone()
}

#[test]
fn test_backoff_doubles_and_caps() {
    let mut backoff = Backoff::new(Duration::from_millis(100), Duration::from_millis(500));
    let delays: Vec<u64> = (0..5)
        .map(|_| backoff.next_delay().as_millis() as u64)
        .collect();
    assert_eq!(delays, vec![100, 200, 400, 500, 500]);

    backoff.reset();
    assert_eq!(backoff.next_delay(), Duration::from_millis(100));
}

#[test]
fn test_breaker_opens_at_threshold() {
    let mut breaker = CircuitBreaker::new(2, Duration::from_secs(60));
    assert!(breaker.allow().is_ok());

    breaker.record_failure();
    assert_eq!(breaker.state(), CircuitState::Closed);
    breaker.record_failure();
    assert_eq!(breaker.state(), CircuitState::Open);

    let remaining = breaker.allow().unwrap_err();
    assert!(remaining <= Duration::from_secs(60));
    assert!(remaining > Duration::from_secs(50));
}

#[test]
fn test_breaker_half_open_trial() {
    let mut breaker = CircuitBreaker::new(1, Duration::ZERO);
    breaker.record_failure();
    assert_eq!(breaker.state(), CircuitState::Open);

    assert!(breaker.allow().is_ok());
    assert_eq!(breaker.state(), CircuitState::HalfOpen);

    // A failed trial reopens immediately.
    breaker.record_failure();
    assert_eq!(breaker.state(), CircuitState::Open);

    assert!(breaker.allow().is_ok());
    breaker.record_success();
    assert_eq!(breaker.state(), CircuitState::Closed);
}

#[test]
fn test_breaker_with_zero_threshold_never_opens() {
    let mut breaker = CircuitBreaker::new(0, Duration::from_secs(60));
    for _ in 0..10 {
        breaker.record_failure();
    }
    assert_eq!(breaker.state(), CircuitState::Closed);
    assert!(breaker.allow().is_ok());
}

#[test]
fn test_lost_session_does_not_count_as_failed_attempt() {
    let mut reconnect = Reconnect::from_settings(&WorkerSettings {
        initial_backoff_ms: 100,
        max_backoff_ms: 1_000,
        failure_threshold: 1,
        ..WorkerSettings::default()
    });
    reconnect.on_failure();
    reconnect.on_failure();
    reconnect.on_connected();

    assert_eq!(reconnect.on_lost(), Duration::from_millis(100));
    assert_eq!(reconnect.consecutive_failures, 0);
    assert_eq!(reconnect.breaker.state(), CircuitState::Closed);
}

#[tokio::test]
async fn test_worker_consumes_into_sink_and_stops() {
    let server = spawn_broker(5).await;
    let sink = MessageSink::new();
    let worker = ConsumerWorker::new(
        server.client_settings(),
        fast_policy(),
        DEMO_QUEUE,
        collecting(&sink),
    );
    let mut state = worker.state();
    assert_eq!(*state.borrow(), WorkerState::Starting);

    let (stop_tx, stop_rx) = watch::channel(false);
    let handle = tokio::spawn(worker.run(stop_rx));

    tokio::time::timeout(
        Duration::from_secs(5),
        state.wait_for(|s| *s == WorkerState::Consuming),
    )
    .await
    .expect("worker never started consuming")
    .unwrap();

    let publisher = QueueClient::connect(&server.client_settings()).await.unwrap();
    let first = Message::new("a");
    let second = Message::new("b");
    publisher.publish(DEMO_QUEUE, &first).await.unwrap();
    publisher.publish(DEMO_QUEUE, &second).await.unwrap();

    wait_until("two messages", || sink.count() == 2).await;
    assert_eq!(sink.list(), vec![first, second]);

    stop_tx.send(true).unwrap();
    let final_state = tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("worker did not stop")
        .unwrap();
    assert_eq!(final_state, WorkerState::Stopped);
    assert_eq!(*state.borrow(), WorkerState::Stopped);
}

#[tokio::test]
async fn test_failed_callback_is_redelivered() {
    let server = spawn_broker(5).await;
    let sink = MessageSink::new();
    let recorder = sink.clone();
    let mut failed_once = false;
    let callback = move |message: Message| -> Result<(), CallbackError> {
        if !failed_once {
            failed_once = true;
            return Err("transient failure".into());
        }
        recorder.add(message);
        Ok(())
    };

    let worker = ConsumerWorker::new(server.client_settings(), fast_policy(), DEMO_QUEUE, callback);
    let (stop_tx, stop_rx) = watch::channel(false);
    let handle = tokio::spawn(worker.run(stop_rx));

    let publisher = QueueClient::connect(&server.client_settings()).await.unwrap();
    publisher.declare(DEMO_QUEUE).await.unwrap();
    let sent = Message::new("try again");
    publisher.publish(DEMO_QUEUE, &sent).await.unwrap();

    wait_until("redelivered message", || sink.count() == 1).await;
    assert_eq!(sink.list(), vec![sent]);
    assert_eq!(
        lock_broker(&server.broker).dead_letters().count(DEMO_QUEUE).unwrap(),
        0
    );

    stop_tx.send(true).unwrap();
    assert_eq!(handle.await.unwrap(), WorkerState::Stopped);
}

#[tokio::test]
async fn test_undecodable_message_is_dead_lettered() {
    let server = spawn_broker(5).await;
    let sink = MessageSink::new();
    let worker = ConsumerWorker::new(
        server.client_settings(),
        fast_policy(),
        DEMO_QUEUE,
        collecting(&sink),
    );
    let (stop_tx, stop_rx) = watch::channel(false);
    let handle = tokio::spawn(worker.run(stop_rx));

    let publisher = QueueClient::connect(&server.client_settings()).await.unwrap();
    publisher.declare(DEMO_QUEUE).await.unwrap();
    publisher.publish_raw(DEMO_QUEUE, b"not json").await.unwrap();
    let valid = Message::new("after the poison");
    publisher.publish(DEMO_QUEUE, &valid).await.unwrap();

    wait_until("valid message", || sink.count() == 1).await;
    assert_eq!(sink.list(), vec![valid]);

    let letters = lock_broker(&server.broker)
        .dead_letters()
        .load(DEMO_QUEUE)
        .unwrap();
    assert_eq!(letters.len(), 1);
    assert_eq!(letters[0].body, "not json");
    assert_eq!(letters[0].delivery_count, 1);

    stop_tx.send(true).unwrap();
    assert_eq!(handle.await.unwrap(), WorkerState::Stopped);
}

#[tokio::test]
async fn test_unreachable_broker_faults_after_max_attempts() {
    let port = portpicker::pick_unused_port().expect("No free ports");
    let settings = BrokerSettings {
        host: "127.0.0.1".to_string(),
        port,
        request_timeout_ms: 500,
        ..BrokerSettings::default()
    };
    let policy = WorkerSettings {
        max_attempts: 1,
        ..fast_policy()
    };
    let sink = MessageSink::new();
    let worker = ConsumerWorker::new(settings, policy, DEMO_QUEUE, collecting(&sink));
    let state = worker.state();

    let (_stop_tx, stop_rx) = watch::channel(false);
    let final_state = tokio::time::timeout(Duration::from_secs(5), worker.run(stop_rx))
        .await
        .expect("worker kept retrying");

    assert_eq!(final_state, WorkerState::Faulted);
    assert_eq!(*state.borrow(), WorkerState::Faulted);
    assert_eq!(sink.count(), 0);
}

#[tokio::test]
async fn test_shutdown_interrupts_reconnect_wait() {
    let port = portpicker::pick_unused_port().expect("No free ports");
    let settings = BrokerSettings {
        host: "127.0.0.1".to_string(),
        port,
        request_timeout_ms: 500,
        ..BrokerSettings::default()
    };
    let policy = WorkerSettings {
        initial_backoff_ms: 60_000,
        max_backoff_ms: 60_000,
        ..WorkerSettings::default()
    };
    let worker = ConsumerWorker::new(settings, policy, DEMO_QUEUE, |_: Message| Ok(()));
    let mut state = worker.state();

    let (stop_tx, stop_rx) = watch::channel(false);
    let handle = tokio::spawn(worker.run(stop_rx));

    tokio::time::timeout(
        Duration::from_secs(5),
        state.wait_for(|s| *s == WorkerState::Faulted),
    )
    .await
    .expect("worker never faulted")
    .unwrap();

    stop_tx.send(true).unwrap();
    let final_state = tokio::time::timeout(Duration::from_secs(2), handle)
        .await
        .expect("shutdown did not interrupt the backoff")
        .unwrap();
    assert_eq!(final_state, WorkerState::Stopped);
}

#[tokio::test]
async fn test_worker_reconnects_after_connection_loss() {
    let server = spawn_broker(5).await;
    let sink = MessageSink::new();
    let worker = ConsumerWorker::new(
        server.client_settings(),
        fast_policy(),
        DEMO_QUEUE,
        collecting(&sink),
    );
    let mut state = worker.state();
    let (stop_tx, stop_rx) = watch::channel(false);
    let handle = tokio::spawn(worker.run(stop_rx));

    tokio::time::timeout(
        Duration::from_secs(5),
        state.wait_for(|s| *s == WorkerState::Consuming),
    )
    .await
    .unwrap()
    .unwrap();

    let first_session = close_worker_session(&server);

    wait_until("a fresh worker session", || {
        let broker = lock_broker(&server.broker);
        broker.sessions.len() == 1
            && !broker.sessions.contains_key(&first_session)
            && broker.queues.get(DEMO_QUEUE).is_some_and(|q| !q.consumers.is_empty())
    })
    .await;
    assert_eq!(*state.borrow(), WorkerState::Consuming);

    let publisher = QueueClient::connect(&server.client_settings()).await.unwrap();
    let sent = Message::new("after reconnect");
    publisher.publish(DEMO_QUEUE, &sent).await.unwrap();
    wait_until("message after reconnect", || sink.count() == 1).await;

    stop_tx.send(true).unwrap();
    assert_eq!(handle.await.unwrap(), WorkerState::Stopped);
}

#[tokio::test]
async fn test_lost_session_reconnects_even_with_single_attempt() {
    let server = spawn_broker(5).await;
    let policy = WorkerSettings {
        max_attempts: 1,
        ..fast_policy()
    };
    let sink = MessageSink::new();
    let worker = ConsumerWorker::new(
        server.client_settings(),
        policy,
        DEMO_QUEUE,
        collecting(&sink),
    );
    let mut state = worker.state();
    let (stop_tx, stop_rx) = watch::channel(false);
    let handle = tokio::spawn(worker.run(stop_rx));

    tokio::time::timeout(
        Duration::from_secs(5),
        state.wait_for(|s| *s == WorkerState::Consuming),
    )
    .await
    .unwrap()
    .unwrap();

    let first_session = close_worker_session(&server);
    wait_until("a fresh worker session", || {
        let broker = lock_broker(&server.broker);
        broker.sessions.len() == 1 && !broker.sessions.contains_key(&first_session)
    })
    .await;
    tokio::time::timeout(
        Duration::from_secs(5),
        state.wait_for(|s| *s == WorkerState::Consuming),
    )
    .await
    .expect("worker did not resume consuming")
    .unwrap();
    assert!(!handle.is_finished());

    stop_tx.send(true).unwrap();
    assert_eq!(handle.await.unwrap(), WorkerState::Stopped);
}

#[tokio::test]
async fn test_shutdown_interrupts_stalled_connect() {
    // Accepts TCP connections but never completes the WebSocket handshake.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let _server = tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((stream, _)) = listener.accept().await {
            held.push(stream);
        }
    });

    let settings = BrokerSettings {
        host: "127.0.0.1".to_string(),
        port,
        request_timeout_ms: 30_000,
        ..BrokerSettings::default()
    };
    let worker = ConsumerWorker::new(settings, fast_policy(), DEMO_QUEUE, |_: Message| Ok(()));
    let mut state = worker.state();
    let (stop_tx, stop_rx) = watch::channel(false);
    let handle = tokio::spawn(worker.run(stop_rx));

    tokio::time::timeout(
        Duration::from_secs(5),
        state.wait_for(|s| *s == WorkerState::Connecting),
    )
    .await
    .unwrap()
    .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    stop_tx.send(true).unwrap();
    let final_state = tokio::time::timeout(Duration::from_secs(2), handle)
        .await
        .expect("shutdown waited for the connect timeout")
        .unwrap();
    assert_eq!(final_state, WorkerState::Stopped);
}
