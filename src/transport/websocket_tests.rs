use crate::broker::lock_broker;
use crate::tests::support::{next_frame, raw_connect, raw_login, send_frame, spawn_broker};
use crate::transport::message::{ClientFrame, ServerFrame};
use std::time::Duration;

#[tokio::test]
async fn test_login_success() {
    let server = spawn_broker(5).await;
    let _ws = raw_login(&server.url()).await;

    let broker = lock_broker(&server.broker);
    assert_eq!(broker.sessions.len(), 1);
    assert!(broker.sessions.values().all(|s| s.authenticated));
}

#[tokio::test]
async fn test_login_failure_closes_session() {
    let server = spawn_broker(5).await;
    let mut ws = raw_connect(&server.url()).await;

    send_frame(
        &mut ws,
        &ClientFrame::Login {
            username: "wrong_user".to_string(),
            password: "wrong_password".to_string(),
        },
    )
    .await;

    match next_frame(&mut ws).await {
        Some(ServerFrame::Error { message }) => assert_eq!(message, "invalid credentials"),
        other => panic!("Expected Error, got {other:?}"),
    }
    assert_eq!(next_frame(&mut ws).await, None);
}

#[tokio::test]
async fn test_action_before_auth_fails() {
    let server = spawn_broker(5).await;
    let mut ws = raw_connect(&server.url()).await;

    send_frame(
        &mut ws,
        &ClientFrame::Declare {
            queue: "demo-queue".to_string(),
        },
    )
    .await;

    match next_frame(&mut ws).await {
        Some(ServerFrame::Error { message }) => assert_eq!(message, "must authenticate first"),
        other => panic!("Expected Error, got {other:?}"),
    }
    assert_eq!(next_frame(&mut ws).await, None);

    // The broker drops the session once the connection is torn down.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(lock_broker(&server.broker).sessions.is_empty());
    assert!(lock_broker(&server.broker).queues.is_empty());
}

#[tokio::test]
async fn test_publish_to_undeclared_queue_returns_error() {
    let server = spawn_broker(5).await;
    let mut ws = raw_login(&server.url()).await;

    send_frame(
        &mut ws,
        &ClientFrame::Publish {
            queue: "nowhere".to_string(),
            body: "x".to_string(),
        },
    )
    .await;

    match next_frame(&mut ws).await {
        Some(ServerFrame::Error { message }) => {
            assert_eq!(message, "queue 'nowhere' is not declared")
        }
        other => panic!("Expected Error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_declare_publish_consume_ack_over_the_wire() {
    let server = spawn_broker(5).await;
    let mut producer = raw_login(&server.url()).await;
    let mut consumer = raw_login(&server.url()).await;

    send_frame(
        &mut producer,
        &ClientFrame::Declare {
            queue: "q".to_string(),
        },
    )
    .await;
    assert_eq!(
        next_frame(&mut producer).await,
        Some(ServerFrame::DeclareOk {
            queue: "q".to_string(),
            message_count: 0,
            consumer_count: 0
        })
    );

    send_frame(
        &mut producer,
        &ClientFrame::Publish {
            queue: "q".to_string(),
            body: "hello".to_string(),
        },
    )
    .await;
    assert_eq!(
        next_frame(&mut producer).await,
        Some(ServerFrame::PublishOk {
            queue: "q".to_string()
        })
    );

    send_frame(
        &mut consumer,
        &ClientFrame::Consume {
            queue: "q".to_string(),
            prefetch: Some(1),
        },
    )
    .await;
    let Some(ServerFrame::ConsumeOk { consumer_tag }) = next_frame(&mut consumer).await else {
        panic!("Expected ConsumeOk");
    };

    let Some(ServerFrame::Deliver {
        consumer_tag: delivered_to,
        delivery_tag,
        body,
        redelivered,
        ..
    }) = next_frame(&mut consumer).await
    else {
        panic!("Expected Deliver");
    };
    assert_eq!(delivered_to, consumer_tag);
    assert_eq!(body, "hello");
    assert!(!redelivered);

    send_frame(&mut consumer, &ClientFrame::Ack { delivery_tag }).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(lock_broker(&server.broker).unacked.is_empty());
}

#[tokio::test]
async fn test_disconnect_requeues_unacked_delivery() {
    let server = spawn_broker(5).await;
    let mut producer = raw_login(&server.url()).await;
    send_frame(
        &mut producer,
        &ClientFrame::Declare {
            queue: "q".to_string(),
        },
    )
    .await;
    next_frame(&mut producer).await;
    send_frame(
        &mut producer,
        &ClientFrame::Publish {
            queue: "q".to_string(),
            body: "survivor".to_string(),
        },
    )
    .await;
    next_frame(&mut producer).await;

    {
        let mut first = raw_login(&server.url()).await;
        send_frame(
            &mut first,
            &ClientFrame::Consume {
                queue: "q".to_string(),
                prefetch: None,
            },
        )
        .await;
        next_frame(&mut first).await;
        assert!(matches!(
            next_frame(&mut first).await,
            Some(ServerFrame::Deliver { .. })
        ));
        first.close(None).await.expect("Failed to close WebSocket");
    }

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(lock_broker(&server.broker).queue_depth("q"), Some(1));

    let mut second = raw_login(&server.url()).await;
    send_frame(
        &mut second,
        &ClientFrame::Consume {
            queue: "q".to_string(),
            prefetch: None,
        },
    )
    .await;
    next_frame(&mut second).await;
    match next_frame(&mut second).await {
        Some(ServerFrame::Deliver {
            body,
            redelivered,
            delivery_count,
            ..
        }) => {
            assert_eq!(body, "survivor");
            assert!(redelivered);
            assert_eq!(delivery_count, 2);
        }
        other => panic!("Expected redelivery, got {other:?}"),
    }
}

#[tokio::test]
async fn test_unparsable_frame_gets_error_reply() {
    use futures_util::SinkExt;
    use tungstenite::protocol::Message as WsMessage;

    let server = spawn_broker(5).await;
    let mut ws = raw_login(&server.url()).await;

    ws.send(WsMessage::text(r#"{"type": "bind", "exchange": "x"}"#))
        .await
        .expect("Failed to send frame");
    match next_frame(&mut ws).await {
        Some(ServerFrame::Error { message }) => assert!(
            message.starts_with("invalid frame"),
            "unexpected message: {message}"
        ),
        other => panic!("Expected Error, got {other:?}"),
    }

    // The session stays usable.
    send_frame(
        &mut ws,
        &ClientFrame::Declare {
            queue: "q".to_string(),
        },
    )
    .await;
    assert!(matches!(
        next_frame(&mut ws).await,
        Some(ServerFrame::DeclareOk { .. })
    ));
}
