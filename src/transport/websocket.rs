//! WebSocket transport
//!
//! This file implements the broker's network front. Responsibilities:
//! - Accept TCP/WebSocket connections
//! - Create a `Session` for each connection and register it with the `Broker`
//! - Enforce login before any other frame; refused sessions are closed
//! - Translate client frames into broker operations and answer requests
//! - Requeue a session's unacknowledged deliveries when it goes away

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::accept_async;
use tracing::{debug, error, info, warn};
use tungstenite::protocol::Message as WsMessage;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::broker::{Session, SharedBroker, lock_broker};
use crate::config::ServerSettings;
use crate::transport::message::{ClientFrame, ServerFrame};

/// Bind `addr` and serve broker sessions until the listener fails.
pub async fn start_websocket_server(
    addr: String,
    broker: SharedBroker,
    settings: ServerSettings,
) -> std::io::Result<()> {
    let listener = TcpListener::bind(&addr).await?;
    info!("Broker listening on ws://{addr}");
    serve(listener, broker, settings).await
}

pub async fn serve(
    listener: TcpListener,
    broker: SharedBroker,
    settings: ServerSettings,
) -> std::io::Result<()> {
    let settings = Arc::new(settings);
    loop {
        let (stream, peer) = listener.accept().await?;
        debug!(%peer, "connection accepted");
        tokio::spawn(handle_connection(stream, broker.clone(), settings.clone()));
    }
}

fn send(sender: &mpsc::UnboundedSender<WsMessage>, frame: &ServerFrame) {
    match frame.to_ws() {
        Ok(msg) => {
            let _ = sender.send(msg);
        }
        Err(e) => error!(error = %e, "failed to serialize server frame"),
    }
}

/// What the read loop should do after a frame has been handled.
enum Flow {
    Continue,
    Close,
}

async fn handle_connection(stream: TcpStream, broker: SharedBroker, settings: Arc<ServerSettings>) {
    let ws_stream = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            warn!("WebSocket handshake error: {e}");
            return;
        }
    };
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<WsMessage>();
    let session = Session::new(tx.clone());
    let session_id = session.id.clone();

    let registered = lock_broker(&broker).register_session(session);
    if let Err(e) = registered {
        warn!(session = %session_id, error = %e, "connection refused");
        if let Ok(msg) = ServerFrame::error(e.to_string()).to_ws() {
            let _ = ws_sender.send(msg).await;
        }
        let _ = ws_sender.close().await;
        return;
    }

    let cleanup_called = Arc::new(AtomicBool::new(false));

    let do_cleanup = {
        let broker = broker.clone();
        let session_id = session_id.clone();
        let cleanup_called = cleanup_called.clone();

        move || {
            if !cleanup_called.swap(true, Ordering::SeqCst) {
                lock_broker(&broker).cleanup_session(&session_id);
            }
        }
    };

    let send_loop = {
        let session_id = session_id.clone();
        let do_cleanup = do_cleanup.clone();

        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if let Err(e) = ws_sender.send(msg).await {
                    warn!(session = %session_id, "Failed to send frame: {e}");
                    break;
                }
            }
            let _ = ws_sender.close().await;

            do_cleanup();
            debug!(session = %session_id, "Send loop closed");
        })
    };

    while let Some(Ok(msg)) = ws_receiver.next().await {
        let text = match msg {
            WsMessage::Text(text) => text,
            WsMessage::Close(_) => break,
            _ => continue,
        };

        let frame = match serde_json::from_str::<ClientFrame>(text.as_str()) {
            Ok(frame) => frame,
            Err(err) => {
                warn!(
                    session = %session_id,
                    "Invalid client frame: {err} | {}",
                    text.as_str().chars().take(100).collect::<String>()
                );
                send(&tx, &ServerFrame::error(format!("invalid frame: {err}")));
                continue;
            }
        };

        if let Flow::Close = handle_frame(&broker, &settings, &session_id, &tx, frame) {
            break;
        }
    }

    do_cleanup();
    // Dropping the last sender lets the send loop flush pending frames and close.
    drop(tx);
    if let Err(e) = send_loop.await {
        error!(session = %session_id, "send loop panicked: {e}");
    }
    info!(session = %session_id, "disconnected");
}

fn handle_frame(
    broker: &SharedBroker,
    settings: &ServerSettings,
    session_id: &str,
    tx: &mpsc::UnboundedSender<WsMessage>,
    frame: ClientFrame,
) -> Flow {
    let mut broker_lock = lock_broker(broker);

    if let ClientFrame::Login { username, password } = &frame {
        if *username == settings.username && *password == settings.password {
            match broker_lock.mark_authenticated(session_id) {
                Ok(()) => {
                    info!(session = session_id, user = %username, "authenticated");
                    send(tx, &ServerFrame::LoginOk {});
                    return Flow::Continue;
                }
                Err(e) => {
                    send(tx, &ServerFrame::error(e.to_string()));
                    return Flow::Close;
                }
            }
        }
        warn!(session = session_id, user = %username, "authentication failed");
        send(tx, &ServerFrame::error("invalid credentials"));
        return Flow::Close;
    }

    if !broker_lock.is_authenticated(session_id) {
        warn!(session = session_id, "frame sent before authentication");
        send(tx, &ServerFrame::error("must authenticate first"));
        return Flow::Close;
    }

    match frame {
        ClientFrame::Login { .. } => {}
        ClientFrame::Declare { queue } => {
            let (message_count, consumer_count) = broker_lock.declare(&queue);
            send(
                tx,
                &ServerFrame::DeclareOk {
                    queue,
                    message_count,
                    consumer_count,
                },
            );
        }
        ClientFrame::Publish { queue, body } => match broker_lock.publish(&queue, body) {
            Ok(message_id) => {
                debug!(session = session_id, queue = %queue, message_id = %message_id, "published");
                send(tx, &ServerFrame::PublishOk { queue });
            }
            Err(e) => send(tx, &ServerFrame::error(e.to_string())),
        },
        ClientFrame::Consume { queue, prefetch } => {
            match broker_lock.consume(session_id, &queue, prefetch.unwrap_or(1)) {
                Ok(consumer_tag) => {
                    send(tx, &ServerFrame::ConsumeOk { consumer_tag });
                    broker_lock.dispatch(&queue);
                }
                Err(e) => send(tx, &ServerFrame::error(e.to_string())),
            }
        }
        ClientFrame::Ack { delivery_tag } => {
            if let Err(e) = broker_lock.ack(session_id, delivery_tag) {
                warn!(session = session_id, "ignoring ack: {e}");
            }
        }
        ClientFrame::Nack {
            delivery_tag,
            requeue,
        } => {
            if let Err(e) = broker_lock.nack(session_id, delivery_tag, requeue) {
                warn!(session = session_id, "ignoring nack: {e}");
            }
        }
    }

    Flow::Continue
}
