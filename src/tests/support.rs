//! Shared fixtures for tests that need a live broker.

use std::sync::{Arc, Mutex};

use futures_util::{SinkExt, StreamExt};
use tempfile::{TempDir, tempdir};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tungstenite::protocol::Message as WsMessage;

use crate::broker::{Broker, SharedBroker};
use crate::config::{BrokerSettings, ServerSettings};
use crate::transport::message::{ClientFrame, ServerFrame};
use crate::transport::serve;

pub struct TestBroker {
    pub port: u16,
    pub broker: SharedBroker,
    _dir: TempDir,
    handle: JoinHandle<std::io::Result<()>>,
}

impl TestBroker {
    pub fn url(&self) -> String {
        format!("ws://127.0.0.1:{}", self.port)
    }

    pub fn client_settings(&self) -> BrokerSettings {
        BrokerSettings {
            host: "127.0.0.1".to_string(),
            port: self.port,
            request_timeout_ms: 2000,
            ..BrokerSettings::default()
        }
    }
}

impl Drop for TestBroker {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Start a broker on an ephemeral port with a throwaway dead-letter store.
pub async fn spawn_broker(max_deliveries: u32) -> TestBroker {
    let dir = tempdir().expect("Failed to create temp dir");
    let settings = ServerSettings {
        host: "127.0.0.1".to_string(),
        port: 0,
        max_deliveries,
        dead_letter_path: dir.path().to_str().unwrap().to_string(),
        dead_letter_ttl_secs: None,
        dead_letter_max_per_queue: None,
        ..ServerSettings::default()
    };

    let broker = Arc::new(Mutex::new(Broker::new(&settings).expect("open broker")));
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let port = listener.local_addr().unwrap().port();
    let handle = tokio::spawn(serve(listener, broker.clone(), settings));

    TestBroker {
        port,
        broker,
        _dir: dir,
        handle,
    }
}

pub type RawSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub async fn raw_connect(url: &str) -> RawSocket {
    let (ws, _) = connect_async(url).await.expect("WebSocket handshake failed");
    ws
}

pub async fn send_frame(ws: &mut RawSocket, frame: &ClientFrame) {
    ws.send(frame.to_ws().unwrap())
        .await
        .expect("Failed to send frame");
}

/// Read the next text frame, skipping pings.
pub async fn next_frame(ws: &mut RawSocket) -> Option<ServerFrame> {
    loop {
        match ws.next().await? {
            Ok(WsMessage::Text(text)) => {
                let raw = text.as_str();
                return Some(serde_json::from_str(raw).unwrap_or_else(|e| {
                    panic!("Failed to deserialize ServerFrame from '{raw}': {e}")
                }));
            }
            Ok(WsMessage::Close(_)) | Err(_) => return None,
            Ok(_) => continue,
        }
    }
}

pub async fn raw_login(url: &str) -> RawSocket {
    let mut ws = raw_connect(url).await;
    send_frame(
        &mut ws,
        &ClientFrame::Login {
            username: "guest".to_string(),
            password: "guest".to_string(),
        },
    )
    .await;
    assert_eq!(next_frame(&mut ws).await, Some(ServerFrame::LoginOk {}));
    ws
}
