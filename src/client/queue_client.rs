//! Queue client
//!
//! `QueueClient` owns one WebSocket connection to the broker. A background
//! reader task splits incoming frames in two: `deliver` frames go to the
//! subscription channel, everything else is a reply to the request currently
//! in flight. Requests are serialized by holding the reply receiver for the
//! whole exchange, so replies can never be matched to the wrong request. A
//! request that times out leaves its reply unaccounted for, so the client
//! refuses further requests with `QueueError::Closed` and must be replaced.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, info, warn};
use tungstenite::protocol::Message as WsMessage;

use crate::codec::{self, Message};
use crate::config::BrokerSettings;
use crate::transport::message::{ClientFrame, ServerFrame};
use crate::utils::error::QueueError;

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, WsMessage>;

/// A message handed to this client by the broker, not yet settled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub delivery_tag: u64,
    pub queue: String,
    pub body: Vec<u8>,
    pub redelivered: bool,
    pub delivery_count: u32,
}

/// How a handler wants a delivery settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Ack,
    Nack { requeue: bool },
}

/// Something that decides the fate of each delivery.
pub trait DeliveryHandler {
    fn handle(&mut self, delivery: &Delivery) -> Outcome;
}

impl<F> DeliveryHandler for F
where
    F: FnMut(&Delivery) -> Outcome,
{
    fn handle(&mut self, delivery: &Delivery) -> Outcome {
        self(delivery)
    }
}

/// Broker-reported state of a declared queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueInfo {
    pub queue: String,
    pub message_count: usize,
    pub consumer_count: usize,
}

#[derive(Clone)]
struct Writer(Arc<Mutex<WsSink>>);

impl Writer {
    async fn send(&self, frame: &ClientFrame) -> Result<(), QueueError> {
        let msg = frame
            .to_ws()
            .map_err(|e| QueueError::Protocol(e.to_string()))?;
        self.0
            .lock()
            .await
            .send(msg)
            .await
            .map_err(|_| QueueError::Closed)
    }
}

pub struct QueueClient {
    writer: Writer,
    replies: Mutex<mpsc::UnboundedReceiver<ServerFrame>>,
    deliveries: Option<mpsc::UnboundedReceiver<Delivery>>,
    reader: JoinHandle<()>,
    request_timeout: Duration,
    desynced: AtomicBool,
}

impl QueueClient {
    /// Connect to the broker described by `settings` and log in.
    pub async fn connect(settings: &BrokerSettings) -> Result<Self, QueueError> {
        let request_timeout = Duration::from_millis(settings.request_timeout_ms);
        let url = settings.url();

        let (ws_stream, _response) = timeout(request_timeout, connect_async(url.as_str()))
            .await
            .map_err(|_| QueueError::Timeout("broker connection"))?
            .map_err(|e| QueueError::Connection(format!("{url}: {e}")))?;

        let (sink, stream) = ws_stream.split();
        let (reply_tx, reply_rx) = mpsc::unbounded_channel();
        let (delivery_tx, delivery_rx) = mpsc::unbounded_channel();
        let reader = tokio::spawn(read_loop(stream, reply_tx, delivery_tx));

        let client = Self {
            writer: Writer(Arc::new(Mutex::new(sink))),
            replies: Mutex::new(reply_rx),
            deliveries: Some(delivery_rx),
            reader,
            request_timeout,
            desynced: AtomicBool::new(false),
        };

        let login = ClientFrame::Login {
            username: settings.username.clone(),
            password: settings.password.clone(),
        };
        match client.request(&login, "login").await {
            Ok(ServerFrame::LoginOk {}) => {}
            Ok(other) => return Err(unexpected(&other)),
            Err(QueueError::Broker(message)) => return Err(QueueError::Auth(message)),
            Err(e) => return Err(e),
        }

        info!(url = %url, "connected to broker");
        Ok(client)
    }

    async fn request(
        &self,
        frame: &ClientFrame,
        what: &'static str,
    ) -> Result<ServerFrame, QueueError> {
        let mut replies = self.replies.lock().await;
        if self.desynced.load(Ordering::Acquire) {
            return Err(QueueError::Closed);
        }
        self.writer.send(frame).await?;

        match timeout(self.request_timeout, replies.recv()).await {
            Err(_) => {
                self.desynced.store(true, Ordering::Release);
                Err(QueueError::Timeout(what))
            }
            Ok(None) => Err(QueueError::Closed),
            Ok(Some(ServerFrame::Error { message })) => Err(QueueError::Broker(message)),
            Ok(Some(frame)) => Ok(frame),
        }
    }

    /// Declare `queue`; declaring an existing queue is a no-op.
    pub async fn declare(&self, queue: &str) -> Result<QueueInfo, QueueError> {
        let frame = ClientFrame::Declare {
            queue: queue.to_string(),
        };
        match self.request(&frame, "declare").await? {
            ServerFrame::DeclareOk {
                queue,
                message_count,
                consumer_count,
            } => Ok(QueueInfo {
                queue,
                message_count,
                consumer_count,
            }),
            other => Err(unexpected(&other)),
        }
    }

    /// Encode and publish `message`. Returns once the broker has enqueued it;
    /// consumer acknowledgment is never awaited.
    pub async fn publish(&self, queue: &str, message: &Message) -> Result<(), QueueError> {
        let body = codec::encode(message);
        self.publish_raw(queue, &body).await?;
        debug!(queue, id = %message.id, "message published");
        Ok(())
    }

    /// Publish an already-encoded UTF-8 body.
    pub async fn publish_raw(&self, queue: &str, body: &[u8]) -> Result<(), QueueError> {
        let body = std::str::from_utf8(body)
            .map_err(|e| QueueError::Protocol(format!("body is not UTF-8: {e}")))?;
        let frame = ClientFrame::Publish {
            queue: queue.to_string(),
            body: body.to_string(),
        };
        match self.request(&frame, "publish").await? {
            ServerFrame::PublishOk { .. } => Ok(()),
            other => Err(unexpected(&other)),
        }
    }

    /// Start consuming `queue`, with at most `prefetch` unsettled deliveries.
    /// A client supports a single subscription.
    pub async fn consume(
        &mut self,
        queue: &str,
        prefetch: u16,
    ) -> Result<Subscription, QueueError> {
        if self.deliveries.is_none() {
            return Err(QueueError::AlreadyConsuming);
        }
        let frame = ClientFrame::Consume {
            queue: queue.to_string(),
            prefetch: Some(prefetch),
        };
        let consumer_tag = match self.request(&frame, "consume").await? {
            ServerFrame::ConsumeOk { consumer_tag } => consumer_tag,
            other => return Err(unexpected(&other)),
        };
        let deliveries = self.deliveries.take().ok_or(QueueError::AlreadyConsuming)?;

        info!(queue, consumer_tag = %consumer_tag, prefetch, "consuming");
        Ok(Subscription {
            consumer_tag,
            deliveries,
            writer: self.writer.clone(),
        })
    }

    /// Close the connection. Errors are logged, not returned.
    pub async fn close(self) {
        if let Err(e) = self.writer.0.lock().await.close().await {
            warn!(error = %e, "error while closing broker connection");
        }
        debug!("broker connection closed");
    }
}

impl Drop for QueueClient {
    /// Dropping the client stops the reader, which also ends its subscription.
    fn drop(&mut self) {
        self.reader.abort();
    }
}

fn unexpected(frame: &ServerFrame) -> QueueError {
    QueueError::Protocol(format!("unexpected reply: {frame:?}"))
}

async fn read_loop(
    mut stream: futures_util::stream::SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>,
    replies: mpsc::UnboundedSender<ServerFrame>,
    deliveries: mpsc::UnboundedSender<Delivery>,
) {
    while let Some(msg) = stream.next().await {
        let text = match msg {
            Ok(WsMessage::Text(text)) => text,
            Ok(WsMessage::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                warn!(error = %e, "broker connection error");
                break;
            }
        };

        match serde_json::from_str::<ServerFrame>(text.as_str()) {
            Ok(ServerFrame::Deliver {
                delivery_tag,
                queue,
                body,
                redelivered,
                delivery_count,
                ..
            }) => {
                let delivery = Delivery {
                    delivery_tag,
                    queue,
                    body: body.into_bytes(),
                    redelivered,
                    delivery_count,
                };
                // Without a subscription the delivery stays unacked and is
                // requeued by the broker when this connection closes.
                let _ = deliveries.send(delivery);
            }
            Ok(frame) => {
                let _ = replies.send(frame);
            }
            Err(e) => warn!(error = %e, "unreadable frame from broker"),
        }
    }
    debug!("broker read loop finished");
}

/// An active consumer on one queue.
pub struct Subscription {
    consumer_tag: String,
    deliveries: mpsc::UnboundedReceiver<Delivery>,
    writer: Writer,
}

impl Subscription {
    pub fn consumer_tag(&self) -> &str {
        &self.consumer_tag
    }

    /// Wait for the next delivery; `None` once the connection is gone.
    pub async fn recv(&mut self) -> Option<Delivery> {
        self.deliveries.recv().await
    }

    pub async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        self.writer
            .send(&ClientFrame::Ack {
                delivery_tag: delivery.delivery_tag,
            })
            .await
    }

    pub async fn nack(&self, delivery: &Delivery, requeue: bool) -> Result<(), QueueError> {
        self.writer
            .send(&ClientFrame::Nack {
                delivery_tag: delivery.delivery_tag,
                requeue,
            })
            .await
    }

    pub async fn settle(&self, delivery: &Delivery, outcome: Outcome) -> Result<(), QueueError> {
        match outcome {
            Outcome::Ack => self.ack(delivery).await,
            Outcome::Nack { requeue } => self.nack(delivery, requeue).await,
        }
    }

    /// Feed deliveries to `handler` and settle each one, until `shutdown`
    /// flips to `true` (returns `Ok`) or the connection is lost (returns
    /// `Err(QueueError::Closed)`).
    pub async fn run<H: DeliveryHandler>(
        &mut self,
        handler: &mut H,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<(), QueueError> {
        loop {
            if *shutdown.borrow() {
                return Ok(());
            }
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        // Nobody can signal shutdown any more; treat it as one.
                        return Ok(());
                    }
                }
                delivery = self.deliveries.recv() => {
                    let Some(delivery) = delivery else {
                        return Err(QueueError::Closed);
                    };
                    let outcome = handler.handle(&delivery);
                    self.settle(&delivery, outcome).await?;
                }
            }
        }
    }
}
