use std::future::Future;

use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::client::QueueClient;
use crate::codec::Message;
use crate::config::BrokerSettings;
use crate::utils::error::QueueError;

/// Where the ingress sends accepted messages.
pub trait MessagePublisher: Send + Sync + 'static {
    fn publish(&self, message: &Message) -> impl Future<Output = Result<(), QueueError>> + Send;
}

/// Publishes over one lazily opened broker connection shared by all
/// requests. A connection-level failure drops the cached client so the next
/// publish reconnects.
pub struct BrokerPublisher {
    settings: BrokerSettings,
    queue: String,
    client: Mutex<Option<QueueClient>>,
}

impl BrokerPublisher {
    pub fn new(settings: BrokerSettings, queue: impl Into<String>) -> Self {
        Self {
            settings,
            queue: queue.into(),
            client: Mutex::new(None),
        }
    }

    async fn connected<'a>(
        &self,
        slot: &'a mut Option<QueueClient>,
    ) -> Result<&'a QueueClient, QueueError> {
        if slot.is_none() {
            let client = QueueClient::connect(&self.settings).await?;
            client.declare(&self.queue).await?;
            info!(queue = %self.queue, "ingress connected to broker");
            *slot = Some(client);
        }
        slot.as_ref().ok_or(QueueError::Closed)
    }

    async fn try_publish(
        &self,
        slot: &mut Option<QueueClient>,
        message: &Message,
    ) -> Result<(), QueueError> {
        let client = self.connected(slot).await?;
        client.publish(&self.queue, message).await
    }
}

impl MessagePublisher for BrokerPublisher {
    async fn publish(&self, message: &Message) -> Result<(), QueueError> {
        let mut slot = self.client.lock().await;
        let reused = slot.is_some();

        match self.try_publish(&mut slot, message).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_connection_level() => {
                *slot = None;
                if !reused {
                    return Err(e);
                }
                // The cached connection may simply have gone stale.
                warn!(error = %e, "cached broker connection failed, reconnecting");
                let retried = self.try_publish(&mut slot, message).await;
                if retried.as_ref().is_err_and(QueueError::is_connection_level) {
                    *slot = None;
                }
                retried
            }
            Err(e) => Err(e),
        }
    }
}
