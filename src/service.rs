use std::sync::Arc;

use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

use crate::{
    broker::Producer,
    codec::PayloadCodec,
    config::Config,
    error::Error,
    message::{MessageStatistics, MessageStatus},
    publisher::Publisher,
    store::Store,
};

/// Ingestion side of the pipeline, shared by every HTTP worker.
pub struct Service {
    config: Config,
    store: Store,
    publisher: Arc<Publisher>,
    codec: PayloadCodec,
    /// Publish handoffs that have not reached the publisher queue yet.
    handoffs: TaskTracker,
}

#[bon::bon]
impl Service {
    /// Opens the store described by `config` and starts a publisher on `producer`.
    #[builder]
    pub async fn connect_with(config: Config, producer: Arc<dyn Producer>) -> Result<Self, Error> {
        let store = Store::connect(&config).await?;

        Ok(Self::builder()
            .config(config)
            .store(store)
            .producer(producer)
            .build())
    }

    #[builder]
    pub fn new(config: Config, store: Store, producer: Arc<dyn Producer>) -> Self {
        let publisher = Arc::new(Publisher::from_config(producer, &config));
        let codec = PayloadCodec::new(config.wire_format, config.compression);

        Self {
            config,
            store,
            publisher,
            codec,
            handoffs: TaskTracker::new(),
        }
    }
}

impl Service {
    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn publisher(&self) -> &Arc<Publisher> {
        &self.publisher
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Stores a new message and queues it for publishing.
    ///
    /// Returns as soon as the message is stored. Publishing happens on a background
    /// task, so a full publisher queue never holds up the caller; failures are logged.
    pub async fn create_message(&self, content: &str, status_id: i64) -> Result<i64, Error> {
        if content.is_empty() {
            return Err(Error::validation("content is required"));
        }

        let status = MessageStatus::from_id(status_id)
            .ok_or_else(|| Error::validation(format!("unknown status_id {status_id}")))?;

        let id = self.store.create(content, status).await?;

        let payload = match self.codec.encode(id, content) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(message_id = id, error = %e, "failed to encode message for publishing");
                return Ok(id);
            }
        };

        let publisher = Arc::clone(&self.publisher);
        let topic = self.config.topic().to_owned();
        self.handoffs.spawn(async move {
            match publisher.publish(topic, payload).await {
                Ok(_receipt) => debug!(message_id = id, "message queued for publishing"),
                Err(e) => warn!(message_id = id, error = %e, "message was not queued for publishing"),
            }
        });

        Ok(id)
    }

    pub async fn statistics(&self) -> Result<MessageStatistics, Error> {
        self.store.statistics().await
    }

    /// Waits for pending handoffs, then drains the publisher. The store stays open.
    pub async fn close(&self) {
        let timeout = self.config.shutdown_timeout();

        self.handoffs.close();
        if tokio::time::timeout(timeout, self.handoffs.wait()).await.is_err() {
            warn!(
                pending = self.handoffs.len(),
                ?timeout,
                "publish handoffs did not finish in time"
            );
        }

        self.publisher.close(timeout).await;
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use crate::{broker::memory::InMemoryBroker, store::tests::memory_store};

    use super::*;

    async fn service(broker: &InMemoryBroker) -> Service {
        Service::connect_with()
            .config(Config::default())
            .producer(Arc::new(broker.clone()))
            .call()
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn created_message_is_received_and_published() {
        let broker = InMemoryBroker::new(1);
        let service = service(&broker).await;

        let id = service.create_message("hello", 1).await.unwrap();
        service.close().await;

        let message = service.store().get_by_id(id).await.unwrap();
        assert_eq!(message.content, "hello");
        assert_eq!(message.status, MessageStatus::Received);

        let records = broker.records("messages").await;
        assert_eq!(records.len(), 1);
        let decoded = PayloadCodec::default().decode(&records[0].payload).unwrap();
        assert_eq!(decoded.id, Some(id));
    }

    #[tokio::test]
    async fn invalid_requests_store_nothing() {
        let broker = InMemoryBroker::new(1);
        let service = service(&broker).await;

        for (content, status_id) in [("", 1), ("hello", 0), ("hello", 3)] {
            let err = service.create_message(content, status_id).await.unwrap_err();
            assert!(matches!(err, Error::Validation { .. }), "{content:?}/{status_id}");
        }

        assert!(service.store().list_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn stalled_broker_does_not_block_create() {
        let broker = InMemoryBroker::new(1);
        broker.pause_sends(true);
        let service = Service::builder()
            .config(Config {
                publish_queue_capacity: Some(1),
                shutdown_timeout_secs: Some(1),
                ..Default::default()
            })
            .store(memory_store().await)
            .producer(Arc::new(broker.clone()) as Arc<dyn Producer>)
            .build();

        for n in 0..3 {
            tokio::time::timeout(
                Duration::from_secs(1),
                service.create_message(&format!("m{n}"), 1),
            )
            .await
            .expect("create_message waited on the publisher")
            .unwrap();
        }
        assert_eq!(service.store().list_all().await.unwrap().len(), 3);

        broker.pause_sends(false);
        service.close().await;
        assert_eq!(broker.records("messages").await.len(), 3);
    }

    #[tokio::test]
    async fn publish_failure_does_not_fail_create() {
        let broker = InMemoryBroker::new(1);
        broker.fail_next_sends(1);
        let service = service(&broker).await;

        let id = service.create_message("lost", 1).await.unwrap();
        service.close().await;

        assert_eq!(service.publisher().stats().failed, 1);
        assert!(service.store().get_by_id(id).await.is_ok());
    }
}
