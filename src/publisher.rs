//! Outbound publish path.
//!
//! [`Publisher::publish`] hands a payload to a bounded queue and returns as soon as
//! it was accepted. A single background task drains the queue in order and performs
//! the broker sends. When the broker stalls the queue fills up and `publish` waits
//! for space instead of dropping.
//!
//! Every accepted payload gets a [`PublishReceipt`]. Callers that care can await it
//! for the delivery coordinates; fire-and-forget callers drop it, and failures are
//! then only visible in the logs and in [`PublisherStats`].

use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use bytes::Bytes;
use serde::Serialize;
use tokio::{
    sync::{mpsc, oneshot, Mutex},
    task::JoinHandle,
    time::Instant,
};
use tracing::{debug, error, info, warn};

use crate::{broker::Producer, config::Config, error::Error, message::DeliveryCoordinates};

const MAX_BACKOFF: Duration = Duration::from_secs(5);

/// Bounded exponential backoff for broker sends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total send attempts per payload, including the first one
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            initial_backoff: Duration::from_millis(100),
            max_backoff: MAX_BACKOFF,
        }
    }
}

impl RetryPolicy {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_attempts: config.publish_max_attempts(),
            initial_backoff: config.publish_backoff(),
            max_backoff: MAX_BACKOFF,
        }
    }

    /// Delay before attempt `attempt + 1`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

#[derive(Debug, Default)]
pub struct PublisherStats {
    accepted: AtomicU64,
    delivered: AtomicU64,
    failed: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PublisherStatsSnapshot {
    pub accepted: u64,
    pub delivered: u64,
    pub failed: u64,
}

impl PublisherStats {
    pub fn snapshot(&self) -> PublisherStatsSnapshot {
        PublisherStatsSnapshot {
            accepted: self.accepted.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

/// Resolves once the broker acknowledged (or finally rejected) the payload.
#[derive(Debug)]
pub struct PublishReceipt {
    rx: oneshot::Receiver<Result<DeliveryCoordinates, Error>>,
}

impl PublishReceipt {
    pub async fn delivered(self) -> Result<DeliveryCoordinates, Error> {
        self.rx.await.map_err(|_| Error::PublisherClosed)?
    }
}

struct Job {
    topic: String,
    payload: Bytes,
    reply: oneshot::Sender<Result<DeliveryCoordinates, Error>>,
}

pub struct Publisher {
    producer: Arc<dyn Producer>,
    tx: Mutex<Option<mpsc::Sender<Job>>>,
    drain: Mutex<Option<JoinHandle<()>>>,
    stats: Arc<PublisherStats>,
}

impl Publisher {
    /// Starts the drain task. Must be called from within a Tokio runtime.
    pub fn new(producer: Arc<dyn Producer>, capacity: usize, policy: RetryPolicy) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let stats = Arc::new(PublisherStats::default());

        let drain = tokio::spawn(drain(
            Arc::clone(&producer),
            rx,
            policy,
            Arc::clone(&stats),
        ));

        Self {
            producer,
            tx: Mutex::new(Some(tx)),
            drain: Mutex::new(Some(drain)),
            stats,
        }
    }

    pub fn from_config(producer: Arc<dyn Producer>, config: &Config) -> Self {
        Self::new(
            producer,
            config.publish_queue_capacity(),
            RetryPolicy::from_config(config),
        )
    }

    /// Queues `payload` for `topic`, waiting for space while the queue is full.
    pub async fn publish(
        &self,
        topic: impl Into<String>,
        payload: Bytes,
    ) -> Result<PublishReceipt, Error> {
        let tx = self
            .tx
            .lock()
            .await
            .clone()
            .ok_or(Error::PublisherClosed)?;

        let (reply, rx) = oneshot::channel();
        tx.send(Job {
            topic: topic.into(),
            payload,
            reply,
        })
        .await
        .map_err(|_| Error::PublisherClosed)?;

        self.stats.accepted.fetch_add(1, Ordering::Relaxed);

        Ok(PublishReceipt { rx })
    }

    pub fn stats(&self) -> PublisherStatsSnapshot {
        self.stats.snapshot()
    }

    /// Stops accepting payloads, waits for every accepted payload to be attempted and
    /// flushes the producer.
    ///
    /// Gives up after `timeout`; the remaining queue is then abandoned.
    pub async fn close(&self, timeout: Duration) {
        self.tx.lock().await.take();

        let Some(mut drain) = self.drain.lock().await.take() else {
            return;
        };

        let deadline = Instant::now() + timeout;

        match tokio::time::timeout_at(deadline, &mut drain).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(error = %e, "publisher drain task failed"),
            Err(_) => {
                warn!(?timeout, "publisher drain timed out, abandoning queued messages");
                drain.abort();
            }
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        if let Err(e) = self.producer.flush(remaining).await {
            warn!(error = %e, "failed to flush producer");
        }

        let stats = self.stats();
        info!(
            accepted = stats.accepted,
            delivered = stats.delivered,
            failed = stats.failed,
            "publisher closed"
        );
    }
}

async fn drain(
    producer: Arc<dyn Producer>,
    mut rx: mpsc::Receiver<Job>,
    policy: RetryPolicy,
    stats: Arc<PublisherStats>,
) {
    while let Some(job) = rx.recv().await {
        let result = send_with_retry(producer.as_ref(), &job.topic, job.payload, &policy).await;

        match &result {
            Ok(coordinates) => {
                stats.delivered.fetch_add(1, Ordering::Relaxed);
                debug!(%coordinates, "message published");
            }
            Err(e) => {
                stats.failed.fetch_add(1, Ordering::Relaxed);
                error!(topic = %job.topic, error = %e, "failed to publish message");
            }
        }

        // The caller may have dropped its receipt.
        let _ = job.reply.send(result);
    }

    debug!("publisher queue drained");
}

async fn send_with_retry(
    producer: &dyn Producer,
    topic: &str,
    payload: Bytes,
    policy: &RetryPolicy,
) -> Result<DeliveryCoordinates, Error> {
    let mut attempt = 1;

    loop {
        match producer.send(topic, payload.clone()).await {
            Ok(coordinates) => return Ok(coordinates),
            Err(e) if !e.is_fatal() && attempt < policy.max_attempts => {
                let delay = policy.backoff(attempt);
                warn!(topic, attempt, ?delay, error = %e, "publish failed, retrying");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => {
                return Err(Error::PublishFailure {
                    topic: topic.to_owned(),
                    message: e.to_string(),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::broker::memory::InMemoryBroker;

    use super::*;

    fn publisher(broker: &InMemoryBroker, capacity: usize, policy: RetryPolicy) -> Publisher {
        Publisher::new(Arc::new(broker.clone()), capacity, policy)
    }

    #[tokio::test]
    async fn receipt_resolves_to_delivery_coordinates() {
        let broker = InMemoryBroker::new(1);
        let publisher = publisher(&broker, 4, RetryPolicy::default());

        let receipt = publisher
            .publish("messages", Bytes::from_static(b"hello"))
            .await
            .unwrap();
        let coordinates = receipt.delivered().await.unwrap();

        assert_eq!(coordinates.topic, "messages");
        assert_eq!(coordinates.offset, 0);
        assert_eq!(publisher.stats().delivered, 1);
    }

    #[tokio::test]
    async fn full_queue_blocks_the_caller() {
        let broker = InMemoryBroker::new(1);
        broker.pause_sends(true);
        let publisher = publisher(&broker, 2, RetryPolicy::default());

        // One payload is held by the stalled drain task, two fill the queue.
        for n in 0..3 {
            tokio::time::timeout(
                Duration::from_secs(1),
                publisher.publish("messages", Bytes::from(format!("m{n}"))),
            )
            .await
            .expect("queue should have room")
            .unwrap();
        }

        let blocked = tokio::time::timeout(
            Duration::from_millis(100),
            publisher.publish("messages", Bytes::from_static(b"overflow")),
        )
        .await;
        assert!(blocked.is_err(), "publish must wait while the queue is full");
        assert_eq!(publisher.stats().accepted, 3);

        broker.pause_sends(false);
        publisher
            .publish("messages", Bytes::from_static(b"m3"))
            .await
            .unwrap();
        publisher.close(Duration::from_secs(5)).await;

        assert_eq!(broker.records("messages").await.len(), 4);
        assert_eq!(publisher.stats().delivered, 4);
    }

    #[tokio::test]
    async fn failures_are_counted_and_not_retried_by_default() {
        let broker = InMemoryBroker::new(1);
        broker.fail_next_sends(1);
        let publisher = publisher(&broker, 4, RetryPolicy::default());

        let receipt = publisher
            .publish("messages", Bytes::from_static(b"lost"))
            .await
            .unwrap();
        let err = receipt.delivered().await.unwrap_err();

        assert!(matches!(err, Error::PublishFailure { .. }));
        assert_eq!(publisher.stats().failed, 1);
        assert!(broker.records("messages").await.is_empty());
    }

    #[tokio::test]
    async fn retry_policy_recovers_transient_failures() {
        let broker = InMemoryBroker::new(1);
        broker.fail_next_sends(2);
        let policy = RetryPolicy {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(5),
        };
        let publisher = publisher(&broker, 4, policy);

        let receipt = publisher
            .publish("messages", Bytes::from_static(b"eventually"))
            .await
            .unwrap();

        assert!(receipt.delivered().await.is_ok());
        assert_eq!(publisher.stats().failed, 0);
    }

    #[test]
    fn backoff_doubles_up_to_the_cap() {
        let policy = RetryPolicy {
            max_attempts: 10,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(350),
        };

        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(200));
        assert_eq!(policy.backoff(3), Duration::from_millis(350));
    }

    #[tokio::test]
    async fn close_attempts_every_accepted_payload() {
        let broker = InMemoryBroker::new(2);
        let publisher = publisher(&broker, 8, RetryPolicy::default());

        for n in 0..5 {
            publisher
                .publish("messages", Bytes::from(format!("m{n}")))
                .await
                .unwrap();
        }
        publisher.close(Duration::from_secs(5)).await;

        assert_eq!(broker.records("messages").await.len(), 5);
        assert!(matches!(
            publisher
                .publish("messages", Bytes::from_static(b"late"))
                .await
                .unwrap_err(),
            Error::PublisherClosed
        ));
    }
}
