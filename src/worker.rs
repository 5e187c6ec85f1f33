//! Consumer group worker.
//!
//! Runs the claim loop for one topic:
//!
//! ```text
//! Idle -> Claiming -> Consuming -> Idle (rebalance) -> Claiming -> ...
//!   any state -> Terminated (shutdown or fatal broker error)
//! ```
//!
//! Records are handed to the [`Pipeline`] one at a time. A record that fails is
//! logged and acknowledged anyway, so a single bad record cannot stall a partition.
//! On shutdown the record currently being handled is finished and acknowledged
//! before the loop returns.

use std::{sync::Arc, time::Duration};

use serde::Serialize;
use strum::Display;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    broker::{ConsumerGroup, PartitionClaim, Record},
    error::Error,
    pipeline::{Outcome, Pipeline},
};

/// Delay before claiming again after a transient broker error.
const RECLAIM_BACKOFF: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum WorkerState {
    Idle,
    Claiming,
    Consuming,
    Terminated,
}

enum ClaimEnd {
    Revoked,
    Shutdown,
}

pub struct ConsumerWorker {
    group: Arc<dyn ConsumerGroup>,
    pipeline: Pipeline,
    state: watch::Sender<WorkerState>,
}

impl ConsumerWorker {
    pub fn new(group: Arc<dyn ConsumerGroup>, pipeline: Pipeline) -> Self {
        Self {
            group,
            pipeline,
            state: watch::Sender::new(WorkerState::Idle),
        }
    }

    pub fn state(&self) -> watch::Receiver<WorkerState> {
        self.state.subscribe()
    }

    /// Consumes until `shutdown` is cancelled or the broker fails fatally, then leaves
    /// the group. Only the fatal error is returned.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<(), Error> {
        let result = self.consume(&shutdown).await;

        if let Err(e) = self.group.leave().await {
            warn!(error = %e, "failed to leave consumer group");
        }
        self.set_state(WorkerState::Terminated);

        match &result {
            Ok(()) => info!("consumer worker stopped"),
            Err(e) => error!(error = %e, "consumer worker terminated"),
        }

        result
    }

    fn set_state(&self, state: WorkerState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!(from = %previous, to = %state, "consumer worker state changed");
        }
    }

    async fn consume(&self, shutdown: &CancellationToken) -> Result<(), Error> {
        loop {
            if shutdown.is_cancelled() {
                return Ok(());
            }

            self.set_state(WorkerState::Claiming);

            let claim = tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                claim = self.group.claim() => claim,
            };

            let end = match claim {
                Ok(mut claim) => {
                    info!(partitions = ?claim.partitions(), "consuming claimed partitions");
                    self.set_state(WorkerState::Consuming);
                    self.consume_claim(claim.as_mut(), shutdown).await
                }
                Err(e) => Err(e),
            };

            match end {
                Ok(ClaimEnd::Shutdown) => return Ok(()),
                Ok(ClaimEnd::Revoked) => {
                    info!("partition claim revoked, claiming again");
                    self.set_state(WorkerState::Idle);
                }
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    warn!(error = %e, "consumer error, claiming again");
                    self.set_state(WorkerState::Idle);

                    tokio::select! {
                        _ = shutdown.cancelled() => return Ok(()),
                        _ = tokio::time::sleep(RECLAIM_BACKOFF) => {}
                    }
                }
            }
        }
    }

    async fn consume_claim(
        &self,
        claim: &mut (dyn PartitionClaim + '_),
        shutdown: &CancellationToken,
    ) -> Result<ClaimEnd, Error> {
        loop {
            let next = tokio::select! {
                biased;
                _ = shutdown.cancelled() => return Ok(ClaimEnd::Shutdown),
                next = claim.next_record() => next?,
            };

            let Some(record) = next else {
                return Ok(ClaimEnd::Revoked);
            };

            self.handle(&record).await;
            claim.ack(&record).await?;
        }
    }

    async fn handle(&self, record: &Record) {
        let delivery = record.coordinates();

        match self.pipeline.handle(record).await {
            Ok(Outcome::Processed { message_id, .. }) => {
                info!(message_id, %delivery, "message processed");
            }
            Ok(Outcome::Duplicate { message_id }) => {
                debug!(message_id, %delivery, "duplicate delivery acknowledged");
            }
            Err(e @ (Error::Decode { .. } | Error::Resolution { .. })) => {
                warn!(%delivery, error = %e, "skipping record");
            }
            Err(e) => {
                error!(%delivery, error = ?e, "failed to process record");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use crate::{
        broker::{memory::InMemoryBroker, Producer},
        codec::{Compression, PayloadCodec, WireFormat},
        message::MessageStatus,
        store::{tests::memory_store, Store},
    };

    use super::*;

    fn worker(broker: &InMemoryBroker, store: &Store) -> Arc<ConsumerWorker> {
        let pipeline = Pipeline::builder()
            .store(store.clone())
            .codec(PayloadCodec::new(WireFormat::Raw, Compression::None))
            .build();

        Arc::new(ConsumerWorker::new(
            Arc::new(broker.consumer_group("msgflow", "messages")),
            pipeline,
        ))
    }

    async fn wait_for_processed(store: &Store, expected: i64) {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let stats = store.statistics().await.unwrap();
                if stats.count(MessageStatus::Processed) >= expected {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("messages were not processed in time");
    }

    #[tokio::test]
    async fn bad_records_are_skipped_and_acknowledged() {
        let broker = InMemoryBroker::new(1);
        let store = memory_store().await;
        store.create("good", MessageStatus::Received).await.unwrap();

        broker.send("messages", Bytes::from_static(b"unknown")).await.unwrap();
        broker.send("messages", Bytes::from_static(b"good")).await.unwrap();

        let worker = worker(&broker, &store);
        let shutdown = CancellationToken::new();
        let task = tokio::spawn({
            let worker = Arc::clone(&worker);
            let shutdown = shutdown.clone();
            async move { worker.run(shutdown).await }
        });

        wait_for_processed(&store, 1).await;
        shutdown.cancel();
        task.await.unwrap().unwrap();

        assert_eq!(broker.committed_offset("msgflow", "messages", 0).await, Some(2));
        assert_eq!(*worker.state().borrow(), WorkerState::Terminated);
    }

    #[tokio::test]
    async fn rebalance_triggers_a_new_claim() {
        let broker = InMemoryBroker::new(1);
        let store = memory_store().await;
        store.create("before", MessageStatus::Received).await.unwrap();
        store.create("after", MessageStatus::Received).await.unwrap();

        let worker = worker(&broker, &store);
        let shutdown = CancellationToken::new();
        let task = tokio::spawn({
            let worker = Arc::clone(&worker);
            let shutdown = shutdown.clone();
            async move { worker.run(shutdown).await }
        });

        broker.send("messages", Bytes::from_static(b"before")).await.unwrap();
        wait_for_processed(&store, 1).await;

        // The revoked claim ends; only a fresh claim can pick up the next record.
        broker.rebalance();
        broker.send("messages", Bytes::from_static(b"after")).await.unwrap();
        wait_for_processed(&store, 2).await;

        shutdown.cancel();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn fatal_broker_error_terminates_the_loop() {
        let broker = InMemoryBroker::new(1);
        let store = memory_store().await;
        let worker = worker(&broker, &store);
        let mut state = worker.state();

        let task = tokio::spawn({
            let worker = Arc::clone(&worker);
            async move { worker.run(CancellationToken::new()).await }
        });

        state
            .wait_for(|state| *state == WorkerState::Consuming)
            .await
            .unwrap();
        broker.inject_consumer_error(true);

        let err = tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap()
            .unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(*worker.state().borrow(), WorkerState::Terminated);
    }

    #[tokio::test]
    async fn transient_consumer_error_is_recovered() {
        let broker = InMemoryBroker::new(1);
        let store = memory_store().await;
        store.create("x", MessageStatus::Received).await.unwrap();
        let worker = worker(&broker, &store);
        let mut state = worker.state();
        let shutdown = CancellationToken::new();

        let task = tokio::spawn({
            let worker = Arc::clone(&worker);
            let shutdown = shutdown.clone();
            async move { worker.run(shutdown).await }
        });

        state
            .wait_for(|state| *state == WorkerState::Consuming)
            .await
            .unwrap();
        broker.inject_consumer_error(false);
        broker.send("messages", Bytes::from_static(b"x")).await.unwrap();

        wait_for_processed(&store, 1).await;
        shutdown.cancel();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn shutdown_while_idle_returns_promptly() {
        let broker = InMemoryBroker::new(1);
        let store = memory_store().await;
        let worker = worker(&broker, &store);
        let shutdown = CancellationToken::new();
        shutdown.cancel();

        tokio::time::timeout(Duration::from_secs(1), worker.run(shutdown))
            .await
            .unwrap()
            .unwrap();
    }
}
