//! In-process broker used by tests and the `memory` broker mode.
//!
//! Topics are split into a fixed number of partitions, each an append-only log.
//! Every consumer group keeps its own committed offsets; a new claim resumes from
//! them, so records that were handed out but never acknowledged are delivered again
//! after a rebalance.
//!
//! Test hooks: [`InMemoryBroker::pause_sends`] stalls producers,
//! [`InMemoryBroker::fail_next_sends`] makes sends fail, [`InMemoryBroker::rebalance`]
//! revokes all outstanding claims and [`InMemoryBroker::inject_consumer_error`] makes
//! the next read fail.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU8, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use bytes::Bytes;
use chrono::Utc;
use tokio::sync::{watch, Mutex, Notify};

use crate::{error::Error, message::DeliveryCoordinates};

use super::{BrokerFuture, ConsumerGroup, PartitionClaim, Producer, Record};

const NO_ERROR: u8 = 0;
const TRANSIENT_ERROR: u8 = 1;
const FATAL_ERROR: u8 = 2;

#[derive(Default)]
struct State {
    logs: HashMap<(String, i32), Vec<Record>>,
    /// `(group, topic, partition)` to the next offset to read
    committed: HashMap<(String, String, i32), i64>,
}

struct Inner {
    partitions: i32,
    state: Mutex<State>,
    appended: Notify,
    generation: watch::Sender<u64>,
    paused: watch::Sender<bool>,
    failing_sends: AtomicUsize,
    consumer_error: AtomicU8,
    next_partition: AtomicUsize,
}

#[derive(Clone)]
pub struct InMemoryBroker {
    inner: Arc<Inner>,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new(1)
    }
}

impl InMemoryBroker {
    pub fn new(partitions: i32) -> Self {
        Self {
            inner: Arc::new(Inner {
                partitions: partitions.max(1),
                state: Mutex::new(State::default()),
                appended: Notify::new(),
                generation: watch::Sender::new(0),
                paused: watch::Sender::new(false),
                failing_sends: AtomicUsize::new(0),
                consumer_error: AtomicU8::new(NO_ERROR),
                next_partition: AtomicUsize::new(0),
            }),
        }
    }

    pub fn consumer_group(&self, group: impl Into<String>, topic: impl Into<String>) -> InMemoryGroup {
        InMemoryGroup {
            broker: self.clone(),
            group: group.into(),
            topic: topic.into(),
        }
    }

    /// Appends a record to a specific partition, bypassing the producer hooks.
    pub async fn append(&self, topic: &str, partition: i32, payload: Bytes) -> DeliveryCoordinates {
        let coordinates = {
            let mut state = self.inner.state.lock().await;
            let log = state.logs.entry((topic.to_owned(), partition)).or_default();
            let offset = log.len() as i64;

            log.push(Record {
                topic: topic.to_owned(),
                partition,
                offset,
                payload,
                timestamp: Some(Utc::now().timestamp_millis()),
            });

            DeliveryCoordinates {
                topic: topic.to_owned(),
                partition,
                offset,
            }
        };

        self.inner.appended.notify_waiters();

        coordinates
    }

    /// All records currently stored for `topic`, partition by partition.
    pub async fn records(&self, topic: &str) -> Vec<Record> {
        let state = self.inner.state.lock().await;
        (0..self.inner.partitions)
            .filter_map(|partition| state.logs.get(&(topic.to_owned(), partition)))
            .flat_map(|log| log.iter().cloned())
            .collect()
    }

    pub async fn committed_offset(&self, group: &str, topic: &str, partition: i32) -> Option<i64> {
        let state = self.inner.state.lock().await;
        state
            .committed
            .get(&(group.to_owned(), topic.to_owned(), partition))
            .copied()
    }

    /// Stalls (or releases) every pending and future send.
    pub fn pause_sends(&self, paused: bool) {
        self.inner.paused.send_replace(paused);
    }

    pub fn fail_next_sends(&self, count: usize) {
        self.inner.failing_sends.store(count, Ordering::SeqCst);
    }

    /// Revokes all outstanding claims.
    pub fn rebalance(&self) {
        self.inner.generation.send_modify(|generation| *generation += 1);
    }

    /// Makes the next `next_record` call on any claim fail.
    pub fn inject_consumer_error(&self, fatal: bool) {
        let kind = if fatal { FATAL_ERROR } else { TRANSIENT_ERROR };
        self.inner.consumer_error.store(kind, Ordering::SeqCst);
        // Wake idle claims so they observe the error.
        self.inner.appended.notify_waiters();
    }
}

impl Producer for InMemoryBroker {
    fn send<'a>(&'a self, topic: &'a str, payload: Bytes) -> BrokerFuture<'a, DeliveryCoordinates> {
        Box::pin(async move {
            let mut paused = self.inner.paused.subscribe();
            paused
                .wait_for(|paused| !*paused)
                .await
                .map_err(|_| Error::fatal_broker("in-memory broker dropped"))?;

            let failed = self
                .inner
                .failing_sends
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if failed {
                return Err(Error::broker(format!("send to {topic} rejected")));
            }

            let partition = self.inner.next_partition.fetch_add(1, Ordering::SeqCst)
                % self.inner.partitions as usize;

            Ok(self.append(topic, partition as i32, payload).await)
        })
    }

    fn flush(&self, _timeout: Duration) -> BrokerFuture<'_, ()> {
        Box::pin(async { Ok(()) })
    }
}

pub struct InMemoryGroup {
    broker: InMemoryBroker,
    group: String,
    topic: String,
}

impl ConsumerGroup for InMemoryGroup {
    fn claim(&self) -> BrokerFuture<'_, Box<dyn PartitionClaim + '_>> {
        Box::pin(async move {
            let inner = &self.broker.inner;
            let generation_rx = inner.generation.subscribe();
            let generation = *generation_rx.borrow();

            let positions = {
                let state = inner.state.lock().await;
                (0..inner.partitions)
                    .map(|partition| {
                        let key = (self.group.clone(), self.topic.clone(), partition);
                        (partition, state.committed.get(&key).copied().unwrap_or(0))
                    })
                    .collect()
            };

            tracing::debug!(group = %self.group, topic = %self.topic, generation, "claimed partitions");

            Ok(Box::new(InMemoryClaim {
                group: self,
                generation,
                generation_rx,
                positions,
                cursor: 0,
            }) as Box<dyn PartitionClaim + '_>)
        })
    }

    fn leave(&self) -> BrokerFuture<'_, ()> {
        Box::pin(async move {
            tracing::debug!(group = %self.group, topic = %self.topic, "left consumer group");
            Ok(())
        })
    }
}

struct InMemoryClaim<'g> {
    group: &'g InMemoryGroup,
    generation: u64,
    generation_rx: watch::Receiver<u64>,
    /// Next offset to hand out, per partition
    positions: HashMap<i32, i64>,
    cursor: i32,
}

impl InMemoryClaim<'_> {
    fn revoked(&self) -> bool {
        *self.generation_rx.borrow() != self.generation
    }

    async fn take_ready(&mut self) -> Option<Record> {
        let inner = &self.group.broker.inner;
        let state = inner.state.lock().await;

        for step in 0..inner.partitions {
            let partition = (self.cursor + step) % inner.partitions;
            let position = self.positions.get(&partition).copied().unwrap_or(0);

            let record = state
                .logs
                .get(&(self.group.topic.clone(), partition))
                .and_then(|log| log.get(position as usize));

            if let Some(record) = record {
                self.positions.insert(partition, position + 1);
                self.cursor = (partition + 1) % inner.partitions;
                return Some(record.clone());
            }
        }

        None
    }
}

impl PartitionClaim for InMemoryClaim<'_> {
    fn partitions(&self) -> Vec<(String, i32)> {
        (0..self.group.broker.inner.partitions)
            .map(|partition| (self.group.topic.clone(), partition))
            .collect()
    }

    fn next_record(&mut self) -> BrokerFuture<'_, Option<Record>> {
        Box::pin(async move {
            let inner = Arc::clone(&self.group.broker.inner);

            loop {
                match inner.consumer_error.swap(NO_ERROR, Ordering::SeqCst) {
                    FATAL_ERROR => return Err(Error::fatal_broker("consumer group failed")),
                    TRANSIENT_ERROR => return Err(Error::broker("consumer read failed")),
                    _ => {}
                }

                if self.revoked() {
                    return Ok(None);
                }

                let appended = inner.appended.notified();
                tokio::pin!(appended);
                appended.as_mut().enable();

                if let Some(record) = self.take_ready().await {
                    return Ok(Some(record));
                }

                tokio::select! {
                    _ = &mut appended => {}
                    changed = self.generation_rx.changed() => {
                        if changed.is_err() {
                            return Err(Error::fatal_broker("in-memory broker dropped"));
                        }
                    }
                }
            }
        })
    }

    fn ack<'a>(&'a mut self, record: &'a Record) -> BrokerFuture<'a, ()> {
        Box::pin(async move {
            let mut state = self.group.broker.inner.state.lock().await;
            let key = (self.group.group.clone(), record.topic.clone(), record.partition);
            let committed = state.committed.entry(key).or_insert(0);
            *committed = (*committed).max(record.offset + 1);
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn records_keep_partition_order() {
        let broker = InMemoryBroker::new(2);
        for n in 0..4 {
            broker
                .send("t", Bytes::from(format!("m{n}")))
                .await
                .unwrap();
        }

        let group = broker.consumer_group("g", "t");
        let mut claim = group.claim().await.unwrap();
        let mut seen: HashMap<i32, Vec<i64>> = HashMap::new();
        for _ in 0..4 {
            let record = claim.next_record().await.unwrap().unwrap();
            seen.entry(record.partition).or_default().push(record.offset);
        }

        assert_eq!(seen[&0], vec![0, 1]);
        assert_eq!(seen[&1], vec![0, 1]);
    }

    #[tokio::test]
    async fn unacked_records_are_redelivered_after_rebalance() {
        let broker = InMemoryBroker::new(1);
        broker.append("t", 0, Bytes::from_static(b"a")).await;
        broker.append("t", 0, Bytes::from_static(b"b")).await;

        let group = broker.consumer_group("g", "t");
        {
            let mut claim = group.claim().await.unwrap();
            let first = claim.next_record().await.unwrap().unwrap();
            claim.ack(&first).await.unwrap();
            let second = claim.next_record().await.unwrap().unwrap();
            assert_eq!(second.offset, 1);

            broker.rebalance();
            assert_eq!(claim.next_record().await.unwrap(), None);
        }

        let mut claim = group.claim().await.unwrap();
        let again = claim.next_record().await.unwrap().unwrap();
        assert_eq!(again.offset, 1);
        assert_eq!(broker.committed_offset("g", "t", 0).await, Some(1));
    }

    #[tokio::test]
    async fn claim_wakes_up_for_new_records() {
        let broker = InMemoryBroker::new(1);
        let group = broker.consumer_group("g", "t");

        let producer = broker.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            producer.send("t", Bytes::from_static(b"late")).await.unwrap();
        });

        let mut claim = group.claim().await.unwrap();
        let record = tokio::time::timeout(Duration::from_secs(2), claim.next_record())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(&record.payload[..], b"late");
    }

    #[tokio::test]
    async fn failed_sends_are_reported() {
        let broker = InMemoryBroker::new(1);
        broker.fail_next_sends(1);

        assert!(broker.send("t", Bytes::from_static(b"x")).await.is_err());
        assert!(broker.send("t", Bytes::from_static(b"x")).await.is_ok());
        assert_eq!(broker.records("t").await.len(), 1);
    }
}
