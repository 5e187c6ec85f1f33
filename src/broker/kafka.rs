//! Kafka implementation of the broker seam, on top of `rdkafka`.
//!
//! The consumer is configured for manual offset management: nothing is committed
//! until [`PartitionClaim::ack`] is called for a record, so a crash before the ack
//! results in redelivery.

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
    time::Duration,
};

use bytes::Bytes;
use rdkafka::{
    config::ClientConfig,
    consumer::{CommitMode, Consumer, StreamConsumer},
    error::KafkaError,
    producer::{FutureProducer, FutureRecord, Producer as _},
    util::Timeout,
    Message as _, Offset, TopicPartitionList,
};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::{config::Config, error::Error, message::DeliveryCoordinates};

use super::{BrokerFuture, ConsumerGroup, PartitionClaim, Producer, Record};

const SEND_TIMEOUT: Duration = Duration::from_secs(5);
/// How often an idle claim re-checks its assignment for rebalances.
const ASSIGNMENT_CHECK_INTERVAL: Duration = Duration::from_secs(1);

fn client_config(config: &Config) -> ClientConfig {
    let mut client_config = ClientConfig::new();
    client_config.set("bootstrap.servers", config.kafka_brokers());
    client_config
}

fn broker_error(context: &str, e: KafkaError) -> Error {
    let fatal = e
        .rdkafka_error_code()
        .map(|code| {
            matches!(
                code,
                rdkafka::types::RDKafkaErrorCode::Fatal
                    | rdkafka::types::RDKafkaErrorCode::Authentication
                    | rdkafka::types::RDKafkaErrorCode::UnknownTopicOrPartition
            )
        })
        .unwrap_or(false);

    Error::Broker {
        message: format!("{context}: {e}"),
        fatal,
    }
}

#[derive(Clone)]
pub struct KafkaProducer {
    producer: Arc<FutureProducer>,
}

impl KafkaProducer {
    pub fn new(config: &Config) -> Result<Self, Error> {
        let producer: FutureProducer = client_config(config)
            .set("acks", "all")
            .set("enable.idempotence", "true")
            .set("linger.ms", "10")
            .set("message.timeout.ms", "30000")
            .create()
            .map_err(|e| broker_error("failed to create Kafka producer", e))?;

        info!(brokers = config.kafka_brokers(), "Kafka producer initialized");

        Ok(Self {
            producer: Arc::new(producer),
        })
    }
}

impl Producer for KafkaProducer {
    fn send<'a>(&'a self, topic: &'a str, payload: Bytes) -> BrokerFuture<'a, DeliveryCoordinates> {
        Box::pin(async move {
            let record = FutureRecord::<(), [u8]>::to(topic).payload(payload.as_ref());

            match self.producer.send(record, Timeout::After(SEND_TIMEOUT)).await {
                Ok((partition, offset)) => Ok(DeliveryCoordinates {
                    topic: topic.to_owned(),
                    partition,
                    offset,
                }),
                Err((e, _)) => Err(broker_error("Kafka send failed", e)),
            }
        })
    }

    fn flush(&self, timeout: Duration) -> BrokerFuture<'_, ()> {
        let producer = Arc::clone(&self.producer);
        Box::pin(async move {
            // `flush` blocks the calling thread.
            tokio::task::spawn_blocking(move || producer.flush(Timeout::After(timeout)))
                .await
                .map_err(Error::internal)?
                .map_err(|e| broker_error("Kafka flush failed", e))
        })
    }
}

pub struct KafkaConsumerGroup {
    consumer: StreamConsumer,
    topic: String,
    group_id: String,
    /// Record polled by a claim that was already stale; handed to the next claim.
    stash: Mutex<Option<Record>>,
    /// Next offset to read per partition, as of the last ack.
    acked: Mutex<BTreeMap<(String, i32), i64>>,
}

impl KafkaConsumerGroup {
    /// Creates the consumer and subscribes it to the configured topic.
    ///
    /// - `enable.auto.commit=false`: offsets are committed by [`PartitionClaim::ack`]
    /// - `auto.offset.reset=earliest`: a new group starts at the oldest record
    pub fn new(config: &Config) -> Result<Self, Error> {
        let consumer: StreamConsumer = client_config(config)
            .set("group.id", config.group_id())
            .set("enable.auto.commit", "false")
            .set("enable.auto.offset.store", "false")
            .set("auto.offset.reset", "earliest")
            .set("session.timeout.ms", "30000")
            .set("heartbeat.interval.ms", "3000")
            .create()
            .map_err(|e| broker_error("failed to create Kafka consumer", e))?;

        consumer
            .subscribe(&[config.topic()])
            .map_err(|e| broker_error("failed to subscribe", e))?;

        info!(
            topic = config.topic(),
            group_id = config.group_id(),
            "Kafka consumer subscribed"
        );

        Ok(Self {
            consumer,
            topic: config.topic().to_owned(),
            group_id: config.group_id().to_owned(),
            stash: Mutex::new(None),
            acked: Mutex::new(BTreeMap::new()),
        })
    }

    fn assignment(&self) -> Result<BTreeSet<(String, i32)>, Error> {
        let assignment = self
            .consumer
            .assignment()
            .map_err(|e| broker_error("failed to read assignment", e))?;

        Ok(assignment
            .elements()
            .iter()
            .map(|element| (element.topic().to_owned(), element.partition()))
            .collect())
    }
}

impl ConsumerGroup for KafkaConsumerGroup {
    fn claim(&self) -> BrokerFuture<'_, Box<dyn PartitionClaim + '_>> {
        Box::pin(async move {
            // The assignment is only populated by polling; the first record received
            // while unassigned is kept and handed out first.
            let mut pending = self.stash.lock().await.take();
            let mut assignment = self.assignment()?;

            while assignment.is_empty() && pending.is_none() {
                match tokio::time::timeout(ASSIGNMENT_CHECK_INTERVAL, self.consumer.recv()).await {
                    Ok(Ok(message)) => {
                        pending = Some(to_record(&message));
                        assignment = self.assignment()?;
                        break;
                    }
                    Ok(Err(e)) => return Err(broker_error("Kafka consumer error", e)),
                    Err(_) => assignment = self.assignment()?,
                }
            }

            info!(
                topic = %self.topic,
                group_id = %self.group_id,
                partitions = ?assignment,
                "partition claim granted"
            );

            Ok(Box::new(KafkaClaim {
                group: self,
                assignment,
                pending,
            }) as Box<dyn PartitionClaim + '_>)
        })
    }

    fn leave(&self) -> BrokerFuture<'_, ()> {
        Box::pin(async move {
            // Async acks may still be in flight; settle them before the partitions go.
            let assignment = self.assignment()?;
            let acked = std::mem::take(&mut *self.acked.lock().await);
            let offsets = commit_list(
                acked
                    .into_iter()
                    .filter(|(partition, _)| assignment.contains(partition)),
            )?;

            if offsets.count() > 0 {
                if let Err(e) = self.consumer.commit(&offsets, CommitMode::Sync) {
                    warn!(error = %e, group_id = %self.group_id, "final offset commit failed");
                }
            }

            self.consumer.unsubscribe();
            info!(group_id = %self.group_id, "left consumer group");
            Ok(())
        })
    }
}

/// Builds a commit list from next-to-read offsets.
fn commit_list(
    offsets: impl IntoIterator<Item = ((String, i32), i64)>,
) -> Result<TopicPartitionList, Error> {
    let mut list = TopicPartitionList::new();
    for ((topic, partition), next) in offsets {
        list.add_partition_offset(&topic, partition, Offset::Offset(next))
            .map_err(|e| broker_error("invalid offset", e))?;
    }
    Ok(list)
}

fn to_record(message: &rdkafka::message::BorrowedMessage<'_>) -> Record {
    Record {
        topic: message.topic().to_owned(),
        partition: message.partition(),
        offset: message.offset(),
        payload: Bytes::copy_from_slice(message.payload().unwrap_or_default()),
        timestamp: message.timestamp().to_millis(),
    }
}

struct KafkaClaim<'g> {
    group: &'g KafkaConsumerGroup,
    assignment: BTreeSet<(String, i32)>,
    pending: Option<Record>,
}

impl KafkaClaim<'_> {
    fn still_assigned(&self) -> Result<bool, Error> {
        let current = self.group.assignment()?;
        if current != self.assignment {
            debug!(previous = ?self.assignment, current = ?current, "assignment changed");
            return Ok(false);
        }
        Ok(true)
    }
}

impl PartitionClaim for KafkaClaim<'_> {
    fn partitions(&self) -> Vec<(String, i32)> {
        self.assignment.iter().cloned().collect()
    }

    fn next_record(&mut self) -> BrokerFuture<'_, Option<Record>> {
        Box::pin(async move {
            if let Some(record) = self.pending.take() {
                return Ok(Some(record));
            }

            loop {
                if !self.still_assigned()? {
                    return Ok(None);
                }

                // Convert right away; a borrowed message must not be held across an await.
                let polled =
                    match tokio::time::timeout(ASSIGNMENT_CHECK_INTERVAL, self.group.consumer.recv())
                        .await
                    {
                        Ok(Ok(message)) => Ok(to_record(&message)),
                        Ok(Err(e)) => Err(e),
                        Err(_) => continue,
                    };

                let record = match polled {
                    Ok(record) => record,
                    Err(e) => {
                        error!(error = %e, "Kafka consumer error");
                        return Err(broker_error("Kafka consumer error", e));
                    }
                };

                if !self
                    .assignment
                    .contains(&(record.topic.clone(), record.partition))
                {
                    // Received after a rebalance we have not observed yet.
                    *self.group.stash.lock().await = Some(record);
                    return Ok(None);
                }

                return Ok(Some(record));
            }
        })
    }

    fn ack<'a>(&'a mut self, record: &'a Record) -> BrokerFuture<'a, ()> {
        Box::pin(async move {
            let key = (record.topic.clone(), record.partition);
            let next = record.offset + 1;
            self.group.acked.lock().await.insert(key.clone(), next);
            let offsets = commit_list([(key, next)])?;

            if let Err(e) = self.group.consumer.commit(&offsets, CommitMode::Async) {
                warn!(
                    error = %e,
                    topic = %record.topic,
                    partition = record.partition,
                    offset = record.offset,
                    "failed to commit offset"
                );
                return Err(broker_error("offset commit failed", e));
            }

            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commit_list_carries_next_offsets() {
        let list = commit_list([
            (("messages".to_owned(), 0), 3),
            (("messages".to_owned(), 1), 11),
        ])
        .unwrap();

        assert_eq!(list.count(), 2);
        assert_eq!(
            list.find_partition("messages", 1).unwrap().offset(),
            Offset::Offset(11)
        );
    }

    #[test]
    fn empty_commit_list_is_empty() {
        let list = commit_list(std::iter::empty()).unwrap();
        assert_eq!(list.count(), 0);
    }
}
