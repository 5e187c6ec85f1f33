//! Message broker seam.
//!
//! The publisher and the consumer group worker only see these traits, so the same
//! pipeline runs against Kafka in production and against [`memory::InMemoryBroker`]
//! in tests.
//!
//! Consumption is modelled after consumer-group semantics: a worker obtains a
//! [`PartitionClaim`] from its [`ConsumerGroup`], streams records from it one at a time
//! and acknowledges each record explicitly. A claim ends (yields `None`) when the
//! group rebalances, after which the worker asks for a new one.

use std::{future::Future, pin::Pin, time::Duration};

use bytes::Bytes;

use crate::{error::Error, message::DeliveryCoordinates};

#[cfg(feature = "kafka")]
pub mod kafka;
pub mod memory;

pub type BrokerFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, Error>> + Send + 'a>>;

/// A record consumed from the broker.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub payload: Bytes,
    /// Broker timestamp in milliseconds, when available
    pub timestamp: Option<i64>,
}

impl Record {
    pub fn coordinates(&self) -> DeliveryCoordinates {
        DeliveryCoordinates {
            topic: self.topic.clone(),
            partition: self.partition,
            offset: self.offset,
        }
    }
}

/// Sending side of the broker.
pub trait Producer: Send + Sync + 'static {
    /// Sends `payload` to `topic` and resolves once the broker acknowledged it.
    fn send<'a>(&'a self, topic: &'a str, payload: Bytes) -> BrokerFuture<'a, DeliveryCoordinates>;

    /// Waits for buffered sends to complete.
    fn flush(&self, timeout: Duration) -> BrokerFuture<'_, ()>;
}

/// Membership in a consumer group for one topic.
pub trait ConsumerGroup: Send + Sync + 'static {
    /// Joins the group (if needed) and waits for a partition assignment.
    fn claim(&self) -> BrokerFuture<'_, Box<dyn PartitionClaim + '_>>;

    /// Leaves the group and releases broker resources.
    fn leave(&self) -> BrokerFuture<'_, ()>;
}

/// The partitions currently assigned to this member.
pub trait PartitionClaim: Send {
    /// The `(topic, partition)` pairs covered by this claim.
    fn partitions(&self) -> Vec<(String, i32)>;

    /// Next record in partition order, or `None` once the claim has been revoked.
    fn next_record(&mut self) -> BrokerFuture<'_, Option<Record>>;

    /// Marks `record` as handled; its offset is committed for the group.
    fn ack<'a>(&'a mut self, record: &'a Record) -> BrokerFuture<'a, ()>;
}
