//! Message types and status management for the ingestion pipeline.
//!
//! Messages are stored on ingestion and then follow a fixed lifecycle driven by
//! the consumer side of the pipeline.
//!
//! # Message Lifecycle
//!
//! 1. Messages are created in `Received` status
//! 2. When a consumed record is matched to the message, it moves to `Processing`
//! 3. Once the delivery coordinates are recorded, it moves to `Processed`
//!
//! Status never moves backward; a redelivered record for an already processed
//! message leaves both status and coordinates untouched.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::prelude::FromRow;
use strum::{Display, EnumIter, EnumString, IntoEnumIterator};

/// Current status of a stored message.
///
/// Discriminants match the rows of the `message_statuses` reference table, and the
/// derived ordering follows the lifecycle: `Received < Processing < Processed`.
#[derive(
    Serialize,
    Deserialize,
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    sqlx::Type,
    Display,
    EnumString,
    EnumIter,
)]
#[repr(i64)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum MessageStatus {
    /// Stored by the ingestion handler, not yet seen on the consumer side
    Received = 1,
    /// Matched to a consumed record, delivery not yet recorded
    Processing = 2,
    /// Delivery coordinates recorded
    Processed = 3,
}

impl MessageStatus {
    pub fn id(self) -> i64 {
        self as i64
    }

    pub fn from_id(id: i64) -> Option<Self> {
        Self::iter().find(|status| status.id() == id)
    }

    /// Whether moving from `self` to `next` respects the lifecycle order.
    pub fn can_advance_to(self, next: Self) -> bool {
        next > self
    }
}

/// Position of a record in the broker log.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeliveryCoordinates {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
}

impl std::fmt::Display for DeliveryCoordinates {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}@{}", self.topic, self.partition, self.offset)
    }
}

/// A stored message.
///
/// Only `status` and the `kafka_*` coordinate fields change after insert.
#[derive(Serialize, Deserialize, FromRow, Debug, Clone, PartialEq)]
pub struct Message {
    pub id: i64,
    pub content: String,
    pub created_at: DateTime<Utc>,
    #[sqlx(rename = "status_id")]
    pub status: MessageStatus,
    pub kafka_topic: Option<String>,
    pub kafka_partition: Option<i32>,
    pub kafka_offset: Option<i64>,
}

impl Message {
    /// Delivery coordinates, if all three have been recorded.
    pub fn delivery(&self) -> Option<DeliveryCoordinates> {
        match (&self.kafka_topic, self.kafka_partition, self.kafka_offset) {
            (Some(topic), Some(partition), Some(offset)) => Some(DeliveryCoordinates {
                topic: topic.clone(),
                partition,
                offset,
            }),
            _ => None,
        }
    }
}

/// Correlation row written once per successfully resolved record.
#[derive(Serialize, Deserialize, FromRow, Debug, Clone, PartialEq)]
pub struct ProcessedMessage {
    pub id: i64,
    pub message_id: i64,
    pub processed_at: DateTime<Utc>,
    pub kafka_topic: String,
    pub kafka_partition: i32,
    pub kafka_offset: i64,
}

/// Message counts keyed by status name.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(transparent)]
pub struct MessageStatistics(pub BTreeMap<String, i64>);

impl MessageStatistics {
    pub fn count(&self, status: MessageStatus) -> i64 {
        self.0.get(&status.to_string()).copied().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::*;

    #[test]
    fn status_order_follows_lifecycle() {
        assert!(MessageStatus::Received < MessageStatus::Processing);
        assert!(MessageStatus::Processing < MessageStatus::Processed);
        assert!(MessageStatus::Received.can_advance_to(MessageStatus::Processed));
        assert!(!MessageStatus::Processed.can_advance_to(MessageStatus::Processing));
        assert!(!MessageStatus::Processing.can_advance_to(MessageStatus::Processing));
    }

    #[test]
    fn status_ids_match_reference_table() {
        assert_eq!(MessageStatus::from_id(1), Some(MessageStatus::Received));
        assert_eq!(MessageStatus::from_id(3), Some(MessageStatus::Processed));
        assert_eq!(MessageStatus::from_id(4), None);
        assert_eq!(MessageStatus::Processing.to_string(), "processing");
        assert_eq!(
            MessageStatus::from_str("processed").unwrap(),
            MessageStatus::Processed
        );
    }
}
