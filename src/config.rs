use std::time::Duration;

use serde::Deserialize;
use strum::{Display, EnumString};

use crate::codec::{Compression, WireFormat};

/// Which halves of the pipeline this process runs.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Role {
    /// HTTP ingestion only
    Api,
    /// Consumer group worker only
    Consumer,
    #[default]
    All,
}

impl Role {
    pub fn serves_http(self) -> bool {
        matches!(self, Self::Api | Self::All)
    }

    pub fn consumes(self) -> bool {
        matches!(self, Self::Consumer | Self::All)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum BrokerKind {
    #[default]
    Kafka,
    Memory,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct Config {
    pub db_path: Option<String>,
    pub host: Option<String>,
    pub port: Option<u16>,
    #[serde(default)]
    pub role: Role,
    #[serde(default)]
    pub broker: BrokerKind,
    pub kafka_brokers: Option<String>,
    pub kafka_topic: Option<String>,
    pub kafka_group_id: Option<String>,
    #[serde(default)]
    pub wire_format: WireFormat,
    #[serde(default)]
    pub compression: Compression,
    pub publish_queue_capacity: Option<usize>,
    pub publish_max_attempts: Option<u32>,
    pub publish_backoff_ms: Option<u64>,
    pub status_queue_capacity: Option<usize>,
    pub async_status_updates: Option<bool>,
    pub record_processed: Option<bool>,
    pub shutdown_timeout_secs: Option<u64>,
    pub rate_limit_enabled: Option<bool>,
    pub rate_limit_max_requests: Option<u64>,
    pub rate_limit_window_secs: Option<u64>,
}

impl Config {
    pub fn load() -> eyre::Result<Self> {
        Ok(envy::prefixed("MSGFLOW_").from_env::<Self>()?)
    }

    /// `None` selects an in-memory database.
    pub fn db_path(&self) -> Option<&str> {
        self.db_path
            .as_deref()
            .filter(|path| !path.is_empty() && *path != ":memory:")
    }

    pub fn host(&self) -> &str {
        self.host.as_deref().unwrap_or("127.0.0.1")
    }

    pub fn port(&self) -> u16 {
        self.port.unwrap_or(8080)
    }

    pub fn kafka_brokers(&self) -> &str {
        self.kafka_brokers.as_deref().unwrap_or("localhost:9092")
    }

    pub fn topic(&self) -> &str {
        self.kafka_topic.as_deref().unwrap_or("messages")
    }

    pub fn group_id(&self) -> &str {
        self.kafka_group_id.as_deref().unwrap_or("msgflow")
    }

    pub fn publish_queue_capacity(&self) -> usize {
        self.publish_queue_capacity.unwrap_or(100).max(1)
    }

    pub fn publish_max_attempts(&self) -> u32 {
        self.publish_max_attempts.unwrap_or(1).max(1)
    }

    pub fn publish_backoff(&self) -> Duration {
        Duration::from_millis(self.publish_backoff_ms.unwrap_or(100))
    }

    pub fn status_queue_capacity(&self) -> usize {
        self.status_queue_capacity.unwrap_or(100).max(1)
    }

    pub fn async_status_updates(&self) -> bool {
        self.async_status_updates.unwrap_or(true)
    }

    pub fn record_processed(&self) -> bool {
        self.record_processed.unwrap_or(true)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs.unwrap_or(5))
    }

    pub fn rate_limit_enabled(&self) -> bool {
        self.rate_limit_enabled.unwrap_or(false)
    }

    pub fn rate_limit_max_requests(&self) -> u64 {
        self.rate_limit_max_requests.unwrap_or(100)
    }

    pub fn rate_limit_window(&self) -> Duration {
        Duration::from_secs(self.rate_limit_window_secs.unwrap_or(60))
    }
}
