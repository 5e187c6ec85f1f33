//! Maps consumed records back to stored messages and moves them through their
//! lifecycle.
//!
//! For each record:
//!
//! 1. Decode the payload with the shared [`PayloadCodec`]
//! 2. Resolve the stored message, by id when the payload carries one and otherwise
//!    by exact content match over all stored messages
//! 3. Make `processing` visible
//! 4. Record the delivery coordinates, mark the message `processed` and write the
//!    correlation row, all in one transaction
//!
//! Any error is returned to the caller, which logs it and still acknowledges the
//! record. Nothing is mutated when decoding or resolution fails.

use std::sync::Arc;

use snafu::ResultExt;
use tracing::{debug, warn};

use crate::{
    broker::Record,
    codec::{DecodedPayload, PayloadCodec},
    config::Config,
    error::{Error, ProcessingSnafu},
    message::{Message, MessageStatus},
    store::{Completion, Store},
    updater::StatusUpdater,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Processed {
        message_id: i64,
        completion: Completion,
    },
    /// The message was already processed; nothing changed.
    Duplicate { message_id: i64 },
}

impl Outcome {
    pub fn message_id(&self) -> i64 {
        match self {
            Self::Processed { message_id, .. } | Self::Duplicate { message_id } => *message_id,
        }
    }
}

#[derive(Clone)]
pub struct Pipeline {
    store: Store,
    codec: PayloadCodec,
    updater: Option<Arc<StatusUpdater>>,
    record_processed: bool,
}

#[bon::bon]
impl Pipeline {
    /// Without an `updater` the `processing` transition is written inline.
    #[builder]
    pub fn new(
        store: Store,
        #[builder(default)] codec: PayloadCodec,
        updater: Option<Arc<StatusUpdater>>,
        #[builder(default = true)] record_processed: bool,
    ) -> Self {
        Self {
            store,
            codec,
            updater,
            record_processed,
        }
    }
}

impl Pipeline {
    pub fn from_config(
        store: Store,
        config: &Config,
        updater: Option<Arc<StatusUpdater>>,
    ) -> Self {
        Self::builder()
            .store(store)
            .codec(PayloadCodec::new(config.wire_format, config.compression))
            .maybe_updater(updater)
            .record_processed(config.record_processed())
            .build()
    }

    pub async fn handle(&self, record: &Record) -> Result<Outcome, Error> {
        let decoded = self.codec.decode(&record.payload)?;
        let message = self.resolve(&decoded).await?;
        let message_id = message.id;

        if !message.status.can_advance_to(MessageStatus::Processed) {
            debug!(
                message_id,
                delivery = %record.coordinates(),
                "message already processed, skipping"
            );
            return Ok(Outcome::Duplicate { message_id });
        }

        self.mark_processing(message_id)
            .await
            .context(ProcessingSnafu { message_id })?;

        let completion = self
            .store
            .complete_delivery(message_id, &record.coordinates(), self.record_processed)
            .await
            .context(ProcessingSnafu { message_id })?;

        Ok(Outcome::Processed {
            message_id,
            completion,
        })
    }

    /// Finds the stored message a decoded payload originates from.
    pub async fn resolve(&self, decoded: &DecodedPayload) -> Result<Message, Error> {
        match decoded.id {
            Some(id) => {
                let message = match self.store.get_by_id(id).await {
                    Ok(message) => message,
                    Err(Error::NotFound { .. }) => {
                        return Err(Error::Resolution {
                            content: decoded.content.clone(),
                        })
                    }
                    Err(e) => return Err(e),
                };

                if message.content != decoded.content {
                    warn!(message_id = id, "payload content does not match stored message");
                    return Err(Error::Resolution {
                        content: decoded.content.clone(),
                    });
                }

                Ok(message)
            }
            None => self
                .store
                .list_all()
                .await?
                .into_iter()
                .filter(|message| message.content == decoded.content)
                .min_by_key(|message| message.id)
                .ok_or_else(|| Error::Resolution {
                    content: decoded.content.clone(),
                }),
        }
    }

    async fn mark_processing(&self, message_id: i64) -> Result<(), Error> {
        match &self.updater {
            Some(updater) => updater.update(message_id, MessageStatus::Processing).await,
            None => {
                self.store
                    .advance_status(message_id, MessageStatus::Processing)
                    .await?;
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::Bytes;

    use crate::{
        codec::{Compression, WireFormat},
        message::DeliveryCoordinates,
        store::tests::memory_store,
    };

    use super::*;

    fn record(payload: Bytes, offset: i64) -> Record {
        Record {
            topic: "messages".to_owned(),
            partition: 0,
            offset,
            payload,
            timestamp: None,
        }
    }

    fn raw_pipeline(store: &Store) -> Pipeline {
        Pipeline::builder()
            .store(store.clone())
            .codec(PayloadCodec::new(WireFormat::Raw, Compression::None))
            .build()
    }

    #[tokio::test]
    async fn raw_content_resolves_to_matching_message() {
        let store = memory_store().await;
        let mut ids = Vec::new();
        for n in 0..5 {
            ids.push(
                store
                    .create(&format!("content-{n}"), MessageStatus::Received)
                    .await
                    .unwrap(),
            );
        }
        let pipeline = raw_pipeline(&store);

        let resolved = pipeline
            .resolve(&DecodedPayload {
                id: None,
                content: "content-3".to_owned(),
            })
            .await
            .unwrap();

        assert_eq!(resolved.id, ids[3]);
    }

    #[tokio::test]
    async fn unmatched_record_leaves_store_untouched() {
        let store = memory_store().await;
        store.create("a", MessageStatus::Received).await.unwrap();
        store.create("b", MessageStatus::Received).await.unwrap();
        let before = store.list_all().await.unwrap();
        let pipeline = raw_pipeline(&store);

        let err = pipeline
            .handle(&record(Bytes::from_static(b"nope"), 0))
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Resolution { .. }));
        assert_eq!(store.list_all().await.unwrap(), before);
        assert!(store.list_processed().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn processed_message_records_consumed_coordinates() {
        let store = memory_store().await;
        let id = store.create("hello", MessageStatus::Received).await.unwrap();
        let pipeline = raw_pipeline(&store);

        let outcome = pipeline
            .handle(&record(Bytes::from_static(b"hello"), 7))
            .await
            .unwrap();
        assert_eq!(outcome.message_id(), id);

        let message = store.get_by_id(id).await.unwrap();
        assert_eq!(message.status, MessageStatus::Processed);
        assert_eq!(
            message.delivery(),
            Some(DeliveryCoordinates {
                topic: "messages".to_owned(),
                partition: 0,
                offset: 7,
            })
        );
    }

    #[tokio::test]
    async fn redelivery_does_not_regress_status() {
        let store = memory_store().await;
        let id = store.create("hello", MessageStatus::Received).await.unwrap();
        let pipeline = raw_pipeline(&store);
        let consumed = record(Bytes::from_static(b"hello"), 2);

        pipeline.handle(&consumed).await.unwrap();
        let replay = pipeline.handle(&consumed).await.unwrap();

        assert_eq!(replay, Outcome::Duplicate { message_id: id });
        let message = store.get_by_id(id).await.unwrap();
        assert_eq!(message.status, MessageStatus::Processed);
        assert_eq!(message.kafka_offset, Some(2));
        assert_eq!(store.list_processed().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn envelope_resolves_by_id_despite_duplicate_content() {
        let store = memory_store().await;
        let first = store.create("same", MessageStatus::Received).await.unwrap();
        let second = store.create("same", MessageStatus::Received).await.unwrap();
        let codec = PayloadCodec::new(WireFormat::Envelope, Compression::Zstd);
        let pipeline = Pipeline::builder()
            .store(store.clone())
            .codec(codec)
            .build();

        let outcome = pipeline
            .handle(&record(codec.encode(second, "same").unwrap(), 0))
            .await
            .unwrap();

        assert_eq!(outcome.message_id(), second);
        assert_eq!(
            store.get_by_id(first).await.unwrap().status,
            MessageStatus::Received
        );
    }

    #[tokio::test]
    async fn undecodable_payload_is_rejected_before_any_write() {
        let store = memory_store().await;
        store.create("x", MessageStatus::Received).await.unwrap();
        let pipeline = Pipeline::builder().store(store.clone()).build();

        let err = pipeline
            .handle(&record(Bytes::from_static(b"not json"), 0))
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Decode { .. }));
        assert_eq!(
            store.statistics().await.unwrap().count(MessageStatus::Received),
            1
        );
    }

    #[tokio::test]
    async fn async_updates_never_overtake_completion() {
        let store = memory_store().await;
        let updater = Arc::new(StatusUpdater::new(store.clone(), 4));
        let pipeline = Pipeline::builder()
            .store(store.clone())
            .codec(PayloadCodec::new(WireFormat::Raw, Compression::None))
            .updater(Arc::clone(&updater))
            .build();

        let mut ids = Vec::new();
        for n in 0..5 {
            let content = format!("m{n}");
            ids.push(store.create(&content, MessageStatus::Received).await.unwrap());
            pipeline
                .handle(&record(Bytes::from(content), n))
                .await
                .unwrap();
        }
        updater.close(Duration::from_secs(5)).await;

        for id in ids {
            assert_eq!(
                store.get_by_id(id).await.unwrap().status,
                MessageStatus::Processed
            );
        }
    }
}
