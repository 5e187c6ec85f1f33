//! Broker wire format.
//!
//! A payload is either the raw message content or a JSON envelope that also carries
//! the stored message id, optionally zstd-compressed as a whole. Producer and consumer
//! must share the same [`PayloadCodec`].

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::error::Error;

const ZSTD_LEVEL: i32 = 3;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum WireFormat {
    /// Content bytes only; the consumer correlates by content.
    Raw,
    /// `{"id": .., "content": ..}`; the consumer correlates by id.
    #[default]
    Envelope,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Compression {
    #[default]
    None,
    Zstd,
}

#[derive(Debug, Serialize, Deserialize)]
struct Envelope<'a> {
    id: i64,
    content: std::borrow::Cow<'a, str>,
}

/// Message content recovered from a consumed record.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedPayload {
    /// Present only for envelope payloads
    pub id: Option<i64>,
    pub content: String,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PayloadCodec {
    pub format: WireFormat,
    pub compression: Compression,
}

impl PayloadCodec {
    pub fn new(format: WireFormat, compression: Compression) -> Self {
        Self {
            format,
            compression,
        }
    }

    pub fn encode(&self, id: i64, content: &str) -> Result<Bytes, Error> {
        let body = match self.format {
            WireFormat::Raw => content.as_bytes().to_vec(),
            WireFormat::Envelope => serde_json::to_vec(&Envelope {
                id,
                content: content.into(),
            })
            .map_err(Error::internal)?,
        };

        let body = match self.compression {
            Compression::None => body,
            Compression::Zstd => zstd::encode_all(body.as_slice(), ZSTD_LEVEL)
                .map_err(Error::internal)?,
        };

        Ok(Bytes::from(body))
    }

    pub fn decode(&self, payload: &[u8]) -> Result<DecodedPayload, Error> {
        let body = match self.compression {
            Compression::None => payload.to_vec(),
            Compression::Zstd => zstd::decode_all(payload)
                .map_err(|e| Error::decode(format!("zstd: {e}")))?,
        };

        match self.format {
            WireFormat::Raw => {
                let content = String::from_utf8(body)
                    .map_err(|e| Error::decode(format!("content is not utf-8: {e}")))?;
                Ok(DecodedPayload { id: None, content })
            }
            WireFormat::Envelope => {
                let envelope: Envelope<'_> = serde_json::from_slice(&body)?;
                Ok(DecodedPayload {
                    id: Some(envelope.id),
                    content: envelope.content.into_owned(),
                })
            }
        }
    }
}
