//! Payload codecs.
//!
//! A codec converts structured values to and from the opaque byte payload
//! carried by an envelope. Every broker instance owns one codec; both sides of
//! a conversation must agree on it.

use bytes::Bytes;
use serde_json::Value;

use super::{BrokerError, Result};

/// Encode/decode pair for envelope payloads.
pub trait Codec: Send + Sync + std::fmt::Debug {
    /// Short stable name, used in logs and configuration.
    fn name(&self) -> &'static str;

    /// Serialize a value into a payload.
    fn encode(&self, value: &Value) -> Result<Bytes>;

    /// Deserialize a payload into a value.
    fn decode(&self, payload: &[u8]) -> Result<Value>;
}

/// MessagePack codec. The default for every broker.
#[derive(Debug, Default, Clone, Copy)]
pub struct MsgPackCodec;

impl Codec for MsgPackCodec {
    fn name(&self) -> &'static str {
        "msgpack"
    }

    fn encode(&self, value: &Value) -> Result<Bytes> {
        rmp_serde::to_vec(value)
            .map(Bytes::from)
            .map_err(|e| BrokerError::Codec(format!("msgpack encode: {}", e)))
    }

    fn decode(&self, payload: &[u8]) -> Result<Value> {
        rmp_serde::from_slice(payload)
            .map_err(|e| BrokerError::Codec(format!("msgpack decode: {}", e)))
    }
}

/// JSON codec, for interop with consumers that cannot speak MessagePack.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn name(&self) -> &'static str {
        "json"
    }

    fn encode(&self, value: &Value) -> Result<Bytes> {
        serde_json::to_vec(value)
            .map(Bytes::from)
            .map_err(|e| BrokerError::Codec(format!("json encode: {}", e)))
    }

    fn decode(&self, payload: &[u8]) -> Result<Value> {
        serde_json::from_slice(payload)
            .map_err(|e| BrokerError::Codec(format!("json decode: {}", e)))
    }
}

/// Codec selector used by configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CodecKind {
    #[default]
    Msgpack,
    Json,
}

impl CodecKind {
    /// Build the codec this selector names.
    pub fn build(self) -> std::sync::Arc<dyn Codec> {
        match self {
            CodecKind::Msgpack => std::sync::Arc::new(MsgPackCodec),
            CodecKind::Json => std::sync::Arc::new(JsonCodec),
        }
    }
}
