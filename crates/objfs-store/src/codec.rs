use std::io::{Read, Write};
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{StoreError, StoreResult};

/// Format tag written into every JSON object file.
pub const JSON_FORMAT: &str = "objfs/1";

/// Stream serializer for stored entries.
///
/// The store hands a codec an open stream and never looks at the bytes
/// itself. An `encode` error must leave the stream unfinished: the store
/// drops it and nothing is staged.
pub trait Codec<E>: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    fn encode(&self, writer: &mut dyn Write, entry: &E) -> StoreResult<()>;

    fn decode(&self, reader: &mut dyn Read) -> StoreResult<E>;
}

/// Compact binary format (bincode).
#[derive(Clone, Copy, Debug, Default)]
pub struct BincodeCodec;

impl<E> Codec<E> for BincodeCodec
where
    E: Serialize + DeserializeOwned,
{
    fn name(&self) -> &'static str {
        "bincode"
    }

    fn encode(&self, writer: &mut dyn Write, entry: &E) -> StoreResult<()> {
        bincode::serialize_into(writer, entry).map_err(|e| StoreError::Serialization(e.to_string()))
    }

    fn decode(&self, reader: &mut dyn Read) -> StoreResult<E> {
        bincode::deserialize_from(reader).map_err(|e| StoreError::Serialization(e.to_string()))
    }
}

/// Human-readable JSON wrapped in a tagged envelope:
/// `{"format": "objfs/1", "entry": {...}}`.
#[derive(Clone, Copy, Debug, Default)]
pub struct JsonCodec;

#[derive(Serialize)]
struct EnvelopeRef<'a, E> {
    format: &'a str,
    entry: &'a E,
}

#[derive(Deserialize)]
struct Envelope<E> {
    format: String,
    entry: E,
}

impl<E> Codec<E> for JsonCodec
where
    E: Serialize + DeserializeOwned,
{
    fn name(&self) -> &'static str {
        "json"
    }

    fn encode(&self, writer: &mut dyn Write, entry: &E) -> StoreResult<()> {
        let envelope = EnvelopeRef {
            format: JSON_FORMAT,
            entry,
        };
        serde_json::to_writer(writer, &envelope).map_err(|e| StoreError::Serialization(e.to_string()))
    }

    fn decode(&self, reader: &mut dyn Read) -> StoreResult<E> {
        let envelope: Envelope<E> = serde_json::from_reader(reader)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        if envelope.format != JSON_FORMAT {
            return Err(StoreError::Serialization(format!(
                "unsupported format tag {:?}",
                envelope.format
            )));
        }
        Ok(envelope.entry)
    }
}

/// Codec selection for [`StoreConfig`](crate::StoreConfig).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CodecKind {
    Bincode,
    Json,
}

impl Default for CodecKind {
    fn default() -> Self {
        Self::Bincode
    }
}

impl CodecKind {
    pub fn codec<E>(self) -> Arc<dyn Codec<E>>
    where
        E: Serialize + DeserializeOwned + 'static,
    {
        match self {
            Self::Bincode => Arc::new(BincodeCodec),
            Self::Json => Arc::new(JsonCodec),
        }
    }
}

#[cfg(test)]
mod tests {
    use objfs_types::Entry;

    use super::*;

    fn sample() -> Entry {
        Entry::root("abc123", b"payload bytes".to_vec())
    }

    fn roundtrip(codec: &dyn Codec<Entry>) -> Entry {
        let mut buf = Vec::new();
        codec.encode(&mut buf, &sample()).unwrap();
        codec.decode(&mut buf.as_slice()).unwrap()
    }

    #[test]
    fn bincode_roundtrip() {
        assert_eq!(roundtrip(&BincodeCodec), sample());
    }

    #[test]
    fn json_roundtrip_is_tagged() {
        assert_eq!(roundtrip(&JsonCodec), sample());

        let mut buf = Vec::new();
        Codec::<Entry>::encode(&JsonCodec, &mut buf, &sample()).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&buf).unwrap();
        assert_eq!(value["format"], JSON_FORMAT);
        assert_eq!(value["entry"]["root"], true);
    }

    #[test]
    fn json_rejects_unknown_format_tag() {
        let doc = br#"{"format":"other/9","entry":{"id":[97],"root":false,"payload":[]}}"#;
        let err = Codec::<Entry>::decode(&JsonCodec, &mut &doc[..]).unwrap_err();
        assert!(matches!(err, StoreError::Serialization(_)));
    }

    #[test]
    fn truncated_input_is_serialization_error() {
        let mut buf = Vec::new();
        Codec::<Entry>::encode(&BincodeCodec, &mut buf, &sample()).unwrap();
        buf.truncate(buf.len() / 2);
        let err = Codec::<Entry>::decode(&BincodeCodec, &mut buf.as_slice()).unwrap_err();
        assert!(matches!(err, StoreError::Serialization(_)));
    }

    #[test]
    fn codec_kind_selects_implementation() {
        assert_eq!(CodecKind::Bincode.codec::<Entry>().name(), "bincode");
        assert_eq!(CodecKind::Json.codec::<Entry>().name(), "json");
    }
}
