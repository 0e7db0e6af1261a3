use crate::core::{Result, StoreError};
use serde::{Deserialize, Serialize, de::DeserializeOwned};

/// Payload encoding of primary records.
///
/// Encoding and decoding are pure; a failure is fatal for the one operation
/// that hit it and is never retried.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordCodec {
    /// MessagePack with field names, so added fields decode with defaults.
    #[default]
    MessagePack,
    Json,
}

impl RecordCodec {
    pub fn encode<A: Serialize>(&self, value: &A) -> Result<Vec<u8>> {
        match self {
            Self::MessagePack => rmp_serde::to_vec_named(value)
                .map_err(|e| StoreError::Codec(format!("MessagePack encode failed: {}", e))),
            Self::Json => serde_json::to_vec(value)
                .map_err(|e| StoreError::Codec(format!("JSON encode failed: {}", e))),
        }
    }

    pub fn decode<A: DeserializeOwned>(&self, bytes: &[u8]) -> Result<A> {
        match self {
            Self::MessagePack => rmp_serde::from_slice(bytes)
                .map_err(|e| StoreError::Codec(format!("MessagePack decode failed: {}", e))),
            Self::Json => serde_json::from_slice(bytes)
                .map_err(|e| StoreError::Codec(format!("JSON decode failed: {}", e))),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::MessagePack => "msgpack",
            Self::Json => "json",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "msgpack" | "messagepack" => Some(Self::MessagePack),
            "json" => Some(Self::Json),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Note {
        id: String,
        notes: BTreeMap<String, String>,
    }

    #[derive(Debug, Deserialize)]
    struct NoteV2 {
        id: String,
        #[serde(default)]
        pinned: bool,
    }

    #[test]
    fn test_added_field_decodes_with_default() {
        let note = Note {
            id: "n1".into(),
            notes: BTreeMap::from([("k".into(), "v".into())]),
        };
        for codec in [RecordCodec::MessagePack, RecordCodec::Json] {
            let bytes = codec.encode(&note).unwrap();
            let upgraded: NoteV2 = codec.decode(&bytes).unwrap();
            assert_eq!(upgraded.id, "n1");
            assert!(!upgraded.pinned);
        }
    }

    #[test]
    fn test_garbage_is_a_codec_error() {
        let result: Result<Note> = RecordCodec::Json.decode(b"{not json");
        assert!(matches!(result, Err(StoreError::Codec(_))));
        let result: Result<Note> = RecordCodec::MessagePack.decode(&[0xc1]);
        assert!(matches!(result, Err(StoreError::Codec(_))));
    }

    #[test]
    fn test_codec_names() {
        assert_eq!(RecordCodec::from_name("JSON"), Some(RecordCodec::Json));
        assert_eq!(RecordCodec::from_name(RecordCodec::MessagePack.name()), Some(RecordCodec::MessagePack));
        assert_eq!(RecordCodec::from_name("cbor"), None);
    }
}
