use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::metainfo::{BlockId, Digest};

/// Everything two peers say to each other.
///
/// On the wire each message is a json object whose `type` field names the variant, the remaining
/// fields are the variant's own. Decoding reads the `type` field first and then the fields of
/// that variant only, an unknown `type` is an error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PeerMessage {
    RequestBlock {
        block_id: BlockId,
    },

    RequestInfo,

    BlockData {
        block_id: BlockId,
        #[serde(with = "base64_bytes")]
        data: Vec<u8>,
        checksum: Digest,
    },

    PeerInfo {
        available_blocks: Vec<BlockId>,
        total_blocks: usize,
    },

    Error {
        message: String,
    },
}

#[derive(Debug, Error)]
#[error("failed to decode peer message: {0}")]
pub struct DecodeError(#[from] serde_json::Error);

impl PeerMessage {
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::RequestBlock { .. } => "REQUEST_BLOCK",
            Self::RequestInfo => "REQUEST_INFO",
            Self::BlockData { .. } => "BLOCK_DATA",
            Self::PeerInfo { .. } => "PEER_INFO",
            Self::Error { .. } => "ERROR",
        }
    }

    pub fn to_payload(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    pub fn from_payload(payload: &[u8]) -> Result<Self, DecodeError> {
        Ok(serde_json::from_slice(payload)?)
    }
}

// block bytes travel as standard base64 text inside the json payload
mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(PeerMessage::RequestBlock { block_id: 7 }, r#"{"type":"REQUEST_BLOCK","block_id":7}"#)]
    #[case(PeerMessage::RequestInfo, r#"{"type":"REQUEST_INFO"}"#)]
    #[case(
        PeerMessage::PeerInfo { available_blocks: vec![0, 2], total_blocks: 3 },
        r#"{"type":"PEER_INFO","available_blocks":[0,2],"total_blocks":3}"#
    )]
    #[case(PeerMessage::error("nope"), r#"{"type":"ERROR","message":"nope"}"#)]
    #[case(
        PeerMessage::BlockData { block_id: 1, data: b"hi".to_vec(), checksum: Digest::from("sha256:ab") },
        r#"{"type":"BLOCK_DATA","block_id":1,"data":"aGk=","checksum":"sha256:ab"}"#
    )]
    fn payload_layout(#[case] message: PeerMessage, #[case] expected: &str) {
        let payload = message.to_payload().unwrap();
        assert_eq!(std::str::from_utf8(&payload).unwrap(), expected);
        assert_eq!(PeerMessage::from_payload(expected.as_bytes()).unwrap(), message);
    }

    #[test]
    fn field_order_does_not_matter() {
        let raw = br#"{"block_id":3,"checksum":"sha256:00","data":"","type":"BLOCK_DATA"}"#;
        assert_eq!(
            PeerMessage::from_payload(raw).unwrap(),
            PeerMessage::BlockData {
                block_id: 3,
                data: Vec::new(),
                checksum: Digest::from("sha256:00"),
            }
        );
    }

    #[rstest]
    #[case::unknown_type(br#"{"type":"HAVE","block_id":1}"#.as_slice())]
    #[case::missing_type(br#"{"block_id":1}"#.as_slice())]
    #[case::missing_field(br#"{"type":"REQUEST_BLOCK"}"#.as_slice())]
    #[case::bad_base64(br#"{"type":"BLOCK_DATA","block_id":1,"data":"!!","checksum":"x"}"#.as_slice())]
    #[case::negative_id(br#"{"type":"REQUEST_BLOCK","block_id":-1}"#.as_slice())]
    #[case::not_json(b"\x00\x01".as_slice())]
    fn malformed_payloads_fail(#[case] payload: &[u8]) {
        assert!(PeerMessage::from_payload(payload).is_err());
    }
}
