//! Extension protocol (BEP 10) and metadata exchange (BEP 9) messages.
//!
//! Magnet links carry only the info hash; the info dictionary is pulled from
//! peers in 16 KiB blocks over `ut_metadata`.

use bytes::Bytes;

use crate::torrent::TorrentError;
use crate::torrent::parsing::BencodeValue;
use crate::torrent::parsing::bencode::{BencodeDict, BencodeParser};

/// Extended message ID of the extension handshake.
pub const EXTENSION_HANDSHAKE_ID: u8 = 0;

/// ID we ask peers to use when sending us `ut_metadata` messages.
pub const LOCAL_UT_METADATA_ID: u8 = 1;

/// Metadata is exchanged in blocks of this size; only the last is shorter.
pub const METADATA_BLOCK_SIZE: usize = 16_384;

/// Upper bound on info dictionaries we are willing to assemble.
pub const MAX_METADATA_SIZE: u64 = 16 * 1024 * 1024;

/// Contents of an extension handshake that matter for metadata exchange.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtensionHandshake {
    /// ID the sender wants `ut_metadata` messages tagged with
    pub ut_metadata: Option<u8>,
    /// Size of the info dictionary, when the sender has it
    pub metadata_size: Option<u64>,
}

impl ExtensionHandshake {
    /// Handshake we send: we accept `ut_metadata` and report our size if known.
    pub fn local(metadata_size: Option<u64>) -> Self {
        Self {
            ut_metadata: Some(LOCAL_UT_METADATA_ID),
            metadata_size,
        }
    }

    /// Encodes the bencoded handshake payload.
    pub fn encode(&self) -> Bytes {
        let mut supported = BencodeValue::dictionary();
        if let Some(id) = self.ut_metadata {
            supported = supported.with("ut_metadata", i64::from(id));
        }
        let mut root = BencodeValue::dictionary().with("m", supported);
        if let Some(size) = self.metadata_size {
            root = root.with("metadata_size", size as i64);
        }
        Bytes::from(root.encode())
    }

    /// Decodes a handshake payload.
    ///
    /// # Errors
    /// - `TorrentError::ProtocolError` - Payload is not a bencoded dictionary
    pub fn decode(payload: &[u8]) -> Result<Self, TorrentError> {
        let dict = decode_dictionary(payload)?;

        let ut_metadata = match dict.get(b"m".as_slice()) {
            Some(bencode_rs::Value::Dictionary(supported)) => {
                BencodeParser::extract_integer(supported, b"ut_metadata")
                    .ok()
                    .and_then(|id| u8::try_from(id).ok())
                    .filter(|id| *id != 0)
            }
            _ => None,
        };
        let metadata_size = BencodeParser::extract_integer(&dict, b"metadata_size")
            .ok()
            .and_then(|size| u64::try_from(size).ok());

        Ok(Self {
            ut_metadata,
            metadata_size,
        })
    }
}

/// A `ut_metadata` message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetadataMessage {
    Request { piece: u32 },
    Data { piece: u32, total_size: u64, data: Bytes },
    Reject { piece: u32 },
}

impl MetadataMessage {
    /// Encodes the message payload (dictionary followed by raw block data).
    pub fn encode(&self) -> Bytes {
        let (msg_type, piece) = match self {
            Self::Request { piece } => (0i64, *piece),
            Self::Data { piece, .. } => (1, *piece),
            Self::Reject { piece } => (2, *piece),
        };
        let mut header = BencodeValue::dictionary()
            .with("msg_type", msg_type)
            .with("piece", i64::from(piece));
        if let Self::Data { total_size, .. } = self {
            header = header.with("total_size", *total_size as i64);
        }

        let mut out = header.encode();
        if let Self::Data { data, .. } = self {
            out.extend_from_slice(data);
        }
        Bytes::from(out)
    }

    /// Decodes a payload.
    ///
    /// # Errors
    /// - `TorrentError::ProtocolError` - Malformed header or unknown message type
    pub fn decode(payload: &Bytes) -> Result<Self, TorrentError> {
        let header_end = BencodeParser::find_bencode_dictionary_end(payload).map_err(|_| {
            TorrentError::ProtocolError {
                message: "ut_metadata payload has no dictionary header".to_string(),
            }
        })?;
        let dict = decode_dictionary(&payload[..header_end])?;

        let integer = |key: &[u8]| {
            BencodeParser::extract_integer(&dict, key).map_err(|_| TorrentError::ProtocolError {
                message: format!("ut_metadata missing {}", String::from_utf8_lossy(key)),
            })
        };
        let piece = u32::try_from(integer(b"piece")?).map_err(|_| TorrentError::ProtocolError {
            message: "ut_metadata piece out of range".to_string(),
        })?;

        match integer(b"msg_type")? {
            0 => Ok(Self::Request { piece }),
            1 => Ok(Self::Data {
                piece,
                total_size: u64::try_from(integer(b"total_size")?).unwrap_or_default(),
                data: payload.slice(header_end..),
            }),
            2 => Ok(Self::Reject { piece }),
            other => Err(TorrentError::ProtocolError {
                message: format!("Unknown ut_metadata msg_type {other}"),
            }),
        }
    }
}

/// Number of metadata blocks for a dictionary of `size` bytes.
pub fn metadata_block_count(size: u64) -> u32 {
    size.div_ceil(METADATA_BLOCK_SIZE as u64) as u32
}

fn decode_dictionary(payload: &[u8]) -> Result<BencodeDict<'_>, TorrentError> {
    let parsed = bencode_rs::Value::parse(payload).map_err(|e| TorrentError::ProtocolError {
        message: format!("Invalid bencode in extension message: {e:?}"),
    })?;
    match parsed.into_iter().next() {
        Some(bencode_rs::Value::Dictionary(dict)) => Ok(dict),
        _ => Err(TorrentError::ProtocolError {
            message: "Extension message must be a dictionary".to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handshake_round_trip() {
        let ours = ExtensionHandshake::local(Some(31_337));
        assert_eq!(ExtensionHandshake::decode(&ours.encode()).unwrap(), ours);

        let bare = ExtensionHandshake::decode(b"d1:md11:LT_metadatai3eee").unwrap();
        assert_eq!(bare.ut_metadata, None);
    }

    #[test]
    fn test_data_message_keeps_trailing_block() {
        let message = MetadataMessage::Data {
            piece: 1,
            total_size: 20_000,
            data: Bytes::from_static(b"d4:infoe"),
        };
        let decoded = MetadataMessage::decode(&message.encode()).unwrap();
        assert_eq!(decoded, message);
    }

    #[test]
    fn test_unknown_msg_type() {
        let payload = Bytes::from_static(b"d8:msg_typei7e5:piecei0ee");
        assert!(MetadataMessage::decode(&payload).is_err());
    }

    #[test]
    fn test_block_count() {
        assert_eq!(metadata_block_count(1), 1);
        assert_eq!(metadata_block_count(16_384), 1);
        assert_eq!(metadata_block_count(16_385), 2);
    }
}
