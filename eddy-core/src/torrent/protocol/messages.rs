//! BitTorrent wire protocol message framing

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::types::PeerMessage;
use crate::torrent::{PieceIndex, TorrentError};

/// Largest frame accepted from a peer. Covers a 16 KiB block with headroom
/// plus bitfields of very large torrents.
pub const MAX_FRAME_LENGTH: u32 = 2 * 1024 * 1024;

/// Message serialization utilities for BitTorrent wire protocol.
pub struct MessageCodec;

impl MessageCodec {
    /// Serializes a message including its 4-byte length prefix.
    pub fn serialize_message(message: &PeerMessage) -> BytesMut {
        let mut buf = BytesMut::new();

        match message {
            PeerMessage::KeepAlive => buf.put_u32(0),
            PeerMessage::Choke => Self::put_header(&mut buf, 0, 0),
            PeerMessage::Unchoke => Self::put_header(&mut buf, 1, 0),
            PeerMessage::Interested => Self::put_header(&mut buf, 2, 0),
            PeerMessage::NotInterested => Self::put_header(&mut buf, 3, 0),
            PeerMessage::Have { piece_index } => {
                Self::put_header(&mut buf, 4, 4);
                buf.put_u32(piece_index.as_u32());
            }
            PeerMessage::Bitfield { bitfield } => {
                Self::put_header(&mut buf, 5, bitfield.len());
                buf.extend_from_slice(bitfield);
            }
            PeerMessage::Request {
                piece_index,
                offset,
                length,
            } => {
                Self::put_header(&mut buf, 6, 12);
                buf.put_u32(piece_index.as_u32());
                buf.put_u32(*offset);
                buf.put_u32(*length);
            }
            PeerMessage::Piece {
                piece_index,
                offset,
                data,
            } => {
                Self::put_header(&mut buf, 7, 8 + data.len());
                buf.put_u32(piece_index.as_u32());
                buf.put_u32(*offset);
                buf.extend_from_slice(data);
            }
            PeerMessage::Cancel {
                piece_index,
                offset,
                length,
            } => {
                Self::put_header(&mut buf, 8, 12);
                buf.put_u32(piece_index.as_u32());
                buf.put_u32(*offset);
                buf.put_u32(*length);
            }
            PeerMessage::Port { port } => {
                Self::put_header(&mut buf, 9, 2);
                buf.put_u16(*port);
            }
            PeerMessage::Extended {
                extended_id,
                payload,
            } => {
                Self::put_header(&mut buf, 20, 1 + payload.len());
                buf.put_u8(*extended_id);
                buf.extend_from_slice(payload);
            }
        }

        buf
    }

    fn put_header(buf: &mut BytesMut, message_id: u8, body_len: usize) {
        buf.reserve(5 + body_len);
        buf.put_u32(1 + body_len as u32);
        buf.put_u8(message_id);
    }

    /// Deserializes a message from a frame that includes its length prefix.
    ///
    /// # Errors
    /// - `TorrentError::ProtocolError` - Truncated frame, bad length or unknown ID
    pub fn deserialize_message(data: &[u8]) -> Result<PeerMessage, TorrentError> {
        if data.len() < 4 {
            return Err(Self::protocol_error("Message too short"));
        }
        let mut prefix = &data[..4];
        let length = prefix.get_u32() as usize;
        if data.len() < 4 + length {
            return Err(Self::protocol_error("Incomplete message"));
        }
        Self::decode_body(Bytes::copy_from_slice(&data[4..4 + length]))
    }

    /// Decodes a frame body (everything after the length prefix).
    ///
    /// # Errors
    /// - `TorrentError::ProtocolError` - Bad body length or unknown message ID
    pub fn decode_body(mut body: Bytes) -> Result<PeerMessage, TorrentError> {
        if body.is_empty() {
            return Ok(PeerMessage::KeepAlive);
        }

        let message_id = body.get_u8();
        let fixed = |expected: usize, body: &Bytes, name: &str| {
            if body.len() == expected {
                Ok(())
            } else {
                Err(Self::protocol_error(&format!("Invalid {name} message length")))
            }
        };

        match message_id {
            0 => Ok(PeerMessage::Choke),
            1 => Ok(PeerMessage::Unchoke),
            2 => Ok(PeerMessage::Interested),
            3 => Ok(PeerMessage::NotInterested),
            4 => {
                fixed(4, &body, "Have")?;
                Ok(PeerMessage::Have {
                    piece_index: PieceIndex::new(body.get_u32()),
                })
            }
            5 => Ok(PeerMessage::Bitfield { bitfield: body }),
            6 | 8 => {
                fixed(12, &body, "Request")?;
                let piece_index = PieceIndex::new(body.get_u32());
                let offset = body.get_u32();
                let length = body.get_u32();
                Ok(if message_id == 6 {
                    PeerMessage::Request {
                        piece_index,
                        offset,
                        length,
                    }
                } else {
                    PeerMessage::Cancel {
                        piece_index,
                        offset,
                        length,
                    }
                })
            }
            7 => {
                if body.len() < 8 {
                    return Err(Self::protocol_error("Invalid Piece message length"));
                }
                let piece_index = PieceIndex::new(body.get_u32());
                let offset = body.get_u32();
                Ok(PeerMessage::Piece {
                    piece_index,
                    offset,
                    data: body,
                })
            }
            9 => {
                fixed(2, &body, "Port")?;
                Ok(PeerMessage::Port {
                    port: body.get_u16(),
                })
            }
            20 => {
                if body.is_empty() {
                    return Err(Self::protocol_error("Empty extended message"));
                }
                let extended_id = body.get_u8();
                Ok(PeerMessage::Extended {
                    extended_id,
                    payload: body,
                })
            }
            _ => Err(Self::protocol_error(&format!(
                "Unknown message ID: {message_id}"
            ))),
        }
    }

    /// Reads one length-prefixed message from `reader`.
    ///
    /// # Errors
    /// - `TorrentError::PeerConnectionError` - Socket closed or read failed
    /// - `TorrentError::ProtocolError` - Oversized or malformed frame
    pub async fn read_message<R>(reader: &mut R) -> Result<PeerMessage, TorrentError>
    where
        R: AsyncRead + Unpin,
    {
        let length = reader
            .read_u32()
            .await
            .map_err(|e| TorrentError::PeerConnectionError {
                reason: format!("Read failed: {e}"),
            })?;
        if length > MAX_FRAME_LENGTH {
            return Err(Self::protocol_error(&format!(
                "Frame of {length} bytes exceeds limit"
            )));
        }

        let mut body = BytesMut::zeroed(length as usize);
        reader
            .read_exact(&mut body)
            .await
            .map_err(|e| TorrentError::PeerConnectionError {
                reason: format!("Read failed: {e}"),
            })?;
        Self::decode_body(body.freeze())
    }

    /// Writes one message to `writer`.
    ///
    /// # Errors
    /// - `TorrentError::PeerConnectionError` - Write failed
    pub async fn write_message<W>(writer: &mut W, message: &PeerMessage) -> Result<(), TorrentError>
    where
        W: AsyncWrite + Unpin,
    {
        writer
            .write_all(&Self::serialize_message(message))
            .await
            .map_err(|e| TorrentError::PeerConnectionError {
                reason: format!("Write failed: {e}"),
            })
    }

    fn protocol_error(message: &str) -> TorrentError {
        TorrentError::ProtocolError {
            message: message.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_wire_format() {
        let bytes = MessageCodec::serialize_message(&PeerMessage::Request {
            piece_index: PieceIndex::new(7),
            offset: 16_384,
            length: 16_384,
        });
        assert_eq!(
            bytes.as_ref(),
            &[0, 0, 0, 13, 6, 0, 0, 0, 7, 0, 0, 64, 0, 0, 0, 64, 0]
        );
    }

    #[test]
    fn test_piece_and_extended_decode() {
        let piece = PeerMessage::Piece {
            piece_index: PieceIndex::new(3),
            offset: 0,
            data: Bytes::from_static(b"abcd"),
        };
        let decoded =
            MessageCodec::deserialize_message(&MessageCodec::serialize_message(&piece)).unwrap();
        assert_eq!(decoded, piece);

        let extended = PeerMessage::Extended {
            extended_id: 0,
            payload: Bytes::from_static(b"de"),
        };
        let decoded =
            MessageCodec::deserialize_message(&MessageCodec::serialize_message(&extended)).unwrap();
        assert_eq!(decoded, extended);
    }

    #[test]
    fn test_rejects_malformed_frames() {
        assert!(MessageCodec::deserialize_message(&[0, 0, 0, 5, 4, 0]).is_err());
        assert!(MessageCodec::deserialize_message(&[0, 0, 0, 2, 4, 0]).is_err());
        assert!(MessageCodec::deserialize_message(&[0, 0, 0, 1, 99]).is_err());
        assert_eq!(
            MessageCodec::deserialize_message(&[0, 0, 0, 0]).unwrap(),
            PeerMessage::KeepAlive
        );
    }

    #[tokio::test]
    async fn test_async_framing() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        MessageCodec::write_message(&mut client, &PeerMessage::Interested)
            .await
            .unwrap();
        MessageCodec::write_message(
            &mut client,
            &PeerMessage::Have {
                piece_index: PieceIndex::new(9),
            },
        )
        .await
        .unwrap();

        assert_eq!(
            MessageCodec::read_message(&mut server).await.unwrap(),
            PeerMessage::Interested
        );
        assert_eq!(
            MessageCodec::read_message(&mut server).await.unwrap(),
            PeerMessage::Have {
                piece_index: PieceIndex::new(9)
            }
        );
    }
}
