//! BitTorrent handshake serialization and exchange

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::types::{PROTOCOL_NAME, PeerHandshake, PeerId};
use crate::torrent::{InfoHash, TorrentError};

/// Handshake length with the standard protocol string.
pub const HANDSHAKE_LENGTH: usize = 1 + 19 + 8 + 20 + 20;

/// Handshake serialization utilities for BitTorrent wire protocol.
pub struct HandshakeCodec;

impl HandshakeCodec {
    /// Serializes handshake message following BEP 3
    pub fn serialize_handshake(handshake: &PeerHandshake) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HANDSHAKE_LENGTH);
        buf.push(handshake.protocol.len() as u8);
        buf.extend_from_slice(handshake.protocol.as_bytes());
        buf.extend_from_slice(&handshake.reserved);
        buf.extend_from_slice(handshake.info_hash.as_bytes());
        buf.extend_from_slice(handshake.peer_id.as_bytes());
        buf
    }

    /// Deserializes handshake message following BEP 3
    ///
    /// # Errors
    /// - `TorrentError::ProtocolError` - Invalid handshake format or length
    pub fn deserialize_handshake(data: &[u8]) -> Result<PeerHandshake, TorrentError> {
        let protocol_len = *data.first().ok_or_else(|| TorrentError::ProtocolError {
            message: "Handshake too short".to_string(),
        })? as usize;
        if data.len() < 1 + protocol_len + 8 + 20 + 20 {
            return Err(TorrentError::ProtocolError {
                message: "Invalid handshake length".to_string(),
            });
        }

        let protocol = String::from_utf8_lossy(&data[1..1 + protocol_len]).to_string();
        let mut cursor = 1 + protocol_len;

        let mut reserved = [0u8; 8];
        reserved.copy_from_slice(&data[cursor..cursor + 8]);
        cursor += 8;

        let mut info_hash = [0u8; 20];
        info_hash.copy_from_slice(&data[cursor..cursor + 20]);
        cursor += 20;

        let mut peer_id = [0u8; 20];
        peer_id.copy_from_slice(&data[cursor..cursor + 20]);

        Ok(PeerHandshake {
            protocol,
            reserved,
            info_hash: InfoHash::new(info_hash),
            peer_id: PeerId::new(peer_id),
        })
    }

    /// Sends our handshake and validates the remote one.
    ///
    /// # Errors
    /// - `TorrentError::PeerConnectionError` - I/O failure during the exchange
    /// - `TorrentError::ProtocolError` - Remote speaks another protocol or torrent
    pub async fn exchange<S>(
        stream: &mut S,
        ours: &PeerHandshake,
    ) -> Result<PeerHandshake, TorrentError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let io_error = |e: std::io::Error| TorrentError::PeerConnectionError {
            reason: format!("Handshake I/O failed: {e}"),
        };

        stream
            .write_all(&Self::serialize_handshake(ours))
            .await
            .map_err(io_error)?;

        let mut buf = [0u8; HANDSHAKE_LENGTH];
        stream.read_exact(&mut buf).await.map_err(io_error)?;
        let theirs = Self::deserialize_handshake(&buf)?;

        if theirs.protocol != PROTOCOL_NAME {
            return Err(TorrentError::ProtocolError {
                message: format!("Unexpected protocol {:?}", theirs.protocol),
            });
        }
        if theirs.info_hash != ours.info_hash {
            return Err(TorrentError::ProtocolError {
                message: format!("Peer answered for torrent {}", theirs.info_hash),
            });
        }
        Ok(theirs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handshake_layout() {
        let handshake = PeerHandshake::new(InfoHash::new([0xaa; 20]), PeerId::new([0xbb; 20]));
        let bytes = HandshakeCodec::serialize_handshake(&handshake);
        assert_eq!(bytes.len(), HANDSHAKE_LENGTH);
        assert_eq!(bytes[0], 19);
        assert_eq!(&bytes[1..20], PROTOCOL_NAME.as_bytes());
        assert_eq!(
            HandshakeCodec::deserialize_handshake(&bytes).unwrap(),
            handshake
        );
        assert!(HandshakeCodec::deserialize_handshake(&bytes[..40]).is_err());
    }

    #[tokio::test]
    async fn test_exchange_rejects_wrong_torrent() {
        let (mut ours, mut theirs) = tokio::io::duplex(256);
        let local = PeerHandshake::new(InfoHash::new([1; 20]), PeerId::new([2; 20]));
        let remote = PeerHandshake::new(InfoHash::new([9; 20]), PeerId::new([3; 20]));

        let remote_task = tokio::spawn(async move {
            let mut buf = [0u8; HANDSHAKE_LENGTH];
            theirs.read_exact(&mut buf).await.unwrap();
            theirs
                .write_all(&HandshakeCodec::serialize_handshake(&remote))
                .await
                .unwrap();
        });

        let result = HandshakeCodec::exchange(&mut ours, &local).await;
        assert!(matches!(result, Err(TorrentError::ProtocolError { .. })));
        remote_task.await.unwrap();
    }
}
