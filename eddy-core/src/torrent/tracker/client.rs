//! HTTP tracker client implementation with URL building and response parsing

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};

use async_trait::async_trait;

use super::types::{AnnounceRequest, AnnounceResponse, TrackerClient};
use crate::config::NetworkConfig;
use crate::torrent::TorrentError;
use crate::torrent::parsing::bencode::BencodeDict;

/// HTTP tracker client implementation
pub struct HttpTrackerClient {
    announce_url: String,
    client: reqwest::Client,
}

impl HttpTrackerClient {
    /// Creates an HTTP tracker client for one announce URL.
    ///
    /// # Errors
    /// - `TorrentError::Http` - If the HTTP client cannot be built
    pub fn new(announce_url: String, config: &NetworkConfig) -> Result<Self, TorrentError> {
        let client = reqwest::Client::builder()
            .timeout(config.tracker_timeout)
            .user_agent(config.user_agent)
            .redirect(reqwest::redirect::Policy::limited(3))
            .build()?;
        Ok(Self::with_client(announce_url, client))
    }

    /// Creates a tracker client sharing an existing HTTP client.
    pub fn with_client(announce_url: String, client: reqwest::Client) -> Self {
        Self {
            announce_url,
            client,
        }
    }

    /// Build announce URL with query parameters.
    ///
    /// Binary fields are percent-encoded byte by byte; running them through a
    /// generic URL encoder would double-encode.
    pub(crate) fn build_announce_url(&self, request: &AnnounceRequest) -> String {
        let mut query = format!(
            "info_hash={}&peer_id={}&port={}&uploaded={}&downloaded={}&left={}&compact=1",
            Self::url_encode_bytes(request.info_hash.as_bytes()),
            Self::url_encode_bytes(request.peer_id.as_bytes()),
            request.port,
            request.uploaded,
            request.downloaded,
            request.left,
        );
        if let Some(event) = request.event {
            query.push_str("&event=");
            query.push_str(event.as_str());
        }

        let separator = if self.announce_url.contains('?') {
            '&'
        } else {
            '?'
        };
        format!("{}{separator}{query}", self.announce_url)
    }

    /// URL encode bytes for tracker communication per RFC 3986.
    pub(crate) fn url_encode_bytes(bytes: &[u8]) -> String {
        bytes.iter().map(|&b| format!("%{b:02X}")).collect()
    }

    /// Parse compact IPv4 peer list (6 bytes per peer).
    ///
    /// # Errors
    /// - `TorrentError::ProtocolError` - Length is not a multiple of 6
    pub(crate) fn parse_compact_peers(peer_bytes: &[u8]) -> Result<Vec<SocketAddr>, TorrentError> {
        if peer_bytes.len() % 6 != 0 {
            return Err(TorrentError::ProtocolError {
                message: "Invalid compact peer data length".to_string(),
            });
        }

        Ok(peer_bytes
            .chunks_exact(6)
            .map(|chunk| {
                let ip = Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]);
                let port = u16::from_be_bytes([chunk[4], chunk[5]]);
                SocketAddr::V4(SocketAddrV4::new(ip, port))
            })
            .collect())
    }

    /// Parse compact IPv6 peer list (18 bytes per peer, BEP 7).
    fn parse_compact_peers6(peer_bytes: &[u8]) -> Vec<SocketAddr> {
        peer_bytes
            .chunks_exact(18)
            .map(|chunk| {
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&chunk[..16]);
                let port = u16::from_be_bytes([chunk[16], chunk[17]]);
                SocketAddr::V6(SocketAddrV6::new(Ipv6Addr::from(octets), port, 0, 0))
            })
            .collect()
    }

    /// Parse the non-compact dictionary peer list.
    fn parse_dictionary_peers(peers: &[bencode_rs::Value<'_>]) -> Vec<SocketAddr> {
        peers
            .iter()
            .filter_map(|peer| {
                let bencode_rs::Value::Dictionary(peer) = peer else {
                    return None;
                };
                let ip = match peer.get(b"ip".as_slice()) {
                    Some(bencode_rs::Value::Bytes(ip)) => std::str::from_utf8(ip).ok()?,
                    _ => return None,
                };
                let port = match peer.get(b"port".as_slice()) {
                    Some(bencode_rs::Value::Integer(port)) => u16::try_from(*port).ok()?,
                    _ => return None,
                };
                Some(SocketAddr::new(ip.parse().ok()?, port))
            })
            .collect()
    }

    /// Parse tracker response from bencode data
    pub(crate) fn parse_announce_response(
        response_bytes: &[u8],
    ) -> Result<AnnounceResponse, TorrentError> {
        let parsed =
            bencode_rs::Value::parse(response_bytes).map_err(|e| TorrentError::ProtocolError {
                message: format!("Failed to parse tracker response: {e:?}"),
            })?;

        let Some(bencode_rs::Value::Dictionary(dict)) = parsed.first() else {
            return Err(TorrentError::ProtocolError {
                message: "Invalid tracker response format".to_string(),
            });
        };

        if let Some(bencode_rs::Value::Bytes(failure_reason)) =
            dict.get(b"failure reason".as_slice())
        {
            return Err(TorrentError::TrackerRejected {
                reason: String::from_utf8_lossy(failure_reason).to_string(),
            });
        }

        let interval = Self::optional_u32(dict, b"interval").ok_or_else(|| {
            TorrentError::ProtocolError {
                message: "Missing interval in tracker response".to_string(),
            }
        })?;

        let mut peers = match dict.get(b"peers".as_slice()) {
            Some(bencode_rs::Value::Bytes(peer_data)) => Self::parse_compact_peers(peer_data)?,
            Some(bencode_rs::Value::List(peer_list)) => Self::parse_dictionary_peers(peer_list),
            _ => Vec::new(),
        };
        if let Some(bencode_rs::Value::Bytes(peer_data)) = dict.get(b"peers6".as_slice()) {
            peers.extend(Self::parse_compact_peers6(peer_data));
        }

        Ok(AnnounceResponse {
            interval,
            min_interval: Self::optional_u32(dict, b"min interval"),
            complete: Self::optional_u32(dict, b"complete").unwrap_or(0),
            incomplete: Self::optional_u32(dict, b"incomplete").unwrap_or(0),
            peers,
        })
    }

    fn optional_u32(dict: &BencodeDict<'_>, key: &[u8]) -> Option<u32> {
        match dict.get(key) {
            Some(bencode_rs::Value::Integer(value)) => u32::try_from(*value).ok(),
            _ => None,
        }
    }
}

#[async_trait]
impl TrackerClient for HttpTrackerClient {
    async fn announce(&self, request: &AnnounceRequest) -> Result<AnnounceResponse, TorrentError> {
        let url = self.build_announce_url(request);
        tracing::debug!(tracker = %self.announce_url, info_hash = %request.info_hash, "Announcing");

        let response = self.client.get(&url).send().await.map_err(|e| {
            tracing::warn!(tracker = %self.announce_url, error = %e, "Announce request failed");
            TorrentError::TrackerConnectionFailed {
                url: self.announce_url.clone(),
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            tracing::warn!(tracker = %self.announce_url, %status, "Tracker returned error status");
            return Err(TorrentError::TrackerConnectionFailed {
                url: format!("{} (HTTP {})", self.announce_url, status.as_u16()),
            });
        }

        let body = response
            .bytes()
            .await
            .map_err(|_| TorrentError::TrackerConnectionFailed {
                url: self.announce_url.clone(),
            })?;
        let parsed = Self::parse_announce_response(&body)?;
        tracing::debug!(
            tracker = %self.announce_url,
            peers = parsed.peers.len(),
            seeders = parsed.complete,
            "Announce succeeded"
        );
        Ok(parsed)
    }

    fn tracker_url(&self) -> &str {
        &self.announce_url
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::torrent::InfoHash;
    use crate::torrent::protocol::PeerId;
    use crate::torrent::tracker::AnnounceEvent;

    fn request() -> AnnounceRequest {
        AnnounceRequest {
            info_hash: InfoHash::new([0x12; 20]),
            peer_id: PeerId::new(*b"-ED0001-abcdefghijkl"),
            port: 6881,
            uploaded: 0,
            downloaded: 10,
            left: 90,
            event: Some(AnnounceEvent::Started),
        }
    }

    #[test]
    fn test_announce_url_encoding() {
        let client = HttpTrackerClient::with_client(
            "http://tracker.test/announce".to_string(),
            reqwest::Client::new(),
        );
        let url = client.build_announce_url(&request());

        assert!(url.starts_with("http://tracker.test/announce?info_hash=%12%12"));
        assert!(url.contains("&peer_id=%2D%45%44"));
        assert!(url.contains("&left=90&compact=1&event=started"));

        let passkey = HttpTrackerClient::with_client(
            "http://tracker.test/announce?passkey=x".to_string(),
            reqwest::Client::new(),
        );
        assert!(passkey.build_announce_url(&request()).contains("passkey=x&info_hash="));
    }

    #[test]
    fn test_compact_peer_parsing() {
        let peers =
            HttpTrackerClient::parse_compact_peers(&[127, 0, 0, 1, 0x1a, 0xe1, 10, 0, 0, 2, 0, 80])
                .unwrap();
        assert_eq!(peers[0], "127.0.0.1:6881".parse().unwrap());
        assert_eq!(peers[1], "10.0.0.2:80".parse().unwrap());
        assert!(HttpTrackerClient::parse_compact_peers(&[1, 2, 3]).is_err());
    }

    #[test]
    fn test_announce_response_parsing() {
        let mut body = b"d8:completei3e10:incompletei1e8:intervali1800e5:peers6:".to_vec();
        body.extend_from_slice(&[192, 168, 1, 2, 0x1a, 0xe1]);
        body.push(b'e');

        let response = HttpTrackerClient::parse_announce_response(&body).unwrap();
        assert_eq!(response.interval, 1800);
        assert_eq!(response.complete, 3);
        assert_eq!(response.peers, vec!["192.168.1.2:6881".parse().unwrap()]);
    }

    #[test]
    fn test_dictionary_peer_list() {
        let body = b"d8:intervali60e5:peersld2:ip9:10.0.0.104:porti51413eeee";
        let response = HttpTrackerClient::parse_announce_response(body).unwrap();
        assert_eq!(response.peers, vec!["10.0.0.10:51413".parse().unwrap()]);
    }

    #[test]
    fn test_failure_reason() {
        let body = b"d14:failure reason17:torrent not founde";
        assert!(matches!(
            HttpTrackerClient::parse_announce_response(body),
            Err(TorrentError::TrackerRejected { .. })
        ));
    }
}
