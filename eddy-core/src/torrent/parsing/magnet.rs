//! Magnet link parsing utilities

use data_encoding::BASE32;

use super::types::MagnetLink;
use crate::torrent::{InfoHash, TorrentError};

/// Magnet link parsing utilities.
pub struct MagnetParser;

impl MagnetParser {
    /// Parses magnet link to extract torrent information.
    ///
    /// Accepts `btih` hashes in either hex (40 characters) or base32
    /// (32 characters) form. The display name is percent-decoded.
    ///
    /// # Errors
    /// - `TorrentError::InvalidTorrentFile` - Malformed magnet URI or hash
    pub fn parse_magnet_link(magnet_url: &str) -> Result<MagnetLink, TorrentError> {
        let magnet =
            magnet_url::Magnet::new(magnet_url).map_err(|e| TorrentError::InvalidTorrentFile {
                reason: format!("Invalid magnet link: {e:?}"),
            })?;

        if magnet.hash_type() != Some("btih") {
            return Err(TorrentError::InvalidTorrentFile {
                reason: "Magnet link has no btih exact topic".to_string(),
            });
        }

        let hash = magnet
            .hash()
            .ok_or_else(|| TorrentError::InvalidTorrentFile {
                reason: "Magnet link does not contain info hash".to_string(),
            })?;
        let info_hash = Self::decode_info_hash(hash)?;

        let display_name = magnet.display_name().map(|name| {
            let spaced = name.replace('+', " ");
            urlencoding::decode(&spaced)
                .map(|decoded| decoded.into_owned())
                .unwrap_or(spaced)
        });

        let trackers = magnet
            .trackers()
            .iter()
            .map(|tracker| {
                urlencoding::decode(tracker)
                    .map(|decoded| decoded.into_owned())
                    .unwrap_or_else(|_| tracker.clone())
            })
            .collect();

        Ok(MagnetLink {
            info_hash,
            display_name,
            trackers,
        })
    }

    /// Builds a magnet URI for a known torrent.
    pub fn to_magnet_uri(info_hash: InfoHash, name: &str, trackers: &[String]) -> String {
        let mut uri = format!(
            "magnet:?xt=urn:btih:{info_hash}&dn={}",
            urlencoding::encode(name)
        );
        for tracker in trackers {
            uri.push_str("&tr=");
            uri.push_str(&urlencoding::encode(tracker));
        }
        uri
    }

    fn decode_info_hash(hash: &str) -> Result<InfoHash, TorrentError> {
        let bytes = match hash.len() {
            40 => hex::decode(hash).map_err(|e| e.to_string()),
            32 => BASE32
                .decode(hash.to_uppercase().as_bytes())
                .map_err(|e| e.to_string()),
            other => Err(format!("Invalid hash length: {other} (expected 40 or 32)")),
        }
        .map_err(|reason| TorrentError::InvalidTorrentFile { reason })?;

        let hash: [u8; 20] = bytes
            .try_into()
            .map_err(|_| TorrentError::InvalidTorrentFile {
                reason: "Info hash must be 20 bytes".to_string(),
            })?;
        Ok(InfoHash::new(hash))
    }
}
