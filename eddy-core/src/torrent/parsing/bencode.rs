//! Bencode parsing logic and info hash calculation

use bytes::Bytes;
use sha1::{Digest, Sha1};

use super::types::TorrentMetadata;
use crate::torrent::{InfoHash, TorrentError};

pub(crate) type BencodeDict<'a> = std::collections::HashMap<&'a [u8], bencode_rs::Value<'a>>;
type ParseResult<T> = Result<T, TorrentError>;

/// Bencode parsing utilities for torrent metadata extraction.
pub struct BencodeParser;

impl BencodeParser {
    /// Parses a complete `.torrent` descriptor.
    ///
    /// The info hash is computed over the exact bytes of the `info` value as
    /// they appear in the descriptor.
    ///
    /// # Errors
    ///
    /// - `TorrentError::InvalidTorrentFile` - If bencode parsing or metadata extraction failed
    pub fn parse_torrent(torrent_bytes: &[u8]) -> ParseResult<TorrentMetadata> {
        let root = Self::parse_root_dictionary(torrent_bytes)?;
        let info_bytes = Self::locate_info_dictionary(torrent_bytes)?;
        let announce_urls = Self::extract_announce_urls(&root);
        Self::parse_info_dictionary(info_bytes, announce_urls)
    }

    /// Parses a bare info dictionary, as delivered by the metadata extension.
    ///
    /// # Errors
    ///
    /// - `TorrentError::InvalidTorrentFile` - If the dictionary is malformed
    pub fn parse_info_dictionary(
        info_bytes: &[u8],
        announce_urls: Vec<String>,
    ) -> ParseResult<TorrentMetadata> {
        let info = Self::parse_root_dictionary(info_bytes)?;

        let name = Self::extract_bytes_as_string(&info, b"name")?;
        let piece_length = Self::extract_integer(&info, b"piece length")?;
        if piece_length <= 0 || piece_length > i64::from(u32::MAX) {
            return Err(TorrentError::InvalidTorrentFile {
                reason: format!("Invalid piece length {piece_length}"),
            });
        }
        let piece_length = piece_length as u32;

        let pieces_bytes = Self::extract_bytes(&info, b"pieces")?;
        if pieces_bytes.is_empty() || pieces_bytes.len() % 20 != 0 {
            return Err(TorrentError::InvalidTorrentFile {
                reason: "Invalid pieces length".to_string(),
            });
        }
        let piece_hashes: Vec<[u8; 20]> = pieces_bytes
            .chunks_exact(20)
            .map(|chunk| {
                let mut hash = [0u8; 20];
                hash.copy_from_slice(chunk);
                hash
            })
            .collect();

        let entries = if let Ok(length) = Self::extract_integer(&info, b"length") {
            vec![(vec![name.clone()], Self::non_negative(length)?)]
        } else if let Some(bencode_rs::Value::List(files)) = info.get(b"files".as_slice()) {
            Self::extract_files_info(&name, files)?
        } else {
            return Err(TorrentError::InvalidTorrentFile {
                reason: "Missing 'files' or 'length' field".to_string(),
            });
        };

        let total_length: u64 = entries.iter().map(|(_, length)| *length).sum();
        let expected_pieces = total_length.div_ceil(u64::from(piece_length));
        if expected_pieces != piece_hashes.len() as u64 {
            return Err(TorrentError::InvalidTorrentFile {
                reason: format!(
                    "{} piece hashes for {} bytes at piece length {}",
                    piece_hashes.len(),
                    total_length,
                    piece_length
                ),
            });
        }

        Ok(TorrentMetadata {
            info_hash: Self::info_hash(info_bytes),
            name,
            piece_length,
            piece_hashes,
            total_length,
            files: TorrentMetadata::layout_files(entries, piece_length),
            announce_urls,
            info_bytes: Bytes::copy_from_slice(info_bytes),
        })
    }

    /// SHA-1 over raw info dictionary bytes.
    pub fn info_hash(info_bytes: &[u8]) -> InfoHash {
        let digest = Sha1::digest(info_bytes);
        let mut hash = [0u8; 20];
        hash.copy_from_slice(&digest);
        InfoHash::new(hash)
    }

    /// Find the end position of a bencode dictionary starting at `data[0]`.
    ///
    /// # Errors
    ///
    /// - `TorrentError::InvalidTorrentFile` - If invalid bencode dictionary format
    pub fn find_bencode_dictionary_end(data: &[u8]) -> ParseResult<usize> {
        if data.first() != Some(&b'd') {
            return Err(TorrentError::InvalidTorrentFile {
                reason: "Expected dictionary start".to_string(),
            });
        }
        Self::value_end(data, 0)
    }

    /// Returns the slice of the top-level `info` value.
    fn locate_info_dictionary(data: &[u8]) -> ParseResult<&[u8]> {
        if data.first() != Some(&b'd') {
            return Err(TorrentError::InvalidTorrentFile {
                reason: "Root element must be dictionary".to_string(),
            });
        }

        let mut pos = 1;
        while pos < data.len() && data[pos] != b'e' {
            let key_end = Self::value_end(data, pos)?;
            let key = Self::string_contents(data, pos, key_end)?;
            let value_end = Self::value_end(data, key_end)?;
            if key == b"info" {
                return Ok(&data[key_end..value_end]);
            }
            pos = value_end;
        }

        Err(TorrentError::InvalidTorrentFile {
            reason: "Missing 'info' field".to_string(),
        })
    }

    /// End offset of the bencode value starting at `start`.
    fn value_end(data: &[u8], start: usize) -> ParseResult<usize> {
        let invalid = |reason: &str| TorrentError::InvalidTorrentFile {
            reason: reason.to_string(),
        };

        match data.get(start) {
            Some(b'd') | Some(b'l') => {
                let mut pos = start + 1;
                loop {
                    match data.get(pos) {
                        Some(b'e') => return Ok(pos + 1),
                        Some(_) => pos = Self::value_end(data, pos)?,
                        None => return Err(invalid("Incomplete bencode container")),
                    }
                }
            }
            Some(b'i') => {
                let terminator = data[start..]
                    .iter()
                    .position(|&b| b == b'e')
                    .ok_or_else(|| invalid("Unterminated integer"))?;
                Ok(start + terminator + 1)
            }
            Some(b'0'..=b'9') => {
                let colon = data[start..]
                    .iter()
                    .position(|&b| b == b':')
                    .ok_or_else(|| invalid("Invalid string format"))?;
                let length: usize = std::str::from_utf8(&data[start..start + colon])
                    .ok()
                    .and_then(|digits| digits.parse().ok())
                    .ok_or_else(|| invalid("Invalid string length"))?;
                let end = start + colon + 1 + length;
                if end > data.len() {
                    return Err(invalid("String runs past end of data"));
                }
                Ok(end)
            }
            _ => Err(invalid("Invalid bencode character")),
        }
    }

    fn string_contents(data: &[u8], start: usize, end: usize) -> ParseResult<&[u8]> {
        let colon = data[start..end]
            .iter()
            .position(|&b| b == b':')
            .ok_or_else(|| TorrentError::InvalidTorrentFile {
                reason: "Dictionary key must be a string".to_string(),
            })?;
        Ok(&data[start + colon + 1..end])
    }

    fn parse_root_dictionary(data: &[u8]) -> ParseResult<BencodeDict<'_>> {
        let parsed =
            bencode_rs::Value::parse(data).map_err(|e| TorrentError::InvalidTorrentFile {
                reason: format!("Bencode parsing failed: {e:?}"),
            })?;

        match parsed.into_iter().next() {
            Some(bencode_rs::Value::Dictionary(dict)) => Ok(dict),
            Some(_) => Err(TorrentError::InvalidTorrentFile {
                reason: "Root element must be dictionary".to_string(),
            }),
            None => Err(TorrentError::InvalidTorrentFile {
                reason: "Empty bencode data".to_string(),
            }),
        }
    }

    fn non_negative(value: i64) -> ParseResult<u64> {
        u64::try_from(value).map_err(|_| TorrentError::InvalidTorrentFile {
            reason: format!("Negative length {value}"),
        })
    }

    fn extract_bytes_as_string(dict: &BencodeDict<'_>, key: &[u8]) -> ParseResult<String> {
        let bytes = Self::extract_bytes(dict, key)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| TorrentError::InvalidTorrentFile {
            reason: format!("Invalid UTF-8 in field: {:?}", String::from_utf8_lossy(key)),
        })
    }

    fn extract_bytes<'a>(dict: &'a BencodeDict<'_>, key: &[u8]) -> ParseResult<&'a [u8]> {
        match dict.get(key) {
            Some(bencode_rs::Value::Bytes(bytes)) => Ok(bytes),
            _ => Err(TorrentError::InvalidTorrentFile {
                reason: format!(
                    "Missing or invalid field: {:?}",
                    String::from_utf8_lossy(key)
                ),
            }),
        }
    }

    pub(crate) fn extract_integer(dict: &BencodeDict<'_>, key: &[u8]) -> ParseResult<i64> {
        match dict.get(key) {
            Some(bencode_rs::Value::Integer(value)) => Ok(*value),
            _ => Err(TorrentError::InvalidTorrentFile {
                reason: format!(
                    "Missing or invalid integer field: {:?}",
                    String::from_utf8_lossy(key)
                ),
            }),
        }
    }

    /// Multi-file entries, each path prefixed with the torrent name directory.
    fn extract_files_info(
        name: &str,
        files_list: &[bencode_rs::Value<'_>],
    ) -> ParseResult<Vec<(Vec<String>, u64)>> {
        let mut entries = Vec::with_capacity(files_list.len());

        for file_value in files_list {
            let bencode_rs::Value::Dictionary(file_dict) = file_value else {
                return Err(TorrentError::InvalidTorrentFile {
                    reason: "Invalid file entry type".to_string(),
                });
            };

            let length = Self::non_negative(Self::extract_integer(file_dict, b"length")?)?;

            let Some(bencode_rs::Value::List(path_list)) = file_dict.get(b"path".as_slice()) else {
                return Err(TorrentError::InvalidTorrentFile {
                    reason: "Missing or invalid path in file".to_string(),
                });
            };

            let mut path = vec![name.to_string()];
            for component in path_list {
                let bencode_rs::Value::Bytes(component) = component else {
                    return Err(TorrentError::InvalidTorrentFile {
                        reason: "Invalid path component type".to_string(),
                    });
                };
                let component = String::from_utf8(component.to_vec()).map_err(|_| {
                    TorrentError::InvalidTorrentFile {
                        reason: "Invalid UTF-8 in file path".to_string(),
                    }
                })?;
                if component.is_empty() || component == ".." || component.contains('/') {
                    return Err(TorrentError::InvalidTorrentFile {
                        reason: format!("Unsafe path component {component:?}"),
                    });
                }
                path.push(component);
            }

            entries.push((path, length));
        }

        Ok(entries)
    }

    /// Announce URL plus every tier of `announce-list`, deduplicated.
    fn extract_announce_urls(dict: &BencodeDict<'_>) -> Vec<String> {
        let mut announce_urls = Vec::new();

        if let Ok(announce) = Self::extract_bytes_as_string(dict, b"announce") {
            announce_urls.push(announce);
        }

        if let Some(bencode_rs::Value::List(announce_list)) = dict.get(b"announce-list".as_slice())
        {
            for tier in announce_list {
                let bencode_rs::Value::List(tier_urls) = tier else {
                    continue;
                };
                for url_value in tier_urls {
                    if let bencode_rs::Value::Bytes(url_bytes) = url_value
                        && let Ok(url) = String::from_utf8(url_bytes.to_vec())
                        && !announce_urls.contains(&url)
                    {
                        announce_urls.push(url);
                    }
                }
            }
        }

        announce_urls
    }
}
