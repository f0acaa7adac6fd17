//! Core types and structures for torrent parsing

use std::ops::Range;

use bytes::Bytes;

use crate::torrent::{InfoHash, PieceIndex, TorrentError};

/// Complete metadata extracted from a torrent descriptor.
///
/// Contains all information needed to download a torrent including
/// piece hashes, file layout and tracker URLs. The raw info dictionary is
/// kept so the descriptor can be served back to peers and clients.
#[derive(Debug, Clone, PartialEq)]
pub struct TorrentMetadata {
    pub info_hash: InfoHash,
    pub name: String,
    pub piece_length: u32,
    pub piece_hashes: Vec<[u8; 20]>,
    pub total_length: u64,
    pub files: Vec<FileEntry>,
    pub announce_urls: Vec<String>,
    pub info_bytes: Bytes,
}

/// Individual file within a torrent.
///
/// `offset` is the byte position of the file inside the concatenated
/// torrent payload, `pieces` the half-open range of pieces overlapping it.
/// Zero-length files have an empty piece range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    pub index: usize,
    pub path: Vec<String>,
    pub length: u64,
    pub offset: u64,
    pub pieces: Range<u32>,
}

impl FileEntry {
    /// Joined path used for display and for the on-disk location.
    pub fn display_path(&self) -> String {
        self.path.join("/")
    }

    /// Last path component, the name a player would show.
    pub fn file_name(&self) -> &str {
        self.path.last().map(String::as_str).unwrap_or_default()
    }

    /// First piece overlapping the file, if the file has any bytes.
    pub fn first_piece(&self) -> Option<PieceIndex> {
        (!self.pieces.is_empty()).then_some(PieceIndex::new(self.pieces.start))
    }

    /// Last piece overlapping the file, if the file has any bytes.
    pub fn last_piece(&self) -> Option<PieceIndex> {
        (!self.pieces.is_empty()).then(|| PieceIndex::new(self.pieces.end - 1))
    }

    /// Global piece index holding `byte_offset` of this file.
    ///
    /// Offsets past the end of the file clamp to the file's last piece.
    /// Returns `None` for zero-length files.
    pub fn piece_at(&self, byte_offset: u64, piece_length: u32) -> Option<PieceIndex> {
        let last = self.last_piece()?;
        let absolute = self.offset.saturating_add(byte_offset);
        let piece = absolute / u64::from(piece_length);
        Some(PieceIndex::new(piece.min(u64::from(last.as_u32())) as u32))
    }

    /// Pieces covering `length` bytes starting at `byte_offset`.
    ///
    /// The range is clamped to the file. Empty when nothing is covered.
    pub fn pieces_for_bytes(&self, byte_offset: u64, length: u64, piece_length: u32) -> Range<u32> {
        if length == 0 || byte_offset >= self.length {
            return 0..0;
        }
        let end_offset = byte_offset.saturating_add(length).min(self.length) - 1;
        match (
            self.piece_at(byte_offset, piece_length),
            self.piece_at(end_offset, piece_length),
        ) {
            (Some(first), Some(last)) => first.as_u32()..last.as_u32() + 1,
            _ => 0..0,
        }
    }
}

impl TorrentMetadata {
    /// Number of pieces in the torrent.
    pub fn piece_count(&self) -> u32 {
        self.piece_hashes.len() as u32
    }

    /// Byte length of `index`; the final piece is usually shorter.
    pub fn piece_size(&self, index: PieceIndex) -> u32 {
        let start = u64::from(index.as_u32()) * u64::from(self.piece_length);
        let remaining = self.total_length.saturating_sub(start);
        remaining.min(u64::from(self.piece_length)) as u32
    }

    /// Absolute payload offset where `index` begins.
    pub fn piece_offset(&self, index: PieceIndex) -> u64 {
        u64::from(index.as_u32()) * u64::from(self.piece_length)
    }

    /// Looks up a file by index.
    ///
    /// # Errors
    /// - `TorrentError::FileNotFound` - Index beyond the file list
    pub fn file(&self, file_index: usize) -> Result<&FileEntry, TorrentError> {
        self.files
            .get(file_index)
            .ok_or(TorrentError::FileNotFound {
                info_hash: self.info_hash,
                file_index,
            })
    }

    /// Builds the file layout for a list of `(path, length)` entries.
    pub(crate) fn layout_files(entries: Vec<(Vec<String>, u64)>, piece_length: u32) -> Vec<FileEntry> {
        let piece_length = u64::from(piece_length);
        let mut offset = 0u64;
        entries
            .into_iter()
            .enumerate()
            .map(|(index, (path, length))| {
                let pieces = if length == 0 {
                    0..0
                } else {
                    let first = offset / piece_length;
                    let last = (offset + length - 1) / piece_length;
                    first as u32..last as u32 + 1
                };
                let entry = FileEntry {
                    index,
                    path,
                    length,
                    offset,
                    pieces,
                };
                offset += length;
                entry
            })
            .collect()
    }
}

/// Magnet link components.
///
/// Parsed magnet URI containing minimal torrent metadata.
/// Contains info hash and optional display name and tracker URLs.
#[derive(Debug, Clone, PartialEq)]
pub struct MagnetLink {
    pub info_hash: InfoHash,
    pub display_name: Option<String>,
    pub trackers: Vec<String>,
}
