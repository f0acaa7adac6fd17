//! Piece completion arena and on-disk layout for one torrent.
//!
//! Completion state is one `AtomicU8` per piece. Readers never take a lock;
//! the single writer path (verified piece writes) is serialized by an async
//! mutex. A piece's bytes are only readable after its writer flipped it to
//! `Complete`, so readers can never observe a partial write.

use std::ops::Range;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU32, Ordering};

use bytes::{Bytes, BytesMut};
use tokio::fs::{self, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt, SeekFrom};
use tokio::sync::{Mutex, Notify};

use super::StorageError;
use crate::torrent::protocol::Bitfield;
use crate::torrent::{InfoHash, PieceIndex, TorrentMetadata};

/// Download state of a single piece.
///
/// States only move forward: `Missing` -> `Requested` -> `Complete`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum PieceStatus {
    Missing = 0,
    Requested = 1,
    Complete = 2,
}

impl PieceStatus {
    fn from_raw(raw: u8) -> Self {
        match raw {
            0 => Self::Missing,
            1 => Self::Requested,
            _ => Self::Complete,
        }
    }
}

/// A contiguous run of payload bytes inside one file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Segment {
    file_index: usize,
    file_offset: u64,
    length: usize,
}

/// Completion bitfield and disk layout of one torrent.
pub struct PieceStore {
    metadata: Arc<TorrentMetadata>,
    download_dir: PathBuf,
    states: Box<[AtomicU8]>,
    completed: AtomicU32,
    completion: Notify,
    closed: AtomicBool,
    write_lock: Mutex<()>,
}

impl std::fmt::Debug for PieceStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PieceStore")
            .field("info_hash", &self.metadata.info_hash)
            .field("completed", &self.completed_count())
            .field("pieces", &self.piece_count())
            .finish()
    }
}

impl PieceStore {
    /// Creates an empty store; no files are touched until the first write.
    pub fn new(metadata: Arc<TorrentMetadata>, download_dir: impl Into<PathBuf>) -> Self {
        let states = (0..metadata.piece_count())
            .map(|_| AtomicU8::new(PieceStatus::Missing as u8))
            .collect();
        Self {
            metadata,
            download_dir: download_dir.into(),
            states,
            completed: AtomicU32::new(0),
            completion: Notify::new(),
            closed: AtomicBool::new(false),
            write_lock: Mutex::new(()),
        }
    }

    /// Torrent this store belongs to.
    pub fn info_hash(&self) -> InfoHash {
        self.metadata.info_hash
    }

    /// Layout the store was built from.
    pub fn metadata(&self) -> &Arc<TorrentMetadata> {
        &self.metadata
    }

    /// Total number of pieces.
    pub fn piece_count(&self) -> u32 {
        self.states.len() as u32
    }

    /// Number of pieces verified and written.
    pub fn completed_count(&self) -> u32 {
        self.completed.load(Ordering::Acquire)
    }

    /// Whether every piece is complete.
    pub fn is_finished(&self) -> bool {
        self.completed_count() == self.piece_count()
    }

    /// Current status of `index`; out-of-range indices read as `Missing`.
    pub fn status(&self, index: PieceIndex) -> PieceStatus {
        self.states
            .get(index.as_usize())
            .map(|state| PieceStatus::from_raw(state.load(Ordering::Acquire)))
            .unwrap_or(PieceStatus::Missing)
    }

    /// Whether `index` is complete and readable.
    pub fn is_complete(&self, index: PieceIndex) -> bool {
        self.status(index) == PieceStatus::Complete
    }

    /// Whether every piece in `pieces` is complete.
    pub fn range_complete(&self, pieces: Range<u32>) -> bool {
        pieces.into_iter().all(|p| self.is_complete(PieceIndex::new(p)))
    }

    /// First piece in `pieces` that is not complete.
    pub fn first_incomplete(&self, pieces: Range<u32>) -> Option<PieceIndex> {
        pieces
            .into_iter()
            .map(PieceIndex::new)
            .find(|index| !self.is_complete(*index))
    }

    /// Number of complete pieces within `pieces`.
    pub fn completed_in(&self, pieces: Range<u32>) -> u32 {
        pieces
            .into_iter()
            .filter(|p| self.is_complete(PieceIndex::new(*p)))
            .count() as u32
    }

    /// Snapshot of completed pieces in wire form.
    pub fn bitfield(&self) -> Bitfield {
        let mut bitfield = Bitfield::new(self.piece_count());
        for index in 0..self.piece_count() {
            let index = PieceIndex::new(index);
            if self.is_complete(index) {
                bitfield.set(index);
            }
        }
        bitfield
    }

    /// Records that `index` has been asked of a peer.
    ///
    /// Returns true on the `Missing` -> `Requested` transition only; a piece
    /// that was already requested or completed keeps its state.
    pub fn mark_requested(&self, index: PieceIndex) -> bool {
        self.states.get(index.as_usize()).is_some_and(|state| {
            state
                .compare_exchange(
                    PieceStatus::Missing as u8,
                    PieceStatus::Requested as u8,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
        })
    }

    /// Whether the owning session has closed this store.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Rejects further writes and wakes every waiter with `Closed`.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.completion.notify_waiters();
        }
    }

    /// Writes a verified piece and publishes it as complete.
    ///
    /// Writing an already complete piece is a no-op.
    ///
    /// # Errors
    ///
    /// - `StorageError::Closed` - The session was closed
    /// - `StorageError::PieceOutOfRange` - Index beyond the torrent
    /// - `StorageError::PieceSizeMismatch` - Data length differs from the piece size
    /// - `StorageError::Io` - Disk write failed
    pub async fn write_piece(&self, index: PieceIndex, data: &[u8]) -> Result<(), StorageError> {
        let state = self.state(index)?;
        let expected = self.metadata.piece_size(index);
        if data.len() != expected as usize {
            return Err(StorageError::PieceSizeMismatch {
                index,
                expected,
                actual: data.len(),
            });
        }

        let _guard = self.write_lock.lock().await;
        self.ensure_open()?;
        if PieceStatus::from_raw(state.load(Ordering::Acquire)) == PieceStatus::Complete {
            return Ok(());
        }

        let mut written = 0usize;
        for segment in self.segments(self.metadata.piece_offset(index), data.len()) {
            let path = self.file_path(segment.file_index)?;
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).await?;
            }
            let mut file = OpenOptions::new()
                .create(true)
                .truncate(false)
                .write(true)
                .open(&path)
                .await?;
            file.seek(SeekFrom::Start(segment.file_offset)).await?;
            file.write_all(&data[written..written + segment.length])
                .await?;
            file.flush().await?;
            written += segment.length;
        }

        let previous = state.fetch_max(PieceStatus::Complete as u8, Ordering::AcqRel);
        if previous != PieceStatus::Complete as u8 {
            self.completed.fetch_add(1, Ordering::AcqRel);
        }
        self.completion.notify_waiters();
        tracing::trace!(info_hash = %self.info_hash(), piece = index.as_u32(), "Piece stored");
        Ok(())
    }

    /// Waits until `index` is complete.
    ///
    /// # Errors
    ///
    /// - `StorageError::Closed` - The session closed before the piece landed
    /// - `StorageError::PieceOutOfRange` - Index beyond the torrent
    pub async fn wait_for_piece(&self, index: PieceIndex) -> Result<(), StorageError> {
        self.state(index)?;
        loop {
            let notified = self.completion.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.is_complete(index) {
                return Ok(());
            }
            self.ensure_open()?;
            notified.await;
        }
    }

    /// Reads `length` bytes of `file_index` starting at `offset`.
    ///
    /// Every piece overlapping the range must already be complete.
    ///
    /// # Errors
    ///
    /// - `StorageError::FileNotFound` - Unknown file index
    /// - `StorageError::InvalidRange` - Range extends past the end of the file
    /// - `StorageError::PieceNotReady` - A covering piece is not complete
    /// - `StorageError::Io` - Disk read failed
    pub async fn read_file_range(
        &self,
        file_index: usize,
        offset: u64,
        length: u64,
    ) -> Result<Bytes, StorageError> {
        let file = self
            .metadata
            .files
            .get(file_index)
            .ok_or(StorageError::FileNotFound { file_index })?;
        if offset.checked_add(length).is_none_or(|end| end > file.length) {
            return Err(StorageError::InvalidRange {
                file_index,
                offset,
                length,
            });
        }
        if length == 0 {
            return Ok(Bytes::new());
        }

        let pieces = file.pieces_for_bytes(offset, length, self.metadata.piece_length);
        if let Some(index) = self.first_incomplete(pieces) {
            return Err(StorageError::PieceNotReady { index });
        }

        let mut buf = BytesMut::zeroed(length as usize);
        self.read_file_bytes(file_index, offset, &mut buf).await?;
        Ok(buf.freeze())
    }

    /// Reads a whole complete piece, used to serve peer requests.
    ///
    /// # Errors
    ///
    /// - `StorageError::PieceNotReady` - Piece is not complete
    /// - `StorageError::PieceOutOfRange` - Index beyond the torrent
    /// - `StorageError::Io` - Disk read failed
    pub async fn read_piece(&self, index: PieceIndex) -> Result<Bytes, StorageError> {
        self.state(index)?;
        if !self.is_complete(index) {
            return Err(StorageError::PieceNotReady { index });
        }

        let size = self.metadata.piece_size(index) as usize;
        let mut buf = BytesMut::zeroed(size);
        let mut filled = 0usize;
        for segment in self.segments(self.metadata.piece_offset(index), size) {
            self.read_file_bytes(
                segment.file_index,
                segment.file_offset,
                &mut buf[filled..filled + segment.length],
            )
            .await?;
            filled += segment.length;
        }
        Ok(buf.freeze())
    }

    /// On-disk location of `file_index`.
    ///
    /// # Errors
    ///
    /// - `StorageError::FileNotFound` - Unknown file index
    pub fn file_path(&self, file_index: usize) -> Result<PathBuf, StorageError> {
        let file = self
            .metadata
            .files
            .get(file_index)
            .ok_or(StorageError::FileNotFound { file_index })?;
        let mut path = self.download_dir.clone();
        for component in &file.path {
            path.push(sanitize_component(component));
        }
        Ok(path)
    }

    /// Removes every file of the torrent from disk.
    ///
    /// Takes the writer lock so no piece write is in progress while files are
    /// removed. Missing files are ignored.
    ///
    /// # Errors
    ///
    /// - `StorageError::Io` - A file could not be removed
    pub async fn delete_data(&self) -> Result<(), StorageError> {
        let _guard = self.write_lock.lock().await;
        for file_index in 0..self.metadata.files.len() {
            let path = self.file_path(file_index)?;
            match fs::remove_file(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }

        if self.metadata.files.len() > 1 {
            let root = self.download_dir.join(sanitize_component(&self.metadata.name));
            match fs::remove_dir_all(&root).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        // Only succeeds when nothing else was written next to the torrent.
        let _ = fs::remove_dir(&self.download_dir).await;
        tracing::info!(info_hash = %self.info_hash(), "Deleted torrent data");
        Ok(())
    }

    async fn read_file_bytes(
        &self,
        file_index: usize,
        offset: u64,
        buf: &mut [u8],
    ) -> Result<(), StorageError> {
        let path = self.file_path(file_index)?;
        let mut file = fs::File::open(&path).await?;
        file.seek(SeekFrom::Start(offset)).await?;
        file.read_exact(buf).await?;
        Ok(())
    }

    fn state(&self, index: PieceIndex) -> Result<&AtomicU8, StorageError> {
        self.states
            .get(index.as_usize())
            .ok_or(StorageError::PieceOutOfRange { index })
    }

    fn ensure_open(&self) -> Result<(), StorageError> {
        if self.is_closed() {
            Err(StorageError::Closed {
                info_hash: self.info_hash(),
            })
        } else {
            Ok(())
        }
    }

    /// Splits an absolute payload range into per-file segments.
    fn segments(&self, start: u64, length: usize) -> Vec<Segment> {
        let end = start + length as u64;
        self.metadata
            .files
            .iter()
            .filter(|file| file.length > 0)
            .filter(|file| file.offset < end && file.offset + file.length > start)
            .map(|file| {
                let seg_start = start.max(file.offset);
                let seg_end = end.min(file.offset + file.length);
                Segment {
                    file_index: file.index,
                    file_offset: seg_start - file.offset,
                    length: (seg_end - seg_start) as usize,
                }
            })
            .collect()
    }
}

/// Keeps a path component inside the download directory.
fn sanitize_component(component: &str) -> PathBuf {
    let cleaned: String = component
        .chars()
        .map(|c| if matches!(c, '/' | '\\' | '\0') { '_' } else { c })
        .collect();
    match Path::new(&cleaned).components().next() {
        Some(Component::Normal(_)) => PathBuf::from(cleaned),
        _ => PathBuf::from("_"),
    }
}
