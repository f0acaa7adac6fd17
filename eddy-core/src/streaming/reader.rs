//! Piece-gated sequential reader over one file of a torrent.

use std::time::Duration;

use bytes::Bytes;
use futures::Stream;

use super::StreamingError;
use super::range::ByteRange;
use crate::config::StreamingConfig;
use crate::scheduler::EscalationGuard;
use crate::torrent::{PieceIndex, SessionState, TorrentError, TorrentHandle};

/// Yields a byte range chunk by chunk, waiting for each piece to complete.
///
/// Chunks never cross a piece boundary, so every chunk comes from pieces
/// that were verified before it was read. While waiting, the pieces ahead
/// of the cursor are escalated; the escalation moves with the cursor and is
/// released when the reader is dropped.
pub struct FileStreamReader {
    handle: TorrentHandle,
    file_index: usize,
    position: u64,
    end: u64,
    chunk_size: u64,
    wait_timeout: Duration,
    escalation_bytes: u64,
    escalation: Option<EscalationGuard>,
}

impl FileStreamReader {
    /// Creates a reader for `range` of a file.
    ///
    /// # Errors
    /// - `TorrentError::FileNotFound` - Unknown file index
    pub fn new(
        handle: TorrentHandle,
        file_index: usize,
        range: ByteRange,
        config: &StreamingConfig,
    ) -> Result<Self, TorrentError> {
        let file_length = handle.metadata().file(file_index)?.length;
        Ok(Self {
            handle,
            file_index,
            position: range.start,
            end: range.end.saturating_add(1).min(file_length),
            chunk_size: config.chunk_size.max(1) as u64,
            wait_timeout: config.wait_timeout,
            escalation_bytes: config.escalation_bytes,
            escalation: None,
        })
    }

    /// Bytes not yet yielded.
    pub fn remaining(&self) -> u64 {
        self.end.saturating_sub(self.position)
    }

    /// Next chunk, or `None` once the range is exhausted.
    ///
    /// # Errors
    /// - `StreamingError::WaitTimeout` - The next piece did not arrive in time
    /// - `StreamingError::Torrent` - The session closed or stalled
    pub async fn next_chunk(&mut self) -> Result<Option<Bytes>, StreamingError> {
        if self.position >= self.end {
            self.escalation = None;
            return Ok(None);
        }

        let metadata = self.handle.metadata();
        let file = metadata.file(self.file_index)?;
        let Some(piece) = file.piece_at(self.position, metadata.piece_length) else {
            return Ok(None);
        };
        let piece_end = metadata.piece_offset(piece) + u64::from(metadata.piece_size(piece));
        let chunk_end = (piece_end - file.offset)
            .min(self.end)
            .min(self.position + self.chunk_size);

        if !self.handle.store().is_complete(piece) {
            self.escalate_from(piece)?;
            self.wait_for(piece).await?;
        }

        let length = chunk_end - self.position;
        let bytes = self
            .handle
            .store()
            .read_file_range(self.file_index, self.position, length)
            .await
            .map_err(|e| self.handle.closed_or(e))?;
        self.position = chunk_end;
        Ok(Some(bytes))
    }

    /// Converts the reader into a body stream that ends after the first error.
    pub fn into_stream(self) -> impl Stream<Item = Result<Bytes, StreamingError>> + Send {
        futures::stream::unfold(Some(self), |reader| async move {
            let mut reader = reader?;
            match reader.next_chunk().await {
                Ok(Some(chunk)) => Some((Ok(chunk), Some(reader))),
                Ok(None) => None,
                Err(e) => Some((Err(e), None)),
            }
        })
    }

    fn escalate_from(&mut self, piece: PieceIndex) -> Result<(), TorrentError> {
        let covered = self
            .escalation
            .as_ref()
            .is_some_and(|guard| guard.pieces().contains(&piece.as_u32()));
        if covered {
            return Ok(());
        }
        let length = self.escalation_bytes.max(1).min(self.end - self.position);
        // Replacing the guard releases the pieces behind the cursor.
        self.escalation = Some(self.handle.scheduler().escalate(
            self.file_index,
            self.position,
            length,
        )?);
        Ok(())
    }

    async fn wait_for(&self, piece: PieceIndex) -> Result<(), StreamingError> {
        match tokio::time::timeout(self.wait_timeout, self.handle.wait_for_piece(piece)).await {
            Ok(result) => result.map_err(StreamingError::from),
            Err(_) if self.handle.state() == SessionState::Stalled => {
                Err(StreamingError::Torrent(TorrentError::SwarmStalled {
                    info_hash: self.handle.info_hash(),
                }))
            }
            Err(_) => {
                tracing::debug!(
                    info_hash = %self.handle.info_hash(),
                    piece = piece.as_u32(),
                    "Timed out waiting for piece"
                );
                Err(StreamingError::WaitTimeout {
                    index: piece,
                    waited: self.wait_timeout,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use futures::StreamExt;

    use super::*;
    use crate::config::EddyConfig;
    use crate::torrent::PiecePriority;
    use crate::torrent::swarm::simulation::{SimulatedSwarm, SimulatedTorrent, random_content};

    const PIECE: u32 = 16_384;

    fn spawn(torrent: &SimulatedTorrent, swarm: &std::sync::Arc<SimulatedSwarm>, dir: &std::path::Path) -> (TorrentHandle, StreamingConfig) {
        let config = EddyConfig::for_testing().with_data_dir(dir);
        let handle = TorrentHandle::spawn(torrent.metadata.as_ref().clone(), &config, swarm.transport());
        (handle, config.streaming)
    }

    #[tokio::test]
    async fn test_streams_exact_bytes_across_files() {
        let dir = tempfile::tempdir().unwrap();
        let subtitles = random_content(5_000, 20);
        let movie = random_content(6 * PIECE as usize + 77, 21);
        let torrent = SimulatedTorrent::multi_file(
            "show",
            vec![("show.srt", subtitles), ("show.mp4", movie.clone())],
            PIECE,
        );
        let swarm = SimulatedSwarm::new();
        swarm.add_torrent(torrent.clone());
        swarm.add_seeder(torrent.info_hash());
        let (handle, mut config) = spawn(&torrent, &swarm, dir.path());
        config.chunk_size = 10_000;

        let range = ByteRange { start: 1_000, end: 70_000 };
        let reader = FileStreamReader::new(handle.clone(), 1, range, &config).unwrap();
        assert_eq!(reader.remaining(), range.len());

        let chunks: Vec<Bytes> = reader
            .into_stream()
            .map(|chunk| chunk.unwrap())
            .collect()
            .await;
        assert!(chunks.iter().all(|chunk| chunk.len() <= 10_000));
        let body: Vec<u8> = chunks.concat();
        assert_eq!(body.as_slice(), &movie[1_000..=70_000]);
        handle.close(false).await.unwrap();
    }

    #[tokio::test]
    async fn test_waiting_escalates_then_releases() {
        let dir = tempfile::tempdir().unwrap();
        let content = random_content(8 * PIECE as usize, 22);
        let torrent = SimulatedTorrent::single_file("a.mp4", content.clone(), PIECE);
        let swarm = SimulatedSwarm::new();
        swarm.add_torrent(torrent.clone());
        let (handle, mut config) = spawn(&torrent, &swarm, dir.path());
        config.escalation_bytes = 2 * u64::from(PIECE);

        let start = 5 * u64::from(PIECE);
        let range = ByteRange { start, end: start + 99 };
        let mut reader = FileStreamReader::new(handle.clone(), 0, range, &config).unwrap();
        let pending = tokio::spawn(async move {
            let chunk = reader.next_chunk().await;
            (chunk, reader)
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(handle.scheduler().planned_priority(5), Some(PiecePriority::Critical));

        swarm.add_seeder(torrent.info_hash());
        let (chunk, reader) = pending.await.unwrap();
        assert_eq!(chunk.unwrap().unwrap().as_ref(), &content[start as usize..start as usize + 100]);

        drop(reader);
        assert_eq!(handle.scheduler().planned_priority(5), Some(PiecePriority::Normal));
        handle.close(false).await.unwrap();
    }

    #[tokio::test]
    async fn test_times_out_without_peers() {
        let dir = tempfile::tempdir().unwrap();
        let torrent = SimulatedTorrent::single_file("a.mp4", random_content(2 * PIECE as usize, 23), PIECE);
        let swarm = SimulatedSwarm::new();
        swarm.add_torrent(torrent.clone());
        let (handle, mut config) = spawn(&torrent, &swarm, dir.path());
        config.wait_timeout = Duration::from_millis(100);

        let range = ByteRange::full(2 * u64::from(PIECE)).unwrap();
        let mut reader = FileStreamReader::new(handle.clone(), 0, range, &config).unwrap();
        assert!(matches!(
            reader.next_chunk().await,
            Err(StreamingError::WaitTimeout { .. })
        ));
        handle.close(false).await.unwrap();
    }

    #[tokio::test]
    async fn test_close_fails_pending_read() {
        let dir = tempfile::tempdir().unwrap();
        let torrent = SimulatedTorrent::single_file("a.mp4", random_content(2 * PIECE as usize, 24), PIECE);
        let swarm = SimulatedSwarm::new();
        swarm.add_torrent(torrent.clone());
        let (handle, config) = spawn(&torrent, &swarm, dir.path());

        let range = ByteRange::full(2 * u64::from(PIECE)).unwrap();
        let mut reader = FileStreamReader::new(handle.clone(), 0, range, &config).unwrap();
        let pending = tokio::spawn(async move { reader.next_chunk().await });
        tokio::time::sleep(Duration::from_millis(20)).await;

        handle.close(false).await.unwrap();
        assert!(matches!(
            pending.await.unwrap(),
            Err(StreamingError::Torrent(TorrentError::SessionClosed { .. }))
        ));
    }
}
