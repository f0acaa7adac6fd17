//! Per-peer download and upload loop.

use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use sha1::{Digest, Sha1};
use tokio::sync::{OwnedSemaphorePermit, broadcast};
use tokio::time::Instant;

use super::SessionShared;
use super::peer::PeerChannel;
use crate::storage::StorageError;
use crate::torrent::protocol::extension::{
    EXTENSION_HANDSHAKE_ID, LOCAL_UT_METADATA_ID, METADATA_BLOCK_SIZE,
};
use crate::torrent::protocol::{Bitfield, ExtensionHandshake, MetadataMessage, PeerMessage};
use crate::torrent::{PieceIndex, TorrentError};

/// How often an idle unchoked worker retries the picker.
const REPICK_INTERVAL: Duration = Duration::from_millis(100);

/// Largest block we serve to a requesting peer.
const MAX_SERVED_BLOCK: u32 = 128 * 1024;

/// A piece being assembled from blocks.
#[derive(Debug)]
struct PieceDownload {
    index: PieceIndex,
    size: u32,
    block_size: u32,
    buffer: BytesMut,
    next_offset: u32,
    outstanding: usize,
    /// One flag per block; repeats of a received block are dropped
    received: Vec<bool>,
    missing: usize,
}

impl PieceDownload {
    fn new(index: PieceIndex, size: u32, block_size: u32) -> Self {
        let blocks = size.div_ceil(block_size) as usize;
        Self {
            index,
            size,
            block_size,
            buffer: BytesMut::zeroed(size as usize),
            next_offset: 0,
            outstanding: 0,
            received: vec![false; blocks],
            missing: blocks,
        }
    }

    /// Copies a block into place and reports whether the piece is whole.
    ///
    /// Blocks we never requested or already hold are ignored.
    ///
    /// # Errors
    /// - `TorrentError::ProtocolError` - Block length differs from the request
    fn accept(&mut self, offset: u32, data: &[u8]) -> Result<bool, TorrentError> {
        if offset % self.block_size != 0 || offset >= self.next_offset {
            return Ok(false);
        }
        let Some(seen) = self.received.get_mut((offset / self.block_size) as usize) else {
            return Ok(false);
        };
        if *seen {
            return Ok(false);
        }
        let expected = self.block_size.min(self.size - offset) as usize;
        if data.len() != expected {
            return Err(TorrentError::ProtocolError {
                message: format!(
                    "Block {offset}+{} of piece {} should be {expected} bytes",
                    data.len(),
                    self.index
                ),
            });
        }

        *seen = true;
        let start = offset as usize;
        self.buffer[start..start + expected].copy_from_slice(data);
        self.outstanding = self.outstanding.saturating_sub(1);
        self.missing -= 1;
        Ok(self.missing == 0)
    }
}

enum Event {
    Cancelled,
    TimedOut,
    Repick,
    Completed(Result<PieceIndex, broadcast::error::RecvError>),
    Message(Result<PeerMessage, TorrentError>),
}

/// State of one connection. Dropping it returns claimed pieces and
/// withdraws the peer's availability.
pub(crate) struct PeerWorker {
    shared: Arc<SessionShared>,
    channel: Box<dyn PeerChannel>,
    peer_has: Bitfield,
    reported: bool,
    am_interested: bool,
    interest_dirty: bool,
    peer_choking: bool,
    upload_permit: Option<OwnedSemaphorePermit>,
    peer_metadata_id: Option<u8>,
    download: Option<PieceDownload>,
    served_piece: Option<(PieceIndex, Bytes)>,
    completions: broadcast::Receiver<PieceIndex>,
}

impl PeerWorker {
    pub(crate) fn new(shared: Arc<SessionShared>, channel: Box<dyn PeerChannel>) -> Self {
        let piece_count = shared.metadata.piece_count();
        shared.stats.peer_connected();
        let completions = shared.completions.subscribe();
        Self {
            shared,
            channel,
            peer_has: Bitfield::new(piece_count),
            reported: false,
            am_interested: false,
            interest_dirty: true,
            peer_choking: true,
            upload_permit: None,
            peer_metadata_id: None,
            download: None,
            served_piece: None,
            completions,
        }
    }

    /// Runs until the peer disconnects, misbehaves, times out or the session
    /// is cancelled.
    ///
    /// # Errors
    /// - `TorrentError::PeerConnectionError` - Connection lost or timed out
    /// - `TorrentError::PieceHashMismatch` - Peer sent corrupt data
    /// - `TorrentError::ProtocolError` - Peer violated the wire protocol
    pub(crate) async fn run(mut self) -> Result<(), TorrentError> {
        self.greet().await?;

        let cancel = self.shared.cancel.clone();
        let mut last_heard = Instant::now();
        loop {
            self.fill_requests().await?;
            self.update_interest().await?;

            let patience = if self.download.is_some() {
                self.shared.torrent_config.piece_timeout
            } else {
                self.shared.network_config.peer_idle_timeout
            };
            let idle_unchoked = self.download.is_none() && !self.peer_choking;

            let event = tokio::select! {
                _ = cancel.cancelled() => Event::Cancelled,
                _ = tokio::time::sleep_until(last_heard + patience) => Event::TimedOut,
                _ = tokio::time::sleep(REPICK_INTERVAL), if idle_unchoked => Event::Repick,
                completed = self.completions.recv() => Event::Completed(completed),
                received = self.channel.recv() => Event::Message(received),
            };

            match event {
                Event::Cancelled => return Ok(()),
                Event::TimedOut => {
                    return Err(TorrentError::PeerConnectionError {
                        reason: format!("{} went silent", self.channel.address()),
                    });
                }
                Event::Repick | Event::Completed(Err(_)) => {}
                Event::Completed(Ok(index)) => {
                    if !self.peer_has.has(index) {
                        self.channel
                            .send(PeerMessage::Have { piece_index: index })
                            .await?;
                    }
                }
                Event::Message(received) => {
                    last_heard = Instant::now();
                    self.handle_message(received?).await?;
                }
            }
        }
    }

    async fn greet(&mut self) -> Result<(), TorrentError> {
        if self.channel.supports_extensions() {
            let size = self.shared.metadata.info_bytes.len() as u64;
            self.channel
                .send(PeerMessage::Extended {
                    extended_id: EXTENSION_HANDSHAKE_ID,
                    payload: ExtensionHandshake::local(Some(size)).encode(),
                })
                .await?;
        }
        if self.shared.store.completed_count() > 0 {
            let bitfield = self.shared.store.bitfield().to_bytes();
            self.channel.send(PeerMessage::Bitfield { bitfield }).await?;
        }
        Ok(())
    }

    async fn handle_message(&mut self, message: PeerMessage) -> Result<(), TorrentError> {
        match message {
            PeerMessage::KeepAlive | PeerMessage::Cancel { .. } | PeerMessage::Port { .. } => {}
            PeerMessage::Choke => {
                self.peer_choking = true;
                if let Some(download) = self.download.take() {
                    self.shared.picker.lock().release(download.index);
                }
            }
            PeerMessage::Unchoke => self.peer_choking = false,
            PeerMessage::Interested => {
                if self.upload_permit.is_none()
                    && let Ok(permit) = Arc::clone(&self.shared.upload_slots).try_acquire_owned()
                {
                    self.upload_permit = Some(permit);
                    self.channel.send(PeerMessage::Unchoke).await?;
                }
            }
            PeerMessage::NotInterested => {
                if self.upload_permit.take().is_some() {
                    self.channel.send(PeerMessage::Choke).await?;
                }
            }
            PeerMessage::Have { piece_index } => {
                self.mark_reported();
                if piece_index.as_u32() < self.peer_has.len() && self.peer_has.set(piece_index) {
                    self.shared.availability.add_piece(piece_index);
                    self.interest_dirty = true;
                }
            }
            PeerMessage::Bitfield { bitfield } => {
                let advertised = Bitfield::from_wire(&bitfield, self.peer_has.len())?;
                self.mark_reported();
                for index in advertised.iter_set() {
                    if self.peer_has.set(index) {
                        self.shared.availability.add_piece(index);
                    }
                }
                self.interest_dirty = true;
            }
            PeerMessage::Request {
                piece_index,
                offset,
                length,
            } => self.serve_block(piece_index, offset, length).await?,
            PeerMessage::Piece {
                piece_index,
                offset,
                data,
            } => self.receive_block(piece_index, offset, data).await?,
            PeerMessage::Extended {
                extended_id,
                payload,
            } => self.handle_extended(extended_id, payload).await?,
        }
        Ok(())
    }

    fn mark_reported(&mut self) {
        if !self.reported {
            self.reported = true;
            self.shared.availability.peer_reported();
        }
    }

    async fn update_interest(&mut self) -> Result<(), TorrentError> {
        if !self.interest_dirty {
            return Ok(());
        }
        self.interest_dirty = false;

        let wanted = self
            .shared
            .picker
            .lock()
            .wants_any(&self.peer_has, &self.shared.store);
        if wanted != self.am_interested {
            self.am_interested = wanted;
            let message = if wanted {
                PeerMessage::Interested
            } else {
                PeerMessage::NotInterested
            };
            self.channel.send(message).await?;
        }
        Ok(())
    }

    /// Claims a piece if idle and keeps the block pipeline full.
    async fn fill_requests(&mut self) -> Result<(), TorrentError> {
        if self.peer_choking || !self.am_interested {
            return Ok(());
        }

        if self.download.is_none() {
            let picked = self
                .shared
                .picker
                .lock()
                .pick(&self.peer_has, &self.shared.store);
            let Some(index) = picked else {
                self.interest_dirty = true;
                return Ok(());
            };
            let size = self.shared.metadata.piece_size(index);
            let block_size = self.shared.torrent_config.block_size;
            self.download = Some(PieceDownload::new(index, size, block_size));
        }

        let depth = self.shared.torrent_config.pipeline_depth;
        let Some(download) = self.download.as_mut() else {
            return Ok(());
        };
        while download.outstanding < depth && download.next_offset < download.size {
            let length = download.block_size.min(download.size - download.next_offset);
            self.channel
                .send(PeerMessage::Request {
                    piece_index: download.index,
                    offset: download.next_offset,
                    length,
                })
                .await?;
            download.next_offset += length;
            download.outstanding += 1;
        }
        Ok(())
    }

    async fn receive_block(
        &mut self,
        index: PieceIndex,
        offset: u32,
        data: Bytes,
    ) -> Result<(), TorrentError> {
        let Some(download) = self.download.as_mut() else {
            return Ok(());
        };
        if download.index != index {
            return Ok(());
        }
        if !download.accept(offset, &data)? {
            return Ok(());
        }

        if let Some(download) = self.download.take() {
            self.finish_piece(download).await?;
        }
        Ok(())
    }

    async fn finish_piece(&mut self, download: PieceDownload) -> Result<(), TorrentError> {
        let index = download.index;
        let expected = self.shared.metadata.piece_hashes[index.as_usize()];
        if Sha1::digest(&download.buffer).as_slice() != expected {
            self.shared.picker.lock().release(index);
            tracing::warn!(
                info_hash = %self.shared.info_hash,
                piece = index.as_u32(),
                peer = %self.channel.address(),
                "Piece failed verification"
            );
            return Err(TorrentError::PieceHashMismatch { index });
        }

        match self.shared.store.write_piece(index, &download.buffer).await {
            Ok(()) => {}
            Err(StorageError::Closed { .. }) => return Ok(()),
            Err(e) => {
                self.shared.picker.lock().release(index);
                return Err(e.into());
            }
        }
        self.shared.picker.lock().complete(index);
        self.shared.stats.add_downloaded(u64::from(download.size));
        self.shared.record_progress();
        let _ = self.shared.completions.send(index);
        self.interest_dirty = true;
        tracing::debug!(
            info_hash = %self.shared.info_hash,
            piece = index.as_u32(),
            peer = %self.channel.address(),
            "Piece verified"
        );
        Ok(())
    }

    async fn serve_block(
        &mut self,
        index: PieceIndex,
        offset: u32,
        length: u32,
    ) -> Result<(), TorrentError> {
        if self.upload_permit.is_none()
            || length > MAX_SERVED_BLOCK
            || !self.shared.store.is_complete(index)
        {
            return Ok(());
        }

        let piece = match &self.served_piece {
            Some((cached, data)) if *cached == index => data.clone(),
            _ => {
                let data = self.shared.store.read_piece(index).await?;
                self.served_piece = Some((index, data.clone()));
                data
            }
        };
        let end = offset as usize + length as usize;
        if end > piece.len() {
            return Ok(());
        }

        self.channel
            .send(PeerMessage::Piece {
                piece_index: index,
                offset,
                data: piece.slice(offset as usize..end),
            })
            .await?;
        self.shared.stats.add_uploaded(u64::from(length));
        Ok(())
    }

    async fn handle_extended(&mut self, extended_id: u8, payload: Bytes) -> Result<(), TorrentError> {
        if extended_id == EXTENSION_HANDSHAKE_ID {
            let handshake = ExtensionHandshake::decode(&payload)?;
            self.peer_metadata_id = handshake.ut_metadata;
            return Ok(());
        }
        if extended_id != LOCAL_UT_METADATA_ID {
            return Ok(());
        }
        let Some(reply_id) = self.peer_metadata_id else {
            return Ok(());
        };

        if let MetadataMessage::Request { piece } = MetadataMessage::decode(&payload)? {
            let info = &self.shared.metadata.info_bytes;
            let start = piece as usize * METADATA_BLOCK_SIZE;
            let reply = if start < info.len() {
                let end = (start + METADATA_BLOCK_SIZE).min(info.len());
                MetadataMessage::Data {
                    piece,
                    total_size: info.len() as u64,
                    data: info.slice(start..end),
                }
            } else {
                MetadataMessage::Reject { piece }
            };
            self.channel
                .send(PeerMessage::Extended {
                    extended_id: reply_id,
                    payload: reply.encode(),
                })
                .await?;
        }
        Ok(())
    }
}

impl Drop for PeerWorker {
    fn drop(&mut self) {
        if let Some(download) = self.download.take() {
            self.shared.picker.lock().release(download.index);
        }
        self.shared
            .availability
            .remove_peer(&self.peer_has, self.reported);
        self.shared.stats.peer_disconnected();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_repeated_block_does_not_complete_piece() {
        let mut download = PieceDownload::new(PieceIndex::new(3), 40, 16);
        download.next_offset = 40;
        download.outstanding = 3;

        assert!(!download.accept(0, &[1; 16]).unwrap());
        assert!(!download.accept(0, &[1; 16]).unwrap());
        assert!(!download.accept(16, &[2; 16]).unwrap());
        assert_eq!(download.missing, 1);
        assert!(download.accept(32, &[3; 8]).unwrap());
        assert_eq!(&download.buffer[..16], &[1; 16]);
        assert_eq!(&download.buffer[32..], &[3; 8]);
        assert_eq!(download.outstanding, 0);
    }

    #[test]
    fn test_unrequested_or_misaligned_blocks_are_ignored() {
        let mut download = PieceDownload::new(PieceIndex::new(0), 32, 16);
        download.next_offset = 16;

        assert!(!download.accept(16, &[0; 16]).unwrap());
        assert!(!download.accept(8, &[0; 8]).unwrap());
        assert_eq!(download.missing, 2);
        assert!(matches!(
            download.accept(0, &[0; 20]),
            Err(TorrentError::ProtocolError { .. })
        ));
    }
}
