//! Playback-driven piece prioritization.
//!
//! Translates playback positions, seeks and blocked reads into piece
//! priority levels. Window updates are last-writer-wins and applied at most
//! once per throttle interval; escalations for blocked reads apply at once.

mod mapping;

use std::collections::HashMap;
use std::ops::Range;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

pub use mapping::window_pieces;
use mapping::{PriorityPlan, diff_runs};

use crate::config::SchedulerConfig;
use crate::torrent::{PiecePriority, TorrentError, TorrentMetadata};

/// Receiver of computed priority changes.
///
/// Implemented by the swarm session; calls must not block.
pub trait PrioritySink: Send + Sync {
    fn set_priority(&self, pieces: Range<u32>, level: PiecePriority);
}

/// Byte window of a file that should be fetched ahead of everything else.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PriorityWindow {
    pub file_index: usize,
    pub byte_offset: u64,
    pub window_bytes: u64,
}

struct PlanState {
    plan: PriorityPlan,
    applied: Vec<PiecePriority>,
    applied_window: Option<PriorityWindow>,
}

struct SchedulerInner {
    metadata: Arc<TorrentMetadata>,
    config: SchedulerConfig,
    sink: Arc<dyn PrioritySink>,
    state: Mutex<PlanState>,
}

impl SchedulerInner {
    /// Recomputes every level and forwards the differences to the sink.
    fn apply(&self, state: &mut PlanState) {
        let target = state.plan.levels(
            &self.metadata,
            self.config.critical_head_pieces,
            self.config.critical_tail_pieces,
        );
        for (pieces, level) in diff_runs(&state.applied, &target) {
            self.sink.set_priority(pieces, level);
        }
        state.applied = target;
    }

    fn apply_window(&self, window: PriorityWindow) {
        let Some(file) = self.metadata.files.get(window.file_index) else {
            return;
        };
        let pieces = window_pieces(
            file,
            self.metadata.piece_length,
            window.byte_offset,
            window.window_bytes,
        );
        let mut state = self.state.lock();
        state.plan.window = Some((window.file_index, pieces.clone()));
        state.applied_window = Some(window);
        self.apply(&mut state);
        tracing::debug!(
            info_hash = %self.metadata.info_hash,
            file_index = window.file_index,
            byte_offset = window.byte_offset,
            first_piece = pieces.start,
            end_piece = pieces.end,
            "Priority window applied"
        );
    }
}

/// Per-torrent priority scheduler.
///
/// Created by the torrent session. Callers report playback positions and
/// seeks; the scheduler keeps the session's piece levels in line with them.
pub struct PriorityScheduler {
    inner: Arc<SchedulerInner>,
    requested: watch::Sender<Option<PriorityWindow>>,
}

impl PriorityScheduler {
    /// Starts the scheduler and its throttled window task.
    ///
    /// The task stops when `cancel` fires or the scheduler is dropped.
    pub fn spawn(
        metadata: Arc<TorrentMetadata>,
        config: SchedulerConfig,
        sink: Arc<dyn PrioritySink>,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        let piece_count = metadata.piece_count() as usize;
        let throttle = config.throttle;
        let inner = Arc::new(SchedulerInner {
            metadata,
            config,
            sink,
            state: Mutex::new(PlanState {
                plan: PriorityPlan::default(),
                applied: vec![PiecePriority::Normal; piece_count],
                applied_window: None,
            }),
        });
        let (requested, mut updates) = watch::channel(None);

        let task_inner = Arc::clone(&inner);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    changed = updates.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
                let window = *updates.borrow_and_update();
                if let Some(window) = window {
                    task_inner.apply_window(window);
                }
                // Updates arriving meanwhile coalesce into the latest one.
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(throttle) => {}
                }
            }
        });

        Arc::new(Self { inner, requested })
    }

    /// Moves the forward window to the playback position.
    ///
    /// # Errors
    /// - `TorrentError::FileNotFound` - File index outside the torrent
    pub fn on_playback_position(&self, file_index: usize, byte_offset: u64) -> Result<(), TorrentError> {
        self.on_seek(
            file_index,
            byte_offset,
            Some(self.inner.config.playback_window_bytes),
        )
    }

    /// Moves the window to a seek target.
    ///
    /// `window_bytes` defaults to the configured seek window. Windows
    /// reaching past the end of the file are clamped.
    ///
    /// # Errors
    /// - `TorrentError::FileNotFound` - File index outside the torrent
    pub fn on_seek(
        &self,
        file_index: usize,
        byte_offset: u64,
        window_bytes: Option<u64>,
    ) -> Result<(), TorrentError> {
        self.inner.metadata.file(file_index)?;
        let window = PriorityWindow {
            file_index,
            byte_offset,
            window_bytes: window_bytes.unwrap_or(self.inner.config.default_seek_window_bytes),
        };
        self.requested.send_replace(Some(window));
        Ok(())
    }

    /// Most recently requested window, applied or not.
    pub fn active_window(&self) -> Option<PriorityWindow> {
        *self.requested.borrow()
    }

    /// Window currently reflected in piece levels.
    pub fn applied_window(&self) -> Option<PriorityWindow> {
        self.inner.state.lock().applied_window
    }

    /// Raises the head and tail pieces of a file so players can read the
    /// container before the playhead moves.
    ///
    /// # Errors
    /// - `TorrentError::FileNotFound` - File index outside the torrent
    pub fn ensure_critical(&self, file_index: usize) -> Result<(), TorrentError> {
        self.inner.metadata.file(file_index)?;
        let mut state = self.inner.state.lock();
        if state.plan.critical_files.insert(file_index) {
            self.inner.apply(&mut state);
        }
        Ok(())
    }

    /// Whether `byte_offset` lies in the tail pieces `ensure_critical` raises.
    ///
    /// Offset zero never counts, so files shorter than the tail still move
    /// the window on a plain read.
    ///
    /// # Errors
    /// - `TorrentError::FileNotFound` - File index outside the torrent
    pub fn in_tail(&self, file_index: usize, byte_offset: u64) -> Result<bool, TorrentError> {
        let file = self.inner.metadata.file(file_index)?;
        let Some(piece) = file.piece_at(byte_offset, self.inner.metadata.piece_length) else {
            return Ok(false);
        };
        let tail_start = file
            .pieces
            .end
            .saturating_sub(self.inner.config.critical_tail_pieces)
            .max(file.pieces.start);
        Ok(byte_offset > 0 && piece.as_u32() >= tail_start)
    }

    /// Makes the pieces under a blocked read `Critical` until the guard drops.
    ///
    /// # Errors
    /// - `TorrentError::FileNotFound` - File index outside the torrent
    pub fn escalate(
        &self,
        file_index: usize,
        byte_offset: u64,
        length: u64,
    ) -> Result<EscalationGuard, TorrentError> {
        let file = self.inner.metadata.file(file_index)?;
        let pieces = file.pieces_for_bytes(byte_offset, length, self.inner.metadata.piece_length);

        let mut state = self.inner.state.lock();
        let mut changed = false;
        for piece in pieces.clone() {
            let count = state.plan.escalations.entry(piece).or_insert(0);
            *count += 1;
            changed |= *count == 1;
        }
        if changed {
            self.inner.apply(&mut state);
        }
        Ok(EscalationGuard {
            inner: Arc::clone(&self.inner),
            pieces,
        })
    }

    /// Pins the base level of `pieces`, applied at once.
    ///
    /// Later windows and escalations still raise pinned pieces to
    /// `Critical`. Pieces past the end of the torrent are ignored.
    pub fn set_manual_priority(&self, pieces: Range<u32>, level: PiecePriority) {
        let piece_count = self.inner.metadata.piece_count();
        let mut state = self.inner.state.lock();
        for piece in pieces.start..pieces.end.min(piece_count) {
            state.plan.manual.insert(piece, level);
        }
        self.inner.apply(&mut state);
        tracing::debug!(
            info_hash = %self.inner.metadata.info_hash,
            first_piece = pieces.start,
            end_piece = pieces.end,
            ?level,
            "Manual priority set"
        );
    }

    /// Level the scheduler last assigned to `index`.
    pub fn planned_priority(&self, index: u32) -> Option<PiecePriority> {
        self.inner.state.lock().applied.get(index as usize).copied()
    }
}

/// Keeps an escalation alive; dropping it releases the pieces.
pub struct EscalationGuard {
    inner: Arc<SchedulerInner>,
    pieces: Range<u32>,
}

impl EscalationGuard {
    pub fn pieces(&self) -> Range<u32> {
        self.pieces.clone()
    }
}

impl Drop for EscalationGuard {
    fn drop(&mut self) {
        let mut state = self.inner.state.lock();
        let escalations: &mut HashMap<u32, usize> = &mut state.plan.escalations;
        let mut changed = false;
        for piece in self.pieces.clone() {
            if let Some(count) = escalations.get_mut(&piece) {
                *count -= 1;
                if *count == 0 {
                    escalations.remove(&piece);
                    changed = true;
                }
            }
        }
        if changed {
            self.inner.apply(&mut state);
        }
    }
}

impl std::fmt::Debug for PriorityScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PriorityScheduler")
            .field("info_hash", &self.inner.metadata.info_hash)
            .field("active_window", &self.active_window())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use super::*;
    use crate::torrent::parsing::{BencodeParser, BencodeValue};

    /// Mirrors levels the way the session's picker would.
    struct RecordingSink {
        levels: Mutex<Vec<PiecePriority>>,
        calls: Mutex<Vec<(Range<u32>, PiecePriority, Instant)>>,
    }

    impl RecordingSink {
        fn new(pieces: usize) -> Arc<Self> {
            Arc::new(Self {
                levels: Mutex::new(vec![PiecePriority::Normal; pieces]),
                calls: Mutex::new(Vec::new()),
            })
        }

        fn level(&self, index: usize) -> PiecePriority {
            self.levels.lock()[index]
        }
    }

    impl PrioritySink for RecordingSink {
        fn set_priority(&self, pieces: Range<u32>, level: PiecePriority) {
            let mut levels = self.levels.lock();
            for piece in pieces.clone() {
                levels[piece as usize] = level;
            }
            self.calls.lock().push((pieces, level, Instant::now()));
        }
    }

    /// Two files of 10 and 30 pieces, 1 KiB pieces.
    fn metadata() -> Arc<TorrentMetadata> {
        let files: Vec<BencodeValue> = [("extras.mkv", 10 * 1024i64), ("movie.mkv", 30 * 1024i64)]
            .into_iter()
            .map(|(name, length)| {
                BencodeValue::dictionary()
                    .with("length", length)
                    .with("path", vec![BencodeValue::from(name)])
            })
            .collect();
        let info = BencodeValue::dictionary()
            .with("name", "show")
            .with("piece length", 1024i64)
            .with("pieces", vec![0u8; 40 * 20])
            .with("files", files)
            .encode();
        Arc::new(BencodeParser::parse_info_dictionary(&info, Vec::new()).unwrap())
    }

    fn config(throttle: Duration) -> SchedulerConfig {
        SchedulerConfig {
            playback_window_bytes: 4 * 1024,
            default_seek_window_bytes: 8 * 1024,
            throttle,
            critical_head_pieces: 2,
            critical_tail_pieces: 1,
        }
    }

    async fn wait_for_window(scheduler: &PriorityScheduler, expected: PriorityWindow) {
        for _ in 0..200 {
            if scheduler.applied_window() == Some(expected) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("window {expected:?} never applied");
    }

    #[tokio::test]
    async fn test_last_window_wins() {
        let sink = RecordingSink::new(40);
        let scheduler = PriorityScheduler::spawn(
            metadata(),
            config(Duration::from_millis(50)),
            sink.clone(),
            CancellationToken::new(),
        );

        scheduler.on_seek(1, 0, Some(2048)).unwrap();
        scheduler.on_seek(1, 10 * 1024, Some(2048)).unwrap();
        scheduler.on_seek(1, 20 * 1024, Some(2048)).unwrap();
        let last = scheduler.active_window().unwrap();
        assert_eq!(last.byte_offset, 20 * 1024);

        wait_for_window(&scheduler, last).await;
        // Movie pieces start at 10; offset 20 KiB is piece 30.
        assert_eq!(sink.level(30), PiecePriority::Critical);
        assert_eq!(sink.level(32), PiecePriority::Critical);
        assert_eq!(sink.level(33), PiecePriority::Normal);
        assert_eq!(sink.level(20), PiecePriority::Low);
        assert_eq!(sink.level(10), PiecePriority::Low);
        assert_eq!(sink.level(5), PiecePriority::Normal);
    }

    #[tokio::test]
    async fn test_window_updates_respect_throttle() {
        let throttle = Duration::from_millis(150);
        let sink = RecordingSink::new(40);
        let scheduler =
            PriorityScheduler::spawn(metadata(), config(throttle), sink.clone(), CancellationToken::new());

        scheduler.on_playback_position(1, 0).unwrap();
        let first = scheduler.active_window().unwrap();
        wait_for_window(&scheduler, first).await;
        let first_applied = sink.calls.lock().last().unwrap().2;

        scheduler.on_playback_position(1, 15 * 1024).unwrap();
        let second = scheduler.active_window().unwrap();
        assert_eq!(second.window_bytes, 4 * 1024);
        wait_for_window(&scheduler, second).await;
        let second_applied = sink.calls.lock().last().unwrap().2;

        assert!(second_applied.duration_since(first_applied) >= throttle);
    }

    #[tokio::test]
    async fn test_escalation_is_immediate_and_released_on_drop() {
        let sink = RecordingSink::new(40);
        let scheduler = PriorityScheduler::spawn(
            metadata(),
            config(Duration::from_secs(60)),
            sink.clone(),
            CancellationToken::new(),
        );

        let guard = scheduler.escalate(1, 5 * 1024, 2048).unwrap();
        assert_eq!(guard.pieces(), 15..17);
        assert_eq!(sink.level(15), PiecePriority::Critical);
        assert_eq!(sink.level(16), PiecePriority::Critical);

        let overlapping = scheduler.escalate(1, 6 * 1024, 1).unwrap();
        drop(guard);
        assert_eq!(sink.level(15), PiecePriority::Normal);
        assert_eq!(sink.level(16), PiecePriority::Critical);

        drop(overlapping);
        assert_eq!(sink.level(16), PiecePriority::Normal);
    }

    #[tokio::test]
    async fn test_ensure_critical_raises_head_and_tail() {
        let sink = RecordingSink::new(40);
        let scheduler = PriorityScheduler::spawn(
            metadata(),
            config(Duration::from_millis(50)),
            sink.clone(),
            CancellationToken::new(),
        );

        scheduler.ensure_critical(1).unwrap();
        assert_eq!(sink.level(10), PiecePriority::High);
        assert_eq!(sink.level(11), PiecePriority::High);
        assert_eq!(sink.level(12), PiecePriority::Normal);
        assert_eq!(sink.level(39), PiecePriority::High);
        assert_eq!(sink.level(9), PiecePriority::Normal);
        assert_eq!(scheduler.planned_priority(39), Some(PiecePriority::High));

        // Repeating is a no-op.
        let calls = sink.calls.lock().len();
        scheduler.ensure_critical(1).unwrap();
        assert_eq!(sink.calls.lock().len(), calls);
    }

    #[tokio::test]
    async fn test_manual_levels_survive_window_moves() {
        let sink = RecordingSink::new(40);
        let scheduler = PriorityScheduler::spawn(
            metadata(),
            config(Duration::from_millis(10)),
            sink.clone(),
            CancellationToken::new(),
        );

        scheduler.set_manual_priority(2..4, PiecePriority::High);
        scheduler.set_manual_priority(12..14, PiecePriority::High);
        assert_eq!(sink.level(2), PiecePriority::High);
        assert_eq!(sink.level(12), PiecePriority::High);

        scheduler.on_seek(1, 2 * 1024, Some(1024)).unwrap();
        let first = scheduler.active_window().unwrap();
        wait_for_window(&scheduler, first).await;
        assert_eq!(sink.level(12), PiecePriority::Critical);
        assert_eq!(sink.level(3), PiecePriority::High);

        scheduler.on_seek(1, 20 * 1024, Some(1024)).unwrap();
        let second = scheduler.active_window().unwrap();
        wait_for_window(&scheduler, second).await;
        // The old window falls back to the pinned level, not Low.
        assert_eq!(sink.level(12), PiecePriority::High);
        assert_eq!(sink.level(13), PiecePriority::High);
        assert_eq!(sink.level(14), PiecePriority::Low);
        assert_eq!(sink.level(30), PiecePriority::Critical);

        for index in 0..40 {
            assert_eq!(
                scheduler.planned_priority(index),
                Some(sink.level(index as usize)),
                "piece {index}"
            );
        }
    }

    #[tokio::test]
    async fn test_in_tail_covers_last_pieces_only() {
        let scheduler = PriorityScheduler::spawn(
            metadata(),
            config(Duration::from_millis(50)),
            RecordingSink::new(40),
            CancellationToken::new(),
        );

        // Movie is 30 KiB; with one tail piece the tail starts at 29 KiB.
        assert!(scheduler.in_tail(1, 30 * 1024 - 1).unwrap());
        assert!(scheduler.in_tail(1, 29 * 1024).unwrap());
        assert!(!scheduler.in_tail(1, 29 * 1024 - 1).unwrap());
        assert!(!scheduler.in_tail(1, 0).unwrap());
        assert!(scheduler.in_tail(5, 0).is_err());
    }

    #[tokio::test]
    async fn test_unknown_file_rejected() {
        let sink = RecordingSink::new(40);
        let scheduler = PriorityScheduler::spawn(
            metadata(),
            config(Duration::from_millis(50)),
            sink,
            CancellationToken::new(),
        );

        assert!(matches!(
            scheduler.on_playback_position(7, 0),
            Err(TorrentError::FileNotFound { file_index: 7, .. })
        ));
        assert!(scheduler.escalate(2, 0, 1).is_err());
        assert!(scheduler.ensure_critical(9).is_err());
        assert!(scheduler.active_window().is_none());
    }
}
