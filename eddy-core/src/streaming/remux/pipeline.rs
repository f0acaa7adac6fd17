//! One shared remux job per (torrent, file), cached in an LRU.

use std::path::PathBuf;
use std::sync::Arc;

use futures::StreamExt;
use lru::LruCache;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;

use super::RemuxError;
use super::ffmpeg::{FfmpegProcessor, RemuxInput};
use super::format::{ContainerFormat, DETECTION_BYTES, RemuxStrategy, detect_container_format};
use crate::config::{RemuxConfig, StreamingConfig};
use crate::streaming::{ByteRange, FileStreamReader};
use crate::torrent::{InfoHash, PieceIndex, TorrentError, TorrentHandle};

type JobKey = (InfoHash, usize);

/// Progress of a remux job.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum RemuxStatus {
    /// Source pieces still downloading; `progress` is the file's percent
    WaitingForSource { progress: f64 },
    Remuxing,
    Ready { output: PathBuf, size: u64 },
    Failed { reason: String, retryable: bool },
}

impl RemuxStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Ready { .. } | Self::Failed { .. })
    }
}

/// Finished remux output on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemuxOutput {
    pub path: PathBuf,
    pub size: u64,
}

/// Runs and caches remux jobs.
///
/// At most `max_cached_jobs` finished jobs are kept. Running jobs are never
/// evicted, so the cache can run over while they work.
pub struct RemuxPipeline {
    config: RemuxConfig,
    processor: Arc<dyn FfmpegProcessor>,
    jobs: Mutex<LruCache<JobKey, watch::Receiver<RemuxStatus>>>,
}

impl RemuxPipeline {
    pub fn new(config: RemuxConfig, processor: Arc<dyn FfmpegProcessor>) -> Self {
        Self {
            config,
            processor,
            jobs: Mutex::new(LruCache::unbounded()),
        }
    }

    /// Container of a file: sniffed from its header once downloaded,
    /// guessed from the file name before that.
    ///
    /// # Errors
    /// - `TorrentError::FileNotFound` - Unknown file index
    /// - `TorrentError::SessionClosed` - The session was closed
    pub async fn container_format(
        handle: &TorrentHandle,
        file_index: usize,
    ) -> Result<ContainerFormat, TorrentError> {
        let file = handle.metadata().file(file_index)?;
        let by_name = ContainerFormat::from_file_name(file.file_name());
        let head = (DETECTION_BYTES as u64).min(file.length);
        if head > 0 && handle.piece_available(file_index, 0, head)? {
            let bytes = handle
                .store()
                .read_file_range(file_index, 0, head)
                .await
                .map_err(|e| handle.closed_or(e))?;
            let detected = detect_container_format(&bytes);
            if detected != ContainerFormat::Unknown {
                return Ok(detected);
            }
        }
        Ok(by_name)
    }

    /// Starts the job for a file unless one is running or finished.
    ///
    /// Jobs that failed for a transient reason are restarted.
    ///
    /// # Errors
    /// - `RemuxError::NotRequired` - The container plays natively
    /// - `RemuxError::Unsupported` - The container is not recognized
    /// - `RemuxError::Torrent` - Unknown file or closed session
    pub async fn ensure_started(
        &self,
        handle: &TorrentHandle,
        file_index: usize,
    ) -> Result<watch::Receiver<RemuxStatus>, RemuxError> {
        let format = Self::container_format(handle, file_index).await?;
        match (format, format.strategy()) {
            (_, RemuxStrategy::Native) => return Err(RemuxError::NotRequired { format }),
            (ContainerFormat::Unknown, _) => {
                return Err(RemuxError::Unsupported {
                    reason: "unrecognized container".to_string(),
                });
            }
            _ => {}
        }
        let progress = handle.file_progress(file_index)?;

        let key = (handle.info_hash(), file_index);
        let (sender, receiver) = {
            let mut jobs = self.jobs.lock();
            if let Some(existing) = jobs.get(&key) {
                let retry = matches!(
                    *existing.borrow(),
                    RemuxStatus::Failed {
                        retryable: true,
                        ..
                    }
                );
                if !retry {
                    return Ok(existing.clone());
                }
            }
            let (sender, receiver) = watch::channel(RemuxStatus::WaitingForSource { progress });
            jobs.put(key, receiver.clone());
            evict_finished(&mut jobs, self.config.max_cached_jobs.max(1));
            (sender, receiver)
        };

        tracing::info!(
            info_hash = %handle.info_hash(),
            file_index,
            format = %format,
            "Remux job started"
        );
        tokio::spawn(run_job(
            handle.clone(),
            file_index,
            format,
            self.config.clone(),
            Arc::clone(&self.processor),
            sender,
        ));
        Ok(receiver)
    }

    /// Waits for the remuxed output of a file, starting the job if needed.
    ///
    /// Concurrent callers share one job and one ffmpeg pass.
    ///
    /// # Errors
    /// - `RemuxError::NotRequired` - The container plays natively
    /// - `RemuxError::Unsupported` - ffmpeg rejected the input
    /// - `RemuxError::SourceUnavailable` - Source pieces stopped arriving
    pub async fn prepare(
        &self,
        handle: &TorrentHandle,
        file_index: usize,
    ) -> Result<RemuxOutput, RemuxError> {
        let mut status = self.ensure_started(handle, file_index).await?;
        let finished = status
            .wait_for(RemuxStatus::is_terminal)
            .await
            .map_err(|_| RemuxError::SourceUnavailable {
                reason: "remux job ended unexpectedly".to_string(),
            })?
            .clone();
        match finished {
            RemuxStatus::Ready { output, size } => Ok(RemuxOutput { path: output, size }),
            RemuxStatus::Failed {
                reason,
                retryable: false,
            } => Err(RemuxError::Unsupported { reason }),
            RemuxStatus::Failed { reason, .. } => Err(RemuxError::SourceUnavailable { reason }),
            RemuxStatus::WaitingForSource { .. } | RemuxStatus::Remuxing => {
                Err(RemuxError::SourceUnavailable {
                    reason: "remux job ended unexpectedly".to_string(),
                })
            }
        }
    }

    /// Status of a known job without starting one.
    pub fn status(&self, info_hash: InfoHash, file_index: usize) -> Option<RemuxStatus> {
        self.jobs
            .lock()
            .peek(&(info_hash, file_index))
            .map(|status| status.borrow().clone())
    }

    /// Forgets every job of a torrent and deletes its outputs.
    pub async fn forget(&self, info_hash: InfoHash) {
        {
            let mut jobs = self.jobs.lock();
            let keys: Vec<JobKey> = jobs
                .iter()
                .filter(|(key, _)| key.0 == info_hash)
                .map(|(key, _)| *key)
                .collect();
            for key in keys {
                jobs.pop(&key);
            }
        }
        let _ = tokio::fs::remove_dir_all(self.config.cache_dir.join(info_hash.to_string())).await;
    }
}

/// Drops least recently used finished jobs until `capacity` remain.
fn evict_finished(jobs: &mut LruCache<JobKey, watch::Receiver<RemuxStatus>>, capacity: usize) {
    while jobs.len() > capacity {
        // iter() walks most recent first.
        let oldest_finished = jobs
            .iter()
            .rev()
            .find(|(_, job)| job.borrow().is_terminal())
            .map(|(key, _)| *key);
        let Some(key) = oldest_finished else {
            break;
        };
        if let Some(job) = jobs.pop(&key) {
            discard_output(key, &job);
        }
    }
}

fn discard_output(key: JobKey, job: &watch::Receiver<RemuxStatus>) {
    if let RemuxStatus::Ready { output, .. } = &*job.borrow() {
        tracing::debug!(info_hash = %key.0, file_index = key.1, "Evicting remux output");
        let output = output.clone();
        tokio::spawn(async move {
            let _ = tokio::fs::remove_file(output).await;
        });
    }
}

async fn run_job(
    handle: TorrentHandle,
    file_index: usize,
    format: ContainerFormat,
    config: RemuxConfig,
    processor: Arc<dyn FfmpegProcessor>,
    status: watch::Sender<RemuxStatus>,
) {
    let info_hash = handle.info_hash();
    let output = config
        .cache_dir
        .join(info_hash.to_string())
        .join(format!("{file_index}.mp4"));

    let result = async {
        if let Some(parent) = output.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        handle.scheduler().ensure_critical(file_index)?;
        let input = source_input(&handle, file_index, format, &config, &status).await?;
        status.send_replace(RemuxStatus::Remuxing);
        processor.remux(input, &output).await
    }
    .await;

    let finished = match result {
        Ok(size) => {
            tracing::info!(info_hash = %info_hash, file_index, size, "Remux finished");
            RemuxStatus::Ready { output, size }
        }
        Err(e) => {
            tracing::warn!(info_hash = %info_hash, file_index, error = %e, "Remux failed");
            RemuxStatus::Failed {
                reason: e.to_string(),
                retryable: e.is_retryable(),
            }
        }
    };
    status.send_replace(finished);
}

/// Waits for as much of the source as the container needs.
async fn source_input(
    handle: &TorrentHandle,
    file_index: usize,
    format: ContainerFormat,
    config: &RemuxConfig,
    status: &watch::Sender<RemuxStatus>,
) -> Result<RemuxInput, RemuxError> {
    let metadata = handle.metadata();
    let file = metadata.file(file_index)?;

    let required = match format.strategy() {
        RemuxStrategy::Progressive => {
            file.pieces_for_bytes(0, DETECTION_BYTES as u64, metadata.piece_length)
        }
        RemuxStrategy::FullSource | RemuxStrategy::Native => file.pieces.clone(),
    };
    for piece in required.map(PieceIndex::new) {
        if handle.store().is_complete(piece) {
            continue;
        }
        tokio::time::timeout(config.source_wait_timeout, handle.wait_for_piece(piece))
            .await
            .map_err(|_| RemuxError::SourceUnavailable {
                reason: format!("piece {piece} did not arrive within {:?}", config.source_wait_timeout),
            })??;
        status.send_replace(RemuxStatus::WaitingForSource {
            progress: handle.file_progress(file_index)?,
        });
    }

    if format.strategy() == RemuxStrategy::Progressive {
        let Some(range) = ByteRange::full(file.length) else {
            return Err(RemuxError::Unsupported {
                reason: "empty file".to_string(),
            });
        };
        let streaming = StreamingConfig {
            wait_timeout: config.source_wait_timeout,
            ..StreamingConfig::default()
        };
        let reader = FileStreamReader::new(handle.clone(), file_index, range, &streaming)?;
        return Ok(RemuxInput::Pipe(reader.into_stream().boxed()));
    }

    let path = handle
        .store()
        .file_path(file_index)
        .map_err(|e| handle.closed_or(e))?;
    Ok(RemuxInput::File(path))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::config::EddyConfig;
    use crate::streaming::remux::ffmpeg::{SIMULATED_HEADER, SimulatedFfmpeg};
    use crate::torrent::swarm::simulation::{SimulatedSwarm, SimulatedTorrent, random_content};

    const PIECE: u32 = 16_384;

    fn matroska(len: usize, seed: u64) -> Vec<u8> {
        let mut content = vec![0x1A, 0x45, 0xDF, 0xA3, 0x42, 0x82, 0x88];
        content.extend_from_slice(b"matroska");
        content.extend(random_content(len - content.len(), seed));
        content
    }

    fn mpeg_ts(packets: usize) -> Vec<u8> {
        let mut content = random_content(packets * 188, 40);
        for packet in content.chunks_mut(188) {
            packet[0] = 0x47;
        }
        content
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        swarm: Arc<SimulatedSwarm>,
        torrent: SimulatedTorrent,
        handle: TorrentHandle,
        config: EddyConfig,
    }

    fn fixture(files: Vec<(&str, Vec<u8>)>, seeded: bool) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let config = EddyConfig::for_testing().with_data_dir(dir.path());
        let torrent = SimulatedTorrent::multi_file("show", files, PIECE);
        let swarm = SimulatedSwarm::new();
        swarm.add_torrent(torrent.clone());
        if seeded {
            swarm.add_seeder(torrent.info_hash());
        }
        let handle = TorrentHandle::spawn(torrent.metadata.as_ref().clone(), &config, swarm.transport());
        Fixture {
            _dir: dir,
            swarm,
            torrent,
            handle,
            config,
        }
    }

    #[tokio::test]
    async fn test_concurrent_prepare_runs_one_pass() {
        let source = matroska(5 * PIECE as usize, 30);
        let fixture = fixture(vec![("movie.mkv", source.clone())], true);
        let processor = Arc::new(SimulatedFfmpeg::new().with_delay(Duration::from_millis(50)));
        let pipeline = Arc::new(RemuxPipeline::new(fixture.config.remux.clone(), processor.clone()));

        let calls: Vec<_> = (0..8)
            .map(|_| {
                let pipeline = Arc::clone(&pipeline);
                let handle = fixture.handle.clone();
                tokio::spawn(async move { pipeline.prepare(&handle, 0).await })
            })
            .collect();
        let mut outputs = Vec::new();
        for call in calls {
            outputs.push(call.await.unwrap().unwrap());
        }

        assert_eq!(processor.passes(), 1);
        assert!(outputs.windows(2).all(|pair| pair[0] == pair[1]));
        let written = tokio::fs::read(&outputs[0].path).await.unwrap();
        assert_eq!(&written[..SIMULATED_HEADER.len()], SIMULATED_HEADER);
        assert_eq!(&written[SIMULATED_HEADER.len()..], source.as_slice());
        assert_eq!(outputs[0].size, written.len() as u64);

        // A later call reuses the cached output.
        pipeline.prepare(&fixture.handle, 0).await.unwrap();
        assert_eq!(processor.passes(), 1);
        fixture.handle.close(false).await.unwrap();
    }

    #[tokio::test]
    async fn test_waits_for_source_before_remuxing() {
        let fixture = fixture(vec![("movie.mkv", matroska(4 * PIECE as usize, 31))], false);
        let processor = Arc::new(SimulatedFfmpeg::new());
        let pipeline = RemuxPipeline::new(fixture.config.remux.clone(), processor.clone());

        let status = pipeline.ensure_started(&fixture.handle, 0).await.unwrap();
        assert_eq!(*status.borrow(), RemuxStatus::WaitingForSource { progress: 0.0 });
        assert!(matches!(
            pipeline.status(fixture.torrent.info_hash(), 0),
            Some(RemuxStatus::WaitingForSource { .. })
        ));
        assert_eq!(processor.passes(), 0);

        fixture.swarm.add_seeder(fixture.torrent.info_hash());
        let output = pipeline.prepare(&fixture.handle, 0).await.unwrap();
        assert!(output.size > 0);
        assert_eq!(processor.passes(), 1);
        fixture.handle.close(false).await.unwrap();
    }

    #[tokio::test]
    async fn test_native_and_unknown_containers() {
        let mut mp4 = vec![0, 0, 0, 0x18];
        mp4.extend_from_slice(b"ftypisom");
        mp4.extend(random_content(PIECE as usize, 32));
        let fixture = fixture(
            vec![("clip.mp4", mp4), ("notes.bin", random_content(PIECE as usize, 33))],
            true,
        );
        let pipeline = RemuxPipeline::new(fixture.config.remux.clone(), Arc::new(SimulatedFfmpeg::new()));

        tokio::time::timeout(Duration::from_secs(10), async {
            while fixture.handle.snapshot().progress_percent < 100.0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        assert!(matches!(
            pipeline.prepare(&fixture.handle, 0).await,
            Err(RemuxError::NotRequired {
                format: ContainerFormat::Mp4
            })
        ));
        assert!(matches!(
            pipeline.prepare(&fixture.handle, 1).await,
            Err(RemuxError::Unsupported { .. })
        ));
        fixture.handle.close(false).await.unwrap();
    }

    #[tokio::test]
    async fn test_rejected_input_is_cached_as_unsupported() {
        let fixture = fixture(vec![("broken.avi", random_content(2 * PIECE as usize, 34))], true);
        let processor = Arc::new(SimulatedFfmpeg::rejecting());
        let pipeline = RemuxPipeline::new(fixture.config.remux.clone(), processor.clone());

        for _ in 0..2 {
            assert!(matches!(
                pipeline.prepare(&fixture.handle, 0).await,
                Err(RemuxError::Unsupported { .. })
            ));
        }
        assert_eq!(processor.passes(), 1);
        assert!(matches!(
            pipeline.status(fixture.torrent.info_hash(), 0),
            Some(RemuxStatus::Failed {
                retryable: false,
                ..
            })
        ));
        fixture.handle.close(false).await.unwrap();
    }

    #[tokio::test]
    async fn test_mpeg_ts_is_fed_progressively() {
        let source = mpeg_ts(400);
        let fixture = fixture(vec![("live.ts", source.clone())], true);
        let pipeline = RemuxPipeline::new(fixture.config.remux.clone(), Arc::new(SimulatedFfmpeg::new()));

        let output = pipeline.prepare(&fixture.handle, 0).await.unwrap();
        let written = tokio::fs::read(&output.path).await.unwrap();
        assert_eq!(&written[SIMULATED_HEADER.len()..], source.as_slice());
        fixture.handle.close(false).await.unwrap();
    }

    #[tokio::test]
    async fn test_lru_evicts_and_deletes_output() {
        let first = matroska(PIECE as usize, 35);
        let second = matroska(PIECE as usize, 36);
        let mut fixture = fixture(vec![("a.mkv", first), ("b.mkv", second)], true);
        fixture.config.remux.max_cached_jobs = 1;
        let pipeline = RemuxPipeline::new(fixture.config.remux.clone(), Arc::new(SimulatedFfmpeg::new()));

        let evicted = pipeline.prepare(&fixture.handle, 0).await.unwrap();
        pipeline.prepare(&fixture.handle, 1).await.unwrap();
        assert!(pipeline.status(fixture.torrent.info_hash(), 0).is_none());

        tokio::time::timeout(Duration::from_secs(5), async {
            while tokio::fs::try_exists(&evicted.path).await.unwrap() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        pipeline.forget(fixture.torrent.info_hash()).await;
        assert!(pipeline.status(fixture.torrent.info_hash(), 1).is_none());
        fixture.handle.close(false).await.unwrap();
    }

    #[tokio::test]
    async fn test_running_job_survives_eviction_pressure() {
        let first = matroska(PIECE as usize, 37);
        let second = matroska(PIECE as usize, 38);
        let mut fixture = fixture(
            vec![("a.mkv", first.clone()), ("b.mkv", second.clone())],
            true,
        );
        fixture.config.remux.max_cached_jobs = 1;
        let processor = Arc::new(SimulatedFfmpeg::new().with_delay(Duration::from_millis(200)));
        let pipeline = Arc::new(RemuxPipeline::new(fixture.config.remux.clone(), processor.clone()));
        let info_hash = fixture.torrent.info_hash();

        pipeline.ensure_started(&fixture.handle, 0).await.unwrap();
        pipeline.ensure_started(&fixture.handle, 1).await.unwrap();
        assert!(pipeline.status(info_hash, 0).is_some());

        let (a, b) = tokio::join!(
            pipeline.prepare(&fixture.handle, 0),
            pipeline.prepare(&fixture.handle, 1)
        );
        let (a, b) = (a.unwrap(), b.unwrap());
        assert_eq!(processor.passes(), 2);
        for (output, source) in [(&a, &first), (&b, &second)] {
            let written = tokio::fs::read(&output.path).await.unwrap();
            assert_eq!(&written[SIMULATED_HEADER.len()..], source.as_slice());
        }

        // Finished outputs are reused, not remuxed again.
        pipeline.prepare(&fixture.handle, 1).await.unwrap();
        assert_eq!(processor.passes(), 2);
        fixture.handle.close(false).await.unwrap();
    }
}
