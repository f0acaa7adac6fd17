//! ffmpeg stream-copy invocation behind a trait so tests can simulate it.

use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::process::Stdio;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use tokio::io::AsyncWriteExt;

use super::RemuxError;
use crate::streaming::StreamingError;

/// Source bytes in file order, produced as pieces complete.
pub type SourceStream = Pin<Box<dyn Stream<Item = Result<Bytes, StreamingError>> + Send>>;

/// Where a remux reads its input from.
pub enum RemuxInput {
    /// Complete file on disk
    File(PathBuf),
    /// Progressive feed piped to ffmpeg's stdin
    Pipe(SourceStream),
}

impl std::fmt::Debug for RemuxInput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::File(path) => f.debug_tuple("File").field(path).finish(),
            Self::Pipe(_) => f.write_str("Pipe"),
        }
    }
}

/// Runs one stream-copy pass into an MP4.
#[async_trait]
pub trait FfmpegProcessor: Send + Sync {
    /// Remuxes `input` into `output`, returning the output size.
    ///
    /// # Errors
    /// - `RemuxError::Unsupported` - ffmpeg rejected the input
    /// - `RemuxError::FfmpegUnavailable` - ffmpeg could not be started
    /// - `RemuxError::Source` - The progressive feed failed
    async fn remux(&self, input: RemuxInput, output: &Path) -> Result<u64, RemuxError>;
}

/// Invokes the ffmpeg binary via `tokio::process`.
#[derive(Debug, Clone)]
pub struct ProductionFfmpeg {
    binary: PathBuf,
}

impl ProductionFfmpeg {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }
}

#[async_trait]
impl FfmpegProcessor for ProductionFfmpeg {
    async fn remux(&self, input: RemuxInput, output: &Path) -> Result<u64, RemuxError> {
        let mut command = tokio::process::Command::new(&self.binary);
        command.arg("-y").arg("-hide_banner").arg("-loglevel").arg("error");
        match &input {
            RemuxInput::File(path) => {
                command.arg("-i").arg(path).stdin(Stdio::null());
            }
            RemuxInput::Pipe(_) => {
                command.arg("-i").arg("pipe:0").stdin(Stdio::piped());
            }
        }
        command
            .args(["-map", "0:v?", "-map", "0:a?", "-c", "copy"])
            .args(["-movflags", "+faststart", "-f", "mp4"])
            .arg(output)
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        tracing::debug!(ffmpeg = %self.binary.display(), input = ?input, output = %output.display(), "Starting remux");
        let mut child = command.spawn().map_err(|e| RemuxError::FfmpegUnavailable {
            reason: format!("{}: {e}", self.binary.display()),
        })?;

        let feeder = match (input, child.stdin.take()) {
            (RemuxInput::Pipe(mut source), Some(mut stdin)) => Some(tokio::spawn(async move {
                while let Some(chunk) = source.next().await {
                    let chunk = chunk.map_err(RemuxError::Source)?;
                    if stdin.write_all(&chunk).await.is_err() {
                        // ffmpeg exited early; its status explains why.
                        break;
                    }
                }
                let _ = stdin.shutdown().await;
                Ok::<(), RemuxError>(())
            })),
            _ => None,
        };

        let result = child.wait_with_output().await?;
        if let Some(feeder) = feeder {
            match feeder.await {
                Ok(Err(e)) => return Err(e),
                Ok(Ok(())) => {}
                Err(e) => {
                    return Err(RemuxError::Io(std::io::Error::other(e)));
                }
            }
        }

        if !result.status.success() {
            let stderr = String::from_utf8_lossy(&result.stderr);
            let reason = stderr.lines().last().unwrap_or("ffmpeg failed").trim().to_string();
            return Err(RemuxError::Unsupported {
                reason: format!("{} ({})", reason, result.status),
            });
        }
        Ok(tokio::fs::metadata(output).await?.len())
    }
}

#[cfg(any(test, feature = "test-utils"))]
pub use simulated::{SIMULATED_HEADER, SimulatedFfmpeg};

#[cfg(any(test, feature = "test-utils"))]
mod simulated {
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use futures::StreamExt;

    use super::{FfmpegProcessor, RemuxInput};
    use crate::streaming::remux::RemuxError;

    /// Prefix written ahead of the copied input so outputs sniff as MP4.
    pub const SIMULATED_HEADER: &[u8] = b"\0\0\0\x18ftypisom\0\0\0\0isommp42";

    /// Copies the input behind an MP4 header and counts passes.
    #[derive(Debug, Default)]
    pub struct SimulatedFfmpeg {
        passes: AtomicUsize,
        delay: Duration,
        reject: bool,
    }

    impl SimulatedFfmpeg {
        pub fn new() -> Self {
            Self::default()
        }

        /// Holds each pass for `delay` so concurrent callers overlap.
        pub fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }

        /// Fails every pass as ffmpeg does on corrupt input.
        pub fn rejecting() -> Self {
            Self {
                reject: true,
                ..Self::default()
            }
        }

        pub fn passes(&self) -> usize {
            self.passes.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl FfmpegProcessor for SimulatedFfmpeg {
        async fn remux(&self, input: RemuxInput, output: &Path) -> Result<u64, RemuxError> {
            self.passes.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            if self.reject {
                return Err(RemuxError::Unsupported {
                    reason: "Invalid data found when processing input".to_string(),
                });
            }

            let mut data = SIMULATED_HEADER.to_vec();
            match input {
                RemuxInput::File(path) => data.extend(tokio::fs::read(path).await?),
                RemuxInput::Pipe(mut source) => {
                    while let Some(chunk) = source.next().await {
                        data.extend_from_slice(&chunk.map_err(RemuxError::Source)?);
                    }
                }
            }
            tokio::fs::write(output, &data).await?;
            Ok(data.len() as u64)
        }
    }
}
