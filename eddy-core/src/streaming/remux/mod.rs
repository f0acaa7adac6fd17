//! Container repackaging for browsers.
//!
//! MP4 and WebM stream as-is. Other containers get one ffmpeg stream-copy
//! pass into a faststart MP4, started once enough of the source is on disk.

mod ffmpeg;
mod format;
mod pipeline;

#[cfg(any(test, feature = "test-utils"))]
pub use ffmpeg::{SIMULATED_HEADER, SimulatedFfmpeg};
pub use ffmpeg::{FfmpegProcessor, ProductionFfmpeg, RemuxInput, SourceStream};
pub use format::{ContainerFormat, DETECTION_BYTES, RemuxStrategy, detect_container_format};
pub use pipeline::{RemuxOutput, RemuxPipeline, RemuxStatus};

use crate::streaming::StreamingError;
use crate::torrent::TorrentError;

/// Errors from preparing a remuxed output.
#[derive(Debug, thiserror::Error)]
pub enum RemuxError {
    #[error("{format} plays natively and needs no remux")]
    NotRequired { format: ContainerFormat },

    #[error("Cannot remux: {reason}")]
    Unsupported { reason: String },

    #[error("ffmpeg unavailable: {reason}")]
    FfmpegUnavailable { reason: String },

    #[error("Source data unavailable: {reason}")]
    SourceUnavailable { reason: String },

    #[error("Source stream failed")]
    Source(#[source] StreamingError),

    #[error(transparent)]
    Torrent(#[from] TorrentError),

    #[error("I/O error")]
    Io(#[from] std::io::Error),
}

impl RemuxError {
    /// Whether a new job could succeed where this one failed.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::NotRequired { .. } | Self::Unsupported { .. })
    }
}
