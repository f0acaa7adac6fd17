//! Eddy Core - torrent streaming engine
//!
//! Swarm sessions download pieces into a verified piece store while a
//! priority scheduler keeps the playback window ahead of the player. The
//! streaming layer serves byte ranges straight out of verified pieces,
//! repackages containers browsers cannot play, and converts subtitles.

pub mod config;
pub mod scheduler;
pub mod storage;
pub mod streaming;
pub mod subtitles;
pub mod torrent;
pub mod tracing_setup;

pub use config::EddyConfig;
pub use scheduler::{PriorityScheduler, PriorityWindow};
pub use storage::{PieceStore, StorageError};
pub use streaming::{RemuxError, StreamingError};
pub use subtitles::{SubtitleBridge, SubtitleError};
pub use torrent::{EngineHandle, InfoHash, TorrentError, TorrentHandle};

/// Errors that can bubble up from any Eddy subsystem.
#[derive(Debug, thiserror::Error)]
pub enum EddyError {
    #[error("Torrent error: {0}")]
    Torrent(#[from] TorrentError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Streaming error: {0}")]
    Streaming(#[from] StreamingError),

    #[error("Remux error: {0}")]
    Remux(#[from] RemuxError),

    #[error("Subtitle error: {0}")]
    Subtitle(#[from] SubtitleError),

    #[error("Configuration error: {reason}")]
    Configuration { reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl EddyError {
    /// Returns a user-friendly error message suitable for display.
    pub fn user_message(&self) -> String {
        match self {
            EddyError::Torrent(e) => match e {
                TorrentError::InvalidTorrentFile { reason } => {
                    format!("Invalid torrent file: {reason}")
                }
                TorrentError::InvalidInfoHash { value } => format!("Invalid info hash: {value}"),
                TorrentError::TorrentNotFound { info_hash } => {
                    format!("Torrent {info_hash} not found")
                }
                TorrentError::FileNotFound { file_index, .. } => {
                    format!("File {file_index} not found in torrent")
                }
                TorrentError::MetadataUnavailable { .. } => {
                    "Could not fetch torrent metadata from peers, try again".to_string()
                }
                TorrentError::SwarmStalled { .. } => {
                    "Download stalled, waiting for peers".to_string()
                }
                TorrentError::PieceUnobtainable { .. } => {
                    "Part of this file is not available from any peer".to_string()
                }
                TorrentError::SessionClosed { .. } => "Download was removed".to_string(),
                _ => "Download error occurred".to_string(),
            },
            EddyError::Storage(_) => "Storage error occurred".to_string(),
            EddyError::Streaming(StreamingError::RangeNotSatisfiable { .. }) => {
                "Requested range is outside the file".to_string()
            }
            EddyError::Streaming(_) => "Streaming error occurred".to_string(),
            EddyError::Remux(RemuxError::Unsupported { .. }) => {
                "This video format cannot be played in the browser".to_string()
            }
            EddyError::Remux(_) => "Video conversion failed".to_string(),
            EddyError::Subtitle(SubtitleError::Disabled) => {
                "Subtitle search is not configured".to_string()
            }
            EddyError::Subtitle(_) => "Subtitle download failed".to_string(),
            EddyError::Configuration { .. } => "Configuration error occurred".to_string(),
            EddyError::Io(_) => "File system error occurred".to_string(),
        }
    }

    /// Checks if this error is due to user input validation.
    pub fn is_user_error(&self) -> bool {
        matches!(
            self,
            EddyError::Configuration { .. }
                | EddyError::Torrent(
                    TorrentError::InvalidTorrentFile { .. }
                        | TorrentError::InvalidInfoHash { .. }
                        | TorrentError::InvalidPriority { .. }
                        | TorrentError::FileNotFound { .. }
                )
                | EddyError::Streaming(StreamingError::RangeNotSatisfiable { .. })
                | EddyError::Subtitle(SubtitleError::EmptyQuery)
        )
    }
}

pub type Result<T> = std::result::Result<T, EddyError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_errors() {
        let invalid: EddyError = TorrentError::InvalidTorrentFile {
            reason: "truncated".to_string(),
        }
        .into();
        assert!(invalid.is_user_error());
        assert_eq!(invalid.user_message(), "Invalid torrent file: truncated");

        let stalled: EddyError = TorrentError::SwarmStalled {
            info_hash: InfoHash::new([1; 20]),
        }
        .into();
        assert!(!stalled.is_user_error());
        assert!(stalled.user_message().contains("stalled"));
    }
}
