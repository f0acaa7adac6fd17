//! HTTP mapping of engine errors.
//!
//! Players tell buffering from failure by status code alone: 202 means
//! retry, 412 means the range will never arrive.

use axum::Json;
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use eddy_core::streaming::{RemuxError, StreamingError};
use eddy_core::subtitles::SubtitleError;
use eddy_core::torrent::{PieceIndex, TorrentError};
use eddy_search::MediaSearchError;
use serde_json::json;

/// Seconds a client should wait before retrying a 202.
pub const RETRY_AFTER_SECS: u64 = 2;

/// Errors returned by HTTP handlers.
#[derive(Debug, thiserror::Error)]
pub enum WebError {
    #[error("Bad request: {reason}")]
    BadRequest { reason: String },

    #[error("Not found: {reason}")]
    NotFound { reason: String },

    #[error("Range not satisfiable for a file of {file_length} bytes")]
    RangeNotSatisfiable { file_length: u64 },

    #[error("Buffering: {reason}")]
    Buffering { reason: String },

    #[error("Piece {piece} is not held by any peer")]
    Unobtainable { piece: PieceIndex },

    #[error("Cannot play this file: {reason}")]
    UnsupportedMedia { reason: String },

    #[error("Torrent was removed")]
    Gone,

    #[error("Timed out: {reason}")]
    Timeout { reason: String },

    #[error("Unavailable: {reason}")]
    Unavailable { reason: String },

    #[error("Internal error: {reason}")]
    Internal { reason: String },
}

impl WebError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::BadRequest { .. } => StatusCode::BAD_REQUEST,
            Self::NotFound { .. } => StatusCode::NOT_FOUND,
            Self::RangeNotSatisfiable { .. } => StatusCode::RANGE_NOT_SATISFIABLE,
            Self::Buffering { .. } => StatusCode::ACCEPTED,
            Self::Unobtainable { .. } | Self::UnsupportedMedia { .. } => {
                StatusCode::PRECONDITION_FAILED
            }
            Self::Gone => StatusCode::GONE,
            Self::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            Self::Unavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Self::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for WebError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::warn!(error = %self, "Request failed");
        } else {
            tracing::debug!(error = %self, status = status.as_u16(), "Request rejected");
        }

        let mut response = (status, Json(json!({ "error": self.to_string() }))).into_response();
        let headers = response.headers_mut();
        match &self {
            Self::Buffering { .. } => {
                headers.insert(header::RETRY_AFTER, HeaderValue::from(RETRY_AFTER_SECS));
            }
            Self::RangeNotSatisfiable { file_length } => {
                if let Ok(value) = HeaderValue::from_str(&format!("bytes */{file_length}")) {
                    headers.insert(header::CONTENT_RANGE, value);
                }
            }
            _ => {}
        }
        response
    }
}

impl From<TorrentError> for WebError {
    fn from(error: TorrentError) -> Self {
        match error {
            TorrentError::InvalidInfoHash { .. }
            | TorrentError::InvalidTorrentFile { .. }
            | TorrentError::InvalidPriority { .. } => Self::BadRequest {
                reason: error.to_string(),
            },
            TorrentError::TorrentNotFound { .. } | TorrentError::FileNotFound { .. } => {
                Self::NotFound {
                    reason: error.to_string(),
                }
            }
            TorrentError::PieceUnobtainable { index } => Self::Unobtainable { piece: index },
            TorrentError::SessionClosed { .. } => Self::Gone,
            TorrentError::SwarmStalled { .. } | TorrentError::MetadataUnavailable { .. } => {
                Self::Timeout {
                    reason: error.to_string(),
                }
            }
            TorrentError::EngineShutdown => Self::Unavailable {
                reason: error.to_string(),
            },
            other => Self::Internal {
                reason: other.to_string(),
            },
        }
    }
}

impl From<StreamingError> for WebError {
    fn from(error: StreamingError) -> Self {
        match error {
            StreamingError::RangeNotSatisfiable { file_length, .. } => {
                Self::RangeNotSatisfiable { file_length }
            }
            StreamingError::WaitTimeout { .. } => Self::Buffering {
                reason: error.to_string(),
            },
            StreamingError::Torrent(inner) => inner.into(),
        }
    }
}

impl From<RemuxError> for WebError {
    fn from(error: RemuxError) -> Self {
        match error {
            RemuxError::Unsupported { .. } | RemuxError::NotRequired { .. } => {
                Self::UnsupportedMedia {
                    reason: error.to_string(),
                }
            }
            RemuxError::FfmpegUnavailable { .. } => Self::Unavailable {
                reason: error.to_string(),
            },
            RemuxError::SourceUnavailable { .. } => Self::Timeout {
                reason: error.to_string(),
            },
            RemuxError::Source(inner) => inner.into(),
            RemuxError::Torrent(inner) => inner.into(),
            RemuxError::Io(e) => Self::Internal {
                reason: e.to_string(),
            },
        }
    }
}

impl From<SubtitleError> for WebError {
    fn from(error: SubtitleError) -> Self {
        match error {
            SubtitleError::EmptyQuery | SubtitleError::InvalidFormat { .. } => Self::BadRequest {
                reason: error.to_string(),
            },
            SubtitleError::NotFound => Self::NotFound {
                reason: error.to_string(),
            },
            SubtitleError::Disabled
            | SubtitleError::Network { .. }
            | SubtitleError::Provider { .. } => Self::Unavailable {
                reason: error.to_string(),
            },
        }
    }
}

impl From<MediaSearchError> for WebError {
    fn from(error: MediaSearchError) -> Self {
        match error {
            MediaSearchError::EmptyQuery => Self::BadRequest {
                reason: error.to_string(),
            },
            other => Self::Unavailable {
                reason: other.to_string(),
            },
        }
    }
}
