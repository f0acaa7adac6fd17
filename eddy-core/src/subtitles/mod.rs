//! Subtitle search and conversion to WebVTT for browser playback.

mod convert;
mod provider;

use std::num::NonZeroUsize;
use std::sync::Arc;

pub use convert::{SubtitleFormat, decode_subtitle_bytes, to_webvtt};
use lru::LruCache;
use parking_lot::Mutex;
pub use provider::{OpenSubtitlesProvider, StaticSubtitleProvider, SubtitleProvider};
use serde::{Deserialize, Serialize};

const CAPTION_CACHE_SIZE: usize = 64;

/// Errors from subtitle search and conversion.
#[derive(Debug, thiserror::Error)]
pub enum SubtitleError {
    #[error("Subtitle provider is not configured")]
    Disabled,

    #[error("Subtitle query is empty")]
    EmptyQuery,

    #[error("Subtitle not found")]
    NotFound,

    #[error("Subtitle provider unreachable: {reason}")]
    Network { reason: String },

    #[error("Subtitle provider error: {reason}")]
    Provider { reason: String },

    #[error("Unrecognized subtitle format: {reason}")]
    InvalidFormat { reason: String },
}

/// One downloadable subtitle file.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubtitleCandidate {
    /// Provider-specific file identifier
    pub id: String,
    pub language: String,
    pub release: String,
    pub file_name: String,
    #[serde(default)]
    pub download_count: u64,
    pub provider: String,
}

/// Converted caption track ready for a `<track>` element.
#[derive(Debug, Clone, Serialize)]
pub struct CaptionPayload {
    pub language: String,
    pub source_format: SubtitleFormat,
    /// WebVTT text
    pub content: String,
}

/// Searches a provider and converts downloads, caching converted tracks.
#[derive(Debug)]
pub struct SubtitleBridge {
    provider: Arc<dyn SubtitleProvider>,
    captions: Mutex<LruCache<(String, String), CaptionPayload>>,
}

impl SubtitleBridge {
    pub fn new(provider: Arc<dyn SubtitleProvider>) -> Self {
        let capacity = NonZeroUsize::new(CAPTION_CACHE_SIZE).unwrap_or(NonZeroUsize::MIN);
        Self {
            provider,
            captions: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Candidates for `query`, most downloaded first.
    ///
    /// # Errors
    /// - `SubtitleError::EmptyQuery` - Blank query
    /// - Any provider error
    pub async fn search(
        &self,
        query: &str,
        language: &str,
    ) -> Result<Vec<SubtitleCandidate>, SubtitleError> {
        let query = query.trim();
        if query.is_empty() {
            return Err(SubtitleError::EmptyQuery);
        }
        let mut candidates = self.provider.search(query, language).await?;
        candidates.sort_by(|a, b| b.download_count.cmp(&a.download_count));
        Ok(candidates)
    }

    /// Downloads a candidate and converts it to WebVTT.
    ///
    /// Converted tracks are cached per (candidate, language).
    ///
    /// # Errors
    /// - `SubtitleError::InvalidFormat` - Download is not SRT or WebVTT
    /// - Any provider error
    pub async fn fetch_and_convert(
        &self,
        candidate: &SubtitleCandidate,
    ) -> Result<CaptionPayload, SubtitleError> {
        let key = (
            format!("{}:{}", candidate.provider, candidate.id),
            candidate.language.clone(),
        );
        if let Some(cached) = self.captions.lock().get(&key) {
            return Ok(cached.clone());
        }

        let raw = self.provider.download(candidate).await?;
        let (content, source_format) = to_webvtt(&decode_subtitle_bytes(&raw))?;
        let payload = CaptionPayload {
            language: candidate.language.clone(),
            source_format,
            content,
        };
        tracing::info!(
            file = %candidate.file_name,
            language = %candidate.language,
            format = ?source_format,
            "Converted subtitle"
        );
        self.captions.lock().put(key, payload.clone());
        Ok(payload)
    }
}
