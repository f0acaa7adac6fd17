//! Mock provider implementation for testing.

use async_trait::async_trait;

use super::TorrentSearchProvider;
use crate::errors::MediaSearchError;
use crate::types::{TorrentResult, VideoQuality};

/// Returns fixed results, or query-derived releases when none are set.
#[derive(Debug, Default)]
pub struct MockProvider {
    fixed: Option<Vec<TorrentResult>>,
}

impl MockProvider {
    /// Creates a new mock provider for testing.
    pub fn new() -> Self {
        Self::default()
    }

    /// Answers every query with `results`.
    pub fn with_results(results: Vec<TorrentResult>) -> Self {
        Self {
            fixed: Some(results),
        }
    }
}

#[async_trait]
impl TorrentSearchProvider for MockProvider {
    async fn search_torrents(
        &self,
        query: &str,
        _category: Option<&str>,
    ) -> Result<Vec<TorrentResult>, MediaSearchError> {
        if let Some(fixed) = &self.fixed {
            return Ok(fixed.clone());
        }

        let release = query.replace(' ', ".");
        Ok(vec![
            TorrentResult {
                name: format!("{release}.2024.720p.WEBRip.x264"),
                magnet_link: "magnet:?xt=urn:btih:2222222222222222222222222222222222222222"
                    .to_string(),
                size: 800_000_000,
                seeders: 25,
                leechers: 5,
                quality: VideoQuality::WebRip,
                source: "Mock".to_string(),
                added_date: chrono::Utc::now(),
            },
            TorrentResult {
                name: format!("{release}.2024.1080p.BluRay.x264-GROUP"),
                magnet_link: "magnet:?xt=urn:btih:1111111111111111111111111111111111111111"
                    .to_string(),
                size: 1_500_000_000,
                seeders: 50,
                leechers: 10,
                quality: VideoQuality::BluRay1080p,
                source: "Mock".to_string(),
                added_date: chrono::Utc::now(),
            },
        ])
    }
}
