//! Ranked torrent search over a provider.

use std::collections::HashSet;
use std::sync::Arc;

use eddy_core::torrent::MagnetParser;

use crate::errors::MediaSearchError;
use crate::providers::TorrentSearchProvider;
use crate::types::TorrentResult;

/// Searches a provider and ranks releases for streaming.
#[derive(Debug, Clone)]
pub struct TorrentSearch {
    provider: Arc<dyn TorrentSearchProvider>,
}

impl TorrentSearch {
    pub fn new(provider: Arc<dyn TorrentSearchProvider>) -> Self {
        Self { provider }
    }

    /// Releases for `query`, best first.
    ///
    /// Results without a parseable magnet link are dropped, and releases
    /// listed by several indexers appear once.
    ///
    /// # Errors
    /// - `MediaSearchError::EmptyQuery` - Blank query
    /// - Any provider error
    pub async fn search(
        &self,
        query: &str,
        category: Option<&str>,
    ) -> Result<Vec<TorrentResult>, MediaSearchError> {
        let query = query.trim();
        if query.is_empty() {
            return Err(MediaSearchError::EmptyQuery);
        }

        let results = self.provider.search_torrents(query, category).await?;
        let total = results.len();
        let mut seen = HashSet::new();
        let mut ranked: Vec<_> = results
            .into_iter()
            .filter(|result| match MagnetParser::parse_magnet_link(&result.magnet_link) {
                Ok(magnet) => seen.insert(magnet.info_hash),
                Err(_) => false,
            })
            .collect();
        ranked.sort_by(|a, b| {
            b.priority_score()
                .cmp(&a.priority_score())
                .then(b.seeders.cmp(&a.seeders))
        });

        tracing::info!(query, total, kept = ranked.len(), "Torrent search");
        Ok(ranked)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::MockProvider;
    use crate::types::VideoQuality;

    fn release(name: &str, hash_digit: char, seeders: u32) -> TorrentResult {
        TorrentResult {
            name: name.to_string(),
            magnet_link: format!("magnet:?xt=urn:btih:{}", hash_digit.to_string().repeat(40)),
            size: 1,
            seeders,
            leechers: 0,
            quality: VideoQuality::from_release_name(name),
            source: "test".to_string(),
            added_date: chrono::Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_ranked_best_first() {
        let search = TorrentSearch::new(Arc::new(MockProvider::new()));
        let results = search.search("big buck bunny", None).await.unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].quality, VideoQuality::BluRay1080p);
        assert!(results[0].name.starts_with("big.buck.bunny"));
    }

    #[tokio::test]
    async fn test_duplicates_and_bad_magnets_dropped() {
        let mut broken = release("Broken.1080p", '3', 99);
        broken.magnet_link = "not a magnet".to_string();
        let provider = MockProvider::with_results(vec![
            release("Sintel.720p.HDTV", 'a', 10),
            release("Sintel.720p.HDTV", 'a', 10),
            release("Sintel.1080p.BluRay", 'b', 1),
            broken,
        ]);
        let search = TorrentSearch::new(Arc::new(provider));

        let results = search.search("sintel", Some("movies")).await.unwrap();
        let names: Vec<_> = results.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, ["Sintel.1080p.BluRay", "Sintel.720p.HDTV"]);
    }

    #[tokio::test]
    async fn test_empty_query() {
        let search = TorrentSearch::new(Arc::new(MockProvider::new()));
        assert!(matches!(search.search(" ", None).await, Err(MediaSearchError::EmptyQuery)));
    }
}
