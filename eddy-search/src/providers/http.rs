//! JSON indexer provider.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use eddy_core::config::SearchConfig;
use serde::Deserialize;

use super::TorrentSearchProvider;
use crate::errors::MediaSearchError;
use crate::types::{TorrentResult, VideoQuality};

const RESULT_LIMIT: &str = "50";

/// Searches an indexer exposing `GET /api/v1/search`.
#[derive(Debug)]
pub struct HttpSearchProvider {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    results: Vec<IndexerTorrent>,
}

#[derive(Debug, Deserialize)]
struct IndexerTorrent {
    name: String,
    magnet: String,
    size: u64,
    #[serde(default)]
    seeders: u32,
    #[serde(default)]
    leechers: u32,
    #[serde(default)]
    indexer: String,
    #[serde(rename = "publishDate", default)]
    publish_date: Option<String>,
}

impl HttpSearchProvider {
    pub fn new(config: &SearchConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
        }
    }

    fn into_result(torrent: IndexerTorrent) -> TorrentResult {
        let added_date = torrent
            .publish_date
            .as_deref()
            .and_then(|date| DateTime::parse_from_rfc3339(date).ok())
            .map(|date| date.with_timezone(&Utc))
            .unwrap_or_else(Utc::now);
        TorrentResult {
            quality: VideoQuality::from_release_name(&torrent.name),
            name: torrent.name,
            magnet_link: torrent.magnet,
            size: torrent.size,
            seeders: torrent.seeders,
            leechers: torrent.leechers,
            source: torrent.indexer,
            added_date,
        }
    }
}

#[async_trait]
impl TorrentSearchProvider for HttpSearchProvider {
    async fn search_torrents(
        &self,
        query: &str,
        category: Option<&str>,
    ) -> Result<Vec<TorrentResult>, MediaSearchError> {
        let url = format!("{}/api/v1/search", self.base_url);

        let mut params = vec![("query", query), ("limit", RESULT_LIMIT)];
        if let Some(category) = category {
            params.push(("category", category));
        }
        if let Some(api_key) = &self.api_key {
            params.push(("apikey", api_key.as_str()));
        }

        let response = self
            .client
            .get(&url)
            .query(&params)
            .send()
            .await
            .map_err(|e| MediaSearchError::NetworkError {
                reason: format!("Indexer request failed: {e}"),
            })?;

        if !response.status().is_success() {
            return Err(MediaSearchError::SearchFailed {
                query: query.to_string(),
                reason: format!("Indexer HTTP {}", response.status()),
            });
        }

        let body: SearchResponse =
            response
                .json()
                .await
                .map_err(|e| MediaSearchError::ParseError {
                    reason: format!("Indexer JSON parsing failed: {e}"),
                })?;

        tracing::debug!(query, results = body.results.len(), "Indexer search");
        Ok(body.results.into_iter().map(Self::into_result).collect())
    }
}
