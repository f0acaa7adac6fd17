//! Subtitle providers.

use std::collections::HashMap;
use std::fmt::Debug;

use async_trait::async_trait;
use bytes::Bytes;
use serde::Deserialize;

use super::{SubtitleCandidate, SubtitleError};
use crate::config::SubtitleConfig;

/// Source of subtitle files.
#[async_trait]
pub trait SubtitleProvider: Send + Sync + Debug {
    /// Finds subtitles for `query` in `language` (ISO 639-1 code).
    ///
    /// # Errors
    /// - `SubtitleError::Disabled` - Provider has no credentials
    /// - `SubtitleError::Network` - Provider unreachable
    /// - `SubtitleError::Provider` - Provider rejected the request
    async fn search(
        &self,
        query: &str,
        language: &str,
    ) -> Result<Vec<SubtitleCandidate>, SubtitleError>;

    /// Downloads the raw subtitle file for a candidate.
    ///
    /// # Errors
    /// - `SubtitleError::NotFound` - Candidate no longer exists
    /// - `SubtitleError::Network` - Provider unreachable
    async fn download(&self, candidate: &SubtitleCandidate) -> Result<Bytes, SubtitleError>;

    /// Name reported in candidates.
    fn name(&self) -> &'static str;
}

/// OpenSubtitles REST API client.
#[derive(Debug)]
pub struct OpenSubtitlesProvider {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    data: Vec<SearchEntry>,
}

#[derive(Debug, Deserialize)]
struct SearchEntry {
    attributes: SearchAttributes,
}

#[derive(Debug, Deserialize)]
struct SearchAttributes {
    #[serde(default)]
    language: String,
    #[serde(default)]
    release: String,
    #[serde(default)]
    download_count: u64,
    #[serde(default)]
    files: Vec<SearchFile>,
}

#[derive(Debug, Deserialize)]
struct SearchFile {
    file_id: u64,
    #[serde(default)]
    file_name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DownloadResponse {
    link: String,
}

impl OpenSubtitlesProvider {
    /// Creates a client from configuration.
    ///
    /// # Errors
    /// - `SubtitleError::Network` - HTTP client construction failed
    pub fn new(config: &SubtitleConfig) -> Result<Self, SubtitleError> {
        let client = reqwest::Client::builder()
            .user_agent(config.user_agent)
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| SubtitleError::Network {
                reason: e.to_string(),
            })?;
        Ok(Self {
            client,
            base_url: config.api_base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
        })
    }

    fn api_key(&self) -> Result<&str, SubtitleError> {
        self.api_key.as_deref().ok_or(SubtitleError::Disabled)
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response, SubtitleError> {
        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(SubtitleError::NotFound);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SubtitleError::Provider {
                reason: format!("HTTP {status}: {}", body.trim()),
            });
        }
        Ok(response)
    }
}

fn network(error: reqwest::Error) -> SubtitleError {
    SubtitleError::Network {
        reason: error.to_string(),
    }
}

#[async_trait]
impl SubtitleProvider for OpenSubtitlesProvider {
    async fn search(
        &self,
        query: &str,
        language: &str,
    ) -> Result<Vec<SubtitleCandidate>, SubtitleError> {
        let api_key = self.api_key()?;
        let response = self
            .client
            .get(format!("{}/subtitles", self.base_url))
            .header("Api-Key", api_key)
            .query(&[("query", query), ("languages", language)])
            .send()
            .await
            .map_err(network)?;
        let body: SearchResponse = Self::check(response)
            .await?
            .json()
            .await
            .map_err(|e| SubtitleError::Provider {
                reason: format!("unexpected search response: {e}"),
            })?;

        let candidates: Vec<_> = body
            .data
            .into_iter()
            .flat_map(|entry| {
                let attributes = entry.attributes;
                attributes.files.into_iter().map(move |file| SubtitleCandidate {
                    id: file.file_id.to_string(),
                    language: attributes.language.clone(),
                    release: attributes.release.clone(),
                    file_name: file
                        .file_name
                        .unwrap_or_else(|| format!("{}.srt", attributes.release)),
                    download_count: attributes.download_count,
                    provider: self.name().to_string(),
                })
            })
            .collect();
        tracing::debug!(query, language, results = candidates.len(), "Subtitle search");
        Ok(candidates)
    }

    async fn download(&self, candidate: &SubtitleCandidate) -> Result<Bytes, SubtitleError> {
        let api_key = self.api_key()?;
        let file_id: u64 = candidate.id.parse().map_err(|_| SubtitleError::NotFound)?;
        let response = self
            .client
            .post(format!("{}/download", self.base_url))
            .header("Api-Key", api_key)
            .json(&HashMap::from([("file_id", file_id)]))
            .send()
            .await
            .map_err(network)?;
        let link: DownloadResponse =
            Self::check(response)
                .await?
                .json()
                .await
                .map_err(|e| SubtitleError::Provider {
                    reason: format!("unexpected download response: {e}"),
                })?;

        let file = self.client.get(&link.link).send().await.map_err(network)?;
        Self::check(file).await?.bytes().await.map_err(network)
    }

    fn name(&self) -> &'static str {
        "opensubtitles"
    }
}

/// In-memory provider with fixed files, for tests and offline use.
#[derive(Debug, Default)]
pub struct StaticSubtitleProvider {
    entries: Vec<(SubtitleCandidate, Bytes)>,
}

impl StaticSubtitleProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a file matched by any query contained in `release`.
    pub fn with_file(
        mut self,
        release: &str,
        language: &str,
        file_name: &str,
        content: impl Into<Bytes>,
    ) -> Self {
        let candidate = SubtitleCandidate {
            id: self.entries.len().to_string(),
            language: language.to_string(),
            release: release.to_string(),
            file_name: file_name.to_string(),
            download_count: 0,
            provider: "static".to_string(),
        };
        self.entries.push((candidate, content.into()));
        self
    }
}

#[async_trait]
impl SubtitleProvider for StaticSubtitleProvider {
    async fn search(
        &self,
        query: &str,
        language: &str,
    ) -> Result<Vec<SubtitleCandidate>, SubtitleError> {
        let query = query.to_lowercase();
        Ok(self
            .entries
            .iter()
            .filter(|(candidate, _)| {
                candidate.language == language
                    && candidate.release.to_lowercase().contains(&query)
            })
            .map(|(candidate, _)| candidate.clone())
            .collect())
    }

    async fn download(&self, candidate: &SubtitleCandidate) -> Result<Bytes, SubtitleError> {
        self.entries
            .iter()
            .find(|(entry, _)| entry.id == candidate.id)
            .map(|(_, content)| content.clone())
            .ok_or(SubtitleError::NotFound)
    }

    fn name(&self) -> &'static str {
        "static"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_open_subtitles_without_key_is_disabled() {
        let provider = OpenSubtitlesProvider::new(&SubtitleConfig::default()).unwrap();
        assert!(matches!(
            provider.search("big buck bunny", "en").await,
            Err(SubtitleError::Disabled)
        ));
    }

    #[test]
    fn test_search_response_parsing() {
        let body = r#"{"total_count":1,"data":[{"id":"9000","type":"subtitle","attributes":{
            "language":"en","release":"Big.Buck.Bunny.2008","download_count":42,
            "files":[{"file_id":1234,"file_name":"bbb.en.srt"}]}}]}"#;
        let parsed: SearchResponse = serde_json::from_str(body).unwrap();
        let attributes = &parsed.data[0].attributes;
        assert_eq!(attributes.language, "en");
        assert_eq!(attributes.download_count, 42);
        assert_eq!(attributes.files[0].file_id, 1234);
    }

    #[tokio::test]
    async fn test_static_provider_filters_by_language() {
        let provider = StaticSubtitleProvider::new()
            .with_file("Sintel.2010", "en", "sintel.en.srt", "x")
            .with_file("Sintel.2010", "de", "sintel.de.srt", "y");

        let results = provider.search("sintel", "de").await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].file_name, "sintel.de.srt");
        assert_eq!(provider.download(&results[0]).await.unwrap(), Bytes::from("y"));
    }
}
