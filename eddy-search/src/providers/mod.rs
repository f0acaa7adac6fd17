//! Provider implementations for torrent search functionality.

use async_trait::async_trait;

use crate::errors::MediaSearchError;
use crate::types::TorrentResult;

pub mod http;
#[cfg(any(test, feature = "test-utils"))]
pub mod mock;

pub use http::HttpSearchProvider;
#[cfg(any(test, feature = "test-utils"))]
pub use mock::MockProvider;

/// Trait for torrent search providers.
#[async_trait]
pub trait TorrentSearchProvider: Send + Sync + std::fmt::Debug {
    /// Search for torrents by query and optional category filter.
    ///
    /// # Errors
    /// - `MediaSearchError::SearchFailed` - Indexer rejected the search
    /// - `MediaSearchError::NetworkError` - Network connectivity issues
    /// - `MediaSearchError::ParseError` - Unreadable indexer response
    async fn search_torrents(
        &self,
        query: &str,
        category: Option<&str>,
    ) -> Result<Vec<TorrentResult>, MediaSearchError>;
}
