//! Error types for torrent search.

use thiserror::Error;

/// Errors that can occur during torrent search operations.
#[derive(Debug, Error)]
pub enum MediaSearchError {
    /// Query was blank after trimming.
    #[error("Search query is empty")]
    EmptyQuery,

    /// Search operation failed with the specified query and reason.
    #[error("Search failed for query '{query}': {reason}")]
    SearchFailed { query: String, reason: String },

    /// Indexer could not be reached.
    #[error("Network error: {reason}")]
    NetworkError { reason: String },

    /// Indexer response could not be decoded.
    #[error("Parse error: {reason}")]
    ParseError { reason: String },
}
