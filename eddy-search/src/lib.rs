//! Eddy Search - torrent discovery
//!
//! Queries an indexer for releases matching a title and ranks them for
//! streaming: playable quality first, then swarm health.

pub mod errors;
pub mod providers;
pub mod search;
pub mod types;

pub use errors::MediaSearchError;
pub use providers::{HttpSearchProvider, TorrentSearchProvider};
#[cfg(any(test, feature = "test-utils"))]
pub use providers::MockProvider;
pub use search::TorrentSearch;
pub use types::{TorrentResult, VideoQuality};

/// Convenience type alias for Results with MediaSearchError.
pub type Result<T> = std::result::Result<T, MediaSearchError>;
