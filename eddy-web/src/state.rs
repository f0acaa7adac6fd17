//! Shared state handed to every handler.

use std::str::FromStr;
use std::sync::Arc;

use eddy_core::EddyConfig;
use eddy_core::streaming::{FfmpegProcessor, ProductionFfmpeg, RemuxPipeline};
use eddy_core::subtitles::{OpenSubtitlesProvider, SubtitleBridge, SubtitleProvider};
use eddy_core::torrent::{EngineHandle, InfoHash, SwarmTransport, TorrentHandle, spawn_engine};
use eddy_search::{HttpSearchProvider, TorrentSearch, TorrentSearchProvider};

use crate::error::WebError;

/// Engine, remux pipeline and providers behind the HTTP surface.
#[derive(Clone)]
pub struct AppState {
    pub engine: EngineHandle,
    pub config: Arc<EddyConfig>,
    pub remux: Arc<RemuxPipeline>,
    pub search: TorrentSearch,
    pub subtitles: Arc<SubtitleBridge>,
}

impl AppState {
    /// Wires the production engine, ffmpeg and HTTP providers.
    ///
    /// # Errors
    /// - `WebError::Internal` - An HTTP client could not be built
    pub fn production(config: EddyConfig) -> Result<Self, WebError> {
        let transport = SwarmTransport::tcp(&config)?;
        let subtitles = OpenSubtitlesProvider::new(&config.subtitles)?;
        let search = HttpSearchProvider::new(&config.search);
        let ffmpeg = ProductionFfmpeg::new(&config.remux.ffmpeg_path);
        Ok(Self::with_components(
            config,
            transport,
            Arc::new(ffmpeg),
            Arc::new(search),
            Arc::new(subtitles),
        ))
    }

    /// Assembles state from explicit components, used by tests and
    /// simulation.
    pub fn with_components(
        config: EddyConfig,
        transport: SwarmTransport,
        ffmpeg: Arc<dyn FfmpegProcessor>,
        search: Arc<dyn TorrentSearchProvider>,
        subtitles: Arc<dyn SubtitleProvider>,
    ) -> Self {
        let engine = spawn_engine(config.clone(), transport);
        let remux = Arc::new(RemuxPipeline::new(config.remux.clone(), ffmpeg));
        Self {
            engine,
            config: Arc::new(config),
            remux,
            search: TorrentSearch::new(search),
            subtitles: Arc::new(SubtitleBridge::new(subtitles)),
        }
    }

    /// Looks up a running torrent by its hex info hash.
    ///
    /// # Errors
    /// - `WebError::BadRequest` - Malformed hash
    /// - `WebError::NotFound` - No such torrent
    pub async fn torrent(&self, info_hash: &str) -> Result<TorrentHandle, WebError> {
        let info_hash = InfoHash::from_str(info_hash)?;
        Ok(self.engine.get(info_hash).await?)
    }

    /// Looks up a torrent and checks the file index against its layout.
    ///
    /// # Errors
    /// - `WebError::BadRequest` - Malformed hash
    /// - `WebError::NotFound` - No such torrent or file
    pub async fn torrent_file(
        &self,
        info_hash: &str,
        file_index: usize,
    ) -> Result<TorrentHandle, WebError> {
        let handle = self.torrent(info_hash).await?;
        handle.metadata().file(file_index)?;
        Ok(handle)
    }
}
