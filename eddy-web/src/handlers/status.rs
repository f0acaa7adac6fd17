//! Server-sent download status per file.

use std::convert::Infallible;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use eddy_core::streaming::RemuxStatus;
use eddy_core::torrent::{SessionState, TorrentHandle};
use futures::Stream;
use serde::Serialize;

use crate::error::WebError;
use crate::state::AppState;

/// One status message.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusUpdate {
    pub progress_percent: f64,
    pub download_rate_bytes_per_sec: u64,
    pub upload_rate_bytes_per_sec: u64,
    pub peer_count: usize,
    pub state: SessionState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remux: Option<RemuxStatus>,
}

impl StatusUpdate {
    /// Status of one file; progress covers only that file's pieces.
    ///
    /// # Errors
    /// - `WebError::NotFound` - Unknown file index
    pub fn for_file(
        handle: &TorrentHandle,
        file_index: usize,
        remux: Option<RemuxStatus>,
    ) -> Result<Self, WebError> {
        let snapshot = handle.snapshot();
        Ok(Self {
            progress_percent: handle.file_progress(file_index)?,
            download_rate_bytes_per_sec: snapshot.download_rate,
            upload_rate_bytes_per_sec: snapshot.upload_rate,
            peer_count: snapshot.peer_count,
            state: snapshot.state,
            remux,
        })
    }
}

struct Feed {
    state: AppState,
    handle: TorrentHandle,
    file_index: usize,
    interval: tokio::time::Interval,
    finished: bool,
}

/// `GET /status/{info_hash}/{file_index}`: pushes a [`StatusUpdate`] every
/// status interval until the session closes.
///
/// # Errors
/// - `WebError::NotFound` - Unknown torrent or file
pub async fn status_events(
    State(state): State<AppState>,
    Path((info_hash, file_index)): Path<(String, usize)>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, WebError> {
    let handle = state.torrent_file(&info_hash, file_index).await?;
    let period = state.config.streaming.status_interval.max(Duration::from_millis(10));
    let feed = Feed {
        interval: tokio::time::interval(period),
        state,
        handle,
        file_index,
        finished: false,
    };

    let stream = futures::stream::unfold(feed, |mut feed| async move {
        if feed.finished {
            return None;
        }
        feed.interval.tick().await;
        let remux = feed
            .state
            .remux
            .status(feed.handle.info_hash(), feed.file_index);
        let update = StatusUpdate::for_file(&feed.handle, feed.file_index, remux).ok()?;
        feed.finished = update.state == SessionState::Closed;
        let event = Event::default()
            .event("status")
            .json_data(&update)
            .unwrap_or_else(|_| Event::default().comment("unserializable status"));
        Some((Ok(event), feed))
    });

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}
