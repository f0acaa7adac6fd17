//! `POST /api/execute`: named actions dispatched onto a closed enum.
//!
//! Action names only exist at this boundary; everything behind it works on
//! typed parameters.

use std::str::FromStr;

use axum::Json;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, Utc};
use eddy_core::streaming::{ContainerFormat, RemuxPipeline};
use eddy_core::subtitles::SubtitleCandidate;
use eddy_core::torrent::{InfoHash, PiecePriority, TorrentHandle, TorrentMetadata, TorrentSource};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use super::status::StatusUpdate;
use crate::error::WebError;
use crate::state::AppState;

/// Request body: `{app_id, action, params}`.
#[derive(Debug, Deserialize)]
pub struct ActionRequest {
    #[serde(default)]
    pub app_id: Option<String>,
    #[serde(flatten)]
    pub action: Action,
}

/// Every operation reachable through action dispatch.
#[derive(Debug, Deserialize)]
#[serde(tag = "action", content = "params", rename_all = "snake_case")]
pub enum Action {
    StartBackendDownload(StartDownloadParams),
    ListTorrentFiles(TorrentParams),
    GetDownloadStatus(StatusParams),
    GetStreamUrl(FileParams),
    SetPiecePriority(PiecePriorityParams),
    SeekPrefetch(SeekParams),
    SearchTorrents(SearchParams),
    DownloadTorrentFromMagnet(MagnetParams),
    SearchSubtitles(SubtitleSearchParams),
    DownloadSubtitle(SubtitleCandidate),
    RemoveTorrent(RemoveParams),
}

impl Action {
    fn name(&self) -> &'static str {
        match self {
            Self::StartBackendDownload(_) => "start_backend_download",
            Self::ListTorrentFiles(_) => "list_torrent_files",
            Self::GetDownloadStatus(_) => "get_download_status",
            Self::GetStreamUrl(_) => "get_stream_url",
            Self::SetPiecePriority(_) => "set_piece_priority",
            Self::SeekPrefetch(_) => "seek_prefetch",
            Self::SearchTorrents(_) => "search_torrents",
            Self::DownloadTorrentFromMagnet(_) => "download_torrent_from_magnet",
            Self::SearchSubtitles(_) => "search_subtitles",
            Self::DownloadSubtitle(_) => "download_subtitle",
            Self::RemoveTorrent(_) => "remove_torrent",
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct StartDownloadParams {
    /// Base64 of a `.torrent` descriptor
    #[serde(default)]
    pub torrent_base64: Option<String>,
    #[serde(default)]
    pub magnet: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct TorrentParams {
    pub info_hash: String,
}

#[derive(Debug, Deserialize)]
pub struct StatusParams {
    pub info_hash: String,
    /// Limits progress to one file
    #[serde(default)]
    pub file_index: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct FileParams {
    pub info_hash: String,
    pub file_index: usize,
}

#[derive(Debug, Deserialize)]
pub struct PiecePriorityParams {
    pub info_hash: String,
    pub start_piece: u32,
    /// Exclusive
    pub end_piece: u32,
    pub priority: String,
}

#[derive(Debug, Deserialize)]
pub struct SeekParams {
    pub info_hash: String,
    pub file_index: usize,
    pub byte_offset: u64,
    #[serde(default)]
    pub window_bytes: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct SearchParams {
    pub query: String,
    #[serde(default)]
    pub category: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct MagnetParams {
    pub magnet: String,
}

#[derive(Debug, Deserialize)]
pub struct SubtitleSearchParams {
    pub query: String,
    #[serde(default = "default_language")]
    pub language: String,
}

fn default_language() -> String {
    "en".to_string()
}

#[derive(Debug, Deserialize)]
pub struct RemoveParams {
    pub info_hash: String,
    #[serde(default)]
    pub delete_data: bool,
}

/// Response body: `{success, result?, error?}`.
#[derive(Debug, Serialize)]
pub struct ActionResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ActionResponse {
    fn ok(result: Value) -> Self {
        Self {
            success: true,
            result: Some(result),
            error: None,
        }
    }

    fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            result: None,
            error: Some(error.into()),
        }
    }
}

/// Record of a torrent handed to the engine. Persisting it is up to the
/// caller.
#[derive(Debug, Clone, Serialize)]
pub struct UploadRecord {
    pub name: String,
    pub info_hash: InfoHash,
    pub file_count: usize,
    pub total_size: u64,
    pub uploaded_at: DateTime<Utc>,
}

impl UploadRecord {
    fn new(metadata: &TorrentMetadata) -> Self {
        Self {
            name: metadata.name.clone(),
            info_hash: metadata.info_hash,
            file_count: metadata.files.len(),
            total_size: metadata.total_length,
            uploaded_at: Utc::now(),
        }
    }
}

/// One entry of `list_torrent_files`.
#[derive(Debug, Clone, Serialize)]
pub struct FileInfo {
    pub index: usize,
    pub path: String,
    pub length: u64,
    pub first_piece: Option<u32>,
    pub last_piece: Option<u32>,
    pub progress_percent: f64,
    pub container: ContainerFormat,
    pub requires_remux: bool,
    pub stream_url: String,
}

/// Playback location returned by `get_stream_url`.
#[derive(Debug, Clone, Serialize)]
pub struct StreamUrl {
    pub url: String,
    pub container: ContainerFormat,
    pub mime_type: &'static str,
    pub remux: bool,
}

/// Executes one action.
pub async fn execute(State(state): State<AppState>, body: Bytes) -> Response {
    let request: ActionRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(e) => {
            tracing::debug!(error = %e, "Rejected action request");
            return (
                StatusCode::BAD_REQUEST,
                Json(ActionResponse::failed(format!("Invalid action request: {e}"))),
            )
                .into_response();
        }
    };

    let name = request.action.name();
    tracing::info!(action = name, app_id = ?request.app_id, "Executing action");
    match dispatch(&state, request.action).await {
        Ok(result) => Json(ActionResponse::ok(result)).into_response(),
        Err(error) => {
            tracing::debug!(action = name, error = %error, "Action failed");
            (error.status_code(), Json(ActionResponse::failed(error.to_string()))).into_response()
        }
    }
}

async fn dispatch(state: &AppState, action: Action) -> Result<Value, WebError> {
    match action {
        Action::StartBackendDownload(params) => {
            let source = match (params.torrent_base64, params.magnet) {
                (Some(encoded), _) => {
                    let bytes = BASE64.decode(encoded.trim()).map_err(|e| WebError::BadRequest {
                        reason: format!("torrent_base64 is not valid base64: {e}"),
                    })?;
                    TorrentSource::Descriptor(bytes)
                }
                (None, Some(magnet)) => TorrentSource::Magnet(magnet),
                (None, None) => {
                    return Err(WebError::BadRequest {
                        reason: "expected torrent_base64 or magnet".to_string(),
                    });
                }
            };
            start_download(state, source).await
        }
        Action::DownloadTorrentFromMagnet(params) => {
            start_download(state, TorrentSource::Magnet(params.magnet)).await
        }
        Action::ListTorrentFiles(params) => {
            let handle = state.torrent(&params.info_hash).await?;
            to_json(list_files(&handle).await?)
        }
        Action::GetDownloadStatus(params) => {
            let info_hash = InfoHash::from_str(&params.info_hash)?;
            if let Some(file_index) = params.file_index {
                let handle = state.engine.get(info_hash).await?;
                let remux = state.remux.status(info_hash, file_index);
                return to_json(StatusUpdate::for_file(&handle, file_index, remux)?);
            }
            let snapshot = state.engine.snapshot(info_hash).await?;
            to_json(json!({
                "progress_percent": snapshot.progress_percent,
                "download_rate_bytes_per_sec": snapshot.download_rate,
                "upload_rate_bytes_per_sec": snapshot.upload_rate,
                "peer_count": snapshot.peer_count,
                "state": snapshot.state,
                "completed_pieces": snapshot.completed_pieces,
                "total_pieces": snapshot.total_pieces,
            }))
        }
        Action::GetStreamUrl(params) => {
            let handle = state.torrent_file(&params.info_hash, params.file_index).await?;
            handle.scheduler().ensure_critical(params.file_index)?;
            let container = RemuxPipeline::container_format(&handle, params.file_index).await?;
            to_json(stream_url(&handle, params.file_index, container))
        }
        Action::SetPiecePriority(params) => {
            let handle = state.torrent(&params.info_hash).await?;
            let level = PiecePriority::from_str(&params.priority)?;
            let piece_count = handle.metadata().piece_count();
            if params.start_piece >= params.end_piece || params.end_piece > piece_count {
                return Err(WebError::BadRequest {
                    reason: format!(
                        "piece range {}..{} is outside 0..{piece_count}",
                        params.start_piece, params.end_piece
                    ),
                });
            }
            handle.set_priority(params.start_piece..params.end_piece, level);
            to_json(json!({
                "start_piece": params.start_piece,
                "end_piece": params.end_piece,
                "priority": format!("{level:?}").to_lowercase(),
            }))
        }
        Action::SeekPrefetch(params) => {
            let handle = state.torrent_file(&params.info_hash, params.file_index).await?;
            let scheduler = handle.scheduler();
            scheduler.on_seek(params.file_index, params.byte_offset, params.window_bytes)?;
            to_json(scheduler.active_window())
        }
        Action::SearchTorrents(params) => {
            let results = state
                .search
                .search(&params.query, params.category.as_deref())
                .await?;
            to_json(results)
        }
        Action::SearchSubtitles(params) => {
            let candidates = state
                .subtitles
                .search(&params.query, &params.language)
                .await?;
            to_json(candidates)
        }
        Action::DownloadSubtitle(candidate) => {
            to_json(state.subtitles.fetch_and_convert(&candidate).await?)
        }
        Action::RemoveTorrent(params) => {
            let info_hash = InfoHash::from_str(&params.info_hash)?;
            state.engine.close(info_hash, params.delete_data).await?;
            state.remux.forget(info_hash).await;
            to_json(json!({ "removed": info_hash }))
        }
    }
}

async fn start_download(state: &AppState, source: TorrentSource) -> Result<Value, WebError> {
    let handle = state.engine.open(source).await?;
    let record = UploadRecord::new(handle.metadata());
    tracing::info!(
        info_hash = %record.info_hash,
        name = %record.name,
        files = record.file_count,
        "Download started"
    );
    to_json(record)
}

async fn list_files(handle: &TorrentHandle) -> Result<Vec<FileInfo>, WebError> {
    let metadata = handle.metadata();
    let mut files = Vec::with_capacity(metadata.files.len());
    for file in &metadata.files {
        let container = RemuxPipeline::container_format(handle, file.index).await?;
        let url = stream_url(handle, file.index, container);
        files.push(FileInfo {
            index: file.index,
            path: file.display_path(),
            length: file.length,
            first_piece: file.first_piece().map(|piece| piece.as_u32()),
            last_piece: file.last_piece().map(|piece| piece.as_u32()),
            progress_percent: handle.file_progress(file.index)?,
            container,
            requires_remux: url.remux,
            stream_url: url.url,
        });
    }
    Ok(files)
}

fn stream_url(handle: &TorrentHandle, file_index: usize, container: ContainerFormat) -> StreamUrl {
    let remux = container.requires_remux() && container != ContainerFormat::Unknown;
    let prefix = if remux { "remux" } else { "stream" };
    StreamUrl {
        url: format!("/{prefix}/{}/{file_index}", handle.info_hash()),
        container,
        mime_type: if remux {
            ContainerFormat::Mp4.mime_type()
        } else {
            container.mime_type()
        },
        remux,
    }
}

fn to_json(value: impl Serialize) -> Result<Value, WebError> {
    serde_json::to_value(value).map_err(|e| WebError::Internal {
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_action_request_parsing() {
        let request: ActionRequest = serde_json::from_str(
            r#"{"app_id":"player","action":"seek_prefetch",
                "params":{"info_hash":"00","file_index":1,"byte_offset":4096}}"#,
        )
        .unwrap();
        assert_eq!(request.app_id.as_deref(), Some("player"));
        match request.action {
            Action::SeekPrefetch(params) => {
                assert_eq!(params.file_index, 1);
                assert_eq!(params.byte_offset, 4096);
                assert_eq!(params.window_bytes, None);
            }
            other => panic!("parsed as {}", other.name()),
        }
    }

    #[test]
    fn test_subtitle_language_defaults_to_english() {
        let request: ActionRequest = serde_json::from_str(
            r#"{"action":"search_subtitles","params":{"query":"sintel"}}"#,
        )
        .unwrap();
        assert!(request.app_id.is_none());
        assert!(matches!(
            request.action,
            Action::SearchSubtitles(SubtitleSearchParams { ref language, .. }) if language == "en"
        ));
    }

    #[test]
    fn test_unknown_action_rejected() {
        let parsed = serde_json::from_str::<ActionRequest>(
            r#"{"action":"format_disk","params":{}}"#,
        );
        assert!(parsed.is_err());
    }
}
