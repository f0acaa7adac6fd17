//! Remuxed variant of a stream for containers browsers cannot play.

use axum::body::Body;
use axum::extract::{Path, Request, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Json, Redirect, Response};
use eddy_core::streaming::{RemuxError, RemuxStatus};
use tower::ServiceExt;
use tower_http::services::ServeFile;

use crate::error::{RETRY_AFTER_SECS, WebError};
use crate::state::AppState;

/// `GET /remux/{info_hash}/{file_index}`: serves the MP4 once it exists.
///
/// Starts the remux job on first request. Until the output is ready the
/// response is 202 with the job status as JSON. Native containers redirect
/// to the plain stream.
///
/// # Errors
/// - `WebError::NotFound` - Unknown torrent or file
/// - `WebError::UnsupportedMedia` - Container cannot be remuxed
pub async fn stream_remuxed(
    State(state): State<AppState>,
    Path((info_hash, file_index)): Path<(String, usize)>,
    request: Request,
) -> Result<Response, WebError> {
    let handle = state.torrent_file(&info_hash, file_index).await?;
    let status = match state.remux.ensure_started(&handle, file_index).await {
        Ok(receiver) => receiver.borrow().clone(),
        Err(RemuxError::NotRequired { .. }) => {
            let native = format!("/stream/{}/{file_index}", handle.info_hash());
            return Ok(Redirect::temporary(&native).into_response());
        }
        Err(e) => return Err(e.into()),
    };

    match status {
        RemuxStatus::Ready { output, .. } => {
            // Outputs end in .mp4, so ServeFile labels them video/mp4.
            let response = ServeFile::new(output)
                .oneshot(request)
                .await
                .map_err(|e| WebError::Internal {
                    reason: e.to_string(),
                })?;
            Ok(response.map(Body::new))
        }
        RemuxStatus::Failed { reason, .. } => Err(WebError::UnsupportedMedia { reason }),
        pending => Ok((
            StatusCode::ACCEPTED,
            [(header::RETRY_AFTER, RETRY_AFTER_SECS.to_string())],
            Json(pending),
        )
            .into_response()),
    }
}

/// `GET /remux/{info_hash}/{file_index}/status`: job status without
/// starting one.
///
/// # Errors
/// - `WebError::NotFound` - Unknown torrent, file or job
pub async fn remux_status(
    State(state): State<AppState>,
    Path((info_hash, file_index)): Path<(String, usize)>,
) -> Result<Json<RemuxStatus>, WebError> {
    let handle = state.torrent_file(&info_hash, file_index).await?;
    state
        .remux
        .status(handle.info_hash(), file_index)
        .map(Json)
        .ok_or(WebError::NotFound {
            reason: "no remux job for this file".to_string(),
        })
}
