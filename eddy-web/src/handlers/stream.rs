//! Ranged streaming of torrent files while they download.

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::Response;
use eddy_core::streaming::{
    ByteRange, FileStreamReader, Readiness, StreamingError, begin_stream, evaluate_readiness,
    hold_escalation, parse_range_header,
};
use eddy_core::torrent::FileEntry;
use futures::StreamExt;

use crate::error::{RETRY_AFTER_SECS, WebError};
use crate::state::AppState;

/// Requested range of a file and whether the client asked for one.
struct Requested {
    range: ByteRange,
    partial: bool,
}

fn requested_range(headers: &HeaderMap, file_length: u64) -> Result<Requested, WebError> {
    let header = headers
        .get(header::RANGE)
        .and_then(|value| value.to_str().ok());
    let parsed = match header {
        Some(header) => parse_range_header(header, file_length)?,
        None => None,
    };
    match parsed {
        Some(range) => Ok(Requested {
            range,
            partial: true,
        }),
        None => ByteRange::full(file_length)
            .map(|range| Requested {
                range,
                partial: false,
            })
            .ok_or(WebError::RangeNotSatisfiable { file_length }),
    }
}

fn empty_file(file: &FileEntry) -> Result<Response, WebError> {
    response_headers(Response::builder(), file, 0)
        .status(StatusCode::OK)
        .body(Body::empty())
        .map_err(internal)
}

fn content_type(file: &FileEntry) -> HeaderValue {
    let mime = mime_guess::from_path(file.file_name()).first_or_octet_stream();
    HeaderValue::from_str(mime.essence_str())
        .unwrap_or(HeaderValue::from_static("application/octet-stream"))
}

fn response_headers(
    builder: axum::http::response::Builder,
    file: &FileEntry,
    content_length: u64,
) -> axum::http::response::Builder {
    builder
        .header(header::CONTENT_TYPE, content_type(file))
        .header(header::ACCEPT_RANGES, "bytes")
        .header(header::CONTENT_LENGTH, content_length)
}

/// `HEAD /stream/{info_hash}/{file_index}`: readiness check.
///
/// The Range header scopes which bytes are checked; the response itself
/// describes the whole file. 200 when every covering piece is verified,
/// 202 while pieces are still expected, 412 once a missing piece is held
/// by no connected peer. A 202 also escalates the range's pieces for up to
/// the stream wait timeout, so polling clients get them first.
///
/// # Errors
/// - `WebError::NotFound` - Unknown torrent or file
/// - `WebError::RangeNotSatisfiable` - Range outside the file
pub async fn head_file(
    State(state): State<AppState>,
    Path((info_hash, file_index)): Path<(String, usize)>,
    headers: HeaderMap,
) -> Result<Response, WebError> {
    let handle = state.torrent_file(&info_hash, file_index).await?;
    let file = handle.metadata().file(file_index)?.clone();
    if file.length == 0 {
        return empty_file(&file);
    }
    let requested = requested_range(&headers, file.length)?;
    handle.scheduler().ensure_critical(file_index)?;

    let readiness = evaluate_readiness(
        &handle,
        file_index,
        requested.range.start,
        requested.range.len(),
    )?;
    tracing::debug!(
        info_hash = %handle.info_hash(),
        file_index,
        start = requested.range.start,
        readiness = ?readiness,
        "Stream readiness checked"
    );

    match readiness {
        Readiness::Ready => response_headers(Response::builder(), &file, file.length)
            .status(StatusCode::OK)
            .body(Body::empty())
            .map_err(internal),
        Readiness::Buffering { .. } => {
            hold_escalation(
                &handle,
                file_index,
                requested.range.start,
                requested.range.len(),
                state.config.streaming.wait_timeout,
            )?;
            Response::builder()
                .status(StatusCode::ACCEPTED)
                .header(header::RETRY_AFTER, RETRY_AFTER_SECS)
                .body(Body::empty())
                .map_err(internal)
        }
        Readiness::Unobtainable { piece } => Err(WebError::Unobtainable { piece }),
    }
}

/// `GET /stream/{info_hash}/{file_index}`: serves a byte range.
///
/// The response starts once the first piece of the range is verified. If
/// it does not arrive within the stream timeout the client gets 202 and
/// retries; if no peer holds it the client gets 412. Dropping the response
/// body releases the read-ahead escalation.
///
/// # Errors
/// - `WebError::NotFound` - Unknown torrent or file
/// - `WebError::RangeNotSatisfiable` - Range outside the file
/// - `WebError::Buffering` - First piece still downloading
/// - `WebError::Unobtainable` - Range needs a piece no peer has
pub async fn stream_file(
    State(state): State<AppState>,
    Path((info_hash, file_index)): Path<(String, usize)>,
    headers: HeaderMap,
) -> Result<Response, WebError> {
    let handle = state.torrent_file(&info_hash, file_index).await?;
    let file = handle.metadata().file(file_index)?.clone();
    if file.length == 0 {
        return empty_file(&file);
    }

    let Requested { range, partial } = requested_range(&headers, file.length)?;
    begin_stream(&handle, file_index, range.start)?;
    if let Readiness::Unobtainable { piece } =
        evaluate_readiness(&handle, file_index, range.start, range.len())?
    {
        return Err(WebError::Unobtainable { piece });
    }

    let mut reader =
        FileStreamReader::new(handle.clone(), file_index, range, &state.config.streaming)?;
    let Some(first) = reader.next_chunk().await? else {
        return Err(WebError::RangeNotSatisfiable {
            file_length: file.length,
        });
    };
    tracing::debug!(
        info_hash = %handle.info_hash(),
        file_index,
        start = range.start,
        end = range.end,
        "Streaming range"
    );

    let body = futures::stream::once(async move { Ok::<_, StreamingError>(first) }).chain(reader.into_stream());
    let mut builder = response_headers(Response::builder(), &file, range.len());
    builder = if partial {
        builder
            .status(StatusCode::PARTIAL_CONTENT)
            .header(header::CONTENT_RANGE, range.content_range(file.length))
    } else {
        builder.status(StatusCode::OK)
    };
    builder.body(Body::from_stream(body)).map_err(internal)
}

fn internal(error: axum::http::Error) -> WebError {
    WebError::Internal {
        reason: error.to_string(),
    }
}
