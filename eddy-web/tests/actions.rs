mod common;

use axum::http::StatusCode;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use common::{Harness, PIECE};
use eddy_core::torrent::PiecePriority;
use eddy_core::torrent::swarm::simulation::{SimulatedTorrent, random_content};
use serde_json::json;

fn show() -> SimulatedTorrent {
    SimulatedTorrent::multi_file(
        "Show",
        vec![
            ("episode.mkv", random_content(4 * PIECE as usize, 11)),
            ("trailer.mp4", random_content(2 * PIECE as usize, 12)),
        ],
        PIECE,
    )
}

#[tokio::test]
async fn test_start_download_from_base64_descriptor() {
    let harness = Harness::new();
    let torrent = show();
    harness.swarm.add_torrent(torrent.clone());

    let (status, body) = harness
        .execute(json!({
            "app_id": "player",
            "action": "start_backend_download",
            "params": { "torrent_base64": BASE64.encode(&torrent.descriptor) },
        }))
        .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["success"], true);
    assert_eq!(body["result"]["info_hash"], torrent.info_hash().to_string());
    assert_eq!(body["result"]["name"], "Show");
    assert_eq!(body["result"]["file_count"], 2);
    assert_eq!(body["result"]["total_size"], 6 * PIECE);
    assert!(body.get("error").is_none());
}

#[tokio::test]
async fn test_start_download_needs_a_source() {
    let harness = Harness::new();

    let (status, body) = harness
        .execute(json!({ "action": "start_backend_download", "params": {} }))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["success"], false);

    let (status, body) = harness
        .execute(json!({
            "action": "start_backend_download",
            "params": { "torrent_base64": "***" },
        }))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("base64"));
}

#[tokio::test]
async fn test_magnet_download_fetches_metadata_from_peers() {
    let harness = Harness::new();
    let torrent = show();
    harness.swarm.add_torrent(torrent.clone());
    harness.swarm.add_seeder(torrent.info_hash());

    let (status, body) = harness
        .execute(json!({
            "action": "download_torrent_from_magnet",
            "params": { "magnet": torrent.magnet_uri() },
        }))
        .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["result"]["file_count"], 2);
    assert_eq!(body["result"]["info_hash"], torrent.info_hash().to_string());
}

#[tokio::test]
async fn test_list_files_routes_mkv_through_remux() {
    let harness = Harness::new();
    let torrent = show();
    harness.open(&torrent).await;
    let info_hash = torrent.info_hash().to_string();

    let (status, body) = harness
        .execute(json!({
            "action": "list_torrent_files",
            "params": { "info_hash": info_hash },
        }))
        .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    let files = body["result"].as_array().unwrap();
    assert_eq!(files.len(), 2);

    assert_eq!(files[0]["path"], "episode.mkv");
    assert_eq!(files[0]["container"], "matroska");
    assert_eq!(files[0]["requires_remux"], true);
    assert_eq!(files[0]["stream_url"], format!("/remux/{info_hash}/0"));
    assert_eq!(files[0]["first_piece"], 0);
    assert_eq!(files[0]["last_piece"], 3);

    assert_eq!(files[1]["path"], "trailer.mp4");
    assert_eq!(files[1]["requires_remux"], false);
    assert_eq!(files[1]["stream_url"], format!("/stream/{info_hash}/1"));
    assert_eq!(files[1]["first_piece"], 4);

    let (status, body) = harness
        .execute(json!({
            "action": "get_stream_url",
            "params": { "info_hash": info_hash, "file_index": 1 },
        }))
        .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["result"]["url"], format!("/stream/{info_hash}/1"));
    assert_eq!(body["result"]["mime_type"], "video/mp4");
    assert_eq!(body["result"]["remux"], false);
}

#[tokio::test]
async fn test_download_status_for_torrent_and_file() {
    let harness = Harness::new();
    let torrent = show();
    harness.open(&torrent).await;
    let info_hash = torrent.info_hash().to_string();

    let (status, body) = harness
        .execute(json!({
            "action": "get_download_status",
            "params": { "info_hash": info_hash },
        }))
        .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["result"]["total_pieces"], 6);
    assert_eq!(body["result"]["progress_percent"], 0.0);

    let (status, body) = harness
        .execute(json!({
            "action": "get_download_status",
            "params": { "info_hash": info_hash, "file_index": 0 },
        }))
        .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert!(body["result"]["peer_count"].is_u64());
    assert!(body["result"].get("remux").is_none());

    let (status, _) = harness
        .execute(json!({
            "action": "get_download_status",
            "params": { "info_hash": info_hash, "file_index": 9 },
        }))
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_set_piece_priority_validates_range_and_level() {
    let harness = Harness::new();
    let torrent = show();
    harness.open(&torrent).await;
    let info_hash = torrent.info_hash().to_string();

    let (status, body) = harness
        .execute(json!({
            "action": "set_piece_priority",
            "params": { "info_hash": info_hash, "start_piece": 2, "end_piece": 4, "priority": "critical" },
        }))
        .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["result"]["priority"], "critical");
    let handle = harness.state.engine.get(torrent.info_hash()).await.unwrap();
    assert_eq!(
        handle.scheduler().planned_priority(3),
        Some(PiecePriority::Critical)
    );

    let (status, body) = harness
        .execute(json!({
            "action": "set_piece_priority",
            "params": { "info_hash": info_hash, "start_piece": 4, "end_piece": 40, "priority": "high" },
        }))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["success"], false);

    let (status, _) = harness
        .execute(json!({
            "action": "set_piece_priority",
            "params": { "info_hash": info_hash, "start_piece": 0, "end_piece": 1, "priority": "asap" },
        }))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_seek_prefetch_moves_window() {
    let harness = Harness::new();
    let torrent = show();
    harness.open(&torrent).await;

    let (status, body) = harness
        .execute(json!({
            "action": "seek_prefetch",
            "params": {
                "info_hash": torrent.info_hash().to_string(),
                "file_index": 0,
                "byte_offset": 2 * PIECE,
                "window_bytes": PIECE,
            },
        }))
        .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["result"]["file_index"], 0);
    assert_eq!(body["result"]["byte_offset"], 2 * PIECE);
    assert_eq!(body["result"]["window_bytes"], PIECE);

    let (status, _) = harness
        .execute(json!({
            "action": "seek_prefetch",
            "params": {
                "info_hash": torrent.info_hash().to_string(),
                "file_index": 5,
                "byte_offset": 0,
            },
        }))
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_search_torrents_ranks_best_release_first() {
    let harness = Harness::new();

    let (status, body) = harness
        .execute(json!({
            "action": "search_torrents",
            "params": { "query": "Big Buck Bunny" },
        }))
        .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    let results = body["result"].as_array().unwrap();
    assert_eq!(results.len(), 2);
    assert!(results[0]["name"].as_str().unwrap().contains("1080p"));
    assert!(results[1]["name"].as_str().unwrap().contains("720p"));

    let (status, _) = harness
        .execute(json!({ "action": "search_torrents", "params": { "query": "  " } }))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_subtitle_search_then_download_yields_webvtt() {
    let harness = Harness::new();

    let (status, body) = harness
        .execute(json!({
            "action": "search_subtitles",
            "params": { "query": "sintel" },
        }))
        .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    let candidates = body["result"].as_array().unwrap();
    assert_eq!(candidates.len(), 1);
    assert_eq!(candidates[0]["language"], "en");

    let (status, body) = harness
        .execute(json!({
            "action": "download_subtitle",
            "params": candidates[0].clone(),
        }))
        .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["result"]["source_format"], "srt");
    let content = body["result"]["content"].as_str().unwrap();
    assert!(content.starts_with("WEBVTT\n\n"));
    assert!(content.contains("00:00:01.000 --> 00:00:03.000"));
    assert!(content.contains("Hello"));

    let (status, body) = harness
        .execute(json!({
            "action": "search_subtitles",
            "params": { "query": "sintel", "language": "fr" },
        }))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["result"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_malformed_and_unknown_actions_are_rejected() {
    let harness = Harness::new();

    let (status, body) = harness
        .execute(json!({ "action": "format_disk", "params": {} }))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["success"], false);

    let (status, _) = harness
        .execute(json!({ "action": "list_torrent_files", "params": { "hash": "x" } }))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = harness
        .execute(json!({
            "action": "list_torrent_files",
            "params": { "info_hash": "zz" },
        }))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_remove_torrent_forgets_it() {
    let harness = Harness::new();
    let torrent = show();
    harness.open(&torrent).await;
    let info_hash = torrent.info_hash().to_string();

    let (status, body) = harness
        .execute(json!({
            "action": "remove_torrent",
            "params": { "info_hash": info_hash, "delete_data": true },
        }))
        .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["result"]["removed"], info_hash);

    let (status, body) = harness
        .execute(json!({
            "action": "get_download_status",
            "params": { "info_hash": info_hash },
        }))
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["success"], false);
}
