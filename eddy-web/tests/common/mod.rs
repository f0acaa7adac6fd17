//! Router over a simulated swarm for end-to-end tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::body::Body;
use axum::http::{Method, Request, Response, StatusCode};
use eddy_core::EddyConfig;
use eddy_core::streaming::remux::SimulatedFfmpeg;
use eddy_core::subtitles::StaticSubtitleProvider;
use eddy_core::torrent::TorrentSource;
use eddy_core::torrent::swarm::simulation::{SimulatedSwarm, SimulatedTorrent};
use eddy_search::MockProvider;
use eddy_web::{AppState, build_router};
use tempfile::TempDir;
use tower::ServiceExt;

pub const PIECE: u32 = 16_384;

pub const SRT: &str = "1\r\n00:00:01,000 --> 00:00:03,000\r\nHello\r\n";

pub struct Harness {
    pub dir: TempDir,
    pub swarm: Arc<SimulatedSwarm>,
    pub ffmpeg: Arc<SimulatedFfmpeg>,
    pub state: AppState,
    pub router: Router,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(|_| {})
    }

    /// Harness whose testing config is adjusted before the engine starts.
    pub fn with_config(adjust: impl FnOnce(&mut EddyConfig)) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let mut config = EddyConfig::for_testing().with_data_dir(dir.path());
        adjust(&mut config);
        let swarm = SimulatedSwarm::new();
        let ffmpeg = Arc::new(SimulatedFfmpeg::new());
        let subtitles =
            StaticSubtitleProvider::new().with_file("Sintel.2010.720p", "en", "sintel.srt", SRT);
        let state = AppState::with_components(
            config,
            swarm.transport(),
            ffmpeg.clone(),
            Arc::new(MockProvider::new()),
            Arc::new(subtitles),
        );
        let router = build_router(state.clone());
        Self {
            dir,
            swarm,
            ffmpeg,
            state,
            router,
        }
    }

    /// Registers a torrent with the swarm and opens it in the engine.
    pub async fn open(&self, torrent: &SimulatedTorrent) {
        self.swarm.add_torrent(torrent.clone());
        self.state
            .engine
            .open(TorrentSource::Descriptor(torrent.descriptor.clone()))
            .await
            .unwrap();
    }

    pub async fn send(&self, request: Request<Body>) -> Response<Body> {
        self.router.clone().oneshot(request).await.unwrap()
    }

    pub async fn request(&self, method: Method, uri: &str, range: Option<&str>) -> Response<Body> {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(range) = range {
            builder = builder.header("range", range);
        }
        self.send(builder.body(Body::empty()).unwrap()).await
    }

    /// Repeats a request until it stops answering 202.
    pub async fn until_settled(
        &self,
        method: Method,
        uri: &str,
        range: Option<&str>,
    ) -> Response<Body> {
        tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                let response = self.request(method.clone(), uri, range).await;
                if response.status() != StatusCode::ACCEPTED {
                    return response;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("request kept answering 202")
    }

    pub async fn execute(&self, action: serde_json::Value) -> (StatusCode, serde_json::Value) {
        let request = Request::builder()
            .method(Method::POST)
            .uri("/api/execute")
            .header("content-type", "application/json")
            .body(Body::from(action.to_string()))
            .unwrap();
        let response = self.send(request).await;
        let status = response.status();
        let body = body_bytes(response).await;
        (status, serde_json::from_slice(&body).unwrap())
    }
}

pub async fn body_bytes(response: Response<Body>) -> Vec<u8> {
    axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap()
        .to_vec()
}
