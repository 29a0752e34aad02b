//! Shared fixtures: a scriptable worker plus callback and media servers.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::Router;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use aidispatch_core::capabilities::{single_model, ModelConstraint};
use aidispatch_core::pipeline::{
    AudioToTextRequest, ImageResponse, ImageToImageRequest, ImageToVideoRequest, LlmRequest,
    LlmResponse, MasksResponse, Media, SegmentAnything2Request, TextResponse, TextToImageRequest,
    UpscaleRequest, VideoResponse,
};
use aidispatch_core::{Capability, CapabilityRegistry, DispatchConfig, Error, Result};
use aidispatch_runtime::{Dispatcher, FatalHandle, MediaFetcher, ResultTransport};
use aidispatch_worker::{AiWorker, OptimizationFlags, RunnerEndpoint};

pub const SECRET: &str = "verbigsecret";
pub const PNG_URL: &str =
    "data:image/png;base64,iVBORw0KGgoAAAANSUhEUgAAAAEAAAABAQMAAAAl21bKAAAAA1BMVEUAAACnej3aAAAAAXRSTlMAQObYZgAAAApJREFUCNdjYAAAAAIAAeIhvDMAAAAASUVORK5CYII=";

#[derive(Clone)]
pub enum Failure {
    Recoverable(String),
    Fatal(String),
}

/// Worker returning canned responses and counting operation calls.
#[derive(Default)]
pub struct StubWorker {
    pub calls: AtomicUsize,
    pub failure: Mutex<Option<Failure>>,
    pub delay: Mutex<Option<Duration>>,
    pub no_capacity: AtomicBool,
    pub active: AtomicUsize,
    pub max_active: AtomicUsize,
    pub media_seen: Mutex<Vec<usize>>,
    pub label: &'static str,
}

impl StubWorker {
    pub fn new() -> Self {
        Self {
            label: "stub",
            ..Default::default()
        }
    }

    pub fn failing(failure: Failure) -> Self {
        let worker = Self::new();
        *worker.failure.lock() = Some(failure);
        worker
    }

    pub fn slow(delay: Duration) -> Self {
        let worker = Self::new();
        *worker.delay.lock() = Some(delay);
        worker
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    async fn enter(&self, media_len: Option<usize>) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(len) = media_len {
            self.media_seen.lock().push(len);
        }
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now, Ordering::SeqCst);
        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.active.fetch_sub(1, Ordering::SeqCst);
        let failure = self.failure.lock().clone();
        match failure {
            Some(Failure::Recoverable(msg)) => Err(Error::Worker(msg)),
            Some(Failure::Fatal(msg)) => Err(Error::Fatal(msg)),
            None => Ok(()),
        }
    }
}

pub fn image_response() -> ImageResponse {
    ImageResponse {
        images: vec![media()],
    }
}

pub fn video_response() -> VideoResponse {
    VideoResponse {
        frames: vec![vec![media(), media(), media()]],
    }
}

pub fn text_response() -> TextResponse {
    TextResponse {
        text: "Transcribed text".into(),
        chunks: Vec::new(),
    }
}

pub fn masks_response() -> MasksResponse {
    MasksResponse {
        masks: "[[[2.84, 2.83, ...], [2.92, 2.91, ...], [3.22, 3.56, ...], ...]]".into(),
        scores: "[0.50, 0.37, ...]".into(),
        logits: "[[[2.84, 2.66, ...], [3.59, 5.20, ...], [5.07, 5.68, ...], ...]]".into(),
    }
}

pub fn llm_response() -> LlmResponse {
    LlmResponse {
        response: "output tokens".into(),
        tokens_used: 10,
    }
}

fn media() -> Media {
    Media {
        url: PNG_URL.into(),
        seed: 111,
        nsfw: false,
    }
}

#[async_trait]
impl AiWorker for StubWorker {
    async fn text_to_image(&self, _req: TextToImageRequest) -> Result<ImageResponse> {
        self.enter(None).await?;
        Ok(image_response())
    }

    async fn image_to_image(&self, req: ImageToImageRequest) -> Result<ImageResponse> {
        self.enter(Some(req.image.data.len())).await?;
        Ok(image_response())
    }

    async fn upscale(&self, req: UpscaleRequest) -> Result<ImageResponse> {
        self.enter(Some(req.image.data.len())).await?;
        Ok(image_response())
    }

    async fn image_to_video(&self, req: ImageToVideoRequest) -> Result<VideoResponse> {
        self.enter(Some(req.image.data.len())).await?;
        Ok(video_response())
    }

    async fn audio_to_text(&self, req: AudioToTextRequest) -> Result<TextResponse> {
        self.enter(Some(req.audio.data.len())).await?;
        Ok(text_response())
    }

    async fn segment_anything2(&self, req: SegmentAnything2Request) -> Result<MasksResponse> {
        self.enter(Some(req.image.data.len())).await?;
        Ok(masks_response())
    }

    async fn llm(&self, _req: LlmRequest) -> Result<LlmResponse> {
        self.enter(None).await?;
        Ok(llm_response())
    }

    async fn warm(
        &self,
        _pipeline: &str,
        _model_id: &str,
        _endpoint: RunnerEndpoint,
        _flags: OptimizationFlags,
    ) -> Result<()> {
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        Ok(())
    }

    fn has_capacity(&self, _pipeline: &str, _model_id: &str) -> bool {
        !self.no_capacity.load(Ordering::SeqCst)
    }

    fn name(&self) -> &str {
        self.label
    }
}

/// One captured callback.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl Delivery {
    pub fn header(&self, name: &str) -> &str {
        self.headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn json(&self) -> serde_json::Value {
        serde_json::from_slice(&self.body).unwrap()
    }
}

pub struct CallbackServer {
    pub host: String,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Delivery>>,
}

impl CallbackServer {
    pub async fn next(&self) -> Delivery {
        tokio::time::timeout(Duration::from_secs(5), self.rx.lock().await.recv())
            .await
            .expect("no delivery within 5s")
            .expect("callback server closed")
    }

    /// Assert nothing more arrives within a short window.
    pub async fn assert_idle(&self) {
        let got = tokio::time::timeout(Duration::from_millis(100), self.rx.lock().await.recv()).await;
        assert!(got.is_err(), "unexpected delivery {:?}", got);
    }
}

async fn capture(
    State(tx): State<mpsc::UnboundedSender<Delivery>>,
    headers: HeaderMap,
    body: Bytes,
) -> StatusCode {
    let _ = tx.send(Delivery { headers, body });
    StatusCode::OK
}

pub async fn spawn_callback_server() -> CallbackServer {
    let (tx, rx) = mpsc::unbounded_channel();
    let app = Router::new()
        .route("/aiResults", post(capture))
        .with_state(tx);
    let host = serve(app).await;
    CallbackServer {
        host,
        rx: tokio::sync::Mutex::new(rx),
    }
}

/// Serves `/image.png` and `/audio.mp3`, plus `/slow.png` which answers
/// after two seconds; everything else is 404.
pub async fn spawn_media_server() -> String {
    let app = Router::new()
        .route("/image.png", get(|| async { Bytes::from_static(b"\x89PNG\r\n\x1a\nfake") }))
        .route("/audio.mp3", get(|| async { Bytes::from_static(b"ID3fake-audio") }))
        .route(
            "/slow.png",
            get(|| async {
                tokio::time::sleep(Duration::from_secs(2)).await;
                Bytes::from_static(b"\x89PNG\r\n\x1a\nslow")
            }),
        );
    format!("http://{}", serve(app).await)
}

async fn serve(app: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr.to_string()
}

pub fn config(callback_host: &str) -> DispatchConfig {
    DispatchConfig {
        orch_secret: SECRET.into(),
        callback_host: callback_host.into(),
        callback_scheme: "http".into(),
        fetch_timeout: Duration::from_secs(5),
        job_timeout: Duration::from_secs(5),
        delivery_timeout: Duration::from_secs(5),
        fatal_delivery_timeout: Duration::from_secs(2),
        ..Default::default()
    }
}

pub fn registry(capability: Capability, model_id: &str, capacity: u32) -> Arc<CapabilityRegistry> {
    Arc::new(CapabilityRegistry::new(single_model(
        capability,
        model_id,
        ModelConstraint {
            warm: true,
            capacity,
        },
    )))
}

pub fn dispatcher(config: &DispatchConfig, registry: Arc<CapabilityRegistry>) -> Dispatcher {
    let client = reqwest::Client::new();
    Dispatcher::new(
        config,
        registry,
        MediaFetcher::new(client.clone(), config.fetch_timeout),
        ResultTransport::new(
            client,
            config.callback_scheme.clone(),
            config.orch_secret.clone(),
            config.delivery_timeout,
        ),
        FatalHandle::new(),
    )
}
