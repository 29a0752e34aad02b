//! AI Dispatch Worker: the uniform worker contract.
//!
//! The `AiWorker` trait abstracts over anything that can execute pipeline
//! operations. Implementations:
//! - `RunnerWorker`: drives local per-model runner endpoints over HTTP.
//! - `RemoteWorkerProxy` (in `aidispatch-remote`): forwards to a pooled
//!   remote worker connection.

pub mod runner;

pub use runner::{RunnerHealth, RunnerInfo, RunnerWorker};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use aidispatch_core::pipeline::{
    AudioToTextRequest, ImageResponse, ImageToImageRequest, ImageToVideoRequest, LlmRequest,
    LlmResponse, MasksResponse, SegmentAnything2Request, TextResponse, TextToImageRequest,
    UpscaleRequest, VideoResponse,
};
use aidispatch_core::{PipelineRequest, PipelineResponse, Result, WorkerResult};

/// Where a model is served.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunnerEndpoint {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    /// Jobs the endpoint accepts at once.
    #[serde(default = "default_endpoint_capacity")]
    pub capacity: u32,
}

fn default_endpoint_capacity() -> u32 {
    1
}

impl RunnerEndpoint {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            token: None,
            capacity: 1,
        }
    }
}

/// Model optimization switches passed through when warming.
pub type OptimizationFlags = serde_json::Map<String, serde_json::Value>;

/// Trait for workers able to execute pipeline operations.
#[async_trait]
pub trait AiWorker: Send + Sync {
    async fn text_to_image(&self, req: TextToImageRequest) -> Result<ImageResponse>;

    async fn image_to_image(&self, req: ImageToImageRequest) -> Result<ImageResponse>;

    async fn upscale(&self, req: UpscaleRequest) -> Result<ImageResponse>;

    async fn image_to_video(&self, req: ImageToVideoRequest) -> Result<VideoResponse>;

    async fn audio_to_text(&self, req: AudioToTextRequest) -> Result<TextResponse>;

    async fn segment_anything2(&self, req: SegmentAnything2Request) -> Result<MasksResponse>;

    async fn llm(&self, req: LlmRequest) -> Result<LlmResponse>;

    /// Prepare a model for low-latency serving.
    async fn warm(
        &self,
        pipeline: &str,
        model_id: &str,
        endpoint: RunnerEndpoint,
        flags: OptimizationFlags,
    ) -> Result<()>;

    /// Graceful shutdown.
    async fn stop(&self) -> Result<()>;

    /// Cheap local probe; never touches the network.
    fn has_capacity(&self, pipeline: &str, model_id: &str) -> bool;

    /// Short label for logs and job records.
    fn name(&self) -> &str;

    /// Run whichever operation matches `request`.
    async fn invoke(&self, request: PipelineRequest) -> Result<WorkerResult> {
        let payload = match request {
            PipelineRequest::TextToImage(r) => PipelineResponse::Image(self.text_to_image(r).await?),
            PipelineRequest::ImageToImage(r) => {
                PipelineResponse::Image(self.image_to_image(r).await?)
            }
            PipelineRequest::Upscale(r) => PipelineResponse::Image(self.upscale(r).await?),
            PipelineRequest::ImageToVideo(r) => {
                PipelineResponse::Video(self.image_to_video(r).await?)
            }
            PipelineRequest::AudioToText(r) => PipelineResponse::Text(self.audio_to_text(r).await?),
            PipelineRequest::SegmentAnything2(r) => {
                PipelineResponse::Masks(self.segment_anything2(r).await?)
            }
            PipelineRequest::Llm(r) => PipelineResponse::Llm(self.llm(r).await?),
        };
        Ok(WorkerResult::new(payload))
    }
}
