//! `AiWorker` facade over the remote worker pool.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use aidispatch_core::pipeline::{
    AudioToTextRequest, ImageResponse, ImageToImageRequest, ImageToVideoRequest, LlmRequest,
    LlmResponse, MasksResponse, SegmentAnything2Request, TextResponse, TextToImageRequest,
    UpscaleRequest, VideoResponse,
};
use aidispatch_core::{Error, PipelineRequest, PipelineResponse, Result, WorkerResult};
use aidispatch_worker::{AiWorker, OptimizationFlags, RunnerEndpoint};

use crate::manager::RemoteWorkerManager;

pub struct RemoteWorkerProxy {
    manager: Arc<RemoteWorkerManager>,
}

impl RemoteWorkerProxy {
    pub fn new(manager: Arc<RemoteWorkerManager>) -> Self {
        Self { manager }
    }

    pub fn manager(&self) -> &Arc<RemoteWorkerManager> {
        &self.manager
    }
}

fn unexpected(payload: PipelineResponse) -> Error {
    Error::Internal(format!("unexpected remote payload {:?}", payload))
}

#[async_trait]
impl AiWorker for RemoteWorkerProxy {
    async fn text_to_image(&self, req: TextToImageRequest) -> Result<ImageResponse> {
        match self.invoke(PipelineRequest::TextToImage(req)).await?.payload {
            PipelineResponse::Image(r) => Ok(r),
            other => Err(unexpected(other)),
        }
    }

    async fn image_to_image(&self, req: ImageToImageRequest) -> Result<ImageResponse> {
        match self.invoke(PipelineRequest::ImageToImage(req)).await?.payload {
            PipelineResponse::Image(r) => Ok(r),
            other => Err(unexpected(other)),
        }
    }

    async fn upscale(&self, req: UpscaleRequest) -> Result<ImageResponse> {
        match self.invoke(PipelineRequest::Upscale(req)).await?.payload {
            PipelineResponse::Image(r) => Ok(r),
            other => Err(unexpected(other)),
        }
    }

    async fn image_to_video(&self, req: ImageToVideoRequest) -> Result<VideoResponse> {
        match self.invoke(PipelineRequest::ImageToVideo(req)).await?.payload {
            PipelineResponse::Video(r) => Ok(r),
            other => Err(unexpected(other)),
        }
    }

    async fn audio_to_text(&self, req: AudioToTextRequest) -> Result<TextResponse> {
        match self.invoke(PipelineRequest::AudioToText(req)).await?.payload {
            PipelineResponse::Text(r) => Ok(r),
            other => Err(unexpected(other)),
        }
    }

    async fn segment_anything2(&self, req: SegmentAnything2Request) -> Result<MasksResponse> {
        match self.invoke(PipelineRequest::SegmentAnything2(req)).await?.payload {
            PipelineResponse::Masks(r) => Ok(r),
            other => Err(unexpected(other)),
        }
    }

    async fn llm(&self, req: LlmRequest) -> Result<LlmResponse> {
        match self.invoke(PipelineRequest::Llm(req)).await?.payload {
            PipelineResponse::Llm(r) => Ok(r),
            other => Err(unexpected(other)),
        }
    }

    /// Remote workers load their own models before registering.
    async fn warm(
        &self,
        pipeline: &str,
        model_id: &str,
        _endpoint: RunnerEndpoint,
        _flags: OptimizationFlags,
    ) -> Result<()> {
        debug!("Ignoring warm for remote {} {}", pipeline, model_id);
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.manager.stop();
        Ok(())
    }

    fn has_capacity(&self, pipeline: &str, model_id: &str) -> bool {
        self.manager.has_capacity(pipeline, model_id)
    }

    fn name(&self) -> &str {
        "remote"
    }

    async fn invoke(&self, request: PipelineRequest) -> Result<WorkerResult> {
        self.manager.process(request).await
    }
}
