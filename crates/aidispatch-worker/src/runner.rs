//! Local worker driving per-model runner endpoints over HTTP.
//!
//! Each warmed `(pipeline, model)` maps to one runner endpoint. Text-only
//! pipelines POST a JSON body to `<url>/<pipeline>`; media pipelines POST a
//! multipart form carrying the request fields plus the fetched input file.
//! A failed call is recoverable unless the runner's `/health` then reports
//! `ERROR`, in which case the runtime is considered unusable.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use reqwest::multipart::{Form, Part};
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use aidispatch_core::pipeline::{
    AudioToTextRequest, ImageResponse, ImageToImageRequest, ImageToVideoRequest, LlmRequest,
    LlmResponse, MasksResponse, MediaInput, SegmentAnything2Request, TextResponse,
    TextToImageRequest, UpscaleRequest, VideoResponse,
};
use aidispatch_core::{resolve_capability, Capability, Error, Result};

use crate::{AiWorker, OptimizationFlags, RunnerEndpoint};

const HEALTH_POLL_INTERVAL: Duration = Duration::from_millis(250);
const DEFAULT_WARM_TIMEOUT: Duration = Duration::from_secs(120);

/// Runner state as reported by `GET /health`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RunnerHealth {
    Ok,
    Idle,
    Loading,
    Error,
}

#[derive(Deserialize)]
struct HealthBody {
    status: RunnerHealth,
}

struct Runner {
    endpoint: RunnerEndpoint,
    flags: OptimizationFlags,
    in_flight: AtomicU32,
}

impl Runner {
    fn has_capacity(&self) -> bool {
        self.in_flight.load(Ordering::Acquire) < self.endpoint.capacity
    }

    fn try_lease(self: &Arc<Self>) -> Option<RunnerLease> {
        self.in_flight
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < self.endpoint.capacity).then_some(n + 1)
            })
            .ok()
            .map(|_| RunnerLease(Arc::clone(self)))
    }
}

struct RunnerLease(Arc<Runner>);

impl Drop for RunnerLease {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::AcqRel);
    }
}

enum RequestBody {
    Json(serde_json::Value),
    Multipart {
        fields: serde_json::Value,
        file_field: &'static str,
        media: MediaInput,
    },
}

/// Snapshot of one warm runner.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunnerInfo {
    pub pipeline: String,
    pub model_id: String,
    pub url: String,
    pub capacity: u32,
    pub in_flight: u32,
    pub optimization_flags: OptimizationFlags,
}

/// Local worker backed by runner endpoints registered through `warm`.
///
/// One runner per `(pipeline, model)`; warming a pair twice is an error.
pub struct RunnerWorker {
    client: Client,
    runners: RwLock<HashMap<(Capability, String), Arc<Runner>>>,
    warm_timeout: Duration,
}

impl RunnerWorker {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            runners: RwLock::new(HashMap::new()),
            warm_timeout: DEFAULT_WARM_TIMEOUT,
        }
    }

    pub fn with_warm_timeout(mut self, timeout: Duration) -> Self {
        self.warm_timeout = timeout;
        self
    }

    /// Registered runners, ordered by pipeline then model.
    pub fn runners(&self) -> Vec<RunnerInfo> {
        let mut runners: Vec<RunnerInfo> = self
            .runners
            .read()
            .iter()
            .map(|((capability, model_id), runner)| RunnerInfo {
                pipeline: capability.pipeline().to_string(),
                model_id: model_id.clone(),
                url: runner.endpoint.url.clone(),
                capacity: runner.endpoint.capacity,
                in_flight: runner.in_flight.load(Ordering::Acquire),
                optimization_flags: runner.flags.clone(),
            })
            .collect();
        runners.sort_by(|a, b| (&a.pipeline, &a.model_id).cmp(&(&b.pipeline, &b.model_id)));
        runners
    }

    fn is_registered(&self, capability: Capability, model_id: &str) -> bool {
        self.runners
            .read()
            .contains_key(&(capability, model_id.to_string()))
    }

    pub async fn health(&self, endpoint: &RunnerEndpoint) -> Result<RunnerHealth> {
        let url = format!("{}/health", endpoint.url.trim_end_matches('/'));
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| Error::Http(format!("health check failed: {}", e)))?;
        let body: HealthBody = resp
            .json()
            .await
            .map_err(|e| Error::Http(format!("invalid health response: {}", e)))?;
        Ok(body.status)
    }

    async fn wait_ready(&self, endpoint: &RunnerEndpoint) -> Result<()> {
        let deadline = tokio::time::Instant::now() + self.warm_timeout;
        loop {
            match self.health(endpoint).await {
                Ok(RunnerHealth::Ok) | Ok(RunnerHealth::Idle) => return Ok(()),
                Ok(RunnerHealth::Error) => {
                    return Err(Error::Worker(format!(
                        "runner at {} reported an error state",
                        endpoint.url
                    )))
                }
                Ok(RunnerHealth::Loading) => debug!("Runner at {} still loading", endpoint.url),
                Err(e) => debug!("Runner at {} not reachable yet: {}", endpoint.url, e),
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(Error::Worker(format!(
                    "runner at {} did not become ready",
                    endpoint.url
                )));
            }
            tokio::time::sleep(HEALTH_POLL_INTERVAL).await;
        }
    }

    fn lease(&self, capability: Capability, model_id: &str) -> Result<(RunnerEndpoint, RunnerLease)> {
        let runner = self
            .runners
            .read()
            .get(&(capability, model_id.to_string()))
            .cloned()
            .ok_or_else(|| Error::NoCapacity {
                capability: capability.to_string(),
                model_id: model_id.to_string(),
            })?;
        let lease = runner.try_lease().ok_or_else(|| Error::NoCapacity {
            capability: capability.to_string(),
            model_id: model_id.to_string(),
        })?;
        Ok((runner.endpoint.clone(), lease))
    }

    async fn call<T: DeserializeOwned>(
        &self,
        capability: Capability,
        model_id: &str,
        body: RequestBody,
    ) -> Result<T> {
        let (endpoint, _lease) = self.lease(capability, model_id)?;
        let url = format!(
            "{}/{}",
            endpoint.url.trim_end_matches('/'),
            capability.pipeline()
        );

        let mut builder = self.client.post(&url);
        if let Some(token) = &endpoint.token {
            builder = builder.bearer_auth(token);
        }
        builder = match body {
            RequestBody::Json(json) => builder.json(&json),
            RequestBody::Multipart {
                fields,
                file_field,
                media,
            } => builder.multipart(multipart_form(fields, file_field, media)?),
        };

        debug!("Calling runner {} for model {}", url, model_id);
        let resp = builder
            .send()
            .await
            .map_err(|e| Error::Worker(format!("runner request failed: {}", e)))?;

        let status = resp.status();
        if status.is_success() {
            return resp
                .json::<T>()
                .await
                .map_err(|e| Error::Worker(format!("invalid runner response: {}", e)));
        }

        let text = resp.text().await.unwrap_or_default();
        let msg = error_detail(&text).unwrap_or_else(|| format!("runner returned {}", status));
        match self.health(&endpoint).await {
            Ok(RunnerHealth::Error) => {
                warn!("Runner {} is in an error state after: {}", endpoint.url, msg);
                Err(Error::Fatal(msg))
            }
            _ => Err(Error::Worker(msg)),
        }
    }
}

fn multipart_form(fields: serde_json::Value, file_field: &'static str, media: MediaInput) -> Result<Form> {
    if !media.is_fetched() {
        return Err(Error::Worker(format!(
            "input from {} was not fetched",
            media.source_url
        )));
    }
    let mut form = Form::new();
    if let serde_json::Value::Object(map) = fields {
        for (key, value) in map {
            let text = match value {
                serde_json::Value::String(s) => s,
                other => other.to_string(),
            };
            form = form.text(key, text);
        }
    }
    let part = Part::bytes(media.data.to_vec()).file_name(media.file_name());
    Ok(form.part(file_field, part))
}

/// Extract `detail.msg` (or a string `detail`) from a runner error body.
fn error_detail(body: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(body).ok()?;
    let detail = value.get("detail")?;
    detail
        .get("msg")
        .and_then(|m| m.as_str())
        .or_else(|| detail.as_str())
        .map(str::to_string)
}

#[async_trait]
impl AiWorker for RunnerWorker {
    async fn text_to_image(&self, req: TextToImageRequest) -> Result<ImageResponse> {
        let body = RequestBody::Json(serde_json::to_value(&req)?);
        self.call(Capability::TextToImage, &req.model_id, body).await
    }

    async fn image_to_image(&self, req: ImageToImageRequest) -> Result<ImageResponse> {
        let fields = serde_json::to_value(&req)?;
        let body = RequestBody::Multipart {
            fields,
            file_field: "image",
            media: req.image,
        };
        self.call(Capability::ImageToImage, &req.model_id, body).await
    }

    async fn upscale(&self, req: UpscaleRequest) -> Result<ImageResponse> {
        let fields = serde_json::to_value(&req)?;
        let body = RequestBody::Multipart {
            fields,
            file_field: "image",
            media: req.image,
        };
        self.call(Capability::Upscale, &req.model_id, body).await
    }

    async fn image_to_video(&self, req: ImageToVideoRequest) -> Result<VideoResponse> {
        let fields = serde_json::to_value(&req)?;
        let body = RequestBody::Multipart {
            fields,
            file_field: "image",
            media: req.image,
        };
        self.call(Capability::ImageToVideo, &req.model_id, body).await
    }

    async fn audio_to_text(&self, req: AudioToTextRequest) -> Result<TextResponse> {
        let fields = serde_json::to_value(&req)?;
        let body = RequestBody::Multipart {
            fields,
            file_field: "audio",
            media: req.audio,
        };
        self.call(Capability::AudioToText, &req.model_id, body).await
    }

    async fn segment_anything2(&self, req: SegmentAnything2Request) -> Result<MasksResponse> {
        let fields = serde_json::to_value(&req)?;
        let body = RequestBody::Multipart {
            fields,
            file_field: "image",
            media: req.image,
        };
        self.call(Capability::SegmentAnything2, &req.model_id, body).await
    }

    async fn llm(&self, req: LlmRequest) -> Result<LlmResponse> {
        if req.stream.unwrap_or(false) {
            return Err(Error::Worker("streaming llm responses are not supported".into()));
        }
        let body = RequestBody::Json(serde_json::to_value(&req)?);
        self.call(Capability::Llm, &req.model_id, body).await
    }

    async fn warm(
        &self,
        pipeline: &str,
        model_id: &str,
        endpoint: RunnerEndpoint,
        flags: OptimizationFlags,
    ) -> Result<()> {
        let capability = resolve_capability(pipeline)?;
        let already_warm = || {
            Error::Config(format!(
                "a runner for {} {} is already warm",
                pipeline, model_id
            ))
        };
        if self.is_registered(capability, model_id) {
            return Err(already_warm());
        }
        self.wait_ready(&endpoint).await?;

        let mut runners = self.runners.write();
        match runners.entry((capability, model_id.to_string())) {
            Entry::Occupied(_) => Err(already_warm()),
            Entry::Vacant(slot) => {
                info!(
                    "Runner warm: pipeline={} model={} url={} capacity={}",
                    pipeline, model_id, endpoint.url, endpoint.capacity
                );
                slot.insert(Arc::new(Runner {
                    endpoint,
                    flags,
                    in_flight: AtomicU32::new(0),
                }));
                Ok(())
            }
        }
    }

    async fn stop(&self) -> Result<()> {
        let count = {
            let mut runners = self.runners.write();
            let count = runners.len();
            runners.clear();
            count
        };
        info!("Runner worker stopped ({} runners released)", count);
        Ok(())
    }

    fn has_capacity(&self, pipeline: &str, model_id: &str) -> bool {
        let Ok(capability) = resolve_capability(pipeline) else {
            return false;
        };
        self.runners
            .read()
            .get(&(capability, model_id.to_string()))
            .map(|r| r.has_capacity())
            .unwrap_or(false)
    }

    fn name(&self) -> &str {
        "local"
    }
}
