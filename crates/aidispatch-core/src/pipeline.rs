//! Pipeline request/response shapes and request validation.
//!
//! Each pipeline decodes its own JSON body. Unknown fields are ignored so
//! callers may send a superset; missing required fields fail validation.
//! Media-based pipelines carry the fetched input as a [`MediaInput`], which is
//! never part of the JSON body.

use std::collections::BTreeMap;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::capabilities::Capability;
use crate::error::{Error, Result};

/// Externally hosted input referenced by a job.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MediaInput {
    pub source_url: String,
    /// Fetched content; empty until the dispatcher materializes it.
    pub data: Bytes,
}

impl MediaInput {
    pub fn new(source_url: impl Into<String>) -> Self {
        Self {
            source_url: source_url.into(),
            data: Bytes::new(),
        }
    }

    pub fn is_fetched(&self) -> bool {
        !self.data.is_empty()
    }

    /// Last path segment of the source URL, used as an upload filename.
    pub fn file_name(&self) -> String {
        self.source_url
            .split(['?', '#'])
            .next()
            .and_then(|p| p.rsplit('/').next())
            .filter(|s| !s.is_empty())
            .unwrap_or("input")
            .to_string()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TextToImageRequest {
    pub prompt: String,
    #[serde(default)]
    pub model_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub negative_prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guidance_scale: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub safety_check: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_inference_steps: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_images_per_prompt: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ImageToImageRequest {
    pub prompt: String,
    #[serde(default)]
    pub model_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub negative_prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strength: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guidance_scale: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_guidance_scale: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub safety_check: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_inference_steps: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_images_per_prompt: Option<u32>,
    #[serde(skip)]
    pub image: MediaInput,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UpscaleRequest {
    pub prompt: String,
    #[serde(default)]
    pub model_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub safety_check: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_inference_steps: Option<u32>,
    #[serde(skip)]
    pub image: MediaInput,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ImageToVideoRequest {
    #[serde(default)]
    pub model_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fps: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub motion_bucket_id: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub noise_aug_strength: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub safety_check: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_inference_steps: Option<u32>,
    #[serde(skip)]
    pub image: MediaInput,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AudioToTextRequest {
    #[serde(default)]
    pub model_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub return_timestamps: Option<String>,
    #[serde(skip)]
    pub audio: MediaInput,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SegmentAnything2Request {
    #[serde(default)]
    pub model_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub point_coords: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub point_labels: Option<String>,
    #[serde(default, rename = "box", skip_serializing_if = "Option::is_none")]
    pub bounding_box: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mask_input: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub multimask_output: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub return_logits: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub normalize_coords: Option<bool>,
    #[serde(skip)]
    pub image: MediaInput,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LlmRequest {
    pub prompt: String,
    #[serde(default)]
    pub model_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_msg: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    /// JSON-encoded prior conversation turns.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub history: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,
}

/// Decoded, pipeline-specific request.
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineRequest {
    TextToImage(TextToImageRequest),
    ImageToImage(ImageToImageRequest),
    Upscale(UpscaleRequest),
    ImageToVideo(ImageToVideoRequest),
    AudioToText(AudioToTextRequest),
    SegmentAnything2(SegmentAnything2Request),
    Llm(LlmRequest),
}

impl PipelineRequest {
    pub fn capability(&self) -> Capability {
        match self {
            Self::TextToImage(_) => Capability::TextToImage,
            Self::ImageToImage(_) => Capability::ImageToImage,
            Self::Upscale(_) => Capability::Upscale,
            Self::ImageToVideo(_) => Capability::ImageToVideo,
            Self::AudioToText(_) => Capability::AudioToText,
            Self::SegmentAnything2(_) => Capability::SegmentAnything2,
            Self::Llm(_) => Capability::Llm,
        }
    }

    pub fn model_id(&self) -> &str {
        match self {
            Self::TextToImage(r) => &r.model_id,
            Self::ImageToImage(r) => &r.model_id,
            Self::Upscale(r) => &r.model_id,
            Self::ImageToVideo(r) => &r.model_id,
            Self::AudioToText(r) => &r.model_id,
            Self::SegmentAnything2(r) => &r.model_id,
            Self::Llm(r) => &r.model_id,
        }
    }

    pub fn media(&self) -> Option<&MediaInput> {
        match self {
            Self::ImageToImage(r) => Some(&r.image),
            Self::Upscale(r) => Some(&r.image),
            Self::ImageToVideo(r) => Some(&r.image),
            Self::AudioToText(r) => Some(&r.audio),
            Self::SegmentAnything2(r) => Some(&r.image),
            Self::TextToImage(_) | Self::Llm(_) => None,
        }
    }

    pub fn media_mut(&mut self) -> Option<&mut MediaInput> {
        match self {
            Self::ImageToImage(r) => Some(&mut r.image),
            Self::Upscale(r) => Some(&mut r.image),
            Self::ImageToVideo(r) => Some(&mut r.image),
            Self::AudioToText(r) => Some(&mut r.audio),
            Self::SegmentAnything2(r) => Some(&mut r.image),
            Self::TextToImage(_) | Self::Llm(_) => None,
        }
    }

    /// JSON body of the request, without any media.
    pub fn to_json(&self) -> Result<serde_json::Value> {
        let value = match self {
            Self::TextToImage(r) => serde_json::to_value(r)?,
            Self::ImageToImage(r) => serde_json::to_value(r)?,
            Self::Upscale(r) => serde_json::to_value(r)?,
            Self::ImageToVideo(r) => serde_json::to_value(r)?,
            Self::AudioToText(r) => serde_json::to_value(r)?,
            Self::SegmentAnything2(r) => serde_json::to_value(r)?,
            Self::Llm(r) => serde_json::to_value(r)?,
        };
        Ok(value)
    }
}

/// Decode a raw job payload into the shape `capability` expects.
///
/// The job's `model_id` overrides whatever the body carries, and
/// `source_url` becomes the request's media reference. Media pipelines
/// without a source fail validation.
pub fn decode(
    capability: Capability,
    model_id: &str,
    source_url: Option<&str>,
    raw: &[u8],
) -> Result<PipelineRequest> {
    let invalid = || Error::Validation {
        pipeline: capability.pipeline().to_string(),
    };

    let mut request = match capability {
        Capability::TextToImage => {
            PipelineRequest::TextToImage(serde_json::from_slice(raw).map_err(|_| invalid())?)
        }
        Capability::ImageToImage => {
            PipelineRequest::ImageToImage(serde_json::from_slice(raw).map_err(|_| invalid())?)
        }
        Capability::Upscale => {
            PipelineRequest::Upscale(serde_json::from_slice(raw).map_err(|_| invalid())?)
        }
        Capability::ImageToVideo => {
            PipelineRequest::ImageToVideo(serde_json::from_slice(raw).map_err(|_| invalid())?)
        }
        Capability::AudioToText => {
            PipelineRequest::AudioToText(serde_json::from_slice(raw).map_err(|_| invalid())?)
        }
        Capability::SegmentAnything2 => {
            PipelineRequest::SegmentAnything2(serde_json::from_slice(raw).map_err(|_| invalid())?)
        }
        Capability::Llm => PipelineRequest::Llm(serde_json::from_slice(raw).map_err(|_| invalid())?),
    };

    let model = model_id.to_string();
    match &mut request {
        PipelineRequest::TextToImage(r) => r.model_id = model,
        PipelineRequest::ImageToImage(r) => r.model_id = model,
        PipelineRequest::Upscale(r) => r.model_id = model,
        PipelineRequest::ImageToVideo(r) => r.model_id = model,
        PipelineRequest::AudioToText(r) => r.model_id = model,
        PipelineRequest::SegmentAnything2(r) => r.model_id = model,
        PipelineRequest::Llm(r) => r.model_id = model,
    }

    if let Some(media) = request.media_mut() {
        match source_url.filter(|u| !u.is_empty()) {
            Some(url) => *media = MediaInput::new(url),
            None => return Err(invalid()),
        }
    }

    Ok(request)
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Media {
    pub url: String,
    #[serde(default)]
    pub seed: i64,
    #[serde(default)]
    pub nsfw: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ImageResponse {
    pub images: Vec<Media>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VideoResponse {
    pub frames: Vec<Vec<Media>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TextChunk {
    pub text: String,
    pub timestamp: Vec<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TextResponse {
    pub text: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub chunks: Vec<TextChunk>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MasksResponse {
    pub masks: String,
    pub scores: String,
    pub logits: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LlmResponse {
    pub response: String,
    pub tokens_used: u32,
}

/// Pipeline result, serialized without a tag so the body is the bare shape.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum PipelineResponse {
    Image(ImageResponse),
    Video(VideoResponse),
    Text(TextResponse),
    Masks(MasksResponse),
    Llm(LlmResponse),
}

impl PipelineResponse {
    /// Parse a JSON result according to the shape `capability` produces.
    pub fn from_value(capability: Capability, value: serde_json::Value) -> Result<Self> {
        let response = match capability {
            Capability::TextToImage | Capability::ImageToImage | Capability::Upscale => {
                Self::Image(serde_json::from_value(value)?)
            }
            Capability::ImageToVideo => Self::Video(serde_json::from_value(value)?),
            Capability::AudioToText => Self::Text(serde_json::from_value(value)?),
            Capability::SegmentAnything2 => Self::Masks(serde_json::from_value(value)?),
            Capability::Llm => Self::Llm(serde_json::from_value(value)?),
        };
        Ok(response)
    }

    /// Number of output media items (images, frames, or a single text body).
    pub fn output_count(&self) -> usize {
        match self {
            Self::Image(r) => r.images.len(),
            Self::Video(r) => r.frames.iter().map(Vec::len).sum(),
            Self::Text(_) | Self::Masks(_) | Self::Llm(_) => 1,
        }
    }
}

/// Binary files produced alongside a result, keyed by filename.
pub type Attachments = BTreeMap<String, Bytes>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_text_to_image() {
        let req = decode(
            Capability::TextToImage,
            "livepeer/model1",
            None,
            br#"{"prompt":"test prompt","width":512}"#,
        )
        .unwrap();
        match req {
            PipelineRequest::TextToImage(r) => {
                assert_eq!(r.prompt, "test prompt");
                assert_eq!(r.model_id, "livepeer/model1");
                assert_eq!(r.width, Some(512));
            }
            other => panic!("unexpected request {:?}", other),
        }
    }

    #[test]
    fn test_decode_invalid_json() {
        let err = decode(Capability::TextToImage, "m", None, b"invalid json").unwrap_err();
        assert_eq!(
            err.to_string(),
            "AI request not correct for text-to-image pipeline"
        );
    }

    #[test]
    fn test_decode_empty_body_fails_everywhere() {
        for cap in Capability::all() {
            let err = decode(*cap, "m", Some("http://host/x.png"), b"").unwrap_err();
            assert!(matches!(err, Error::Validation { .. }), "{}", cap);
        }
    }

    #[test]
    fn test_decode_missing_required_field() {
        let err = decode(Capability::Llm, "m", None, br#"{"max_tokens":10}"#).unwrap_err();
        assert_eq!(err.to_string(), "AI request not correct for llm pipeline");
    }

    #[test]
    fn test_decode_ignores_unknown_fields() {
        let req = decode(
            Capability::AudioToText,
            "whisper",
            Some("http://host/audio.mp3"),
            br#"{"prompt":"test prompt"}"#,
        )
        .unwrap();
        assert_eq!(req.capability(), Capability::AudioToText);
        assert_eq!(req.model_id(), "whisper");
        let media = req.media().unwrap();
        assert_eq!(media.source_url, "http://host/audio.mp3");
        assert_eq!(media.file_name(), "audio.mp3");
        assert!(!media.is_fetched());
    }

    #[test]
    fn test_decode_media_pipeline_requires_source() {
        let err = decode(Capability::Upscale, "m", None, br#"{"prompt":"p"}"#).unwrap_err();
        assert_eq!(err.to_string(), "AI request not correct for upscale pipeline");
        let err = decode(Capability::Upscale, "m", Some(""), br#"{"prompt":"p"}"#).unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));
    }

    #[test]
    fn test_request_json_omits_media() {
        let mut req = decode(
            Capability::ImageToImage,
            "m",
            Some("http://host/image.png"),
            br#"{"prompt":"p"}"#,
        )
        .unwrap();
        req.media_mut().unwrap().data = Bytes::from_static(b"png");
        let json = req.to_json().unwrap();
        assert_eq!(json, serde_json::json!({"prompt": "p", "model_id": "m"}));
    }

    #[test]
    fn test_segment_anything_box_rename() {
        let req = decode(
            Capability::SegmentAnything2,
            "sam2",
            Some("http://host/image.png"),
            br#"{"box":"[0,0,10,10]"}"#,
        )
        .unwrap();
        match req {
            PipelineRequest::SegmentAnything2(r) => {
                assert_eq!(r.bounding_box.as_deref(), Some("[0,0,10,10]"))
            }
            other => panic!("unexpected request {:?}", other),
        }
    }

    #[test]
    fn test_response_serializes_untagged() {
        let resp = PipelineResponse::Llm(LlmResponse {
            response: "output tokens".into(),
            tokens_used: 10,
        });
        assert_eq!(
            serde_json::to_value(&resp).unwrap(),
            serde_json::json!({"response": "output tokens", "tokens_used": 10})
        );
    }

    #[test]
    fn test_response_from_value() {
        let value = serde_json::json!({"frames": [[{"url": "a", "seed": 1, "nsfw": false}, {"url": "b"}]]});
        let resp = PipelineResponse::from_value(Capability::ImageToVideo, value).unwrap();
        assert_eq!(resp.output_count(), 2);

        let bad = PipelineResponse::from_value(Capability::Llm, serde_json::json!({"text": "x"}));
        assert!(bad.is_err());
    }

    #[test]
    fn test_media_file_name_fallback() {
        assert_eq!(MediaInput::new("http://host/").file_name(), "input");
        assert_eq!(MediaInput::new("http://host/a.png?sig=1").file_name(), "a.png");
    }
}
