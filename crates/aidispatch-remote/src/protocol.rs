//! Remote worker wire protocol.
//!
//! JSON text frames, internally tagged by `type`. A worker opens with
//! `register`, then answers each `job` with one `completion`.

use serde::{Deserialize, Serialize};

use aidispatch_core::capabilities::PerCapabilityConstraints;
use aidispatch_core::pipeline::Attachments;
use aidispatch_core::{Capability, Error, PipelineResponse, Result, WorkerResult};

/// Worker → orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerMessage {
    Register {
        capabilities: PerCapabilityConstraints,
    },
    Completion(Completion),
}

/// Result of one remote task.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Completion {
    pub task_id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// The remote runtime can no longer be trusted.
    #[serde(default)]
    pub unrecoverable: bool,
    #[serde(default, with = "attachments_b64", skip_serializing_if = "Attachments::is_empty")]
    pub attachments: Attachments,
}

impl Completion {
    pub fn success(task_id: u64, result: serde_json::Value) -> Self {
        Self {
            task_id,
            result: Some(result),
            ..Default::default()
        }
    }

    pub fn failure(task_id: u64, error: impl Into<String>) -> Self {
        Self {
            task_id,
            error: Some(error.into()),
            ..Default::default()
        }
    }

    /// Interpret the completion for a job of `capability`.
    ///
    /// Remote errors are always recoverable for the job itself.
    pub fn into_result(self, capability: Capability) -> Result<WorkerResult> {
        if let Some(error) = self.error {
            return Err(Error::Worker(error));
        }
        let value = self
            .result
            .ok_or_else(|| Error::Worker("remote worker returned no result".into()))?;
        let payload = PipelineResponse::from_value(capability, value)
            .map_err(|e| Error::Worker(format!("invalid remote result: {}", e)))?;
        Ok(WorkerResult {
            payload,
            attachments: self.attachments,
        })
    }
}

/// Orchestrator → worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Job(JobMessage),
    Stop,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobMessage {
    pub task_id: u64,
    pub pipeline: String,
    pub model_id: String,
    /// Input media the worker fetches itself.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_url: Option<String>,
    pub request_data: serde_json::Value,
}

mod attachments_b64 {
    use base64::{engine::general_purpose::STANDARD as BASE64_STANDARD, Engine};
    use bytes::Bytes;
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};
    use std::collections::BTreeMap;

    pub fn serialize<S: Serializer>(
        files: &BTreeMap<String, Bytes>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.collect_map(
            files
                .iter()
                .map(|(name, data)| (name, BASE64_STANDARD.encode(data))),
        )
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<BTreeMap<String, Bytes>, D::Error> {
        let encoded = BTreeMap::<String, String>::deserialize(deserializer)?;
        encoded
            .into_iter()
            .map(|(name, data)| {
                BASE64_STANDARD
                    .decode(data.as_bytes())
                    .map(|raw| (name.clone(), Bytes::from(raw)))
                    .map_err(|e| D::Error::custom(format!("attachment {}: {}", name, e)))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aidispatch_core::capabilities::{single_model, ModelConstraint};
    use bytes::Bytes;

    #[test]
    fn test_register_frame() {
        let msg: WorkerMessage = serde_json::from_str(
            r#"{"type":"register","capabilities":{"llm":{"models":{"m1":{"warm":true,"capacity":2}}}}}"#,
        )
        .unwrap();
        let expected = single_model(
            Capability::Llm,
            "m1",
            ModelConstraint {
                warm: true,
                capacity: 2,
            },
        );
        assert_eq!(
            msg,
            WorkerMessage::Register {
                capabilities: expected
            }
        );
    }

    #[test]
    fn test_completion_with_attachments() {
        let msg: WorkerMessage = serde_json::from_str(
            r#"{"type":"completion","task_id":3,"result":{"images":[{"url":"out.png"}]},"attachments":{"out.png":"aGVsbG8="}}"#,
        )
        .unwrap();
        let WorkerMessage::Completion(completion) = msg else {
            panic!("expected completion");
        };
        assert_eq!(completion.task_id, 3);
        assert!(!completion.unrecoverable);

        let result = completion.into_result(Capability::TextToImage).unwrap();
        assert_eq!(result.payload.output_count(), 1);
        assert_eq!(result.attachments["out.png"], Bytes::from_static(b"hello"));
    }

    #[test]
    fn test_completion_error_is_recoverable() {
        let mut completion = Completion::failure(9, "GPU fell off the bus");
        completion.unrecoverable = true;
        let err = completion.into_result(Capability::Llm).unwrap_err();
        assert!(!err.is_fatal());
        assert_eq!(err.to_string(), "GPU fell off the bus");
    }

    #[test]
    fn test_completion_shape_mismatch() {
        let completion = Completion::success(1, serde_json::json!({"text": "hi"}));
        assert!(matches!(
            completion.into_result(Capability::Llm),
            Err(Error::Worker(_))
        ));
    }

    #[test]
    fn test_bad_attachment_encoding_rejected() {
        let res: std::result::Result<WorkerMessage, _> = serde_json::from_str(
            r#"{"type":"completion","task_id":1,"attachments":{"a":"!!not base64!!"}}"#,
        );
        assert!(res.is_err());
    }

    #[test]
    fn test_job_frame() {
        let msg = ServerMessage::Job(JobMessage {
            task_id: 5,
            pipeline: "upscale".into(),
            model_id: "m".into(),
            source_url: Some("http://host/in.png".into()),
            request_data: serde_json::json!({"prompt": "p"}),
        });
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "job");
        assert_eq!(json["task_id"], 5);
        assert_eq!(json["request_data"]["prompt"], "p");
        assert_eq!(
            serde_json::to_value(ServerMessage::Stop).unwrap(),
            serde_json::json!({"type": "stop"})
        );
    }
}
