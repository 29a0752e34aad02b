//! Job notifications and their outcomes.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::pipeline::{Attachments, PipelineResponse};

/// Inbound description of one inference request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobNotification {
    pub task_id: u64,
    pub pipeline: String,
    pub model_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_url: Option<String>,
    /// Opaque pipeline body. On the wire this is either an embedded JSON
    /// value or a string holding the raw bytes.
    #[serde(default, with = "request_data")]
    pub request_data: Bytes,
}

/// Successful worker output.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerResult {
    pub payload: PipelineResponse,
    pub attachments: Attachments,
}

impl WorkerResult {
    pub fn new(payload: PipelineResponse) -> Self {
        Self {
            payload,
            attachments: Attachments::new(),
        }
    }
}

/// The single result delivered for a job.
#[derive(Debug)]
pub enum Outcome {
    Success(WorkerResult),
    Failure(Error),
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Failure(e) if e.is_fatal())
    }

    pub fn error(&self) -> Option<&Error> {
        match self {
            Self::Failure(e) => Some(e),
            Self::Success(_) => None,
        }
    }
}

impl From<crate::error::Result<WorkerResult>> for Outcome {
    fn from(result: crate::error::Result<WorkerResult>) -> Self {
        match result {
            Ok(r) => Self::Success(r),
            Err(e) => Self::Failure(e),
        }
    }
}

mod request_data {
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(data: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
        match serde_json::from_slice::<serde_json::Value>(data) {
            Ok(value) => serializer.serialize_some(&value),
            Err(_) => serializer.serialize_str(&String::from_utf8_lossy(data)),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Bytes, D::Error> {
        let value = serde_json::Value::deserialize(deserializer)?;
        Ok(match value {
            serde_json::Value::Null => Bytes::new(),
            serde_json::Value::String(s) => Bytes::from(s),
            other => Bytes::from(other.to_string()),
        })
    }
}
