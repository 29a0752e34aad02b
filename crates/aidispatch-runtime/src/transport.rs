//! Outcome delivery to the job originator.
//!
//! One authenticated POST to `<scheme>://<host>/aiResults` per job. The
//! body is the error text under a sentinel content type, the JSON payload,
//! or a multipart form when the worker produced attachments. Delivery is
//! attempted exactly once; failures are logged.

use std::time::Duration;

use reqwest::multipart::{Form, Part};
use reqwest::Client;
use tracing::{debug, warn};

use aidispatch_core::{Error, Outcome, Result};

pub const RESULTS_PATH: &str = "/aiResults";
pub const TASK_ID_HEADER: &str = "TaskId";
pub const CREDENTIALS_HEADER: &str = "Credentials";
/// `Authorization` value identifying the callback protocol version.
pub const PROTOCOL_VERSION: &str = "AI-Worker-1.0";
/// Content type marking the body as an error message.
pub const ERROR_CONTENT_TYPE: &str = "application/vnd.ai-worker-error";
/// Name of the JSON part in a multipart delivery.
pub const RESULTS_PART: &str = "results";

/// Encoded delivery body.
#[derive(Debug)]
pub enum DeliveryBody {
    Error(String),
    Json(Vec<u8>),
    Multipart {
        results: Vec<u8>,
        attachments: Vec<(String, bytes::Bytes)>,
    },
}

impl DeliveryBody {
    pub fn encode(outcome: &Outcome) -> Result<Self> {
        match outcome {
            Outcome::Failure(e) => Ok(Self::Error(e.to_string())),
            Outcome::Success(result) => {
                let results = serde_json::to_vec(&result.payload)?;
                if result.attachments.is_empty() {
                    Ok(Self::Json(results))
                } else {
                    Ok(Self::Multipart {
                        results,
                        attachments: result
                            .attachments
                            .iter()
                            .map(|(name, data)| (name.clone(), data.clone()))
                            .collect(),
                    })
                }
            }
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error(_))
    }
}

#[derive(Clone)]
pub struct ResultTransport {
    client: Client,
    scheme: String,
    secret: String,
    timeout: Duration,
}

impl ResultTransport {
    pub fn new(client: Client, scheme: impl Into<String>, secret: impl Into<String>, timeout: Duration) -> Self {
        Self {
            client,
            scheme: scheme.into(),
            secret: secret.into(),
            timeout,
        }
    }

    pub fn results_url(&self, host: &str) -> String {
        format!("{}://{}{}", self.scheme, host, RESULTS_PATH)
    }

    /// Deliver with the default timeout. Returns whether the receiver
    /// acknowledged with a 2xx status.
    pub async fn deliver(&self, host: &str, task_id: u64, outcome: &Outcome) -> bool {
        self.deliver_within(host, task_id, outcome, self.timeout).await
    }

    pub async fn deliver_within(
        &self,
        host: &str,
        task_id: u64,
        outcome: &Outcome,
        timeout: Duration,
    ) -> bool {
        let body = match DeliveryBody::encode(outcome) {
            Ok(body) => body,
            Err(e) => {
                warn!("Task {}: could not encode result: {}", task_id, e);
                DeliveryBody::Error(format!("could not encode result: {}", e))
            }
        };

        let url = self.results_url(host);
        let request = match self.request(&url, task_id, body, timeout) {
            Ok(request) => request,
            Err(e) => {
                warn!("Task {}: could not build delivery: {}", task_id, e);
                return false;
            }
        };

        match request.send().await {
            Ok(resp) if resp.status().is_success() => {
                debug!("Task {} delivered to {}", task_id, url);
                true
            }
            Ok(resp) => {
                warn!("Task {} delivery to {} rejected: {}", task_id, url, resp.status());
                false
            }
            Err(e) => {
                warn!("Task {} delivery to {} failed: {}", task_id, url, e);
                false
            }
        }
    }

    fn request(
        &self,
        url: &str,
        task_id: u64,
        body: DeliveryBody,
        timeout: Duration,
    ) -> Result<reqwest::RequestBuilder> {
        let builder = self
            .client
            .post(url)
            .timeout(timeout)
            .header(TASK_ID_HEADER, task_id.to_string())
            .header(CREDENTIALS_HEADER, &self.secret)
            .header(reqwest::header::AUTHORIZATION, PROTOCOL_VERSION);

        let builder = match body {
            DeliveryBody::Error(msg) => builder
                .header(reqwest::header::CONTENT_TYPE, ERROR_CONTENT_TYPE)
                .body(msg),
            DeliveryBody::Json(json) => builder
                .header(reqwest::header::CONTENT_TYPE, "application/json")
                .body(json),
            DeliveryBody::Multipart {
                results,
                attachments,
            } => {
                let mut form = Form::new().part(
                    RESULTS_PART,
                    Part::bytes(results)
                        .mime_str("application/json")
                        .map_err(|e| Error::Http(e.to_string()))?,
                );
                for (name, data) in attachments {
                    form = form.part(name.clone(), Part::bytes(data.to_vec()).file_name(name));
                }
                builder.multipart(form)
            }
        };
        Ok(builder)
    }
}
