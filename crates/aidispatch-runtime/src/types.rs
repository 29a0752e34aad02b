//! Runtime types.

use serde::Serialize;

use aidispatch_core::capabilities::PerCapabilityConstraints;

/// Stage a job has reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Received,
    Resolving,
    Validating,
    Dispatching,
    Invoking,
    DeliveredSuccess,
    DeliveredError,
    /// Delivered an unrecoverable error; the node is shutting down.
    Terminating,
}

impl JobState {
    pub fn is_finished(&self) -> bool {
        matches!(
            self,
            Self::DeliveredSuccess | Self::DeliveredError | Self::Terminating
        )
    }
}

/// Status of one job, kept for the status endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct JobRecord {
    #[serde(rename = "taskId")]
    pub task_id: u64,
    pub pipeline: String,
    #[serde(rename = "modelId")]
    pub model_id: String,
    pub state: JobState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Whether the callback receiver acknowledged the outcome.
    pub delivered: bool,
    #[serde(rename = "receivedAt")]
    pub received_at: i64,
    #[serde(rename = "completedAt", skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<i64>,
}

/// Dispatcher status information.
#[derive(Debug, Clone, Serialize)]
pub struct DispatchStatus {
    pub queued: usize,
    pub running: usize,
    #[serde(rename = "maxConcurrentJobs")]
    pub max_concurrent_jobs: usize,
    pub terminating: bool,
    /// Remaining capacity per capability and model.
    pub available: PerCapabilityConstraints,
}
