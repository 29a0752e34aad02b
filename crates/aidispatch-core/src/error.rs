//! Error types for AI dispatch.

use thiserror::Error;

/// Message delivered when no worker can take a job. Shared by unknown
/// pipelines and exhausted capacity.
pub const NO_WORKERS_MSG: &str = "no workers can process job requested";

#[derive(Error, Debug)]
pub enum Error {
    #[error("{}", NO_WORKERS_MSG)]
    UnknownPipeline(String),

    #[error("{}", NO_WORKERS_MSG)]
    NoCapacity { capability: String, model_id: String },

    #[error("AI request not correct for {pipeline} pipeline")]
    Validation { pipeline: String },

    #[error("{0}")]
    Fetch(String),

    /// Ordinary worker failure; the node keeps serving.
    #[error("{0}")]
    Worker(String),

    /// The worker runtime is unsafe to keep using; the node must terminate.
    #[error("{0}")]
    Fatal(String),

    #[error("job queue is full")]
    QueueFull,

    #[error("node is shutting down")]
    ShuttingDown,

    #[error("task {0} was already submitted")]
    DuplicateTask(u64),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
