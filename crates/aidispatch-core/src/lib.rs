//! AI Dispatch Core: capabilities, constraints, job model, configuration.

pub mod capabilities;
pub mod config;
pub mod error;
pub mod job;
pub mod pipeline;

pub use capabilities::{
    eligible, resolve_capability, Capability, CapabilityConstraints, CapabilityRegistry,
    CapacitySlot, ModelConstraint, PerCapabilityConstraints,
};
pub use config::{DispatchConfig, RunnerDefinition, RunnersConfig};
pub use error::{Error, Result, NO_WORKERS_MSG};
pub use job::{JobNotification, Outcome, WorkerResult};
pub use pipeline::{decode, MediaInput, PipelineRequest, PipelineResponse};
