//! Node configuration and local runner definitions.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::capabilities::{resolve_capability, Capability};
use crate::error::{Error, Result};

pub const DEFAULT_PORT: u16 = 8935;

/// Top-level dispatch node configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// HTTP server port.
    pub port: u16,
    /// Shared secret sent as `Credentials` on callbacks and required on
    /// inbound results.
    pub orch_secret: String,
    /// Host (and optional port) that receives outcome callbacks.
    pub callback_host: String,
    /// `https` unless overridden.
    pub callback_scheme: String,
    pub max_concurrent_jobs: usize,
    pub queue_depth: usize,
    pub fetch_timeout: Duration,
    pub job_timeout: Duration,
    pub delivery_timeout: Duration,
    /// Bound on the last delivery attempt before a fatal exit.
    pub fatal_delivery_timeout: Duration,
    /// Accept self-signed certificates on callbacks and media fetches.
    pub insecure_tls: bool,
    pub runners_file: Option<PathBuf>,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            orch_secret: String::new(),
            callback_host: String::new(),
            callback_scheme: "https".into(),
            max_concurrent_jobs: 16,
            queue_depth: 256,
            fetch_timeout: Duration::from_secs(30),
            job_timeout: Duration::from_secs(600),
            delivery_timeout: Duration::from_secs(30),
            fatal_delivery_timeout: Duration::from_secs(10),
            insecure_tls: false,
            runners_file: None,
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

fn env_secs(key: &str) -> Option<Duration> {
    env_parse::<u64>(key).map(Duration::from_secs)
}

impl DispatchConfig {
    /// Create configuration from environment and defaults.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let orch_secret = std::env::var("AI_ORCH_SECRET").unwrap_or_default();
        if orch_secret.is_empty() {
            return Err(Error::Config("AI_ORCH_SECRET must be set".into()));
        }
        let callback_host = std::env::var("AI_CALLBACK_HOST").unwrap_or_default();
        if callback_host.is_empty() {
            return Err(Error::Config("AI_CALLBACK_HOST must be set".into()));
        }

        let config = Self {
            port: env_parse("PORT").unwrap_or(defaults.port),
            orch_secret,
            callback_host,
            callback_scheme: std::env::var("AI_CALLBACK_SCHEME")
                .unwrap_or(defaults.callback_scheme),
            max_concurrent_jobs: env_parse("AI_MAX_CONCURRENT_JOBS")
                .unwrap_or(defaults.max_concurrent_jobs)
                .max(1),
            queue_depth: env_parse("AI_QUEUE_DEPTH")
                .unwrap_or(defaults.queue_depth)
                .max(1),
            fetch_timeout: env_secs("AI_FETCH_TIMEOUT_SECS").unwrap_or(defaults.fetch_timeout),
            job_timeout: env_secs("AI_JOB_TIMEOUT_SECS").unwrap_or(defaults.job_timeout),
            delivery_timeout: env_secs("AI_DELIVERY_TIMEOUT_SECS")
                .unwrap_or(defaults.delivery_timeout),
            fatal_delivery_timeout: env_secs("AI_FATAL_DELIVERY_TIMEOUT_SECS")
                .unwrap_or(defaults.fatal_delivery_timeout),
            insecure_tls: env_parse("AI_INSECURE_TLS").unwrap_or(false),
            runners_file: std::env::var("AI_RUNNERS_FILE").ok().map(PathBuf::from),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        match self.callback_scheme.as_str() {
            "http" | "https" => Ok(()),
            other => Err(Error::Config(format!("unsupported callback scheme {}", other))),
        }
    }
}

/// One local runner endpoint serving a single model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunnerDefinition {
    pub pipeline: String,
    pub model_id: String,
    pub url: String,
    #[serde(default)]
    pub token: Option<String>,
    /// Concurrent jobs the node advertises for this runner.
    #[serde(default = "default_capacity")]
    pub capacity: u32,
    /// Free-form flags forwarded to the runner when warming.
    #[serde(default)]
    pub optimization_flags: serde_json::Map<String, serde_json::Value>,
}

fn default_capacity() -> u32 {
    1
}

impl RunnerDefinition {
    pub fn capability(&self) -> Result<Capability> {
        resolve_capability(&self.pipeline)
    }
}

/// Runners file (`AI_RUNNERS_FILE`), a JSON document `{ "runners": [...] }`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunnersConfig {
    #[serde(default)]
    pub runners: Vec<RunnerDefinition>,
}

impl RunnersConfig {
    /// Load runners from file. A missing file yields an empty set;
    /// entries with unknown pipelines are skipped.
    pub fn load(path: &Path) -> Result<Self> {
        let data = match std::fs::read_to_string(path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!("Runners file {} not found", path.display());
                return Ok(Self::default());
            }
            Err(e) => return Err(e.into()),
        };
        let mut config: RunnersConfig = serde_json::from_str(&data)?;
        config.runners.retain(|r| match r.capability() {
            Ok(_) => true,
            Err(_) => {
                warn!("Skipping runner for unknown pipeline {}", r.pipeline);
                false
            }
        });
        info!("Loaded {} runner definitions", config.runners.len());
        Ok(config)
    }
}
