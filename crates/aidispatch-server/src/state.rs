//! Shared application state.

use std::sync::Arc;

use tracing::{error, info};

use aidispatch_core::capabilities::{single_model, ModelConstraint};
use aidispatch_core::{CapabilityRegistry, DispatchConfig, Error, Result, RunnersConfig};
use aidispatch_remote::{RemoteWorkerManager, RemoteWorkerProxy};
use aidispatch_runtime::{Dispatcher, FatalHandle, MediaFetcher, ResultTransport};
use aidispatch_worker::{AiWorker, RunnerEndpoint, RunnerWorker};

pub struct AppState {
    pub config: DispatchConfig,
    pub registry: Arc<CapabilityRegistry>,
    pub local: Arc<RunnerWorker>,
    pub remote: Arc<RemoteWorkerManager>,
    pub dispatcher: Arc<Dispatcher>,
}

impl AppState {
    pub fn new(config: DispatchConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(config.insecure_tls)
            .build()
            .map_err(|e| Error::Http(format!("failed to build HTTP client: {}", e)))?;

        let registry = Arc::new(CapabilityRegistry::default());
        let local = Arc::new(RunnerWorker::new(client.clone()));
        let remote = Arc::new(RemoteWorkerManager::new(
            Arc::clone(&registry),
            config.job_timeout,
        ));

        let dispatcher = Dispatcher::new(
            &config,
            Arc::clone(&registry),
            MediaFetcher::new(client.clone(), config.fetch_timeout),
            ResultTransport::new(
                client,
                config.callback_scheme.clone(),
                config.orch_secret.clone(),
                config.delivery_timeout,
            ),
            FatalHandle::new(),
        )
        .with_local(local.clone())
        .with_remote(Arc::new(RemoteWorkerProxy::new(Arc::clone(&remote))));

        Ok(Self {
            config,
            registry,
            local,
            remote,
            dispatcher: Arc::new(dispatcher),
        })
    }

    /// Warm every configured runner and advertise its capacity.
    /// Runners that fail to warm are skipped.
    pub async fn warm_runners(&self, runners: &RunnersConfig) -> usize {
        let mut warmed = 0;
        for def in &runners.runners {
            let capability = match def.capability() {
                Ok(c) => c,
                Err(e) => {
                    error!("Runner {} skipped: {}", def.url, e);
                    continue;
                }
            };
            let endpoint = RunnerEndpoint {
                url: def.url.clone(),
                token: def.token.clone(),
                capacity: def.capacity,
            };
            match self
                .local
                .warm(
                    &def.pipeline,
                    &def.model_id,
                    endpoint,
                    def.optimization_flags.clone(),
                )
                .await
            {
                Ok(()) => {
                    self.registry.add_capacity(&single_model(
                        capability,
                        &def.model_id,
                        ModelConstraint {
                            warm: true,
                            capacity: def.capacity,
                        },
                    ));
                    warmed += 1;
                }
                Err(e) => error!(
                    "Failed to warm {} {} at {}: {}",
                    def.pipeline, def.model_id, def.url, e
                ),
            }
        }
        info!("{} of {} runners warm", warmed, runners.runners.len());
        warmed
    }

    pub async fn shutdown(&self) {
        self.remote.stop();
        if let Err(e) = self.local.stop().await {
            error!("Failed to stop local worker: {}", e);
        }
    }
}
