//! Pipeline dispatcher: turns job notifications into delivered outcomes.
//!
//! `submit` only enqueues. A pump task drains the bounded queue and runs
//! each job on its own task, at most `max_concurrent_jobs` at a time.
//! Per job: resolve, check eligibility, validate, take a capacity slot,
//! fetch input media, pick a worker, invoke, release the slot, deliver.
//!
//! A task id is accepted once while its record is retained. Once the node
//! is terminating, queued jobs and jobs still executing are delivered
//! "node is shutting down" instead of being dropped.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use aidispatch_core::{
    decode, resolve_capability, Capability, CapabilityRegistry, DispatchConfig, Error,
    JobNotification, Outcome, Result, WorkerResult,
};
use aidispatch_worker::AiWorker;

use crate::fatal::FatalHandle;
use crate::fetch::MediaFetcher;
use crate::transport::ResultTransport;
use crate::types::{DispatchStatus, JobRecord, JobState};

/// Finished job records retained for status queries.
const MAX_FINISHED_RECORDS: usize = 100;

const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(20);

pub struct Dispatcher {
    registry: Arc<CapabilityRegistry>,
    local: Option<Arc<dyn AiWorker>>,
    remote: Option<Arc<dyn AiWorker>>,
    fetcher: MediaFetcher,
    transport: ResultTransport,
    fatal: FatalHandle,
    callback_host: String,
    job_timeout: Duration,
    fatal_delivery_timeout: Duration,
    max_concurrent_jobs: usize,
    jobs: RwLock<HashMap<u64, JobRecord>>,
    queue_tx: mpsc::Sender<JobNotification>,
    queue_rx: Mutex<Option<mpsc::Receiver<JobNotification>>>,
    running: Arc<AtomicUsize>,
    /// Accepted by `submit` and not yet delivered.
    outstanding: Arc<AtomicUsize>,
    closing: AtomicBool,
}

impl Dispatcher {
    pub fn new(
        config: &DispatchConfig,
        registry: Arc<CapabilityRegistry>,
        fetcher: MediaFetcher,
        transport: ResultTransport,
        fatal: FatalHandle,
    ) -> Self {
        let (queue_tx, queue_rx) = mpsc::channel(config.queue_depth.max(1));
        Self {
            registry,
            local: None,
            remote: None,
            fetcher,
            transport,
            fatal,
            callback_host: config.callback_host.clone(),
            job_timeout: config.job_timeout,
            fatal_delivery_timeout: config.fatal_delivery_timeout,
            max_concurrent_jobs: config.max_concurrent_jobs.max(1),
            jobs: RwLock::new(HashMap::new()),
            queue_tx,
            queue_rx: Mutex::new(Some(queue_rx)),
            running: Arc::new(AtomicUsize::new(0)),
            outstanding: Arc::new(AtomicUsize::new(0)),
            closing: AtomicBool::new(false),
        }
    }

    pub fn with_local(mut self, worker: Arc<dyn AiWorker>) -> Self {
        self.local = Some(worker);
        self
    }

    pub fn with_remote(mut self, worker: Arc<dyn AiWorker>) -> Self {
        self.remote = Some(worker);
        self
    }

    pub fn registry(&self) -> &Arc<CapabilityRegistry> {
        &self.registry
    }

    pub fn fatal(&self) -> &FatalHandle {
        &self.fatal
    }

    /// Enqueue a job and return immediately.
    ///
    /// A task id that is still tracked, queued, running or delivered, is
    /// refused so it never produces a second outcome.
    pub fn submit(&self, job: JobNotification) -> Result<()> {
        if self.is_draining() {
            return Err(Error::ShuttingDown);
        }

        let task_id = job.task_id;
        {
            let mut jobs = self.jobs.write();
            if jobs.contains_key(&task_id) {
                warn!("Job {} already submitted; refusing duplicate", task_id);
                return Err(Error::DuplicateTask(task_id));
            }
            jobs.insert(
                task_id,
                JobRecord {
                    task_id,
                    pipeline: job.pipeline.clone(),
                    model_id: job.model_id.clone(),
                    state: JobState::Received,
                    worker: None,
                    error: None,
                    delivered: false,
                    received_at: now_millis(),
                    completed_at: None,
                },
            );
        }

        self.outstanding.fetch_add(1, Ordering::SeqCst);
        match self.queue_tx.try_send(job) {
            Ok(()) => {
                debug!("Job {} queued", task_id);
                Ok(())
            }
            Err(e) => {
                // The record was inserted above; nothing else can own it yet.
                self.outstanding.fetch_sub(1, Ordering::SeqCst);
                self.jobs.write().remove(&task_id);
                match e {
                    mpsc::error::TrySendError::Full(_) => Err(Error::QueueFull),
                    mpsc::error::TrySendError::Closed(_) => Err(Error::ShuttingDown),
                }
            }
        }
    }

    /// Start the queue pump. Returns `None` if it is already running.
    pub fn start(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        let mut rx = match self.queue_rx.lock().take() {
            Some(rx) => rx,
            None => {
                error!("Dispatcher already started");
                return None;
            }
        };

        let dispatcher = Arc::clone(self);
        Some(tokio::spawn(async move {
            info!(
                "Dispatcher started (max {} concurrent jobs)",
                dispatcher.max_concurrent_jobs
            );
            let permits = Arc::new(Semaphore::new(dispatcher.max_concurrent_jobs));
            while let Some(job) = rx.recv().await {
                // Shutdown deliveries skip the concurrency limit.
                let permit = if dispatcher.is_draining() {
                    None
                } else {
                    match Arc::clone(&permits).acquire_owned().await {
                        Ok(permit) => Some(permit),
                        Err(_) => break,
                    }
                };
                let running = Arc::clone(&dispatcher.running);
                running.fetch_add(1, Ordering::SeqCst);
                let d = Arc::clone(&dispatcher);
                tokio::spawn(async move {
                    d.run_job(job).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                    d.outstanding.fetch_sub(1, Ordering::SeqCst);
                    drop(permit);
                });
            }
            info!("Dispatcher stopped");
        }))
    }

    /// Run one job to completion and deliver its outcome.
    pub async fn run_job(&self, job: JobNotification) -> Outcome {
        let task_id = job.task_id;
        let outcome: Outcome = if self.is_draining() {
            Outcome::Failure(Error::ShuttingDown)
        } else {
            tokio::select! {
                result = self.execute(&job) => result.into(),
                _ = self.fatal.wait() => {
                    info!("Job {} abandoned: node is terminating", task_id);
                    Outcome::Failure(Error::ShuttingDown)
                }
            }
        };

        // Deliveries made while terminating are bounded by the fatal deadline.
        let delivered = if outcome.is_fatal() || self.fatal.is_triggered() {
            self.transport
                .deliver_within(&self.callback_host, task_id, &outcome, self.fatal_delivery_timeout)
                .await
        } else {
            self.transport
                .deliver(&self.callback_host, task_id, &outcome)
                .await
        };

        let state = match &outcome {
            Outcome::Success(_) => JobState::DeliveredSuccess,
            Outcome::Failure(e) if e.is_fatal() => JobState::Terminating,
            Outcome::Failure(_) => JobState::DeliveredError,
        };
        self.finish(task_id, state, outcome.error().map(|e| e.to_string()), delivered);

        match &outcome {
            Outcome::Success(result) => info!(
                "Job {} ({}) succeeded with {} outputs",
                task_id,
                job.pipeline,
                result.payload.output_count()
            ),
            Outcome::Failure(e) if e.is_fatal() => {
                error!("Job {} hit an unrecoverable error: {}", task_id, e);
                self.fatal.trigger(e.to_string());
            }
            Outcome::Failure(e) => info!("Job {} ({}) failed: {}", task_id, job.pipeline, e),
        }

        outcome
    }

    async fn execute(&self, job: &JobNotification) -> Result<WorkerResult> {
        let task_id = job.task_id;

        self.set_state(task_id, JobState::Resolving);
        let capability = resolve_capability(&job.pipeline)?;
        if !self.registry.is_eligible(capability, &job.model_id) {
            return Err(no_capacity(capability, &job.model_id));
        }

        self.set_state(task_id, JobState::Validating);
        let mut request = decode(
            capability,
            &job.model_id,
            job.source_url.as_deref(),
            &job.request_data,
        )?;

        self.set_state(task_id, JobState::Dispatching);
        let _slot = self
            .registry
            .try_acquire(capability, &job.model_id)
            .ok_or_else(|| no_capacity(capability, &job.model_id))?;

        if let Some(media) = request.media_mut() {
            media.data = self.fetcher.fetch(&media.source_url).await?;
        }

        let worker = self
            .select_worker(capability, &job.model_id)
            .ok_or_else(|| no_capacity(capability, &job.model_id))?;
        self.set_worker(task_id, worker.name());

        self.set_state(task_id, JobState::Invoking);
        debug!(
            "Job {} invoking {} on {} worker",
            task_id,
            capability,
            worker.name()
        );
        match tokio::time::timeout(self.job_timeout, worker.invoke(request)).await {
            Ok(result) => result,
            Err(_) => Err(Error::Worker(format!(
                "job timed out after {}s",
                self.job_timeout.as_secs()
            ))),
        }
    }

    /// Stop accepting jobs and wait up to `timeout` for every accepted job
    /// to be delivered. Returns false if some were still outstanding.
    pub async fn drain(&self, timeout: Duration) -> bool {
        self.closing.store(true, Ordering::SeqCst);
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let outstanding = self.outstanding.load(Ordering::SeqCst);
            if outstanding == 0 {
                info!("Dispatcher drained");
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                warn!("Dispatcher drain timed out with {} jobs outstanding", outstanding);
                return false;
            }
            tokio::time::sleep(DRAIN_POLL_INTERVAL).await;
        }
    }

    fn is_draining(&self) -> bool {
        self.closing.load(Ordering::SeqCst) || self.fatal.is_triggered()
    }

    /// Local first, then the remote pool.
    fn select_worker(&self, capability: Capability, model_id: &str) -> Option<Arc<dyn AiWorker>> {
        let pipeline = capability.pipeline();
        [&self.local, &self.remote]
            .into_iter()
            .flatten()
            .find(|w| w.has_capacity(pipeline, model_id))
            .cloned()
    }

    fn set_state(&self, task_id: u64, state: JobState) {
        if let Some(record) = self.jobs.write().get_mut(&task_id) {
            record.state = state;
        }
    }

    fn set_worker(&self, task_id: u64, worker: &str) {
        if let Some(record) = self.jobs.write().get_mut(&task_id) {
            record.worker = Some(worker.to_string());
        }
    }

    fn finish(&self, task_id: u64, state: JobState, error: Option<String>, delivered: bool) {
        {
            let mut jobs = self.jobs.write();
            if let Some(record) = jobs.get_mut(&task_id) {
                record.state = state;
                record.error = error;
                record.delivered = delivered;
                record.completed_at = Some(now_millis());
            }
        }
        if !delivered {
            warn!("Job {} outcome was not acknowledged", task_id);
        }
        self.cleanup_old_jobs();
    }

    fn cleanup_old_jobs(&self) {
        let mut jobs = self.jobs.write();
        let mut finished: Vec<(u64, i64)> = jobs
            .values()
            .filter(|j| j.state.is_finished())
            .map(|j| (j.task_id, j.completed_at.unwrap_or(0)))
            .collect();

        if finished.len() > MAX_FINISHED_RECORDS {
            finished.sort_by_key(|(_, t)| *t);
            let remove_count = finished.len() - MAX_FINISHED_RECORDS;
            for (id, _) in finished.into_iter().take(remove_count) {
                jobs.remove(&id);
            }
        }
    }

    pub fn job(&self, task_id: u64) -> Option<JobRecord> {
        self.jobs.read().get(&task_id).cloned()
    }

    /// All tracked jobs, newest first.
    pub fn jobs(&self) -> Vec<JobRecord> {
        let mut jobs: Vec<JobRecord> = self.jobs.read().values().cloned().collect();
        jobs.sort_by(|a, b| b.received_at.cmp(&a.received_at).then(b.task_id.cmp(&a.task_id)));
        jobs
    }

    pub fn status(&self) -> DispatchStatus {
        DispatchStatus {
            queued: self.queue_tx.max_capacity() - self.queue_tx.capacity(),
            running: self.running.load(Ordering::SeqCst),
            max_concurrent_jobs: self.max_concurrent_jobs,
            terminating: self.fatal.is_triggered(),
            available: self.registry.available(),
        }
    }
}

fn no_capacity(capability: Capability, model_id: &str) -> Error {
    Error::NoCapacity {
        capability: capability.to_string(),
        model_id: model_id.to_string(),
    }
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
