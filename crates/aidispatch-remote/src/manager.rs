//! Remote worker pool.
//!
//! One actor per connection. Jobs are pushed to the chosen worker's outbound
//! channel and correlated back by a manager-local task id. Each pending task
//! owns a capacity slot in its worker's registry, so the slot is returned
//! whichever of completion, disconnect, timeout or caller drop comes first.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::{Stream, StreamExt};
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot, Notify};
use tracing::{debug, info, warn};

use aidispatch_core::capabilities::PerCapabilityConstraints;
use aidispatch_core::{
    resolve_capability, Capability, CapabilityRegistry, CapacitySlot, Error, PipelineRequest,
    Result, WorkerResult,
};

use crate::protocol::{Completion, JobMessage, ServerMessage, WorkerMessage};

pub const DISCONNECTED_MSG: &str = "remote worker disconnected";

struct RemoteWorker {
    id: String,
    capabilities: PerCapabilityConstraints,
    registry: Arc<CapabilityRegistry>,
    outbound: mpsc::Sender<ServerMessage>,
    evicted: Notify,
    connected_at: DateTime<Utc>,
}

struct Pending {
    worker_id: String,
    capability: Capability,
    tx: oneshot::Sender<Result<WorkerResult>>,
    _slot: CapacitySlot,
}

/// Removes a pending entry if the waiting future goes away first.
struct PendingGuard<'a> {
    pending: &'a DashMap<u64, Pending>,
    task_id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.remove(&self.task_id);
    }
}

/// Snapshot of one connected worker.
#[derive(Debug, Clone, Serialize)]
pub struct RemoteWorkerInfo {
    pub id: String,
    pub capabilities: PerCapabilityConstraints,
    pub available: PerCapabilityConstraints,
    pub in_flight: usize,
    pub connected_at: DateTime<Utc>,
}

pub struct RemoteWorkerManager {
    node_registry: Arc<CapabilityRegistry>,
    workers: RwLock<Vec<Arc<RemoteWorker>>>,
    pending: DashMap<u64, Pending>,
    cursor: AtomicUsize,
    next_task_id: AtomicU64,
    timeout: Duration,
}

impl RemoteWorkerManager {
    pub fn new(node_registry: Arc<CapabilityRegistry>, timeout: Duration) -> Self {
        Self {
            node_registry,
            workers: RwLock::new(Vec::new()),
            pending: DashMap::new(),
            cursor: AtomicUsize::new(0),
            next_task_id: AtomicU64::new(0),
            timeout,
        }
    }

    /// Serve one connection until its inbound stream ends or it is evicted.
    ///
    /// Returns the id the worker was registered under.
    pub async fn manage<S>(
        &self,
        capabilities: PerCapabilityConstraints,
        outbound: mpsc::Sender<ServerMessage>,
        inbound: S,
    ) -> String
    where
        S: Stream<Item = WorkerMessage> + Send,
    {
        let worker = self.register(capabilities, outbound);
        let mut inbound = std::pin::pin!(inbound);

        loop {
            tokio::select! {
                _ = worker.evicted.notified() => break,
                msg = inbound.next() => match msg {
                    Some(WorkerMessage::Completion(completion)) => {
                        self.complete(Some(&worker.id), completion);
                    }
                    Some(WorkerMessage::Register { .. }) => {
                        warn!("Remote worker {} sent a second register; ignored", worker.id);
                    }
                    None => break,
                },
            }
        }

        self.remove(&worker.id);
        worker.id.clone()
    }

    fn register(
        &self,
        capabilities: PerCapabilityConstraints,
        outbound: mpsc::Sender<ServerMessage>,
    ) -> Arc<RemoteWorker> {
        let worker = Arc::new(RemoteWorker {
            id: uuid::Uuid::new_v4().to_string(),
            registry: Arc::new(CapabilityRegistry::new(capabilities.clone())),
            capabilities,
            outbound,
            evicted: Notify::new(),
            connected_at: Utc::now(),
        });
        self.node_registry.add_capacity(&worker.capabilities);
        self.workers.write().push(Arc::clone(&worker));
        info!(
            "Remote worker {} registered ({} capabilities)",
            worker.id,
            worker.capabilities.len()
        );
        worker
    }

    /// Drop a worker from the pool and fail everything it had in flight.
    fn remove(&self, id: &str) -> Option<Arc<RemoteWorker>> {
        let worker = {
            let mut workers = self.workers.write();
            let idx = workers.iter().position(|w| w.id == id)?;
            workers.remove(idx)
        };
        self.node_registry.remove_capacity(&worker.capabilities);

        let orphaned: Vec<u64> = self
            .pending
            .iter()
            .filter(|entry| entry.value().worker_id == id)
            .map(|entry| *entry.key())
            .collect();
        for task_id in &orphaned {
            if let Some((_, pending)) = self.pending.remove(task_id) {
                let _ = pending.tx.send(Err(Error::Worker(DISCONNECTED_MSG.into())));
            }
        }
        info!(
            "Remote worker {} removed ({} in-flight tasks failed)",
            id,
            orphaned.len()
        );
        Some(worker)
    }

    /// Forcibly disconnect a worker. Returns false if it was not registered.
    pub fn evict(&self, id: &str) -> bool {
        match self.remove(id) {
            Some(worker) => {
                let _ = worker.outbound.try_send(ServerMessage::Stop);
                worker.evicted.notify_one();
                true
            }
            None => false,
        }
    }

    /// Evict every worker.
    pub fn stop(&self) {
        let ids: Vec<String> = self.workers.read().iter().map(|w| w.id.clone()).collect();
        for id in ids {
            self.evict(&id);
        }
    }

    fn is_registered(&self, id: &str) -> bool {
        self.workers.read().iter().any(|w| w.id == id)
    }

    fn select(&self, capability: Capability, model_id: &str) -> Option<(Arc<RemoteWorker>, CapacitySlot)> {
        let workers = self.workers.read();
        let n = workers.len();
        if n == 0 {
            return None;
        }
        let start = self.cursor.fetch_add(1, Ordering::Relaxed) % n;
        (0..n).find_map(|i| {
            let worker = &workers[(start + i) % n];
            worker
                .registry
                .try_acquire(capability, model_id)
                .map(|slot| (Arc::clone(worker), slot))
        })
    }

    /// Run `request` on some connected worker and wait for its completion.
    pub async fn process(&self, request: PipelineRequest) -> Result<WorkerResult> {
        let capability = request.capability();
        let (worker, slot) = self
            .select(capability, request.model_id())
            .ok_or_else(|| Error::NoCapacity {
                capability: capability.to_string(),
                model_id: request.model_id().to_string(),
            })?;
        self.send_to(&worker, slot, request).await
    }

    async fn send_to(
        &self,
        worker: &RemoteWorker,
        slot: CapacitySlot,
        request: PipelineRequest,
    ) -> Result<WorkerResult> {
        let capability = request.capability();
        let model_id = request.model_id().to_string();
        let request_data = request.to_json()?;
        let source_url = request.media().map(|m| m.source_url.clone());

        let task_id = self.next_task_id.fetch_add(1, Ordering::Relaxed) + 1;
        let (tx, rx) = oneshot::channel();
        self.pending.insert(
            task_id,
            Pending {
                worker_id: worker.id.clone(),
                capability,
                tx,
                _slot: slot,
            },
        );
        let _guard = PendingGuard {
            pending: &self.pending,
            task_id,
        };
        // `remove` may have swept `pending` between selection and the insert.
        if !self.is_registered(&worker.id) {
            return Err(Error::Worker(DISCONNECTED_MSG.into()));
        }

        let job = ServerMessage::Job(JobMessage {
            task_id,
            pipeline: capability.pipeline().to_string(),
            model_id,
            source_url,
            request_data,
        });
        debug!("Remote task {} sent to worker {}", task_id, worker.id);
        if worker.outbound.send(job).await.is_err() {
            return Err(Error::Worker(DISCONNECTED_MSG.into()));
        }

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(Error::Worker(DISCONNECTED_MSG.into())),
            Err(_) => {
                warn!("Remote task {} timed out on worker {}", task_id, worker.id);
                Err(Error::Worker(format!(
                    "remote worker timed out after {}s",
                    self.timeout.as_secs()
                )))
            }
        }
    }

    /// Hand a completion to the task waiting on it.
    ///
    /// With `worker_id` set, only a task sent to that worker matches.
    /// Duplicate or unmatched completions are discarded.
    pub fn complete(&self, worker_id: Option<&str>, completion: Completion) -> bool {
        let task_id = completion.task_id;
        let entry = self
            .pending
            .remove_if(&task_id, |_, p| worker_id.map_or(true, |id| id == p.worker_id));
        let Some((_, pending)) = entry else {
            warn!(
                "Discarding completion for unknown task {} (worker {})",
                task_id,
                worker_id.unwrap_or("-")
            );
            return false;
        };

        let unrecoverable = completion.unrecoverable;
        let result = completion.into_result(pending.capability);
        let _ = pending.tx.send(result);

        if unrecoverable {
            warn!(
                "Remote worker {} reported an unrecoverable error; evicting",
                pending.worker_id
            );
            self.evict(&pending.worker_id);
        }
        true
    }

    pub fn has_capacity(&self, pipeline: &str, model_id: &str) -> bool {
        let Ok(capability) = resolve_capability(pipeline) else {
            return false;
        };
        self.workers
            .read()
            .iter()
            .any(|w| w.registry.is_eligible(capability, model_id))
    }

    pub fn workers(&self) -> Vec<RemoteWorkerInfo> {
        self.workers
            .read()
            .iter()
            .map(|w| RemoteWorkerInfo {
                id: w.id.clone(),
                capabilities: w.capabilities.clone(),
                available: w.registry.available(),
                in_flight: self
                    .pending
                    .iter()
                    .filter(|p| p.value().worker_id == w.id)
                    .count(),
                connected_at: w.connected_at,
            })
            .collect()
    }

    pub fn worker_count(&self) -> usize {
        self.workers.read().len()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aidispatch_core::capabilities::{single_model, ModelConstraint};
    use aidispatch_core::pipeline::LlmRequest;
    use tokio_stream::wrappers::ReceiverStream;

    struct FakeWorker {
        jobs: mpsc::Receiver<ServerMessage>,
        replies: mpsc::Sender<WorkerMessage>,
        done: tokio::task::JoinHandle<String>,
    }

    fn llm_caps(capacity: u32) -> PerCapabilityConstraints {
        single_model(
            Capability::Llm,
            "m1",
            ModelConstraint {
                warm: true,
                capacity,
            },
        )
    }

    fn llm_request() -> PipelineRequest {
        PipelineRequest::Llm(LlmRequest {
            prompt: "hello".into(),
            model_id: "m1".into(),
            ..Default::default()
        })
    }

    async fn connect(manager: &Arc<RemoteWorkerManager>, caps: PerCapabilityConstraints) -> FakeWorker {
        let before = manager.worker_count();
        let (out_tx, out_rx) = mpsc::channel(16);
        let (in_tx, in_rx) = mpsc::channel(16);
        let m = Arc::clone(manager);
        let done = tokio::spawn(async move {
            m.manage(caps, out_tx, ReceiverStream::new(in_rx)).await
        });
        while manager.worker_count() == before {
            tokio::task::yield_now().await;
        }
        FakeWorker {
            jobs: out_rx,
            replies: in_tx,
            done,
        }
    }

    async fn next_job(worker: &mut FakeWorker) -> JobMessage {
        match worker.jobs.recv().await {
            Some(ServerMessage::Job(job)) => job,
            other => panic!("expected job, got {:?}", other),
        }
    }

    fn manager() -> (Arc<CapabilityRegistry>, Arc<RemoteWorkerManager>) {
        let node = Arc::new(CapabilityRegistry::default());
        let manager = Arc::new(RemoteWorkerManager::new(
            Arc::clone(&node),
            Duration::from_secs(5),
        ));
        (node, manager)
    }

    #[tokio::test]
    async fn test_register_adds_node_capacity() {
        let (node, manager) = manager();
        assert!(!manager.has_capacity("llm", "m1"));

        let worker = connect(&manager, llm_caps(2)).await;
        assert!(manager.has_capacity("llm", "m1"));
        assert_eq!(node.remaining(Capability::Llm, "m1"), Some(2));

        drop(worker.replies);
        worker.done.await.unwrap();
        assert_eq!(manager.worker_count(), 0);
        assert_eq!(node.remaining(Capability::Llm, "m1"), None);
    }

    #[tokio::test]
    async fn test_completion_correlates() {
        let (_node, manager) = manager();
        let mut worker = connect(&manager, llm_caps(1)).await;

        let m = Arc::clone(&manager);
        let call = tokio::spawn(async move { m.process(llm_request()).await });

        let job = next_job(&mut worker).await;
        assert_eq!(job.pipeline, "llm");
        assert_eq!(job.request_data["prompt"], "hello");
        // Worker slot is held while the task is pending.
        assert!(!manager.has_capacity("llm", "m1"));

        worker
            .replies
            .send(WorkerMessage::Completion(Completion::success(
                job.task_id,
                serde_json::json!({"response": "hi", "tokens_used": 3}),
            )))
            .await
            .unwrap();

        let result = call.await.unwrap().unwrap();
        assert_eq!(
            serde_json::to_value(&result.payload).unwrap(),
            serde_json::json!({"response": "hi", "tokens_used": 3})
        );
        assert!(manager.has_capacity("llm", "m1"));
        assert_eq!(manager.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_duplicate_and_unmatched_completions_discarded() {
        let (_node, manager) = manager();
        let mut worker = connect(&manager, llm_caps(1)).await;

        let m = Arc::clone(&manager);
        let call = tokio::spawn(async move { m.process(llm_request()).await });
        let job = next_job(&mut worker).await;

        // Wrong worker id does not match.
        assert!(!manager.complete(
            Some("someone-else"),
            Completion::failure(job.task_id, "nope")
        ));
        assert!(manager.complete(None, Completion::failure(job.task_id, "first")));
        assert!(!manager.complete(None, Completion::failure(job.task_id, "second")));
        assert!(!manager.complete(None, Completion::failure(999, "stray")));

        let err = call.await.unwrap().unwrap_err();
        assert_eq!(err.to_string(), "first");
    }

    #[tokio::test]
    async fn test_disconnect_fails_in_flight() {
        let (node, manager) = manager();
        let mut worker = connect(&manager, llm_caps(1)).await;

        let m = Arc::clone(&manager);
        let call = tokio::spawn(async move { m.process(llm_request()).await });
        let _job = next_job(&mut worker).await;

        drop(worker.replies);
        let err = call.await.unwrap().unwrap_err();
        assert_eq!(err.to_string(), DISCONNECTED_MSG);
        assert!(!err.is_fatal());
        worker.done.await.unwrap();
        assert_eq!(node.remaining(Capability::Llm, "m1"), None);
        assert_eq!(manager.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_unrecoverable_completion_evicts_worker() {
        let (_node, manager) = manager();
        let mut worker = connect(&manager, llm_caps(1)).await;

        let m = Arc::clone(&manager);
        let call = tokio::spawn(async move { m.process(llm_request()).await });
        let job = next_job(&mut worker).await;

        let mut completion = Completion::failure(job.task_id, "runtime crashed");
        completion.unrecoverable = true;
        worker
            .replies
            .send(WorkerMessage::Completion(completion))
            .await
            .unwrap();

        let err = call.await.unwrap().unwrap_err();
        assert!(!err.is_fatal());
        assert_eq!(err.to_string(), "runtime crashed");
        assert!(matches!(worker.jobs.recv().await, Some(ServerMessage::Stop)));
        worker.done.await.unwrap();
        assert_eq!(manager.worker_count(), 0);
    }

    #[tokio::test]
    async fn test_round_robin_and_capacity() {
        let (_node, manager) = manager();
        let mut a = connect(&manager, llm_caps(1)).await;
        let mut b = connect(&manager, llm_caps(1)).await;

        let m = Arc::clone(&manager);
        let first = tokio::spawn(async move { m.process(llm_request()).await });
        let m = Arc::clone(&manager);
        let second = tokio::spawn(async move { m.process(llm_request()).await });

        let job_a = next_job(&mut a).await;
        let job_b = next_job(&mut b).await;
        assert_ne!(job_a.task_id, job_b.task_id);

        // Both workers are busy now.
        let err = manager.process(llm_request()).await.unwrap_err();
        assert!(matches!(err, Error::NoCapacity { .. }));

        for (worker, job) in [(&a, &job_a), (&b, &job_b)] {
            worker
                .replies
                .send(WorkerMessage::Completion(Completion::success(
                    job.task_id,
                    serde_json::json!({"response": "ok", "tokens_used": 1}),
                )))
                .await
                .unwrap();
        }
        assert!(first.await.unwrap().is_ok());
        assert!(second.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_timeout_releases_slot() {
        let node = Arc::new(CapabilityRegistry::default());
        let manager = Arc::new(RemoteWorkerManager::new(node, Duration::from_millis(50)));
        let mut worker = connect(&manager, llm_caps(1)).await;

        let m = Arc::clone(&manager);
        let call = tokio::spawn(async move { m.process(llm_request()).await });
        let _job = next_job(&mut worker).await;

        let err = call.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::Worker(_)));
        assert_eq!(manager.pending_count(), 0);
        assert!(manager.has_capacity("llm", "m1"));
    }

    #[tokio::test]
    async fn test_dropped_caller_releases_slot() {
        let (_node, manager) = manager();
        let mut worker = connect(&manager, llm_caps(1)).await;

        let m = Arc::clone(&manager);
        let call = tokio::spawn(async move { m.process(llm_request()).await });
        let _job = next_job(&mut worker).await;
        call.abort();
        let _ = call.await;

        assert_eq!(manager.pending_count(), 0);
        assert!(manager.has_capacity("llm", "m1"));
    }

    #[tokio::test]
    async fn test_worker_removed_after_selection_fails_fast() {
        let (_node, manager) = manager();
        let mut worker = connect(&manager, llm_caps(1)).await;

        let (selected, slot) = manager.select(Capability::Llm, "m1").unwrap();
        // Pending tasks were swept before this one is registered.
        assert!(manager.remove(&selected.id).is_some());

        let result = tokio::time::timeout(
            Duration::from_secs(1),
            manager.send_to(&selected, slot, llm_request()),
        )
        .await
        .expect("send_to waited on a removed worker");
        let err = result.unwrap_err();
        assert_eq!(err.to_string(), DISCONNECTED_MSG);
        assert_eq!(manager.pending_count(), 0);
        assert!(worker.jobs.try_recv().is_err());

        drop(worker.replies);
        worker.done.await.unwrap();
        assert_eq!(manager.worker_count(), 0);
    }

    #[tokio::test]
    async fn test_stop_evicts_all() {
        let (node, manager) = manager();
        let a = connect(&manager, llm_caps(1)).await;
        let b = connect(&manager, llm_caps(1)).await;
        assert_eq!(node.remaining(Capability::Llm, "m1"), Some(2));
        assert_eq!(manager.workers().len(), 2);

        manager.stop();
        a.done.await.unwrap();
        b.done.await.unwrap();
        assert_eq!(manager.worker_count(), 0);
        assert!(node.snapshot().is_empty());
        assert!(!manager.evict("unknown"));
    }
}
