use std::{
    future::Future,
    sync::{Arc, Weak},
    time::Duration,
};

use data_model::{FunctionId, FunctionSpec, WorkerId};
use hermes_utils::get_epoch_time_in_ms;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{error, info};

use super::{
    matching_queue::{ConsumeError, MatchingQueue},
    scaling::workers_to_create,
    worker::{Worker, WorkerHooks},
    WorkerDeps,
    WorkerPoolConfig,
};
use crate::metrics::function_attributes;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WorkerPoolError {
    #[error("Timeout error: no worker available after {0:?}")]
    Timeout(Duration),

    #[error("worker pool of {0} is drained")]
    Drained(FunctionId),
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct PoolStats {
    pub function_id: FunctionId,
    pub image_name: String,
    pub workers: usize,
    pub starting: usize,
    pub ready_workers: usize,
    pub pending_requests: usize,
    pub created_at: u64,
}

#[derive(Default)]
struct PoolState {
    workers: Vec<Arc<Worker>>,
    starting: Vec<WorkerId>,
    drained: bool,
}

impl PoolState {
    fn remove_starting(&mut self, id: &WorkerId) {
        self.starting.retain(|starting| starting != id);
    }

    /// Latches `drained` the first time the pool runs out of workers.
    fn mark_drained_if_empty(&mut self) -> bool {
        if self.drained || !self.workers.is_empty() || !self.starting.is_empty() {
            return false;
        }
        self.drained = true;
        true
    }
}

/// The workers dedicated to one function, scaled with demand.
pub struct WorkerPool {
    function: FunctionSpec,
    config: WorkerPoolConfig,
    deps: WorkerDeps,
    state: Mutex<PoolState>,
    queue: MatchingQueue<Arc<Worker>>,
    on_drained: Box<dyn Fn() + Send + Sync>,
    created_at: u64,
    this: Weak<WorkerPool>,
}

impl WorkerPool {
    /// `on_drained` runs at most once, after the last worker of the pool
    /// shut down or the last startup attempt failed.
    pub fn new(
        function: FunctionSpec,
        config: WorkerPoolConfig,
        deps: WorkerDeps,
        on_drained: impl Fn() + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| WorkerPool {
            function,
            config,
            deps,
            state: Mutex::new(PoolState::default()),
            queue: MatchingQueue::new(),
            on_drained: Box::new(on_drained),
            created_at: get_epoch_time_in_ms(),
            this: this.clone(),
        })
    }

    pub fn is_drained(&self) -> bool {
        self.state.lock().drained
    }

    /// Registers a request for a worker, starting more workers if demand
    /// calls for it. Returns `None` once the pool is drained; the request
    /// is not registered in that case.
    pub fn request_worker(
        &self,
    ) -> Option<impl Future<Output = Result<Arc<Worker>, WorkerPoolError>> + Send + 'static> {
        let mut state = self.state.lock();
        if state.drained {
            return None;
        }

        let starting = state.starting.len();
        let ready = self.queue.items_len();
        let pending = self.queue.requests_len() + 1;
        let to_create = workers_to_create(starting, ready, pending);
        if to_create > 0 {
            info!(
                function_id = self.function.function_id.get(),
                to_create, starting, ready, pending, "scaling up worker pool"
            );
        }
        for _ in 0..to_create {
            self.spawn_worker(&mut state);
        }
        let consume = self.queue.consume(self.config.consume_timeout);
        drop(state);

        let function_id = self.function.function_id.clone();
        let metrics = self.deps.metrics.clone();
        Some(async move {
            consume.await.map_err(|err| match err {
                ConsumeError::Timeout(timeout) => {
                    error!(
                        function_id = function_id.get(),
                        "timed out waiting for a worker"
                    );
                    metrics
                        .consume_timeouts
                        .add(1, &function_attributes(function_id.get()));
                    WorkerPoolError::Timeout(timeout)
                }
                ConsumeError::Closed => WorkerPoolError::Drained(function_id),
            })
        })
    }

    pub async fn get_worker(&self) -> Result<Arc<Worker>, WorkerPoolError> {
        match self.request_worker() {
            Some(request) => request.await,
            None => Err(WorkerPoolError::Drained(self.function.function_id.clone())),
        }
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.state.lock();
        PoolStats {
            function_id: self.function.function_id.clone(),
            image_name: self.function.image_name.clone(),
            workers: state.workers.len(),
            starting: state.starting.len(),
            ready_workers: self.queue.items_len(),
            pending_requests: self.queue.requests_len(),
            created_at: self.created_at,
        }
    }

    pub fn workers(&self) -> Vec<Arc<Worker>> {
        self.state.lock().workers.clone()
    }

    pub fn find_worker(&self, id: &WorkerId) -> Option<Arc<Worker>> {
        self.state
            .lock()
            .workers
            .iter()
            .find(|worker| worker.id() == id)
            .cloned()
    }

    /// Shuts down every idle worker. Busy workers finish their run and go
    /// idle on their own.
    pub async fn shutdown_all(&self) {
        for worker in self.workers() {
            worker.shutdown().await;
        }
    }

    fn new_worker(&self) -> Arc<Worker> {
        let on_shutdown = {
            let pool = self.this.clone();
            Box::new(move |id: &WorkerId| {
                if let Some(pool) = pool.upgrade() {
                    pool.remove_worker(id);
                }
            })
        };
        let on_ready = {
            let pool = self.this.clone();
            Box::new(move |id: &WorkerId| {
                if let Some(pool) = pool.upgrade() {
                    pool.requeue_worker(id);
                }
            })
        };
        Worker::new(
            self.function.clone(),
            &self.config,
            self.deps.clone(),
            WorkerHooks {
                on_shutdown,
                on_ready,
            },
        )
    }

    fn spawn_worker(&self, state: &mut PoolState) {
        let Some(pool) = self.this.upgrade() else {
            return;
        };
        let worker = self.new_worker();
        state.starting.push(worker.id().clone());
        tokio::spawn(pool.drive_startup(worker));
    }

    async fn drive_startup(self: Arc<Self>, mut worker: Arc<Worker>) {
        let policy = self.config.startup_retry;
        let mut attempt = 1;
        loop {
            let err = match worker.start().await {
                Ok(()) => {
                    self.worker_started(worker);
                    return;
                }
                Err(err) => err,
            };
            self.deps
                .metrics
                .startup_failures
                .add(1, &function_attributes(self.function.function_id.get()));

            let retry = policy.should_retry(attempt);
            let drained = {
                let mut state = self.state.lock();
                error!(
                    function_id = self.function.function_id.get(),
                    worker_id = worker.id().get(),
                    attempt,
                    tries_left = policy.attempts_left(attempt),
                    "error starting worker: {}", err
                );
                if retry {
                    // The replacement is counted as starting before the failed
                    // one is dropped, so the pool never looks empty meanwhile.
                    let next = self.new_worker();
                    state.starting.push(next.id().clone());
                    state.remove_starting(worker.id());
                    worker = next;
                    false
                } else {
                    state.remove_starting(worker.id());
                    state.mark_drained_if_empty()
                }
            };

            if retry {
                attempt += 1;
                continue;
            }
            if drained {
                info!(
                    function_id = self.function.function_id.get(),
                    "worker pool drained"
                );
                (self.on_drained)();
            }
            return;
        }
    }

    fn worker_started(&self, worker: Arc<Worker>) {
        let mut state = self.state.lock();
        state.remove_starting(worker.id());
        state.workers.push(worker.clone());
        self.queue.add(worker);
        info!(
            function_id = self.function.function_id.get(),
            workers = state.workers.len(),
            starting = state.starting.len(),
            "worker ready"
        );
        self.deps
            .metrics
            .workers_started
            .add(1, &function_attributes(self.function.function_id.get()));
    }

    fn remove_worker(&self, id: &WorkerId) {
        let drained = {
            let mut state = self.state.lock();
            state.workers.retain(|worker| worker.id() != id);
            info!(
                function_id = self.function.function_id.get(),
                worker_id = id.get(),
                workers = state.workers.len(),
                starting = state.starting.len(),
                "removed worker"
            );
            state.mark_drained_if_empty()
        };
        if drained {
            info!(
                function_id = self.function.function_id.get(),
                "worker pool drained"
            );
            (self.on_drained)();
        }
    }

    fn requeue_worker(&self, id: &WorkerId) {
        let state = self.state.lock();
        if let Some(worker) = state.workers.iter().find(|worker| worker.id() == id) {
            self.queue.add(worker.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use bytes::Bytes;
    use data_model::{ControlMessage, RunType};
    use tokio::time;

    use super::*;
    use crate::{
        proxy::RunRequest,
        testing::{function_spec, test_pool_config, wait_until, StartupBehavior, TestHarness},
        workers::WorkerStatus,
    };

    fn pool_with_counter(harness: &TestHarness) -> (Arc<WorkerPool>, Arc<AtomicUsize>) {
        let drained = Arc::new(AtomicUsize::new(0));
        let counter = drained.clone();
        let pool = WorkerPool::new(
            function_spec("echo"),
            test_pool_config(),
            harness.deps(),
            move || {
                counter.fetch_add(1, Ordering::SeqCst);
            },
        );
        (pool, drained)
    }

    #[tokio::test]
    async fn test_first_request_starts_two_workers() {
        let harness = TestHarness::new();
        harness.runtime.script([StartupBehavior::Manual, StartupBehavior::Manual]);
        let (pool, _) = pool_with_counter(&harness);

        let request = pool.request_worker().unwrap();
        let stats = pool.stats();
        assert_eq!(stats.starting, 2);
        assert_eq!(stats.pending_requests, 1);

        harness.runtime.wait_for_starts(2).await;
        let first = harness.runtime.started()[0].dns_name.clone();
        harness.publish(&first.as_str().into(), &ControlMessage::StartupSuccess).await;

        let worker = request.await.unwrap();
        assert_eq!(worker.channel().get(), first);
        let stats = pool.stats();
        assert_eq!(stats.workers, 1);
        assert_eq!(stats.starting, 1);
        assert_eq!(stats.pending_requests, 0);
    }

    #[tokio::test]
    async fn test_ready_worker_serves_next_request() {
        let harness = TestHarness::new();
        let (pool, _) = pool_with_counter(&harness);

        pool.get_worker().await.unwrap();
        harness.runtime.wait_for_starts(2).await;
        wait_until(|| pool.stats().starting == 0).await;
        assert_eq!(pool.stats().ready_workers, 1);

        // supply 1, demand 1: 2 >= 1 so scaling adds one more worker.
        pool.get_worker().await.unwrap();
        harness.runtime.wait_for_starts(3).await;
    }

    #[tokio::test]
    async fn test_startup_retry_recovers() {
        let harness = TestHarness::new();
        harness
            .runtime
            .script([StartupBehavior::SignalError, StartupBehavior::Manual, StartupBehavior::Succeed]);
        let (pool, drained) = pool_with_counter(&harness);

        let request = pool.request_worker().unwrap();
        harness.runtime.wait_for_starts(3).await;
        let retried = harness.runtime.started()[2].dns_name.clone();

        let worker = request.await.unwrap();
        assert_eq!(worker.channel().get(), retried);
        assert_eq!(pool.stats().workers, 1);
        assert_eq!(pool.stats().starting, 1);
        assert_eq!(drained.load(Ordering::SeqCst), 0);
        assert_eq!(
            pool.workers()
                .iter()
                .filter(|w| w.channel().get() == retried)
                .count(),
            1
        );
    }

    #[tokio::test]
    async fn test_exhausted_startups_drain_once() {
        time::pause();
        let harness = TestHarness::new();
        harness.runtime.set_default_behavior(StartupBehavior::SignalError);
        let (pool, drained) = pool_with_counter(&harness);

        let request = pool.request_worker().unwrap();
        harness.runtime.wait_for_starts(4).await;
        wait_until(|| pool.is_drained()).await;

        assert_eq!(drained.load(Ordering::SeqCst), 1);
        assert_eq!(pool.stats().starting, 0);
        assert_eq!(pool.stats().workers, 0);
        assert!(pool.request_worker().is_none());
        assert!(matches!(request.await, Err(WorkerPoolError::Timeout(_))));
        assert_eq!(drained.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_drain_waits_for_remaining_starting_worker() {
        let harness = TestHarness::new();
        harness.runtime.script([
            StartupBehavior::SignalError,
            StartupBehavior::Manual,
            StartupBehavior::SignalError,
            StartupBehavior::SignalError,
        ]);
        let (pool, drained) = pool_with_counter(&harness);

        let _request = pool.request_worker().unwrap();
        harness.runtime.wait_for_starts(3).await;
        wait_until(|| pool.stats().starting == 1).await;
        assert_eq!(drained.load(Ordering::SeqCst), 0);

        let manual = harness.runtime.started()[1].dns_name.clone();
        harness.publish(&manual.as_str().into(), &ControlMessage::StartupError).await;
        wait_until(|| pool.is_drained()).await;
        assert_eq!(drained.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_idle_shutdown_drains_pool() {
        time::pause();
        let harness = TestHarness::new();
        let (pool, drained) = pool_with_counter(&harness);

        pool.get_worker().await.unwrap();
        wait_until(|| pool.stats().workers == 2).await;

        time::sleep(test_pool_config().max_idle_time + Duration::from_secs(1)).await;
        wait_until(|| pool.is_drained()).await;
        assert_eq!(pool.stats().workers, 0);
        assert_eq!(drained.load(Ordering::SeqCst), 1);
        assert_eq!(harness.runtime.removed().len(), 2);
    }

    #[tokio::test]
    async fn test_worker_requeued_after_run() {
        let harness = TestHarness::new();
        let (pool, _) = pool_with_counter(&harness);

        let worker = pool.get_worker().await.unwrap();
        wait_until(|| pool.stats().starting == 0).await;
        let ready_before = pool.stats().ready_workers;

        let (request, _response) = RunRequest::new(Bytes::from_static(b"{}"), None);
        let handle = worker.run(request, "r1".into(), RunType::Async).unwrap();
        handle.finished().await.unwrap();

        assert_eq!(worker.status(), WorkerStatus::Ready);
        assert_eq!(pool.stats().ready_workers, ready_before + 1);
    }

    #[tokio::test]
    async fn test_shutdown_all_stops_idle_workers() {
        let harness = TestHarness::new();
        let (pool, drained) = pool_with_counter(&harness);

        pool.get_worker().await.unwrap();
        wait_until(|| pool.stats().workers == 2).await;

        pool.shutdown_all().await;
        assert!(pool.workers().is_empty());
        assert_eq!(drained.load(Ordering::SeqCst), 1);
    }
}
