use std::{
    collections::HashMap,
    sync::{Arc, Weak},
};

use data_model::{ChannelName, FunctionId, FunctionSpec};
use parking_lot::Mutex;
use tracing::info;

use super::{
    pool::{PoolStats, WorkerPool, WorkerPoolError},
    worker::Worker,
    WorkerDeps,
    WorkerPoolConfig,
};

struct PoolEntry {
    instance: u64,
    pool: Arc<WorkerPool>,
}

#[derive(Default)]
struct RegistryState {
    next_instance: u64,
    pools: HashMap<FunctionId, PoolEntry>,
}

/// Maps each function to its live worker pool, creating pools on demand
/// and forgetting them once they drain.
pub struct PoolRegistry {
    config: WorkerPoolConfig,
    deps: WorkerDeps,
    state: Arc<Mutex<RegistryState>>,
}

impl PoolRegistry {
    pub fn new(config: WorkerPoolConfig, deps: WorkerDeps) -> Self {
        Self {
            config,
            deps,
            state: Arc::new(Mutex::new(RegistryState::default())),
        }
    }

    pub async fn get_available_worker(&self, function: &FunctionSpec) -> Result<Arc<Worker>, WorkerPoolError> {
        let request = {
            let mut state = self.state.lock();
            loop {
                let pool = self.pool_for(&mut state, function);
                if let Some(request) = pool.request_worker() {
                    break request;
                }
                // Drained, but its notification has not landed yet.
                state.pools.remove(&function.function_id);
            }
        };
        request.await
    }

    fn pool_for(&self, state: &mut RegistryState, function: &FunctionSpec) -> Arc<WorkerPool> {
        if let Some(entry) = state.pools.get(&function.function_id) {
            return entry.pool.clone();
        }

        let instance = state.next_instance;
        state.next_instance += 1;
        let registry = Arc::downgrade(&self.state);
        let function_id = function.function_id.clone();
        let pool = WorkerPool::new(
            function.clone(),
            self.config.clone(),
            self.deps.clone(),
            move || remove_drained(&registry, &function_id, instance),
        );
        info!(
            function_id = function.function_id.get(),
            image_name = function.image_name,
            instance,
            "created worker pool"
        );
        state.pools.insert(
            function.function_id.clone(),
            PoolEntry {
                instance,
                pool: pool.clone(),
            },
        );
        pool
    }

    pub fn get_pool(&self, function_id: &FunctionId) -> Option<Arc<WorkerPool>> {
        self.state
            .lock()
            .pools
            .get(function_id)
            .map(|entry| entry.pool.clone())
    }

    pub fn list_pools(&self) -> Vec<PoolStats> {
        let pools: Vec<Arc<WorkerPool>> = self
            .state
            .lock()
            .pools
            .values()
            .map(|entry| entry.pool.clone())
            .collect();
        let mut stats: Vec<PoolStats> = pools.iter().map(|pool| pool.stats()).collect();
        stats.sort_by(|a, b| a.function_id.cmp(&b.function_id));
        stats
    }

    /// Resolves a worker by its channel name.
    pub fn find_worker(&self, channel: &ChannelName) -> Option<Arc<Worker>> {
        let (function_id, worker_id) = channel.parse_worker()?;
        self.get_pool(&function_id)?.find_worker(&worker_id)
    }

    /// Shuts down the idle workers of every pool.
    pub async fn shutdown(&self) {
        let pools: Vec<Arc<WorkerPool>> = self
            .state
            .lock()
            .pools
            .values()
            .map(|entry| entry.pool.clone())
            .collect();
        info!(pools = pools.len(), "shutting down worker pools");
        for pool in pools {
            pool.shutdown_all().await;
        }
    }
}

fn remove_drained(registry: &Weak<Mutex<RegistryState>>, function_id: &FunctionId, instance: u64) {
    let Some(state) = registry.upgrade() else {
        return;
    };
    let mut state = state.lock();
    // A newer pool may already serve this function.
    if state
        .pools
        .get(function_id)
        .is_some_and(|entry| entry.instance == instance)
    {
        state.pools.remove(function_id);
        info!(
            function_id = function_id.get(),
            instance, "removed drained worker pool"
        );
    }
}
