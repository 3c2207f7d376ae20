//! The watcher pool orchestrator.
//!
//! A caller asks the [`PoolRegistry`] for a worker of some function. The
//! registry finds or creates that function's [`WorkerPool`], which registers a
//! request on its [`MatchingQueue`] and, if demand outgrows supply, starts
//! more [`Worker`]s. A worker that finishes starting is pushed into the
//! queue, satisfying the oldest parked request.

use std::{sync::Arc, time::Duration};

use event_bus::EventBus;

use crate::{
    docker::ContainerRuntime,
    metrics::WorkerPoolMetrics,
    proxy::RunForwarder,
    watcher_datasource::WorkerDatasource,
};

pub mod matching_queue;
pub mod pool;
pub mod registry;
pub mod scaling;
pub mod worker;

pub use pool::{PoolStats, WorkerPoolError};
pub use registry::PoolRegistry;
pub use scaling::StartupRetryPolicy;
pub use worker::{Worker, WorkerError, WorkerStatus};

pub const DEFAULT_MAX_IDLE_TIME: Duration = Duration::from_secs(10 * 60);
pub const CONSUME_TIMEOUT: Duration = Duration::from_secs(20);
pub const STARTUP_ATTEMPTS: u32 = 2;
pub const WORKER_PORT: u16 = 3000;
pub const DEFAULT_NETWORK: &str = "hermes";

#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    pub max_idle_time: Duration,
    pub consume_timeout: Duration,
    pub startup_retry: StartupRetryPolicy,
    pub worker_port: u16,
    pub network: String,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            max_idle_time: DEFAULT_MAX_IDLE_TIME,
            consume_timeout: CONSUME_TIMEOUT,
            startup_retry: StartupRetryPolicy::default(),
            worker_port: WORKER_PORT,
            network: DEFAULT_NETWORK.to_string(),
        }
    }
}

/// Collaborators shared by every worker of every pool.
#[derive(Clone)]
pub struct WorkerDeps {
    pub event_bus: Arc<EventBus>,
    pub runtime: Arc<dyn ContainerRuntime>,
    pub forwarder: Arc<dyn RunForwarder>,
    pub datasource: Arc<dyn WorkerDatasource>,
    pub metrics: Arc<WorkerPoolMetrics>,
}
