use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use bytes::Bytes;
use data_model::{ChannelName, ContainerSpec, ControlMessage, FunctionSpec, RunId};
use event_bus::{EventBus, MemoryTransport, Transport};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tracing::subscriber;
use tracing_subscriber::{layer::SubscriberExt, Layer};

use crate::{
    docker::ContainerRuntime,
    metrics::WorkerPoolMetrics,
    proxy::{RunForwarder, RunRequest, RunResponse},
    watcher_datasource::{NoSuchRun, RunOutput, WorkerDatasource},
    workers::{WorkerDeps, WorkerPoolConfig},
};

pub fn function_spec(function_id: &str) -> FunctionSpec {
    FunctionSpec {
        function_id: function_id.into(),
        image_name: format!("hermes/{function_id}:latest"),
        gpu_capable: false,
    }
}

pub fn test_pool_config() -> WorkerPoolConfig {
    WorkerPoolConfig::default()
}

/// Yields to the runtime until `condition` holds.
pub async fn wait_until(condition: impl Fn() -> bool) {
    for _ in 0..1000 {
        if condition() {
            return;
        }
        tokio::task::yield_now().await;
    }
    panic!("condition not reached");
}

/// What the fake runtime does when asked to start a container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartupBehavior {
    /// Launches and reports STARTUP-SUCCESS.
    Succeed,
    /// Launches and reports STARTUP-ERROR.
    SignalError,
    /// The launch itself fails.
    LaunchFailure,
    /// Launches and stays silent; the test publishes the report.
    Manual,
}

pub struct FakeRuntime {
    transport: Arc<MemoryTransport>,
    script: Mutex<VecDeque<StartupBehavior>>,
    default_behavior: Mutex<StartupBehavior>,
    started: Mutex<Vec<ContainerSpec>>,
    removed: Mutex<Vec<String>>,
    fail_removals: AtomicBool,
}

impl FakeRuntime {
    fn new(transport: Arc<MemoryTransport>) -> Self {
        Self {
            transport,
            script: Mutex::new(VecDeque::new()),
            default_behavior: Mutex::new(StartupBehavior::Succeed),
            started: Mutex::new(Vec::new()),
            removed: Mutex::new(Vec::new()),
            fail_removals: AtomicBool::new(false),
        }
    }

    /// Behaviors for the next starts, in order. Later starts fall back to
    /// the default behavior.
    pub fn script(&self, behaviors: impl IntoIterator<Item = StartupBehavior>) {
        self.script.lock().extend(behaviors);
    }

    pub fn set_default_behavior(&self, behavior: StartupBehavior) {
        *self.default_behavior.lock() = behavior;
    }

    pub fn fail_removals(&self) {
        self.fail_removals.store(true, Ordering::SeqCst);
    }

    pub fn started(&self) -> Vec<ContainerSpec> {
        self.started.lock().clone()
    }

    pub fn removed(&self) -> Vec<String> {
        self.removed.lock().clone()
    }

    pub async fn wait_for_starts(&self, count: usize) {
        for _ in 0..1000 {
            if self.started.lock().len() >= count {
                return;
            }
            tokio::task::yield_now().await;
        }
        panic!("expected {count} container starts, saw {}", self.started.lock().len());
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn start(&self, spec: &ContainerSpec) -> Result<()> {
        self.started.lock().push(spec.clone());
        let behavior = self
            .script
            .lock()
            .pop_front()
            .unwrap_or(*self.default_behavior.lock());
        let channel = ChannelName::from(spec.dns_name.as_str());
        match behavior {
            StartupBehavior::Succeed => {
                self.transport
                    .publish(&channel, &ControlMessage::StartupSuccess.to_string())
                    .await
            }
            StartupBehavior::SignalError => {
                self.transport
                    .publish(&channel, &ControlMessage::StartupError.to_string())
                    .await
            }
            StartupBehavior::LaunchFailure => Err(anyhow!("docker run exited with status 125")),
            StartupBehavior::Manual => Ok(()),
        }
    }

    async fn shutdown(&self, spec: &ContainerSpec) -> Result<()> {
        self.removed.lock().push(spec.dns_name.clone());
        if self.fail_removals.load(Ordering::SeqCst) {
            return Err(anyhow!("no such container: {}", spec.dns_name));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardBehavior {
    /// Responds, then the worker reports RUN-DONE.
    Complete,
    /// Responds; the test publishes RUN-DONE.
    Respond,
    /// The request never reaches the worker.
    Fail,
}

pub struct FakeForwarder {
    transport: Arc<MemoryTransport>,
    behavior: Mutex<ForwardBehavior>,
    forwarded: Mutex<Vec<(String, RunId)>>,
}

impl FakeForwarder {
    fn new(transport: Arc<MemoryTransport>) -> Self {
        Self {
            transport,
            behavior: Mutex::new(ForwardBehavior::Complete),
            forwarded: Mutex::new(Vec::new()),
        }
    }

    pub fn set_behavior(&self, behavior: ForwardBehavior) {
        *self.behavior.lock() = behavior;
    }

    pub fn forwarded(&self) -> Vec<(String, RunId)> {
        self.forwarded.lock().clone()
    }

    pub async fn wait_for_forwards(&self, count: usize) {
        for _ in 0..1000 {
            if self.forwarded.lock().len() >= count {
                return;
            }
            tokio::task::yield_now().await;
        }
        panic!("expected {count} forwarded runs");
    }
}

// http://watcher-f_abc:3000/run/async -> watcher-f_abc
fn channel_of(target: &str) -> ChannelName {
    let host = target
        .trim_start_matches("http://")
        .split(':')
        .next()
        .unwrap_or_default();
    ChannelName::from(host)
}

#[async_trait]
impl RunForwarder for FakeForwarder {
    async fn forward(&self, mut request: RunRequest, target: &str, run_id: &RunId) -> Result<()> {
        let behavior = *self.behavior.lock();
        if behavior == ForwardBehavior::Fail {
            return Err(anyhow!("connection refused: {target}"));
        }
        self.forwarded.lock().push((target.to_string(), run_id.clone()));
        request.respond(RunResponse {
            status: 200,
            content_type: Some("application/json".to_string()),
            body: Bytes::from(json!({ "runId": run_id.get() }).to_string()),
        });
        if behavior == ForwardBehavior::Complete {
            self.transport
                .publish(
                    &channel_of(target),
                    &ControlMessage::RunDone(run_id.clone()).to_string(),
                )
                .await?;
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeDatasource {
    shutdowns: Mutex<Vec<String>>,
    fail_shutdowns: AtomicBool,
}

impl FakeDatasource {
    pub fn fail_shutdowns(&self) {
        self.fail_shutdowns.store(true, Ordering::SeqCst);
    }

    pub fn shutdowns(&self) -> Vec<String> {
        self.shutdowns.lock().clone()
    }
}

#[async_trait]
impl WorkerDatasource for FakeDatasource {
    async fn shutdown(&self, base_url: &str) -> Result<()> {
        self.shutdowns.lock().push(base_url.to_string());
        if self.fail_shutdowns.load(Ordering::SeqCst) {
            return Err(anyhow!("timeout of 1000ms exceeded"));
        }
        Ok(())
    }

    async fn run_status(&self, _base_url: &str, run_id: &RunId) -> Result<Value> {
        if run_id.get() == "missing" {
            return Err(NoSuchRun(run_id.clone()).into());
        }
        Ok(json!({ "id": run_id.get(), "status": "running" }))
    }

    async fn delete_run(&self, _base_url: &str, run_id: &RunId) -> Result<Value> {
        if run_id.get() == "missing" {
            return Err(NoSuchRun(run_id.clone()).into());
        }
        Ok(json!({ "id": run_id.get(), "status": "deleted" }))
    }

    async fn result_output(&self, _base_url: &str, run_id: &RunId) -> Result<RunOutput> {
        if run_id.get() == "missing" {
            return Err(NoSuchRun(run_id.clone()).into());
        }
        Ok(RunOutput {
            content_type: Some("text/plain".to_string()),
            body: Bytes::from(format!("output of {run_id}")),
        })
    }
}

/// An in-memory event bus with fake collaborators wired to it.
pub struct TestHarness {
    pub transport: Arc<MemoryTransport>,
    pub bus: Arc<EventBus>,
    pub runtime: Arc<FakeRuntime>,
    pub forwarder: Arc<FakeForwarder>,
    pub datasource: Arc<FakeDatasource>,
}

impl TestHarness {
    pub fn new() -> Self {
        let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("debug"));
        let _ = subscriber::set_global_default(
            tracing_subscriber::registry()
                .with(tracing_subscriber::fmt::layer().with_filter(env_filter)),
        );

        let transport = Arc::new(MemoryTransport::new());
        let bus = Arc::new(EventBus::new(transport.clone()).unwrap());
        Self {
            runtime: Arc::new(FakeRuntime::new(transport.clone())),
            forwarder: Arc::new(FakeForwarder::new(transport.clone())),
            datasource: Arc::new(FakeDatasource::default()),
            transport,
            bus,
        }
    }

    pub fn deps(&self) -> WorkerDeps {
        WorkerDeps {
            event_bus: self.bus.clone(),
            runtime: self.runtime.clone(),
            forwarder: self.forwarder.clone(),
            datasource: self.datasource.clone(),
            metrics: Arc::new(WorkerPoolMetrics::new()),
        }
    }

    pub async fn publish(&self, channel: &ChannelName, message: &ControlMessage) {
        self.bus.publish(channel, message).await.unwrap();
    }
}
