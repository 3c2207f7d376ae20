use std::{
    fmt,
    sync::{Arc, Weak},
};

use data_model::{ChannelName, ContainerSpec, ControlMessage, FunctionId, FunctionSpec, ListenerId, RunId, RunType, WorkerId};
use hermes_utils::ResettableTimer;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

use super::{matching_queue::Matchable, WorkerDeps, WorkerPoolConfig};
use crate::{
    metrics::function_attributes,
    proxy::RunRequest,
    watcher_datasource::RunOutput,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum::Display)]
pub enum WorkerStatus {
    Starting,
    Ready,
    Busy,
    ShuttingDown,
    Terminated,
    Failed,
}

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("Startup error: {0}")]
    Startup(String),

    #[error("worker {0} is not accepting runs")]
    NotAcceptingRuns(WorkerId),

    #[error("error forwarding run {run_id}: {source:#}")]
    Forward {
        run_id: RunId,
        #[source]
        source: anyhow::Error,
    },

    #[error("run {0} was abandoned before completion")]
    RunAbandoned(RunId),
}

pub type WorkerCallback = Box<dyn Fn(&WorkerId) + Send + Sync>;

/// Owner notifications. Both are invoked without any worker lock held.
pub struct WorkerHooks {
    /// The worker committed to shutting down.
    pub on_shutdown: WorkerCallback,
    /// The worker finished its last run and can take another one.
    pub on_ready: WorkerCallback,
}

impl Default for WorkerHooks {
    fn default() -> Self {
        Self {
            on_shutdown: Box::new(|_| {}),
            on_ready: Box::new(|_| {}),
        }
    }
}

struct WorkerState {
    status: WorkerStatus,
    runs: u32,
}

/// Resolves once a run is over: either its RUN-DONE arrived or forwarding
/// failed.
pub struct RunHandle {
    run_id: RunId,
    rx: oneshot::Receiver<Result<(), WorkerError>>,
}

impl RunHandle {
    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    pub async fn finished(self) -> Result<(), WorkerError> {
        let RunHandle { run_id, rx } = self;
        rx.await
            .unwrap_or_else(|_| Err(WorkerError::RunAbandoned(run_id)))
    }
}

/// One function container and its lifecycle.
pub struct Worker {
    id: WorkerId,
    function: FunctionSpec,
    channel: ChannelName,
    base_url: String,
    container: ContainerSpec,
    state: Mutex<WorkerState>,
    idle_timer: ResettableTimer,
    hooks: WorkerHooks,
    deps: WorkerDeps,
    this: Weak<Worker>,
}

impl fmt::Debug for Worker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Worker")
            .field("id", &self.id)
            .field("channel", &self.channel)
            .field("status", &state.status)
            .field("runs", &state.runs)
            .finish()
    }
}

impl Worker {
    pub fn new(
        function: FunctionSpec,
        config: &WorkerPoolConfig,
        deps: WorkerDeps,
        hooks: WorkerHooks,
    ) -> Arc<Self> {
        let id = WorkerId::random();
        let channel = ChannelName::for_worker(&function.function_id, &id);
        let base_url = format!("http://{}:{}/", channel, config.worker_port);
        let container = ContainerSpec {
            image_name: function.image_name.clone(),
            gpu_capable: function.gpu_capable,
            port: config.worker_port,
            dns_name: channel.get().to_string(),
            detach: true,
            network: config.network.clone(),
            env: vec![format!("REDIS_CHANNEL={channel}")],
        };
        Arc::new_cyclic(|this| Worker {
            id,
            function,
            channel,
            base_url,
            container,
            state: Mutex::new(WorkerState {
                status: WorkerStatus::Starting,
                runs: 0,
            }),
            idle_timer: ResettableTimer::new(config.max_idle_time),
            hooks,
            deps,
            this: this.clone(),
        })
    }

    pub fn id(&self) -> &WorkerId {
        &self.id
    }

    pub fn function_id(&self) -> &FunctionId {
        &self.function.function_id
    }

    pub fn channel(&self) -> &ChannelName {
        &self.channel
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn container(&self) -> &ContainerSpec {
        &self.container
    }

    pub fn status(&self) -> WorkerStatus {
        self.state.lock().status
    }

    pub fn runs_in_flight(&self) -> u32 {
        self.state.lock().runs
    }

    pub fn accepts_runs(&self) -> bool {
        let state = self.state.lock();
        state.status == WorkerStatus::Ready && state.runs == 0
    }

    pub fn is_idle_timer_armed(&self) -> bool {
        self.idle_timer.is_armed()
    }

    pub fn run_endpoint(&self, run_type: RunType) -> String {
        format!("{}run/{}", self.base_url, run_type)
    }

    /// Launches the container and waits for it to report on the worker's
    /// channel. The listener is registered before the launch so the report
    /// cannot be missed.
    pub async fn start(&self) -> Result<(), WorkerError> {
        let listener_id = ListenerId::random();
        let (tx, rx) = oneshot::channel::<bool>();
        let signal = Mutex::new(Some(tx));
        self.deps.event_bus.add_subscription(
            &self.channel,
            listener_id.clone(),
            Arc::new(move |_channel, message| {
                let succeeded = match message {
                    ControlMessage::StartupSuccess => true,
                    ControlMessage::StartupError => false,
                    _ => return,
                };
                if let Some(tx) = signal.lock().take() {
                    let _ = tx.send(succeeded);
                }
            }),
        );

        info!(
            function_id = self.function_id().get(),
            worker_id = self.id.get(),
            image_name = self.container.image_name,
            "starting worker container"
        );
        if let Err(err) = self.deps.runtime.start(&self.container).await {
            error!(
                channel = self.channel.get(),
                "container runtime error: {:?}", err
            );
            self.remove_listener(&listener_id);
            self.state.lock().status = WorkerStatus::Failed;
            return Err(WorkerError::Startup(format!("container launch failed: {err:#}")));
        }

        let outcome = rx.await;
        self.remove_listener(&listener_id);
        match outcome {
            Ok(true) => {
                info!(
                    function_id = self.function_id().get(),
                    worker_id = self.id.get(),
                    "worker container deployed"
                );
                self.state.lock().status = WorkerStatus::Ready;
                self.arm_idle_timer();
                Ok(())
            }
            Ok(false) => {
                error!(
                    function_id = self.function_id().get(),
                    worker_id = self.id.get(),
                    "container reported a startup error"
                );
                self.state.lock().status = WorkerStatus::Failed;
                Err(WorkerError::Startup(format!(
                    "container {} reported STARTUP-ERROR",
                    self.channel
                )))
            }
            Err(_) => {
                self.state.lock().status = WorkerStatus::Failed;
                Err(WorkerError::Startup("startup listener dropped".to_string()))
            }
        }
    }

    /// Hands a run to this worker. Returns as soon as the worker is marked
    /// busy; forwarding and completion tracking continue in the background.
    pub fn run(
        self: &Arc<Self>,
        request: RunRequest,
        run_id: RunId,
        run_type: RunType,
    ) -> Result<RunHandle, WorkerError> {
        {
            let mut state = self.state.lock();
            if state.status != WorkerStatus::Ready || state.runs > 0 {
                return Err(WorkerError::NotAcceptingRuns(self.id.clone()));
            }
            state.status = WorkerStatus::Busy;
            state.runs += 1;
        }
        self.idle_timer.stop();
        self.deps
            .metrics
            .runs_in_flight
            .add(1, &function_attributes(self.function_id().get()));

        let endpoint = self.run_endpoint(run_type);
        info!(
            function_id = self.function_id().get(),
            worker_id = self.id.get(),
            run_id = run_id.get(),
            %run_type,
            endpoint,
            "run"
        );

        let listener_id = ListenerId::random();
        let (done_tx, done_rx) = oneshot::channel::<()>();
        let done_tx = Mutex::new(Some(done_tx));
        let expected = run_id.clone();
        self.deps.event_bus.add_subscription(
            &self.channel,
            listener_id.clone(),
            Arc::new(move |_channel, message| {
                if matches!(message, ControlMessage::RunDone(id) if *id == expected) {
                    if let Some(tx) = done_tx.lock().take() {
                        let _ = tx.send(());
                    }
                }
            }),
        );

        let (failed_tx, failed_rx) = oneshot::channel::<anyhow::Error>();
        let forwarder = self.deps.forwarder.clone();
        let forward_run_id = run_id.clone();
        tokio::spawn(async move {
            if let Err(err) = forwarder.forward(request, &endpoint, &forward_run_id).await {
                let _ = failed_tx.send(err);
            }
        });

        let (result_tx, result_rx) = oneshot::channel();
        let worker = self.clone();
        let tracked_run_id = run_id.clone();
        tokio::spawn(async move {
            let run_id = tracked_run_id;
            let result = tokio::select! {
                done = done_rx => done.map_err(|_| WorkerError::RunAbandoned(run_id.clone())),
                Ok(source) = failed_rx => Err(WorkerError::Forward { run_id: run_id.clone(), source }),
            };
            worker.finish_run(&listener_id, &run_id, &result);
            let _ = result_tx.send(result);
        });

        Ok(RunHandle {
            run_id,
            rx: result_rx,
        })
    }

    fn finish_run(&self, listener_id: &ListenerId, run_id: &RunId, result: &Result<(), WorkerError>) {
        self.remove_listener(listener_id);
        self.deps
            .metrics
            .runs_in_flight
            .add(-1, &function_attributes(self.function_id().get()));

        let back_to_ready = {
            let mut state = self.state.lock();
            state.runs = state.runs.saturating_sub(1);
            if state.runs == 0 && state.status == WorkerStatus::Busy {
                state.status = WorkerStatus::Ready;
                true
            } else {
                false
            }
        };

        match result {
            Ok(()) => info!(
                worker_id = self.id.get(),
                run_id = run_id.get(),
                "run done"
            ),
            Err(err) => warn!(
                worker_id = self.id.get(),
                run_id = run_id.get(),
                "run failed: {}", err
            ),
        }

        if back_to_ready {
            self.arm_idle_timer();
            (self.hooks.on_ready)(&self.id);
        }
    }

    /// Tears the worker down if it is ready and idle, otherwise does
    /// nothing. Failures past the point of no return are logged and
    /// swallowed.
    pub async fn shutdown(&self) {
        {
            let mut state = self.state.lock();
            if state.status != WorkerStatus::Ready || state.runs > 0 {
                debug!(
                    worker_id = self.id.get(),
                    status = %state.status,
                    runs = state.runs,
                    "worker cannot shut down now"
                );
                return;
            }
            state.status = WorkerStatus::ShuttingDown;
        }
        self.idle_timer.stop();

        info!(
            function_id = self.function_id().get(),
            worker_id = self.id.get(),
            "shutting down worker"
        );
        (self.hooks.on_shutdown)(&self.id);

        if let Err(err) = self.deps.datasource.shutdown(&self.base_url).await {
            warn!(
                worker_id = self.id.get(),
                "error requesting container shutdown: {:#}", err
            );
        }
        if let Err(err) = self.deps.runtime.shutdown(&self.container).await {
            warn!(
                worker_id = self.id.get(),
                "error removing container: {:#}", err
            );
        }
        self.deps
            .metrics
            .workers_stopped
            .add(1, &function_attributes(self.function_id().get()));
        self.state.lock().status = WorkerStatus::Terminated;
    }

    pub async fn run_status(&self, run_id: &RunId) -> anyhow::Result<Value> {
        self.deps.datasource.run_status(&self.base_url, run_id).await
    }

    pub async fn delete_run(&self, run_id: &RunId) -> anyhow::Result<Value> {
        self.deps.datasource.delete_run(&self.base_url, run_id).await
    }

    pub async fn result_output(&self, run_id: &RunId) -> anyhow::Result<RunOutput> {
        self.deps.datasource.result_output(&self.base_url, run_id).await
    }

    fn arm_idle_timer(&self) {
        let worker = self.this.clone();
        self.idle_timer.start(async move {
            if let Some(worker) = worker.upgrade() {
                info!(worker_id = worker.id.get(), "worker idle for too long");
                worker.shutdown().await;
            }
        });
    }

    fn remove_listener(&self, listener_id: &ListenerId) {
        if let Err(err) = self
            .deps
            .event_bus
            .remove_subscription(&self.channel, listener_id)
        {
            warn!(channel = self.channel.get(), "error removing listener: {}", err);
        }
    }
}

impl Matchable for Worker {
    fn accepts_work(&self) -> bool {
        self.accepts_runs()
    }
}
