use std::{net::SocketAddr, sync::Arc};

use anyhow::{Context, Result};
use axum_server::Handle;
use event_bus::{EventBus, MemoryTransport, RedisTransport, Transport};
use tokio::{self, signal};
use tracing::info;

use super::routes::RouteState;
use crate::{
    config::{ServerConfig, MEMORY_BROKER_URL},
    docker::DockerRuntime,
    metrics::WorkerPoolMetrics,
    proxy::HttpForwarder,
    routes::create_routes,
    watcher_datasource::HttpWorkerDatasource,
    workers::{PoolRegistry, WorkerDeps},
};

#[derive(Clone)]
pub struct Service {
    pub config: ServerConfig,
    pub registry: Arc<PoolRegistry>,
}

impl Service {
    pub async fn new(config: ServerConfig) -> Result<Self> {
        let transport: Arc<dyn Transport> = if config.event_broker_url == MEMORY_BROKER_URL {
            Arc::new(MemoryTransport::new())
        } else {
            Arc::new(
                RedisTransport::connect(&config.event_broker_url)
                    .await
                    .context("error connecting to the event broker")?,
            )
        };
        let event_bus = Arc::new(EventBus::new(transport)?);

        let deps = WorkerDeps {
            event_bus,
            runtime: Arc::new(DockerRuntime::new(&config.docker_binary_path)),
            forwarder: Arc::new(HttpForwarder::new()?),
            datasource: Arc::new(HttpWorkerDatasource::new()?),
            metrics: Arc::new(WorkerPoolMetrics::new()),
        };
        Ok(Self::with_deps(config, deps))
    }

    pub fn with_deps(config: ServerConfig, deps: WorkerDeps) -> Self {
        let registry = Arc::new(PoolRegistry::new(config.worker_pool_config(), deps));
        Self { config, registry }
    }

    pub async fn start(&self) -> Result<()> {
        let route_state = RouteState {
            registry: self.registry.clone(),
        };

        let handle = Handle::new();
        let handle_sh = handle.clone();
        tokio::spawn(async move {
            shutdown_signal(handle_sh).await;
            info!("graceful shutdown signal received, shutting down server gracefully");
        });

        let addr: SocketAddr = self.config.listen_addr.parse()?;
        info!("server api listening on {}", self.config.listen_addr);
        let routes = create_routes(route_state);
        axum_server::bind(addr)
            .handle(handle)
            .serve(routes.into_make_service())
            .await?;

        self.registry.shutdown().await;
        Ok(())
    }
}

async fn shutdown_signal(handle: Handle) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
        },
        _ = terminate => {
        },
    }
    handle.shutdown();
    info!("signal received, shutting down server gracefully");
}
