use std::path::PathBuf;

use ::tracing::{error, info_span};
use clap::Parser;
use service::Service;

mod config;
mod docker;
mod http_objects;
mod metrics;
mod proxy;
mod routes;
mod service;
mod tracing;
use tracing::setup_tracing;
mod watcher_datasource;
mod workers;

#[cfg(test)]
mod testing;

#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    #[arg(short, long, value_name = "config file", help = "Path to config file")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let config = match config::ServerConfig::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("Error loading config: {err:?}");
            std::process::exit(1);
        }
    };

    let tracing_provider = match setup_tracing(&config) {
        Ok(provider) => provider,
        Err(err) => {
            eprintln!("Error setting up tracing: {err:?}");
            std::process::exit(1);
        }
    };
    let meter_provider = metrics::init_provider(&config)
        .inspect_err(|e| {
            error!("Error setting up metrics: {:?}", e);
        })
        .ok()
        .flatten();

    let root_span = info_span!(
        "hermes",
        env = config.env,
        "hermes-instance" = config.instance_id()
    );
    let _guard = root_span.enter();

    match Service::new(config).await {
        Ok(service) => {
            if let Err(err) = service.start().await {
                error!("Error starting service: {:?}", err);
            }
        }
        Err(err) => error!("Error creating service: {:?}", err),
    }

    // export telemetry before shutdown
    if let Some(meter_provider) = meter_provider {
        if let Err(err) = meter_provider.shutdown() {
            error!("Error shutting down meter provider: {:?}", err);
        }
    }
    if let Some(tracer_provider) = tracing_provider {
        if let Err(err) = tracer_provider.force_flush() {
            error!("Error flushing traces: {:?}", err);
        }
        if let Err(err) = tracer_provider.shutdown() {
            error!("Error shutting down tracer provider: {:?}", err);
        }
    }
}
