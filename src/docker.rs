use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use data_model::ContainerSpec;
use tokio::process::Command;
use tracing::{debug, info};

pub const DEFAULT_DOCKER_BINARY: &str = "/usr/bin/docker";

/// Launches and removes worker containers.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Returns once the container was launched. Readiness is reported
    /// separately on the worker's channel.
    async fn start(&self, spec: &ContainerSpec) -> Result<()>;

    async fn shutdown(&self, spec: &ContainerSpec) -> Result<()>;
}

pub struct DockerRuntime {
    binary: PathBuf,
}

impl DockerRuntime {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    async fn docker(&self, args: Vec<String>) -> Result<String> {
        debug!(binary = %self.binary.display(), ?args, "running docker");
        let output = Command::new(&self.binary)
            .args(&args)
            .output()
            .await
            .with_context(|| format!("failed to execute {}", self.binary.display()))?;
        if !output.status.success() {
            return Err(anyhow!(
                "docker {} exited with {}: {}",
                args.first().map(String::as_str).unwrap_or_default(),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

pub fn run_args(spec: &ContainerSpec) -> Vec<String> {
    let mut args = vec!["run".to_string()];
    if spec.gpu_capable {
        args.extend(["--gpus".to_string(), "all".to_string()]);
    }
    args.extend([
        "-e".to_string(),
        format!("PORT={}", spec.port),
        format!("--name={}", spec.dns_name),
        format!("--network={}", spec.network),
    ]);
    if spec.detach {
        args.push("-d".to_string());
    }
    for env in &spec.env {
        args.extend(["-e".to_string(), env.clone()]);
    }
    args.push(spec.image_name.clone());
    args
}

pub fn remove_args(spec: &ContainerSpec) -> Vec<String> {
    vec!["rm".to_string(), "-f".to_string(), spec.dns_name.clone()]
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn start(&self, spec: &ContainerSpec) -> Result<()> {
        let container_id = self.docker(run_args(spec)).await?;
        info!(
            dns_name = spec.dns_name,
            image_name = spec.image_name,
            container_id,
            "container launched"
        );
        Ok(())
    }

    async fn shutdown(&self, spec: &ContainerSpec) -> Result<()> {
        self.docker(remove_args(spec)).await?;
        info!(dns_name = spec.dns_name, "container removed");
        Ok(())
    }
}
