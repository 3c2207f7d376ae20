use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use data_model::RunId;
use reqwest::{header::CONTENT_TYPE, StatusCode};
use serde_json::Value;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("No such run {0}")]
pub struct NoSuchRun(pub RunId);

/// Raw output a finished run left on its worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOutput {
    pub content_type: Option<String>,
    pub body: Bytes,
}

/// Control endpoints exposed by a worker container, addressed by its base URL.
#[async_trait]
pub trait WorkerDatasource: Send + Sync {
    async fn shutdown(&self, base_url: &str) -> Result<()>;

    async fn run_status(&self, base_url: &str, run_id: &RunId) -> Result<Value>;

    async fn delete_run(&self, base_url: &str, run_id: &RunId) -> Result<Value>;

    async fn result_output(&self, base_url: &str, run_id: &RunId) -> Result<RunOutput>;
}

pub struct HttpWorkerDatasource {
    client: reqwest::Client,
}

impl HttpWorkerDatasource {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("building worker datasource client")?;
        Ok(Self { client })
    }

    async fn send_for_run(
        &self,
        request: reqwest::RequestBuilder,
        run_id: &RunId,
    ) -> Result<reqwest::Response> {
        let response = request
            .send()
            .await
            .with_context(|| format!("requesting run {run_id}"))?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(NoSuchRun(run_id.clone()).into());
        }
        Ok(response.error_for_status()?)
    }

    async fn run_json(&self, request: reqwest::RequestBuilder, run_id: &RunId) -> Result<Value> {
        let response = self.send_for_run(request, run_id).await?;
        Ok(response.json::<Value>().await?)
    }
}

#[async_trait]
impl WorkerDatasource for HttpWorkerDatasource {
    async fn shutdown(&self, base_url: &str) -> Result<()> {
        self.client
            .get(format!("{base_url}shutdown"))
            .send()
            .await
            .with_context(|| format!("requesting shutdown of {base_url}"))?
            .error_for_status()?;
        Ok(())
    }

    async fn run_status(&self, base_url: &str, run_id: &RunId) -> Result<Value> {
        self.run_json(self.client.get(format!("{base_url}run/{run_id}")), run_id)
            .await
    }

    async fn delete_run(&self, base_url: &str, run_id: &RunId) -> Result<Value> {
        self.run_json(self.client.delete(format!("{base_url}run/{run_id}")), run_id)
            .await
    }

    async fn result_output(&self, base_url: &str, run_id: &RunId) -> Result<RunOutput> {
        let response = self
            .send_for_run(
                self.client.get(format!("{base_url}run/{run_id}/result")),
                run_id,
            )
            .await?;
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        let body = response
            .bytes()
            .await
            .with_context(|| format!("reading result of run {run_id}"))?;
        Ok(RunOutput { content_type, body })
    }
}
