use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use data_model::RunId;
use reqwest::header::CONTENT_TYPE;
use tokio::sync::oneshot;
use tracing::{debug, info};

pub const RUN_ID_HEADER: &str = "x-run-id";

/// The caller's run request, handed to a worker with a slot for the reply.
#[derive(Debug)]
pub struct RunRequest {
    pub body: Bytes,
    pub content_type: Option<String>,
    pub respond_to: Option<oneshot::Sender<RunResponse>>,
}

impl RunRequest {
    pub fn new(body: Bytes, content_type: Option<String>) -> (Self, oneshot::Receiver<RunResponse>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                body,
                content_type,
                respond_to: Some(tx),
            },
            rx,
        )
    }

    pub fn respond(&mut self, response: RunResponse) {
        if let Some(tx) = self.respond_to.take() {
            if tx.send(response).is_err() {
                debug!("caller went away before the run response arrived");
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunResponse {
    pub status: u16,
    pub content_type: Option<String>,
    pub body: Bytes,
}

/// Relays a run request to a worker's HTTP endpoint.
#[async_trait]
pub trait RunForwarder: Send + Sync {
    async fn forward(&self, request: RunRequest, target: &str, run_id: &RunId) -> Result<()>;
}

pub struct HttpForwarder {
    client: reqwest::Client,
}

impl HttpForwarder {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .build()
            .context("building run forwarding client")?;
        Ok(Self { client })
    }
}

#[async_trait]
impl RunForwarder for HttpForwarder {
    async fn forward(&self, mut request: RunRequest, target: &str, run_id: &RunId) -> Result<()> {
        info!(target, run_id = run_id.get(), "redirecting run");
        let mut builder = self
            .client
            .post(target)
            .header(RUN_ID_HEADER, run_id.get())
            .body(request.body.clone());
        if let Some(content_type) = &request.content_type {
            builder = builder.header(CONTENT_TYPE, content_type);
        }

        let response = builder
            .send()
            .await
            .with_context(|| format!("forwarding run {run_id} to {target}"))?;
        let status = response.status().as_u16();
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        let body = response
            .bytes()
            .await
            .with_context(|| format!("reading response of run {run_id}"))?;

        request.respond(RunResponse {
            status,
            content_type,
            body,
        });
        Ok(())
    }
}
