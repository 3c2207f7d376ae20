use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use tracing::error;

use crate::workers::{PoolStats, WorkerError, WorkerPoolError};

#[derive(Debug, Serialize)]
pub struct HermesAPIError {
    #[serde(skip)]
    status_code: StatusCode,
    message: String,
}

impl HermesAPIError {
    pub fn new(status_code: StatusCode, message: &str) -> Self {
        Self {
            status_code,
            message: message.to_string(),
        }
    }

    pub fn status_code(&self) -> StatusCode {
        self.status_code
    }

    pub fn internal_error(e: anyhow::Error) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, e.to_string().as_str())
    }

    pub fn not_found(message: &str) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    pub fn bad_request(message: &str) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn bad_gateway(message: &str) -> Self {
        Self::new(StatusCode::BAD_GATEWAY, message)
    }

    pub fn service_unavailable(message: &str) -> Self {
        Self::new(StatusCode::SERVICE_UNAVAILABLE, message)
    }
}

impl IntoResponse for HermesAPIError {
    fn into_response(self) -> Response {
        error!("API Error: {} - {}", self.status_code, self.message);
        (self.status_code, self.message).into_response()
    }
}

impl From<WorkerPoolError> for HermesAPIError {
    fn from(e: WorkerPoolError) -> Self {
        Self::service_unavailable(&e.to_string())
    }
}

impl From<WorkerError> for HermesAPIError {
    fn from(e: WorkerError) -> Self {
        match e {
            WorkerError::NotAcceptingRuns(_) => Self::service_unavailable(&e.to_string()),
            _ => Self::bad_gateway(&e.to_string()),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RunParams {
    pub image_name: String,
    #[serde(default)]
    pub gpu_capable: bool,
}

#[derive(Debug, Serialize)]
pub struct PoolList {
    pub pools: Vec<PoolStats>,
}
