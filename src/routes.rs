use std::{str::FromStr, sync::Arc};

use axum::{
    body::{Body, Bytes},
    extract::{MatchedPath, Path, Query, Request, State},
    http::{header::CONTENT_TYPE, HeaderMap, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json,
    Router,
};
use data_model::{ChannelName, FunctionId, FunctionSpec, RunId, RunType};
use nanoid::nanoid;
use serde_json::Value;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::info;

use crate::{
    http_objects::{HermesAPIError, PoolList, RunParams},
    proxy::{RunRequest, RUN_ID_HEADER},
    watcher_datasource::NoSuchRun,
    workers::{PoolRegistry, Worker},
};

#[derive(Clone)]
pub struct RouteState {
    pub registry: Arc<PoolRegistry>,
}

pub fn create_routes(route_state: RouteState) -> Router {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::DELETE])
        .allow_origin(Any)
        .allow_headers(Any);

    Router::new()
        .route("/", get(index))
        .route("/internal/pools", get(list_pools))
        .route(
            "/internal/functions/{function_id}/runs/{run_type}",
            post(dispatch_run),
        )
        .route(
            "/internal/workers/{channel}/runs/{run_id}",
            get(run_status).delete(delete_run),
        )
        .route(
            "/internal/workers/{channel}/runs/{run_id}/result",
            get(run_result),
        )
        .with_state(route_state)
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|req: &Request| {
                    let method = req.method();
                    let uri = req.uri();

                    let matched_path = req
                        .extensions()
                        .get::<MatchedPath>()
                        .map(|matched_path| matched_path.as_str());

                    tracing::debug_span!("request", %method, %uri, matched_path)
                })
                .on_failure(()),
        )
        .layer(cors)
}

async fn index() -> &'static str {
    "Hermes Server"
}

async fn list_pools(State(state): State<RouteState>) -> Json<PoolList> {
    Json(PoolList {
        pools: state.registry.list_pools(),
    })
}

/// Acquires a worker of the function, forwards the body to it and relays
/// the worker's response.
#[tracing::instrument(skip(state, headers, body))]
async fn dispatch_run(
    State(state): State<RouteState>,
    Path((function_id, run_type)): Path<(String, String)>,
    Query(params): Query<RunParams>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, HermesAPIError> {
    let run_type = RunType::from_str(&run_type)
        .map_err(|_| HermesAPIError::bad_request(&format!("invalid run type: {run_type}")))?;
    let function = FunctionSpec {
        function_id: FunctionId::new(function_id),
        image_name: params.image_name,
        gpu_capable: params.gpu_capable,
    };

    let worker = state.registry.get_available_worker(&function).await?;
    let run_id = RunId::new(nanoid!());
    let content_type = headers
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);
    let (request, response) = RunRequest::new(body, content_type);
    let handle = worker.run(request, run_id.clone(), run_type)?;
    info!(
        function_id = function.function_id.get(),
        worker_id = worker.id().get(),
        run_id = run_id.get(),
        "run dispatched"
    );

    let response = match response.await {
        Ok(response) => response,
        // Forwarding failed before the worker answered.
        Err(_) => {
            return Err(match handle.finished().await {
                Err(err) => err.into(),
                Ok(()) => HermesAPIError::bad_gateway("worker closed without responding"),
            });
        }
    };

    let mut builder = Response::builder()
        .status(StatusCode::from_u16(response.status).unwrap_or(StatusCode::BAD_GATEWAY))
        .header(RUN_ID_HEADER, run_id.get());
    if let Some(content_type) = response.content_type {
        builder = builder.header(CONTENT_TYPE, content_type);
    }
    builder
        .body(Body::from(response.body))
        .map_err(|e| HermesAPIError::internal_error(e.into()))
}

fn lookup_worker(state: &RouteState, channel: &str) -> Result<Arc<Worker>, HermesAPIError> {
    state
        .registry
        .find_worker(&ChannelName::from(channel))
        .ok_or_else(|| HermesAPIError::not_found(&format!("worker {channel} not found")))
}

fn run_data_error(err: anyhow::Error) -> HermesAPIError {
    if err.downcast_ref::<NoSuchRun>().is_some() {
        return HermesAPIError::not_found(&err.to_string());
    }
    HermesAPIError::bad_gateway(&format!("{err:#}"))
}

async fn run_status(
    State(state): State<RouteState>,
    Path((channel, run_id)): Path<(String, String)>,
) -> Result<Json<Value>, HermesAPIError> {
    let worker = lookup_worker(&state, &channel)?;
    let status = worker
        .run_status(&RunId::new(run_id))
        .await
        .map_err(run_data_error)?;
    Ok(Json(status))
}

async fn delete_run(
    State(state): State<RouteState>,
    Path((channel, run_id)): Path<(String, String)>,
) -> Result<impl IntoResponse, HermesAPIError> {
    let worker = lookup_worker(&state, &channel)?;
    let deleted = worker
        .delete_run(&RunId::new(run_id))
        .await
        .map_err(run_data_error)?;
    Ok(Json(deleted))
}

async fn run_result(
    State(state): State<RouteState>,
    Path((channel, run_id)): Path<(String, String)>,
) -> Result<Response, HermesAPIError> {
    let worker = lookup_worker(&state, &channel)?;
    let output = worker
        .result_output(&RunId::new(run_id))
        .await
        .map_err(run_data_error)?;
    let mut builder = Response::builder().status(StatusCode::OK);
    if let Some(content_type) = output.content_type {
        builder = builder.header(CONTENT_TYPE, content_type);
    }
    builder
        .body(Body::from(output.body))
        .map_err(|e| HermesAPIError::internal_error(e.into()))
}
