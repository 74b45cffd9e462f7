use std::{collections::BTreeMap, sync::Arc};

use axum::{
    body::Body,
    extract::{MatchedPath, Path, Query, Request, State},
    http::{header, HeaderMap, Method, StatusCode},
    response::Response,
    routing::{any, delete, get},
    Json,
    Router,
};
use bytes::Bytes;
use data_model::{FunctionConfig, FunctionStats, InstanceId, RuntimeRequest};
use orchestrator::{ExecutionManager, Overview};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::info;

use crate::http_objects::{
    ApiError,
    FunctionList,
    HealthResponse,
    InstanceList,
    StopInstanceResponse,
};

#[derive(Clone)]
pub struct RouteState {
    pub manager: Arc<ExecutionManager>,
}

pub fn create_routes(route_state: RouteState) -> Router {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE])
        .allow_origin(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health))
        .route(
            "/invoke/{function}",
            any(invoke_function).with_state(route_state.clone()),
        )
        .route(
            "/invoke/{function}/{*path}",
            any(invoke_function_path).with_state(route_state.clone()),
        )
        .route(
            "/functions",
            get(list_functions).with_state(route_state.clone()),
        )
        .route(
            "/functions/{name}",
            get(get_function)
                .put(deploy_function)
                .delete(delete_function)
                .with_state(route_state.clone()),
        )
        .route("/stats", get(overview).with_state(route_state.clone()))
        .route(
            "/stats/functions/{name}",
            get(function_stats).with_state(route_state.clone()),
        )
        .route(
            "/instances",
            get(list_instances).with_state(route_state.clone()),
        )
        .route(
            "/instances/{id}",
            delete(stop_instance).with_state(route_state.clone()),
        )
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

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
    })
}

async fn invoke_function(
    Path(function): Path<String>,
    State(state): State<RouteState>,
    method: Method,
    Query(query): Query<BTreeMap<String, String>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let request = runtime_request(method, "/", query, &headers, body);
    forward(&state, &function, request).await
}

async fn invoke_function_path(
    Path((function, path)): Path<(String, String)>,
    State(state): State<RouteState>,
    method: Method,
    Query(query): Query<BTreeMap<String, String>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let request = runtime_request(method, &format!("/{path}"), query, &headers, body);
    forward(&state, &function, request).await
}

fn runtime_request(
    method: Method,
    path: &str,
    query: BTreeMap<String, String>,
    headers: &HeaderMap,
    body: Bytes,
) -> RuntimeRequest {
    let mut request = RuntimeRequest::new(method.as_str(), path).with_body(body);
    for (name, value) in headers {
        if let Ok(value) = value.to_str() {
            request = request.with_header(name.as_str(), value);
        }
    }
    for (name, value) in query {
        request = request.with_query(name, value);
    }
    request
}

async fn forward(
    state: &RouteState,
    function: &str,
    request: RuntimeRequest,
) -> Result<Response, ApiError> {
    let response = state.manager.invoke(function, request).await?;
    let status = StatusCode::from_u16(response.status)
        .map_err(|e| ApiError::internal_error(e.into()))?;
    let mut builder = Response::builder().status(status);
    if let Some(content_type) = response.content_type {
        builder = builder.header(header::CONTENT_TYPE, content_type);
    }
    builder
        .body(Body::from(response.body))
        .map_err(|e| ApiError::internal_error(e.into()))
}

async fn list_functions(State(state): State<RouteState>) -> Json<FunctionList> {
    Json(FunctionList {
        functions: state.manager.functions(),
    })
}

async fn get_function(
    Path(name): Path<String>,
    State(state): State<RouteState>,
) -> Result<Json<FunctionConfig>, ApiError> {
    state
        .manager
        .function(&name)
        .map(Json)
        .ok_or_else(|| ApiError::not_found(&format!("function {name} not found")))
}

#[tracing::instrument(skip_all, fields(function = %name))]
async fn deploy_function(
    Path(name): Path<String>,
    State(state): State<RouteState>,
    Json(config): Json<FunctionConfig>,
) -> Result<Json<FunctionConfig>, ApiError> {
    if config.name != name {
        return Err(ApiError::bad_request(&format!(
            "function name {} does not match path {}",
            config.name, name
        )));
    }
    state
        .manager
        .deploy(config.clone())
        .map_err(|e| ApiError::bad_request(&format!("{e:#}")))?;
    Ok(Json(config))
}

#[tracing::instrument(skip_all, fields(function = %name))]
async fn delete_function(
    Path(name): Path<String>,
    State(state): State<RouteState>,
) -> Result<Json<FunctionConfig>, ApiError> {
    Ok(Json(state.manager.delete(&name)?))
}

async fn overview(State(state): State<RouteState>) -> Json<Overview> {
    Json(state.manager.overview())
}

async fn function_stats(
    Path(name): Path<String>,
    State(state): State<RouteState>,
) -> Result<Json<FunctionStats>, ApiError> {
    Ok(Json(state.manager.stats(&name)?))
}

async fn list_instances(State(state): State<RouteState>) -> Json<InstanceList> {
    Json(InstanceList {
        instances: state.manager.list_instances(),
    })
}

async fn stop_instance(
    Path(id): Path<String>,
    State(state): State<RouteState>,
) -> Result<Json<StopInstanceResponse>, ApiError> {
    let instance_id = InstanceId::new(id);
    if !state.manager.stop_instance(&instance_id) {
        return Err(ApiError::not_found(&format!(
            "instance {instance_id} not found"
        )));
    }
    info!(instance_id = %instance_id, "instance stopped via api");
    Ok(Json(StopInstanceResponse {
        message: format!("instance {instance_id} is stopping"),
        instance_id,
    }))
}
