use std::sync::Arc;

use axum::{
    Json, Router,
    body::Body,
    extract::{Path, State},
    http::{Request, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use guvnor_deploy::{Application, DeployError, VcsRef};
use guvnor_process::{ProcessId, ProcessInfo, StatusReport, WorkerInfo};
use guvnor_rpc::bearer_token;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ProxyError, SupervisorError};
use crate::host::{ServerDetails, ServerStatus};
use crate::proxy::ProcessMethod;
use crate::supervisor::Supervisor;

#[derive(Clone)]
pub struct AppState {
    pub supervisor: Arc<Supervisor>,
    token: Option<Arc<str>>,
}

impl AppState {
    pub fn new(supervisor: Arc<Supervisor>, token: Option<String>) -> Self {
        let token = token
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .map(Arc::from);
        Self { supervisor, token }
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    code: &'static str,
    message: String,
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            code: self.code,
            message: self.message,
        };
        (self.status, Json(body)).into_response()
    }
}

impl From<ProxyError> for ApiError {
    fn from(err: ProxyError) -> Self {
        let (status, code) = match &err {
            ProxyError::Connection(_) => (StatusCode::BAD_GATEWAY, "connection_error"),
            ProxyError::Timeout { .. } => (StatusCode::GATEWAY_TIMEOUT, "timeout"),
            ProxyError::Invocation { .. } => (StatusCode::UNPROCESSABLE_ENTITY, "invocation_error"),
            ProxyError::NotCluster => (StatusCode::CONFLICT, "not_cluster"),
        };
        Self::new(status, code, err.to_string())
    }
}

impl From<SupervisorError> for ApiError {
    fn from(err: SupervisorError) -> Self {
        let (status, code) = match &err {
            SupervisorError::Duplicate(_) => (StatusCode::CONFLICT, "duplicate_process"),
            SupervisorError::NotFound(_) => (StatusCode::NOT_FOUND, "process_not_found"),
        };
        Self::new(status, code, err.to_string())
    }
}

impl From<DeployError> for ApiError {
    fn from(err: DeployError) -> Self {
        let (status, code) = match &err {
            DeployError::DuplicateName(_) => (StatusCode::CONFLICT, "duplicate_name"),
            DeployError::InvalidName(_) => (StatusCode::BAD_REQUEST, "invalid_name"),
            DeployError::NotFound(_) => (StatusCode::NOT_FOUND, "app_not_found"),
            DeployError::RefNotFound { .. } => (StatusCode::NOT_FOUND, "ref_not_found"),
            DeployError::Conflict(_) => (StatusCode::CONFLICT, "conflict"),
            DeployError::RestoreFailed { .. } => (StatusCode::INTERNAL_SERVER_ERROR, "restore_failed"),
            DeployError::Vcs(_) => (StatusCode::BAD_GATEWAY, "vcs_error"),
            DeployError::Io(_) | DeployError::Persist(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
        };
        if status.is_server_error() {
            tracing::warn!(error = %err, "deployment operation failed");
        }
        Self::new(status, code, err.to_string())
    }
}

type ApiResult<T> = Result<T, ApiError>;

async fn require_token(State(state): State<AppState>, req: Request<Body>, next: Next) -> Response {
    if let Some(expected) = state.token.as_deref() {
        if bearer_token(req.headers()) != Some(expected) {
            return ApiError::new(StatusCode::UNAUTHORIZED, "unauthorized", "missing or invalid bearer token")
                .into_response();
        }
    }
    next.run(req).await
}

pub fn router(state: AppState) -> Router {
    let api = Router::new()
        .route("/server/status", get(server_status))
        .route("/server/details", get(server_details))
        .route("/processes", get(list_processes).post(register_process))
        .route("/processes/:id", get(get_process).delete(remove_process))
        .route("/processes/:id/:action", get(process_query).post(process_action))
        .route("/apps", get(list_apps).post(deploy_app))
        .route("/apps/:name", get(get_app).delete(remove_app))
        .route("/apps/:name/refs", get(list_refs))
        .route("/apps/:name/refs/update", post(update_refs))
        .route("/apps/:name/ref", post(switch_ref))
        .layer(middleware::from_fn_with_state(state.clone(), require_token));

    Router::new()
        .route("/healthz", get(healthz))
        .merge(api)
        .with_state(state)
}

#[derive(Debug, Serialize)]
struct HealthzResponse {
    status: &'static str,
    version: &'static str,
    processes: usize,
    applications: usize,
}

async fn healthz(State(state): State<AppState>) -> Json<HealthzResponse> {
    Json(HealthzResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        processes: state.supervisor.list_processes().await.len(),
        applications: state.supervisor.engine().list_applications().len(),
    })
}

async fn server_status(State(state): State<AppState>) -> Json<ServerStatus> {
    Json(state.supervisor.server_status())
}

async fn server_details(State(state): State<AppState>) -> Json<ServerDetails> {
    Json(state.supervisor.server_details())
}

#[derive(Debug, Deserialize)]
struct RegisterRequest {
    #[serde(default)]
    id: Option<String>,
    endpoint: String,
    #[serde(default)]
    cluster: bool,
}

async fn list_processes(State(state): State<AppState>) -> Json<Vec<ProcessInfo>> {
    Json(state.supervisor.list_processes().await)
}

async fn register_process(
    State(state): State<AppState>,
    Json(req): Json<RegisterRequest>,
) -> ApiResult<(StatusCode, Json<ProcessInfo>)> {
    let id = match req.id.as_deref().map(str::trim) {
        Some(id) if !id.is_empty() => ProcessId::from(id),
        _ => ProcessId::new(),
    };
    let proxy = state.supervisor.register(id, &req.endpoint, req.cluster).await?;
    Ok((StatusCode::CREATED, Json(proxy.info())))
}

async fn get_process(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<Json<ProcessInfo>> {
    let info = state.supervisor.find_process_info(&ProcessId(id)).await?;
    Ok(Json(info))
}

async fn remove_process(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<StatusCode> {
    state.supervisor.remove(&ProcessId(id)).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn process_query(
    State(state): State<AppState>,
    Path((id, action)): Path<(String, String)>,
) -> ApiResult<Json<Vec<WorkerInfo>>> {
    if action != "workers" {
        return Err(ApiError::new(StatusCode::NOT_FOUND, "not_found", format!("no such resource: {action}")));
    }
    let proxy = state.supervisor.find(&ProcessId(id)).await?;
    let cluster = proxy.as_cluster().ok_or(ProxyError::NotCluster)?;
    Ok(Json(cluster.workers()?))
}

#[derive(Debug, Default, Deserialize)]
struct CallRequest {
    #[serde(default)]
    args: Vec<Value>,
}

/// `status` merges a status report, `workers` adds a worker, anything else is
/// a process method.
async fn process_action(
    State(state): State<AppState>,
    Path((id, action)): Path<(String, String)>,
    body: Option<Json<Value>>,
) -> ApiResult<Json<Value>> {
    let proxy = state.supervisor.find(&ProcessId(id)).await?;
    let body = body.map(|Json(v)| v).unwrap_or(Value::Null);
    let bad_body = |e: serde_json::Error| ApiError::new(StatusCode::BAD_REQUEST, "bad_request", e.to_string());

    match action.as_str() {
        "status" => {
            let report: StatusReport = serde_json::from_value(body).map_err(bad_body)?;
            proxy.update(report);
            Ok(Json(serde_json::to_value(proxy.info()).map_err(bad_body)?))
        }
        "workers" => {
            let worker: WorkerInfo = serde_json::from_value(body).map_err(bad_body)?;
            let cluster = proxy.as_cluster().ok_or(ProxyError::NotCluster)?;
            let added = cluster.add_worker(worker)?;
            Ok(Json(serde_json::json!({ "added": added })))
        }
        method => {
            let method: ProcessMethod = method.parse()?;
            let req: CallRequest = if body.is_null() {
                CallRequest::default()
            } else {
                serde_json::from_value(body).map_err(bad_body)?
            };
            let result = proxy.call(method, req.args).await?;
            Ok(Json(serde_json::json!({ "result": result })))
        }
    }
}

#[derive(Debug, Deserialize)]
struct DeployRequest {
    name: String,
    url: String,
    #[serde(default)]
    user: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SwitchRequest {
    #[serde(rename = "ref")]
    reference: String,
}

async fn list_apps(State(state): State<AppState>) -> Json<Vec<Application>> {
    Json(state.supervisor.engine().list_applications())
}

async fn deploy_app(
    State(state): State<AppState>,
    Json(req): Json<DeployRequest>,
) -> ApiResult<(StatusCode, Json<Application>)> {
    let app = state
        .supervisor
        .engine()
        .deploy(&req.name, &req.url, req.user.as_deref())
        .await?;
    Ok((StatusCode::CREATED, Json(app)))
}

async fn get_app(State(state): State<AppState>, Path(name): Path<String>) -> ApiResult<Json<Application>> {
    Ok(Json(state.supervisor.engine().find_application(&name)?))
}

async fn remove_app(State(state): State<AppState>, Path(name): Path<String>) -> ApiResult<StatusCode> {
    state.supervisor.engine().remove(&name).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn list_refs(State(state): State<AppState>, Path(name): Path<String>) -> ApiResult<Json<Vec<VcsRef>>> {
    Ok(Json(state.supervisor.engine().list_refs(&name)?))
}

async fn update_refs(State(state): State<AppState>, Path(name): Path<String>) -> ApiResult<Json<Application>> {
    Ok(Json(state.supervisor.engine().update_refs(&name).await?))
}

async fn switch_ref(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(req): Json<SwitchRequest>,
) -> ApiResult<Json<Application>> {
    Ok(Json(state.supervisor.engine().switch_ref(&name, &req.reference).await?))
}
