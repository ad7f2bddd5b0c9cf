// src/api.rs
use std::{fmt, path::PathBuf, sync::Arc};

use axum::{
    Json, Router,
    extract::{DefaultBodyLimit, Multipart, Path, State, multipart::MultipartError},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
};
use chrono::{DateTime, Utc};
use comfy_plugin::{
    EngineHealth, ExecutionHandle, ExecutionState, ExecutionStatus, OutputImage, PluginError,
    ValidationError, WorkflowInputs,
};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tower_http::trace::TraceLayer;
use tracing::{debug, warn};

use crate::{
    logger::RequestTelemetry,
    plugin::{PluginFailure, PluginManager, PluginStatus},
    workflow::{FormSchema, WorkflowError, WorkflowStore, form_schema},
};

const MAX_UPLOAD_BYTES: usize = 64 * 1024 * 1024;

#[derive(Clone)]
pub struct AppState {
    pub plugins: Arc<PluginManager>,
    pub workflows: Arc<WorkflowStore>,
    pub uploads_dir: PathBuf,
    pub telemetry: RequestTelemetry,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/v1/forms/workflows", get(list_workflows))
        .route("/api/v1/forms/workflows/execute", post(execute_workflow))
        .route(
            "/api/v1/forms/workflows/{workflow_id}/form-schema",
            get(get_form_schema),
        )
        .route(
            "/api/v1/forms/executions/{execution_id}/status",
            get(execution_status),
        )
        .route("/api/v1/forms/executions/{execution_id}", delete(cancel_execution))
        .route("/api/v1/health", get(system_health))
        .route("/api/v1/health/comfyui", get(comfyui_health))
        .route("/api/v1/plugins", get(list_plugins))
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct ErrorBody {
    pub error: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<ValidationError>,
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
    errors: Vec<ValidationError>,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            errors: Vec::new(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.status.as_u16(), self.message)
    }
}

impl From<PluginError> for ApiError {
    fn from(err: PluginError) -> Self {
        let status = match &err {
            PluginError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            PluginError::ExecutionNotFound(_) => StatusCode::NOT_FOUND,
            PluginError::NoExecutorAvailable => StatusCode::SERVICE_UNAVAILABLE,
            PluginError::Remote(_) | PluginError::Timeout(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let errors = err.validation_errors().to_vec();
        Self {
            status,
            message: err.to_string(),
            errors,
        }
    }
}

impl From<WorkflowError> for ApiError {
    fn from(err: WorkflowError) -> Self {
        let status = match &err {
            WorkflowError::NotFound(_) => StatusCode::NOT_FOUND,
            WorkflowError::InvalidId(_) => StatusCode::BAD_REQUEST,
            WorkflowError::Parse { .. } | WorkflowError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, err.to_string())
    }
}

impl From<MultipartError> for ApiError {
    fn from(err: MultipartError) -> Self {
        Self::new(err.status(), format!("invalid form data: {}", err.body_text()))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: self.message,
            errors: self.errors,
        };
        (self.status, Json(body)).into_response()
    }
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct WorkflowList {
    pub workflows: Vec<String>,
}

/// What execute and status calls return.
#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct ExecutionResponse {
    pub execution_id: String,
    pub status: ExecutionState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_id: Option<String>,
    #[serde(default)]
    pub images: Vec<OutputImage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl From<ExecutionHandle> for ExecutionResponse {
    fn from(handle: ExecutionHandle) -> Self {
        Self {
            execution_id: handle.execution_id,
            status: handle.status,
            prompt_id: handle.prompt_id,
            images: Vec::new(),
            error: None,
        }
    }
}

impl From<ExecutionStatus> for ExecutionResponse {
    fn from(status: ExecutionStatus) -> Self {
        Self {
            execution_id: status.execution_id,
            status: status.status,
            prompt_id: status.prompt_id,
            images: status.images,
            error: status.error,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct CancelResponse {
    pub execution_id: String,
    pub message: String,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct Services {
    pub comfyui_backend: EngineHealth,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct SystemHealth {
    pub status: String,
    pub timestamp: DateTime<Utc>,
    pub services: Services,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct PluginList {
    pub plugins: Vec<PluginStatus>,
    pub failures: Vec<PluginFailure>,
}

/// `{node_id, value}` pairs as sent in the `nodes` form field.
#[derive(Debug, Deserialize)]
struct NodeValue {
    node_id: String,
    value: Value,
}

/// A parsed execute request.
#[derive(Debug, Default)]
struct Submission {
    workflow_id: Option<String>,
    inputs: WorkflowInputs,
    /// Files written to the uploads directory for this request.
    uploads: Vec<PathBuf>,
}

async fn list_workflows(State(state): State<AppState>) -> Result<Json<WorkflowList>, ApiError> {
    let telemetry = state.telemetry.clone();
    telemetry
        .instrument_request("list_workflows", || async move {
            let workflows = state.workflows.list().await?;
            Ok::<_, ApiError>(Json(WorkflowList { workflows }))
        })
        .await
}

async fn get_form_schema(
    State(state): State<AppState>,
    Path(workflow_id): Path<String>,
) -> Result<Json<FormSchema>, ApiError> {
    let telemetry = state.telemetry.clone();
    telemetry
        .instrument_request("form_schema", || async move {
            let workflow = state.workflows.load(&workflow_id).await?;
            let schema = form_schema(&workflow_id, &workflow, state.plugins.as_ref());
            Ok::<_, ApiError>(Json(schema))
        })
        .await
}

async fn execute_workflow(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<Json<ExecutionResponse>, ApiError> {
    let telemetry = state.telemetry.clone();
    telemetry
        .instrument_request("execute_workflow", || async move {
            let submission = read_submission(&state, multipart).await?;
            let outcome = submit(&state, &submission).await;
            if outcome.is_err() {
                discard_uploads(&submission.uploads).await;
            }
            outcome.map(|handle| Json(ExecutionResponse::from(handle)))
        })
        .await
}

async fn submit(state: &AppState, submission: &Submission) -> Result<ExecutionHandle, ApiError> {
    let workflow_id = submission
        .workflow_id
        .as_deref()
        .ok_or_else(|| ApiError::bad_request("the `workflow_id` field is required"))?;
    let workflow = state.workflows.load(workflow_id).await?;
    debug!("executing {} with {} input(s)", workflow_id, submission.inputs.len());
    Ok(state.plugins.execute_workflow(&workflow, &submission.inputs).await?)
}

async fn read_submission(state: &AppState, multipart: Multipart) -> Result<Submission, ApiError> {
    let mut submission = Submission::default();
    if let Err(err) = read_fields(state, multipart, &mut submission).await {
        discard_uploads(&submission.uploads).await;
        return Err(err);
    }
    Ok(submission)
}

async fn read_fields(
    state: &AppState,
    mut multipart: Multipart,
    submission: &mut Submission,
) -> Result<(), ApiError> {
    while let Some(field) = multipart.next_field().await? {
        let name = field.name().unwrap_or_default().to_string();
        match field.file_name().map(str::to_owned) {
            Some(file_name) if !file_name.is_empty() => {
                let bytes = field.bytes().await?;
                let path = store_upload(&state.uploads_dir, &file_name, &bytes).await?;
                let value = Value::String(path.to_string_lossy().into_owned());
                submission.uploads.push(path);
                submission.inputs.insert(name, value);
            }
            Some(_) => debug!("skipping empty file field `{}`", name),
            None => {
                let text = field.text().await?;
                match name.as_str() {
                    "workflow_id" => submission.workflow_id = Some(text.trim().to_string()),
                    "inputs" => {
                        let inputs: WorkflowInputs = serde_json::from_str(&text).map_err(|e| {
                            ApiError::bad_request(format!("`inputs` must be a JSON object: {e}"))
                        })?;
                        submission.inputs.extend(inputs);
                    }
                    "nodes" => {
                        let nodes: Vec<NodeValue> = serde_json::from_str(&text).map_err(|e| {
                            ApiError::bad_request(format!(
                                "`nodes` must be a list of {{node_id, value}}: {e}"
                            ))
                        })?;
                        for node in nodes {
                            submission.inputs.insert(node.node_id, node.value);
                        }
                    }
                    _ => {
                        submission.inputs.insert(name, Value::String(text));
                    }
                }
            }
        }
    }
    Ok(())
}

async fn discard_uploads(paths: &[PathBuf]) {
    for path in paths {
        if let Err(e) = tokio::fs::remove_file(path).await {
            warn!("could not remove upload {}: {}", path.display(), e);
        }
    }
}

/// Saves an uploaded file under a collision-free name and returns its path.
async fn store_upload(
    dir: &std::path::Path,
    file_name: &str,
    bytes: &[u8],
) -> Result<PathBuf, ApiError> {
    let base = std::path::Path::new(file_name)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "upload".to_string());
    let path = dir.join(format!("{}-{}", uuid::Uuid::new_v4(), base));
    let write = async {
        tokio::fs::create_dir_all(dir).await?;
        tokio::fs::write(&path, bytes).await
    };
    write.await.map_err(|e| {
        warn!("could not store upload {}: {}", path.display(), e);
        ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, "could not store the uploaded file")
    })?;
    Ok(path)
}

async fn execution_status(
    State(state): State<AppState>,
    Path(execution_id): Path<String>,
) -> Result<Json<ExecutionResponse>, ApiError> {
    let telemetry = state.telemetry.clone();
    telemetry
        .instrument_request("execution_status", || async move {
            let executor = state.plugins.get_workflow_executor()?;
            let status = executor.get_execution_status(&execution_id).await?;
            Ok::<_, ApiError>(Json(ExecutionResponse::from(status)))
        })
        .await
}

async fn cancel_execution(
    State(state): State<AppState>,
    Path(execution_id): Path<String>,
) -> Result<Json<CancelResponse>, ApiError> {
    let telemetry = state.telemetry.clone();
    telemetry
        .instrument_request("cancel_execution", || async move {
            let executor = state.plugins.get_workflow_executor()?;
            if !executor.cancel_execution(&execution_id).await? {
                return Err(ApiError::new(
                    StatusCode::CONFLICT,
                    format!("execution `{execution_id}` is not running"),
                ));
            }
            Ok::<_, ApiError>(Json(CancelResponse {
                message: format!("execution `{execution_id}` cancelled"),
                execution_id,
            }))
        })
        .await
}

async fn engine_health(state: &AppState) -> EngineHealth {
    match state.plugins.get_workflow_executor() {
        Ok(executor) => executor.health().await,
        Err(err) => EngineHealth::error(err.to_string()),
    }
}

async fn system_health(State(state): State<AppState>) -> Json<SystemHealth> {
    let comfyui_backend = engine_health(&state).await;
    let status = if comfyui_backend.is_connected() { "healthy" } else { "unhealthy" };
    Json(SystemHealth {
        status: status.to_string(),
        timestamp: Utc::now(),
        services: Services { comfyui_backend },
    })
}

async fn comfyui_health(State(state): State<AppState>) -> Json<EngineHealth> {
    Json(engine_health(&state).await)
}

async fn list_plugins(State(state): State<AppState>) -> Json<PluginList> {
    Json(PluginList {
        plugins: state.plugins.statuses(),
        failures: state.plugins.failures().await,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plugin_errors_map_to_statuses() {
        let cases = [
            (
                PluginError::Validation(vec![ValidationError::new("6", "text", "x")]),
                StatusCode::UNPROCESSABLE_ENTITY,
            ),
            (PluginError::ExecutionNotFound("e".into()), StatusCode::NOT_FOUND),
            (PluginError::NoExecutorAvailable, StatusCode::SERVICE_UNAVAILABLE),
            (PluginError::Remote("down".into()), StatusCode::BAD_GATEWAY),
            (PluginError::Json("bad".into()), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (err, status) in cases {
            assert_eq!(ApiError::from(err).status(), status);
        }
    }

    #[test]
    fn validation_errors_reach_the_body() {
        let rejected = ValidationError::new("6", "text", "is required");
        let api = ApiError::from(PluginError::Validation(vec![rejected]));
        assert_eq!(api.errors.len(), 1);
        let missing = ApiError::from(WorkflowError::NotFound("x".into()));
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn uploads_get_unique_names() {
        let dir = tempfile::tempdir().unwrap();
        let first = store_upload(dir.path(), "../../cat.png", b"a").await.unwrap();
        let second = store_upload(dir.path(), "cat.png", b"b").await.unwrap();
        assert_ne!(first, second);
        assert_eq!(first.parent().unwrap(), dir.path());
        assert!(first.file_name().unwrap().to_string_lossy().ends_with("-cat.png"));

        discard_uploads(&[first.clone(), dir.path().join("never-written.png")]).await;
        assert!(!first.exists());
        assert!(second.exists());
    }
}
