// tests/api.rs
use std::{collections::HashMap, path::Path, sync::Arc};

use async_trait::async_trait;
use axum::{
    Router,
    body::{Body, to_bytes},
    http::{Request, StatusCode, header},
};
use comfyforms::{
    api::{AppState, router},
    comfy::{COMFY_HTTP_TIMEOUT, COMFY_SERVER_ADDRESS},
    comfy_plugin::{
        EngineHealth, ExecutionHandle, ExecutionState, ExecutionStatus, HandlerLookup, Plugin,
        PluginConfig, PluginError, PluginKind, PluginMetadata, Workflow, WorkflowExecutorPlugin,
        WorkflowInputs,
    },
    handlers::{ImageInputHandler, SwitchInputHandler, TextInputHandler, image::IMAGE_INPUT_DIR},
    logger::RequestTelemetry,
    plugin::{PluginCatalog, PluginInstance, PluginManager},
    workflow::{WorkflowStore, merge_inputs},
};
use serde_json::{Value, json};
use tempfile::TempDir;
use tokio::sync::Mutex;
use tower::ServiceExt;

const BOUNDARY: &str = "comfyformsboundary";

/// Executor that keeps executions in memory and never finishes them.
struct MemoryExecutor {
    metadata: PluginMetadata,
    executions: Mutex<HashMap<String, (ExecutionStatus, Workflow)>>,
}

impl MemoryExecutor {
    fn new() -> Self {
        Self {
            metadata: PluginMetadata::new(
                "memory",
                "0.1.0",
                "in-memory executor",
                "tests",
                PluginKind::WorkflowExecutor,
            ),
            executions: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl Plugin for MemoryExecutor {
    fn metadata(&self) -> &PluginMetadata {
        &self.metadata
    }
}

#[async_trait]
impl WorkflowExecutorPlugin for MemoryExecutor {
    async fn execute_workflow(
        &self,
        workflow: &Workflow,
        inputs: &WorkflowInputs,
        handlers: &dyn HandlerLookup,
    ) -> Result<ExecutionHandle, PluginError> {
        let merged = merge_inputs(workflow, inputs, handlers).await?;
        let mut executions = self.executions.lock().await;
        let status = ExecutionStatus::running(format!("exec-{}", executions.len() + 1), None);
        let handle = status.handle();
        executions.insert(handle.execution_id.clone(), (status, merged));
        Ok(handle)
    }

    async fn get_execution_status(
        &self,
        execution_id: &str,
    ) -> Result<ExecutionStatus, PluginError> {
        self.executions
            .lock()
            .await
            .get(execution_id)
            .map(|(status, _)| status.clone())
            .ok_or_else(|| PluginError::ExecutionNotFound(execution_id.to_string()))
    }

    async fn cancel_execution(&self, execution_id: &str) -> Result<bool, PluginError> {
        let mut executions = self.executions.lock().await;
        let (status, _) = executions
            .get_mut(execution_id)
            .ok_or_else(|| PluginError::ExecutionNotFound(execution_id.to_string()))?;
        Ok(status.finish(ExecutionState::Cancelled, None))
    }

    async fn health(&self) -> EngineHealth {
        EngineHealth::connected(1.5)
    }
}

struct Fixture {
    dir: TempDir,
    executor: Arc<MemoryExecutor>,
    app: Router,
}

fn write_workflow(dir: &Path, id: &str, graph: Value) {
    std::fs::create_dir_all(dir).unwrap();
    let body = serde_json::to_vec_pretty(&graph).unwrap();
    std::fs::write(dir.join(format!("{id}.json")), body).unwrap();
}

fn portrait() -> Value {
    json!({
        "6": {
            "class_type": "Text",
            "_meta": {"title": "Prompt-Input"},
            "inputs": {"text": "a default prompt"}
        },
        "12": {
            "class_type": "Switch any [Crystools]",
            "_meta": {"title": "Upscale-Input"},
            "inputs": {"boolean": false, "on_true": ["3", 0]}
        },
        "3": {
            "class_type": "KSampler",
            "inputs": {"seed": 7}
        }
    })
}

fn restyle() -> Value {
    json!({
        "10": {
            "class_type": "LoadImage",
            "_meta": {"title": "Photo-Input"},
            "inputs": {"image": "example.png"}
        },
        "3": {
            "class_type": "KSampler",
            "inputs": {"seed": 7}
        }
    })
}

fn uploads(fx: &Fixture) -> Vec<std::path::PathBuf> {
    std::fs::read_dir(fx.dir.path().join("uploads"))
        .map(|entries| entries.map(|e| e.unwrap().path()).collect())
        .unwrap_or_default()
}

async fn fixture(with_executor: bool) -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    write_workflow(&dir.path().join("workflows"), "portrait_photo", portrait());
    write_workflow(&dir.path().join("workflows"), "restyle", restyle());

    let executor = Arc::new(MemoryExecutor::new());
    let mut manager = PluginManager::new(PluginCatalog::new());
    manager
        .register_plugin(PluginInstance::node_handler(TextInputHandler::new()))
        .unwrap();
    manager
        .register_plugin(PluginInstance::node_handler(SwitchInputHandler::new()))
        .unwrap();
    manager
        .register_plugin(PluginInstance::node_handler(ImageInputHandler::new()))
        .unwrap();
    if with_executor {
        manager
            .register_plugin(PluginInstance::WorkflowExecutor(executor.clone()))
            .unwrap();
    }
    // Nothing listens on the discard port, so uploads fall back to local paths.
    let config = PluginConfig::new()
        .with(COMFY_SERVER_ADDRESS, "127.0.0.1:9")
        .with(COMFY_HTTP_TIMEOUT, "1")
        .with(IMAGE_INPUT_DIR, &dir.path().join("uploads").to_string_lossy());
    manager.initialize_plugins(&config).await;

    let state = AppState {
        plugins: Arc::new(manager),
        workflows: Arc::new(WorkflowStore::new(dir.path().join("workflows"))),
        uploads_dir: dir.path().join("uploads"),
        telemetry: RequestTelemetry::new(),
    };
    Fixture {
        dir,
        executor,
        app: router(state),
    }
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, body)
}

fn get(uri: &str) -> Request<Body> {
    Request::get(uri).body(Body::empty()).unwrap()
}

/// `(field, file name, bytes)` files, then text fields, as multipart/form-data.
fn multipart(fields: &[(&str, &str)], files: &[(&str, &str, &[u8])]) -> Request<Body> {
    let mut body = Vec::new();
    for (name, file_name, bytes) in files {
        body.extend_from_slice(
            format!(
                "--{BOUNDARY}\r\n\
                 Content-Disposition: form-data; name=\"{name}\"; filename=\"{file_name}\"\r\n\
                 Content-Type: application/octet-stream\r\n\r\n"
            )
            .as_bytes(),
        );
        body.extend_from_slice(bytes);
        body.extend_from_slice(b"\r\n");
    }
    for (name, value) in fields {
        body.extend_from_slice(
            format!(
                "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{name}\"\r\n\r\n{value}\r\n"
            )
            .as_bytes(),
        );
    }
    body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());

    Request::post("/api/v1/forms/workflows/execute")
        .header(header::CONTENT_TYPE, format!("multipart/form-data; boundary={BOUNDARY}"))
        .body(Body::from(body))
        .unwrap()
}

#[tokio::test]
async fn lists_workflows() {
    let fx = fixture(true).await;
    write_workflow(&fx.dir.path().join("workflows"), "anime", json!({}));

    let (status, body) = send(&fx.app, get("/api/v1/forms/workflows")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["workflows"], json!(["anime", "portrait_photo", "restyle"]));
}

#[tokio::test]
async fn form_schema_describes_input_nodes() {
    let fx = fixture(true).await;

    let uri = "/api/v1/forms/workflows/portrait_photo/form-schema";
    let (status, body) = send(&fx.app, get(uri)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["title"], "portrait photo");

    let fields = body["fields"].as_array().unwrap();
    assert_eq!(fields.len(), 2);
    let upscale = fields.iter().find(|f| f["node_id"] == "12").unwrap();
    assert_eq!(upscale["name"], "Upscale");
    assert_eq!(upscale["type"], "boolean");
    assert_eq!(upscale["handler"], "switch_input");

    let uri = "/api/v1/forms/workflows/missing/form-schema";
    let (status, body) = send(&fx.app, get(uri)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body["error"].as_str().unwrap().contains("missing"));
}

#[tokio::test]
async fn execute_merges_form_values() {
    let fx = fixture(true).await;

    let request = multipart(
        &[("workflow_id", "portrait_photo"), ("Prompt", "a red fox"), ("Upscale", "yes")],
        &[],
    );
    let (status, body) = send(&fx.app, request).await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["status"], "running");
    let execution_id = body["execution_id"].as_str().unwrap().to_string();

    let executions = fx.executor.executions.lock().await;
    let (_, merged) = &executions[&execution_id];
    assert_eq!(merged.node("6").unwrap().inputs["text"], json!("a red fox"));
    assert_eq!(merged.node("12").unwrap().inputs["boolean"], json!(true));
}

#[tokio::test]
async fn execute_accepts_json_inputs_and_node_lists() {
    let fx = fixture(true).await;

    let request = multipart(
        &[
            ("workflow_id", "portrait_photo"),
            ("inputs", r#"{"Prompt": "from inputs"}"#),
            ("nodes", r#"[{"node_id": "12", "value": true}]"#),
        ],
        &[],
    );
    let (status, body) = send(&fx.app, request).await;
    assert_eq!(status, StatusCode::OK, "{body}");

    let executions = fx.executor.executions.lock().await;
    let (_, merged) = executions.values().next().unwrap();
    assert_eq!(merged.node("6").unwrap().inputs["text"], json!("from inputs"));
    assert_eq!(merged.node("12").unwrap().inputs["boolean"], json!(true));
}

#[tokio::test]
async fn uploaded_files_become_paths() {
    let fx = fixture(true).await;

    let request = multipart(
        &[("workflow_id", "portrait_photo"), ("Upscale", "no")],
        &[("Prompt", "prompt.txt", b"x")],
    );
    let (status, _) = send(&fx.app, request).await;
    assert_eq!(status, StatusCode::OK);

    let executions = fx.executor.executions.lock().await;
    let (_, merged) = executions.values().next().unwrap();
    let stored = merged.node("6").unwrap().inputs["text"].as_str().unwrap().to_string();
    assert!(stored.ends_with("-prompt.txt"));
    assert!(Path::new(&stored).starts_with(fx.dir.path().join("uploads")));
    assert!(Path::new(&stored).exists());
}

#[tokio::test]
async fn invalid_values_return_every_error() {
    let fx = fixture(true).await;

    let request = multipart(
        &[("workflow_id", "portrait_photo"), ("Prompt", " "), ("Upscale", "maybe")],
        &[],
    );
    let (status, body) = send(&fx.app, request).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    let errors = body["errors"].as_array().unwrap();
    assert_eq!(errors.len(), 2);
    assert!(fx.executor.executions.lock().await.is_empty());
}

#[tokio::test]
async fn execute_needs_a_known_workflow_id() {
    let fx = fixture(true).await;

    let (status, _) = send(&fx.app, multipart(&[("Prompt", "hi")], &[])).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = send(&fx.app, multipart(&[("workflow_id", "nope")], &[])).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = send(&fx.app, multipart(&[("workflow_id", "../secrets")], &[])).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let request = multipart(&[("workflow_id", "portrait_photo"), ("inputs", "[1]")], &[]);
    let (status, _) = send(&fx.app, request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn execute_without_executor_is_unavailable() {
    let fx = fixture(false).await;

    let request = multipart(
        &[("workflow_id", "portrait_photo"), ("Prompt", "hi"), ("Upscale", "true")],
        &[],
    );
    let (status, body) = send(&fx.app, request).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert!(body["error"].as_str().is_some());

    let (status, body) = send(&fx.app, get("/api/v1/health")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "unhealthy");
    assert_eq!(body["services"]["comfyui_backend"]["status"], "error");
}

#[tokio::test]
async fn status_and_cancel() {
    let fx = fixture(true).await;
    let request = multipart(
        &[("workflow_id", "portrait_photo"), ("Prompt", "hi"), ("Upscale", "on")],
        &[],
    );
    let (_, body) = send(&fx.app, request).await;
    let id = body["execution_id"].as_str().unwrap().to_string();

    let status_uri = format!("/api/v1/forms/executions/{id}/status");
    let (status, body) = send(&fx.app, get(&status_uri)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "running");

    let cancel = || {
        Request::delete(format!("/api/v1/forms/executions/{id}"))
            .body(Body::empty())
            .unwrap()
    };
    let (status, body) = send(&fx.app, cancel()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["execution_id"], id.as_str());

    let (status, _) = send(&fx.app, cancel()).await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (_, body) = send(&fx.app, get(&status_uri)).await;
    assert_eq!(body["status"], "cancelled");

    let (status, _) = send(&fx.app, get("/api/v1/forms/executions/unknown/status")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn health_and_plugins() {
    let fx = fixture(true).await;

    let (status, body) = send(&fx.app, get("/api/v1/health")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
    assert!(body["timestamp"].is_string());

    let (_, body) = send(&fx.app, get("/api/v1/health/comfyui")).await;
    assert_eq!(body["status"], "connected");
    assert_eq!(body["response_time_ms"], json!(1.5));

    let (status, body) = send(&fx.app, get("/api/v1/plugins")).await;
    assert_eq!(status, StatusCode::OK);
    let names: Vec<_> = body["plugins"]
        .as_array()
        .unwrap()
        .iter()
        .map(|p| p["name"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(names, ["text_input", "switch_input", "image_input", "memory"]);
    assert!(body["failures"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn image_fields_only_accept_uploaded_files() {
    let fx = fixture(true).await;

    let attempts = [
        multipart(&[("workflow_id", "restyle"), ("Photo", "/etc/hostname")], &[]),
        multipart(&[("workflow_id", "restyle"), ("Photo", "../workflows/restyle.json")], &[]),
        multipart(
            &[("workflow_id", "restyle"), ("inputs", r#"{"Photo": "/etc/passwd"}"#)],
            &[],
        ),
        multipart(
            &[
                ("workflow_id", "restyle"),
                ("nodes", r#"[{"node_id": "10", "value": "/etc/passwd"}]"#),
            ],
            &[],
        ),
    ];
    for request in attempts {
        let (status, body) = send(&fx.app, request).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY, "{body}");
        assert_eq!(body["errors"][0]["node_id"], "10");
    }
    assert!(fx.executor.executions.lock().await.is_empty());

    let request = multipart(&[("workflow_id", "restyle")], &[("Photo", "cat.png", b"png")]);
    let (status, body) = send(&fx.app, request).await;
    assert_eq!(status, StatusCode::OK, "{body}");
    let executions = fx.executor.executions.lock().await;
    let (_, merged) = executions.values().next().unwrap();
    let image = merged.node("10").unwrap().inputs["image"].as_str().unwrap();
    assert!(image.ends_with("-cat.png"), "{image}");
}

#[tokio::test]
async fn failed_submissions_leave_no_uploads_behind() {
    let fx = fixture(true).await;
    let file: &[(&str, &str, &[u8])] = &[("Photo", "cat.png", b"png")];

    let (status, _) = send(&fx.app, multipart(&[("workflow_id", "nope")], file)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(uploads(&fx).is_empty(), "{:?}", uploads(&fx));

    let (status, _) = send(&fx.app, multipart(&[], file)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(uploads(&fx).is_empty());

    let request = multipart(&[("workflow_id", "restyle"), ("inputs", "[1]")], file);
    let (status, _) = send(&fx.app, request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(uploads(&fx).is_empty());

    let request = multipart(&[("workflow_id", "portrait_photo"), ("Upscale", "maybe")], file);
    let (status, _) = send(&fx.app, request).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert!(uploads(&fx).is_empty());

    let request = multipart(&[("workflow_id", "restyle")], file);
    let (status, _) = send(&fx.app, request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(uploads(&fx).len(), 1);
}
