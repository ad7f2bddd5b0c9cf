// src/comfy/executor.rs
use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use comfy_plugin::{
    ConfigKeys, EngineHealth, ExecutionHandle, ExecutionState, ExecutionStatus, HandlerLookup,
    OutputImage, Plugin, PluginConfig, PluginError, PluginKind, PluginMetadata, Workflow,
    WorkflowExecutorPlugin, WorkflowInputs,
};
use dashmap::DashMap;
use tokio::{sync::RwLock, task::AbortHandle};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::{
    COMFY_HTTP_TIMEOUT, COMFY_OUTPUT_DIR, COMFY_SERVER_ADDRESS, COMFY_WS_TIMEOUT,
    DEFAULT_HTTP_TIMEOUT, DEFAULT_WS_TIMEOUT,
    client::{ComfyClient, EventStream, history_images, parse_server_address, wait_for_prompt},
};
use crate::workflow::merge_inputs;

/// Finished executions kept for status queries. Older ones are dropped first.
const FINISHED_RETENTION: usize = 200;

#[derive(Clone)]
struct ExecutorSettings {
    client: ComfyClient,
    output_dir: PathBuf,
    ws_timeout: Option<Duration>,
}

struct ExecutionRecord {
    status: ExecutionStatus,
    task: Option<AbortHandle>,
}

/// Runs graphs on a ComfyUI server.
///
/// `execute_workflow` returns once the prompt is queued. A background task
/// follows the server's event stream and records the outcome, which
/// `get_execution_status` reports.
pub struct ComfyUiWorkflowExecutor {
    metadata: PluginMetadata,
    client_id: String,
    settings: RwLock<Option<ExecutorSettings>>,
    executions: Arc<DashMap<String, ExecutionRecord>>,
}

impl ComfyUiWorkflowExecutor {
    pub const NAME: &'static str = "comfyui";

    pub fn new() -> Self {
        Self {
            metadata: PluginMetadata::new(
                Self::NAME,
                env!("CARGO_PKG_VERSION"),
                "Executes workflows on a ComfyUI server",
                "comfyforms",
                PluginKind::WorkflowExecutor,
            ),
            client_id: Uuid::new_v4().to_string(),
            settings: RwLock::new(None),
            executions: Arc::new(DashMap::new()),
        }
    }

    async fn settings(&self) -> Result<ExecutorSettings, PluginError> {
        self.settings
            .read()
            .await
            .clone()
            .ok_or_else(|| {
                PluginError::initialization(Self::NAME, "executor used before initialization")
            })
    }

    fn invalid(key: &str, message: impl ToString) -> PluginError {
        PluginError::InvalidConfig {
            plugin: Self::NAME.to_string(),
            key: key.to_string(),
            message: message.to_string(),
        }
    }
}

impl Default for ComfyUiWorkflowExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Plugin for ComfyUiWorkflowExecutor {
    fn metadata(&self) -> &PluginMetadata {
        &self.metadata
    }

    fn config_keys(&self) -> ConfigKeys {
        ConfigKeys::default()
            .required(COMFY_SERVER_ADDRESS, "ComfyUI host:port or URL")
            .required(COMFY_OUTPUT_DIR, "where generated images are saved")
            .optional(COMFY_HTTP_TIMEOUT, "HTTP timeout in seconds (30), 0 for none")
            .optional(
                COMFY_WS_TIMEOUT,
                "seconds to wait for the next server event (30), 0 for none",
            )
    }

    async fn initialize(&self, config: &PluginConfig) -> Result<(), PluginError> {
        let address = config.require(Self::NAME, COMFY_SERVER_ADDRESS)?;
        let base_url =
            parse_server_address(address).map_err(|e| Self::invalid(COMFY_SERVER_ADDRESS, e))?;
        let output_dir = PathBuf::from(config.require(Self::NAME, COMFY_OUTPUT_DIR)?);
        tokio::fs::create_dir_all(&output_dir).await.map_err(|e| {
            Self::invalid(COMFY_OUTPUT_DIR, format!("cannot create {}: {e}", output_dir.display()))
        })?;

        let http_timeout = config.timeout(COMFY_HTTP_TIMEOUT, Some(DEFAULT_HTTP_TIMEOUT));
        let ws_timeout = config.timeout(COMFY_WS_TIMEOUT, Some(DEFAULT_WS_TIMEOUT));
        let client = ComfyClient::new(base_url, self.client_id.clone(), http_timeout)?;

        info!(
            "ComfyUI executor targets {} (client {}), outputs in {}",
            client.base_url(),
            self.client_id,
            output_dir.display()
        );
        *self.settings.write().await = Some(ExecutorSettings {
            client,
            output_dir,
            ws_timeout,
        });
        Ok(())
    }

    async fn cleanup(&self) -> Result<(), PluginError> {
        for mut record in self.executions.iter_mut() {
            if let Some(task) = record.task.take() {
                task.abort();
            }
            record.status.finish(ExecutionState::Cancelled, Some("executor shut down".into()));
        }
        self.executions.clear();
        self.settings.write().await.take();
        Ok(())
    }
}

#[async_trait]
impl WorkflowExecutorPlugin for ComfyUiWorkflowExecutor {
    #[instrument(skip_all)]
    async fn execute_workflow(
        &self,
        workflow: &Workflow,
        inputs: &WorkflowInputs,
        handlers: &dyn HandlerLookup,
    ) -> Result<ExecutionHandle, PluginError> {
        let settings = self.settings().await?;
        let merged = merge_inputs(workflow, inputs, handlers).await?;

        // Subscribe before queueing so no event of this prompt is missed.
        let mut events = settings.client.connect_events().await?;
        let prompt_id = settings.client.queue_prompt(&merged).await?;

        let execution_id = Uuid::new_v4().to_string();
        let status = ExecutionStatus::running(execution_id.clone(), Some(prompt_id.clone()));
        let handle = status.handle();
        prune_finished(&self.executions, FINISHED_RETENTION);
        self.executions
            .insert(execution_id.clone(), ExecutionRecord { status, task: None });
        info!("execution {} started as prompt {}", execution_id, prompt_id);

        let executions = self.executions.clone();
        let id = execution_id.clone();
        let task = tokio::spawn(async move {
            let outcome = run_to_completion(&settings, &mut events, &prompt_id).await;
            let _ = events.close(None).await;
            record_outcome(&executions, &id, outcome);
        });
        attach_task(&self.executions, &execution_id, task.abort_handle());

        Ok(handle)
    }

    async fn get_execution_status(
        &self,
        execution_id: &str,
    ) -> Result<ExecutionStatus, PluginError> {
        self.executions
            .get(execution_id)
            .map(|record| record.status.clone())
            .ok_or_else(|| PluginError::ExecutionNotFound(execution_id.to_string()))
    }

    async fn cancel_execution(&self, execution_id: &str) -> Result<bool, PluginError> {
        let prompt_id = {
            let mut record = self
                .executions
                .get_mut(execution_id)
                .ok_or_else(|| PluginError::ExecutionNotFound(execution_id.to_string()))?;
            if !record.status.finish(ExecutionState::Cancelled, None) {
                return Ok(false);
            }
            if let Some(task) = record.task.take() {
                task.abort();
            }
            record.status.prompt_id.clone()
        };

        if let (Some(prompt_id), Ok(settings)) = (prompt_id, self.settings().await) {
            if let Err(err) = settings.client.delete_from_queue(&prompt_id).await {
                warn!("could not drop prompt {} from the queue: {}", prompt_id, err);
            }
        }
        info!("execution {} cancelled", execution_id);
        Ok(true)
    }

    async fn health(&self) -> EngineHealth {
        let settings = match self.settings().await {
            Ok(settings) => settings,
            Err(err) => return EngineHealth::error(err.to_string()),
        };
        let started = Instant::now();
        match settings.client.system_stats().await {
            Ok(_) => EngineHealth::connected(started.elapsed().as_secs_f64() * 1_000.0),
            Err(PluginError::Remote(message)) => EngineHealth::disconnected(message),
            Err(err) => EngineHealth::error(err.to_string()),
        }
    }
}

async fn run_to_completion(
    settings: &ExecutorSettings,
    events: &mut EventStream,
    prompt_id: &str,
) -> Result<Vec<OutputImage>, PluginError> {
    wait_for_prompt(events, prompt_id, settings.ws_timeout).await?;
    collect_outputs(&settings.client, prompt_id, &settings.output_dir).await
}

/// Downloads every image of a finished prompt into `output_dir`.
async fn collect_outputs(
    client: &ComfyClient,
    prompt_id: &str,
    output_dir: &Path,
) -> Result<Vec<OutputImage>, PluginError> {
    let history = client.history(prompt_id).await?;
    let mut images = Vec::new();
    for (node_id, file) in history_images(&history) {
        let (bytes, content_type) = client.view(&file).await?;
        let local_name = Path::new(&file.filename)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| format!("{prompt_id}-{node_id}.png"));
        let path = output_dir.join(local_name);
        tokio::fs::write(&path, &bytes).await?;
        images.push(OutputImage {
            node_id,
            filename: file.filename,
            subfolder: file.subfolder,
            folder_type: file.folder_type,
            path,
            content_type,
        });
    }
    Ok(images)
}

/// Stores the task of a running execution. A record that already finished,
/// for example because it was cancelled while the task was being spawned,
/// gets its task aborted instead.
fn attach_task(
    executions: &DashMap<String, ExecutionRecord>,
    execution_id: &str,
    task: AbortHandle,
) {
    match executions.get_mut(execution_id) {
        Some(mut record) if !record.status.status.is_terminal() => record.task = Some(task),
        _ => task.abort(),
    }
}

/// Drops the oldest finished records beyond `keep`. Running ones always stay.
fn prune_finished(executions: &DashMap<String, ExecutionRecord>, keep: usize) {
    let mut finished: Vec<_> = executions
        .iter()
        .filter(|record| record.status.status.is_terminal())
        .map(|record| (record.status.finished_at, record.key().clone()))
        .collect();
    if finished.len() <= keep {
        return;
    }
    finished.sort();
    let excess = finished.len() - keep;
    for (_, id) in finished.into_iter().take(excess) {
        executions.remove(&id);
    }
    debug!("dropped {} finished execution record(s)", excess);
}

fn record_outcome(
    executions: &DashMap<String, ExecutionRecord>,
    execution_id: &str,
    outcome: Result<Vec<OutputImage>, PluginError>,
) {
    let Some(mut record) = executions.get_mut(execution_id) else {
        return;
    };
    record.task = None;
    match outcome {
        Ok(images) => {
            let count = images.len();
            if record.status.finish(ExecutionState::Completed, None) {
                record.status.images = images;
                info!("execution {} completed with {} image(s)", execution_id, count);
            }
        }
        Err(err) => {
            if record.status.finish(ExecutionState::Failed, Some(err.to_string())) {
                error!("execution {} failed: {}", execution_id, err);
            }
        }
    }
}
