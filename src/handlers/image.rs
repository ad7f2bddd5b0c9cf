use std::path::PathBuf;

use async_trait::async_trait;
use comfy_plugin::{
    ConfigKeys, FieldType, NodeHandlerPlugin, NodeParams, NodeResult, Plugin, PluginConfig,
    PluginError, PluginKind, PluginMetadata, ValidationError, WorkflowNode,
};
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::comfy::client::{ComfyClient, parse_server_address};
use crate::comfy::{COMFY_HTTP_TIMEOUT, COMFY_SERVER_ADDRESS, DEFAULT_HTTP_TIMEOUT};

pub const IMAGE_MAX_FILE_SIZE: &str = "IMAGE_MAX_FILE_SIZE";
/// Directory every uploaded image must live in.
pub const IMAGE_INPUT_DIR: &str = "IMAGE_INPUT_DIR";
const DEFAULT_MAX_FILE_SIZE: u64 = 10 * 1024 * 1024;
const IMAGE_PATH_KEY: &str = "image_path";
const IMAGE_KEY: &str = "image";

struct ImageSettings {
    client: ComfyClient,
    max_file_size: u64,
    input_dir: PathBuf,
}

/// Uploads local images to ComfyUI and points image loader nodes at them.
pub struct ImageInputHandler {
    metadata: PluginMetadata,
    settings: RwLock<Option<ImageSettings>>,
}

impl ImageInputHandler {
    pub const NAME: &'static str = "image_input";

    pub fn new() -> Self {
        Self {
            metadata: PluginMetadata::new(
                Self::NAME,
                env!("CARGO_PKG_VERSION"),
                "Image uploads for LoadImageOutput and LoadImage nodes",
                "comfyforms",
                PluginKind::NodeHandler,
            ),
            settings: RwLock::new(None),
        }
    }
}

impl Default for ImageInputHandler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Plugin for ImageInputHandler {
    fn metadata(&self) -> &PluginMetadata {
        &self.metadata
    }

    fn config_keys(&self) -> ConfigKeys {
        ConfigKeys::default()
            .required(COMFY_SERVER_ADDRESS, "ComfyUI host:port or URL")
            .required(IMAGE_INPUT_DIR, "only images below this directory are uploaded")
            .optional(IMAGE_MAX_FILE_SIZE, "largest accepted upload in bytes (10 MiB)")
            .optional(COMFY_HTTP_TIMEOUT, "HTTP timeout in seconds (30), 0 for none")
    }

    async fn initialize(&self, config: &PluginConfig) -> Result<(), PluginError> {
        let address = config.require(Self::NAME, COMFY_SERVER_ADDRESS)?;
        let base_url = parse_server_address(address).map_err(|e| PluginError::InvalidConfig {
            plugin: Self::NAME.to_string(),
            key: COMFY_SERVER_ADDRESS.to_string(),
            message: e.to_string(),
        })?;
        let input_dir = PathBuf::from(config.require(Self::NAME, IMAGE_INPUT_DIR)?);
        tokio::fs::create_dir_all(&input_dir).await?;
        let input_dir = tokio::fs::canonicalize(&input_dir).await?;
        let max_file_size = config
            .parse::<u64>(Self::NAME, IMAGE_MAX_FILE_SIZE)?
            .unwrap_or(DEFAULT_MAX_FILE_SIZE);
        let timeout = config.timeout(COMFY_HTTP_TIMEOUT, Some(DEFAULT_HTTP_TIMEOUT));
        let client = ComfyClient::new(base_url, uuid::Uuid::new_v4().to_string(), timeout)?;

        info!(
            "image uploads from {} go to {}",
            input_dir.display(),
            client.base_url()
        );
        *self.settings.write().await = Some(ImageSettings {
            client,
            max_file_size,
            input_dir,
        });
        Ok(())
    }

    async fn cleanup(&self) -> Result<(), PluginError> {
        self.settings.write().await.take();
        Ok(())
    }
}

#[async_trait]
impl NodeHandlerPlugin for ImageInputHandler {
    fn can_handle(&self, node_type: &str) -> bool {
        node_type == "LoadImageOutput" || node_type == "LoadImage"
    }

    fn required_inputs(&self) -> Vec<&'static str> {
        vec![IMAGE_PATH_KEY]
    }

    fn field_type(&self) -> FieldType {
        FieldType::File
    }

    async fn handle_node(
        &self,
        node_id: &str,
        node: &WorkflowNode,
        params: &NodeParams,
    ) -> Result<NodeResult, PluginError> {
        self.ensure_can_handle(node)?;

        let reject = |message: String| -> Result<NodeResult, PluginError> {
            Ok(NodeResult::rejected(ValidationError::new(node_id, IMAGE_PATH_KEY, message)))
        };
        let path = match params.get(IMAGE_PATH_KEY).or_else(|| params.get(IMAGE_KEY)) {
            Some(Value::String(p)) if !p.trim().is_empty() => PathBuf::from(p.trim()),
            Some(Value::String(_)) | Some(Value::Null) | None => {
                return reject("an image file is required".into());
            }
            Some(_) => return reject("expected a file path".into()),
        };

        let guard = self.settings.read().await;
        let Some(settings) = guard.as_ref() else {
            return Err(PluginError::initialization(
                Self::NAME,
                "handler used before initialization",
            ));
        };

        // Relative paths are taken from the input directory. Symlinks and `..`
        // are resolved before the containment check.
        let path = match tokio::fs::canonicalize(settings.input_dir.join(&path)).await {
            Ok(resolved) if resolved.starts_with(&settings.input_dir) => resolved,
            Ok(_) => {
                warn!("refusing image {} outside the input directory", path.display());
                return reject("image must be an uploaded file".into());
            }
            Err(_) => return reject(format!("image file {} not found", path.display())),
        };
        let size = match tokio::fs::metadata(&path).await {
            Ok(meta) if meta.is_file() => meta.len(),
            _ => return reject(format!("image file {} not found", path.display())),
        };
        if size > settings.max_file_size {
            return reject(format!(
                "image is {size} bytes, the limit is {} bytes",
                settings.max_file_size
            ));
        }

        let reference = match settings.client.upload_image(&path).await {
            Ok(uploaded) => format!("{} [input]", uploaded.filename),
            Err(err) => {
                warn!("upload of {} failed, passing the local path: {}", path.display(), err);
                path.display().to_string()
            }
        };
        Ok(NodeResult::resolved(IMAGE_KEY, Value::String(reference)))
    }
}
