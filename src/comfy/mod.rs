//! ComfyUI integration: the HTTP/websocket client and the workflow executor.
use std::time::Duration;

pub mod client;
pub mod executor;

pub use client::ComfyClient;
pub use executor::ComfyUiWorkflowExecutor;

pub const COMFY_SERVER_ADDRESS: &str = "COMFY_SERVER_ADDRESS";
pub const COMFY_OUTPUT_DIR: &str = "COMFY_OUTPUT_DIR";
pub const COMFY_HTTP_TIMEOUT: &str = "COMFY_HTTP_TIMEOUT";
pub const COMFY_WS_TIMEOUT: &str = "COMFY_WS_TIMEOUT";

pub const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_WS_TIMEOUT: Duration = Duration::from_secs(30);
