// src/comfy/client.rs
use std::{path::Path, time::Duration};

use comfy_plugin::{PluginError, Workflow};
use futures_util::StreamExt;
use reqwest::{
    Client,
    multipart::{Form, Part},
};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::net::TcpStream;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};
use tracing::{debug, warn};
use url::Url;

pub type EventStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Accepts `host:port` or a full `http(s)://` URL.
pub fn parse_server_address(address: &str) -> Result<Url, url::ParseError> {
    let address = address.trim();
    let mut url = if address.contains("://") {
        Url::parse(address)?
    } else {
        Url::parse(&format!("http://{address}"))?
    };
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    Ok(url)
}

/// A file reference ComfyUI returns from uploads and in execution history.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct FileRef {
    #[serde(alias = "name")]
    pub filename: String,
    #[serde(default)]
    pub subfolder: String,
    #[serde(rename = "type", default = "default_folder_type")]
    pub folder_type: String,
}

fn default_folder_type() -> String {
    "output".to_string()
}

#[derive(Debug, Deserialize)]
struct QueueResponse {
    prompt_id: String,
}

/// HTTP and websocket access to one ComfyUI server.
#[derive(Debug, Clone)]
pub struct ComfyClient {
    http: Client,
    base_url: Url,
    client_id: String,
    timeout: Option<Duration>,
}

impl ComfyClient {
    pub fn new(
        base_url: Url,
        client_id: impl Into<String>,
        timeout: Option<Duration>,
    ) -> Result<Self, PluginError> {
        let mut builder = Client::builder();
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }
        let http = builder.build().map_err(|e| PluginError::Remote(e.to_string()))?;
        Ok(Self {
            http,
            base_url,
            client_id: client_id.into(),
            timeout,
        })
    }

    /// Per-request HTTP timeout, `None` when requests may wait forever.
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    fn endpoint(&self, path: &str) -> Result<Url, PluginError> {
        self.base_url
            .join(path)
            .map_err(|e| PluginError::Remote(format!("bad endpoint {path}: {e}")))
    }

    fn events_url(&self) -> Result<Url, PluginError> {
        let mut url = self.endpoint("ws")?;
        let scheme = if url.scheme() == "https" { "wss" } else { "ws" };
        url.set_scheme(scheme).map_err(|_| {
            PluginError::Remote(format!("cannot derive websocket url from {}", self.base_url))
        })?;
        url.query_pairs_mut().append_pair("clientId", &self.client_id);
        Ok(url)
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response, PluginError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(PluginError::Remote(format!("{status}: {body}")))
    }

    /// Queues an API-format graph and returns the prompt id.
    pub async fn queue_prompt(&self, workflow: &Workflow) -> Result<String, PluginError> {
        let body = json!({ "prompt": workflow, "client_id": self.client_id });
        let response = self
            .http
            .post(self.endpoint("prompt")?)
            .json(&body)
            .send()
            .await
            .map_err(remote)?;
        let queued: QueueResponse = Self::check(response).await?.json().await.map_err(remote)?;
        debug!("queued prompt {}", queued.prompt_id);
        Ok(queued.prompt_id)
    }

    /// Uploads an image into the server's input folder.
    pub async fn upload_image(&self, path: &Path) -> Result<FileRef, PluginError> {
        let bytes = tokio::fs::read(path).await?;
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "upload.png".to_string());
        let form = Form::new()
            .part("image", Part::bytes(bytes).file_name(file_name))
            .text("overwrite", "true");
        let response = self
            .http
            .post(self.endpoint("upload/image")?)
            .multipart(form)
            .send()
            .await
            .map_err(remote)?;
        Self::check(response).await?.json().await.map_err(remote)
    }

    /// History entry of one prompt, `Value::Null` when the server has none.
    pub async fn history(&self, prompt_id: &str) -> Result<Value, PluginError> {
        let response = self
            .http
            .get(self.endpoint(&format!("history/{prompt_id}"))?)
            .send()
            .await
            .map_err(remote)?;
        let mut history: Value = Self::check(response).await?.json().await.map_err(remote)?;
        Ok(history.get_mut(prompt_id).map(Value::take).unwrap_or(Value::Null))
    }

    /// Downloads a file. Returns the bytes and the reported content type.
    pub async fn view(&self, file: &FileRef) -> Result<(Vec<u8>, Option<String>), PluginError> {
        let response = self
            .http
            .get(self.endpoint("view")?)
            .query(&[
                ("filename", file.filename.as_str()),
                ("subfolder", file.subfolder.as_str()),
                ("type", file.folder_type.as_str()),
            ])
            .send()
            .await
            .map_err(remote)?;
        let response = Self::check(response).await?;
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned);
        let bytes = response.bytes().await.map_err(remote)?;
        Ok((bytes.to_vec(), content_type))
    }

    /// Drops a pending prompt from the server queue.
    pub async fn delete_from_queue(&self, prompt_id: &str) -> Result<(), PluginError> {
        let response = self
            .http
            .post(self.endpoint("queue")?)
            .json(&json!({ "delete": [prompt_id] }))
            .send()
            .await
            .map_err(remote)?;
        Self::check(response).await?;
        Ok(())
    }

    pub async fn system_stats(&self) -> Result<Value, PluginError> {
        let response = self
            .http
            .get(self.endpoint("system_stats")?)
            .send()
            .await
            .map_err(remote)?;
        Self::check(response).await?.json().await.map_err(remote)
    }

    /// Opens the event stream for this client id.
    pub async fn connect_events(&self) -> Result<EventStream, PluginError> {
        let url = self.events_url()?;
        let (stream, _) = connect_async(url.as_str())
            .await
            .map_err(|e| PluginError::Remote(format!("websocket {url}: {e}")))?;
        Ok(stream)
    }
}

fn remote(e: reqwest::Error) -> PluginError {
    if e.is_timeout() {
        PluginError::Remote(format!("request timed out: {e}"))
    } else {
        PluginError::Remote(e.to_string())
    }
}

/// What an event says about the prompt being watched.
#[derive(Debug, Clone, PartialEq)]
pub enum PromptEvent {
    Finished,
    Failed(String),
    Other,
}

/// Interprets one websocket text frame for `prompt_id`.
pub fn classify_event(raw: &str, prompt_id: &str) -> PromptEvent {
    let Ok(event) = serde_json::from_str::<Value>(raw) else {
        return PromptEvent::Other;
    };
    let data = &event["data"];
    if data["prompt_id"].as_str() != Some(prompt_id) {
        return PromptEvent::Other;
    }
    match event["type"].as_str() {
        Some("executing") if data["node"].is_null() => PromptEvent::Finished,
        Some("execution_success") => PromptEvent::Finished,
        Some("execution_error") => {
            let node = data["node_id"].as_str().unwrap_or("?");
            let message = data["exception_message"].as_str().unwrap_or("execution error");
            PromptEvent::Failed(format!("node {node}: {message}"))
        }
        Some("execution_interrupted") => PromptEvent::Failed("execution interrupted".into()),
        _ => PromptEvent::Other,
    }
}

/// Reads events until `prompt_id` finished or failed.
///
/// `idle` bounds the wait for each single event, so a long run stays alive as
/// long as the server keeps reporting progress.
pub async fn wait_for_prompt(
    events: &mut EventStream,
    prompt_id: &str,
    idle: Option<Duration>,
) -> Result<(), PluginError> {
    loop {
        let next = match idle {
            Some(limit) => tokio::time::timeout(limit, events.next())
                .await
                .map_err(|_| PluginError::Timeout(limit.as_millis() as u64))?,
            None => events.next().await,
        };
        let Some(message) = next else {
            break;
        };
        let message = message.map_err(|e| PluginError::Remote(format!("websocket: {e}")))?;
        match message {
            Message::Text(text) => match classify_event(text.as_str(), prompt_id) {
                PromptEvent::Finished => return Ok(()),
                PromptEvent::Failed(reason) => return Err(PluginError::Remote(reason)),
                PromptEvent::Other => {}
            },
            Message::Close(_) => break,
            _ => {}
        }
    }
    warn!("event stream closed before prompt {} finished", prompt_id);
    Err(PluginError::Remote("event stream closed before the prompt finished".into()))
}

/// Every image listed in a history entry, with the id of the node that made it.
pub fn history_images(history: &Value) -> Vec<(String, FileRef)> {
    let Some(outputs) = history["outputs"].as_object() else {
        return Vec::new();
    };
    outputs
        .iter()
        .flat_map(|(node_id, output)| {
            output["images"]
                .as_array()
                .into_iter()
                .flatten()
                .filter_map(|image| serde_json::from_value::<FileRef>(image.clone()).ok())
                .map(move |image| (node_id.clone(), image))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_address_forms() {
        assert_eq!(
            parse_server_address("127.0.0.1:8188").unwrap().as_str(),
            "http://127.0.0.1:8188/"
        );
        assert_eq!(
            parse_server_address("https://comfy.example.com/").unwrap().as_str(),
            "https://comfy.example.com/"
        );
        assert_eq!(
            parse_server_address("http://proxy.local/comfy")
                .unwrap()
                .join("prompt")
                .unwrap()
                .as_str(),
            "http://proxy.local/comfy/prompt"
        );
    }

    #[test]
    fn events_url_carries_client_id() {
        let local = parse_server_address("localhost:8188").unwrap();
        let client = ComfyClient::new(local, "abc", None).unwrap();
        assert_eq!(
            client.events_url().unwrap().as_str(),
            "ws://localhost:8188/ws?clientId=abc"
        );

        let remote = parse_server_address("https://comfy.io").unwrap();
        let secure = ComfyClient::new(remote, "abc", None).unwrap();
        assert_eq!(secure.events_url().unwrap().scheme(), "wss");
    }

    #[test]
    fn classifies_events_for_our_prompt_only() {
        let done = r#"{"type":"executing","data":{"node":null,"prompt_id":"p1"}}"#;
        assert_eq!(classify_event(done, "p1"), PromptEvent::Finished);
        assert_eq!(classify_event(done, "p2"), PromptEvent::Other);

        let busy = r#"{"type":"executing","data":{"node":"3","prompt_id":"p1"}}"#;
        assert_eq!(classify_event(busy, "p1"), PromptEvent::Other);

        let failed = json!({
            "type": "execution_error",
            "data": {"prompt_id": "p1", "node_id": "3", "exception_message": "OOM"}
        })
        .to_string();
        assert_eq!(classify_event(&failed, "p1"), PromptEvent::Failed("node 3: OOM".into()));

        assert_eq!(classify_event("not json", "p1"), PromptEvent::Other);
    }

    #[test]
    fn collects_history_images() {
        let history = serde_json::json!({
            "outputs": {
                "9": {"images": [{"filename": "out_0001.png", "subfolder": "", "type": "output"}]},
                "10": {"text": ["no images here"]}
            }
        });
        let images = history_images(&history);
        assert_eq!(images.len(), 1);
        assert_eq!(images[0].0, "9");
        assert_eq!(images[0].1.filename, "out_0001.png");
        assert!(history_images(&Value::Null).is_empty());
    }
}
