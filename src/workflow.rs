// src/workflow.rs
use std::path::{Path, PathBuf};

use comfy_plugin::{
    FieldType, HandlerLookup, NodeParams, NodeResult, PluginError, ValidationError, Workflow,
    WorkflowInputs, WorkflowNode,
};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("workflow `{0}` not found")]
    NotFound(String),
    #[error("invalid workflow id `{0}`")]
    InvalidId(String),
    #[error("workflow `{id}` is not a valid API-format graph: {source}")]
    Parse {
        id: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("workflow storage: {0}")]
    Io(#[from] std::io::Error),
}

/// API-format workflow JSON files in one directory, addressed by file stem.
#[derive(Debug, Clone)]
pub struct WorkflowStore {
    dir: PathBuf,
}

impl WorkflowStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Sorted workflow ids. A missing directory lists as empty.
    pub async fn list(&self) -> Result<Vec<String>, WorkflowError> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!("workflow directory {} does not exist", self.dir.display());
                return Ok(Vec::new());
            }
            Err(e) => return Err(e.into()),
        };

        let mut ids = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                ids.push(stem.to_string());
            }
        }
        ids.sort();
        Ok(ids)
    }

    pub async fn load(&self, id: &str) -> Result<Workflow, WorkflowError> {
        if id.is_empty() || id.contains(['/', '\\']) || id.contains("..") {
            return Err(WorkflowError::InvalidId(id.to_string()));
        }
        let path = self.dir.join(format!("{id}.json"));
        let raw = match tokio::fs::read(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(WorkflowError::NotFound(id.to_string()));
            }
            Err(e) => return Err(e.into()),
        };
        serde_json::from_slice(&raw).map_err(|source| WorkflowError::Parse {
            id: id.to_string(),
            source,
        })
    }
}

/// One form field, derived from an input node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct FormField {
    pub node_id: String,
    pub name: String,
    pub title: String,
    pub class_type: String,
    #[serde(rename = "type")]
    pub field_type: FieldType,
    pub required: bool,
    /// Plugin that will process the value, if any handler claims the node.
    pub handler: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct FormSchema {
    pub workflow_id: String,
    pub title: String,
    pub fields: Vec<FormField>,
}

/// Describes the inputs a client must collect to run `workflow`.
pub fn form_schema(
    workflow_id: &str,
    workflow: &Workflow,
    handlers: &dyn HandlerLookup,
) -> FormSchema {
    let fields = workflow
        .input_nodes()
        .map(|(node_id, node)| {
            let handler = handlers.node_handler(&node.class_type);
            FormField {
                node_id: node_id.to_string(),
                name: node.field_name().unwrap_or_else(|| node_id.to_string()),
                title: node.title().unwrap_or(node_id).to_string(),
                class_type: node.class_type.clone(),
                field_type: handler.as_ref().map(|h| h.field_type()).unwrap_or(FieldType::Text),
                required: true,
                handler: handler.map(|h| h.metadata().name.clone()),
            }
        })
        .collect();

    FormSchema {
        workflow_id: workflow_id.to_string(),
        title: workflow_id.replace(['_', '-'], " "),
        fields,
    }
}

/// The user value meant for an input node: by node id first, then by field name.
fn lookup_input<'a>(
    inputs: &'a WorkflowInputs,
    node_id: &str,
    node: &WorkflowNode,
) -> Option<&'a Value> {
    inputs
        .get(node_id)
        .or_else(|| node.field_name().and_then(|name| inputs.get(&name)))
        .filter(|value| !value.is_null())
}

/// Scalars go under the handler's first parameter, objects pass as they are.
fn to_params(value: &Value, required: &[&str]) -> NodeParams {
    match value {
        Value::Object(map) => map.clone(),
        other => {
            let mut params = NodeParams::new();
            let key = required.first().copied().unwrap_or("value");
            params.insert(key.to_string(), other.clone());
            params
        }
    }
}

/// Applies user inputs to a copy of `workflow` through the node handlers.
///
/// Input nodes without a value keep their defaults. Handler output only
/// overwrites keys the node already declares in `inputs`. Every rejected
/// value is collected, and any rejection fails the merge as a whole. A handler
/// error counts as a rejection of that node's value.
pub async fn merge_inputs(
    workflow: &Workflow,
    inputs: &WorkflowInputs,
    handlers: &dyn HandlerLookup,
) -> Result<Workflow, PluginError> {
    let mut merged = workflow.clone();
    let mut errors = Vec::new();

    for (node_id, node) in workflow.input_nodes() {
        let Some(value) = lookup_input(inputs, node_id, node) else {
            continue;
        };
        let Some(handler) = handlers.node_handler(&node.class_type) else {
            debug!("no handler for node {} of type {}", node_id, node.class_type);
            continue;
        };

        let required = handler.required_inputs();
        let params = to_params(value, &required);
        match handler.handle_node(node_id, node, &params).await {
            Ok(NodeResult::Resolved(values)) => {
                let Some(target) = merged.node_mut(node_id) else {
                    continue;
                };
                for (key, value) in values {
                    if target.inputs.contains_key(&key) {
                        target.inputs.insert(key, value);
                    } else {
                        debug!("node {} has no input `{}`, value dropped", node_id, key);
                    }
                }
            }
            Ok(NodeResult::Rejected(rejected)) => errors.extend(rejected),
            Err(err) => {
                warn!("handler {} failed on node {}: {}", handler.metadata().name, node_id, err);
                let field = required.first().copied().unwrap_or("value");
                errors.push(ValidationError::new(node_id, field, err.to_string()));
            }
        }
    }

    if errors.is_empty() {
        Ok(merged)
    } else {
        Err(PluginError::Validation(errors))
    }
}
