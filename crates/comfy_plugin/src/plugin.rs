// comfy_plugin/src/plugin.rs
use std::{collections::HashMap, fmt::Display, str::FromStr, sync::Arc, time::Duration};

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use strum_macros::{Display as StrumDisplay, EnumString};

use crate::{
    error::{PluginError, ValidationError},
    execution::{EngineHealth, ExecutionHandle, ExecutionStatus},
    workflow::{Workflow, WorkflowNode},
};

/// Parameters handed to a node handler, and the values it hands back.
pub type NodeParams = Map<String, Value>;

/// User inputs keyed by node id or by form field name.
pub type WorkflowInputs = Map<String, Value>;

#[derive(
    Debug,
    Copy,
    Clone,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    JsonSchema,
    StrumDisplay,
    EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum PluginKind {
    NodeHandler,
    WorkflowExecutor,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct PluginMetadata {
    pub name: String,
    pub version: String,
    pub description: String,
    pub author: String,
    pub plugin_type: PluginKind,
}

impl PluginMetadata {
    pub fn new(
        name: impl Into<String>,
        version: impl Into<String>,
        description: impl Into<String>,
        author: impl Into<String>,
        plugin_type: PluginKind,
    ) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            description: description.into(),
            author: author.into(),
            plugin_type,
        }
    }

    /// Every descriptive field must carry a non-blank value.
    pub fn validate(&self) -> Result<(), PluginError> {
        let fields = [
            ("name", &self.name),
            ("version", &self.version),
            ("description", &self.description),
            ("author", &self.author),
        ];
        for (field, value) in fields {
            if value.trim().is_empty() {
                let owner = if self.name.trim().is_empty() {
                    "<unnamed>"
                } else {
                    self.name.as_str()
                };
                return Err(PluginError::InvalidMetadata(format!(
                    "plugin {owner} has an empty `{field}`"
                )));
            }
        }
        Ok(())
    }
}

/// Config keys a plugin reads, each with an optional human readable hint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ConfigKeys {
    pub required_keys: Vec<(String, Option<String>)>,
    pub optional_keys: Vec<(String, Option<String>)>,
}

impl ConfigKeys {
    pub fn required(mut self, key: &str, hint: &str) -> Self {
        self.required_keys.push((key.to_string(), Some(hint.to_string())));
        self
    }

    pub fn optional(mut self, key: &str, hint: &str) -> Self {
        self.optional_keys.push((key.to_string(), Some(hint.to_string())));
        self
    }
}

/// Flat key/value settings handed to every plugin on initialization.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PluginConfig(HashMap<String, String>);

impl PluginConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: &str, value: &str) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: &str, value: &str) {
        self.0.insert(key.to_string(), value.to_string());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    /// Returns the trimmed value of `key`, failing when it is absent or blank.
    pub fn require(&self, plugin: &str, key: &str) -> Result<&str, PluginError> {
        match self.get(key).map(str::trim) {
            Some(value) if !value.is_empty() => Ok(value),
            _ => Err(PluginError::MissingConfig {
                plugin: plugin.to_string(),
                key: key.to_string(),
            }),
        }
    }

    /// Parses `key` when present and non-blank.
    pub fn parse<T>(&self, plugin: &str, key: &str) -> Result<Option<T>, PluginError>
    where
        T: FromStr,
        T::Err: Display,
    {
        match self.get(key).map(str::trim) {
            None | Some("") => Ok(None),
            Some(raw) => raw.parse::<T>().map(Some).map_err(|e| PluginError::InvalidConfig {
                plugin: plugin.to_string(),
                key: key.to_string(),
                message: format!("`{raw}`: {e}"),
            }),
        }
    }

    /// Reads a timeout in seconds.
    ///
    /// An absent key yields `default`. `0`, `none`, `null` and an empty value
    /// switch the timeout off. Anything unparsable falls back to `default`.
    pub fn timeout(&self, key: &str, default: Option<Duration>) -> Option<Duration> {
        let Some(raw) = self.get(key) else {
            return default;
        };
        let raw = raw.trim();
        if raw.is_empty() || raw.eq_ignore_ascii_case("none") || raw.eq_ignore_ascii_case("null") {
            return None;
        }
        match raw.parse::<f64>() {
            Ok(secs) if secs == 0.0 => None,
            Ok(secs) if secs > 0.0 => match Duration::try_from_secs_f64(secs) {
                Ok(timeout) => Some(timeout),
                Err(e) => {
                    tracing::warn!("ignoring out of range timeout {key}={raw}: {e}");
                    default
                }
            },
            _ => {
                tracing::warn!("ignoring unparsable timeout {key}={raw}");
                default
            }
        }
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for PluginConfig {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

/// Lifecycle shared by every plugin.
///
/// `initialize` may run more than once with the same config. `cleanup` must be
/// safe to call on a plugin that never initialized.
#[async_trait]
pub trait Plugin: Send + Sync {
    fn metadata(&self) -> &PluginMetadata;

    fn config_keys(&self) -> ConfigKeys {
        ConfigKeys::default()
    }

    async fn initialize(&self, _config: &PluginConfig) -> Result<(), PluginError> {
        Ok(())
    }

    async fn cleanup(&self) -> Result<(), PluginError> {
        Ok(())
    }
}

/// How a form renders the value a handler expects.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema, StrumDisplay)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum FieldType {
    Text,
    File,
    Boolean,
}

/// Outcome of handing a user value to a node handler.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeResult {
    /// Values to merge into the node's `inputs`.
    Resolved(NodeParams),
    /// The value was unusable. The request fails with these errors.
    Rejected(Vec<ValidationError>),
}

impl NodeResult {
    pub fn resolved(key: &str, value: Value) -> Self {
        let mut params = NodeParams::new();
        params.insert(key.to_string(), value);
        NodeResult::Resolved(params)
    }

    pub fn rejected(error: ValidationError) -> Self {
        NodeResult::Rejected(vec![error])
    }

    pub fn is_resolved(&self) -> bool {
        matches!(self, NodeResult::Resolved(_))
    }
}

#[async_trait]
pub trait NodeHandlerPlugin: Plugin {
    /// Pure and fast: called on every lookup.
    fn can_handle(&self, node_type: &str) -> bool;

    /// Parameter names `handle_node` reads. The first one receives a scalar
    /// user value.
    fn required_inputs(&self) -> Vec<&'static str>;

    fn field_type(&self) -> FieldType {
        FieldType::Text
    }

    /// Turns a user value into node input overrides.
    async fn handle_node(
        &self,
        node_id: &str,
        node: &WorkflowNode,
        params: &NodeParams,
    ) -> Result<NodeResult, PluginError>;

    fn ensure_can_handle(&self, node: &WorkflowNode) -> Result<(), PluginError> {
        if self.can_handle(&node.class_type) {
            Ok(())
        } else {
            Err(PluginError::UnsupportedNodeType {
                plugin: self.metadata().name.clone(),
                node_type: node.class_type.clone(),
            })
        }
    }
}

/// Resolves the node handler for a node type. Executors receive one so they
/// never depend on the registry directly.
pub trait HandlerLookup: Send + Sync {
    fn node_handler(&self, node_type: &str) -> Option<Arc<dyn NodeHandlerPlugin>>;
}

#[async_trait]
pub trait WorkflowExecutorPlugin: Plugin {
    /// Merges `inputs` into a copy of `workflow` and submits it.
    ///
    /// Returns once the engine accepted the graph. Progress is tracked under the
    /// returned execution id.
    async fn execute_workflow(
        &self,
        workflow: &Workflow,
        inputs: &WorkflowInputs,
        handlers: &dyn HandlerLookup,
    ) -> Result<ExecutionHandle, PluginError>;

    async fn get_execution_status(
        &self,
        execution_id: &str,
    ) -> Result<ExecutionStatus, PluginError>;

    /// `Ok(false)` when the execution exists but is no longer running.
    async fn cancel_execution(&self, execution_id: &str) -> Result<bool, PluginError>;

    async fn health(&self) -> EngineHealth {
        EngineHealth::unknown()
    }
}
