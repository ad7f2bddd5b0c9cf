use std::fmt;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::plugin::PluginKind;

/// A single user-supplied value that a node handler refused.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ValidationError {
    pub node_id: String,
    pub field: String,
    pub message: String,
}

impl ValidationError {
    pub fn new(
        node_id: impl Into<String>,
        field: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            field: field.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node {} field `{}`: {}", self.node_id, self.field, self.message)
    }
}

#[derive(Error, Debug)]
pub enum PluginError {
    #[error("a {kind} plugin named `{name}` is already registered")]
    DuplicatePlugin { kind: PluginKind, name: String },

    #[error("workflow executor `{rejected}` refused: `{existing}` is already registered")]
    ExecutorAlreadyRegistered { existing: String, rejected: String },

    #[error("invalid plugin metadata: {0}")]
    InvalidMetadata(String),

    #[error("plugin `{plugin}` cannot handle node type `{node_type}`")]
    UnsupportedNodeType { plugin: String, node_type: String },

    #[error("no workflow executor available")]
    NoExecutorAvailable,

    #[error("plugin `{name}` failed to initialize: {message}")]
    Initialization { name: String, message: String },

    #[error("plugin `{plugin}` requires config key `{key}`")]
    MissingConfig { plugin: String, key: String },

    #[error("plugin `{plugin}` has an invalid `{key}`: {message}")]
    InvalidConfig {
        plugin: String,
        key: String,
        message: String,
    },

    #[error("plugins were already discovered")]
    AlreadyDiscovered,

    #[error("{} input(s) failed validation", .0.len())]
    Validation(Vec<ValidationError>),

    #[error("execution `{0}` not found")]
    ExecutionNotFound(String),

    #[error("workflow engine error: {0}")]
    Remote(String),

    #[error("timed out after {0} ms")]
    Timeout(u64),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("JSON error: {0}")]
    Json(String),
}

impl PluginError {
    /// Wraps any error raised by a plugin's `initialize` hook.
    pub fn initialization(name: impl Into<String>, cause: impl fmt::Display) -> Self {
        PluginError::Initialization {
            name: name.into(),
            message: cause.to_string(),
        }
    }

    pub fn validation_errors(&self) -> &[ValidationError] {
        match self {
            PluginError::Validation(errors) => errors,
            _ => &[],
        }
    }
}

impl From<serde_json::Error> for PluginError {
    fn from(e: serde_json::Error) -> Self {
        PluginError::Json(e.to_string())
    }
}

impl From<std::io::Error> for PluginError {
    fn from(e: std::io::Error) -> Self {
        PluginError::Io(e.to_string())
    }
}
