pub mod error;
pub mod execution;
pub mod plugin;
pub mod workflow;

pub use error::{PluginError, ValidationError};
pub use execution::{
    EngineHealth, ExecutionHandle, ExecutionState, ExecutionStatus, HealthState, OutputImage,
};
pub use plugin::{
    ConfigKeys, FieldType, HandlerLookup, NodeHandlerPlugin, NodeParams, NodeResult, Plugin,
    PluginConfig, PluginKind, PluginMetadata, WorkflowExecutorPlugin, WorkflowInputs,
};
pub use workflow::{NodeMeta, Workflow, WorkflowNode};
