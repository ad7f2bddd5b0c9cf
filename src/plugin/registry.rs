// src/plugin/registry.rs
use std::{fmt, sync::Arc};

use comfy_plugin::{
    ConfigKeys, NodeHandlerPlugin, PluginConfig, PluginError, PluginKind, PluginMetadata,
    WorkflowExecutorPlugin,
};
use tracing::info;

/// A plugin instance of either kind.
#[derive(Clone)]
pub enum PluginInstance {
    NodeHandler(Arc<dyn NodeHandlerPlugin>),
    WorkflowExecutor(Arc<dyn WorkflowExecutorPlugin>),
}

impl PluginInstance {
    pub fn node_handler<P: NodeHandlerPlugin + 'static>(plugin: P) -> Self {
        PluginInstance::NodeHandler(Arc::new(plugin))
    }

    pub fn workflow_executor<P: WorkflowExecutorPlugin + 'static>(plugin: P) -> Self {
        PluginInstance::WorkflowExecutor(Arc::new(plugin))
    }

    /// The kind this instance implements, regardless of what its metadata claims.
    pub fn kind(&self) -> PluginKind {
        match self {
            PluginInstance::NodeHandler(_) => PluginKind::NodeHandler,
            PluginInstance::WorkflowExecutor(_) => PluginKind::WorkflowExecutor,
        }
    }

    pub fn metadata(&self) -> &PluginMetadata {
        match self {
            PluginInstance::NodeHandler(p) => p.metadata(),
            PluginInstance::WorkflowExecutor(p) => p.metadata(),
        }
    }

    pub fn name(&self) -> &str {
        &self.metadata().name
    }

    pub fn config_keys(&self) -> ConfigKeys {
        match self {
            PluginInstance::NodeHandler(p) => p.config_keys(),
            PluginInstance::WorkflowExecutor(p) => p.config_keys(),
        }
    }

    pub async fn initialize(&self, config: &PluginConfig) -> Result<(), PluginError> {
        match self {
            PluginInstance::NodeHandler(p) => p.initialize(config).await,
            PluginInstance::WorkflowExecutor(p) => p.initialize(config).await,
        }
    }

    pub async fn cleanup(&self) -> Result<(), PluginError> {
        match self {
            PluginInstance::NodeHandler(p) => p.cleanup().await,
            PluginInstance::WorkflowExecutor(p) => p.cleanup().await,
        }
    }
}

impl fmt::Debug for PluginInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginInstance")
            .field("kind", &self.kind())
            .field("name", &self.name())
            .finish()
    }
}

/// Registered plugins, kept in registration order.
///
/// Names are unique per kind, and at most one workflow executor is accepted.
#[derive(Default, Clone)]
pub struct PluginRegistry {
    plugins: Vec<PluginInstance>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_plugin(&mut self, plugin: PluginInstance) -> Result<(), PluginError> {
        let metadata = plugin.metadata();
        metadata.validate()?;
        if metadata.plugin_type != plugin.kind() {
            return Err(PluginError::InvalidMetadata(format!(
                "plugin {} declares type {} but implements {}",
                metadata.name,
                metadata.plugin_type,
                plugin.kind()
            )));
        }
        if self.contains(plugin.kind(), &metadata.name) {
            return Err(PluginError::DuplicatePlugin {
                kind: plugin.kind(),
                name: metadata.name.clone(),
            });
        }
        if let PluginInstance::WorkflowExecutor(_) = plugin {
            if let Some(existing) = self.workflow_executors().next() {
                return Err(PluginError::ExecutorAlreadyRegistered {
                    existing: existing.metadata().name.clone(),
                    rejected: metadata.name.clone(),
                });
            }
        }

        info!(
            "registered {} plugin `{}` v{}",
            plugin.kind(),
            metadata.name,
            metadata.version
        );
        self.plugins.push(plugin);
        Ok(())
    }

    pub fn contains(&self, kind: PluginKind, name: &str) -> bool {
        self.plugins.iter().any(|p| p.kind() == kind && p.name() == name)
    }

    /// All plugins in registration order.
    pub fn plugins(&self) -> &[PluginInstance] {
        &self.plugins
    }

    pub fn node_handlers(&self) -> impl Iterator<Item = &Arc<dyn NodeHandlerPlugin>> {
        self.plugins.iter().filter_map(|p| match p {
            PluginInstance::NodeHandler(h) => Some(h),
            PluginInstance::WorkflowExecutor(_) => None,
        })
    }

    pub fn workflow_executors(&self) -> impl Iterator<Item = &Arc<dyn WorkflowExecutorPlugin>> {
        self.plugins.iter().filter_map(|p| match p {
            PluginInstance::WorkflowExecutor(e) => Some(e),
            PluginInstance::NodeHandler(_) => None,
        })
    }

    /// First registered handler whose `can_handle` accepts `node_type`.
    pub fn get_node_handler(&self, node_type: &str) -> Option<Arc<dyn NodeHandlerPlugin>> {
        self.node_handlers().find(|h| h.can_handle(node_type)).cloned()
    }

    pub fn get_workflow_executor(&self) -> Result<Arc<dyn WorkflowExecutorPlugin>, PluginError> {
        self.workflow_executors()
            .next()
            .cloned()
            .ok_or(PluginError::NoExecutorAvailable)
    }

    pub fn list_plugins(&self, kind: PluginKind) -> Vec<PluginMetadata> {
        self.plugins
            .iter()
            .filter(|p| p.kind() == kind)
            .map(|p| p.metadata().clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }
}

impl fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.plugins.iter()).finish()
    }
}
