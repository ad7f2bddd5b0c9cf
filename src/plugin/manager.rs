// src/plugin/manager.rs
use std::{
    collections::HashSet,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use comfy_plugin::{
    ExecutionHandle, HandlerLookup, NodeHandlerPlugin, PluginConfig, PluginError, PluginKind,
    PluginMetadata, Workflow, WorkflowExecutorPlugin, WorkflowInputs,
};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use strum_macros::Display;
use tokio::sync::Mutex;
use tracing::{debug, error, info, instrument, warn};

use super::{
    catalog::PluginCatalog,
    registry::{PluginInstance, PluginRegistry},
};

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum LifecycleStage {
    Discovery,
    Initialization,
    Cleanup,
}

/// A plugin that failed a lifecycle step. Recorded instead of aborting the run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct PluginFailure {
    pub plugin: String,
    pub stage: LifecycleStage,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct PluginStatus {
    #[serde(flatten)]
    pub metadata: PluginMetadata,
    pub available: bool,
}

/// Owns the registry and drives discovery, initialization and cleanup.
///
/// Discovery and initialization need `&mut self`. Once they ran, the manager is
/// wrapped in an `Arc` and only read from, apart from the one-shot cleanup.
pub struct PluginManager {
    catalog: PluginCatalog,
    registry: PluginRegistry,
    discovered: bool,
    unavailable: HashSet<(PluginKind, String)>,
    failures: Mutex<Vec<PluginFailure>>,
    cleaned_up: AtomicBool,
}

impl PluginManager {
    pub fn new(catalog: PluginCatalog) -> Self {
        Self {
            catalog,
            registry: PluginRegistry::new(),
            discovered: false,
            unavailable: HashSet::new(),
            failures: Mutex::new(Vec::new()),
            cleaned_up: AtomicBool::new(false),
        }
    }

    pub fn with_builtin_plugins() -> Self {
        Self::new(PluginCatalog::builtin())
    }

    /// Instantiates and registers every catalog entry.
    ///
    /// A failing factory or a refused registration is logged and recorded,
    /// and discovery carries on with the next entry. Returns how many plugins
    /// were registered.
    #[instrument(skip(self))]
    pub fn discover_and_register_plugins(&mut self) -> Result<usize, PluginError> {
        if self.discovered {
            return Err(PluginError::AlreadyDiscovered);
        }
        self.discovered = true;

        let mut registered = 0;
        for entry in self.catalog.entries().to_vec() {
            let outcome =
                (entry.factory)().and_then(|plugin| self.registry.register_plugin(plugin));
            match outcome {
                Ok(()) => registered += 1,
                Err(err) => {
                    error!("could not register plugin `{}`: {}", entry.name, err);
                    self.record(entry.name, LifecycleStage::Discovery, &err);
                }
            }
        }
        info!("discovered {} plugin(s)", registered);
        Ok(registered)
    }

    /// Registers an instance directly, outside the catalog.
    pub fn register_plugin(&mut self, plugin: PluginInstance) -> Result<(), PluginError> {
        self.registry.register_plugin(plugin)
    }

    /// Runs `initialize` on every registered plugin in registration order.
    ///
    /// A plugin whose initialization fails is marked unavailable and never
    /// handed out by the lookups below. Returns how many plugins are available.
    #[instrument(skip(self, config))]
    pub async fn initialize_plugins(&mut self, config: &PluginConfig) -> usize {
        let plugins = self.registry.plugins().to_vec();
        for plugin in &plugins {
            match plugin.initialize(config).await {
                Ok(()) => {
                    self.unavailable.remove(&(plugin.kind(), plugin.name().to_string()));
                    debug!("initialized plugin `{}`", plugin.name());
                }
                Err(err) => {
                    let err = match err {
                        PluginError::Initialization { .. } => err,
                        other => PluginError::initialization(plugin.name(), other),
                    };
                    error!("{}", err);
                    self.unavailable.insert((plugin.kind(), plugin.name().to_string()));
                    let name = plugin.name().to_string();
                    self.record(&name, LifecycleStage::Initialization, &err);
                }
            }
        }
        let available = plugins.len() - self.unavailable.len();
        info!("{} of {} plugin(s) available", available, plugins.len());
        available
    }

    /// Runs `cleanup` on every registered plugin, once per manager.
    ///
    /// Every plugin gets its turn even when an earlier one fails. Later calls
    /// return immediately with no failures.
    pub async fn cleanup_plugins(&self) -> Vec<PluginFailure> {
        if self.cleaned_up.swap(true, Ordering::SeqCst) {
            debug!("plugins already cleaned up");
            return Vec::new();
        }

        let mut failed = Vec::new();
        for plugin in self.registry.plugins() {
            if let Err(err) = plugin.cleanup().await {
                warn!("cleanup of plugin `{}` failed: {}", plugin.name(), err);
                failed.push(PluginFailure {
                    plugin: plugin.name().to_string(),
                    stage: LifecycleStage::Cleanup,
                    error: err.to_string(),
                });
            }
        }
        self.failures.lock().await.extend(failed.iter().cloned());
        info!("plugins cleaned up");
        failed
    }

    pub fn is_available(&self, kind: PluginKind, name: &str) -> bool {
        self.registry.contains(kind, name) && !self.unavailable.contains(&(kind, name.to_string()))
    }

    pub fn get_node_handler(&self, node_type: &str) -> Option<Arc<dyn NodeHandlerPlugin>> {
        self.registry
            .node_handlers()
            .filter(|h| self.is_available(PluginKind::NodeHandler, &h.metadata().name))
            .find(|h| h.can_handle(node_type))
            .cloned()
    }

    pub fn get_workflow_executor(&self) -> Result<Arc<dyn WorkflowExecutorPlugin>, PluginError> {
        self.registry
            .workflow_executors()
            .find(|e| self.is_available(PluginKind::WorkflowExecutor, &e.metadata().name))
            .cloned()
            .ok_or(PluginError::NoExecutorAvailable)
    }

    /// Submits `workflow` through the executor, resolving node handlers here.
    pub async fn execute_workflow(
        &self,
        workflow: &Workflow,
        inputs: &WorkflowInputs,
    ) -> Result<ExecutionHandle, PluginError> {
        let executor = self.get_workflow_executor()?;
        executor.execute_workflow(workflow, inputs, self).await
    }

    pub fn list_plugins(&self, kind: PluginKind) -> Vec<PluginMetadata> {
        self.registry.list_plugins(kind)
    }

    pub fn statuses(&self) -> Vec<PluginStatus> {
        self.registry
            .plugins()
            .iter()
            .map(|p| PluginStatus {
                metadata: p.metadata().clone(),
                available: self.is_available(p.kind(), p.name()),
            })
            .collect()
    }

    /// Every config key a registered plugin reads, required ones first.
    pub fn config_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = Vec::new();
        let all = self.registry.plugins().iter().map(|p| p.config_keys());
        let (required, optional): (Vec<_>, Vec<_>) =
            all.map(|k| (k.required_keys, k.optional_keys)).unzip();
        for (key, _) in required.into_iter().flatten().chain(optional.into_iter().flatten()) {
            if !keys.contains(&key) {
                keys.push(key);
            }
        }
        keys
    }

    pub async fn failures(&self) -> Vec<PluginFailure> {
        self.failures.lock().await.clone()
    }

    pub fn registry(&self) -> &PluginRegistry {
        &self.registry
    }

    fn record(&mut self, plugin: &str, stage: LifecycleStage, err: &PluginError) {
        self.failures.get_mut().push(PluginFailure {
            plugin: plugin.to_string(),
            stage,
            error: err.to_string(),
        });
    }
}

impl HandlerLookup for PluginManager {
    fn node_handler(&self, node_type: &str) -> Option<Arc<dyn NodeHandlerPlugin>> {
        self.get_node_handler(node_type)
    }
}

impl std::fmt::Debug for PluginManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginManager")
            .field("registry", &self.registry)
            .field("unavailable", &self.unavailable)
            .finish()
    }
}
