// src/plugin/catalog.rs
use comfy_plugin::PluginError;
use tracing::warn;

use crate::{
    comfy::executor::ComfyUiWorkflowExecutor,
    handlers::{image::ImageInputHandler, switch::SwitchInputHandler, text::TextInputHandler},
};

use super::registry::PluginInstance;

pub type PluginFactory = fn() -> Result<PluginInstance, PluginError>;

#[derive(Debug, Clone, Copy)]
pub struct CatalogEntry {
    pub name: &'static str,
    pub factory: PluginFactory,
}

/// The plugins this build can offer, in discovery order.
#[derive(Debug, Clone, Default)]
pub struct PluginCatalog {
    entries: Vec<CatalogEntry>,
}

impl PluginCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: &'static str, factory: PluginFactory) -> Self {
        self.entries.push(CatalogEntry { name, factory });
        self
    }

    /// Image, text and switch handlers followed by the ComfyUI executor.
    pub fn builtin() -> Self {
        Self::new()
            .with(ImageInputHandler::NAME, || {
                Ok(PluginInstance::node_handler(ImageInputHandler::new()))
            })
            .with(TextInputHandler::NAME, || {
                Ok(PluginInstance::node_handler(TextInputHandler::new()))
            })
            .with(SwitchInputHandler::NAME, || {
                Ok(PluginInstance::node_handler(SwitchInputHandler::new()))
            })
            .with(ComfyUiWorkflowExecutor::NAME, || {
                Ok(PluginInstance::workflow_executor(ComfyUiWorkflowExecutor::new()))
            })
    }

    /// Keeps only the named entries, in catalog order. An empty list keeps all.
    pub fn only(self, enabled: &[String]) -> Self {
        if enabled.is_empty() {
            return self;
        }
        for name in enabled {
            if !self.entries.iter().any(|e| e.name == name) {
                warn!("ENABLED_PLUGINS names unknown plugin `{}`", name);
            }
        }
        let entries = self
            .entries
            .into_iter()
            .filter(|e| enabled.iter().any(|name| name == e.name))
            .collect();
        Self { entries }
    }

    pub fn entries(&self) -> &[CatalogEntry] {
        &self.entries
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.entries.iter().map(|e| e.name).collect()
    }
}
