pub mod catalog;
pub mod manager;
pub mod registry;

pub use catalog::{CatalogEntry, PluginCatalog, PluginFactory};
pub use manager::{LifecycleStage, PluginFailure, PluginManager, PluginStatus};
pub use registry::{PluginInstance, PluginRegistry};
