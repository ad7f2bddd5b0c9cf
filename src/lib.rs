pub mod api;
pub mod apps;
pub mod comfy;
pub mod config;
pub mod handlers;
pub mod logger;
pub mod plugin;
pub mod schema;
pub mod workflow;

pub use comfy_plugin;
