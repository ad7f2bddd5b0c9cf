// src/apps.rs
use std::{net::SocketAddr, sync::Arc};

use anyhow::{Context, Error, Result};
use tokio::{net::TcpListener, sync::oneshot, task::JoinHandle};
use tracing::{error, info, warn};

use crate::{
    api::{AppState, router},
    config::{ConfigManager, ServiceSettings},
    logger::RequestTelemetry,
    plugin::{PluginCatalog, PluginManager},
    workflow::WorkflowStore,
};

/// The running service: plugins plus the HTTP server in front of them.
pub struct App {
    plugins: Option<Arc<PluginManager>>,
    server_task: Option<JoinHandle<()>>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    local_addr: Option<SocketAddr>,
}

impl App {
    pub fn new() -> Self {
        Self {
            plugins: None,
            server_task: None,
            shutdown_tx: None,
            local_addr: None,
        }
    }

    /// Loads the enabled built-in plugins and starts serving.
    /// Returns the address the server listens on.
    pub async fn bootstrap(
        &mut self,
        settings: &ServiceSettings,
        config: &ConfigManager,
    ) -> Result<SocketAddr, Error> {
        let catalog = PluginCatalog::builtin().only(&settings.enabled_plugins);
        let plugins = load_plugins(catalog, settings, config).await?;
        match self.start(settings, plugins.clone()).await {
            Ok(addr) => Ok(addr),
            Err(e) => {
                plugins.cleanup_plugins().await;
                Err(e)
            }
        }
    }

    /// Serves the API over an already prepared plugin manager.
    pub async fn start(
        &mut self,
        settings: &ServiceSettings,
        plugins: Arc<PluginManager>,
    ) -> Result<SocketAddr, Error> {
        for dir in [settings.workflows_dir(), settings.uploads_dir()] {
            tokio::fs::create_dir_all(&dir)
                .await
                .with_context(|| format!("cannot create {}", dir.display()))?;
        }
        check_engine(&plugins).await;

        let state = AppState {
            plugins: plugins.clone(),
            workflows: Arc::new(WorkflowStore::new(settings.workflows_dir())),
            uploads_dir: settings.uploads_dir(),
            telemetry: RequestTelemetry::new(),
        };
        let listener = TcpListener::bind(settings.listen_addr)
            .await
            .with_context(|| format!("cannot listen on {}", settings.listen_addr))?;
        let local_addr = listener.local_addr()?;

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let app = router(state);
        let server_task = tokio::spawn(async move {
            let server = axum::serve(listener, app).with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            });
            if let Err(e) = server.await {
                error!("HTTP server stopped: {}", e);
            }
        });
        info!("listening on http://{}", local_addr);

        self.plugins = Some(plugins);
        self.server_task = Some(server_task);
        self.shutdown_tx = Some(shutdown_tx);
        self.local_addr = Some(local_addr);
        Ok(local_addr)
    }

    /// Stops the server, waits for in-flight requests, then cleans up plugins.
    pub async fn shutdown(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.server_task.take() {
            if let Err(e) = task.await {
                error!("HTTP server task failed: {}", e);
            }
        }
        if let Some(plugins) = self.plugins.take() {
            let failures = plugins.cleanup_plugins().await;
            if !failures.is_empty() {
                warn!("{} plugin(s) failed to clean up", failures.len());
            }
        }
        info!("shut down");
    }

    pub fn plugin_manager(&self) -> Option<Arc<PluginManager>> {
        self.plugins.clone()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }
}

impl Default for App {
    fn default() -> Self {
        Self::new()
    }
}

/// Discovers and initializes `catalog`, then freezes the manager.
pub async fn load_plugins(
    catalog: PluginCatalog,
    settings: &ServiceSettings,
    config: &ConfigManager,
) -> Result<Arc<PluginManager>, Error> {
    let mut plugins = PluginManager::new(catalog);
    plugins.discover_and_register_plugins()?;
    let keys = plugins.config_keys();
    let plugin_config = settings.plugin_config(config, keys.iter().map(String::as_str)).await;
    plugins.initialize_plugins(&plugin_config).await;
    Ok(Arc::new(plugins))
}

/// Logs whether the workflow engine answers. Never fails startup.
async fn check_engine(plugins: &PluginManager) {
    match plugins.get_workflow_executor() {
        Ok(executor) => {
            let health = executor.health().await;
            if health.is_connected() {
                info!("workflow engine reachable");
            } else {
                warn!(
                    "workflow engine not reachable ({}): executions will fail until it is up",
                    health.error.unwrap_or_else(|| health.status.to_string())
                );
            }
        }
        Err(e) => warn!("{}: executions are unavailable", e),
    }
}
