use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use comfyforms::{
    apps::App,
    config::{ConfigManager, EnvConfigManager, SERVICE_KEYS, ServiceSettings},
    logger::{LogConfig, init_tracing},
    plugin::{PluginCatalog, PluginManager},
    schema::write_schema,
    workflow::WorkflowStore,
};
use std::{env, path::PathBuf};
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(
    name = "comfyforms",
    about = "Form-driven web API over ComfyUI workflows",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Serve the HTTP API
    Serve(ServeArgs),

    /// Emit JSON-Schema for the API payloads into `<data>/schemas`
    Schema {
        /// Output directory, defaults to `<data>/schemas`
        #[arg(long)]
        out: Option<PathBuf>,
    },

    /// List the built-in plugins and the config keys they read
    Plugins,

    /// List workflows, or print the form schema of one
    Workflows {
        /// Workflow id
        id: Option<String>,
    },

    /// Read or change settings stored in `<data>/.env`
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigCommands {
    /// Show every key the service and the built-in plugins read
    List,
    Get { key: String },
    Set { key: String, value: String },
    Del { key: String },
}

#[derive(Args, Debug, Default)]
struct ServeArgs {
    /// Log level directive (e.g. error, warn, info, debug, comfyforms=trace)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Write rolling log files under `<data>/logs`
    #[arg(long, default_value_t = false)]
    log_files: bool,

    /// OpenTelemetry OTLP/HTTP endpoint (e.g. http://localhost:4318)
    #[arg(long)]
    otel_endpoint: Option<String>,
}

/// The data directory from `DATA_BASE_PATH`, or `./data`.
pub fn resolve_data_dir() -> PathBuf {
    env::var("DATA_BASE_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("./data"))
}

fn config_manager(data_dir: &std::path::Path) -> ConfigManager {
    ConfigManager(EnvConfigManager::new(data_dir.join(".env")))
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let data_dir = resolve_data_dir();
    match cli.command.unwrap_or(Commands::Serve(ServeArgs {
        log_level: "info".to_string(),
        ..ServeArgs::default()
    })) {
        Commands::Serve(args) => serve(data_dir, args).await,
        Commands::Schema { out } => {
            let out_dir = out.unwrap_or_else(|| data_dir.join("schemas"));
            let written = write_schema(&out_dir)?;
            println!("{} schemas written to {}", written, out_dir.display());
            Ok(())
        }
        Commands::Plugins => {
            let mut plugins = PluginManager::new(PluginCatalog::builtin());
            plugins.discover_and_register_plugins()?;
            for plugin in plugins.registry().plugins() {
                let meta = plugin.metadata();
                println!(
                    "{:<14} {:<18} v{:<8} {}",
                    meta.name, meta.plugin_type, meta.version, meta.description
                );
                let keys = plugin.config_keys();
                for (key, hint) in keys.required_keys {
                    println!("    {key} (required) {}", hint.unwrap_or_default());
                }
                for (key, hint) in keys.optional_keys {
                    println!("    {key} {}", hint.unwrap_or_default());
                }
            }
            Ok(())
        }
        Commands::Workflows { id } => {
            let config = config_manager(&data_dir);
            let settings = ServiceSettings::load(&config).await?;
            let store = WorkflowStore::new(settings.workflows_dir());
            match id {
                None => {
                    for id in store.list().await? {
                        println!("{id}");
                    }
                }
                Some(id) => {
                    let workflow = store.load(&id).await?;
                    let mut plugins = PluginManager::new(PluginCatalog::builtin());
                    plugins.discover_and_register_plugins()?;
                    let schema = comfyforms::workflow::form_schema(&id, &workflow, &plugins);
                    println!("{}", serde_json::to_string_pretty(&schema)?);
                }
            }
            Ok(())
        }
        Commands::Config { command } => run_config(&config_manager(&data_dir), command).await,
    }
}

async fn run_config(config: &ConfigManager, command: ConfigCommands) -> anyhow::Result<()> {
    match command {
        ConfigCommands::List => {
            let mut plugins = PluginManager::new(PluginCatalog::builtin());
            plugins.discover_and_register_plugins()?;
            let plugin_keys = plugins.config_keys();
            let keys = SERVICE_KEYS.into_iter().chain(plugin_keys.iter().map(String::as_str));
            for key in keys {
                match config.get(key).await {
                    Some(value) => println!("{key}={value}"),
                    None => println!("{key} (unset)"),
                }
            }
        }
        ConfigCommands::Get { key } => match config.get(&key).await {
            Some(value) => println!("{value}"),
            None => anyhow::bail!("{key} is not set"),
        },
        ConfigCommands::Set { key, value } => {
            config.set(&key, &value).await?;
            println!("{key} updated");
        }
        ConfigCommands::Del { key } => {
            config.del(&key).await?;
            println!("{key} removed");
        }
    }
    Ok(())
}

async fn serve(data_dir: PathBuf, args: ServeArgs) -> anyhow::Result<()> {
    let log_config = LogConfig {
        log_level: args.log_level,
        log_dir: args.log_files.then(|| data_dir.join("logs")),
        otel_endpoint: args.otel_endpoint,
    };
    let telemetry = init_tracing(&log_config).context("could not set up logging")?;
    info!("comfyforms starting up");

    let config = config_manager(&data_dir);
    let settings = ServiceSettings::load(&config).await?;

    let mut app = App::new();
    if let Err(e) = app.bootstrap(&settings, &config).await {
        error!("failed to start: {:#}", e);
        app.shutdown().await;
        telemetry.shutdown();
        return Err(e);
    }
    println!("comfyforms running; press Ctrl-C to exit");

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    app.shutdown().await;
    telemetry.shutdown();
    Ok(())
}
