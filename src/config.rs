use anyhow::Context;
use async_trait::async_trait;
use comfy_plugin::PluginConfig;
use dashmap::DashMap;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::{env, fs, net::SocketAddr, path::PathBuf};
use tracing::{info, warn};

use crate::{
    comfy::{COMFY_OUTPUT_DIR, COMFY_SERVER_ADDRESS},
    handlers::image::IMAGE_INPUT_DIR,
};

pub const COMFY_FORMS_ADDR: &str = "COMFY_FORMS_ADDR";
pub const DATA_BASE_PATH: &str = "DATA_BASE_PATH";
pub const ENABLED_PLUGINS: &str = "ENABLED_PLUGINS";

/// Keys the service reads for itself, next to the ones plugins declare.
pub const SERVICE_KEYS: [&str; 3] = [COMFY_FORMS_ADDR, DATA_BASE_PATH, ENABLED_PLUGINS];

const DEFAULT_ADDR: &str = "0.0.0.0:8000";
const DEFAULT_DATA_DIR: &str = "./data";
const DEFAULT_COMFY_ADDRESS: &str = "127.0.0.1:8188";

#[async_trait]
pub trait ConfigManagerType: Send + Sync {
    async fn get(&self, key: &str) -> Option<String>;
    async fn set(&self, key: &str, value: &str) -> anyhow::Result<()>;
    async fn del(&self, key: &str) -> anyhow::Result<()>;
    fn describe(&self) -> String;
}

/// Source of every setting: process environment backed by a `.env` file in
/// production, an in-memory map in tests.
pub struct ConfigManager(pub Box<dyn ConfigManagerType>);

impl ConfigManager {
    pub async fn get(&self, key: &str) -> Option<String> {
        self.0.get(key).await
    }

    pub async fn set(&self, key: &str, value: &str) -> anyhow::Result<()> {
        self.0.set(key, value).await
    }

    pub async fn del(&self, key: &str) -> anyhow::Result<()> {
        self.0.del(key).await
    }

    /// Collects the values of `keys` that are set into a `PluginConfig`.
    pub async fn plugin_config<'a>(
        &self,
        keys: impl IntoIterator<Item = &'a str>,
    ) -> PluginConfig {
        let mut config = PluginConfig::new();
        for key in keys {
            if let Some(value) = self.0.get(key).await {
                config.insert(key, &value);
            }
        }
        config
    }
}

impl std::fmt::Debug for ConfigManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0.describe())
    }
}

/// Reads the process environment after loading `env_file` into it.
///
/// Changes are written back to `env_file` and kept in an overlay for the rest
/// of the process. The environment itself is never modified after startup.
#[derive(Debug)]
pub struct EnvConfigManager {
    env_file: PathBuf,
    /// `None` marks a deleted key.
    overrides: DashMap<String, Option<String>>,
}

impl EnvConfigManager {
    pub fn new(env_file: PathBuf) -> Box<Self> {
        if env_file.exists() {
            dotenvy::from_path(&env_file).ok();
            info!("loaded settings from {}", env_file.display());
        } else {
            warn!("no settings file at {}, using the environment only", env_file.display())
        }

        Box::new(Self {
            env_file,
            overrides: DashMap::new(),
        })
    }

    fn rewrite(&self, key: &str, value: Option<&str>) -> anyhow::Result<()> {
        let content = fs::read_to_string(&self.env_file).unwrap_or_default();
        let mut found = false;
        let mut lines: Vec<String> = Vec::new();
        for line in content.lines() {
            match line.split_once('=') {
                Some((k, _)) if k.trim() == key => {
                    found = true;
                    if let Some(value) = value {
                        lines.push(format!("{key}={value}"));
                    }
                }
                _ => lines.push(line.to_string()),
            }
        }
        if let (false, Some(value)) = (found, value) {
            lines.push(format!("{key}={value}"));
        }
        if let Some(parent) = self.env_file.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("cannot create {}", parent.display()))?;
        }
        fs::write(&self.env_file, lines.join("\n"))
            .with_context(|| format!("cannot write {}", self.env_file.display()))
    }
}

#[async_trait]
impl ConfigManagerType for EnvConfigManager {
    async fn get(&self, key: &str) -> Option<String> {
        match self.overrides.get(key) {
            Some(value) => value.clone(),
            None => env::var(key).ok(),
        }
    }

    async fn set(&self, key: &str, value: &str) -> anyhow::Result<()> {
        self.rewrite(key, Some(value))?;
        self.overrides.insert(key.to_string(), Some(value.to_string()));
        Ok(())
    }

    async fn del(&self, key: &str) -> anyhow::Result<()> {
        self.rewrite(key, None)?;
        self.overrides.insert(key.to_string(), None);
        Ok(())
    }

    fn describe(&self) -> String {
        format!("EnvConfigManager({})", self.env_file.display())
    }
}

#[derive(Debug, Default)]
pub struct MapConfigManager {
    map: DashMap<String, String>,
}

impl MapConfigManager {
    pub fn new() -> Box<Self> {
        Box::new(Self::default())
    }

    pub fn from_pairs<'a>(pairs: impl IntoIterator<Item = (&'a str, &'a str)>) -> Box<Self> {
        let map = pairs
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Box::new(Self { map })
    }
}

#[async_trait]
impl ConfigManagerType for MapConfigManager {
    async fn get(&self, key: &str) -> Option<String> {
        self.map.get(key).map(|v| v.clone())
    }

    async fn set(&self, key: &str, value: &str) -> anyhow::Result<()> {
        self.map.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn del(&self, key: &str) -> anyhow::Result<()> {
        self.map.remove(key);
        Ok(())
    }

    fn describe(&self) -> String {
        format!("MapConfigManager({} entries)", self.map.len())
    }
}

/// Settings of the web service itself, resolved once at startup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ServiceSettings {
    pub listen_addr: SocketAddr,
    pub data_dir: PathBuf,
    /// Plugin names to load. Empty loads every built-in plugin.
    pub enabled_plugins: Vec<String>,
}

impl ServiceSettings {
    pub async fn load(config: &ConfigManager) -> anyhow::Result<Self> {
        let addr = config
            .get(COMFY_FORMS_ADDR)
            .await
            .unwrap_or_else(|| DEFAULT_ADDR.to_string());
        let listen_addr = addr.parse().map_err(|e| {
            anyhow::anyhow!("{COMFY_FORMS_ADDR}={addr} is not a socket address: {e}")
        })?;
        let data_dir = config
            .get(DATA_BASE_PATH)
            .await
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_DIR));
        let enabled_plugins = config
            .get(ENABLED_PLUGINS)
            .await
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        Ok(Self {
            listen_addr,
            data_dir,
            enabled_plugins,
        })
    }

    pub fn workflows_dir(&self) -> PathBuf {
        self.data_dir.join("workflows")
    }

    pub fn uploads_dir(&self) -> PathBuf {
        self.data_dir.join("uploads")
    }

    pub fn output_dir(&self) -> PathBuf {
        self.data_dir.join("comfy_output")
    }

    /// Plugin settings. The ComfyUI address, the output directory and the
    /// image input directory are defaulted when the environment leaves them out.
    pub async fn plugin_config<'a>(
        &self,
        config: &ConfigManager,
        keys: impl IntoIterator<Item = &'a str>,
    ) -> PluginConfig {
        let mut plugin_config = config.plugin_config(keys).await;
        let defaults = [
            (COMFY_SERVER_ADDRESS, DEFAULT_COMFY_ADDRESS.to_string()),
            (COMFY_OUTPUT_DIR, self.output_dir().to_string_lossy().into_owned()),
            (IMAGE_INPUT_DIR, self.uploads_dir().to_string_lossy().into_owned()),
        ];
        for (key, value) in defaults {
            if plugin_config.get(key).is_none() {
                plugin_config.insert(key, &value);
            }
        }
        plugin_config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::write;
    use tempfile::{TempDir, tempdir};

    #[tokio::test]
    async fn map_config_manager_basic() {
        let mgr = ConfigManager(MapConfigManager::new());

        mgr.set("foo", "bar").await.unwrap();
        assert_eq!(mgr.get("foo").await, Some("bar".to_string()));

        mgr.set("foo", "baz").await.unwrap();
        assert_eq!(mgr.get("foo").await, Some("baz".to_string()));

        mgr.del("foo").await.unwrap();
        assert_eq!(mgr.get("foo").await, None);
    }

    #[tokio::test]
    async fn env_config_manager_set_and_delete() {
        let key = "COMFYFORMS_TEST_ENV_VAR";
        let tmp = TempDir::new().unwrap();
        let env_file = tmp.path().join(".env");
        write(&env_file, "OTHER=1\n").unwrap();

        let mgr = EnvConfigManager::new(env_file.clone());
        mgr.set(key, "secret").await.unwrap();
        assert_eq!(mgr.get(key).await, Some("secret".to_string()));
        assert_eq!(std::env::var(key).ok(), None);
        let content = fs::read_to_string(&env_file).unwrap();
        assert_eq!(content, "OTHER=1\nCOMFYFORMS_TEST_ENV_VAR=secret");

        mgr.set(key, "rotated").await.unwrap();
        let content = fs::read_to_string(&env_file).unwrap();
        assert_eq!(content, "OTHER=1\nCOMFYFORMS_TEST_ENV_VAR=rotated");

        mgr.del(key).await.unwrap();
        assert_eq!(mgr.get(key).await, None);
        assert_eq!(fs::read_to_string(&env_file).unwrap(), "OTHER=1");
    }

    #[tokio::test]
    async fn env_config_manager_deletes_hide_loaded_values() {
        let dir = tempdir().unwrap();
        let env_path = dir.path().join(".env");
        write(&env_path, "COMFYFORMS_TEST_HIDDEN=yes\n").unwrap();

        let mgr = EnvConfigManager::new(env_path.clone());
        assert_eq!(mgr.get("COMFYFORMS_TEST_HIDDEN").await, Some("yes".to_string()));
        mgr.del("COMFYFORMS_TEST_HIDDEN").await.unwrap();
        assert_eq!(mgr.get("COMFYFORMS_TEST_HIDDEN").await, None);
        assert_eq!(fs::read_to_string(&env_path).unwrap(), "");
    }

    #[tokio::test]
    async fn env_config_manager_creates_a_missing_env_file() {
        let dir = tempdir().unwrap();
        let env_path = dir.path().join("data").join(".env");

        let mgr = EnvConfigManager::new(env_path.clone());
        mgr.set("COMFYFORMS_TEST_FRESH", "1").await.unwrap();
        assert_eq!(fs::read_to_string(&env_path).unwrap(), "COMFYFORMS_TEST_FRESH=1");
    }

    #[tokio::test]
    async fn env_config_manager_reads_env_file() {
        let dir = tempdir().unwrap();
        let env_path = dir.path().join(".env");
        write(&env_path, "COMFYFORMS_TEST_API_KEY=abc123\n").unwrap();

        let mgr = EnvConfigManager::new(env_path);
        assert_eq!(mgr.get("COMFYFORMS_TEST_API_KEY").await, Some("abc123".to_string()));
    }

    #[tokio::test]
    async fn service_settings_defaults() {
        let config = ConfigManager(MapConfigManager::new());
        let settings = ServiceSettings::load(&config).await.unwrap();
        assert_eq!(settings.listen_addr, "0.0.0.0:8000".parse().unwrap());
        assert_eq!(settings.workflows_dir(), PathBuf::from("./data/workflows"));
        assert!(settings.enabled_plugins.is_empty());

        let plugin_config = settings.plugin_config(&config, ["TEXT_MAX_LENGTH"]).await;
        assert_eq!(plugin_config.get("COMFY_SERVER_ADDRESS"), Some("127.0.0.1:8188"));
        assert_eq!(plugin_config.get("COMFY_OUTPUT_DIR"), Some("./data/comfy_output"));
        assert_eq!(plugin_config.get("IMAGE_INPUT_DIR"), Some("./data/uploads"));
        assert_eq!(plugin_config.get("TEXT_MAX_LENGTH"), None);
    }

    #[tokio::test]
    async fn service_settings_from_config() {
        let config = ConfigManager(MapConfigManager::from_pairs([
            (COMFY_FORMS_ADDR, "127.0.0.1:9000"),
            (DATA_BASE_PATH, "/srv/forms"),
            (ENABLED_PLUGINS, "text_input, comfyui,"),
            ("TEXT_MAX_LENGTH", "50"),
        ]));
        let settings = ServiceSettings::load(&config).await.unwrap();
        assert_eq!(settings.enabled_plugins, vec!["text_input", "comfyui"]);
        assert_eq!(settings.uploads_dir(), PathBuf::from("/srv/forms/uploads"));

        let plugin_config = settings.plugin_config(&config, ["TEXT_MAX_LENGTH"]).await;
        assert_eq!(plugin_config.get("TEXT_MAX_LENGTH"), Some("50"));
        assert_eq!(plugin_config.get("IMAGE_INPUT_DIR"), Some("/srv/forms/uploads"));

        let bad = ConfigManager(MapConfigManager::from_pairs([(COMFY_FORMS_ADDR, "nowhere")]));
        assert!(ServiceSettings::load(&bad).await.is_err());
    }
}
