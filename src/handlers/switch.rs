use async_trait::async_trait;
use comfy_plugin::{
    ConfigKeys, FieldType, NodeHandlerPlugin, NodeParams, NodeResult, Plugin, PluginConfig,
    PluginError, PluginKind, PluginMetadata, ValidationError, WorkflowNode,
};
use serde_json::Value;
use tokio::sync::RwLock;

pub const SWITCH_DEFAULT_VALUE: &str = "SWITCH_DEFAULT_VALUE";
const SWITCH_NODE: &str = "Switch any [Crystools]";
const BOOLEAN_KEY: &str = "boolean";

/// Reads a loosely typed flag as sent by HTML forms and JSON clients.
pub fn coerce_bool(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => match n.as_f64() {
            Some(x) if x == 0.0 => Some(false),
            Some(x) if x == 1.0 => Some(true),
            _ => None,
        },
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" | "on" => Some(true),
            "false" | "0" | "no" | "off" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

/// Fills the `boolean` input of Crystools switch nodes.
pub struct SwitchInputHandler {
    metadata: PluginMetadata,
    default_value: RwLock<Option<bool>>,
}

impl SwitchInputHandler {
    pub const NAME: &'static str = "switch_input";

    pub fn new() -> Self {
        Self {
            metadata: PluginMetadata::new(
                Self::NAME,
                env!("CARGO_PKG_VERSION"),
                "Boolean values for Crystools switch nodes",
                "comfyforms",
                PluginKind::NodeHandler,
            ),
            default_value: RwLock::new(None),
        }
    }
}

impl Default for SwitchInputHandler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Plugin for SwitchInputHandler {
    fn metadata(&self) -> &PluginMetadata {
        &self.metadata
    }

    fn config_keys(&self) -> ConfigKeys {
        ConfigKeys::default()
            .optional(SWITCH_DEFAULT_VALUE, "value used when a switch is left empty")
    }

    async fn initialize(&self, config: &PluginConfig) -> Result<(), PluginError> {
        let default_value = match config.get(SWITCH_DEFAULT_VALUE).map(str::trim) {
            None | Some("") => None,
            Some(raw) => {
                let flag = coerce_bool(&Value::from(raw)).ok_or_else(|| PluginError::InvalidConfig {
                    plugin: Self::NAME.to_string(),
                    key: SWITCH_DEFAULT_VALUE.to_string(),
                    message: format!("`{raw}` is not a boolean"),
                })?;
                Some(flag)
            }
        };
        *self.default_value.write().await = default_value;
        Ok(())
    }
}

#[async_trait]
impl NodeHandlerPlugin for SwitchInputHandler {
    fn can_handle(&self, node_type: &str) -> bool {
        node_type == SWITCH_NODE
    }

    fn required_inputs(&self) -> Vec<&'static str> {
        vec![BOOLEAN_KEY]
    }

    fn field_type(&self) -> FieldType {
        FieldType::Boolean
    }

    async fn handle_node(
        &self,
        node_id: &str,
        node: &WorkflowNode,
        params: &NodeParams,
    ) -> Result<NodeResult, PluginError> {
        self.ensure_can_handle(node)?;

        let flag = match params.get(BOOLEAN_KEY) {
            None | Some(Value::Null) => *self.default_value.read().await,
            Some(value) => match coerce_bool(value) {
                Some(flag) => Some(flag),
                None => {
                    return Ok(NodeResult::rejected(ValidationError::new(
                        node_id,
                        BOOLEAN_KEY,
                        format!("`{value}` is not a boolean"),
                    )));
                }
            },
        };

        Ok(match flag {
            Some(flag) => NodeResult::resolved(BOOLEAN_KEY, Value::Bool(flag)),
            None => NodeResult::rejected(ValidationError::new(
                node_id,
                BOOLEAN_KEY,
                "a boolean value is required",
            )),
        })
    }
}
