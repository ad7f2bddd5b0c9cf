use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use comfy_plugin::{
    ConfigKeys, FieldType, NodeHandlerPlugin, NodeParams, NodeResult, Plugin, PluginConfig,
    PluginError, PluginKind, PluginMetadata, ValidationError, WorkflowNode,
};
use serde_json::Value;
use tracing::debug;

pub const TEXT_MAX_LENGTH: &str = "TEXT_MAX_LENGTH";
const DEFAULT_MAX_LENGTH: usize = 1000;
const TEXT_KEY: &str = "text";

/// Fills `text` inputs of prompt nodes.
pub struct TextInputHandler {
    metadata: PluginMetadata,
    max_length: AtomicUsize,
}

impl TextInputHandler {
    pub const NAME: &'static str = "text_input";

    pub fn new() -> Self {
        Self {
            metadata: PluginMetadata::new(
                Self::NAME,
                env!("CARGO_PKG_VERSION"),
                "Plain text values for Text and CLIPTextEncode nodes",
                "comfyforms",
                PluginKind::NodeHandler,
            ),
            max_length: AtomicUsize::new(DEFAULT_MAX_LENGTH),
        }
    }

    pub fn max_length(&self) -> usize {
        self.max_length.load(Ordering::Relaxed)
    }
}

impl Default for TextInputHandler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Plugin for TextInputHandler {
    fn metadata(&self) -> &PluginMetadata {
        &self.metadata
    }

    fn config_keys(&self) -> ConfigKeys {
        ConfigKeys::default()
            .optional(TEXT_MAX_LENGTH, "longest accepted text, in characters (1000)")
    }

    async fn initialize(&self, config: &PluginConfig) -> Result<(), PluginError> {
        let max_length = config
            .parse::<usize>(Self::NAME, TEXT_MAX_LENGTH)?
            .unwrap_or(DEFAULT_MAX_LENGTH);
        self.max_length.store(max_length, Ordering::Relaxed);
        debug!("text handler accepts up to {} characters", max_length);
        Ok(())
    }
}

#[async_trait]
impl NodeHandlerPlugin for TextInputHandler {
    fn can_handle(&self, node_type: &str) -> bool {
        node_type == "Text" || node_type == "CLIPTextEncode"
    }

    fn required_inputs(&self) -> Vec<&'static str> {
        vec![TEXT_KEY]
    }

    fn field_type(&self) -> FieldType {
        FieldType::Text
    }

    async fn handle_node(
        &self,
        node_id: &str,
        node: &WorkflowNode,
        params: &NodeParams,
    ) -> Result<NodeResult, PluginError> {
        self.ensure_can_handle(node)?;

        let reject = |message: String| -> Result<NodeResult, PluginError> {
            Ok(NodeResult::rejected(ValidationError::new(node_id, TEXT_KEY, message)))
        };
        let text = match params.get(TEXT_KEY) {
            None | Some(Value::Null) => return reject("a text value is required".into()),
            Some(Value::String(s)) => s.clone(),
            Some(Value::Number(n)) => n.to_string(),
            Some(Value::Bool(b)) => b.to_string(),
            Some(_) => return reject("expected plain text".into()),
        };
        if text.trim().is_empty() {
            return reject("a text value is required".into());
        }
        let max_length = self.max_length();
        let length = text.chars().count();
        if length > max_length {
            return reject(format!("text is {length} characters, the limit is {max_length}"));
        }

        Ok(NodeResult::resolved(TEXT_KEY, Value::String(text)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn params(value: Value) -> NodeParams {
        let mut params = NodeParams::new();
        params.insert(TEXT_KEY.into(), value);
        params
    }

    fn node() -> WorkflowNode {
        WorkflowNode::new("Text").with_title("Prompt-Input").with_input("text", json!(""))
    }

    #[tokio::test]
    async fn resolves_text() {
        let handler = TextInputHandler::new();
        let result = handler.handle_node("6", &node(), &params(json!("hello"))).await.unwrap();
        assert_eq!(result, NodeResult::resolved("text", json!("hello")));

        let result = handler.handle_node("6", &node(), &params(json!(42))).await.unwrap();
        assert_eq!(result, NodeResult::resolved("text", json!("42")));
    }

    #[tokio::test]
    async fn rejects_missing_and_oversized_text() {
        let handler = TextInputHandler::new();
        handler
            .initialize(&PluginConfig::new().with(TEXT_MAX_LENGTH, "5"))
            .await
            .unwrap();

        let missing = handler.handle_node("6", &node(), &NodeParams::new()).await.unwrap();
        assert!(!missing.is_resolved());

        let long = handler.handle_node("6", &node(), &params(json!("too long"))).await.unwrap();
        match long {
            NodeResult::Rejected(errors) => {
                assert_eq!(errors[0].node_id, "6");
                assert!(errors[0].message.contains("limit is 5"));
            }
            other => panic!("expected rejection, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn bad_limit_fails_initialization() {
        let handler = TextInputHandler::new();
        let err = handler
            .initialize(&PluginConfig::new().with(TEXT_MAX_LENGTH, "-3"))
            .await
            .unwrap_err();
        assert!(matches!(err, PluginError::InvalidConfig { .. }));
    }

    #[tokio::test]
    async fn refuses_foreign_nodes() {
        let handler = TextInputHandler::new();
        let err = handler
            .handle_node("9", &WorkflowNode::new("LoadImageOutput"), &params(json!("x")))
            .await
            .unwrap_err();
        assert!(matches!(err, PluginError::UnsupportedNodeType { .. }));
        assert!(handler.can_handle("CLIPTextEncode"));
    }
}
