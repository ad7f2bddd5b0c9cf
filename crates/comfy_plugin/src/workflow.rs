use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

const INPUT_SUFFIX: &str = "Input";

/// Display metadata ComfyUI keeps next to a node.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// One node of an API-format ComfyUI graph.
///
/// Fields the engine understands but this crate does not are kept in `extra`
/// so a graph survives a load/merge/submit cycle unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowNode {
    pub class_type: String,
    #[serde(default)]
    pub inputs: Map<String, Value>,
    #[serde(rename = "_meta", default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<NodeMeta>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl WorkflowNode {
    pub fn new(class_type: impl Into<String>) -> Self {
        Self {
            class_type: class_type.into(),
            inputs: Map::new(),
            meta: None,
            extra: Map::new(),
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.meta.get_or_insert_with(NodeMeta::default).title = Some(title.into());
        self
    }

    pub fn with_input(mut self, key: &str, value: Value) -> Self {
        self.inputs.insert(key.to_string(), value);
        self
    }

    pub fn title(&self) -> Option<&str> {
        self.meta.as_ref().and_then(|m| m.title.as_deref())
    }

    /// Nodes exposed to forms carry a title ending in `Input`.
    pub fn is_input_node(&self) -> bool {
        self.title().is_some_and(|t| t.ends_with(INPUT_SUFFIX))
    }

    /// Form field name derived from the title: `Prompt-Input` becomes `Prompt`.
    pub fn field_name(&self) -> Option<String> {
        let title = self.title()?;
        let stem = title
            .strip_suffix(INPUT_SUFFIX)
            .unwrap_or(title)
            .trim_end_matches(|c: char| c == '-' || c == '_' || c.is_whitespace());
        if stem.is_empty() {
            Some(title.to_string())
        } else {
            Some(stem.to_string())
        }
    }
}

/// API-format graph: node id to node. Ordered by id for stable iteration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Workflow {
    nodes: BTreeMap<String, WorkflowNode>,
}

impl Workflow {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_value(value: Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value)
    }

    pub fn to_value(&self) -> Result<Value, serde_json::Error> {
        serde_json::to_value(self)
    }

    pub fn with_node(mut self, id: impl Into<String>, node: WorkflowNode) -> Self {
        self.nodes.insert(id.into(), node);
        self
    }

    pub fn node(&self, id: &str) -> Option<&WorkflowNode> {
        self.nodes.get(id)
    }

    pub fn node_mut(&mut self, id: &str) -> Option<&mut WorkflowNode> {
        self.nodes.get_mut(id)
    }

    pub fn nodes(&self) -> impl Iterator<Item = (&str, &WorkflowNode)> {
        self.nodes.iter().map(|(id, node)| (id.as_str(), node))
    }

    /// Nodes whose title marks them as form inputs.
    pub fn input_nodes(&self) -> impl Iterator<Item = (&str, &WorkflowNode)> {
        self.nodes().filter(|(_, node)| node.is_input_node())
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}
