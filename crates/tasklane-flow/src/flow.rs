use std::collections::{BTreeMap, HashSet};
use std::path::Path;

use serde::{Deserialize, Serialize};

use tasklane_core::error::{Result, TasklaneError};

use crate::edge::Edge;
use crate::node::{Node, NodeKind};

/// A directed graph of nodes and edges. Immutable once built.
///
/// Construction and loading validate the graph, so every edge endpoint and
/// the start node are known to exist during traversal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Flow {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_version")]
    pub version: String,
    pub nodes: BTreeMap<String, Node>,
    #[serde(default)]
    pub edges: Vec<Edge>,
    pub start_node: String,
}

fn default_version() -> String {
    "1.0.0".to_string()
}

impl Flow {
    pub fn builder(name: impl Into<String>) -> FlowBuilder {
        FlowBuilder {
            name: name.into(),
            description: String::new(),
            version: default_version(),
            nodes: Vec::new(),
            edges: Vec::new(),
            start_node: None,
        }
    }

    /// Check the structural invariants of the graph.
    pub fn validate(&self) -> Result<()> {
        if !self.nodes.contains_key(&self.start_node) {
            return Err(invalid(format!(
                "start node '{}' does not exist",
                self.start_node
            )));
        }

        for (key, node) in &self.nodes {
            if *key != node.id {
                return Err(invalid(format!(
                    "node registered as '{}' has id '{}'",
                    key, node.id
                )));
            }
            if let NodeKind::Decision { choices, .. } = &node.kind {
                if choices.is_empty() {
                    return Err(invalid(format!("decision node '{}' has no choices", node.id)));
                }
            }
        }

        for edge in &self.edges {
            for endpoint in [&edge.from, &edge.to] {
                if !self.nodes.contains_key(endpoint) {
                    return Err(invalid(format!(
                        "edge {} -> {} references unknown node '{}'",
                        edge.from, edge.to, endpoint
                    )));
                }
            }
        }

        Ok(())
    }

    pub fn from_json(text: &str) -> Result<Self> {
        let flow: Flow = serde_json::from_str(text).map_err(|e| invalid(e.to_string()))?;
        flow.validate()?;
        Ok(flow)
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        let flow: Flow = toml::from_str(text).map_err(|e| invalid(e.to_string()))?;
        flow.validate()?;
        Ok(flow)
    }

    /// Load a flow file. `.toml` files are parsed as TOML, anything else as JSON.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => Self::from_toml(&text),
            _ => Self::from_json(&text),
        }
    }

    pub fn to_json_pretty(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.get(id)
    }

    /// Outgoing edges of a node in declaration order.
    pub fn outgoing(&self, id: &str) -> Vec<&Edge> {
        self.edges.iter().filter(|e| e.from == id).collect()
    }
}

fn invalid(message: String) -> TasklaneError {
    TasklaneError::InvalidFlow(message)
}

/// Builder that validates the graph on `build`.
pub struct FlowBuilder {
    name: String,
    description: String,
    version: String,
    nodes: Vec<Node>,
    edges: Vec<Edge>,
    start_node: Option<String>,
}

impl FlowBuilder {
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    pub fn node(mut self, node: Node) -> Self {
        self.nodes.push(node);
        self
    }

    pub fn edge(mut self, edge: Edge) -> Self {
        self.edges.push(edge);
        self
    }

    /// Entry node. Defaults to the first `start` node added.
    pub fn start(mut self, id: impl Into<String>) -> Self {
        self.start_node = Some(id.into());
        self
    }

    pub fn build(self) -> Result<Flow> {
        let mut seen = HashSet::new();
        for node in &self.nodes {
            if !seen.insert(node.id.as_str()) {
                return Err(invalid(format!("duplicate node id '{}'", node.id)));
            }
        }

        let start_node = self
            .start_node
            .or_else(|| {
                self.nodes
                    .iter()
                    .find(|n| n.kind == NodeKind::Start)
                    .map(|n| n.id.clone())
            })
            .ok_or_else(|| invalid("flow has no start node".to_string()))?;

        let flow = Flow {
            name: self.name,
            description: self.description,
            version: self.version,
            nodes: self.nodes.into_iter().map(|n| (n.id.clone(), n)).collect(),
            edges: self.edges,
            start_node,
        };
        flow.validate()?;
        Ok(flow)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn linear() -> Flow {
        Flow::builder("linear")
            .node(Node::start("start"))
            .node(Node::selector("pick"))
            .node(Node::end("end"))
            .edge(Edge::new("start", "pick"))
            .edge(Edge::new("pick", "end"))
            .build()
            .unwrap()
    }

    #[test]
    fn test_builder_defaults() {
        let flow = linear();
        assert_eq!(flow.start_node, "start");
        assert_eq!(flow.version, "1.0.0");
        assert_eq!(flow.nodes.len(), 3);
        assert_eq!(flow.outgoing("start").len(), 1);
        assert!(flow.outgoing("end").is_empty());
    }

    #[test]
    fn test_rejects_dangling_edge() {
        let err = Flow::builder("bad")
            .node(Node::start("start"))
            .edge(Edge::new("start", "ghost"))
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("ghost"));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_rejects_duplicate_and_missing_start() {
        assert!(Flow::builder("dup")
            .node(Node::start("a"))
            .node(Node::end("a"))
            .build()
            .is_err());
        assert!(Flow::builder("nostart").node(Node::end("end")).build().is_err());
        assert!(Flow::builder("wrongstart")
            .node(Node::start("start"))
            .start("elsewhere")
            .build()
            .is_err());
    }

    #[test]
    fn test_rejects_empty_choices() {
        let err = Flow::builder("d")
            .node(Node::start("start"))
            .node(Node::decision("check", "?").with_choices(&[]))
            .build()
            .unwrap_err();
        assert!(matches!(err, TasklaneError::InvalidFlow(_)));
    }

    #[test]
    fn test_mismatched_map_key() {
        let mut flow = linear();
        let node = flow.nodes.remove("pick").unwrap();
        flow.nodes.insert("other".into(), node);
        assert!(flow.validate().is_err());
    }

    #[test]
    fn test_json_roundtrip_keeps_structure() {
        let flow = linear();
        let text = flow.to_json_pretty().unwrap();
        assert!(text.contains("\"start_node\": \"start\""));
        assert_eq!(Flow::from_json(&text).unwrap(), flow);
    }

    #[test]
    fn test_from_toml() {
        let flow = Flow::from_toml(
            r#"
name = "tiny"
start_node = "start"

[nodes.start]
id = "start"
kind = "start"

[nodes.check]
id = "check"
kind = "decision"
prompt = "Anything left?"
policy = { type = "local_predicate", predicate = "hasCurrentStep" }

[nodes.end]
id = "end"
kind = "end"

[[edges]]
from = "start"
to = "check"

[[edges]]
from = "check"
to = "end"
condition = "not(hasCurrentStep)"
"#,
        )
        .unwrap();
        assert_eq!(flow.version, "1.0.0");
        assert_eq!(flow.node("check").map(|n| n.kind.name()), Some("decision"));
        assert!(flow.edges[1].condition.is_some());
    }

    #[test]
    fn test_bad_condition_fails_load() {
        let err = Flow::from_json(
            r#"{"name":"x","start_node":"s","nodes":{"s":{"id":"s","kind":"start"}},
                "edges":[{"from":"s","to":"s","condition":"context.getCurrentStep()"}]}"#,
        )
        .unwrap_err();
        assert!(matches!(err, TasklaneError::InvalidFlow(_)));
    }
}
