//! JSON graph document format.
//!
//! ```json
//! {"directed": true, "key_tag": "key", "value_tag": "value", "root": 1,
//!  "attrs": {}, "nodes": [{"id": 1, "attrs": {}}],
//!  "edges": [{"source": 1, "target": 2, "attrs": {}}]}
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use lieflow_core::error::{FlowError, Result};
use lieflow_core::types::{Attrs, NodeId};

use crate::graph::{Graph, DEFAULT_KEY_TAG, DEFAULT_VALUE_TAG};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GraphDocument {
    #[serde(default = "default_directed")]
    pub directed: bool,
    #[serde(default = "default_key_tag")]
    pub key_tag: String,
    #[serde(default = "default_value_tag")]
    pub value_tag: String,
    #[serde(default)]
    pub root: Option<NodeId>,
    #[serde(default)]
    pub attrs: Attrs,
    #[serde(default)]
    pub nodes: Vec<NodeRecord>,
    #[serde(default)]
    pub edges: Vec<EdgeRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeRecord {
    pub id: NodeId,
    #[serde(default)]
    pub attrs: Attrs,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EdgeRecord {
    pub source: NodeId,
    pub target: NodeId,
    #[serde(default)]
    pub attrs: Attrs,
}

fn default_directed() -> bool {
    true
}

fn default_key_tag() -> String {
    DEFAULT_KEY_TAG.to_string()
}

fn default_value_tag() -> String {
    DEFAULT_VALUE_TAG.to_string()
}

impl GraphDocument {
    /// Snapshot a graph. Nodes come out in ascending id order, edges in the
    /// order they were added so adjacency order survives a reload.
    pub fn from_graph(graph: &Graph) -> Self {
        Self {
            directed: graph.is_directed(),
            key_tag: graph.key_tag().to_string(),
            value_tag: graph.value_tag().to_string(),
            root: graph.root(),
            attrs: graph.attrs().clone(),
            nodes: graph
                .nodes()
                .map(|(id, attrs)| NodeRecord {
                    id,
                    attrs: attrs.clone(),
                })
                .collect(),
            edges: graph
                .edges_in_order()
                .map(|((source, target), attrs)| EdgeRecord {
                    source,
                    target,
                    attrs: attrs.clone(),
                })
                .collect(),
        }
    }

    /// Rebuild the graph, rejecting duplicate ids and dangling edges.
    pub fn into_graph(self) -> Result<Graph> {
        let base = if self.directed {
            Graph::new()
        } else {
            Graph::undirected()
        };
        let mut graph = base.with_tags(self.key_tag, self.value_tag);
        *graph.attrs_mut() = self.attrs;

        for node in self.nodes {
            graph.add_node_with_id(node.id, node.attrs)?;
        }
        for edge in self.edges {
            if !graph.contains_node(edge.source) {
                return Err(FlowError::UnknownNode(edge.source));
            }
            if !graph.contains_node(edge.target) {
                return Err(FlowError::UnknownNode(edge.target));
            }
            // Stored verbatim: undirected documents already list both directions
            graph.insert_edge(edge.source, edge.target, edge.attrs);
        }
        if let Some(root) = self.root {
            graph.set_root(root)?;
        }

        debug!(nodes = graph.len(), edges = graph.edge_count(), "Imported graph");
        Ok(graph)
    }
}

pub fn to_json(graph: &Graph) -> Result<String> {
    Ok(serde_json::to_string_pretty(&GraphDocument::from_graph(graph))?)
}

pub fn from_json(json: &str) -> Result<Graph> {
    let doc: GraphDocument = serde_json::from_str(json)?;
    doc.into_graph()
}

pub fn write_file(graph: &Graph, path: &Path) -> Result<()> {
    std::fs::write(path, to_json(graph)?)?;
    Ok(())
}

pub fn read_file(path: &Path) -> Result<Graph> {
    let content = std::fs::read_to_string(path)?;
    from_json(&content)
}
