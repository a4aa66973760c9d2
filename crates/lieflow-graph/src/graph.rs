use std::collections::BTreeMap;

use serde_json::Value;
use tracing::{debug, warn};

use lieflow_core::error::{FlowError, Result};
use lieflow_core::types::{Attrs, NodeId};

use crate::query::{Predicate, Query, Scope};

pub const DEFAULT_KEY_TAG: &str = "key";
pub const DEFAULT_VALUE_TAG: &str = "value";

/// Edge identifier: (source, target).
pub type EdgeId = (NodeId, NodeId);

/// Mutable attribute graph.
///
/// Nodes and edges live in ordered maps keyed by stable ids. The successor
/// and predecessor indexes are only ever touched together with the edge map,
/// so they always describe exactly the stored edge set. `edge_order` keeps
/// edges in insertion order, which fixes the order of `children` and
/// `parents` when a graph is rebuilt from a document.
#[derive(Debug, Clone)]
pub struct Graph {
    nodes: BTreeMap<NodeId, Attrs>,
    edges: BTreeMap<EdgeId, Attrs>,
    edge_order: Vec<EdgeId>,
    successors: BTreeMap<NodeId, Vec<NodeId>>,
    predecessors: BTreeMap<NodeId, Vec<NodeId>>,
    root: Option<NodeId>,
    directed: bool,
    key_tag: String,
    value_tag: String,
    attrs: Attrs,
    next_id: NodeId,
}

impl Graph {
    /// Empty directed graph.
    pub fn new() -> Self {
        Self {
            nodes: BTreeMap::new(),
            edges: BTreeMap::new(),
            edge_order: Vec::new(),
            successors: BTreeMap::new(),
            predecessors: BTreeMap::new(),
            root: None,
            directed: true,
            key_tag: DEFAULT_KEY_TAG.to_string(),
            value_tag: DEFAULT_VALUE_TAG.to_string(),
            attrs: Attrs::new(),
            next_id: 1,
        }
    }

    /// Empty undirected graph: every edge is stored in both directions.
    pub fn undirected() -> Self {
        Self {
            directed: false,
            ..Self::new()
        }
    }

    /// Set the attribute keys used for name lookup and primary payload.
    pub fn with_tags(mut self, key_tag: impl Into<String>, value_tag: impl Into<String>) -> Self {
        self.key_tag = key_tag.into();
        self.value_tag = value_tag.into();
        self
    }

    pub fn is_directed(&self) -> bool {
        self.directed
    }

    pub fn key_tag(&self) -> &str {
        &self.key_tag
    }

    pub fn value_tag(&self) -> &str {
        &self.value_tag
    }

    pub fn root(&self) -> Option<NodeId> {
        self.root
    }

    pub fn set_root(&mut self, nid: NodeId) -> Result<()> {
        self.ensure_node(nid)?;
        self.root = Some(nid);
        Ok(())
    }

    /// Graph-level attributes (title, description, project settings).
    pub fn attrs(&self) -> &Attrs {
        &self.attrs
    }

    pub fn attrs_mut(&mut self) -> &mut Attrs {
        &mut self.attrs
    }

    // ── Nodes ───────────────────────────────────────────────────

    /// Add a node with an auto-assigned id.
    pub fn add_node(&mut self, attrs: Attrs) -> NodeId {
        let nid = self.next_id;
        self.insert_node(nid, attrs);
        nid
    }

    /// Add a node under an explicit id. Never overwrites.
    pub fn add_node_with_id(&mut self, nid: NodeId, attrs: Attrs) -> Result<NodeId> {
        if self.nodes.contains_key(&nid) {
            return Err(FlowError::DuplicateNode(nid));
        }
        self.insert_node(nid, attrs);
        Ok(nid)
    }

    fn insert_node(&mut self, nid: NodeId, attrs: Attrs) {
        self.nodes.insert(nid, attrs);
        self.successors.insert(nid, Vec::new());
        self.predecessors.insert(nid, Vec::new());
        self.next_id = self.next_id.max(nid.saturating_add(1));
        debug!(nid, "Added node");
    }

    /// Remove a node together with every edge that touches it.
    pub fn remove_node(&mut self, nid: NodeId) -> Result<Attrs> {
        self.ensure_node(nid)?;

        let outgoing = self.successors.remove(&nid).unwrap_or_default();
        let incoming = self.predecessors.remove(&nid).unwrap_or_default();
        for dst in &outgoing {
            self.edges.remove(&(nid, *dst));
            if let Some(preds) = self.predecessors.get_mut(dst) {
                preds.retain(|p| *p != nid);
            }
        }
        for src in &incoming {
            self.edges.remove(&(*src, nid));
            if let Some(succs) = self.successors.get_mut(src) {
                succs.retain(|s| *s != nid);
            }
        }
        self.edge_order.retain(|(src, dst)| *src != nid && *dst != nid);
        if self.root == Some(nid) {
            self.root = None;
        }

        debug!(nid, edges = outgoing.len() + incoming.len(), "Removed node");
        Ok(self.nodes.remove(&nid).unwrap_or_default())
    }

    pub fn contains_node(&self, nid: NodeId) -> bool {
        self.nodes.contains_key(&nid)
    }

    pub fn node(&self, nid: NodeId) -> Result<&Attrs> {
        self.nodes.get(&nid).ok_or(FlowError::UnknownNode(nid))
    }

    pub fn node_mut(&mut self, nid: NodeId) -> Result<&mut Attrs> {
        self.nodes.get_mut(&nid).ok_or(FlowError::UnknownNode(nid))
    }

    pub fn set_node_attr(&mut self, nid: NodeId, key: impl Into<String>, value: Value) -> Result<()> {
        self.node_mut(nid)?.insert(key.into(), value);
        Ok(())
    }

    /// Node ids in ascending order.
    pub fn node_ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.nodes.keys().copied()
    }

    pub fn nodes(&self) -> impl Iterator<Item = (NodeId, &Attrs)> + '_ {
        self.nodes.iter().map(|(nid, attrs)| (*nid, attrs))
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Value stored under the graph's key tag.
    pub fn key_of(&self, nid: NodeId) -> Option<&str> {
        self.nodes.get(&nid)?.get(&self.key_tag)?.as_str()
    }

    /// Value stored under the graph's value tag.
    pub fn value_of(&self, nid: NodeId) -> Option<&Value> {
        self.nodes.get(&nid)?.get(&self.value_tag)
    }

    /// First node whose key tag equals `key`.
    pub fn find_by_key(&self, key: &str) -> Option<NodeId> {
        self.nodes
            .iter()
            .find(|(_, attrs)| attrs.get(&self.key_tag).and_then(Value::as_str) == Some(key))
            .map(|(nid, _)| *nid)
    }

    // ── Edges ───────────────────────────────────────────────────

    /// Add an edge between two existing nodes.
    ///
    /// Adding an edge that already exists keeps the stored attributes.
    pub fn add_edge(&mut self, src: NodeId, dst: NodeId, attrs: Attrs) -> Result<EdgeId> {
        self.ensure_node(src)?;
        self.ensure_node(dst)?;

        if self.edges.contains_key(&(src, dst)) {
            warn!(src, dst, "Edge already exists, keeping existing attributes");
            return Ok((src, dst));
        }

        if !self.directed && src != dst {
            self.insert_edge(dst, src, attrs.clone());
        }
        self.insert_edge(src, dst, attrs);
        debug!(src, dst, "Added edge");
        Ok((src, dst))
    }

    pub(crate) fn insert_edge(&mut self, src: NodeId, dst: NodeId, attrs: Attrs) {
        if self.edges.insert((src, dst), attrs).is_none() {
            self.edge_order.push((src, dst));
            self.successors.entry(src).or_default().push(dst);
            self.predecessors.entry(dst).or_default().push(src);
        }
    }

    /// Remove an edge (and its mirror on undirected graphs).
    pub fn remove_edge(&mut self, src: NodeId, dst: NodeId) -> Result<Attrs> {
        let attrs = self
            .edges
            .remove(&(src, dst))
            .ok_or(FlowError::UnknownEdge(src, dst))?;
        self.unlink(src, dst);

        if !self.directed && self.edges.remove(&(dst, src)).is_some() {
            self.unlink(dst, src);
        }
        Ok(attrs)
    }

    fn unlink(&mut self, src: NodeId, dst: NodeId) {
        self.edge_order.retain(|eid| *eid != (src, dst));
        if let Some(succs) = self.successors.get_mut(&src) {
            succs.retain(|s| *s != dst);
        }
        if let Some(preds) = self.predecessors.get_mut(&dst) {
            preds.retain(|p| *p != src);
        }
    }

    pub fn contains_edge(&self, src: NodeId, dst: NodeId) -> bool {
        self.edges.contains_key(&(src, dst))
    }

    pub fn edge(&self, src: NodeId, dst: NodeId) -> Result<&Attrs> {
        self.edges
            .get(&(src, dst))
            .ok_or(FlowError::UnknownEdge(src, dst))
    }

    pub fn edge_mut(&mut self, src: NodeId, dst: NodeId) -> Result<&mut Attrs> {
        self.edges
            .get_mut(&(src, dst))
            .ok_or(FlowError::UnknownEdge(src, dst))
    }

    pub fn set_edge_attr(
        &mut self,
        src: NodeId,
        dst: NodeId,
        key: impl Into<String>,
        value: Value,
    ) -> Result<()> {
        self.edge_mut(src, dst)?.insert(key.into(), value);
        Ok(())
    }

    /// Edge ids in ascending order.
    pub fn edge_ids(&self) -> impl Iterator<Item = EdgeId> + '_ {
        self.edges.keys().copied()
    }

    pub fn edges(&self) -> impl Iterator<Item = (EdgeId, &Attrs)> + '_ {
        self.edges.iter().map(|(eid, attrs)| (*eid, attrs))
    }

    /// Edges in the order they were added.
    pub fn edges_in_order(&self) -> impl Iterator<Item = (EdgeId, &Attrs)> + '_ {
        self.edge_order
            .iter()
            .filter_map(|eid| self.edges.get(eid).map(|attrs| (*eid, attrs)))
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    // ── Adjacency ───────────────────────────────────────────────

    /// Direct successors in insertion order.
    pub fn children(&self, nid: NodeId) -> Result<&[NodeId]> {
        self.successors
            .get(&nid)
            .map(Vec::as_slice)
            .ok_or(FlowError::UnknownNode(nid))
    }

    /// Direct predecessors in insertion order.
    pub fn parents(&self, nid: NodeId) -> Result<&[NodeId]> {
        self.predecessors
            .get(&nid)
            .map(Vec::as_slice)
            .ok_or(FlowError::UnknownNode(nid))
    }

    /// Children followed by parents, without duplicates.
    pub fn neighbors(&self, nid: NodeId) -> Result<Vec<NodeId>> {
        let mut out = self.children(nid)?.to_vec();
        for p in self.parents(nid)? {
            if !out.contains(p) {
                out.push(*p);
            }
        }
        Ok(out)
    }

    /// Nodes without successors.
    pub fn leaves(&self) -> Vec<NodeId> {
        self.successors
            .iter()
            .filter(|(_, succs)| succs.is_empty())
            .map(|(nid, _)| *nid)
            .collect()
    }

    /// Lazy, restartable node query.
    pub fn query(&self, predicate: Predicate, scope: Scope) -> Query<'_> {
        Query::new(self, predicate, scope)
    }

    fn ensure_node(&self, nid: NodeId) -> Result<()> {
        if self.nodes.contains_key(&nid) {
            Ok(())
        } else {
            Err(FlowError::UnknownNode(nid))
        }
    }
}

impl Default for Graph {
    fn default() -> Self {
        Self::new()
    }
}

/// Build an attribute map from `(key, value)` pairs.
pub fn attrs<K, I>(pairs: I) -> Attrs
where
    K: Into<String>,
    I: IntoIterator<Item = (K, Value)>,
{
    pairs.into_iter().map(|(k, v)| (k.into(), v)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn named(key: &str) -> Attrs {
        attrs([("key", json!(key))])
    }

    #[test]
    fn test_auto_ids_increment() {
        let mut g = Graph::new();
        let a = g.add_node(named("a"));
        let b = g.add_node(named("b"));
        assert_eq!(a, 1);
        assert_eq!(b, 2);
        assert_eq!(g.len(), 2);
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let mut g = Graph::new();
        g.add_node_with_id(5, named("five")).unwrap();
        let err = g.add_node_with_id(5, named("other")).unwrap_err();
        assert!(matches!(err, FlowError::DuplicateNode(5)));
        assert_eq!(g.key_of(5), Some("five"));
        // Auto ids skip past explicit ones
        assert_eq!(g.add_node(Attrs::new()), 6);
    }

    #[test]
    fn test_edge_requires_endpoints() {
        let mut g = Graph::new();
        let a = g.add_node(Attrs::new());
        let err = g.add_edge(a, 99, Attrs::new()).unwrap_err();
        assert!(matches!(err, FlowError::UnknownNode(99)));
        assert_eq!(g.edge_count(), 0);
        assert_eq!(g.edges_in_order().count(), 0);
        assert!(g.children(a).unwrap().is_empty());
    }

    #[test]
    fn test_children_parents_neighbors() {
        let mut g = Graph::new();
        let a = g.add_node(named("a"));
        let b = g.add_node(named("b"));
        let c = g.add_node(named("c"));
        g.add_edge(a, b, Attrs::new()).unwrap();
        g.add_edge(a, c, Attrs::new()).unwrap();
        g.add_edge(c, b, Attrs::new()).unwrap();

        assert_eq!(g.children(a).unwrap(), &[b, c]);
        assert_eq!(g.parents(b).unwrap(), &[a, c]);
        assert_eq!(g.neighbors(c).unwrap(), vec![b, a]);
        assert_eq!(g.leaves(), vec![b]);
        assert!(g.children(42).is_err());
    }

    #[test]
    fn test_remove_node_cascades() {
        let mut g = Graph::new();
        let a = g.add_node(Attrs::new());
        let b = g.add_node(Attrs::new());
        let c = g.add_node(Attrs::new());
        g.add_edge(a, b, Attrs::new()).unwrap();
        g.add_edge(b, c, Attrs::new()).unwrap();
        g.set_root(b).unwrap();

        g.remove_node(b).unwrap();
        assert_eq!(g.edge_count(), 0);
        assert!(g.children(a).unwrap().is_empty());
        assert!(g.parents(c).unwrap().is_empty());
        assert_eq!(g.root(), None);
        assert!(matches!(g.remove_node(b), Err(FlowError::UnknownNode(_))));
    }

    #[test]
    fn test_undirected_mirrors_edges() {
        let mut g = Graph::undirected();
        let a = g.add_node(Attrs::new());
        let b = g.add_node(Attrs::new());
        g.add_edge(a, b, attrs([("w", json!(1))])).unwrap();
        assert!(g.contains_edge(b, a));
        assert_eq!(g.edge(b, a).unwrap()["w"], json!(1));

        g.remove_edge(b, a).unwrap();
        assert_eq!(g.edge_count(), 0);
        assert!(g.children(a).unwrap().is_empty());
    }

    #[test]
    fn test_readding_edge_keeps_attrs() {
        let mut g = Graph::new();
        let a = g.add_node(Attrs::new());
        let b = g.add_node(Attrs::new());
        g.add_edge(a, b, attrs([("w", json!(1))])).unwrap();
        g.add_edge(a, b, attrs([("w", json!(2))])).unwrap();
        assert_eq!(g.edge(a, b).unwrap()["w"], json!(1));
        assert_eq!(g.children(a).unwrap(), &[b]);
    }

    #[test]
    fn test_remove_missing_edge() {
        let mut g = Graph::new();
        let a = g.add_node(Attrs::new());
        assert!(matches!(g.remove_edge(a, a), Err(FlowError::UnknownEdge(1, 1))));
    }

    #[test]
    fn test_key_and_value_tags() {
        let mut g = Graph::new().with_tags("name", "payload");
        let a = g.add_node(attrs([("name", json!("alpha")), ("payload", json!([1, 2]))]));
        assert_eq!(g.find_by_key("alpha"), Some(a));
        assert_eq!(g.value_of(a), Some(&json!([1, 2])));
        assert_eq!(g.find_by_key("beta"), None);
    }
}
