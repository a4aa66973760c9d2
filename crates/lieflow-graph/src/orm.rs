//! Pattern-based capability dispatch over graph elements.
//!
//! Each mapping pairs an attribute pattern with a capability object. When a
//! node or edge is retrieved, every mapping whose pattern is a subset of the
//! element's attributes contributes its capability, ordered by rank. The
//! result only depends on the values of keys that occur in some pattern, so
//! it is memoised per distinct signature of those values.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, RwLock};

use serde_json::Value;
use tracing::debug;

use lieflow_core::error::{FlowError, Result};
use lieflow_core::types::{Attrs, NodeId};

use crate::graph::{EdgeId, Graph};

/// Identifies a node or an edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ElementId {
    Node(NodeId),
    Edge(NodeId, NodeId),
}

impl From<NodeId> for ElementId {
    fn from(nid: NodeId) -> Self {
        ElementId::Node(nid)
    }
}

impl From<EdgeId> for ElementId {
    fn from((src, dst): EdgeId) -> Self {
        ElementId::Edge(src, dst)
    }
}

struct Mapping<C: ?Sized> {
    pattern: Attrs,
    rank: i32,
    capability: Arc<C>,
}

/// Mappings plus resolution cache for one element kind.
struct MappingTable<C: ?Sized> {
    mappings: Vec<Mapping<C>>,
    keys: BTreeSet<String>,
    cache: RwLock<HashMap<String, Arc<[Arc<C>]>>>,
}

impl<C: ?Sized> MappingTable<C> {
    fn new() -> Self {
        Self {
            mappings: Vec::new(),
            keys: BTreeSet::new(),
            cache: RwLock::new(HashMap::new()),
        }
    }

    fn insert(&mut self, pattern: Attrs, rank: i32, capability: Arc<C>) {
        self.keys.extend(pattern.keys().cloned());
        self.mappings.push(Mapping {
            pattern,
            rank,
            capability,
        });
        // Stable: equal ranks keep registration order
        self.mappings.sort_by_key(|m| m.rank);
        if let Ok(mut cache) = self.cache.write() {
            cache.clear();
        }
    }

    fn signature(&self, attrs: &Attrs) -> String {
        let mut sig = String::new();
        for key in &self.keys {
            match attrs.get(key) {
                Some(value) => sig.push_str(&format!("{}={};", key, value)),
                None => sig.push_str(&format!("{}!;", key)),
            }
        }
        sig
    }

    fn resolve(&self, attrs: &Attrs) -> Arc<[Arc<C>]> {
        let sig = self.signature(attrs);
        if let Ok(cache) = self.cache.read() {
            if let Some(hit) = cache.get(&sig) {
                return hit.clone();
            }
        }

        let resolved: Arc<[Arc<C>]> = self
            .mappings
            .iter()
            .filter(|m| pattern_matches(&m.pattern, attrs))
            .map(|m| m.capability.clone())
            .collect();
        debug!(signature = %sig, capabilities = resolved.len(), "Resolved element capabilities");

        if let Ok(mut cache) = self.cache.write() {
            cache.insert(sig, resolved.clone());
        }
        resolved
    }

    fn cached(&self) -> usize {
        self.cache.read().map(|c| c.len()).unwrap_or(0)
    }
}

fn pattern_matches(pattern: &Attrs, attrs: &Attrs) -> bool {
    pattern.iter().all(|(k, v)| attrs.get(k) == Some(v))
}

/// Registry of attribute pattern to capability mappings.
///
/// `C` is usually a trait object, e.g. `GraphOrm<dyn TaskBehavior>`.
pub struct GraphOrm<C: ?Sized> {
    nodes: MappingTable<C>,
    edges: MappingTable<C>,
}

impl<C: ?Sized> GraphOrm<C> {
    pub fn new() -> Self {
        Self {
            nodes: MappingTable::new(),
            edges: MappingTable::new(),
        }
    }

    /// Attach `capability` to nodes whose attributes contain `pattern`.
    /// Lower ranks come first in resolved capability lists.
    pub fn map_node(&mut self, pattern: Attrs, capability: Arc<C>, rank: i32) -> &mut Self {
        self.nodes.insert(pattern, rank, capability);
        self
    }

    /// Attach `capability` to edges whose attributes contain `pattern`.
    pub fn map_edge(&mut self, pattern: Attrs, capability: Arc<C>, rank: i32) -> &mut Self {
        self.edges.insert(pattern, rank, capability);
        self
    }

    /// Values registered per pattern key for node mappings.
    pub fn mapped_node_types(&self) -> BTreeMap<String, Vec<Value>> {
        let mut out: BTreeMap<String, Vec<Value>> = BTreeMap::new();
        for mapping in &self.nodes.mappings {
            for (k, v) in &mapping.pattern {
                let values = out.entry(k.clone()).or_default();
                if !values.contains(v) {
                    values.push(v.clone());
                }
            }
        }
        out
    }

    /// Capabilities for a node attribute map.
    pub fn resolve_node(&self, attrs: &Attrs) -> Arc<[Arc<C>]> {
        self.nodes.resolve(attrs)
    }

    /// Capabilities for an edge attribute map.
    pub fn resolve_edge(&self, attrs: &Attrs) -> Arc<[Arc<C>]> {
        self.edges.resolve(attrs)
    }

    /// Number of memoised signatures (nodes, edges).
    pub fn cached_signatures(&self) -> (usize, usize) {
        (self.nodes.cached(), self.edges.cached())
    }

    pub fn node<'g>(&self, graph: &'g Graph, nid: NodeId) -> Result<View<'g, C>> {
        let attrs = graph.node(nid)?;
        Ok(View {
            graph,
            id: ElementId::Node(nid),
            attrs,
            capabilities: self.resolve_node(attrs),
        })
    }

    pub fn edge<'g>(&self, graph: &'g Graph, src: NodeId, dst: NodeId) -> Result<View<'g, C>> {
        let attrs = graph.edge(src, dst)?;
        Ok(View {
            graph,
            id: ElementId::Edge(src, dst),
            attrs,
            capabilities: self.resolve_edge(attrs),
        })
    }

    /// Views for a homogeneous selection of node ids or edge ids.
    pub fn get<'g>(&self, graph: &'g Graph, ids: &[ElementId]) -> Result<Vec<View<'g, C>>> {
        let nodes = ids.iter().filter(|id| matches!(id, ElementId::Node(_))).count();
        if nodes != 0 && nodes != ids.len() {
            return Err(FlowError::MixedElements);
        }
        ids.iter()
            .map(|id| match *id {
                ElementId::Node(nid) => self.node(graph, nid),
                ElementId::Edge(src, dst) => self.edge(graph, src, dst),
            })
            .collect()
    }
}

impl<C: ?Sized> Default for GraphOrm<C> {
    fn default() -> Self {
        Self::new()
    }
}

/// Read handle on one element plus its resolved capabilities.
pub struct View<'g, C: ?Sized> {
    graph: &'g Graph,
    id: ElementId,
    attrs: &'g Attrs,
    capabilities: Arc<[Arc<C>]>,
}

impl<'g, C: ?Sized> View<'g, C> {
    pub fn id(&self) -> ElementId {
        self.id
    }

    pub fn nid(&self) -> Option<NodeId> {
        match self.id {
            ElementId::Node(nid) => Some(nid),
            ElementId::Edge(..) => None,
        }
    }

    pub fn graph(&self) -> &'g Graph {
        self.graph
    }

    pub fn attrs(&self) -> &'g Attrs {
        self.attrs
    }

    pub fn get(&self, key: &str) -> Option<&'g Value> {
        self.attrs().get(key)
    }

    pub fn capabilities(&self) -> &[Arc<C>] {
        &self.capabilities
    }

    /// Highest-precedence capability, if any mapping matched.
    pub fn primary(&self) -> Option<&Arc<C>> {
        self.capabilities.first()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::attrs;
    use serde_json::json;

    trait Role: Send + Sync {
        fn role(&self) -> &'static str;
    }

    struct Submitter;
    impl Role for Submitter {
        fn role(&self) -> &'static str {
            "submit"
        }
    }

    struct Describer;
    impl Role for Describer {
        fn role(&self) -> &'static str {
            "describe"
        }
    }

    fn orm() -> GraphOrm<dyn Role> {
        let mut orm: GraphOrm<dyn Role> = GraphOrm::new();
        orm.map_node(attrs([("task_type", json!("WampTask"))]), Arc::new(Submitter), 0)
            .map_node(attrs([("kind", json!("task"))]), Arc::new(Describer), 1)
            .map_edge(attrs([("data_mapping", json!({}))]), Arc::new(Describer), 0);
        orm
    }

    #[test]
    fn test_same_attributes_different_surfaces() {
        let mut g = Graph::new();
        let wamp = g.add_node(attrs([("task_type", json!("WampTask")), ("kind", json!("task"))]));
        let py = g.add_node(attrs([("task_type", json!("PythonTask")), ("kind", json!("task"))]));
        let orm = orm();

        let view = orm.node(&g, wamp).unwrap();
        let roles: Vec<_> = view.capabilities().iter().map(|c| c.role()).collect();
        assert_eq!(roles, vec!["submit", "describe"]);

        let view = orm.node(&g, py).unwrap();
        assert_eq!(view.primary().map(|c| c.role()), Some("describe"));
        assert_eq!(view.get("task_type"), Some(&json!("PythonTask")));
    }

    #[test]
    fn test_rank_orders_capabilities() {
        let mut orm: GraphOrm<dyn Role> = GraphOrm::new();
        orm.map_node(attrs([("a", json!(1))]), Arc::new(Describer), 5)
            .map_node(attrs([("a", json!(1))]), Arc::new(Submitter), -1);
        let roles: Vec<_> = orm
            .resolve_node(&attrs([("a", json!(1))]))
            .iter()
            .map(|c| c.role())
            .collect();
        assert_eq!(roles, vec!["submit", "describe"]);
    }

    #[test]
    fn test_resolution_is_cached_per_signature() {
        let mut g = Graph::new();
        for _ in 0..10 {
            g.add_node(attrs([("task_type", json!("WampTask")), ("payload", json!(1))]));
        }
        g.add_node(attrs([("task_type", json!("PythonTask"))]));
        let orm = orm();
        let ids: Vec<ElementId> = g.node_ids().map(ElementId::from).collect();
        let views = orm.get(&g, &ids).unwrap();
        assert_eq!(views.len(), 11);
        // Unrelated attributes do not split the cache
        assert_eq!(orm.cached_signatures().0, 2);
    }

    #[test]
    fn test_mixed_selection_rejected() {
        let mut g = Graph::new();
        let a = g.add_node(Attrs::new());
        let b = g.add_node(Attrs::new());
        g.add_edge(a, b, Attrs::new()).unwrap();
        let orm = orm();
        let err = orm
            .get(&g, &[ElementId::Node(a), ElementId::Edge(a, b)])
            .err()
            .unwrap();
        assert!(matches!(err, FlowError::MixedElements));
        assert_eq!(orm.get(&g, &[ElementId::Edge(a, b)]).unwrap()[0].nid(), None);
        assert!(orm.get(&g, &[]).unwrap().is_empty());
    }

    #[test]
    fn test_mapped_node_types() {
        let types = orm().mapped_node_types();
        assert_eq!(types["task_type"], vec![json!("WampTask")]);
        assert_eq!(types["kind"], vec![json!("task")]);
    }

    #[test]
    fn test_unknown_elements() {
        let g = Graph::new();
        let orm = orm();
        assert!(matches!(orm.node(&g, 3), Err(FlowError::UnknownNode(3))));
        assert!(matches!(orm.edge(&g, 1, 2), Err(FlowError::UnknownEdge(1, 2))));
    }
}
