use regex::Regex;
use serde_json::Value;

use lieflow_core::error::{FlowError, Result};
use lieflow_core::types::{Attrs, NodeId};

use crate::graph::Graph;

/// Attribute predicate evaluated against a node's attribute map.
#[derive(Debug, Clone)]
pub enum Predicate {
    /// Attribute present and equal to the value.
    Equals(String, Value),
    /// String attribute matching a `*` / `?` glob.
    Wildcard(String, Regex),
    /// Attribute present, any value.
    Exists(String),
    /// Every inner predicate holds.
    All(Vec<Predicate>),
}

impl Predicate {
    pub fn equals(key: impl Into<String>, value: impl Into<Value>) -> Self {
        Predicate::Equals(key.into(), value.into())
    }

    pub fn exists(key: impl Into<String>) -> Self {
        Predicate::Exists(key.into())
    }

    /// Glob match on a string attribute (`*` any run, `?` one character).
    pub fn wildcard(key: impl Into<String>, pattern: &str) -> Result<Self> {
        let regex = Regex::new(&glob_to_regex(pattern))
            .map_err(|e| FlowError::Validation(format!("bad wildcard '{}': {}", pattern, e)))?;
        Ok(Predicate::Wildcard(key.into(), regex))
    }

    pub fn all(predicates: Vec<Predicate>) -> Self {
        Predicate::All(predicates)
    }

    pub fn matches(&self, attrs: &Attrs) -> bool {
        match self {
            Predicate::Equals(key, value) => attrs.get(key) == Some(value),
            Predicate::Wildcard(key, regex) => attrs
                .get(key)
                .and_then(Value::as_str)
                .map(|s| regex.is_match(s))
                .unwrap_or(false),
            Predicate::Exists(key) => attrs.contains_key(key),
            Predicate::All(inner) => inner.iter().all(|p| p.matches(attrs)),
        }
    }
}

fn glob_to_regex(pattern: &str) -> String {
    let mut out = String::with_capacity(pattern.len() + 8);
    out.push('^');
    for c in pattern.chars() {
        match c {
            '*' => out.push_str(".*"),
            '?' => out.push('.'),
            other => out.push_str(&regex::escape(&other.to_string())),
        }
    }
    out.push('$');
    out
}

/// Which nodes a query considers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    /// Only the graph root.
    Root,
    /// Direct children of the given node.
    Children(NodeId),
    /// Every node in the graph.
    AnyLevel,
}

/// A node query. Nothing is evaluated until iterated, and every call to
/// [`Query::iter`] starts a fresh pass over the current graph.
#[derive(Debug, Clone)]
pub struct Query<'g> {
    graph: &'g Graph,
    predicate: Predicate,
    scope: Scope,
}

impl<'g> Query<'g> {
    pub fn new(graph: &'g Graph, predicate: Predicate, scope: Scope) -> Self {
        Self {
            graph,
            predicate,
            scope,
        }
    }

    pub fn iter(&self) -> QueryIter<'_> {
        let candidates: Box<dyn Iterator<Item = NodeId> + '_> = match self.scope {
            Scope::Root => Box::new(self.graph.root().into_iter()),
            Scope::Children(nid) => Box::new(
                self.graph
                    .children(nid)
                    .map(|c| c.iter().copied())
                    .into_iter()
                    .flatten(),
            ),
            Scope::AnyLevel => Box::new(self.graph.node_ids()),
        };
        QueryIter {
            query: self,
            candidates,
        }
    }

    pub fn first(&self) -> Option<NodeId> {
        self.iter().next()
    }

    pub fn is_empty(&self) -> bool {
        self.first().is_none()
    }

    pub fn count(&self) -> usize {
        self.iter().count()
    }

    pub fn to_vec(&self) -> Vec<NodeId> {
        self.iter().collect()
    }
}

pub struct QueryIter<'q> {
    query: &'q Query<'q>,
    candidates: Box<dyn Iterator<Item = NodeId> + 'q>,
}

impl Iterator for QueryIter<'_> {
    type Item = NodeId;

    fn next(&mut self) -> Option<NodeId> {
        let graph = self.query.graph;
        let predicate = &self.query.predicate;
        self.candidates.by_ref().find(|nid| {
            graph
                .node(*nid)
                .map(|attrs| predicate.matches(attrs))
                .unwrap_or(false)
        })
    }
}

impl<'q> IntoIterator for &'q Query<'q> {
    type Item = NodeId;
    type IntoIter = QueryIter<'q>;

    fn into_iter(self) -> QueryIter<'q> {
        self.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::attrs;
    use serde_json::json;

    fn sample() -> Graph {
        let mut g = Graph::new();
        let root = g.add_node(attrs([("key", json!("start")), ("kind", json!("Start"))]));
        let a = g.add_node(attrs([("key", json!("dock_ligand")), ("kind", json!("Task"))]));
        let b = g.add_node(attrs([("key", json!("md_run")), ("kind", json!("Task"))]));
        let c = g.add_node(attrs([("key", json!("dock_protein")), ("kind", json!("Task"))]));
        g.set_root(root).unwrap();
        g.add_edge(root, a, Attrs::new()).unwrap();
        g.add_edge(root, b, Attrs::new()).unwrap();
        g.add_edge(b, c, Attrs::new()).unwrap();
        g
    }

    #[test]
    fn test_scopes() {
        let g = sample();
        let tasks = Predicate::equals("kind", "Task");
        assert_eq!(g.query(tasks.clone(), Scope::AnyLevel).to_vec(), vec![2, 3, 4]);
        assert_eq!(g.query(tasks.clone(), Scope::Children(1)).to_vec(), vec![2, 3]);
        assert!(g.query(tasks, Scope::Root).is_empty());
        assert_eq!(g.query(Predicate::exists("kind"), Scope::Root).first(), Some(1));
    }

    #[test]
    fn test_wildcard() {
        let g = sample();
        let docking = Predicate::wildcard("key", "dock_*").unwrap();
        assert_eq!(g.query(docking, Scope::AnyLevel).to_vec(), vec![2, 4]);
        let single = Predicate::wildcard("key", "md_ru?").unwrap();
        assert_eq!(g.query(single, Scope::AnyLevel).count(), 1);
        // Regex metacharacters are literal
        let dotted = Predicate::wildcard("key", "md.run").unwrap();
        assert!(g.query(dotted, Scope::AnyLevel).is_empty());
    }

    #[test]
    fn test_query_is_restartable() {
        let g = sample();
        let q = g.query(Predicate::equals("kind", "Task"), Scope::AnyLevel);
        let first: Vec<_> = q.iter().collect();
        let second: Vec<_> = (&q).into_iter().collect();
        assert_eq!(first, second);
    }

    #[test]
    fn test_conjunction_and_unknown_scope() {
        let g = sample();
        let p = Predicate::all(vec![
            Predicate::equals("kind", "Task"),
            Predicate::wildcard("key", "*protein").unwrap(),
        ]);
        assert_eq!(g.query(p, Scope::AnyLevel).to_vec(), vec![4]);
        assert!(g.query(Predicate::exists("key"), Scope::Children(99)).is_empty());
    }
}
