//! Traversal helpers over [`Graph`].

use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, BinaryHeap, VecDeque};

use lieflow_core::error::{FlowError, Result};
use lieflow_core::types::NodeId;

use crate::graph::Graph;

/// Kahn topological order, smallest ready id first.
///
/// Fails with [`FlowError::Cycle`] naming every node that could not be
/// ordered.
pub fn topological_order(graph: &Graph) -> Result<Vec<NodeId>> {
    let mut in_degree: BTreeMap<NodeId, usize> = graph
        .node_ids()
        .map(|nid| (nid, graph.parents(nid).map(|p| p.len()).unwrap_or(0)))
        .collect();

    let mut ready: BinaryHeap<Reverse<NodeId>> = in_degree
        .iter()
        .filter(|(_, deg)| **deg == 0)
        .map(|(nid, _)| Reverse(*nid))
        .collect();

    let mut order = Vec::with_capacity(in_degree.len());
    while let Some(Reverse(nid)) = ready.pop() {
        order.push(nid);
        for child in graph.children(nid)? {
            if let Some(deg) = in_degree.get_mut(child) {
                *deg -= 1;
                if *deg == 0 {
                    ready.push(Reverse(*child));
                }
            }
        }
    }

    if order.len() < in_degree.len() {
        let placed: BTreeSet<NodeId> = order.iter().copied().collect();
        let stuck = in_degree
            .keys()
            .filter(|nid| !placed.contains(nid))
            .copied()
            .collect();
        return Err(FlowError::Cycle(stuck));
    }
    Ok(order)
}

pub fn is_acyclic(graph: &Graph) -> bool {
    topological_order(graph).is_ok()
}

/// Depth-first pre-order from `start`, following children.
pub fn dfs(graph: &Graph, start: NodeId) -> Result<Vec<NodeId>> {
    graph.node(start)?;
    let mut visited = BTreeSet::new();
    let mut order = Vec::new();
    let mut stack = vec![start];

    while let Some(nid) = stack.pop() {
        if !visited.insert(nid) {
            continue;
        }
        order.push(nid);
        // Reverse so the first child is visited first
        for child in graph.children(nid)?.iter().rev() {
            if !visited.contains(child) {
                stack.push(*child);
            }
        }
    }
    Ok(order)
}

/// Breadth-first order from `start`, following children.
pub fn bfs(graph: &Graph, start: NodeId) -> Result<Vec<NodeId>> {
    walk(graph, start, |g, nid| g.children(nid))
}

/// Every node reachable from `nid`, excluding `nid` itself.
pub fn descendants(graph: &Graph, nid: NodeId) -> Result<Vec<NodeId>> {
    let mut out = bfs(graph, nid)?;
    out.retain(|n| *n != nid);
    Ok(out)
}

/// Every node from which `nid` is reachable, nearest first.
pub fn ancestors(graph: &Graph, nid: NodeId) -> Result<Vec<NodeId>> {
    let mut out = walk(graph, nid, |g, n| g.parents(n))?;
    out.retain(|n| *n != nid);
    Ok(out)
}

pub fn is_reachable(graph: &Graph, from: NodeId, to: NodeId) -> Result<bool> {
    graph.node(to)?;
    Ok(bfs(graph, from)?.contains(&to))
}

/// All simple paths from `from` to `to`.
pub fn dfs_paths(graph: &Graph, from: NodeId, to: NodeId) -> Result<Vec<Vec<NodeId>>> {
    graph.node(from)?;
    graph.node(to)?;

    let mut paths = Vec::new();
    let mut stack: Vec<(NodeId, Vec<NodeId>)> = vec![(from, vec![from])];
    while let Some((nid, path)) = stack.pop() {
        for child in graph.children(nid)?.iter().rev() {
            if path.contains(child) {
                continue;
            }
            let mut next = path.clone();
            next.push(*child);
            if *child == to {
                paths.push(next);
            } else {
                stack.push((*child, next));
            }
        }
    }
    Ok(paths)
}

fn walk<'g, F>(graph: &'g Graph, start: NodeId, step: F) -> Result<Vec<NodeId>>
where
    F: Fn(&'g Graph, NodeId) -> Result<&'g [NodeId]>,
{
    graph.node(start)?;
    let mut seen = BTreeSet::from([start]);
    let mut order = vec![start];
    let mut queue = VecDeque::from([start]);

    while let Some(nid) = queue.pop_front() {
        for next in step(graph, nid)? {
            if seen.insert(*next) {
                order.push(*next);
                queue.push_back(*next);
            }
        }
    }
    Ok(order)
}
