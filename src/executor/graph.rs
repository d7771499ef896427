use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use std::collections::HashMap;

use super::executor::{AnyExecutor, AsExecutor, ExecutorId, ExecutorInfo};
use crate::core::errors::{Result, ScopeError};

/// Dependency graph of a set of executors.
///
/// Edges point from a dependency to its dependent, so a topological order is
/// the order in which a scope visits nodes.
pub struct DependencyGraph {
    graph: DiGraph<ExecutorInfo, ()>,
    index: HashMap<ExecutorId, NodeIndex>,
}

impl DependencyGraph {
    /// Walk `dependencies` transitively from the given roots
    pub fn from_roots<E: AsExecutor>(roots: &[E]) -> Self {
        let mut graph = DiGraph::new();
        let mut index = HashMap::new();
        let mut stack: Vec<AnyExecutor> = roots.iter().map(|r| r.as_executor().clone()).collect();

        while let Some(executor) = stack.pop() {
            let node = *index
                .entry(executor.id())
                .or_insert_with(|| graph.add_node(executor.info()));
            for dependency in executor.dependencies() {
                let seen = index.contains_key(&dependency.id());
                let dep_node = *index
                    .entry(dependency.id())
                    .or_insert_with(|| graph.add_node(dependency.info()));
                if graph.find_edge(dep_node, node).is_none() {
                    graph.add_edge(dep_node, node, ());
                }
                if !seen {
                    stack.push(dependency.clone());
                }
            }
        }

        Self { graph, index }
    }

    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    pub fn contains(&self, id: ExecutorId) -> bool {
        self.index.contains_key(&id)
    }

    /// Direct dependencies of a node
    pub fn dependencies_of(&self, id: ExecutorId) -> Vec<ExecutorId> {
        self.neighbors(id, Direction::Incoming)
    }

    /// Direct dependents of a node
    pub fn dependents_of(&self, id: ExecutorId) -> Vec<ExecutorId> {
        self.neighbors(id, Direction::Outgoing)
    }

    fn neighbors(&self, id: ExecutorId, direction: Direction) -> Vec<ExecutorId> {
        let Some(&node) = self.index.get(&id) else {
            return Vec::new();
        };
        let mut ids: Vec<ExecutorId> = self
            .graph
            .neighbors_directed(node, direction)
            .map(|n| self.graph[n].id)
            .collect();
        ids.sort();
        ids
    }

    /// Nodes without dependencies
    pub fn leaves(&self) -> Vec<ExecutorId> {
        let mut ids: Vec<ExecutorId> = self
            .graph
            .node_indices()
            .filter(|&n| {
                self.graph
                    .neighbors_directed(n, Direction::Incoming)
                    .next()
                    .is_none()
            })
            .map(|n| self.graph[n].id)
            .collect();
        ids.sort();
        ids
    }

    /// Dependencies first
    pub fn topological_order(&self) -> Result<Vec<ExecutorInfo>> {
        let order = toposort(&self.graph, None).map_err(|cycle| {
            ScopeError::shape(format!(
                "dependency cycle through {}",
                self.graph[cycle.node_id()].id
            ))
        })?;
        Ok(order.into_iter().map(|n| self.graph[n].clone()).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::combinators::{combine, map, provide};

    #[test]
    fn test_diamond() {
        let a = provide(|| Ok(1i32));
        let b = map(&a, |x| x + 1);
        let c = map(&a, |x| x * 10);
        let d = combine([("b", b.erase()), ("c", c.erase())]);

        let graph = DependencyGraph::from_roots(&[d.clone()]);
        assert_eq!(graph.node_count(), 4);
        assert_eq!(graph.edge_count(), 4);
        assert_eq!(graph.leaves(), vec![a.id()]);
        assert_eq!(graph.dependents_of(a.id()), {
            let mut v = vec![b.id(), c.id()];
            v.sort();
            v
        });

        let order: Vec<ExecutorId> = graph
            .topological_order()
            .unwrap()
            .into_iter()
            .map(|info| info.id)
            .collect();
        assert_eq!(order.first(), Some(&a.id()));
        assert_eq!(order.last(), Some(&d.id()));
    }
}
