//! Task registry: the fixed set of tasks for a run and the partial order
//! between them.
//!
//! The registry is a petgraph `DiGraph` whose nodes are tasks and whose
//! edges point from upstream to downstream. Besides the edges callers
//! declare, the registry maintains a stage barrier: every ingestion task
//! precedes every transformation task.

use crate::core::task::{Task, TaskKind, TaskName};
use crate::error::{Error, Result};
use petgraph::algo::has_path_connecting;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};

/// Why one task must reach a terminal state before another starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeKind {
    /// Declared by the caller (config, manifest, or `add_dependency`).
    Declared,
    /// Implied by the ingestion-before-transformation rule.
    StageBarrier,
}

impl std::fmt::Display for EdgeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EdgeKind::Declared => write!(f, "declared"),
            EdgeKind::StageBarrier => write!(f, "stage"),
        }
    }
}

/// The registered tasks and their dependency graph.
///
/// Node indices are handed out in registration order and nodes are never
/// removed except to roll back a failed registration, so comparing indices
/// compares registration order.
pub struct TaskRegistry {
    graph: DiGraph<Task, EdgeKind>,
    index: HashMap<TaskName, NodeIndex>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self {
            graph: DiGraph::new(),
            index: HashMap::new(),
        }
    }

    /// Register a task that depends on already-registered tasks.
    ///
    /// # Errors
    /// - `DuplicateTask` if the name is taken
    /// - `Cycle` if the task lists itself, or the declared edges contradict
    ///   the stage barrier (an ingestion task depending on a transformation)
    /// - `UnknownTask` if a dependency is not registered
    ///
    /// The registry is unchanged when an error is returned.
    pub fn register(&mut self, task: Task, depends_on: &[TaskName]) -> Result<()> {
        if self.index.contains_key(&task.name) {
            return Err(Error::DuplicateTask(task.name));
        }

        let mut upstream = Vec::with_capacity(depends_on.len());
        for dep in depends_on {
            if *dep == task.name {
                return Err(Error::Cycle {
                    upstream: dep.clone(),
                    downstream: task.name,
                });
            }
            let dep_index = self
                .index
                .get(dep)
                .copied()
                .ok_or_else(|| Error::UnknownTask(dep.clone()))?;
            upstream.push(dep_index);
        }

        let name = task.name.clone();
        let kind = task.kind;
        let node = self.graph.add_node(task);

        for &dep_index in &upstream {
            self.graph.update_edge(dep_index, node, EdgeKind::Declared);
        }

        let barrier: Vec<NodeIndex> = self
            .graph
            .node_indices()
            .filter(|&i| i != node)
            .filter(|&i| self.graph[i].kind != kind)
            .collect();
        for other in barrier {
            let (from, to) = match kind {
                TaskKind::Transformation => (other, node),
                TaskKind::Ingestion => (node, other),
            };
            if self.graph.find_edge(from, to).is_none() {
                self.graph.add_edge(from, to, EdgeKind::StageBarrier);
            }
        }

        // Only a node with edges on both sides can close a cycle.
        let has_upstream = self
            .graph
            .neighbors_directed(node, Direction::Incoming)
            .next()
            .is_some();
        let closes_cycle = has_upstream
            && self
                .graph
                .neighbors_directed(node, Direction::Outgoing)
                .any(|down| has_path_connecting(&self.graph, down, node, None));
        if closes_cycle {
            // The new node is the last index, so removing it leaves every
            // other index untouched.
            self.graph.remove_node(node);
            let upstream = upstream
                .first()
                .map(|&i| self.graph[i].name.clone())
                .unwrap_or_else(|| name.clone());
            return Err(Error::Cycle {
                upstream,
                downstream: name,
            });
        }

        self.index.insert(name, node);
        Ok(())
    }

    /// Add an edge between two registered tasks.
    ///
    /// `downstream` will not start until `upstream` is terminal. Adding an
    /// edge that already exists is a no-op.
    ///
    /// # Errors
    /// `UnknownTask` for an unregistered name, `Cycle` if `upstream` is
    /// already reachable from `downstream`. The registry is unchanged when
    /// an error is returned.
    pub fn add_dependency(&mut self, upstream: &TaskName, downstream: &TaskName) -> Result<()> {
        let from = self.node(upstream)?;
        let to = self.node(downstream)?;

        if from == to || has_path_connecting(&self.graph, to, from, None) {
            return Err(Error::Cycle {
                upstream: upstream.clone(),
                downstream: downstream.clone(),
            });
        }

        if self.graph.find_edge(from, to).is_none() {
            self.graph.add_edge(from, to, EdgeKind::Declared);
        }
        Ok(())
    }

    fn node(&self, name: &TaskName) -> Result<NodeIndex> {
        self.index
            .get(name)
            .copied()
            .ok_or_else(|| Error::UnknownTask(name.clone()))
    }

    pub fn get(&self, name: &TaskName) -> Option<&Task> {
        self.index.get(name).map(|&i| &self.graph[i])
    }

    pub fn contains(&self, name: &TaskName) -> bool {
        self.index.contains_key(name)
    }

    /// Whether a failure of `name` aborts the run.
    pub fn is_required(&self, name: &TaskName) -> Result<bool> {
        Ok(self.graph[self.node(name)?].required)
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    /// Kind of the edge between two tasks, if one exists.
    pub fn edge(&self, upstream: &TaskName, downstream: &TaskName) -> Option<EdgeKind> {
        let from = self.index.get(upstream)?;
        let to = self.index.get(downstream)?;
        let edge = self.graph.find_edge(*from, *to)?;
        self.graph.edge_weight(edge).copied()
    }

    /// Direct upstream tasks of `name`, in registration order.
    pub fn dependencies(&self, name: &TaskName) -> Vec<&Task> {
        let Some(&node) = self.index.get(name) else {
            return Vec::new();
        };
        let mut deps: Vec<NodeIndex> = self
            .graph
            .neighbors_directed(node, Direction::Incoming)
            .collect();
        deps.sort();
        deps.into_iter().map(|i| &self.graph[i]).collect()
    }

    /// All tasks in registration order.
    pub fn tasks(&self) -> Vec<&Task> {
        self.graph.node_indices().map(|i| &self.graph[i]).collect()
    }

    /// Tasks in an order consistent with every edge.
    ///
    /// Kahn's algorithm with a min-heap on registration order: among tasks
    /// with no unresolved dependency, the earliest registered goes first.
    /// The result is identical across calls for the same registrations.
    pub fn topological_order(&self) -> Vec<&Task> {
        let mut in_degree: Vec<usize> = self
            .graph
            .node_indices()
            .map(|i| self.graph.neighbors_directed(i, Direction::Incoming).count())
            .collect();

        let mut ready: BinaryHeap<Reverse<NodeIndex>> = self
            .graph
            .node_indices()
            .filter(|i| in_degree[i.index()] == 0)
            .map(Reverse)
            .collect();

        let mut order = Vec::with_capacity(self.graph.node_count());
        while let Some(Reverse(node)) = ready.pop() {
            order.push(&self.graph[node]);
            for next in self.graph.neighbors_directed(node, Direction::Outgoing) {
                in_degree[next.index()] -= 1;
                if in_degree[next.index()] == 0 {
                    ready.push(Reverse(next));
                }
            }
        }

        order
    }

    /// Owned copy of `topological_order`, ready to hand to an executor.
    pub fn plan(&self) -> Vec<Task> {
        self.topological_order().into_iter().cloned().collect()
    }
}

impl Default for TaskRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TaskRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskRegistry")
            .field("tasks", &self.len())
            .field("dependencies", &self.edge_count())
            .finish()
    }
}
