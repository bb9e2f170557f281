//! Task graph (directed acyclic graph) for dependency management.
//!
//! This module provides the TaskGraph structure that represents task
//! dependencies as a directed acyclic graph, enabling parallel execution of
//! independent platform operations. The graph serializes to a flat record
//! form so it can be persisted with its deployment.

use crate::core::task::{TaskId, TaskNode, TaskStatus, TaskUpdate};
use crate::error::{Error, Result};
use petgraph::algo::{is_cyclic_directed, toposort};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::{Bfs, EdgeRef};
use petgraph::Direction;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Why one task depends on another.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DependencyKind {
    /// Listed in the resource's `depends_on`.
    Declared,
    /// Added because a compute instance attaches to the network.
    Network,
    /// Teardown edge: mirrors a creation edge in the opposite direction.
    Reverse,
}

impl Default for DependencyKind {
    fn default() -> Self {
        Self::Declared
    }
}

impl std::fmt::Display for DependencyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DependencyKind::Declared => write!(f, "declared"),
            DependencyKind::Network => write!(f, "network"),
            DependencyKind::Reverse => write!(f, "reverse"),
        }
    }
}

/// The task dependency graph.
///
/// Nodes are tasks, and an edge `a -> b` means `b` may only start after `a`
/// succeeded. Each node's `depends_on` set mirrors its incoming edges.
#[derive(Clone, Serialize, Deserialize)]
#[serde(into = "TaskGraphRecord", try_from = "TaskGraphRecord")]
pub struct TaskGraph {
    /// The underlying directed graph.
    graph: DiGraph<TaskNode, DependencyKind>,
    /// Index mapping from TaskId to NodeIndex for fast lookups.
    task_index: HashMap<TaskId, NodeIndex>,
}

impl TaskGraph {
    /// Create a new empty TaskGraph.
    pub fn new() -> Self {
        Self {
            graph: DiGraph::new(),
            task_index: HashMap::new(),
        }
    }

    /// Add a task to the graph.
    ///
    /// Dependencies are taken from edges only, so any `depends_on` entries
    /// on the incoming node are discarded. If a task with the same id
    /// already exists, returns the existing NodeIndex.
    pub fn add_task(&mut self, mut task: TaskNode) -> NodeIndex {
        if let Some(&index) = self.task_index.get(&task.id) {
            return index;
        }

        task.depends_on.clear();
        let id = task.id;
        let index = self.graph.add_node(task);
        self.task_index.insert(id, index);
        index
    }

    /// Add a dependency between two tasks.
    ///
    /// `from` must succeed before `to` can start. Adding an edge that
    /// already exists is a no-op.
    ///
    /// # Errors
    /// Returns an error if:
    /// - Either task is not found in the graph
    /// - Adding the edge would create a cycle (names `to` as a cycle member)
    pub fn add_dependency(&mut self, from: &TaskId, to: &TaskId, kind: DependencyKind) -> Result<()> {
        let from_index = self.index_of(from)?;
        let to_index = self.index_of(to)?;

        if self.graph.find_edge(from_index, to_index).is_some() {
            return Ok(());
        }

        // Temporarily add the edge to check for cycles
        let edge = self.graph.add_edge(from_index, to_index, kind);

        if is_cyclic_directed(&self.graph) {
            self.graph.remove_edge(edge);
            let resource = self.graph[to_index].resource.clone();
            return Err(Error::CyclicDependency { resource });
        }

        self.graph[to_index].depends_on.insert(*from);
        Ok(())
    }

    fn index_of(&self, id: &TaskId) -> Result<NodeIndex> {
        self.task_index
            .get(id)
            .copied()
            .ok_or_else(|| Error::Validation(format!("Task {} not found in graph", id)))
    }

    /// Get a reference to a task by its ID.
    pub fn get_task(&self, id: &TaskId) -> Option<&TaskNode> {
        self.task_index
            .get(id)
            .and_then(|&index| self.graph.node_weight(index))
    }

    /// Find the task acting on a logical resource name.
    pub fn find_by_resource(&self, resource: &str) -> Option<&TaskNode> {
        self.graph.node_weights().find(|t| t.resource == resource)
    }

    /// Apply a status transition to a task.
    ///
    /// # Errors
    /// Returns an error if the task is not found in the graph.
    pub fn apply(&mut self, id: &TaskId, update: TaskUpdate) -> Result<&TaskNode> {
        let index = self.index_of(id)?;
        let task = &mut self.graph[index];
        task.apply(update);
        Ok(task)
    }

    /// Get the number of tasks in the graph.
    pub fn task_count(&self) -> usize {
        self.graph.node_count()
    }

    /// Get the number of dependencies (edges) in the graph.
    pub fn dependency_count(&self) -> usize {
        self.graph.edge_count()
    }

    /// Check if a dependency exists between two tasks.
    pub fn has_dependency(&self, from: &TaskId, to: &TaskId) -> bool {
        self.get_dependency(from, to).is_some()
    }

    /// Get the dependency kind between two tasks, if one exists.
    pub fn get_dependency(&self, from: &TaskId, to: &TaskId) -> Option<DependencyKind> {
        let from_idx = self.task_index.get(from)?;
        let to_idx = self.task_index.get(to)?;
        let edge = self.graph.find_edge(*from_idx, *to_idx)?;
        self.graph.edge_weight(edge).copied()
    }

    /// Get all tasks that the given task depends on (predecessors).
    pub fn get_dependencies(&self, id: &TaskId) -> Vec<&TaskNode> {
        self.neighbors(id, Direction::Incoming)
    }

    /// Get all tasks that depend on the given task (successors).
    pub fn get_dependents(&self, id: &TaskId) -> Vec<&TaskNode> {
        self.neighbors(id, Direction::Outgoing)
    }

    fn neighbors(&self, id: &TaskId, direction: Direction) -> Vec<&TaskNode> {
        match self.task_index.get(id) {
            Some(&index) => self
                .graph
                .neighbors_directed(index, direction)
                .filter_map(|neighbor| self.graph.node_weight(neighbor))
                .collect(),
            None => Vec::new(),
        }
    }

    /// Every task reachable through outgoing edges, excluding `id` itself.
    pub fn transitive_dependents(&self, id: &TaskId) -> Vec<TaskId> {
        let Some(&start) = self.task_index.get(id) else {
            return Vec::new();
        };

        let mut bfs = Bfs::new(&self.graph, start);
        let mut found = Vec::new();
        while let Some(index) = bfs.next(&self.graph) {
            if index != start {
                found.push(self.graph[index].id);
            }
        }
        found
    }

    /// Iterate over all tasks in the graph.
    pub fn tasks(&self) -> impl Iterator<Item = &TaskNode> {
        self.graph.node_weights()
    }

    /// Check if the graph is empty.
    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    // ========== Scheduling Operations ==========

    /// Get all tasks ready to execute.
    ///
    /// A task is ready if it is pending and every dependency has succeeded.
    pub fn ready_tasks(&self) -> Vec<&TaskNode> {
        self.graph
            .node_indices()
            .filter_map(|index| {
                let task = self.graph.node_weight(index)?;
                if !task.can_start() {
                    return None;
                }

                let deps_satisfied = self
                    .graph
                    .neighbors_directed(index, Direction::Incoming)
                    .all(|dep| self.graph[dep].status == TaskStatus::Succeeded);

                deps_satisfied.then_some(task)
            })
            .collect()
    }

    /// Check if every task reached a terminal status.
    pub fn all_finished(&self) -> bool {
        self.graph.node_weights().all(TaskNode::is_finished)
    }

    /// Count tasks in the given status.
    pub fn count_status(&self, status: TaskStatus) -> usize {
        self.graph
            .node_weights()
            .filter(|t| t.status == status)
            .count()
    }

    /// Get tasks in topological order (respecting dependencies).
    ///
    /// # Errors
    /// Returns an error if the graph contains a cycle (should never happen
    /// since add_dependency validates against cycles).
    pub fn topological_order(&self) -> Result<Vec<&TaskNode>> {
        let sorted = toposort(&self.graph, None).map_err(|cycle| Error::CyclicDependency {
            resource: self.graph[cycle.node_id()].resource.clone(),
        })?;

        Ok(sorted
            .into_iter()
            .filter_map(|index| self.graph.node_weight(index))
            .collect())
    }
}

impl Default for TaskGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TaskGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskGraph")
            .field("tasks", &self.task_count())
            .field("dependencies", &self.dependency_count())
            .finish()
    }
}

/// One persisted edge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EdgeRecord {
    pub from: TaskId,
    pub to: TaskId,
    pub kind: DependencyKind,
}

/// Flat, durable form of a [`TaskGraph`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskGraphRecord {
    pub tasks: Vec<TaskNode>,
    #[serde(default)]
    pub edges: Vec<EdgeRecord>,
}

impl From<TaskGraph> for TaskGraphRecord {
    fn from(graph: TaskGraph) -> Self {
        let edges = graph
            .graph
            .edge_references()
            .map(|edge| EdgeRecord {
                from: graph.graph[edge.source()].id,
                to: graph.graph[edge.target()].id,
                kind: *edge.weight(),
            })
            .collect();
        let (nodes, _) = graph.graph.into_nodes_edges();
        Self {
            tasks: nodes.into_iter().map(|n| n.weight).collect(),
            edges,
        }
    }
}

impl TryFrom<TaskGraphRecord> for TaskGraph {
    type Error = Error;

    /// Rebuild a graph, re-validating references and acyclicity.
    fn try_from(record: TaskGraphRecord) -> Result<Self> {
        let mut graph = TaskGraph::new();
        for task in record.tasks {
            graph.add_task(task);
        }
        for edge in record.edges {
            graph.add_dependency(&edge.from, &edge.to, edge.kind)?;
        }
        Ok(graph)
    }
}
