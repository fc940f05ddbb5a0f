//! Validated task dependency graph
//!
//! A [`TaskGraph`] is immutable once built. The scheduler reads dependencies,
//! dependents and the canonical rank from it; status lives elsewhere.

mod builder;

pub use builder::TaskGraphBuilder;

use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;
use petgraph::Direction;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};

use crate::core::Result;
use crate::model::{TaskDescriptor, TaskId, TaskType};

/// `to` depends on `from`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DependencyEdge {
    pub from: TaskId,
    pub to: TaskId,
}

#[derive(Debug, Clone)]
pub struct TaskNode {
    pub id: TaskId,
    /// Position in the submitted batch
    pub submission: usize,
    pub descriptor: TaskDescriptor,
    /// Resolved dependency keys in declaration order
    pub dependencies: Vec<TaskId>,
}

/// Serializable view of the graph for status queries
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphSnapshot {
    pub nodes: Vec<GraphNodeView>,
    pub edges: Vec<DependencyEdge>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphNodeView {
    pub id: TaskId,
    pub task_type: TaskType,
    pub name: String,
    pub dependencies: Vec<TaskId>,
    pub level: usize,
    pub rank: usize,
}

#[derive(Debug, Clone)]
pub struct TaskGraph {
    graph: DiGraph<TaskNode, ()>,
    index: HashMap<TaskId, NodeIndex>,
    order: Vec<TaskId>,
    rank: HashMap<TaskId, usize>,
    levels: Vec<Vec<TaskId>>,
}

impl TaskGraph {
    pub fn builder() -> TaskGraphBuilder {
        TaskGraphBuilder::new()
    }

    /// Build a graph from descriptors in submission order
    pub fn from_descriptors<I>(descriptors: I) -> Result<Self>
    where
        I: IntoIterator<Item = TaskDescriptor>,
    {
        TaskGraphBuilder::new().add_tasks(descriptors).build()
    }

    fn assemble(
        graph: DiGraph<TaskNode, ()>,
        index: HashMap<TaskId, NodeIndex>,
        order: Vec<TaskId>,
        rank: HashMap<TaskId, usize>,
    ) -> Self {
        let mut task_graph = Self {
            graph,
            index,
            order,
            rank,
            levels: Vec::new(),
        };
        task_graph.levels = task_graph.compute_levels();
        task_graph
    }

    // Level = longest dependency chain below the task
    fn compute_levels(&self) -> Vec<Vec<TaskId>> {
        let mut node_levels: HashMap<&str, usize> = HashMap::new();
        let mut levels: Vec<Vec<TaskId>> = Vec::new();
        for id in &self.order {
            let level = self
                .dependencies(id)
                .iter()
                .filter_map(|dep| node_levels.get(dep.as_str()))
                .map(|l| l + 1)
                .max()
                .unwrap_or(0);
            node_levels.insert(id, level);
            while levels.len() <= level {
                levels.push(Vec::new());
            }
            levels[level].push(id.clone());
        }
        levels
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    pub fn node(&self, id: &str) -> Option<&TaskNode> {
        self.index.get(id).map(|&idx| &self.graph[idx])
    }

    /// Nodes in submission order
    pub fn nodes(&self) -> impl Iterator<Item = &TaskNode> {
        self.graph.node_indices().map(move |idx| &self.graph[idx])
    }

    /// Canonical topological order used as the dispatch tie-break
    pub fn order(&self) -> &[TaskId] {
        &self.order
    }

    pub fn rank(&self, id: &str) -> usize {
        self.rank.get(id).copied().unwrap_or(usize::MAX)
    }

    pub fn levels(&self) -> &[Vec<TaskId>] {
        &self.levels
    }

    pub fn dependencies(&self, id: &str) -> &[TaskId] {
        self.node(id).map(|n| n.dependencies.as_slice()).unwrap_or(&[])
    }

    /// Direct dependents in submission order
    pub fn dependents(&self, id: &str) -> Vec<TaskId> {
        let Some(&idx) = self.index.get(id) else {
            return Vec::new();
        };
        let mut dependents: Vec<&TaskNode> = self
            .graph
            .edges_directed(idx, Direction::Outgoing)
            .map(|edge| &self.graph[edge.target()])
            .collect();
        dependents.sort_by_key(|n| n.submission);
        dependents.into_iter().map(|n| n.id.clone()).collect()
    }

    /// Every task reachable downstream of `id`, in canonical order
    pub fn transitive_dependents(&self, id: &str) -> Vec<TaskId> {
        let mut seen: HashSet<TaskId> = HashSet::new();
        let mut queue: VecDeque<TaskId> = self.dependents(id).into();
        while let Some(next) = queue.pop_front() {
            if seen.insert(next.clone()) {
                queue.extend(self.dependents(&next));
            }
        }
        let mut result: Vec<TaskId> = seen.into_iter().collect();
        result.sort_by_key(|t| self.rank(t));
        result
    }

    pub fn edges(&self) -> Vec<DependencyEdge> {
        let mut edges: Vec<DependencyEdge> = self
            .nodes()
            .flat_map(|node| {
                node.dependencies.iter().map(move |dep| DependencyEdge {
                    from: dep.clone(),
                    to: node.id.clone(),
                })
            })
            .collect();
        edges.sort_by_key(|e| (self.rank(&e.to), self.rank(&e.from)));
        edges
    }

    pub fn level_of(&self, id: &str) -> usize {
        self.levels
            .iter()
            .position(|level| level.iter().any(|t| t == id))
            .unwrap_or(0)
    }

    pub fn snapshot(&self) -> GraphSnapshot {
        let nodes = self
            .order
            .iter()
            .filter_map(|id| self.node(id))
            .map(|node| GraphNodeView {
                id: node.id.clone(),
                task_type: node.descriptor.task_type.clone(),
                name: node.descriptor.name.clone(),
                dependencies: node.dependencies.clone(),
                level: self.level_of(&node.id),
                rank: self.rank(&node.id),
            })
            .collect();
        GraphSnapshot {
            nodes,
            edges: self.edges(),
        }
    }
}
