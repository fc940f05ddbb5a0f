use petgraph::graph::DiGraph;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};
use tracing::{debug, warn};

use super::{TaskGraph, TaskNode};
use crate::core::{OrchestraError, Result};
use crate::model::{TaskDescriptor, TaskId};

/// Collects task descriptors and validates them into a [`TaskGraph`]
#[derive(Debug, Default)]
pub struct TaskGraphBuilder {
    descriptors: Vec<TaskDescriptor>,
}

impl TaskGraphBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_task(mut self, descriptor: TaskDescriptor) -> Self {
        self.descriptors.push(descriptor);
        self
    }

    pub fn add_tasks<I: IntoIterator<Item = TaskDescriptor>>(mut self, descriptors: I) -> Self {
        self.descriptors.extend(descriptors);
        self
    }

    /// Validate the batch and build the graph
    ///
    /// Fails with `EmptyBatch`, `DuplicateTask`, `UnknownDependency`,
    /// `AmbiguousDependency` or `CycleDetected`. No partial graph is produced.
    pub fn build(self) -> Result<TaskGraph> {
        if self.descriptors.is_empty() {
            return Err(OrchestraError::EmptyBatch);
        }

        let keys = self.collect_keys()?;
        let resolved = self.resolve_dependencies(&keys)?;

        let deps_by_index: Vec<Vec<usize>> = resolved
            .iter()
            .map(|deps| deps.iter().filter_map(|d| keys.get(d).copied()).collect())
            .collect();
        let ids: Vec<TaskId> = self.descriptors.iter().map(|d| d.effective_key()).collect();

        if let Err(cycle) = detect_cycle(&deps_by_index) {
            let cycle: Vec<String> = cycle.into_iter().map(|i| ids[i].clone()).collect();
            warn!(cycle = ?cycle, "Rejected task batch with a dependency cycle");
            return Err(OrchestraError::CycleDetected { cycle });
        }

        // Edges point from a dependency to its dependent
        let mut graph = DiGraph::with_capacity(self.descriptors.len(), 0);
        let mut index = HashMap::with_capacity(self.descriptors.len());
        for (submission, (descriptor, dependencies)) in
            self.descriptors.into_iter().zip(resolved).enumerate()
        {
            let id = descriptor.effective_key();
            let node = graph.add_node(TaskNode {
                id: id.clone(),
                submission,
                descriptor,
                dependencies,
            });
            index.insert(id, node);
        }
        for (to, deps) in deps_by_index.iter().enumerate() {
            for &from in deps {
                graph.add_edge(
                    petgraph::graph::NodeIndex::new(from),
                    petgraph::graph::NodeIndex::new(to),
                    (),
                );
            }
        }

        let order = canonical_order(&deps_by_index);
        let order: Vec<TaskId> = order.into_iter().map(|i| ids[i].clone()).collect();
        let rank = order
            .iter()
            .enumerate()
            .map(|(pos, id)| (id.clone(), pos))
            .collect();

        let task_graph = TaskGraph::assemble(graph, index, order, rank);
        debug!(
            tasks = task_graph.len(),
            levels = task_graph.levels().len(),
            "Task graph built"
        );
        Ok(task_graph)
    }

    fn collect_keys(&self) -> Result<HashMap<TaskId, usize>> {
        let mut keys = HashMap::with_capacity(self.descriptors.len());
        for (i, descriptor) in self.descriptors.iter().enumerate() {
            let key = descriptor.effective_key();
            if keys.insert(key.clone(), i).is_some() {
                return Err(OrchestraError::DuplicateTask { task: key });
            }
        }
        Ok(keys)
    }

    /// Resolve each reference to a task key: exact key first, then a unique task type
    fn resolve_dependencies(&self, keys: &HashMap<TaskId, usize>) -> Result<Vec<Vec<TaskId>>> {
        let mut resolved = Vec::with_capacity(self.descriptors.len());
        for descriptor in &self.descriptors {
            let task = descriptor.effective_key();
            let mut deps: Vec<TaskId> = Vec::with_capacity(descriptor.dependencies.len());
            let mut seen = HashSet::new();

            for reference in &descriptor.dependencies {
                let reference = reference.trim();
                let dep = if keys.contains_key(reference) {
                    reference.to_string()
                } else {
                    let candidates: Vec<TaskId> = self
                        .descriptors
                        .iter()
                        .filter(|d| d.task_type.matches(reference))
                        .map(|d| d.effective_key())
                        .collect();
                    match candidates.len() {
                        0 => {
                            return Err(OrchestraError::UnknownDependency {
                                task,
                                dependency: reference.to_string(),
                            })
                        }
                        1 => candidates.into_iter().next().unwrap_or_default(),
                        _ => {
                            return Err(OrchestraError::AmbiguousDependency {
                                task,
                                dependency: reference.to_string(),
                                candidates,
                            })
                        }
                    }
                };

                if dep == task {
                    return Err(OrchestraError::CycleDetected {
                        cycle: vec![task.clone(), task],
                    });
                }
                if seen.insert(dep.clone()) {
                    deps.push(dep);
                }
            }
            resolved.push(deps);
        }
        Ok(resolved)
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Unvisited,
    InProgress,
    Done,
}

/// Depth-first search over dependency edges; `Err` carries the cycle path
///
/// Iterative so that long dependency chains cannot exhaust the thread stack.
fn detect_cycle(deps: &[Vec<usize>]) -> std::result::Result<(), Vec<usize>> {
    let mut marks = vec![Mark::Unvisited; deps.len()];
    // (node, index of the next dependency to visit); doubles as the current path
    let mut stack: Vec<(usize, usize)> = Vec::new();
    for start in 0..deps.len() {
        if marks[start] != Mark::Unvisited {
            continue;
        }
        marks[start] = Mark::InProgress;
        stack.push((start, 0));

        while let Some(top) = stack.last_mut() {
            let (node, next) = *top;
            let Some(&dep) = deps[node].get(next) else {
                marks[node] = Mark::Done;
                stack.pop();
                continue;
            };
            top.1 += 1;
            match marks[dep] {
                Mark::Unvisited => {
                    marks[dep] = Mark::InProgress;
                    stack.push((dep, 0));
                }
                Mark::InProgress => {
                    let from = stack.iter().position(|&(n, _)| n == dep).unwrap_or(0);
                    let mut cycle: Vec<usize> = stack[from..].iter().map(|&(n, _)| n).collect();
                    cycle.push(dep);
                    return Err(cycle);
                }
                Mark::Done => {}
            }
        }
    }
    Ok(())
}

/// Kahn's algorithm, always taking the ready task with the lowest submission index
fn canonical_order(deps: &[Vec<usize>]) -> Vec<usize> {
    let mut in_degree: Vec<usize> = deps.iter().map(Vec::len).collect();
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); deps.len()];
    for (task, task_deps) in deps.iter().enumerate() {
        for &dep in task_deps {
            dependents[dep].push(task);
        }
    }

    let mut ready: BinaryHeap<Reverse<usize>> = in_degree
        .iter()
        .enumerate()
        .filter(|(_, d)| **d == 0)
        .map(|(i, _)| Reverse(i))
        .collect();

    let mut order = Vec::with_capacity(deps.len());
    while let Some(Reverse(task)) = ready.pop() {
        order.push(task);
        for &dependent in &dependents[task] {
            in_degree[dependent] -= 1;
            if in_degree[dependent] == 0 {
                ready.push(Reverse(dependent));
            }
        }
    }
    order
}
