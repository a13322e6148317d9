//! Task registry and dependency graph.
//!
//! `TaskDAG` owns every registered task and mirrors their dependency edges
//! in a petgraph graph. Predecessors may be referenced before they are
//! registered; such ids get a placeholder node so that edges, cycle checks
//! and reverse lookups work regardless of registration order.

use crate::core::task::{DependencyType, Task, TaskId, TaskStatus};
use crate::error::{Error, Result};
use petgraph::algo::{has_path_connecting, toposort};
use petgraph::stable_graph::{NodeIndex, StableDiGraph};
use petgraph::visit::EdgeRef;
use petgraph::Direction;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};

/// The task dependency graph.
///
/// Edges point from predecessor to dependent.
pub struct TaskDAG {
    graph: StableDiGraph<TaskId, DependencyType>,
    node_index: HashMap<TaskId, NodeIndex>,
    tasks: HashMap<TaskId, Task>,
    /// Registration order, used for deterministic iteration.
    order: Vec<TaskId>,
}

impl TaskDAG {
    /// Create a new empty TaskDAG.
    pub fn new() -> Self {
        Self {
            graph: StableDiGraph::new(),
            node_index: HashMap::new(),
            tasks: HashMap::new(),
            order: Vec::new(),
        }
    }

    fn node_for(&mut self, id: &TaskId) -> NodeIndex {
        if let Some(&index) = self.node_index.get(id) {
            return index;
        }
        let index = self.graph.add_node(id.clone());
        self.node_index.insert(id.clone(), index);
        index
    }

    /// Register a task.
    ///
    /// # Errors
    /// - `DuplicateTask` if a task with the same id is already registered
    /// - `DependencyCycle` if the task's edges would close a cycle
    pub fn add_task(&mut self, mut task: Task) -> Result<()> {
        if self.tasks.contains_key(&task.id) {
            return Err(Error::DuplicateTask(task.id));
        }

        let index = self.node_for(&task.id);

        // Adding pred -> task closes a cycle iff task already reaches pred.
        for dep in &task.dependencies {
            if dep.task_id == task.id {
                return Err(Error::DependencyCycle { id: task.id.clone() });
            }
            if let Some(&pred_index) = self.node_index.get(&dep.task_id) {
                if has_path_connecting(&self.graph, index, pred_index, None) {
                    return Err(Error::DependencyCycle { id: task.id.clone() });
                }
            }
        }

        for dep in &task.dependencies {
            let pred_index = self.node_for(&dep.task_id);
            self.graph.add_edge(pred_index, index, dep.kind);
            if let Some(pred) = self.tasks.get_mut(&dep.task_id) {
                pred.dependents.insert(task.id.clone());
            }
        }

        // Dependents registered before this task already hold edges to it.
        for dependent in self.graph.neighbors_directed(index, Direction::Outgoing) {
            if let Some(id) = self.graph.node_weight(dependent) {
                task.dependents.insert(id.clone());
            }
        }

        self.order.push(task.id.clone());
        self.tasks.insert(task.id.clone(), task);
        Ok(())
    }

    /// Get a reference to a task by its ID.
    pub fn get_task(&self, id: &TaskId) -> Option<&Task> {
        self.tasks.get(id)
    }

    /// Get a mutable reference to a task by its ID.
    pub fn get_task_mut(&mut self, id: &TaskId) -> Option<&mut Task> {
        self.tasks.get_mut(id)
    }

    /// Check if the DAG contains a registered task.
    pub fn contains_task(&self, id: &TaskId) -> bool {
        self.tasks.contains_key(id)
    }

    /// Number of registered tasks.
    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    /// Number of dependency edges, including edges to unregistered ids.
    pub fn dependency_count(&self) -> usize {
        self.graph.edge_count()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// All registered tasks in registration order.
    pub fn all_tasks(&self) -> Vec<&Task> {
        self.order
            .iter()
            .filter_map(|id| self.tasks.get(id))
            .collect()
    }

    /// Registered predecessors of a task.
    pub fn get_dependencies(&self, id: &TaskId) -> Vec<&Task> {
        self.tasks
            .get(id)
            .map(|task| {
                task.dependencies
                    .iter()
                    .filter_map(|dep| self.tasks.get(&dep.task_id))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Registered tasks that depend on the given task.
    pub fn get_dependents(&self, id: &TaskId) -> Vec<&Task> {
        self.tasks
            .get(id)
            .map(|task| {
                task.dependents
                    .iter()
                    .filter_map(|d| self.tasks.get(d))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Whether a waiting task's dependency conditions all hold.
    ///
    /// Unknown tasks and missing predecessors are not ready.
    pub fn is_ready(&self, id: &TaskId) -> bool {
        self.tasks
            .get(id)
            .map(|task| task.is_ready_with(|dep| self.tasks.get(dep)))
            .unwrap_or(false)
    }

    /// Results of a task's `Data` predecessors, keyed by predecessor id.
    pub fn dependency_results(&self, id: &TaskId) -> BTreeMap<String, Value> {
        let Some(task) = self.tasks.get(id) else {
            return BTreeMap::new();
        };
        task.dependencies
            .iter()
            .filter(|dep| dep.kind == DependencyType::Data)
            .filter_map(|dep| {
                let pred = self.tasks.get(&dep.task_id)?;
                let result = pred.result.clone()?;
                Some((dep.task_id.to_string(), result))
            })
            .collect()
    }

    /// First dependency of a waiting task that is missing or can no longer
    /// be satisfied.
    pub fn starved_dependency(&self, id: &TaskId) -> Option<TaskId> {
        let task = self.tasks.get(id)?;
        if !task.is_waiting() {
            return None;
        }
        task.dependencies
            .iter()
            .find(|dep| match self.tasks.get(&dep.task_id) {
                None => true,
                Some(pred) => dep.is_unsatisfiable_by(pred),
            })
            .map(|dep| dep.task_id.clone())
    }

    /// Registered tasks in dependency order.
    pub fn topological_order(&self) -> Result<Vec<&Task>> {
        let sorted = toposort(&self.graph, None).map_err(|cycle| {
            let id = self
                .graph
                .node_weight(cycle.node_id())
                .map(|id| id.to_string())
                .unwrap_or_else(|| "unknown".to_string());
            Error::Validation(format!("Cycle detected at task: {}", id))
        })?;

        Ok(sorted
            .into_iter()
            .filter_map(|index| self.graph.node_weight(index))
            .filter_map(|id| self.tasks.get(id))
            .collect())
    }

    /// Remove a terminal task that no waiting or running task depends on.
    ///
    /// Returns the removed task, or `None` if it is absent, still live, or
    /// still referenced.
    pub fn remove_task(&mut self, id: &TaskId) -> Option<Task> {
        let task = self.tasks.get(id)?;
        if !task.is_finished() {
            return None;
        }
        let referenced = task
            .dependents
            .iter()
            .filter_map(|d| self.tasks.get(d))
            .any(|d| !d.is_finished());
        if referenced {
            return None;
        }

        let task = self.tasks.remove(id)?;
        self.order.retain(|o| o != id);

        if let Some(&index) = self.node_index.get(id) {
            let incoming: Vec<NodeIndex> = self
                .graph
                .neighbors_directed(index, Direction::Incoming)
                .collect();
            for pred in incoming {
                if let Some(pred_id) = self.graph.node_weight(pred).cloned() {
                    if let Some(p) = self.tasks.get_mut(&pred_id) {
                        p.dependents.remove(id);
                    }
                }
            }
            // Keep the node while finished dependents still point at it.
            if self
                .graph
                .neighbors_directed(index, Direction::Outgoing)
                .next()
                .is_none()
            {
                self.graph.remove_node(index);
                self.node_index.remove(id);
            } else {
                let edges: Vec<_> = self
                    .graph
                    .edges_directed(index, Direction::Incoming)
                    .map(|e| e.id())
                    .collect();
                for edge in edges {
                    self.graph.remove_edge(edge);
                }
            }
        }

        Some(task)
    }

    /// Count tasks in each status.
    pub fn status_counts(&self) -> HashMap<TaskStatus, usize> {
        let mut counts = HashMap::new();
        for task in self.tasks.values() {
            *counts.entry(task.status).or_insert(0) += 1;
        }
        counts
    }
}

impl Default for TaskDAG {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TaskDAG {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskDAG")
            .field("tasks", &self.task_count())
            .field("dependencies", &self.dependency_count())
            .finish()
    }
}
