//! Dependency graph for validating task dependency edges.
//!
//! Design:
//! - Forward edges: task -> tasks it depends on (waits for)
//! - Reverse edges: task -> tasks that depend on it
//! - Invariant: edges and reverse_edges must be kept in sync
//!
//! Eligibility itself is computed by the store on every claim; this graph is
//! only used at edge-insertion time to reject cycles, which would otherwise
//! deadlock eligibility permanently.

use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};

use crate::domain::TaskId;

#[derive(Debug, Default)]
pub struct DependencyGraph {
    /// Forward edges: task -> tasks it depends on.
    edges: HashMap<TaskId, HashSet<TaskId>>,

    /// Reverse edges: task -> tasks that depend on it.
    reverse_edges: HashMap<TaskId, HashSet<TaskId>>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a dependency: `task` depends on `depends_on`.
    ///
    /// Updates both directions to keep the invariant.
    pub fn add_dependency(&mut self, task: TaskId, depends_on: TaskId) {
        self.edges.entry(task).or_default().insert(depends_on);
        self.reverse_edges
            .entry(depends_on)
            .or_default()
            .insert(task);
    }

    /// Remove a dependency edge, dropping empty entries on both sides.
    pub fn remove_dependency(&mut self, task: TaskId, depends_on: TaskId) {
        if let Entry::Occupied(mut e) = self.edges.entry(task) {
            e.get_mut().remove(&depends_on);
            if e.get().is_empty() {
                e.remove_entry();
            }
        }
        if let Entry::Occupied(mut e) = self.reverse_edges.entry(depends_on) {
            e.get_mut().remove(&task);
            if e.get().is_empty() {
                e.remove_entry();
            }
        }
    }

    pub fn has_dependencies(&self, task: TaskId) -> bool {
        self.edges.get(&task).is_some_and(|deps| !deps.is_empty())
    }

    pub fn dependencies(&self, task: TaskId) -> Vec<TaskId> {
        self.edges
            .get(&task)
            .map(|deps| deps.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Tasks waiting on `completed`. Callers must still check their
    /// remaining dependencies.
    pub fn waiting_on(&self, completed: TaskId) -> Vec<TaskId> {
        self.reverse_edges
            .get(&completed)
            .map(|waiting| waiting.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Find a cycle, if any. Returns the cycle path (first node repeated
    /// implicitly), or None when the graph is a DAG.
    ///
    /// Iterative three-color DFS: gray means "on the current path", so a
    /// gray neighbor closes a cycle; black nodes are fully explored and
    /// never revisited.
    pub fn find_cycle(&self) -> Option<Vec<TaskId>> {
        #[derive(Clone, Copy, PartialEq)]
        enum Color {
            Gray,
            Black,
        }

        enum Step {
            Enter(TaskId),
            Exit(TaskId),
        }

        let mut colors: HashMap<TaskId, Color> = HashMap::new();
        let mut path: Vec<TaskId> = Vec::new();

        for &start in self.edges.keys() {
            if colors.contains_key(&start) {
                continue;
            }

            let mut stack = vec![Step::Enter(start)];
            while let Some(step) = stack.pop() {
                match step {
                    Step::Enter(node) => {
                        match colors.get(&node) {
                            Some(Color::Gray) => {
                                // Cycle closed: slice the current path from
                                // the first occurrence of `node`.
                                let pos = path.iter().position(|&n| n == node).unwrap_or(0);
                                return Some(path[pos..].to_vec());
                            }
                            Some(Color::Black) => continue,
                            None => {}
                        }
                        colors.insert(node, Color::Gray);
                        path.push(node);
                        stack.push(Step::Exit(node));
                        if let Some(deps) = self.edges.get(&node) {
                            for &dep in deps {
                                match colors.get(&dep) {
                                    Some(Color::Gray) => {
                                        let pos =
                                            path.iter().position(|&n| n == dep).unwrap_or(0);
                                        return Some(path[pos..].to_vec());
                                    }
                                    Some(Color::Black) => {}
                                    None => stack.push(Step::Enter(dep)),
                                }
                            }
                        }
                    }
                    Step::Exit(node) => {
                        colors.insert(node, Color::Black);
                        path.pop();
                    }
                }
            }
        }

        None
    }

    /// Would adding `task -> depends_on` close a cycle?
    pub fn would_cycle(&mut self, task: TaskId, depends_on: TaskId) -> Option<Vec<TaskId>> {
        if task == depends_on {
            return Some(vec![task]);
        }
        self.add_dependency(task, depends_on);
        let cycle = self.find_cycle();
        self.remove_dependency(task, depends_on);
        cycle
    }
}
