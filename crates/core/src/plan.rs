//! Plans: dependency graphs of tasks produced for one goal.
//!
//! A plan is only ever executed after [`Plan::validate`] has proven it is a
//! DAG with unique ids and no dangling references. [`Plan::waves`] then
//! yields the dependency waves the dispatcher runs one after another.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

use crate::error::PlanError;
use crate::task::{Task, TaskId};

/// A directed acyclic graph of tasks for one goal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    /// The goal this plan decomposes
    pub goal: String,

    /// Depth of this plan below the root goal (root = 0)
    #[serde(default)]
    pub depth: usize,

    /// Tasks in planner order
    pub tasks: Vec<Task>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Visiting,
    Done,
}

impl Plan {
    pub fn new(goal: impl Into<String>, tasks: Vec<Task>) -> Self {
        Self {
            goal: goal.into(),
            depth: 0,
            tasks,
        }
    }

    pub fn at_depth(mut self, depth: usize) -> Self {
        self.depth = depth;
        self
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn get(&self, id: &TaskId) -> Option<&Task> {
        self.tasks.iter().find(|t| &t.id == id)
    }

    /// How many levels of sub-plans hang below this plan.
    pub fn nesting(&self) -> usize {
        self.tasks
            .iter()
            .filter_map(|t| t.subplan.as_deref())
            .map(|sub| 1 + sub.nesting())
            .max()
            .unwrap_or(0)
    }

    /// Depth of the most deeply nested plan, counting from this plan's own
    /// depth. A sub-plan that declares a larger depth than its position
    /// implies keeps the larger value.
    pub fn deepest(&self) -> usize {
        self.tasks
            .iter()
            .filter_map(|t| t.subplan.as_deref())
            .map(|sub| sub.deepest().max(self.depth + 1 + sub.nesting()))
            .max()
            .unwrap_or(0)
            .max(self.depth)
    }

    pub fn task_ids(&self) -> impl Iterator<Item = &TaskId> {
        self.tasks.iter().map(|t| &t.id)
    }

    /// Check structure: non-empty, unique ids, no dangling dependencies,
    /// acyclic. Nested sub-plans are validated as well.
    pub fn validate(&self) -> Result<(), PlanError> {
        if self.tasks.is_empty() {
            return Err(PlanError::Empty(self.goal.clone()));
        }

        let mut seen = HashSet::new();
        for task in &self.tasks {
            if !seen.insert(&task.id) {
                return Err(PlanError::DuplicateTask(task.id.clone()));
            }
        }

        for task in &self.tasks {
            if let Some(dep) = task.depends_on.iter().find(|d| !seen.contains(d)) {
                return Err(PlanError::DanglingDependency {
                    task: task.id.clone(),
                    dependency: dep.clone(),
                });
            }
        }

        self.check_acyclic()?;

        for task in &self.tasks {
            if let Some(sub) = &task.subplan {
                sub.validate()?;
            }
        }

        Ok(())
    }

    fn check_acyclic(&self) -> Result<(), PlanError> {
        let index: HashMap<&TaskId, &Task> = self.tasks.iter().map(|t| (&t.id, t)).collect();
        let mut marks: HashMap<&TaskId, Mark> = HashMap::new();
        let mut stack: Vec<&TaskId> = Vec::new();

        for task in &self.tasks {
            if !marks.contains_key(&task.id) {
                Self::visit(&task.id, &index, &mut marks, &mut stack)?;
            }
        }
        Ok(())
    }

    fn visit<'a>(
        id: &'a TaskId,
        index: &HashMap<&'a TaskId, &'a Task>,
        marks: &mut HashMap<&'a TaskId, Mark>,
        stack: &mut Vec<&'a TaskId>,
    ) -> Result<(), PlanError> {
        marks.insert(id, Mark::Visiting);
        stack.push(id);

        if let Some(&task) = index.get(id) {
            for dep in &task.depends_on {
                match marks.get(dep) {
                    Some(Mark::Done) => {}
                    Some(Mark::Visiting) => {
                        let start = stack.iter().position(|s| *s == dep).unwrap_or(0);
                        let mut path: Vec<String> =
                            stack[start..].iter().map(|s| s.to_string()).collect();
                        path.push(dep.to_string());
                        return Err(PlanError::Cycle { path });
                    }
                    None => Self::visit(dep, index, marks, stack)?,
                }
            }
        }

        stack.pop();
        marks.insert(id, Mark::Done);
        Ok(())
    }

    /// Group tasks into dependency waves.
    ///
    /// A task lands in the wave after the latest wave of any of its
    /// dependencies, so tasks sharing a wave never depend on each other.
    /// Within a wave, tasks keep planner order.
    pub fn waves(&self) -> Result<Vec<Vec<TaskId>>, PlanError> {
        self.validate()?;

        let mut level: HashMap<&TaskId, usize> = HashMap::new();
        let mut remaining: Vec<&Task> = self.tasks.iter().collect();

        // Validation guarantees every pass resolves at least one task.
        while !remaining.is_empty() {
            let mut next = Vec::with_capacity(remaining.len());
            for task in remaining {
                let resolved: Option<usize> = task
                    .depends_on
                    .iter()
                    .map(|d| level.get(d).copied())
                    .try_fold(0usize, |acc, l| l.map(|l| acc.max(l + 1)));
                match resolved {
                    Some(l) => {
                        level.insert(&task.id, l);
                    }
                    None => next.push(task),
                }
            }
            remaining = next;
        }

        let depth = level.values().copied().max().map_or(0, |m| m + 1);
        let mut waves = vec![Vec::new(); depth];
        for task in &self.tasks {
            waves[level[&task.id]].push(task.id.clone());
        }
        Ok(waves)
    }
}
