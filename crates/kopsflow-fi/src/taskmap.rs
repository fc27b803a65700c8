//! Task map: deduplicated tasks and the dependency graph between them

use crate::error::{FiError, Result};
use crate::task::{Task, TaskKey, TaskRef, collect_refs};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct TaskEntry {
    pub task: Arc<dyn Task>,
    pub inputs: Value,
    pub dependencies: Vec<TaskKey>,
    /// Satisfied by an earlier phase: resolved, never run
    pub reference_only: bool,
}

#[derive(Debug, Default)]
pub struct TaskMap {
    tasks: BTreeMap<TaskKey, TaskEntry>,
}

impl TaskMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a task, collapsing it into an identical task with the same key
    pub fn add<T: Task + 'static>(&mut self, task: T) -> Result<TaskRef> {
        self.insert(Arc::new(task), false)
    }

    /// Add a task other tasks may reference but the executor must not run
    pub fn add_reference<T: Task + 'static>(&mut self, task: T) -> Result<TaskRef> {
        self.insert(Arc::new(task), true)
    }

    pub fn insert(&mut self, task: Arc<dyn Task>, reference_only: bool) -> Result<TaskRef> {
        let key = task.key();
        let inputs = task.inputs()?;

        if let Some(existing) = self.tasks.get_mut(&key) {
            if existing.inputs != inputs {
                return Err(FiError::ConflictingTask {
                    detail: describe_conflict(&existing.inputs, &inputs),
                    key,
                });
            }
            existing.reference_only &= reference_only;
            tracing::debug!("Task {} added twice with identical fields", key);
            return Ok(TaskRef(key));
        }

        let mut dependencies: Vec<TaskKey> = collect_refs(&inputs)
            .into_iter()
            .map(|r| r.0)
            .collect();
        dependencies.sort();
        dependencies.dedup();

        self.tasks.insert(
            key.clone(),
            TaskEntry {
                task,
                inputs,
                dependencies,
                reference_only,
            },
        );
        Ok(TaskRef(key))
    }

    /// Absorb another map, with the same collapsing rules as [`TaskMap::add`]
    pub fn merge(&mut self, other: TaskMap) -> Result<()> {
        for (_, entry) in other.tasks {
            self.insert(entry.task, entry.reference_only)?;
        }
        Ok(())
    }

    pub fn get(&self, key: &TaskKey) -> Option<&TaskEntry> {
        self.tasks.get(key)
    }

    pub fn contains(&self, key: &TaskKey) -> bool {
        self.tasks.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&TaskKey, &TaskEntry)> {
        self.tasks.iter()
    }

    pub fn keys(&self) -> impl Iterator<Item = &TaskKey> {
        self.tasks.keys()
    }

    /// Mark every task as reference-only
    pub fn into_references(mut self) -> TaskMap {
        for entry in self.tasks.values_mut() {
            entry.reference_only = true;
        }
        self
    }

    /// Check references and acyclicity; returns a deterministic topological
    /// order
    pub fn validate(&self) -> Result<Vec<TaskKey>> {
        for (key, entry) in &self.tasks {
            for dep in &entry.dependencies {
                if !self.tasks.contains_key(dep) {
                    return Err(FiError::MissingReference {
                        from: key.clone(),
                        to: dep.clone(),
                    });
                }
            }
        }

        if let Some(cycle) = self.find_cycle() {
            let path: Vec<String> = cycle.iter().map(|k| k.to_string()).collect();
            return Err(FiError::Cycle(path.join(" -> ")));
        }

        let mut remaining: BTreeMap<&TaskKey, usize> = self
            .tasks
            .iter()
            .map(|(k, e)| (k, e.dependencies.len()))
            .collect();
        let mut ready: BTreeSet<&TaskKey> = remaining
            .iter()
            .filter(|(_, n)| **n == 0)
            .map(|(k, _)| *k)
            .collect();
        let mut order = Vec::with_capacity(self.tasks.len());

        while let Some(key) = ready.pop_first() {
            remaining.remove(key);
            order.push(key.clone());
            for (other, entry) in &self.tasks {
                if entry.dependencies.contains(key)
                    && let Some(count) = remaining.get_mut(other)
                {
                    *count -= 1;
                    if *count == 0 {
                        ready.insert(other);
                    }
                }
            }
        }

        Ok(order)
    }

    fn find_cycle(&self) -> Option<Vec<TaskKey>> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Visiting,
            Done,
        }

        fn visit<'a>(
            map: &'a BTreeMap<TaskKey, TaskEntry>,
            key: &'a TaskKey,
            marks: &mut BTreeMap<&'a TaskKey, Mark>,
            stack: &mut Vec<&'a TaskKey>,
        ) -> Option<Vec<TaskKey>> {
            match marks.get(key) {
                Some(Mark::Done) => return None,
                Some(Mark::Visiting) => {
                    let start = stack.iter().position(|k| *k == key).unwrap_or(0);
                    let mut cycle: Vec<TaskKey> = stack[start..].iter().map(|k| (*k).clone()).collect();
                    cycle.push(key.clone());
                    return Some(cycle);
                }
                None => {}
            }

            marks.insert(key, Mark::Visiting);
            stack.push(key);
            if let Some(entry) = map.get(key) {
                for dep in &entry.dependencies {
                    if let Some(cycle) = visit(map, dep, marks, stack) {
                        return Some(cycle);
                    }
                }
            }
            stack.pop();
            marks.insert(key, Mark::Done);
            None
        }

        let mut marks = BTreeMap::new();
        let mut stack = Vec::new();
        self.tasks
            .keys()
            .find_map(|key| visit(&self.tasks, key, &mut marks, &mut stack))
    }
}

fn describe_conflict(a: &Value, b: &Value) -> String {
    match (a.as_object(), b.as_object()) {
        (Some(a), Some(b)) => {
            let fields: BTreeSet<&String> = a
                .keys()
                .chain(b.keys())
                .filter(|k| a.get(*k) != b.get(*k))
                .collect();
            let fields: Vec<&str> = fields.into_iter().map(String::as_str).collect();
            format!("fields differ: {}", fields.join(", "))
        }
        _ => "values differ".to_string(),
    }
}
