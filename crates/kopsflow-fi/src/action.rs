//! Actions recorded by the executor and the apply report

use crate::changes::FieldChange;
use crate::error::{FiError, Result};
use serde::Serialize;
use std::fmt;

/// A change the executor made (or, on dry-run, would make)
#[derive(Debug, Clone, Serialize)]
pub struct Action {
    /// `Type/name` of the task
    pub task: String,

    pub action_type: ActionType,

    /// Fields that differ
    pub changes: Vec<FieldChange>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    Create,
    Update,
    /// An immutable field changed
    Recreate,
    /// Observed differences left alone because of the task's lifecycle
    Warn,
    NoOp,
}

impl fmt::Display for ActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActionType::Create => write!(f, "create"),
            ActionType::Update => write!(f, "update"),
            ActionType::Recreate => write!(f, "recreate"),
            ActionType::Warn => write!(f, "warn"),
            ActionType::NoOp => write!(f, "no-op"),
        }
    }
}

/// Result of one executor run
#[derive(Debug, Clone, Default, Serialize)]
pub struct ApplyReport {
    pub actions: Vec<Action>,

    /// Tasks that failed, with their error
    pub failed: Vec<TaskFailure>,

    /// Tasks not run because a dependency failed or the run was cancelled
    pub skipped: Vec<String>,

    /// Total execution time in milliseconds
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskFailure {
    pub task: String,
    pub error: String,
}

impl ApplyReport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_success(&self) -> bool {
        self.failed.is_empty() && self.skipped.is_empty()
    }

    /// Whether any task changed (or would change) something
    pub fn has_changes(&self) -> bool {
        self.actions
            .iter()
            .any(|a| !matches!(a.action_type, ActionType::NoOp | ActionType::Warn))
    }

    pub fn record(&mut self, action: Action) {
        self.actions.push(action);
    }

    pub fn add_failure(&mut self, task: String, error: String) {
        self.failed.push(TaskFailure { task, error });
    }

    pub fn actions_by_type(&self, action_type: ActionType) -> Vec<&Action> {
        self.actions
            .iter()
            .filter(|a| a.action_type == action_type)
            .collect()
    }

    pub fn summary(&self) -> ApplySummary {
        ApplySummary {
            create: self.actions_by_type(ActionType::Create).len(),
            update: self.actions_by_type(ActionType::Update).len()
                + self.actions_by_type(ActionType::Recreate).len(),
            no_change: self.actions_by_type(ActionType::NoOp).len()
                + self.actions_by_type(ActionType::Warn).len(),
            failed: self.failed.len(),
        }
    }

    /// Turn failures into an error
    pub fn into_result(self) -> Result<ApplyReport> {
        if self.failed.is_empty() && self.skipped.is_empty() {
            return Ok(self);
        }
        let summary = self
            .failed
            .iter()
            .map(|f| format!("{}: {}", f.task, f.error))
            .collect::<Vec<_>>()
            .join("; ");
        Err(FiError::ApplyFailed {
            count: self.failed.len() + self.skipped.len(),
            summary,
        })
    }
}

/// Counts of actions in a report
#[derive(Debug, Clone)]
pub struct ApplySummary {
    pub create: usize,
    pub update: usize,
    pub no_change: usize,
    pub failed: usize,
}

impl fmt::Display for ApplySummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} to create, {} to update, {} unchanged",
            self.create, self.update, self.no_change
        )?;
        if self.failed > 0 {
            write!(f, ", {} failed", self.failed)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn action(task: &str, action_type: ActionType) -> Action {
        Action {
            task: task.into(),
            action_type,
            changes: vec![],
        }
    }

    #[test]
    fn test_has_changes() {
        let mut report = ApplyReport::new();
        report.record(action("Vpc/a", ActionType::NoOp));
        report.record(action("Subnet/a", ActionType::Warn));
        assert!(!report.has_changes());

        report.record(action("Subnet/b", ActionType::Create));
        assert!(report.has_changes());
        assert_eq!(report.summary().to_string(), "1 to create, 0 to update, 2 unchanged");
    }

    #[test]
    fn test_into_result() {
        let mut report = ApplyReport::new();
        report.add_failure("Vpc/a".into(), "boom".into());
        report.skipped.push("Subnet/a".into());
        let err = report.into_result().unwrap_err();
        assert_eq!(err.to_string(), "2 task(s) failed: Vpc/a: boom");
    }
}
