//! Task graph executor
//!
//! Validates the task map (missing references, cycles) before anything runs,
//! then schedules tasks whose predecessors all succeeded on a bounded pool of
//! workers. A failed task skips its dependents; independent subtrees keep
//! going so the report lists every problem.

use crate::action::{Action, ActionType, ApplyReport};
use crate::changes::{Changes, diff};
use crate::context::Context;
use crate::error::{FiError, Result};
use crate::target::Target;
use crate::task::{Lifecycle, Task, TaskKey};
use crate::taskmap::TaskMap;
use kopsflow_cloud::RetryConfig;
use serde_json::{Value, json};
use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinSet;

/// Lifecycle overrides by task type or by exact task identity
#[derive(Debug, Clone, Default)]
pub struct LifecycleOverrides {
    by_type: HashMap<String, Lifecycle>,
    by_key: HashMap<TaskKey, Lifecycle>,
}

impl LifecycleOverrides {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse `Type=Lifecycle` or `Type/name=Lifecycle` entries
    pub fn parse<S: AsRef<str>>(entries: &[S]) -> Result<Self> {
        let mut overrides = Self::new();
        for entry in entries {
            let entry = entry.as_ref();
            let (target, lifecycle) = entry
                .split_once('=')
                .ok_or_else(|| FiError::UnknownLifecycle(entry.to_string()))?;
            let lifecycle: Lifecycle = lifecycle.trim().parse()?;
            let target = target.trim();
            if target.contains('/') {
                overrides.by_key.insert(target.parse()?, lifecycle);
            } else {
                overrides.by_type.insert(target.to_string(), lifecycle);
            }
        }
        Ok(overrides)
    }

    pub fn set_type(&mut self, type_name: impl Into<String>, lifecycle: Lifecycle) {
        self.by_type.insert(type_name.into(), lifecycle);
    }

    pub fn set_key(&mut self, key: TaskKey, lifecycle: Lifecycle) {
        self.by_key.insert(key, lifecycle);
    }

    pub fn lifecycle_for(&self, key: &TaskKey) -> Lifecycle {
        self.by_key
            .get(key)
            .or_else(|| self.by_type.get(&key.type_name))
            .copied()
            .unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.by_type.is_empty() && self.by_key.is_empty()
    }
}

pub struct Executor {
    max_concurrency: usize,
    overrides: LifecycleOverrides,
}

impl Default for Executor {
    fn default() -> Self {
        Self {
            max_concurrency: 1,
            overrides: LifecycleOverrides::default(),
        }
    }
}

impl Executor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_concurrency(mut self, max: usize) -> Self {
        self.max_concurrency = max.max(1);
        self
    }

    pub fn with_overrides(mut self, overrides: LifecycleOverrides) -> Self {
        self.overrides = overrides;
        self
    }

    /// Run every task of `map` against `ctx.target`.
    ///
    /// Errors only when the map itself is invalid; task failures are
    /// collected in the report.
    pub async fn run(&self, map: &TaskMap, ctx: Arc<Context>) -> Result<ApplyReport> {
        let order = map.validate()?;
        let started = Instant::now();
        let mut report = ApplyReport::new();

        tracing::info!(
            "Running {} task(s) against the {} target",
            order.len(),
            ctx.target.kind()
        );

        let mut pending: Vec<TaskKey> = order;
        let mut succeeded: BTreeSet<TaskKey> = BTreeSet::new();
        let mut blocked: BTreeSet<TaskKey> = BTreeSet::new();
        let mut workers: JoinSet<(TaskKey, Result<Option<Action>>)> = JoinSet::new();

        loop {
            if ctx.cancel.is_cancelled() {
                for key in pending.drain(..) {
                    report.skipped.push(key.to_string());
                }
            }

            let mut i = 0;
            while i < pending.len() {
                let key = &pending[i];
                let Some(entry) = map.get(key) else {
                    i += 1;
                    continue;
                };

                if let Some(dep) = entry.dependencies.iter().find(|d| blocked.contains(*d)) {
                    tracing::warn!("Skipping {}: dependency {} did not complete", key, dep);
                    report.skipped.push(key.to_string());
                    blocked.insert(pending.remove(i));
                    continue;
                }

                let ready = entry.dependencies.iter().all(|d| succeeded.contains(d));
                if !ready || workers.len() >= self.max_concurrency {
                    i += 1;
                    continue;
                }

                let key = pending.remove(i);
                let lifecycle = self.overrides.lifecycle_for(&key);
                let task = entry.task.clone();
                let inputs = entry.inputs.clone();
                let reference_only = entry.reference_only;
                let ctx = ctx.clone();
                workers.spawn(async move {
                    let result = run_task(task, inputs, reference_only, lifecycle, ctx).await;
                    (key, result)
                });
            }

            let Some(joined) = workers.join_next().await else {
                break;
            };

            match joined {
                Ok((key, Ok(action))) => {
                    if let Some(action) = action {
                        report.record(action);
                    }
                    succeeded.insert(key);
                }
                Ok((key, Err(e))) => {
                    tracing::warn!("Task {} failed: {}", key, e);
                    report.add_failure(key.to_string(), e.to_string());
                    blocked.insert(key);
                }
                Err(e) => {
                    // The key is lost with the panicked future; the tasks
                    // left waiting on it are reported as skipped below.
                    tracing::error!("Task worker panicked: {}", e);
                    report.add_failure("<panicked task>".into(), e.to_string());
                }
            }
        }

        for key in pending {
            report.skipped.push(key.to_string());
        }

        report.actions.sort_by(|a, b| a.task.cmp(&b.task));
        report.duration_ms = started.elapsed().as_millis() as u64;
        tracing::info!("Apply finished: {}", report.summary());
        Ok(report)
    }
}

async fn run_task(
    task: Arc<dyn Task>,
    inputs: Value,
    reference_only: bool,
    lifecycle: Lifecycle,
    ctx: Arc<Context>,
) -> Result<Option<Action>> {
    let key = task.key();
    let observes = ctx.reads_cloud() || !task.is_cloud_task();

    if reference_only || lifecycle == Lifecycle::Ignore {
        tracing::debug!("Resolving {} without running it", key);
        if observes && let Some(actual) = task.find(&ctx).await? {
            ctx.set_output(key, actual);
        }
        return Ok(None);
    }

    if task.is_shared() && !observes {
        let id = inputs
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| FiError::SharedNotFound(key.clone()))?
            .to_string();
        match &ctx.target {
            Target::Terraform(tf) => tf.register_literal(key.clone(), id.clone()),
            Target::CloudFormation(cf) => cf.register_literal(key.clone(), id.clone()),
            Target::Direct | Target::DryRun => {}
        }
        ctx.set_output(key.clone(), json!({ "id": id }));
        return Ok(Some(action(&key, ActionType::NoOp, Changes::default())));
    }

    let expected = ctx.resolve_refs(&inputs);
    let retry = RetryConfig::for_duration(task.max_duration());

    let actual = if observes {
        with_retry(&retry, &ctx, &key, || task.find(&ctx)).await?
    } else {
        None
    };

    if actual.is_none() && task.is_shared() {
        return Err(FiError::SharedNotFound(key));
    }

    let changes = diff(task.as_ref(), &expected, actual.as_ref());

    match lifecycle {
        Lifecycle::ExistsAndValidates | Lifecycle::ExistsAndWarnIfChanges if actual.is_none() => {
            return Err(FiError::LifecycleViolation {
                key,
                detail: "it does not exist".into(),
            });
        }
        Lifecycle::ExistsAndValidates if !changes.is_empty() => {
            return Err(FiError::LifecycleViolation {
                key,
                detail: format!("fields differ: {}", changes.field_names().join(", ")),
            });
        }
        Lifecycle::ExistsAndWarnIfChanges if !changes.is_empty() => {
            for change in &changes.fields {
                tracing::warn!("{} differs and is left alone: {}", key, change);
            }
            if let Some(actual) = actual {
                ctx.set_output(key.clone(), actual);
            }
            return Ok(Some(action(&key, ActionType::Warn, changes)));
        }
        _ => {}
    }

    task.check_changes(actual.as_ref(), &changes)?;

    if let Some(actual) = &actual
        && changes.is_empty()
    {
        ctx.set_output(key.clone(), actual.clone());
        return Ok(Some(action(&key, ActionType::NoOp, changes)));
    }

    let action_type = match (&actual, changes.recreate) {
        (None, _) => ActionType::Create,
        (Some(_), true) => ActionType::Recreate,
        (Some(_), false) => ActionType::Update,
    };

    let outputs = match &ctx.target {
        Target::DryRun => {
            tracing::info!("Would {} {}", action_type, key);
            actual.clone()
        }
        _ if !task.is_cloud_task() => Some(
            with_retry(&retry, &ctx, &key, || {
                task.render_direct(&ctx, &expected, actual.as_ref(), &changes)
            })
            .await?,
        ),
        Target::Direct => {
            let outputs = with_retry(&retry, &ctx, &key, || {
                task.render_direct(&ctx, &expected, actual.as_ref(), &changes)
            })
            .await?;
            tracing::info!("{} {}", past_tense(action_type), key);
            Some(outputs)
        }
        Target::Terraform(tf) => Some(task.render_terraform(&ctx, tf)?),
        Target::CloudFormation(cf) => Some(task.render_cloudformation(&ctx, cf)?),
    };

    if let Some(outputs) = outputs {
        ctx.set_output(key.clone(), outputs);
    }
    Ok(Some(action(&key, action_type, changes)))
}

fn action(key: &TaskKey, action_type: ActionType, changes: Changes) -> Action {
    Action {
        task: key.to_string(),
        action_type,
        changes: changes.fields,
    }
}

fn past_tense(action_type: ActionType) -> &'static str {
    match action_type {
        ActionType::Create => "Created",
        ActionType::Update => "Updated",
        ActionType::Recreate => "Recreated",
        ActionType::Warn | ActionType::NoOp => "Checked",
    }
}

/// Retry transient failures of `op` within the task's max duration
async fn with_retry<T, F, Fut>(retry: &RetryConfig, ctx: &Context, key: &TaskKey, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let started = tokio::time::Instant::now();
    let mut attempt = 0u32;
    loop {
        if ctx.cancel.is_cancelled() {
            return Err(FiError::Cancelled);
        }
        attempt += 1;
        match op().await {
            Ok(value) => return Ok(value),
            Err(e)
                if e.is_transient()
                    && attempt < retry.max_attempts
                    && retry.max_elapsed.is_none_or(|max| started.elapsed() < max) =>
            {
                let delay = retry.delay_for(attempt);
                tracing::debug!("{} failed (attempt {}): {}; retrying in {:?}", key, attempt, e, delay);
                tokio::select! {
                    _ = ctx.cancel.cancelled() => return Err(FiError::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            Err(e) => return Err(e),
        }
    }
}
