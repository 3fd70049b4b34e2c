//! Wave-by-wave execution of a validated plan.
//!
//! Each dependency wave goes through the parallel executor in collect-all
//! mode. Tasks see the outputs of the tasks they depend on, compound tasks
//! run their nested plan through the same dispatcher, and leaf tasks are
//! handed to a [`TaskWorker`].

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use conductor_config::{FailurePolicy, PlanFailurePolicy};
use conductor_core::{
    CompletionRequest, DomainEvent, Error, Plan, Result, Task, TaskId, TaskResult,
};
use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::aggregator::Aggregator;
use crate::context::ExecutionContext;

/// Output of a dependency, handed to the tasks that wait on it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamOutput {
    pub task_id: TaskId,
    pub output: String,
}

/// Performs one leaf task.
#[async_trait]
pub trait TaskWorker: Send + Sync {
    async fn perform(
        &self,
        task: &Task,
        upstream: &[UpstreamOutput],
        ctx: &ExecutionContext,
        cancel: CancellationToken,
    ) -> Result<String>;
}

/// Routes the task input and asks the completion backend for it.
#[derive(Debug, Clone, Default)]
pub struct CompletionWorker;

impl CompletionWorker {
    pub fn new() -> Self {
        Self
    }

    fn prompt(task: &Task, upstream: &[UpstreamOutput]) -> String {
        if upstream.is_empty() {
            return task.input.clone();
        }
        let context = upstream
            .iter()
            .map(|u| format!("- {}: {}", u.task_id, u.output))
            .collect::<Vec<_>>()
            .join("\n");
        format!("{}\n\nResults from earlier steps:\n{}", task.input, context)
    }
}

#[async_trait]
impl TaskWorker for CompletionWorker {
    async fn perform(
        &self,
        task: &Task,
        upstream: &[UpstreamOutput],
        ctx: &ExecutionContext,
        cancel: CancellationToken,
    ) -> Result<String> {
        if cancel.is_cancelled() {
            return Err(Error::TaskCancelled {
                task_id: task.id.clone(),
            });
        }
        let request = CompletionRequest::new(Self::prompt(task, upstream));
        let completion = ctx.complete_routed(request, None).await?;
        Ok(completion.content)
    }
}

/// How a dispatch ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Termination {
    /// Every wave ran
    Completed,
    /// A task failed under the abort policy
    Aborted { failed: TaskId },
    /// The cancellation token fired
    Cancelled,
}

impl fmt::Display for Termination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Termination::Completed => f.write_str("completed"),
            Termination::Aborted { failed } => write!(f, "aborted after task '{failed}' failed"),
            Termination::Cancelled => f.write_str("cancelled"),
        }
    }
}

/// Everything a dispatch produced, including partial state when it stopped early.
#[derive(Debug, Clone)]
pub struct DispatchReport {
    pub goal: String,
    /// One result per task of the plan
    pub results: BTreeMap<TaskId, TaskResult>,
    /// Task ids handed to the executor, wave by wave
    pub waves: Vec<Vec<TaskId>>,
    pub termination: Termination,
}

impl DispatchReport {
    pub fn result(&self, id: &TaskId) -> Option<&TaskResult> {
        self.results.get(id)
    }

    pub fn failures(&self) -> impl Iterator<Item = &TaskResult> {
        self.results.values().filter(|r| !r.is_success())
    }

    pub fn is_success(&self) -> bool {
        self.termination == Termination::Completed && self.failures().next().is_none()
    }
}

pub struct Dispatcher {
    worker: Arc<dyn TaskWorker>,
    policy: PlanFailurePolicy,
    aggregator: Aggregator,
}

impl Dispatcher {
    pub fn new(worker: Arc<dyn TaskWorker>, policy: PlanFailurePolicy, aggregator: Aggregator) -> Self {
        Self {
            worker,
            policy,
            aggregator,
        }
    }

    pub fn with_worker(mut self, worker: Arc<dyn TaskWorker>) -> Self {
        self.worker = worker;
        self
    }

    pub fn with_policy(mut self, policy: PlanFailurePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_aggregator(mut self, aggregator: Aggregator) -> Self {
        self.aggregator = aggregator;
        self
    }

    pub fn aggregator(&self) -> &Aggregator {
        &self.aggregator
    }

    /// Run the plan wave by wave.
    ///
    /// Structural problems (cycles, duplicates, dangling dependencies) are
    /// returned as errors before any task runs. Task failures never are:
    /// they end up in the report.
    pub async fn execute(
        &self,
        plan: &Plan,
        ctx: &ExecutionContext,
        cancel: &CancellationToken,
    ) -> Result<DispatchReport> {
        self.dispatch(plan, ctx, cancel, &[]).await
    }

    /// Tasks without dependencies of their own receive `inherited` as
    /// their upstream outputs.
    async fn dispatch(
        &self,
        plan: &Plan,
        ctx: &ExecutionContext,
        cancel: &CancellationToken,
        inherited: &[UpstreamOutput],
    ) -> Result<DispatchReport> {
        plan.validate()?;
        let waves = plan.waves()?;
        let executor = ctx
            .executor()
            .with_policy(FailurePolicy::CollectAll)
            .with_retry(ctx.retry_policy());

        info!(
            goal = %plan.goal,
            depth = plan.depth,
            tasks = plan.len(),
            waves = waves.len(),
            "Dispatching plan"
        );

        let mut results: BTreeMap<TaskId, TaskResult> = BTreeMap::new();
        let mut waves_run = Vec::new();
        let mut termination = Termination::Completed;

        for (number, wave) in waves.iter().enumerate() {
            if cancel.is_cancelled() {
                termination = Termination::Cancelled;
                break;
            }

            let mut runnable = Vec::with_capacity(wave.len());
            for id in wave {
                let task = plan
                    .get(id)
                    .ok_or_else(|| Error::Internal(format!("wave refers to unknown task '{id}'")))?;
                match blocking_dependency(task, &results) {
                    Some(dep) => {
                        let result = TaskResult::cancelled(
                            id.clone(),
                            format!("upstream task '{dep}' did not succeed"),
                            Duration::ZERO,
                        );
                        self.record(ctx, result, &mut results);
                    }
                    None => runnable.push(task.clone()),
                }
            }

            if runnable.is_empty() {
                continue;
            }

            debug!(goal = %plan.goal, wave = number, tasks = runnable.len(), "Wave started");
            ctx.events().publish(DomainEvent::WaveStarted {
                goal: plan.goal.clone(),
                wave: number,
                tasks: runnable.len(),
                timestamp: Utc::now(),
            });
            waves_run.push(runnable.iter().map(|t| t.id.clone()).collect());

            let finished = {
                let done = &results;
                executor
                    .submit(&runnable, cancel, |task, token| {
                        self.run_task(task, upstream_for(task, done, inherited), ctx, token)
                    })
                    .await?
            };

            let mut first_failure = None;
            for result in finished {
                if !result.is_success() {
                    warn!(
                        task_id = %result.task_id(),
                        status = %result.status(),
                        error = result.error().unwrap_or_default(),
                        "Task did not succeed"
                    );
                    first_failure.get_or_insert_with(|| result.task_id().clone());
                }
                self.record(ctx, result, &mut results);
            }

            if cancel.is_cancelled() {
                termination = Termination::Cancelled;
                break;
            }
            if let Some(failed) = first_failure {
                if self.policy == PlanFailurePolicy::Abort {
                    termination = Termination::Aborted { failed };
                    break;
                }
            }
        }

        let reason = match &termination {
            Termination::Completed => "not executed".to_string(),
            other => format!("plan {other}"),
        };
        for task in &plan.tasks {
            if !results.contains_key(&task.id) {
                let result = TaskResult::cancelled(task.id.clone(), reason.clone(), Duration::ZERO);
                results.insert(task.id.clone(), result);
            }
        }

        info!(goal = %plan.goal, termination = %termination, "Plan finished");
        ctx.events().publish(DomainEvent::PlanFinished {
            goal: plan.goal.clone(),
            outcome: termination.to_string(),
            timestamp: Utc::now(),
        });

        Ok(DispatchReport {
            goal: plan.goal.clone(),
            results,
            waves: waves_run,
            termination,
        })
    }

    fn record(&self, ctx: &ExecutionContext, result: TaskResult, results: &mut BTreeMap<TaskId, TaskResult>) {
        ctx.events().publish(DomainEvent::TaskFinished {
            task_id: result.task_id().clone(),
            status: result.status(),
            attempts: result.attempts(),
            duration_ms: result.duration().as_millis() as u64,
            timestamp: Utc::now(),
        });
        results.insert(result.task_id().clone(), result);
    }

    fn run_task<'a>(
        &'a self,
        task: &'a Task,
        upstream: Vec<UpstreamOutput>,
        ctx: &'a ExecutionContext,
        cancel: CancellationToken,
    ) -> BoxFuture<'a, Result<String>> {
        Box::pin(async move {
            let Some(subplan) = &task.subplan else {
                return self.worker.perform(task, &upstream, ctx, cancel).await;
            };

            // The nested plan's root tasks see what the compound task depended on.
            let report = self.dispatch(subplan, ctx, &cancel, &upstream).await?;
            if report.termination != Termination::Completed {
                return Err(Error::TaskFailed {
                    task_id: task.id.clone(),
                    source: Box::new(Error::Internal(format!("nested plan {}", report.termination))),
                });
            }
            let artifact = self.aggregator.combine(subplan, &report.results)?;
            Ok(artifact.content)
        })
    }
}

/// The first dependency of `task` that has no successful result.
fn blocking_dependency<'a>(task: &'a Task, results: &BTreeMap<TaskId, TaskResult>) -> Option<&'a TaskId> {
    task.depends_on
        .iter()
        .find(|dep| !results.get(*dep).is_some_and(TaskResult::is_success))
}

fn upstream_for(
    task: &Task,
    results: &BTreeMap<TaskId, TaskResult>,
    inherited: &[UpstreamOutput],
) -> Vec<UpstreamOutput> {
    if task.depends_on.is_empty() {
        return inherited.to_vec();
    }
    task.depends_on
        .iter()
        .filter_map(|dep| {
            let output = results.get(dep)?.output()?;
            Some(UpstreamOutput {
                task_id: dep.clone(),
                output: output.to_string(),
            })
        })
        .collect()
}
