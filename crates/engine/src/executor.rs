//! Bounded-concurrency fan-out/fan-in.
//!
//! The executor drives at most `concurrency_limit` tasks at a time from
//! inside the caller's own task, using a `FuturesUnordered` pool. Results
//! come back in submission order regardless of completion order.

use std::future::Future;
use std::time::Duration;

use conductor_config::{ExecutorConfig, FailurePolicy};
use conductor_core::{Error, Result, Task, TaskResult};
use futures::StreamExt;
use futures::stream::FuturesUnordered;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::retry::RetryPolicy;

#[derive(Debug, Clone)]
pub struct ParallelExecutor {
    limit: usize,
    policy: FailurePolicy,
    default_timeout: Option<Duration>,
    retry: RetryPolicy,
}

/// One finished slot: its input index, the recorded result, and for
/// failures the error that caused it.
struct Finished {
    index: usize,
    result: TaskResult,
    error: Option<Error>,
}

impl ParallelExecutor {
    /// A limit of zero is treated as one.
    pub fn new(concurrency_limit: usize, policy: FailurePolicy) -> Self {
        Self {
            limit: concurrency_limit.max(1),
            policy,
            default_timeout: None,
            retry: RetryPolicy::none(),
        }
    }

    pub fn from_config(config: &ExecutorConfig) -> Self {
        let mut executor = Self::new(config.concurrency_limit, config.failure_policy);
        executor.default_timeout = config.default_task_timeout();
        executor
    }

    /// Timeout for tasks that do not carry their own.
    pub fn with_default_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// Retry transient failures of each task before recording them.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_policy(mut self, policy: FailurePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn concurrency_limit(&self) -> usize {
        self.limit
    }

    pub fn policy(&self) -> FailurePolicy {
        self.policy
    }

    /// Run `work` over every task and return one result per task, in input order.
    ///
    /// `work` receives a child of `cancel` that is cancelled when the task
    /// times out or the whole call is torn down.
    ///
    /// Under [`FailurePolicy::FailFast`] the first failure or timeout
    /// cancels everything still running and is returned as the error.
    /// Under [`FailurePolicy::CollectAll`] the call only fails if the
    /// executor itself cannot proceed; task failures are recorded in the
    /// results.
    pub async fn submit<'a, W, Fut>(
        &self,
        tasks: &'a [Task],
        cancel: &CancellationToken,
        work: W,
    ) -> Result<Vec<TaskResult>>
    where
        W: Fn(&'a Task, CancellationToken) -> Fut,
        Fut: Future<Output = Result<String>> + 'a,
    {
        let scope = cancel.child_token();
        let _guard = scope.clone().drop_guard();

        let mut slots: Vec<Option<TaskResult>> = (0..tasks.len()).map(|_| None).collect();
        let mut pending = tasks.iter().enumerate();
        let mut in_flight = FuturesUnordered::new();

        debug!(
            tasks = tasks.len(),
            limit = self.limit,
            policy = ?self.policy,
            "Fan-out started"
        );

        loop {
            while in_flight.len() < self.limit {
                let Some((index, task)) = pending.next() else {
                    break;
                };
                if scope.is_cancelled() {
                    if self.policy == FailurePolicy::FailFast {
                        return Err(Error::Cancelled);
                    }
                    slots[index] = Some(TaskResult::cancelled(
                        task.id.clone(),
                        "cancelled before start",
                        Duration::ZERO,
                    ));
                    continue;
                }
                in_flight.push(self.run_one(index, task, scope.child_token(), &work));
            }

            let Some(finished) = in_flight.next().await else {
                break;
            };

            if let Some(error) = finished.error {
                if self.policy == FailurePolicy::FailFast {
                    warn!(
                        task_id = %finished.result.task_id(),
                        error = %error,
                        "Task failed, cancelling remaining work"
                    );
                    scope.cancel();
                    return Err(error);
                }
            }
            slots[finished.index] = Some(finished.result);
        }

        let mut results = Vec::with_capacity(tasks.len());
        for (slot, task) in slots.into_iter().zip(tasks) {
            results.push(slot.ok_or_else(|| {
                Error::Internal(format!("no result recorded for task '{}'", task.id))
            })?);
        }
        Ok(results)
    }

    async fn run_one<'a, W, Fut>(
        &self,
        index: usize,
        task: &'a Task,
        token: CancellationToken,
        work: &W,
    ) -> Finished
    where
        W: Fn(&'a Task, CancellationToken) -> Fut,
        Fut: Future<Output = Result<String>> + 'a,
    {
        let started = Instant::now();
        let attempts_run = self.retry.run(&token, |_| work(task, token.clone()));

        let outcome = match task.timeout.or(self.default_timeout) {
            Some(limit) => tokio::time::timeout(limit, attempts_run).await.map_err(|_| limit),
            None => Ok(attempts_run.await),
        };
        let elapsed = started.elapsed();

        let (result, error) = match outcome {
            Err(limit) => {
                token.cancel();
                (
                    TaskResult::timed_out(task.id.clone(), limit, elapsed),
                    Some(Error::TaskTimedOut {
                        task_id: task.id.clone(),
                        timeout_ms: limit.as_millis() as u64,
                    }),
                )
            }
            Ok((Ok(output), attempts)) => (
                TaskResult::succeeded(task.id.clone(), output, elapsed).with_attempts(attempts),
                None,
            ),
            Ok((Err(e), attempts)) if e.is_cancellation() || token.is_cancelled() => (
                TaskResult::cancelled(task.id.clone(), e.to_string(), elapsed).with_attempts(attempts),
                Some(Error::Cancelled),
            ),
            Ok((Err(e), attempts)) => (
                TaskResult::failed(task.id.clone(), e.to_string(), elapsed).with_attempts(attempts),
                Some(Error::TaskFailed {
                    task_id: task.id.clone(),
                    source: Box::new(e),
                }),
            ),
        };

        debug!(
            task_id = %task.id,
            status = %result.status(),
            attempts = result.attempts(),
            duration_ms = elapsed.as_millis() as u64,
            "Task finished"
        );

        Finished {
            index,
            result,
            error,
        }
    }
}

impl Default for ParallelExecutor {
    fn default() -> Self {
        Self::from_config(&ExecutorConfig::default())
    }
}
