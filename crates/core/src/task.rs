//! Tasks and task results: the unit of work every execution strategy shares.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;

use crate::plan::Plan;

/// Identifier of a task, unique within one [`Plan`].
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for TaskId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// A unit of work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Identifier, unique within the owning plan
    pub id: TaskId,

    /// Input payload handed to the worker
    pub input: String,

    /// Tasks that must succeed before this one may start
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub depends_on: BTreeSet<TaskId>,

    /// Per-task timeout; `None` means unbounded
    #[serde(default, skip_serializing_if = "Option::is_none", with = "duration_ms")]
    pub timeout: Option<Duration>,

    /// Nested plan for goal-like tasks produced by recursive decomposition
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subplan: Option<Box<Plan>>,
}

impl Task {
    pub fn new(id: impl Into<TaskId>, input: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            input: input.into(),
            depends_on: BTreeSet::new(),
            timeout: None,
            subplan: None,
        }
    }

    /// Add dependencies on other tasks of the same plan.
    pub fn depends_on<I, T>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<TaskId>,
    {
        self.depends_on.extend(deps.into_iter().map(Into::into));
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_subplan(mut self, plan: Plan) -> Self {
        self.subplan = Some(Box::new(plan));
        self
    }

    /// Whether this task is itself a goal that expands into a nested plan.
    pub fn is_compound(&self) -> bool {
        self.subplan.is_some()
    }
}

/// Final status of one task execution attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Succeeded,
    Failed,
    Cancelled,
    TimedOut,
}

impl TaskStatus {
    pub fn is_success(self) -> bool {
        self == TaskStatus::Succeeded
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskStatus::Succeeded => "succeeded",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
            TaskStatus::TimedOut => "timed out",
        };
        f.write_str(s)
    }
}

/// Outcome of executing a task.
///
/// Immutable once built: fields are private and only readable. A retried
/// task produces a fresh result carrying the attempt count.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResult {
    task_id: TaskId,
    status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(with = "duration_ms_required")]
    duration: Duration,
    attempts: u32,
}

impl TaskResult {
    pub fn succeeded(task_id: TaskId, output: impl Into<String>, duration: Duration) -> Self {
        Self {
            task_id,
            status: TaskStatus::Succeeded,
            output: Some(output.into()),
            error: None,
            duration,
            attempts: 1,
        }
    }

    pub fn failed(task_id: TaskId, error: impl Into<String>, duration: Duration) -> Self {
        Self::unsuccessful(task_id, TaskStatus::Failed, error, duration)
    }

    pub fn cancelled(task_id: TaskId, reason: impl Into<String>, duration: Duration) -> Self {
        Self::unsuccessful(task_id, TaskStatus::Cancelled, reason, duration)
    }

    pub fn timed_out(task_id: TaskId, timeout: Duration, duration: Duration) -> Self {
        let detail = format!("timed out after {}ms", timeout.as_millis());
        Self::unsuccessful(task_id, TaskStatus::TimedOut, detail, duration)
    }

    fn unsuccessful(
        task_id: TaskId,
        status: TaskStatus,
        error: impl Into<String>,
        duration: Duration,
    ) -> Self {
        Self {
            task_id,
            status,
            output: None,
            error: Some(error.into()),
            duration,
            attempts: 1,
        }
    }

    /// Record how many attempts produced this result.
    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts.max(1);
        self
    }

    pub fn task_id(&self) -> &TaskId {
        &self.task_id
    }

    pub fn status(&self) -> TaskStatus {
        self.status
    }

    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    pub fn output(&self) -> Option<&str> {
        self.output.as_deref()
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => s.serialize_some(&(d.as_millis() as u64)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(d)?.map(Duration::from_millis))
    }
}

mod duration_ms_required {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}
