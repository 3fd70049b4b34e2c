//! Goal decomposition into validated plans.
//!
//! The planner asks a [`Decomposer`] for the steps of a goal. Steps marked
//! as goals are decomposed again into nested plans. Recursion carries an
//! explicit depth counter and the path of goals being expanded, so a
//! decomposer that loops back to an ancestor goal or never bottoms out is
//! rejected instead of recursing forever.

use std::sync::Arc;

use async_trait::async_trait;
use conductor_core::{CompletionRequest, Plan, PlanError, Result, Task};
use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::context::ExecutionContext;

/// One step proposed by a decomposer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedStep {
    /// Number the decomposer gave the step, if it gave one
    pub number: Option<usize>,
    pub description: String,
    /// 1-based numbers of earlier steps this one waits for
    pub after: Vec<usize>,
    /// Whether the step is itself a goal to decompose further
    pub is_goal: bool,
}

impl PlannedStep {
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            number: None,
            description: description.into(),
            after: Vec::new(),
            is_goal: false,
        }
    }

    pub fn numbered(mut self, number: usize) -> Self {
        self.number = Some(number);
        self
    }

    pub fn after(mut self, steps: impl IntoIterator<Item = usize>) -> Self {
        self.after.extend(steps);
        self
    }

    pub fn as_goal(mut self) -> Self {
        self.is_goal = true;
        self
    }
}

/// Proposes the steps for one goal.
#[async_trait]
pub trait Decomposer: Send + Sync {
    async fn decompose(&self, goal: &str, depth: usize, ctx: &ExecutionContext) -> Result<Vec<PlannedStep>>;
}

/// Asks the completion backend for a numbered list of steps.
pub struct CompletionDecomposer {
    system: String,
}

impl CompletionDecomposer {
    pub fn new() -> Self {
        Self {
            system: "Break the goal into a short numbered list of concrete steps. \
                     Write one step per line as `N. description`. Append `(after 1, 2)` \
                     when a step needs the results of earlier steps, and prefix a step \
                     with `[goal]` when it is too large to do in one go."
                .into(),
        }
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = system.into();
        self
    }
}

impl Default for CompletionDecomposer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Decomposer for CompletionDecomposer {
    async fn decompose(&self, goal: &str, depth: usize, ctx: &ExecutionContext) -> Result<Vec<PlannedStep>> {
        let request = CompletionRequest::new(format!("Goal: {goal}")).with_system(self.system.clone());
        let completion = ctx.complete_routed(request, None).await?;
        let steps = parse_numbered_list(&completion.content);
        debug!(goal, depth, steps = steps.len(), "Goal decomposed");
        Ok(steps)
    }
}

/// Parse `N. text` / `N) text` lines into steps.
///
/// Lines that do not start with a number, or have nothing after it, are
/// ignored. Steps keep the number written in front of them. A trailing
/// `(after 1, 3)` annotation becomes the step's dependencies and a leading
/// `[goal]` marker flags it for further decomposition.
pub fn parse_numbered_list(text: &str) -> Vec<PlannedStep> {
    text.lines().filter_map(parse_step_line).collect()
}

fn parse_step_line(line: &str) -> Option<PlannedStep> {
    let line = line.trim();
    let digits = line.chars().take_while(|c| c.is_ascii_digit()).count();
    if digits == 0 {
        return None;
    }
    let number = line[..digits].parse().ok()?;
    let rest = line[digits..].strip_prefix(['.', ')'])?.trim();

    let (rest, is_goal) = match strip_prefix_ignore_case(rest, "[goal]") {
        Some(stripped) => (stripped.trim(), true),
        None => (rest, false),
    };

    let (description, after) = split_after_annotation(rest);
    if description.is_empty() {
        return None;
    }
    Some(PlannedStep {
        number: Some(number),
        description: description.to_string(),
        after,
        is_goal,
    })
}

fn strip_prefix_ignore_case<'a>(text: &'a str, prefix: &str) -> Option<&'a str> {
    let head = text.get(..prefix.len())?;
    head.eq_ignore_ascii_case(prefix).then(|| &text[prefix.len()..])
}

fn split_after_annotation(text: &str) -> (&str, Vec<usize>) {
    let lowered = text.to_ascii_lowercase();
    if !lowered.ends_with(')') {
        return (text, Vec::new());
    }
    let Some(open) = lowered.rfind("(after") else {
        return (text, Vec::new());
    };
    let inner = &text[open + "(after".len()..text.len() - 1];
    let after = inner
        .split(|c: char| c == ',' || c.is_whitespace())
        .filter_map(|n| n.trim().parse().ok())
        .collect();
    (text[..open].trim(), after)
}

/// Builds validated plans, recursing into goal-like steps.
pub struct Planner {
    decomposer: Arc<dyn Decomposer>,
    max_depth: usize,
}

impl Planner {
    pub fn new(decomposer: Arc<dyn Decomposer>, max_depth: usize) -> Self {
        Self { decomposer, max_depth }
    }

    pub fn max_depth(&self) -> usize {
        self.max_depth
    }

    /// Decompose `goal` into a validated plan rooted at depth 0.
    ///
    /// Transient backend failures are retried with the context's retry policy.
    pub async fn decompose(&self, goal: &str, ctx: &ExecutionContext, cancel: &CancellationToken) -> Result<Plan> {
        let mut path = Vec::new();
        let plan = self.expand(goal, 0, &mut path, ctx, cancel).await?;
        info!(goal, tasks = plan.len(), "Plan ready");
        Ok(plan)
    }

    fn expand<'a>(
        &'a self,
        goal: &'a str,
        depth: usize,
        path: &'a mut Vec<String>,
        ctx: &'a ExecutionContext,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<Plan>> {
        Box::pin(async move {
            if depth > self.max_depth {
                return Err(PlanError::DepthExceeded {
                    depth,
                    max: self.max_depth,
                }
                .into());
            }

            let key = normalize_goal(goal);
            if path.iter().any(|seen| normalize_goal(seen) == key) {
                let mut cycle = path.clone();
                cycle.push(goal.to_string());
                return Err(PlanError::Cycle { path: cycle }.into());
            }

            let (steps, _) = ctx
                .retry_policy()
                .run(cancel, |_| self.decomposer.decompose(goal, depth, ctx))
                .await;
            let steps = steps?;
            if steps.is_empty() {
                return Err(PlanError::Empty(goal.to_string()).into());
            }

            path.push(goal.to_string());
            let mut tasks = Vec::with_capacity(steps.len());
            for (index, step) in steps.iter().enumerate() {
                let number = step.number.unwrap_or(index + 1);
                let mut task = Task::new(step_id(number), step.description.as_str())
                    .depends_on(step.after.iter().map(|n| step_id(*n)));
                if step.is_goal {
                    let nested = self.expand(&step.description, depth + 1, path, ctx, cancel).await?;
                    task = task.with_subplan(nested);
                }
                tasks.push(task);
            }
            path.pop();

            let plan = Plan::new(goal, tasks).at_depth(depth);
            plan.validate()?;
            Ok(plan)
        })
    }
}

fn step_id(number: usize) -> String {
    format!("step-{number}")
}

fn normalize_goal(goal: &str) -> String {
    goal.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}
