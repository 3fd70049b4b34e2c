//! Autonomous goal pursuit.
//!
//! The loop is an explicit state machine (see [`state::transition`]):
//!
//! ```text
//!   Planning ──ActionPlanned──► Acting ──ActionExecuted──► Observing
//!      ▲                                                      │
//!      └──────────Continue────────── Deciding ◄──ObservationRecorded
//!                                      │
//!                 GoalSatisfied / BudgetExhausted / ActionFailed
//!                                      ▼
//!                              Completed / Failed
//! ```
//!
//! `Planning` also fails with `BudgetExhausted` when no actions are left,
//! so a zero action budget never runs an action. Any non-terminal state
//! moves to `Aborted` when the cancellation token fires. Cancellation is only observed between states; an action that has
//! started always runs to completion.

pub mod state;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use conductor_config::{ActionFailurePolicy, AgentLoopConfig};
use conductor_core::{CompletionRequest, DomainEvent, Error, Result};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::context::ExecutionContext;
use crate::orchestrator::Orchestrator;
pub use state::{
    ActionKind, AgentState, Budget, FailureReason, LoopEvent, LoopState, LoopTermination, Observation,
    transition,
};

/// The next thing the loop should do.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentAction {
    /// Ask the completion backend
    Complete { prompt: String },
    /// Call a registered tool
    InvokeTool { name: String, arguments: serde_json::Value },
    /// Run a nested orchestration for a sub-goal
    Orchestrate { goal: String },
}

impl AgentAction {
    pub fn kind(&self) -> ActionKind {
        match self {
            AgentAction::Complete { .. } => ActionKind::Completion,
            AgentAction::InvokeTool { .. } => ActionKind::Tool,
            AgentAction::Orchestrate { .. } => ActionKind::Orchestration,
        }
    }
}

/// An action plus why it was chosen and what choosing it cost.
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedAction {
    pub action: AgentAction,
    pub rationale: Option<String>,
    pub tokens: u64,
}

impl PlannedAction {
    pub fn new(action: AgentAction) -> Self {
        Self {
            action,
            rationale: None,
            tokens: 0,
        }
    }

    pub fn with_rationale(mut self, rationale: impl Into<String>) -> Self {
        self.rationale = Some(rationale.into());
        self
    }
}

/// Chooses the next action from the current state.
#[async_trait]
pub trait ActionPlanner: Send + Sync {
    async fn plan(&self, state: &AgentState, ctx: &ExecutionContext) -> Result<PlannedAction>;
}

/// Decides whether the goal has been reached.
pub trait GoalPredicate: Send + Sync {
    fn is_satisfied(&self, state: &AgentState) -> bool;
}

/// Satisfied once a completion step succeeds, i.e. the planner chose to
/// answer instead of calling a tool or delegating.
#[derive(Debug, Clone, Copy, Default)]
pub struct AnsweredDirectly;

impl GoalPredicate for AnsweredDirectly {
    fn is_satisfied(&self, state: &AgentState) -> bool {
        state
            .last_observation()
            .is_some_and(|o| o.success && o.source == ActionKind::Completion)
    }
}

impl<F> GoalPredicate for F
where
    F: Fn(&AgentState) -> bool + Send + Sync,
{
    fn is_satisfied(&self, state: &AgentState) -> bool {
        self(state)
    }
}

/// Prefix that makes [`CompletionActionPlanner`] delegate to the orchestrator.
pub const ORCHESTRATE_PREFIX: &str = "ORCHESTRATE:";

/// Asks the completion backend what to do next, offering every registered tool.
///
/// A reply with tool calls invokes the first tool, a reply starting with
/// `ORCHESTRATE:` delegates the rest of the line as a sub-goal, and any
/// other reply leads to a final answering step.
#[derive(Debug, Clone, Default)]
pub struct CompletionActionPlanner;

impl CompletionActionPlanner {
    pub fn new() -> Self {
        Self
    }

    fn prompt(state: &AgentState) -> String {
        let mut prompt = format!("Goal: {}\n", state.goal());
        if !state.observations().is_empty() {
            prompt.push_str("\nObservations so far:\n");
            for o in state.observations() {
                let marker = if o.success { "ok" } else { "failed" };
                prompt.push_str(&format!("{}. [{} {}] {}\n", o.step, o.source, marker, o.content));
            }
        }
        prompt.push_str(&format!(
            "\nActions remaining: {}. Call a tool, reply `{ORCHESTRATE_PREFIX} <sub-goal>` to \
             delegate a larger piece of work, or explain what the final answer should contain.",
            state.actions_remaining()
        ));
        prompt
    }
}

#[async_trait]
impl ActionPlanner for CompletionActionPlanner {
    async fn plan(&self, state: &AgentState, ctx: &ExecutionContext) -> Result<PlannedAction> {
        let request = CompletionRequest::new(Self::prompt(state)).with_tools(ctx.tools().describe());
        let completion = ctx.complete_routed(request, None).await?;
        let tokens = completion.total_tokens();
        let content = completion.content.trim().to_string();

        let action = if let Some(call) = completion.tool_calls.into_iter().next() {
            AgentAction::InvokeTool {
                name: call.name,
                arguments: call.arguments,
            }
        } else if let Some(goal) = content.strip_prefix(ORCHESTRATE_PREFIX) {
            AgentAction::Orchestrate {
                goal: goal.trim().to_string(),
            }
        } else {
            let mut prompt = format!("Goal: {}\n", state.goal());
            for o in state.observations().iter().filter(|o| o.success) {
                prompt.push_str(&format!("- {}\n", o.content));
            }
            if !content.is_empty() {
                prompt.push_str(&format!("\nNotes: {content}\n"));
            }
            prompt.push_str("\nWrite the final answer.");
            AgentAction::Complete { prompt }
        };

        Ok(PlannedAction {
            action,
            rationale: (!content.is_empty()).then_some(content),
            tokens,
        })
    }
}

/// One step of the transition trace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionRecord {
    pub from: LoopState,
    pub event: LoopEvent,
    pub to: LoopState,
}

#[derive(Debug, Clone)]
pub struct AgentOutcome {
    pub run_id: Uuid,
    pub state: AgentState,
    pub termination: LoopTermination,
    pub trace: Vec<TransitionRecord>,
}

impl AgentOutcome {
    /// How many times the loop entered `Acting`.
    pub fn acting_transitions(&self) -> usize {
        self.trace.iter().filter(|t| t.to == LoopState::Acting).count()
    }
}

pub struct AgentLoop {
    planner: Arc<dyn ActionPlanner>,
    goal: Arc<dyn GoalPredicate>,
    orchestrator: Option<Arc<Orchestrator>>,
    config: AgentLoopConfig,
}

/// What the last action produced, waiting to be observed.
struct ActionOutput {
    kind: ActionKind,
    result: Result<String>,
}

impl AgentLoop {
    pub fn new(planner: Arc<dyn ActionPlanner>, config: AgentLoopConfig) -> Self {
        Self {
            planner,
            goal: Arc::new(AnsweredDirectly),
            orchestrator: None,
            config,
        }
    }

    pub fn with_goal(mut self, goal: Arc<dyn GoalPredicate>) -> Self {
        self.goal = goal;
        self
    }

    pub fn with_orchestrator(mut self, orchestrator: Arc<Orchestrator>) -> Self {
        self.orchestrator = Some(orchestrator);
        self
    }

    /// Pursue `goal` until it is satisfied, a budget runs out, an action
    /// fails under the abort policy, or `cancel` fires.
    pub async fn run(&self, goal: &str, ctx: &ExecutionContext, cancel: &CancellationToken) -> Result<AgentOutcome> {
        let run_id = Uuid::new_v4();
        let started = Instant::now();
        let mut state = AgentState::new(goal, self.config.action_budget);
        let mut trace = Vec::new();
        let mut planned: Option<PlannedAction> = None;
        let mut output: Option<ActionOutput> = None;

        info!(
            %run_id,
            goal,
            action_budget = self.config.action_budget,
            wall_clock_secs = self.config.wall_clock_budget_secs,
            "Agent loop started"
        );

        while !state.state().is_terminal() {
            state.set_elapsed(started.elapsed());

            if cancel.is_cancelled() {
                state.terminate(LoopTermination::Aborted);
                self.apply(&mut state, LoopEvent::AbortRequested, &mut trace, ctx)?;
                continue;
            }

            let event = match state.state() {
                LoopState::Planning if state.actions_remaining() == 0 => {
                    warn!(%run_id, budget = self.config.action_budget, "No actions left to plan");
                    state.terminate(LoopTermination::Failed(FailureReason::ResourceExhausted(Budget::Actions)));
                    LoopEvent::BudgetExhausted
                }
                LoopState::Planning => match self.plan(&state, ctx, cancel).await {
                    Ok(next) => {
                        state.add_tokens(next.tokens);
                        state.set_rationale(next.rationale.clone());
                        planned = Some(next);
                        LoopEvent::ActionPlanned
                    }
                    Err(e) if e.is_cancellation() => {
                        state.terminate(LoopTermination::Aborted);
                        LoopEvent::AbortRequested
                    }
                    Err(e) => {
                        warn!(%run_id, error = %e, "Planning failed");
                        state.terminate(LoopTermination::Failed(FailureReason::PlanningFailed(e.to_string())));
                        LoopEvent::PlanningFailed
                    }
                },
                LoopState::Acting => {
                    let next = planned
                        .take()
                        .ok_or_else(|| Error::Internal("entered Acting without a planned action".into()))?;
                    state.record_action();
                    output = Some(self.act(next.action, &mut state, ctx, cancel).await);
                    LoopEvent::ActionExecuted
                }
                LoopState::Observing => {
                    let done = output
                        .take()
                        .ok_or_else(|| Error::Internal("entered Observing without an action result".into()))?;
                    self.observe(done, &mut state);
                    LoopEvent::ObservationRecorded
                }
                LoopState::Deciding => self.decide(&mut state, started),
                LoopState::Completed | LoopState::Failed | LoopState::Aborted => break,
            };

            self.apply(&mut state, event, &mut trace, ctx)?;
        }

        state.set_elapsed(started.elapsed());
        let termination = state.termination().cloned().unwrap_or(LoopTermination::Aborted);
        info!(
            %run_id,
            state = %state.state(),
            actions = state.actions_taken(),
            tokens = state.tokens_consumed(),
            termination = ?termination,
            "Agent loop finished"
        );

        Ok(AgentOutcome {
            run_id,
            state,
            termination,
            trace,
        })
    }

    /// Ask the planner for the next action, retrying transient failures.
    async fn plan(
        &self,
        state: &AgentState,
        ctx: &ExecutionContext,
        cancel: &CancellationToken,
    ) -> Result<PlannedAction> {
        let (planned, attempts) = ctx
            .retry_policy()
            .run(cancel, |_| self.planner.plan(state, ctx))
            .await;
        if attempts > 1 {
            debug!(attempts, success = planned.is_ok(), "Planning retried");
        }
        planned
    }

    fn apply(
        &self,
        state: &mut AgentState,
        event: LoopEvent,
        trace: &mut Vec<TransitionRecord>,
        ctx: &ExecutionContext,
    ) -> Result<()> {
        let from = state.state();
        let to = transition(from, event)
            .ok_or_else(|| Error::Internal(format!("illegal transition: {from} + {event}")))?;

        debug!(%from, %event, %to, "Loop transition");
        ctx.events().publish(DomainEvent::LoopTransition {
            from: from.to_string(),
            to: to.to_string(),
            event: event.to_string(),
            timestamp: Utc::now(),
        });

        if to == LoopState::Completed {
            state.terminate(LoopTermination::Completed);
        }
        state.set_state(to);
        trace.push(TransitionRecord { from, event, to });
        Ok(())
    }

    async fn act(
        &self,
        action: AgentAction,
        state: &mut AgentState,
        ctx: &ExecutionContext,
        cancel: &CancellationToken,
    ) -> ActionOutput {
        let kind = action.kind();
        let started = Instant::now();
        // In-flight actions are not interrupted, so retries get a token of their own.
        let uninterrupted = CancellationToken::new();

        let (result, attempts) = ctx
            .retry_policy()
            .run(&uninterrupted, |_| self.perform(&action, ctx, cancel))
            .await;

        let result = result.map(|(text, tokens)| {
            state.add_tokens(tokens);
            text
        });

        let duration_ms = started.elapsed().as_millis() as u64;
        debug!(%kind, attempts, duration_ms, success = result.is_ok(), "Action executed");
        ctx.events().publish(DomainEvent::ActionExecuted {
            kind: kind.to_string(),
            success: result.is_ok(),
            duration_ms,
            timestamp: Utc::now(),
        });

        ActionOutput { kind, result }
    }

    /// Perform one attempt of an action, returning its text and token cost.
    async fn perform(
        &self,
        action: &AgentAction,
        ctx: &ExecutionContext,
        cancel: &CancellationToken,
    ) -> Result<(String, u64)> {
        match action {
            AgentAction::Complete { prompt } => {
                let completion = ctx.complete_routed(CompletionRequest::new(prompt.clone()), None).await?;
                let tokens = completion.total_tokens();
                Ok((completion.content, tokens))
            }
            AgentAction::InvokeTool { name, arguments } => {
                let output = ctx.tools().invoke(name, arguments.clone()).await?;
                Ok((output.output, 0))
            }
            AgentAction::Orchestrate { goal } => {
                let orchestrator = self
                    .orchestrator
                    .as_ref()
                    .ok_or_else(|| Error::Internal("no orchestrator configured for delegation".into()))?;
                // Nested plans share the caller's token so a later abort reaches them.
                let outcome = orchestrator.run(goal, ctx, &cancel.child_token()).await?;
                match outcome.artifact {
                    Some(artifact) => Ok((artifact.content, 0)),
                    None => Err(Error::Internal(format!(
                        "delegated goal {}",
                        outcome.report.termination
                    ))),
                }
            }
        }
    }

    fn observe(&self, done: ActionOutput, state: &mut AgentState) {
        let (content, success) = match done.result {
            Ok(text) => (text, true),
            Err(e) => (format!("error: {e}"), false),
        };
        state.push_observation(Observation {
            step: state.actions_taken(),
            source: done.kind,
            content: truncate(&content, self.config.observation_max_chars),
            success,
            timestamp: Utc::now(),
        });
    }

    fn decide(&self, state: &mut AgentState, started: Instant) -> LoopEvent {
        if self.goal.is_satisfied(state) {
            return LoopEvent::GoalSatisfied;
        }

        if let Some(last) = state.last_observation() {
            if !last.success && self.config.failure_policy == ActionFailurePolicy::Abort {
                let reason = last.content.clone();
                state.terminate(LoopTermination::Failed(FailureReason::ActionFailed(reason)));
                return LoopEvent::ActionFailed;
            }
        }

        let exhausted = if state.actions_taken() >= self.config.action_budget {
            Some(Budget::Actions)
        } else if started.elapsed() >= self.config.wall_clock_budget() {
            Some(Budget::WallClock)
        } else if self
            .config
            .token_budget
            .is_some_and(|limit| state.tokens_consumed() >= limit)
        {
            Some(Budget::Tokens)
        } else {
            None
        };

        match exhausted {
            Some(budget) => {
                warn!(?budget, actions = state.actions_taken(), "Agent budget exhausted");
                state.terminate(LoopTermination::Failed(FailureReason::ResourceExhausted(budget)));
                LoopEvent::BudgetExhausted
            }
            None => LoopEvent::Continue,
        }
    }
}

fn truncate(input: &str, max_chars: usize) -> String {
    let char_count = input.chars().count();
    if char_count <= max_chars {
        return input.to_string();
    }
    let mut preview: String = input.chars().take(max_chars).collect();
    preview.push_str(&format!("... [truncated, total_chars={char_count}]"));
    preview
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::{Decomposer, Orchestrator, PlannedStep};
    use crate::test_helpers::{ScriptedCompletionService, make_context, make_text, make_tool_call};
    use conductor_core::CompletionError;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Replays a fixed list of actions, repeating the last one.
    struct ScriptedPlanner {
        actions: Vec<AgentAction>,
        calls: AtomicUsize,
    }

    impl ScriptedPlanner {
        fn new(actions: Vec<AgentAction>) -> Self {
            Self {
                actions,
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl ActionPlanner for ScriptedPlanner {
        async fn plan(&self, _state: &AgentState, _ctx: &ExecutionContext) -> Result<PlannedAction> {
            let i = self.calls.fetch_add(1, Ordering::SeqCst);
            let action = self.actions[i.min(self.actions.len() - 1)].clone();
            Ok(PlannedAction::new(action))
        }
    }

    fn echo(text: &str) -> AgentAction {
        AgentAction::InvokeTool {
            name: "echo".into(),
            arguments: serde_json::json!({ "text": text }),
        }
    }

    fn never(_: &AgentState) -> bool {
        false
    }

    fn config(action_budget: u32) -> AgentLoopConfig {
        AgentLoopConfig {
            action_budget,
            ..Default::default()
        }
    }

    fn ctx() -> ExecutionContext {
        make_context(Arc::new(ScriptedCompletionService::texts(&[])))
    }

    #[tokio::test]
    async fn action_budget_exhausts_after_exactly_budget_actions() {
        let lp = AgentLoop::new(Arc::new(ScriptedPlanner::new(vec![echo("again")])), config(2))
            .with_goal(Arc::new(never));

        let outcome = lp.run("unreachable", &ctx(), &CancellationToken::new()).await.unwrap();

        assert_eq!(
            outcome.termination,
            LoopTermination::Failed(FailureReason::ResourceExhausted(Budget::Actions))
        );
        assert_eq!(outcome.acting_transitions(), 2);
        assert_eq!(outcome.state.actions_taken(), 2);
        assert_eq!(outcome.state.state(), LoopState::Failed);
        assert_eq!(outcome.state.observations().len(), 2);
    }

    #[tokio::test]
    async fn zero_action_budget_runs_no_action() {
        let planner = Arc::new(ScriptedPlanner::new(vec![echo("never")]));
        let lp = AgentLoop::new(planner.clone(), config(0)).with_goal(Arc::new(never));

        let outcome = lp.run("g", &ctx(), &CancellationToken::new()).await.unwrap();

        assert_eq!(
            outcome.termination,
            LoopTermination::Failed(FailureReason::ResourceExhausted(Budget::Actions))
        );
        assert_eq!(outcome.state.actions_taken(), 0);
        assert_eq!(outcome.acting_transitions(), 0);
        assert_eq!(planner.calls.load(Ordering::SeqCst), 0);
        assert_eq!(
            outcome.trace,
            vec![TransitionRecord {
                from: LoopState::Planning,
                event: LoopEvent::BudgetExhausted,
                to: LoopState::Failed,
            }]
        );
    }

    #[tokio::test]
    async fn rate_limited_planning_is_retried() {
        let service = Arc::new(ScriptedCompletionService::new(vec![
            Err(CompletionError::RateLimited { retry_after_ms: None }),
            Ok(make_text("answer now")),
            Ok(make_text("42")),
        ]));
        let ctx = make_context(service.clone());
        let lp = AgentLoop::new(Arc::new(CompletionActionPlanner::new()), config(3));

        let outcome = lp.run("What is six times seven?", &ctx, &CancellationToken::new()).await.unwrap();

        assert_eq!(outcome.termination, LoopTermination::Completed);
        assert_eq!(outcome.state.observations()[0].content, "42");
        assert_eq!(service.call_count(), 3);
    }

    #[tokio::test]
    async fn goal_predicate_completes_the_loop() {
        let planner = ScriptedPlanner::new(vec![echo("one"), echo("two"), echo("three")]);
        let goal = |s: &AgentState| s.observations().iter().any(|o| o.content == "two");
        let lp = AgentLoop::new(Arc::new(planner), config(10)).with_goal(Arc::new(goal));

        let outcome = lp.run("find two", &ctx(), &CancellationToken::new()).await.unwrap();

        assert_eq!(outcome.termination, LoopTermination::Completed);
        assert_eq!(outcome.state.actions_taken(), 2);
        let events: Vec<_> = outcome.trace.iter().map(|t| t.event).collect();
        assert_eq!(
            events,
            vec![
                LoopEvent::ActionPlanned,
                LoopEvent::ActionExecuted,
                LoopEvent::ObservationRecorded,
                LoopEvent::Continue,
                LoopEvent::ActionPlanned,
                LoopEvent::ActionExecuted,
                LoopEvent::ObservationRecorded,
                LoopEvent::GoalSatisfied,
            ]
        );
    }

    #[tokio::test]
    async fn failed_action_is_observed_and_loop_continues() {
        let planner = ScriptedPlanner::new(vec![
            AgentAction::InvokeTool {
                name: "broken".into(),
                arguments: serde_json::json!({}),
            },
            echo("recovered"),
        ]);
        let goal = |s: &AgentState| s.last_observation().is_some_and(|o| o.content == "recovered");
        let lp = AgentLoop::new(Arc::new(planner), config(5)).with_goal(Arc::new(goal));

        let outcome = lp.run("g", &ctx(), &CancellationToken::new()).await.unwrap();

        assert_eq!(outcome.termination, LoopTermination::Completed);
        let first = &outcome.state.observations()[0];
        assert!(!first.success);
        assert!(first.content.contains("disk on fire"));
    }

    #[tokio::test]
    async fn abort_policy_fails_on_action_error() {
        let planner = ScriptedPlanner::new(vec![AgentAction::InvokeTool {
            name: "missing".into(),
            arguments: serde_json::json!({}),
        }]);
        let mut cfg = config(5);
        cfg.failure_policy = ActionFailurePolicy::Abort;
        let lp = AgentLoop::new(Arc::new(planner), cfg).with_goal(Arc::new(never));

        let outcome = lp.run("g", &ctx(), &CancellationToken::new()).await.unwrap();

        assert!(matches!(
            outcome.termination,
            LoopTermination::Failed(FailureReason::ActionFailed(ref reason)) if reason.contains("missing")
        ));
        assert_eq!(outcome.trace.last().unwrap().event, LoopEvent::ActionFailed);
    }

    #[tokio::test]
    async fn planning_failure_fails_the_loop() {
        struct Broken;
        #[async_trait]
        impl ActionPlanner for Broken {
            async fn plan(&self, _: &AgentState, _: &ExecutionContext) -> Result<PlannedAction> {
                Err(Error::Internal("no idea".into()))
            }
        }
        let outcome = AgentLoop::new(Arc::new(Broken), config(3))
            .run("g", &ctx(), &CancellationToken::new())
            .await
            .unwrap();

        assert!(matches!(
            outcome.termination,
            LoopTermination::Failed(FailureReason::PlanningFailed(_))
        ));
        assert_eq!(outcome.state.actions_taken(), 0);
    }

    #[tokio::test]
    async fn cancellation_aborts_at_next_boundary() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let lp = AgentLoop::new(Arc::new(ScriptedPlanner::new(vec![echo("x")])), config(3));

        let outcome = lp.run("g", &ctx(), &cancel).await.unwrap();

        assert_eq!(outcome.termination, LoopTermination::Aborted);
        assert_eq!(outcome.state.state(), LoopState::Aborted);
        assert_eq!(outcome.state.actions_taken(), 0);
    }

    #[tokio::test]
    async fn cancellation_during_planning_aborts_before_acting() {
        struct CancelWhilePlanning(CancellationToken);
        #[async_trait]
        impl ActionPlanner for CancelWhilePlanning {
            async fn plan(&self, _: &AgentState, _: &ExecutionContext) -> Result<PlannedAction> {
                self.0.cancel();
                Ok(PlannedAction::new(echo("late")))
            }
        }
        let cancel = CancellationToken::new();
        let lp = AgentLoop::new(Arc::new(CancelWhilePlanning(cancel.clone())), config(3))
            .with_goal(Arc::new(never));

        let outcome = lp.run("g", &ctx(), &cancel).await.unwrap();

        assert_eq!(outcome.termination, LoopTermination::Aborted);
        let last = outcome.trace.last().unwrap();
        assert_eq!((last.from, last.event), (LoopState::Acting, LoopEvent::AbortRequested));
        assert_eq!(outcome.state.actions_taken(), 0);
    }

    #[tokio::test]
    async fn token_budget_is_enforced() {
        let service = Arc::new(ScriptedCompletionService::from_fn(|_: &CompletionRequest| Ok(make_text("more"))));
        let ctx = make_context(service);
        let planner = ScriptedPlanner::new(vec![AgentAction::Complete { prompt: "go".into() }]);
        let mut cfg = config(10);
        cfg.token_budget = Some(30);
        let lp = AgentLoop::new(Arc::new(planner), cfg).with_goal(Arc::new(never));

        let outcome = lp.run("g", &ctx, &CancellationToken::new()).await.unwrap();

        assert_eq!(
            outcome.termination,
            LoopTermination::Failed(FailureReason::ResourceExhausted(Budget::Tokens))
        );
        assert_eq!(outcome.state.tokens_consumed(), 30);
        assert_eq!(outcome.state.actions_taken(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn wall_clock_budget_is_enforced() {
        let service = Arc::new(
            ScriptedCompletionService::from_fn(|_: &CompletionRequest| Ok(make_text("slow")))
                .with_delay(Duration::from_secs(40)),
        );
        let ctx = make_context(service);
        let planner = ScriptedPlanner::new(vec![AgentAction::Complete { prompt: "go".into() }]);
        let mut cfg = config(100);
        cfg.wall_clock_budget_secs = 60;
        let lp = AgentLoop::new(Arc::new(planner), cfg).with_goal(Arc::new(never));

        let outcome = lp.run("g", &ctx, &CancellationToken::new()).await.unwrap();

        assert_eq!(
            outcome.termination,
            LoopTermination::Failed(FailureReason::ResourceExhausted(Budget::WallClock))
        );
        assert_eq!(outcome.state.actions_taken(), 2);
    }

    #[tokio::test]
    async fn completion_planner_maps_replies_to_actions() {
        let service = Arc::new(ScriptedCompletionService::new(vec![
            Ok(make_tool_call("echo", serde_json::json!({ "text": "looked it up" }))),
            Ok(make_text("I know enough now")),
            Ok(make_text("The answer is 42")),
        ]));
        let ctx = make_context(service.clone());
        let lp = AgentLoop::new(Arc::new(CompletionActionPlanner::new()), config(5));

        let outcome = lp.run("What is the answer?", &ctx, &CancellationToken::new()).await.unwrap();

        assert_eq!(outcome.termination, LoopTermination::Completed);
        let observations = outcome.state.observations();
        assert_eq!(observations[0].source, ActionKind::Tool);
        assert_eq!(observations[0].content, "looked it up");
        assert_eq!(observations[1].source, ActionKind::Completion);
        assert_eq!(observations[1].content, "The answer is 42");
        assert!(service.prompts()[1].contains("looked it up"));
        assert_eq!(outcome.state.last_rationale(), Some("I know enough now"));
    }

    #[tokio::test]
    async fn orchestrate_prefix_delegates_to_orchestrator() {
        struct TwoSteps;
        #[async_trait]
        impl Decomposer for TwoSteps {
            async fn decompose(&self, _: &str, _: usize, _: &ExecutionContext) -> Result<Vec<PlannedStep>> {
                Ok(vec![PlannedStep::new("part one"), PlannedStep::new("part two")])
            }
        }

        let service = Arc::new(ScriptedCompletionService::from_fn(|request: &CompletionRequest| {
            if request.prompt.starts_with("Goal:") && !request.prompt.contains("Write the final answer") {
                Ok(make_text("ORCHESTRATE: build the report"))
            } else {
                Ok(make_text(&format!("did {}", request.prompt)))
            }
        }));
        let ctx = make_context(service);
        let orchestrator = Arc::new(Orchestrator::from_config(ctx.config()).with_decomposer(Arc::new(TwoSteps)));
        let lp = AgentLoop::new(Arc::new(CompletionActionPlanner::new()), config(1))
            .with_orchestrator(orchestrator)
            .with_goal(Arc::new(|s: &AgentState| {
                s.last_observation().is_some_and(|o| o.source == ActionKind::Orchestration && o.success)
            }));

        let outcome = lp.run("Report", &ctx, &CancellationToken::new()).await.unwrap();

        assert_eq!(outcome.termination, LoopTermination::Completed);
        let content = &outcome.state.observations()[0].content;
        assert!(content.contains("did part one") && content.contains("did part two"));
    }

    #[test]
    fn truncate_keeps_short_text() {
        assert_eq!(truncate("short", 10), "short");
        assert!(truncate("abcdefghij", 3).starts_with("abc... [truncated"));
    }
}
