//! Loop states, events and the transition table of the autonomous loop.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Where the loop is in its plan-act-observe-decide cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LoopState {
    Planning,
    Acting,
    Observing,
    Deciding,
    Completed,
    Failed,
    Aborted,
}

impl LoopState {
    pub const ALL: [LoopState; 7] = [
        LoopState::Planning,
        LoopState::Acting,
        LoopState::Observing,
        LoopState::Deciding,
        LoopState::Completed,
        LoopState::Failed,
        LoopState::Aborted,
    ];

    pub fn is_terminal(self) -> bool {
        matches!(self, LoopState::Completed | LoopState::Failed | LoopState::Aborted)
    }
}

impl fmt::Display for LoopState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// What just happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LoopEvent {
    ActionPlanned,
    PlanningFailed,
    ActionExecuted,
    ObservationRecorded,
    GoalSatisfied,
    BudgetExhausted,
    ActionFailed,
    Continue,
    AbortRequested,
}

impl LoopEvent {
    pub const ALL: [LoopEvent; 9] = [
        LoopEvent::ActionPlanned,
        LoopEvent::PlanningFailed,
        LoopEvent::ActionExecuted,
        LoopEvent::ObservationRecorded,
        LoopEvent::GoalSatisfied,
        LoopEvent::BudgetExhausted,
        LoopEvent::ActionFailed,
        LoopEvent::Continue,
        LoopEvent::AbortRequested,
    ];
}

impl fmt::Display for LoopEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// The whole state machine. `None` means the event is illegal in that state.
pub fn transition(state: LoopState, event: LoopEvent) -> Option<LoopState> {
    use LoopEvent as E;
    use LoopState as S;

    match (state, event) {
        (S::Planning, E::ActionPlanned) => Some(S::Acting),
        (S::Planning, E::PlanningFailed) => Some(S::Failed),
        (S::Planning, E::BudgetExhausted) => Some(S::Failed),
        (S::Acting, E::ActionExecuted) => Some(S::Observing),
        (S::Observing, E::ObservationRecorded) => Some(S::Deciding),
        (S::Deciding, E::GoalSatisfied) => Some(S::Completed),
        (S::Deciding, E::BudgetExhausted) => Some(S::Failed),
        (S::Deciding, E::ActionFailed) => Some(S::Failed),
        (S::Deciding, E::Continue) => Some(S::Planning),
        (s, E::AbortRequested) if !s.is_terminal() => Some(S::Aborted),
        _ => None,
    }
}

/// The kind of action the loop performed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Completion,
    Tool,
    Orchestration,
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ActionKind::Completion => "completion",
            ActionKind::Tool => "tool",
            ActionKind::Orchestration => "orchestration",
        })
    }
}

/// Result of one action, as the loop remembers it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Observation {
    /// 1-based action number
    pub step: u32,
    pub source: ActionKind,
    pub content: String,
    pub success: bool,
    pub timestamp: DateTime<Utc>,
}

/// Which budget ran out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Budget {
    Actions,
    WallClock,
    Tokens,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureReason {
    ResourceExhausted(Budget),
    PlanningFailed(String),
    ActionFailed(String),
}

/// How a loop run ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LoopTermination {
    Completed,
    Failed(FailureReason),
    Aborted,
}

/// Everything a loop run knows about itself.
///
/// Observations are append-only. The loop owns the state for its lifetime
/// and hands it back by value in the outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentState {
    state: LoopState,
    goal: String,
    observations: Vec<Observation>,
    actions_taken: u32,
    action_budget: u32,
    tokens_consumed: u64,
    elapsed: Duration,
    last_rationale: Option<String>,
    termination: Option<LoopTermination>,
}

impl AgentState {
    pub fn new(goal: impl Into<String>, action_budget: u32) -> Self {
        Self {
            state: LoopState::Planning,
            goal: goal.into(),
            observations: Vec::new(),
            actions_taken: 0,
            action_budget,
            tokens_consumed: 0,
            elapsed: Duration::ZERO,
            last_rationale: None,
            termination: None,
        }
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    pub fn goal(&self) -> &str {
        &self.goal
    }

    pub fn observations(&self) -> &[Observation] {
        &self.observations
    }

    pub fn last_observation(&self) -> Option<&Observation> {
        self.observations.last()
    }

    pub fn actions_taken(&self) -> u32 {
        self.actions_taken
    }

    pub fn actions_remaining(&self) -> u32 {
        self.action_budget.saturating_sub(self.actions_taken)
    }

    pub fn tokens_consumed(&self) -> u64 {
        self.tokens_consumed
    }

    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }

    pub fn last_rationale(&self) -> Option<&str> {
        self.last_rationale.as_deref()
    }

    pub fn termination(&self) -> Option<&LoopTermination> {
        self.termination.as_ref()
    }

    pub(crate) fn set_state(&mut self, state: LoopState) {
        self.state = state;
    }

    pub(crate) fn record_action(&mut self) {
        self.actions_taken += 1;
    }

    pub(crate) fn add_tokens(&mut self, tokens: u64) {
        self.tokens_consumed = self.tokens_consumed.saturating_add(tokens);
    }

    pub(crate) fn set_elapsed(&mut self, elapsed: Duration) {
        self.elapsed = elapsed;
    }

    pub(crate) fn set_rationale(&mut self, rationale: Option<String>) {
        self.last_rationale = rationale;
    }

    pub(crate) fn push_observation(&mut self, observation: Observation) {
        self.observations.push(observation);
    }

    pub(crate) fn terminate(&mut self, termination: LoopTermination) {
        self.termination.get_or_insert(termination);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transition_table_is_exhaustive() {
        use LoopEvent as E;
        use LoopState as S;

        let legal = [
            (S::Planning, E::ActionPlanned, S::Acting),
            (S::Planning, E::PlanningFailed, S::Failed),
            (S::Planning, E::BudgetExhausted, S::Failed),
            (S::Acting, E::ActionExecuted, S::Observing),
            (S::Observing, E::ObservationRecorded, S::Deciding),
            (S::Deciding, E::GoalSatisfied, S::Completed),
            (S::Deciding, E::BudgetExhausted, S::Failed),
            (S::Deciding, E::ActionFailed, S::Failed),
            (S::Deciding, E::Continue, S::Planning),
            (S::Planning, E::AbortRequested, S::Aborted),
            (S::Acting, E::AbortRequested, S::Aborted),
            (S::Observing, E::AbortRequested, S::Aborted),
            (S::Deciding, E::AbortRequested, S::Aborted),
        ];

        for state in LoopState::ALL {
            for event in LoopEvent::ALL {
                let expected = legal
                    .iter()
                    .find(|(s, e, _)| *s == state && *e == event)
                    .map(|(_, _, to)| *to);
                assert_eq!(transition(state, event), expected, "{state} + {event}");
            }
        }
    }

    #[test]
    fn terminal_states_accept_nothing() {
        for state in LoopState::ALL.into_iter().filter(|s| s.is_terminal()) {
            for event in LoopEvent::ALL {
                assert!(transition(state, event).is_none());
            }
        }
    }

    #[test]
    fn first_termination_sticks() {
        let mut state = AgentState::new("g", 2);
        state.terminate(LoopTermination::Aborted);
        state.terminate(LoopTermination::Completed);
        assert_eq!(state.termination(), Some(&LoopTermination::Aborted));
    }

    #[test]
    fn remaining_actions_saturate() {
        let mut state = AgentState::new("g", 1);
        state.record_action();
        state.record_action();
        assert_eq!(state.actions_remaining(), 0);
        assert_eq!(state.actions_taken(), 2);
    }
}
