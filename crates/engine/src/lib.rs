//! Execution strategies for Conductor.
//!
//! Every strategy works against an [`ExecutionContext`] and a
//! cancellation token supplied by the caller:
//!
//! 1. **Route** a request to a completion profile ([`Router`])
//! 2. **Fan out** independent work under a concurrency limit ([`ParallelExecutor`])
//! 3. **Orchestrate** a goal as a dependency plan of sub-tasks ([`Orchestrator`])
//! 4. **Converge** on a candidate through generate and evaluate rounds ([`EvaluatorOptimizerLoop`])
//! 5. **Pursue** an open-ended goal with the plan, act, observe cycle ([`AgentLoop`])
//!
//! [`PromptChain`] covers the simplest case, a fixed sequence of prompts.

pub mod agent;
pub mod chain;
pub mod context;
pub mod evaluator;
pub mod executor;
pub mod orchestrator;
pub mod retry;
pub mod router;

#[cfg(test)]
pub(crate) mod test_helpers;

pub use agent::{
    ActionPlanner, AgentAction, AgentLoop, AgentOutcome, AgentState, AnsweredDirectly,
    CompletionActionPlanner, GoalPredicate, LoopEvent, LoopState, LoopTermination, PlannedAction,
};
pub use chain::{ChainState, ChainStep, Gate, PromptChain, StepOutput, require_affirmative};
pub use context::ExecutionContext;
pub use evaluator::{
    CompletionEvaluator, CompletionGenerator, Convergence, EvaluationOutcome, EvaluationScore,
    Evaluator, EvaluatorOptimizerLoop, Feedback, Generator, OrchestratedGenerator, Verdict,
};
pub use executor::ParallelExecutor;
pub use orchestrator::{Artifact, OrchestrationOutcome, Orchestrator};
pub use retry::RetryPolicy;
pub use router::{RouteDecision, RouteRequest, Router};
