//! Hierarchical task orchestration: plan, dispatch, aggregate.
//!
//! ```text
//!   goal ──► Planner ──► Plan (validated DAG, nested sub-plans)
//!                          │
//!                          ▼
//!                     Dispatcher ──► ParallelExecutor, one wave at a time
//!                          │
//!                          ▼
//!                     Aggregator ──► Artifact (content + gaps)
//! ```

pub mod aggregator;
pub mod dispatcher;
pub mod planner;

use std::sync::Arc;

use conductor_config::EngineConfig;
use conductor_core::{Error, Plan, PlanError, Result};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::context::ExecutionContext;
pub use aggregator::{AggregationStrategy, Aggregator, Artifact, Gap, ResultReducer};
pub use dispatcher::{
    CompletionWorker, DispatchReport, Dispatcher, TaskWorker, Termination, UpstreamOutput,
};
pub use planner::{CompletionDecomposer, Decomposer, PlannedStep, Planner, parse_numbered_list};

/// What one orchestration run produced.
#[derive(Debug, Clone)]
pub struct OrchestrationOutcome {
    pub plan: Plan,
    pub report: DispatchReport,
    /// Present only when every wave ran
    pub artifact: Option<Artifact>,
}

pub struct Orchestrator {
    planner: Planner,
    dispatcher: Dispatcher,
}

impl Orchestrator {
    pub fn new(planner: Planner, dispatcher: Dispatcher) -> Self {
        Self {
            planner,
            dispatcher,
        }
    }

    /// Completion-backed planner and worker, policies from the config.
    pub fn from_config(config: &EngineConfig) -> Self {
        let settings = &config.orchestrator;
        Self {
            planner: Planner::new(Arc::new(CompletionDecomposer::new()), settings.max_plan_depth),
            dispatcher: Dispatcher::new(
                Arc::new(CompletionWorker::new()),
                settings.failure_policy,
                Aggregator::new(settings.aggregation.into()),
            ),
        }
    }

    pub fn with_decomposer(mut self, decomposer: Arc<dyn Decomposer>) -> Self {
        self.planner = Planner::new(decomposer, self.planner.max_depth());
        self
    }

    pub fn with_worker(mut self, worker: Arc<dyn TaskWorker>) -> Self {
        self.dispatcher = self.dispatcher.with_worker(worker);
        self
    }

    pub fn with_aggregation(mut self, strategy: AggregationStrategy) -> Self {
        self.dispatcher = self.dispatcher.with_aggregator(Aggregator::new(strategy));
        self
    }

    pub fn planner(&self) -> &Planner {
        &self.planner
    }

    /// Decompose `goal`, execute the plan and aggregate the results.
    pub async fn run(
        &self,
        goal: &str,
        ctx: &ExecutionContext,
        cancel: &CancellationToken,
    ) -> Result<OrchestrationOutcome> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        info!(goal, "Orchestration started");
        let plan = self.planner.decompose(goal, ctx, cancel).await?;
        self.run_plan(plan, ctx, cancel).await
    }

    /// Execute a plan built elsewhere.
    pub async fn run_plan(
        &self,
        plan: Plan,
        ctx: &ExecutionContext,
        cancel: &CancellationToken,
    ) -> Result<OrchestrationOutcome> {
        let depth = plan.deepest();
        if depth > self.planner.max_depth() {
            return Err(PlanError::DepthExceeded {
                depth,
                max: self.planner.max_depth(),
            }
            .into());
        }

        let report = self.dispatcher.execute(&plan, ctx, cancel).await?;
        let artifact = match report.termination {
            Termination::Completed => Some(self.dispatcher.aggregator().combine(&plan, &report.results)?),
            _ => None,
        };

        info!(
            goal = %plan.goal,
            termination = %report.termination,
            complete = artifact.as_ref().is_some_and(|a| a.complete),
            "Orchestration finished"
        );

        Ok(OrchestrationOutcome {
            plan,
            report,
            artifact,
        })
    }
}
