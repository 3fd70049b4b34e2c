//! Evaluate-refine convergence loop.
//!
//! A [`Generator`] produces a candidate, every [`Evaluator`] scores it from
//! its own perspective (concurrently, through the parallel executor), and
//! the combined score decides whether to accept, refine, or give up. The
//! loop stops at the score threshold, the iteration cap, or after a run of
//! rounds without improvement, whichever comes first.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use conductor_config::{EvaluatorConfig, FailurePolicy, ScoreAggregation};
use conductor_core::{CompletionRequest, DomainEvent, Error, Result, Task};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::context::ExecutionContext;
use crate::orchestrator::Orchestrator;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Pass,
    Fail,
}

/// One perspective's judgement of a candidate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationScore {
    pub perspective: String,
    /// In `[0, 1]`
    pub value: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verdict: Option<Verdict>,
    #[serde(default = "default_weight")]
    pub weight: f64,
    #[serde(default)]
    pub critique: String,
}

fn default_weight() -> f64 {
    1.0
}

impl EvaluationScore {
    /// Values outside `[0, 1]` are clamped.
    pub fn new(perspective: impl Into<String>, value: f64) -> Self {
        Self {
            perspective: perspective.into(),
            value: value.clamp(0.0, 1.0),
            verdict: None,
            weight: default_weight(),
            critique: String::new(),
        }
    }

    pub fn with_verdict(mut self, verdict: Verdict) -> Self {
        self.verdict = Some(verdict);
        self
    }

    pub fn with_weight(mut self, weight: f64) -> Self {
        self.weight = weight.max(0.0);
        self
    }

    pub fn with_critique(mut self, critique: impl Into<String>) -> Self {
        self.critique = critique.into();
        self
    }
}

/// Combine several scores into one number in `[0, 1]`.
///
/// An empty set of scores aggregates to zero.
pub fn aggregate_scores(scores: &[EvaluationScore], method: ScoreAggregation) -> f64 {
    if scores.is_empty() {
        return 0.0;
    }
    let mean = scores.iter().map(|s| s.value).sum::<f64>() / scores.len() as f64;
    match method {
        ScoreAggregation::Min => scores.iter().map(|s| s.value).fold(f64::INFINITY, f64::min),
        ScoreAggregation::Mean => mean,
        ScoreAggregation::Weighted => {
            let total: f64 = scores.iter().map(|s| s.weight).sum();
            if total <= 0.0 {
                mean
            } else {
                scores.iter().map(|s| s.value * s.weight).sum::<f64>() / total
            }
        }
        ScoreAggregation::Veto => {
            if scores.iter().any(|s| s.verdict == Some(Verdict::Fail)) {
                0.0
            } else {
                mean
            }
        }
    }
}

/// What the generator is told about the previous round.
#[derive(Debug, Clone, PartialEq)]
pub struct Feedback {
    pub previous: String,
    /// Weakest perspective first
    pub critique: String,
}

impl Feedback {
    pub fn from_scores(previous: &str, scores: &[EvaluationScore]) -> Self {
        let mut ordered: Vec<&EvaluationScore> = scores.iter().collect();
        ordered.sort_by(|a, b| a.value.total_cmp(&b.value));
        let critique = ordered
            .iter()
            .map(|s| {
                let note = if s.critique.is_empty() { "no comment" } else { s.critique.as_str() };
                format!("- {} ({:.2}): {}", s.perspective, s.value, note)
            })
            .collect::<Vec<_>>()
            .join("\n");
        Self {
            previous: previous.to_string(),
            critique,
        }
    }
}

/// Produces candidates, refining them from feedback.
#[async_trait]
pub trait Generator: Send + Sync {
    async fn generate(
        &self,
        task: &str,
        feedback: Option<&Feedback>,
        ctx: &ExecutionContext,
        cancel: &CancellationToken,
    ) -> Result<String>;
}

/// Scores a candidate from one perspective.
#[async_trait]
pub trait Evaluator: Send + Sync {
    fn perspective(&self) -> &str;

    async fn evaluate(&self, task: &str, candidate: &str, ctx: &ExecutionContext) -> Result<EvaluationScore>;
}

fn refinement_prompt(task: &str, feedback: Option<&Feedback>) -> String {
    match feedback {
        None => task.to_string(),
        Some(f) => format!(
            "{task}\n\nPrevious attempt:\n{}\n\nReviewer feedback (address the weakest points first):\n{}",
            f.previous, f.critique
        ),
    }
}

/// Single routed completion per round.
#[derive(Debug, Clone, Default)]
pub struct CompletionGenerator {
    system: Option<String>,
}

impl CompletionGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }
}

#[async_trait]
impl Generator for CompletionGenerator {
    async fn generate(
        &self,
        task: &str,
        feedback: Option<&Feedback>,
        ctx: &ExecutionContext,
        _cancel: &CancellationToken,
    ) -> Result<String> {
        let mut request = CompletionRequest::new(refinement_prompt(task, feedback));
        if let Some(system) = &self.system {
            request = request.with_system(system.clone());
        }
        Ok(ctx.complete_routed(request, None).await?.content)
    }
}

/// Runs a full orchestration per round and uses its artifact as the candidate.
pub struct OrchestratedGenerator {
    orchestrator: Arc<Orchestrator>,
}

impl OrchestratedGenerator {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        Self { orchestrator }
    }
}

#[async_trait]
impl Generator for OrchestratedGenerator {
    async fn generate(
        &self,
        task: &str,
        feedback: Option<&Feedback>,
        ctx: &ExecutionContext,
        cancel: &CancellationToken,
    ) -> Result<String> {
        let goal = refinement_prompt(task, feedback);
        let outcome = self.orchestrator.run(&goal, ctx, cancel).await?;
        match outcome.artifact {
            Some(artifact) => Ok(artifact.content),
            None if outcome.report.termination == crate::orchestrator::Termination::Cancelled => {
                Err(Error::Cancelled)
            }
            None => Err(Error::Internal(format!(
                "orchestrated candidate {}",
                outcome.report.termination
            ))),
        }
    }
}

/// Asks the completion backend to grade the candidate on a 1-10 scale.
///
/// The reply is expected to contain a `SCORE: n` line; everything else is
/// kept as critique. A `PASS` or `FAIL` word sets the verdict.
pub struct CompletionEvaluator {
    perspective: String,
    criteria: String,
}

impl CompletionEvaluator {
    pub fn new(perspective: impl Into<String>, criteria: impl Into<String>) -> Self {
        Self {
            perspective: perspective.into(),
            criteria: criteria.into(),
        }
    }
}

#[async_trait]
impl Evaluator for CompletionEvaluator {
    fn perspective(&self) -> &str {
        &self.perspective
    }

    async fn evaluate(&self, task: &str, candidate: &str, ctx: &ExecutionContext) -> Result<EvaluationScore> {
        let prompt = format!(
            "Task:\n{task}\n\nResponse:\n{candidate}\n\nReview the response as a {} focusing on {}. \
             Reply with `SCORE: n` (1-10), `PASS` or `FAIL`, and a short critique.",
            self.perspective, self.criteria
        );
        let completion = ctx.complete_routed(CompletionRequest::new(prompt), None).await?;
        Ok(parse_review(&self.perspective, &completion.content))
    }
}

/// Turn a free-text review into a score.
pub fn parse_review(perspective: &str, review: &str) -> EvaluationScore {
    let mut value = None;
    let mut verdict = None;
    let mut critique = Vec::new();

    for line in review.lines() {
        let trimmed = line.trim();
        let upper = trimmed.to_ascii_uppercase();
        if let Some(rest) = upper.strip_prefix("SCORE:") {
            let number = rest.trim().split(['/', ' ']).next().unwrap_or_default();
            if let Ok(n) = number.parse::<f64>() {
                value = Some(n / 10.0);
            }
            continue;
        }
        if upper == "PASS" {
            verdict = Some(Verdict::Pass);
            continue;
        }
        if upper == "FAIL" {
            verdict = Some(Verdict::Fail);
            continue;
        }
        if !trimmed.is_empty() {
            critique.push(trimmed);
        }
    }

    let mut score = EvaluationScore::new(perspective, value.unwrap_or(0.0)).with_critique(critique.join(" "));
    score.verdict = verdict;
    score
}

/// Why a convergence loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Convergence {
    /// A candidate met the score threshold
    Accepted,
    /// The iteration cap was reached first
    Exhausted,
    /// Scores stopped improving
    Diverged,
}

impl fmt::Display for Convergence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Convergence::Accepted => f.write_str("accepted"),
            Convergence::Exhausted => f.write_str("exhausted"),
            Convergence::Diverged => f.write_str("diverged"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct EvaluationRound {
    pub iteration: u32,
    pub candidate: String,
    pub scores: Vec<EvaluationScore>,
    pub aggregate: f64,
}

#[derive(Debug, Clone)]
pub struct EvaluationOutcome {
    pub termination: Convergence,
    /// The accepted candidate, or the best one seen
    pub candidate: String,
    pub score: f64,
    pub history: Vec<EvaluationRound>,
}

impl EvaluationOutcome {
    pub fn generations(&self) -> usize {
        self.history.len()
    }
}

pub struct EvaluatorOptimizerLoop {
    generator: Arc<dyn Generator>,
    evaluators: Vec<Arc<dyn Evaluator>>,
    config: EvaluatorConfig,
}

impl EvaluatorOptimizerLoop {
    pub fn new(generator: Arc<dyn Generator>, config: EvaluatorConfig) -> Self {
        Self {
            generator,
            evaluators: Vec::new(),
            config,
        }
    }

    pub fn with_evaluator(mut self, evaluator: Arc<dyn Evaluator>) -> Self {
        self.evaluators.push(evaluator);
        self
    }

    pub async fn run(
        &self,
        task: &str,
        ctx: &ExecutionContext,
        cancel: &CancellationToken,
    ) -> Result<EvaluationOutcome> {
        if self.evaluators.is_empty() {
            return Err(Error::Internal("convergence loop has no evaluators".into()));
        }

        let cap = self.config.iteration_cap.max(1);
        let mut history: Vec<EvaluationRound> = Vec::new();
        let mut best: Option<usize> = None;
        let mut stale_rounds = 0u32;
        let mut feedback: Option<Feedback> = None;

        info!(
            iteration_cap = cap,
            threshold = self.config.score_threshold,
            evaluators = self.evaluators.len(),
            "Convergence loop started"
        );

        for iteration in 1..=cap {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }

            let (candidate, _) = ctx
                .retry_policy()
                .run(cancel, |_| self.generator.generate(task, feedback.as_ref(), ctx, cancel))
                .await;
            let candidate = candidate?;
            let scores = self.evaluate_all(task, &candidate, ctx, cancel).await?;
            let aggregate = aggregate_scores(&scores, self.config.aggregation);

            debug!(iteration, aggregate, "Round scored");
            ctx.events().publish(DomainEvent::EvaluationRound {
                iteration,
                aggregate,
                timestamp: Utc::now(),
            });

            let improved = best.is_none_or(|i| aggregate > history[i].aggregate + self.config.min_improvement);
            feedback = Some(Feedback::from_scores(&candidate, &scores));
            history.push(EvaluationRound {
                iteration,
                candidate,
                scores,
                aggregate,
            });
            if improved {
                best = Some(history.len() - 1);
                stale_rounds = 0;
            } else {
                stale_rounds += 1;
            }

            let termination = if aggregate >= self.config.score_threshold {
                Some((Convergence::Accepted, history.len() - 1))
            } else if iteration == cap {
                best.map(|i| (Convergence::Exhausted, i))
            } else if self.config.divergence_window > 0 && stale_rounds >= self.config.divergence_window {
                best.map(|i| (Convergence::Diverged, i))
            } else {
                None
            };

            if let Some((termination, index)) = termination {
                let chosen = &history[index];
                info!(%termination, iteration, score = chosen.aggregate, "Convergence loop finished");
                return Ok(EvaluationOutcome {
                    termination,
                    candidate: chosen.candidate.clone(),
                    score: chosen.aggregate,
                    history,
                });
            }
        }

        Err(Error::Internal("convergence loop ended without a decision".into()))
    }

    async fn evaluate_all(
        &self,
        task: &str,
        candidate: &str,
        ctx: &ExecutionContext,
        cancel: &CancellationToken,
    ) -> Result<Vec<EvaluationScore>> {
        let jobs: Vec<Task> = self
            .evaluators
            .iter()
            .enumerate()
            .map(|(i, e)| Task::new(format!("eval-{i}"), e.perspective()))
            .collect();

        let results = ctx
            .executor()
            .with_policy(FailurePolicy::FailFast)
            .with_retry(ctx.retry_policy())
            .submit(&jobs, cancel, |job, _| {
                let index = jobs.iter().position(|j| j.id == job.id).unwrap_or_default();
                let evaluator = self.evaluators[index].clone();
                async move {
                    let score = evaluator.evaluate(task, candidate, ctx).await?;
                    Ok(serde_json::to_string(&score)?)
                }
            })
            .await?;

        results
            .iter()
            .map(|r| {
                let raw = r.output().unwrap_or_default();
                Ok(serde_json::from_str::<EvaluationScore>(raw)?)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::{ScriptedCompletionService, make_context, make_text};
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingGenerator {
        calls: AtomicUsize,
        feedback: Mutex<Vec<Option<Feedback>>>,
    }

    impl CountingGenerator {
        fn new() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                feedback: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl Generator for CountingGenerator {
        async fn generate(
            &self,
            _task: &str,
            feedback: Option<&Feedback>,
            _ctx: &ExecutionContext,
            _cancel: &CancellationToken,
        ) -> Result<String> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            self.feedback.lock().unwrap().push(feedback.cloned());
            Ok(format!("candidate {n}"))
        }
    }

    /// Returns scores from a fixed sequence, repeating the last one.
    struct SequenceEvaluator {
        name: &'static str,
        values: Vec<f64>,
        calls: AtomicUsize,
    }

    impl SequenceEvaluator {
        fn new(name: &'static str, values: &[f64]) -> Self {
            Self {
                name,
                values: values.to_vec(),
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl Evaluator for SequenceEvaluator {
        fn perspective(&self) -> &str {
            self.name
        }

        async fn evaluate(&self, _task: &str, _candidate: &str, _ctx: &ExecutionContext) -> Result<EvaluationScore> {
            let i = self.calls.fetch_add(1, Ordering::SeqCst);
            let value = self.values[i.min(self.values.len() - 1)];
            Ok(EvaluationScore::new(self.name, value).with_critique(format!("{} says {value}", self.name)))
        }
    }

    fn ctx() -> ExecutionContext {
        make_context(Arc::new(ScriptedCompletionService::texts(&[])))
    }

    fn config(cap: u32, window: u32) -> EvaluatorConfig {
        EvaluatorConfig {
            iteration_cap: cap,
            divergence_window: window,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn never_passing_evaluator_exhausts_after_exactly_cap_generations() {
        let generator = Arc::new(CountingGenerator::new());
        let lp = EvaluatorOptimizerLoop::new(generator.clone(), config(3, 2))
            .with_evaluator(Arc::new(SequenceEvaluator::new("critic", &[0.5])));

        let outcome = lp.run("write", &ctx(), &CancellationToken::new()).await.unwrap();

        assert_eq!(outcome.termination, Convergence::Exhausted);
        assert_eq!(generator.calls.load(Ordering::SeqCst), 3);
        assert_eq!(outcome.generations(), 3);
        assert_eq!(outcome.candidate, "candidate 1");
        assert!((outcome.score - 0.5).abs() < 1e-9);
    }

    #[tokio::test]
    async fn accepts_when_threshold_met() {
        let generator = Arc::new(CountingGenerator::new());
        let lp = EvaluatorOptimizerLoop::new(generator.clone(), config(5, 0))
            .with_evaluator(Arc::new(SequenceEvaluator::new("critic", &[0.4, 0.6, 0.85])));

        let outcome = lp.run("write", &ctx(), &CancellationToken::new()).await.unwrap();

        assert_eq!(outcome.termination, Convergence::Accepted);
        assert_eq!(outcome.candidate, "candidate 3");
        assert_eq!(generator.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn stalls_diverge_before_cap() {
        let generator = Arc::new(CountingGenerator::new());
        let lp = EvaluatorOptimizerLoop::new(generator.clone(), config(10, 2))
            .with_evaluator(Arc::new(SequenceEvaluator::new("critic", &[0.6, 0.5, 0.55])));

        let outcome = lp.run("write", &ctx(), &CancellationToken::new()).await.unwrap();

        assert_eq!(outcome.termination, Convergence::Diverged);
        assert_eq!(outcome.generations(), 3);
        assert_eq!(outcome.candidate, "candidate 1");
    }

    #[tokio::test]
    async fn min_improvement_counts_small_gains_as_stalls() {
        let generator = Arc::new(CountingGenerator::new());
        let mut cfg = config(10, 1);
        cfg.min_improvement = 0.05;
        let lp = EvaluatorOptimizerLoop::new(generator, cfg)
            .with_evaluator(Arc::new(SequenceEvaluator::new("critic", &[0.5, 0.52])));

        let outcome = lp.run("write", &ctx(), &CancellationToken::new()).await.unwrap();
        assert_eq!(outcome.termination, Convergence::Diverged);
        assert_eq!(outcome.generations(), 2);
    }

    #[tokio::test]
    async fn cap_wins_over_divergence_in_final_round() {
        let lp = EvaluatorOptimizerLoop::new(Arc::new(CountingGenerator::new()), config(2, 1))
            .with_evaluator(Arc::new(SequenceEvaluator::new("critic", &[0.5, 0.4])));
        let outcome = lp.run("write", &ctx(), &CancellationToken::new()).await.unwrap();
        assert_eq!(outcome.termination, Convergence::Exhausted);
    }

    #[tokio::test]
    async fn feedback_lists_weakest_perspective_first() {
        let generator = Arc::new(CountingGenerator::new());
        let lp = EvaluatorOptimizerLoop::new(generator.clone(), config(2, 0))
            .with_evaluator(Arc::new(SequenceEvaluator::new("style", &[0.9])))
            .with_evaluator(Arc::new(SequenceEvaluator::new("accuracy", &[0.2])));

        lp.run("write", &ctx(), &CancellationToken::new()).await.unwrap();

        let seen = generator.feedback.lock().unwrap();
        assert!(seen[0].is_none());
        let critique = &seen[1].as_ref().unwrap().critique;
        assert!(critique.find("accuracy").unwrap() < critique.find("style").unwrap());
        assert_eq!(seen[1].as_ref().unwrap().previous, "candidate 1");
    }

    #[tokio::test]
    async fn cancellation_stops_before_generating() {
        let generator = Arc::new(CountingGenerator::new());
        let lp = EvaluatorOptimizerLoop::new(generator.clone(), config(3, 0))
            .with_evaluator(Arc::new(SequenceEvaluator::new("critic", &[0.1])));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = lp.run("write", &ctx(), &cancel).await.unwrap_err();
        assert!(matches!(err, Error::Cancelled));
        assert_eq!(generator.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn without_evaluators_is_an_error() {
        let lp = EvaluatorOptimizerLoop::new(Arc::new(CountingGenerator::new()), config(3, 0));
        assert!(lp.run("write", &ctx(), &CancellationToken::new()).await.is_err());
    }

    #[test]
    fn aggregation_methods() {
        let scores = vec![
            EvaluationScore::new("a", 0.2).with_weight(3.0),
            EvaluationScore::new("b", 0.8).with_weight(1.0).with_verdict(Verdict::Pass),
        ];
        assert!((aggregate_scores(&scores, ScoreAggregation::Min) - 0.2).abs() < 1e-9);
        assert!((aggregate_scores(&scores, ScoreAggregation::Mean) - 0.5).abs() < 1e-9);
        assert!((aggregate_scores(&scores, ScoreAggregation::Weighted) - 0.35).abs() < 1e-9);
        assert!((aggregate_scores(&scores, ScoreAggregation::Veto) - 0.5).abs() < 1e-9);

        let vetoed = vec![
            EvaluationScore::new("a", 0.9),
            EvaluationScore::new("b", 0.9).with_verdict(Verdict::Fail),
        ];
        assert_eq!(aggregate_scores(&vetoed, ScoreAggregation::Veto), 0.0);
        assert_eq!(aggregate_scores(&[], ScoreAggregation::Mean), 0.0);
    }

    #[test]
    fn parses_free_text_review() {
        let score = parse_review("editor", "Score: 7/10\nFAIL\nThe intro is weak.\nToo long.");
        assert!((score.value - 0.7).abs() < 1e-9);
        assert_eq!(score.verdict, Some(Verdict::Fail));
        assert_eq!(score.critique, "The intro is weak. Too long.");

        let unscored = parse_review("editor", "looks fine");
        assert_eq!(unscored.value, 0.0);
        assert!(unscored.verdict.is_none());
    }

    #[tokio::test]
    async fn completion_generator_and_evaluator_round_trip() {
        let service = Arc::new(ScriptedCompletionService::texts(&[
            "draft one",
            "SCORE: 9\nPASS\nSolid.",
        ]));
        let ctx = make_context(service.clone());
        let lp = EvaluatorOptimizerLoop::new(Arc::new(CompletionGenerator::new()), config(3, 0))
            .with_evaluator(Arc::new(CompletionEvaluator::new("reviewer", "clarity")));

        let outcome = lp.run("Write a haiku", &ctx, &CancellationToken::new()).await.unwrap();
        assert_eq!(outcome.termination, Convergence::Accepted);
        assert_eq!(outcome.candidate, "draft one");
        assert!(service.prompts()[1].contains("draft one"));
    }

    #[tokio::test]
    async fn rate_limited_generation_is_retried() {
        let service = Arc::new(ScriptedCompletionService::new(vec![
            Err(conductor_core::CompletionError::RateLimited { retry_after_ms: None }),
            Ok(make_text("draft")),
            Ok(make_text("SCORE: 9\nPASS")),
        ]));
        let ctx = make_context(service.clone());
        let lp = EvaluatorOptimizerLoop::new(Arc::new(CompletionGenerator::new()), config(3, 0))
            .with_evaluator(Arc::new(CompletionEvaluator::new("reviewer", "clarity")));

        let outcome = lp.run("Write a haiku", &ctx, &CancellationToken::new()).await.unwrap();

        assert_eq!(outcome.termination, Convergence::Accepted);
        assert_eq!(outcome.candidate, "draft");
        assert_eq!(outcome.generations(), 1);
        assert_eq!(service.call_count(), 3);
    }
}
