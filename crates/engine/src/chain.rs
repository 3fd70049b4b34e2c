//! Sequential prompt chains with validation gates.
//!
//! Each step builds its request from the chain input and the outputs of the
//! steps before it. A step may carry a gate that inspects its output; a
//! rejection stops the chain before the next step runs.

use std::sync::Arc;

use conductor_config::RouteTarget;
use conductor_core::{CompletionRequest, Error, Result};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::context::ExecutionContext;

/// What a step can see when it builds its request.
#[derive(Debug, Clone)]
pub struct ChainState {
    input: String,
    outputs: Vec<StepOutput>,
}

impl ChainState {
    fn new(input: &str) -> Self {
        Self {
            input: input.to_string(),
            outputs: Vec::new(),
        }
    }

    /// The text the chain was started with.
    pub fn input(&self) -> &str {
        &self.input
    }

    /// Output of the most recent step, or the chain input before any step ran.
    pub fn previous(&self) -> &str {
        self.outputs.last().map_or(&self.input, |o| &o.output)
    }

    /// Output of an earlier step by name.
    pub fn output(&self, step: &str) -> Option<&str> {
        self.outputs
            .iter()
            .find(|o| o.name == step)
            .map(|o| o.output.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepOutput {
    pub name: String,
    pub output: String,
}

type BuildFn = dyn Fn(&ChainState) -> CompletionRequest + Send + Sync;

/// Checks a step's output. `Err` carries the rejection reason.
pub type Gate = Arc<dyn Fn(&str) -> std::result::Result<(), String> + Send + Sync>;

#[derive(Clone)]
pub struct ChainStep {
    name: String,
    build: Arc<BuildFn>,
    gate: Option<Gate>,
    target: Option<RouteTarget>,
}

impl ChainStep {
    pub fn new<F>(name: impl Into<String>, build: F) -> Self
    where
        F: Fn(&ChainState) -> CompletionRequest + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            build: Arc::new(build),
            gate: None,
            target: None,
        }
    }

    /// A step whose prompt is `template` with `{previous}` and `{input}` filled in.
    pub fn template(name: impl Into<String>, template: impl Into<String>) -> Self {
        let template = template.into();
        Self::new(name, move |state: &ChainState| CompletionRequest::new(fill_template(&template, state)))
    }

    pub fn with_gate(mut self, gate: Gate) -> Self {
        self.gate = Some(gate);
        self
    }

    pub fn with_target(mut self, target: RouteTarget) -> Self {
        self.target = Some(target);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl std::fmt::Debug for ChainStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChainStep")
            .field("name", &self.name)
            .field("gated", &self.gate.is_some())
            .field("target", &self.target)
            .finish()
    }
}

/// Substitute `{previous}` and `{input}` in a single left-to-right pass,
/// so placeholder text inside a substituted value stays as written.
fn fill_template(template: &str, state: &ChainState) -> String {
    let mut filled = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(open) = rest.find('{') {
        filled.push_str(&rest[..open]);
        let tail = &rest[open..];
        if let Some(after) = tail.strip_prefix("{previous}") {
            filled.push_str(state.previous());
            rest = after;
        } else if let Some(after) = tail.strip_prefix("{input}") {
            filled.push_str(state.input());
            rest = after;
        } else {
            filled.push('{');
            rest = &tail[1..];
        }
    }
    filled.push_str(rest);
    filled
}

/// Accepts output that starts with YES (case-insensitive); otherwise the
/// output itself becomes the rejection reason.
pub fn require_affirmative() -> Gate {
    Arc::new(|output: &str| {
        let answer = output.trim_start();
        if answer.get(..3).is_some_and(|s| s.eq_ignore_ascii_case("yes")) {
            Ok(())
        } else {
            Err(answer.to_string())
        }
    })
}

#[derive(Debug, Clone, Default)]
pub struct PromptChain {
    steps: Vec<ChainStep>,
}

impl PromptChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn step(mut self, step: ChainStep) -> Self {
        self.steps.push(step);
        self
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Run every step in order and return all of their outputs.
    pub async fn run(
        &self,
        input: &str,
        ctx: &ExecutionContext,
        cancel: &CancellationToken,
    ) -> Result<Vec<StepOutput>> {
        let mut state = ChainState::new(input);
        info!(steps = self.steps.len(), "Prompt chain started");

        for step in &self.steps {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }

            let request = (step.build)(&state);
            let (completion, attempts) = ctx
                .retry_policy()
                .run(cancel, |_| ctx.complete_routed(request.clone(), step.target))
                .await;
            let completion = completion?;
            debug!(step = %step.name, attempts, chars = completion.content.len(), "Chain step finished");

            if let Some(gate) = &step.gate {
                if let Err(reason) = gate(&completion.content) {
                    warn!(step = %step.name, %reason, "Chain gate rejected output");
                    return Err(Error::GateRejected {
                        step: step.name.clone(),
                        reason,
                    });
                }
            }

            state.outputs.push(StepOutput {
                name: step.name.clone(),
                output: completion.content,
            });
        }

        info!(steps = state.outputs.len(), "Prompt chain finished");
        Ok(state.outputs)
    }
}
