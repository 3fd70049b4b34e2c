//! Combining per-task outputs into one artifact.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use conductor_config::AggregationMode;
use conductor_core::{Plan, Result, TaskId, TaskResult, TaskStatus};
use serde::{Deserialize, Serialize};

/// A task whose output is missing from the artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Gap {
    pub task_id: TaskId,
    pub status: TaskStatus,
    pub reason: String,
}

/// The aggregated result of a plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Artifact {
    pub content: String,
    pub gaps: Vec<Gap>,
    /// False whenever at least one gap exists
    pub complete: bool,
}

/// Caller-supplied reduction of a plan's results into text.
pub trait ResultReducer: Send + Sync {
    fn reduce(&self, plan: &Plan, results: &BTreeMap<TaskId, TaskResult>, gaps: &[Gap]) -> Result<String>;
}

#[derive(Clone)]
pub enum AggregationStrategy {
    /// Sections in plan order
    Concatenate,
    /// JSON object keyed by task id
    StructuredMerge,
    Custom(Arc<dyn ResultReducer>),
}

impl fmt::Debug for AggregationStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Concatenate => f.write_str("Concatenate"),
            Self::StructuredMerge => f.write_str("StructuredMerge"),
            Self::Custom(_) => f.write_str("Custom"),
        }
    }
}

impl From<AggregationMode> for AggregationStrategy {
    fn from(mode: AggregationMode) -> Self {
        match mode {
            AggregationMode::Concatenate => Self::Concatenate,
            AggregationMode::StructuredMerge => Self::StructuredMerge,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Aggregator {
    strategy: AggregationStrategy,
}

impl Aggregator {
    pub fn new(strategy: AggregationStrategy) -> Self {
        Self { strategy }
    }

    pub fn strategy(&self) -> &AggregationStrategy {
        &self.strategy
    }

    /// Combine results in plan order. Tasks without a successful result
    /// are reported as gaps.
    pub fn combine(&self, plan: &Plan, results: &BTreeMap<TaskId, TaskResult>) -> Result<Artifact> {
        let gaps = find_gaps(plan, results);
        let content = match &self.strategy {
            AggregationStrategy::Concatenate => concatenate(plan, results),
            AggregationStrategy::StructuredMerge => structured_merge(plan, results)?,
            AggregationStrategy::Custom(reducer) => reducer.reduce(plan, results, &gaps)?,
        };
        Ok(Artifact {
            content,
            complete: gaps.is_empty(),
            gaps,
        })
    }
}

impl Default for Aggregator {
    fn default() -> Self {
        Self::new(AggregationStrategy::Concatenate)
    }
}

fn find_gaps(plan: &Plan, results: &BTreeMap<TaskId, TaskResult>) -> Vec<Gap> {
    plan.tasks
        .iter()
        .filter_map(|task| match results.get(&task.id) {
            Some(r) if r.is_success() => None,
            Some(r) => Some(Gap {
                task_id: task.id.clone(),
                status: r.status(),
                reason: r.error().unwrap_or("no detail").to_string(),
            }),
            None => Some(Gap {
                task_id: task.id.clone(),
                status: TaskStatus::Cancelled,
                reason: "not executed".into(),
            }),
        })
        .collect()
}

fn concatenate(plan: &Plan, results: &BTreeMap<TaskId, TaskResult>) -> String {
    plan.tasks
        .iter()
        .map(|task| {
            let body = match results.get(&task.id) {
                Some(r) if r.is_success() => r.output().unwrap_or_default().to_string(),
                Some(r) => format!("[missing: {}: {}]", r.status(), r.error().unwrap_or("no detail")),
                None => "[missing: not executed]".to_string(),
            };
            format!("## {}\n{}", task.id, body)
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

fn structured_merge(plan: &Plan, results: &BTreeMap<TaskId, TaskResult>) -> Result<String> {
    let mut merged = serde_json::Map::new();
    for task in &plan.tasks {
        let value = match results.get(&task.id) {
            Some(r) if r.is_success() => serde_json::Value::String(r.output().unwrap_or_default().to_string()),
            Some(r) => serde_json::json!({
                "gap": r.status(),
                "reason": r.error().unwrap_or("no detail"),
            }),
            None => serde_json::json!({ "gap": TaskStatus::Cancelled, "reason": "not executed" }),
        };
        merged.insert(task.id.to_string(), value);
    }
    Ok(serde_json::to_string_pretty(&serde_json::Value::Object(merged))?)
}
