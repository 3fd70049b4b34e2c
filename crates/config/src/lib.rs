//! Configuration loading, validation, and management for Conductor.
//!
//! Loads configuration from `~/.conductor/config.toml` with environment
//! variable overrides. Validates all settings before the engine sees them.
//! Once loaded, the configuration is read-only: the engine wraps it in an
//! `Arc` inside every execution context.

pub mod logging;

use conductor_core::{BackendTier, CompletionProfile};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// The root configuration structure.
///
/// Maps directly to `~/.conductor/config.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Parallel executor settings
    #[serde(default)]
    pub executor: ExecutorConfig,

    /// Planner / dispatcher / aggregator settings
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,

    /// Evaluate-refine convergence loop settings
    #[serde(default)]
    pub evaluator: EvaluatorConfig,

    /// Autonomous agent loop budgets and policies
    #[serde(default)]
    pub agent: AgentLoopConfig,

    /// Retry policy for transient backend errors
    #[serde(default)]
    pub retry: RetryConfig,

    /// Routing rules and completion profiles
    #[serde(default)]
    pub router: RouterConfig,

    /// Log output settings
    #[serde(default)]
    pub logging: LoggingConfig,
}

// ── Executor ────────────────────────────────────────────────────────────────

/// What a fan-out does when one of its tasks fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// First failure cancels everything else and fails the call
    FailFast,
    /// Every task runs to completion; the call returns mixed results
    #[default]
    CollectAll,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// Maximum tasks in flight at once
    #[serde(default = "default_concurrency_limit")]
    pub concurrency_limit: usize,

    /// Failure policy for direct executor call sites
    #[serde(default)]
    pub failure_policy: FailurePolicy,

    /// Timeout applied to tasks that do not carry their own
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_task_timeout_ms: Option<u64>,
}

fn default_concurrency_limit() -> usize {
    4
}

impl ExecutorConfig {
    pub fn default_task_timeout(&self) -> Option<Duration> {
        self.default_task_timeout_ms.map(Duration::from_millis)
    }
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            concurrency_limit: default_concurrency_limit(),
            failure_policy: FailurePolicy::default(),
            default_task_timeout_ms: None,
        }
    }
}

// ── Orchestrator ────────────────────────────────────────────────────────────

/// What the dispatcher does when a task of the plan fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanFailurePolicy {
    /// Stop before the next wave and report the plan as aborted
    #[default]
    Abort,
    /// Keep going; failed tasks and their dependents become gaps
    BestEffort,
}

/// How the aggregator combines per-task outputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregationMode {
    #[default]
    Concatenate,
    StructuredMerge,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Deepest nesting of goal decomposition allowed (root plan = 0)
    #[serde(default = "default_max_plan_depth")]
    pub max_plan_depth: usize,

    #[serde(default)]
    pub failure_policy: PlanFailurePolicy,

    #[serde(default)]
    pub aggregation: AggregationMode,
}

fn default_max_plan_depth() -> usize {
    3
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_plan_depth: default_max_plan_depth(),
            failure_policy: PlanFailurePolicy::default(),
            aggregation: AggregationMode::default(),
        }
    }
}

// ── Evaluator ───────────────────────────────────────────────────────────────

/// How several evaluator scores become one accept/reject number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScoreAggregation {
    /// The weakest perspective decides
    Min,
    /// Arithmetic mean of all perspectives
    #[default]
    Mean,
    /// Mean weighted by each score's weight
    Weighted,
    /// Zero if any perspective fails outright, otherwise the mean
    Veto,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluatorConfig {
    /// Hard upper bound on generation calls
    #[serde(default = "default_iteration_cap")]
    pub iteration_cap: u32,

    /// Aggregate score at or above which a candidate is accepted
    #[serde(default = "default_score_threshold")]
    pub score_threshold: f64,

    /// Consecutive non-improving rounds before giving up (0 disables)
    #[serde(default = "default_divergence_window")]
    pub divergence_window: u32,

    /// Smallest gain over the best score that counts as improvement
    #[serde(default)]
    pub min_improvement: f64,

    #[serde(default)]
    pub aggregation: ScoreAggregation,
}

fn default_iteration_cap() -> u32 {
    3
}
fn default_score_threshold() -> f64 {
    0.8
}
fn default_divergence_window() -> u32 {
    2
}

impl Default for EvaluatorConfig {
    fn default() -> Self {
        Self {
            iteration_cap: default_iteration_cap(),
            score_threshold: default_score_threshold(),
            divergence_window: default_divergence_window(),
            min_improvement: 0.0,
            aggregation: ScoreAggregation::default(),
        }
    }
}

// ── Agent loop ──────────────────────────────────────────────────────────────

/// What the agent loop does with an action that still fails after retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionFailurePolicy {
    /// Record the failure as an observation and plan again
    #[default]
    Continue,
    /// Terminate the loop as failed
    Abort,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentLoopConfig {
    /// Wall-clock budget for one loop run, in seconds
    #[serde(default = "default_wall_clock_budget_secs")]
    pub wall_clock_budget_secs: u64,

    /// Maximum actions one loop run may perform
    #[serde(default = "default_action_budget")]
    pub action_budget: u32,

    /// Optional ceiling on completion tokens consumed by the loop
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_budget: Option<u64>,

    #[serde(default)]
    pub failure_policy: ActionFailurePolicy,

    /// Observations longer than this are truncated
    #[serde(default = "default_observation_max_chars")]
    pub observation_max_chars: usize,
}

fn default_wall_clock_budget_secs() -> u64 {
    300
}
fn default_action_budget() -> u32 {
    10
}
fn default_observation_max_chars() -> usize {
    2_000
}

impl AgentLoopConfig {
    pub fn wall_clock_budget(&self) -> Duration {
        Duration::from_secs(self.wall_clock_budget_secs)
    }
}

impl Default for AgentLoopConfig {
    fn default() -> Self {
        Self {
            wall_clock_budget_secs: default_wall_clock_budget_secs(),
            action_budget: default_action_budget(),
            token_budget: None,
            failure_policy: ActionFailurePolicy::default(),
            observation_max_chars: default_observation_max_chars(),
        }
    }
}

// ── Retry ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts including the first one
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Base delay for exponential backoff
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    /// Cap for exponential backoff delay
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_max_attempts() -> u32 {
    3
}
fn default_base_delay_ms() -> u64 {
    200
}
fn default_max_delay_ms() -> u64 {
    5_000
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

// ── Router ──────────────────────────────────────────────────────────────────

/// Explicit cost/latency target a caller may attach to a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteTarget {
    LowLatency,
    LowCost,
    HighQuality,
}

/// One routing heuristic. A rule matches when any of its conditions holds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteRule {
    /// Rule name, reported in routing events
    pub name: String,

    /// Profile to select when the rule matches
    pub profile: String,

    /// Case-insensitive phrases; any contained phrase matches
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub keywords: Vec<String>,

    /// Matches requests with at least this many words
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_words: Option<usize>,

    /// Matches requests with at most this many words
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_words: Option<usize>,

    /// Matches requests carrying one of these explicit targets
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub targets: Vec<RouteTarget>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterConfig {
    /// Profile returned when no rule matches
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_profile: Option<String>,

    #[serde(default)]
    pub profiles: Vec<CompletionProfile>,

    /// Evaluated in order; first match wins
    #[serde(default)]
    pub rules: Vec<RouteRule>,
}

impl RouterConfig {
    pub fn profile(&self, name: &str) -> Option<&CompletionProfile> {
        self.profiles.iter().find(|p| p.name == name)
    }
}

fn phrases(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

impl Default for RouterConfig {
    /// Two-tier routing: detailed or analytical requests go to the capable
    /// model, short or explicitly quick ones to the fast model.
    fn default() -> Self {
        Self {
            default_profile: Some("fast".into()),
            profiles: vec![
                CompletionProfile::new("fast", BackendTier::Fast, "gpt-4o-mini"),
                CompletionProfile::new("smart", BackendTier::Advanced, "gpt-4o"),
            ],
            rules: vec![
                RouteRule {
                    name: "explicit-quality".into(),
                    profile: "smart".into(),
                    keywords: vec![],
                    min_words: None,
                    max_words: None,
                    targets: vec![RouteTarget::HighQuality],
                },
                RouteRule {
                    name: "explicit-speed".into(),
                    profile: "fast".into(),
                    keywords: vec![],
                    min_words: None,
                    max_words: None,
                    targets: vec![RouteTarget::LowLatency, RouteTarget::LowCost],
                },
                RouteRule {
                    name: "complexity".into(),
                    profile: "smart".into(),
                    keywords: phrases(&[
                        "explain in detail",
                        "comprehensive",
                        "thorough analysis",
                        "step by step",
                        "complex",
                        "intricate",
                        "elaborate",
                    ]),
                    min_words: None,
                    max_words: None,
                    targets: vec![],
                },
                RouteRule {
                    name: "brevity".into(),
                    profile: "fast".into(),
                    keywords: phrases(&[
                        "quick", "brief", "short", "tldr", "summary", "simple", "basic", "overview",
                    ]),
                    min_words: None,
                    max_words: None,
                    targets: vec![],
                },
                RouteRule {
                    name: "analysis".into(),
                    profile: "smart".into(),
                    keywords: phrases(&["analyze", "compare", "evaluate", "research"]),
                    min_words: Some(21),
                    max_words: None,
                    targets: vec![],
                },
            ],
        }
    }
}

// ── Logging ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of human-readable output
    #[serde(default)]
    pub json: bool,
}

fn default_log_level() -> String {
    "info".into()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

// ── Loading ─────────────────────────────────────────────────────────────────

impl EngineConfig {
    /// Load configuration from the default path with environment overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::config_dir().join("config.toml");
        let mut config = Self::load_from(&path)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file path.
    ///
    /// A missing file is not an error: defaults are returned instead.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::info!("No config file found at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Parse and validate configuration from a TOML string.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content).map_err(|e| ConfigError::ParseError {
            path: PathBuf::from("<inline>"),
            reason: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Get the configuration directory path.
    pub fn config_dir() -> PathBuf {
        dirs_home().join(".conductor")
    }

    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Apply `CONDUCTOR_*` overrides from any key lookup.
    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(limit) = parse_override::<usize>(&lookup, "CONDUCTOR_CONCURRENCY_LIMIT") {
            self.executor.concurrency_limit = limit;
        }
        if let Some(depth) = parse_override::<usize>(&lookup, "CONDUCTOR_MAX_PLAN_DEPTH") {
            self.orchestrator.max_plan_depth = depth;
        }
        if let Some(cap) = parse_override::<u32>(&lookup, "CONDUCTOR_ITERATION_CAP") {
            self.evaluator.iteration_cap = cap;
        }
        if let Some(budget) = parse_override::<u32>(&lookup, "CONDUCTOR_ACTION_BUDGET") {
            self.agent.action_budget = budget;
        }
        if let Some(level) = lookup("CONDUCTOR_LOG_LEVEL") {
            self.logging.level = level;
        }
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.executor.concurrency_limit == 0 {
            return Err(ConfigError::ValidationError(
                "executor.concurrency_limit must be at least 1".into(),
            ));
        }

        if self.evaluator.iteration_cap == 0 {
            return Err(ConfigError::ValidationError(
                "evaluator.iteration_cap must be at least 1".into(),
            ));
        }

        if !(0.0..=1.0).contains(&self.evaluator.score_threshold) {
            return Err(ConfigError::ValidationError(
                "evaluator.score_threshold must be between 0.0 and 1.0".into(),
            ));
        }

        if self.evaluator.min_improvement < 0.0 {
            return Err(ConfigError::ValidationError(
                "evaluator.min_improvement must not be negative".into(),
            ));
        }

        if self.agent.action_budget == 0 || self.agent.wall_clock_budget_secs == 0 {
            return Err(ConfigError::ValidationError(
                "agent budgets must be greater than zero".into(),
            ));
        }

        if self.retry.max_attempts == 0 {
            return Err(ConfigError::ValidationError(
                "retry.max_attempts must be at least 1".into(),
            ));
        }

        if self.retry.max_delay_ms < self.retry.base_delay_ms {
            return Err(ConfigError::ValidationError(
                "retry.max_delay_ms must not be below retry.base_delay_ms".into(),
            ));
        }

        if let Some(default) = &self.router.default_profile {
            if self.router.profile(default).is_none() {
                return Err(ConfigError::ValidationError(format!(
                    "router.default_profile '{default}' is not a configured profile"
                )));
            }
        }

        for rule in &self.router.rules {
            if self.router.profile(&rule.profile).is_none() {
                return Err(ConfigError::ValidationError(format!(
                    "routing rule '{}' refers to unknown profile '{}'",
                    rule.name, rule.profile
                )));
            }
        }

        Ok(())
    }

    /// Render the default configuration as TOML.
    pub fn default_toml() -> String {
        let config = Self::default();
        toml::to_string_pretty(&config).unwrap_or_default()
    }
}

fn parse_override<T: std::str::FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(key, value = %raw, "Ignoring unparsable environment override");
            None
        }
    }
}

/// Get the user's home directory.
fn dirs_home() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("C:\\Users\\Default"))
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/tmp"))
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file at {path}: {reason}")]
    ReadError { path: PathBuf, reason: String },

    #[error("Failed to parse config file at {path}: {reason}")]
    ParseError { path: PathBuf, reason: String },

    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}

impl From<ConfigError> for conductor_core::Error {
    fn from(e: ConfigError) -> Self {
        conductor_core::Error::Config {
            message: e.to_string(),
        }
    }
}
