//! The read-only bundle of collaborators every engine component works with.

use std::sync::Arc;

use chrono::Utc;
use conductor_config::{EngineConfig, RouteTarget};
use conductor_core::{
    Completion, CompletionError, CompletionProfile, CompletionRequest, CompletionService,
    DomainEvent, EventBus, Result, ToolRegistry,
};
use tracing::debug;

use crate::executor::ParallelExecutor;
use crate::retry::RetryPolicy;
use crate::router::{RouteDecision, RouteRequest, Router};

/// Shared handles to the completion backend, tools, event bus, router and
/// configuration.
///
/// Cloning is cheap and nothing inside is mutable, so independent plans
/// and loops can share one context concurrently.
#[derive(Clone)]
pub struct ExecutionContext {
    completion: Arc<dyn CompletionService>,
    tools: Arc<ToolRegistry>,
    events: Arc<EventBus>,
    router: Arc<Router>,
    config: Arc<EngineConfig>,
}

impl ExecutionContext {
    /// Build a context with no tools and a private event bus.
    pub fn new(completion: Arc<dyn CompletionService>, config: EngineConfig) -> Self {
        Self {
            completion,
            tools: Arc::new(ToolRegistry::new()),
            events: Arc::new(EventBus::default()),
            router: Arc::new(Router::new(config.router.clone())),
            config: Arc::new(config),
        }
    }

    pub fn with_tools(mut self, tools: ToolRegistry) -> Self {
        self.tools = Arc::new(tools);
        self
    }

    pub fn with_event_bus(mut self, events: Arc<EventBus>) -> Self {
        self.events = events;
        self
    }

    pub fn completion(&self) -> &Arc<dyn CompletionService> {
        &self.completion
    }

    pub fn tools(&self) -> &ToolRegistry {
        &self.tools
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::from_config(&self.config.retry)
    }

    /// An executor configured from the `executor` section.
    pub fn executor(&self) -> ParallelExecutor {
        ParallelExecutor::from_config(&self.config.executor)
    }

    /// Route a request and report the decision on the event bus.
    pub fn route(&self, text: &str, target: Option<RouteTarget>) -> Result<RouteDecision> {
        let mut request = RouteRequest::new(text);
        if let Some(target) = target {
            request = request.with_target(target);
        }
        let decision = self.router.route(&request)?;

        debug!(
            profile = %decision.profile.name,
            rule = decision.rule.as_deref().unwrap_or("default"),
            "Route selected"
        );
        self.events.publish(DomainEvent::RouteSelected {
            profile: decision.profile.name.clone(),
            rule: decision.rule.clone(),
            timestamp: Utc::now(),
        });
        Ok(decision)
    }

    /// Call the completion backend, enforcing the profile's request timeout.
    pub async fn complete(
        &self,
        request: CompletionRequest,
        profile: &CompletionProfile,
    ) -> Result<Completion> {
        let call = self.completion.complete(request, profile);
        let completion = match profile.request_timeout() {
            Some(limit) => tokio::time::timeout(limit, call).await.map_err(|_| {
                CompletionError::Timeout(format!(
                    "profile '{}' exceeded {}ms",
                    profile.name,
                    limit.as_millis()
                ))
            })??,
            None => call.await?,
        };
        Ok(completion)
    }

    /// Route on the prompt text, then complete with the chosen profile.
    pub async fn complete_routed(
        &self,
        request: CompletionRequest,
        target: Option<RouteTarget>,
    ) -> Result<Completion> {
        let decision = self.route(&request.prompt, target)?;
        self.complete(request, &decision.profile).await
    }
}
