//! Shared test helpers: scripted collaborators and context builders.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use conductor_config::EngineConfig;
use conductor_core::{
    Completion, CompletionError, CompletionProfile, CompletionRequest, CompletionService, Tool,
    ToolCall, ToolError, ToolOutput, ToolRegistry, Usage,
};

use crate::context::ExecutionContext;

type Responder = dyn Fn(&CompletionRequest) -> Result<Completion, CompletionError> + Send + Sync;

/// A completion service that replays scripted responses in order.
///
/// Panics if more calls are made than responses provided, unless built
/// with [`ScriptedCompletionService::from_fn`].
pub struct ScriptedCompletionService {
    responses: Mutex<VecDeque<Result<Completion, CompletionError>>>,
    responder: Option<Box<Responder>>,
    prompts: Mutex<Vec<String>>,
    profiles: Mutex<Vec<String>>,
    delay: Option<Duration>,
}

impl ScriptedCompletionService {
    pub fn new(responses: Vec<Result<Completion, CompletionError>>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            responder: None,
            prompts: Mutex::new(Vec::new()),
            profiles: Mutex::new(Vec::new()),
            delay: None,
        }
    }

    /// Plain text responses, each with a small usage record.
    pub fn texts(texts: &[&str]) -> Self {
        Self::new(texts.iter().map(|t| Ok(make_text(t))).collect())
    }

    /// Answer every request with a function of the request.
    pub fn from_fn<F>(f: F) -> Self
    where
        F: Fn(&CompletionRequest) -> Result<Completion, CompletionError> + Send + Sync + 'static,
    {
        let mut service = Self::new(Vec::new());
        service.responder = Some(Box::new(f));
        service
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn call_count(&self) -> usize {
        self.prompts.lock().unwrap().len()
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }

    pub fn profiles_seen(&self) -> Vec<String> {
        self.profiles.lock().unwrap().clone()
    }
}

#[async_trait]
impl CompletionService for ScriptedCompletionService {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn complete(
        &self,
        request: CompletionRequest,
        profile: &CompletionProfile,
    ) -> Result<Completion, CompletionError> {
        self.prompts.lock().unwrap().push(request.prompt.clone());
        self.profiles.lock().unwrap().push(profile.name.clone());

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        if let Some(responder) = &self.responder {
            return responder(&request);
        }

        let mut responses = self.responses.lock().unwrap();
        match responses.pop_front() {
            Some(response) => response,
            None => panic!(
                "ScriptedCompletionService: no more responses (call #{})",
                self.prompts.lock().unwrap().len()
            ),
        }
    }
}

/// A text completion with a fixed usage record of 15 tokens.
pub fn make_text(text: &str) -> Completion {
    let mut completion = Completion::text(text, "mock-model");
    completion.usage = Some(Usage {
        prompt_tokens: 10,
        completion_tokens: 5,
        total_tokens: 15,
    });
    completion
}

/// A completion that asks for one tool call.
pub fn make_tool_call(name: &str, args: serde_json::Value) -> Completion {
    let mut completion = make_text("");
    completion.tool_calls = vec![ToolCall {
        id: format!("call_{name}"),
        name: name.to_string(),
        arguments: args,
    }];
    completion
}

/// Echoes its `text` argument.
pub struct EchoTool;

#[async_trait]
impl Tool for EchoTool {
    fn name(&self) -> &str {
        "echo"
    }
    fn description(&self) -> &str {
        "Echoes back the input"
    }
    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": { "text": { "type": "string" } },
            "required": ["text"]
        })
    }
    async fn invoke(&self, arguments: serde_json::Value) -> Result<ToolOutput, ToolError> {
        let text = arguments["text"]
            .as_str()
            .ok_or_else(|| ToolError::InvalidArgs("missing 'text'".into()))?;
        Ok(ToolOutput::text(text))
    }
}

/// Always fails.
pub struct BrokenTool;

#[async_trait]
impl Tool for BrokenTool {
    fn name(&self) -> &str {
        "broken"
    }
    fn description(&self) -> &str {
        "Never works"
    }
    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({ "type": "object" })
    }
    async fn invoke(&self, _arguments: serde_json::Value) -> Result<ToolOutput, ToolError> {
        Err(ToolError::ExecutionFailed {
            tool_name: "broken".into(),
            reason: "disk on fire".into(),
        })
    }
}

pub fn make_context(service: Arc<dyn CompletionService>) -> ExecutionContext {
    make_context_with(service, EngineConfig::default())
}

/// Context with zero retry delay and the echo/broken tools registered.
pub fn make_context_with(service: Arc<dyn CompletionService>, mut config: EngineConfig) -> ExecutionContext {
    config.retry.base_delay_ms = 0;
    config.retry.max_delay_ms = 0;
    let tools = ToolRegistry::new()
        .with_tool(Box::new(EchoTool))
        .with_tool(Box::new(BrokenTool));
    ExecutionContext::new(service, config).with_tools(tools)
}
