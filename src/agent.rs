use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures::future::BoxFuture;
use reqwest::Client;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::ai_sdk::{
    ContentBlock, MessageParam, MessageRequest, MessageResponse, ToolDefinitionApi,
};
use crate::data::{MockStore, normalize_key};
use crate::error::{AgentError, ToolError};
use crate::tools::{ToolDefinition, get_all_tools};

pub const DEFAULT_MODEL: &str = "claude-haiku-4-5-20251001";
pub const DEFAULT_API_URL: &str = "https://api.anthropic.com/v1/messages";

/// Lifecycle callbacks fired around every tool the agent executes.
///
/// Implementations must not block and must tolerate being called from
/// several tool invocations of the same turn.
pub trait ToolHooks: Send + Sync {
    fn on_tool_start(&self, name: &str, args: &serde_json::Value);
    fn on_tool_end(&self, name: &str);
}

/// Anything that can answer one chat message, reporting tool use through hooks.
pub trait AgentRunner: Send + Sync {
    fn run<'a>(
        &'a self,
        session_id: &'a str,
        message: &'a str,
        hooks: &'a dyn ToolHooks,
    ) -> BoxFuture<'a, Result<String, AgentError>>;

    /// Drops per-session state unused for at least `max_idle`. Returns how
    /// many sessions were forgotten.
    fn evict_idle(&self, _max_idle: Duration) -> usize {
        0
    }
}

pub struct AgentConfig {
    pub api_key: String,
    pub api_url: String,
    pub model: String,
    pub instructions: String,
    pub max_tokens: u32,
    pub max_turns: usize,
}

impl AgentConfig {
    pub fn new(api_key: String, instructions: String) -> Self {
        Self {
            api_key,
            api_url: DEFAULT_API_URL.to_string(),
            model: DEFAULT_MODEL.to_string(),
            instructions,
            max_tokens: 4096,
            max_turns: 10,
        }
    }
}

/// Tool-using QA agent backed by the Anthropic Messages API.
///
/// Conversation history is kept per session until the session goes idle.
pub struct Agent {
    client: Client,
    config: AgentConfig,
    tools: Vec<ToolDefinition>,
    store: Arc<MockStore>,
    conversations: Mutex<HashMap<String, Conversation>>,
}

struct Conversation {
    messages: Vec<MessageParam>,
    last_used: Instant,
}

impl Agent {
    pub fn new(config: AgentConfig, store: Arc<MockStore>) -> Self {
        Self {
            client: Client::new(),
            config,
            tools: get_all_tools(),
            store,
            conversations: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) async fn run_inference(
        &self,
        conversation: &[MessageParam],
    ) -> Result<MessageResponse, AgentError> {
        let tools_api: Vec<ToolDefinitionApi> = self
            .tools
            .iter()
            .map(|t| ToolDefinitionApi {
                name: t.name.to_string(),
                description: t.description.to_string(),
                input_schema: t.input_schema.clone(),
            })
            .collect();

        let request = MessageRequest {
            model: self.config.model.clone(),
            max_tokens: self.config.max_tokens,
            system: self.config.instructions.clone(),
            messages: conversation.to_vec(),
            tools: tools_api,
        };

        let response = self
            .client
            .post(&self.config.api_url)
            .header("x-api-key", &self.config.api_key)
            .header("anthropic-version", "2023-06-01")
            .header("content-type", "application/json")
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await?;
            return Err(AgentError::Api { status, body });
        }

        let response: MessageResponse = response.json().await?;
        debug!(
            id = %response.id,
            stop_reason = ?response.stop_reason,
            blocks = response.content.len(),
            "model response"
        );
        Ok(response)
    }

    /// Runs one tool, bracketed by the start and end hooks. The end hook
    /// fires whether or not the tool succeeded.
    pub(crate) async fn execute_tool(
        &self,
        id: &str,
        name: &str,
        input: &serde_json::Value,
        hooks: &dyn ToolHooks,
    ) -> ContentBlock {
        hooks.on_tool_start(name, &normalized_args(input));

        let result = match self.tools.iter().find(|t| t.name == name) {
            Some(tool) => (tool.handler)(Arc::clone(&self.store), input.clone()).await,
            None => Err(ToolError::NotFound(name.to_string())),
        };

        hooks.on_tool_end(name);

        match result {
            Ok(output) => ContentBlock::tool_result(id, output, false),
            Err(e) => {
                warn!(tool = name, error = %e, "tool call failed");
                ContentBlock::tool_result(id, e.to_string(), true)
            }
        }
    }

    async fn run_turn(
        &self,
        session_id: &str,
        message: &str,
        hooks: &dyn ToolHooks,
    ) -> Result<String, AgentError> {
        let mut conversation = self.history(session_id);
        conversation.push(MessageParam::user_text(message));

        for _ in 0..self.config.max_turns {
            let response = self.run_inference(&conversation).await?;
            let mut tool_results: Vec<ContentBlock> = Vec::new();

            for (id, name, input) in response.tool_uses() {
                tool_results.push(self.execute_tool(id, name, input, hooks).await);
            }

            let text = response.text();
            conversation.push(MessageParam::assistant(response.content));

            if tool_results.is_empty() {
                self.store_history(session_id, conversation);
                return Ok(text);
            }

            conversation.push(MessageParam::user(tool_results));
        }

        Err(AgentError::MaxTurns(self.config.max_turns))
    }

    fn history(&self, session_id: &str) -> Vec<MessageParam> {
        self.conversations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(session_id)
            .map(|conversation| conversation.messages.clone())
            .unwrap_or_default()
    }

    fn store_history(&self, session_id: &str, messages: Vec<MessageParam>) {
        self.conversations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                session_id.to_string(),
                Conversation {
                    messages,
                    last_used: Instant::now(),
                },
            );
    }

    fn forget_idle(&self, max_idle: Duration) -> usize {
        let mut conversations = self
            .conversations
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let before = conversations.len();
        conversations.retain(|_, conversation| conversation.last_used.elapsed() < max_idle);
        let removed = before - conversations.len();
        if removed > 0 {
            info!(
                removed,
                remaining = conversations.len(),
                "dropped idle conversation history"
            );
        }
        removed
    }
}

/// Tool arguments as reported to hooks: record ids are trimmed and
/// upper-cased the same way the store looks them up.
fn normalized_args(input: &serde_json::Value) -> serde_json::Value {
    let mut args = input.clone();
    if let Some(fields) = args.as_object_mut() {
        for (key, value) in fields.iter_mut() {
            if !key.ends_with("_id") {
                continue;
            }
            if let Some(id) = value.as_str() {
                *value = serde_json::Value::String(normalize_key(id));
            }
        }
    }
    args
}

impl AgentRunner for Agent {
    fn run<'a>(
        &'a self,
        session_id: &'a str,
        message: &'a str,
        hooks: &'a dyn ToolHooks,
    ) -> BoxFuture<'a, Result<String, AgentError>> {
        Box::pin(self.run_turn(session_id, message, hooks))
    }

    fn evict_idle(&self, max_idle: Duration) -> usize {
        self.forget_idle(max_idle)
    }
}
