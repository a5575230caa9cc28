//! Wire types for the Anthropic Messages API, limited to what a tool-using
//! chat turn needs.

use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize)]
pub(crate) struct MessageRequest {
    pub(crate) model: String,
    pub(crate) max_tokens: u32,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub(crate) system: String,
    pub(crate) messages: Vec<MessageParam>,
    pub(crate) tools: Vec<ToolDefinitionApi>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub(crate) enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct MessageParam {
    pub(crate) role: Role,
    pub(crate) content: Vec<ContentBlock>,
}

impl MessageParam {
    pub(crate) fn user(content: Vec<ContentBlock>) -> Self {
        Self {
            role: Role::User,
            content,
        }
    }

    pub(crate) fn user_text(text: impl Into<String>) -> Self {
        Self::user(vec![ContentBlock::Text { text: text.into() }])
    }

    pub(crate) fn assistant(content: Vec<ContentBlock>) -> Self {
        Self {
            role: Role::Assistant,
            content,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub(crate) enum ContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    ToolResult {
        tool_use_id: String,
        content: String,
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        is_error: bool,
    },
}

impl ContentBlock {
    pub(crate) fn tool_result(tool_use_id: &str, content: String, is_error: bool) -> Self {
        Self::ToolResult {
            tool_use_id: tool_use_id.to_string(),
            content,
            is_error,
        }
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct MessageResponse {
    pub(crate) id: String,
    pub(crate) content: Vec<ContentBlock>,
    #[serde(default)]
    pub(crate) stop_reason: Option<String>,
}

impl MessageResponse {
    /// Joins the text blocks, which is the agent's reply once the model
    /// stops asking for tools.
    pub(crate) fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|block| match block {
                ContentBlock::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    /// `(id, name, input)` of every tool the model asked for, in order.
    pub(crate) fn tool_uses(&self) -> impl Iterator<Item = (&str, &str, &serde_json::Value)> {
        self.content.iter().filter_map(|block| match block {
            ContentBlock::ToolUse { id, name, input } => Some((id.as_str(), name.as_str(), input)),
            _ => None,
        })
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct ToolDefinitionApi {
    pub(crate) name: String,
    pub(crate) description: String,
    pub(crate) input_schema: serde_json::Value,
}
