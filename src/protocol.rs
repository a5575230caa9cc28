use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRequest {
    pub session_id: String,
    pub message: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatResponse {
    pub assistant_message: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub sessions: usize,
}

/// One entry of a session's event stream.
///
/// The tag doubles as the SSE event name and the payload is sent as the
/// frame's `data:` line, so `{"type": "tool_end", "data": {"name": ..}}`
/// goes out as `event: tool_end` / `data: {"name": ..}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum StreamEvent {
    TypingStart {},
    TypingEnd {},
    ToolCall {
        name: String,
        args: Value,
    },
    ToolEnd {
        name: String,
    },
    Final {
        #[serde(rename = "assistantMessage")]
        assistant_message: String,
    },
    Ping {},
}

impl StreamEvent {
    pub fn name(&self) -> &'static str {
        match self {
            StreamEvent::TypingStart {} => "typing_start",
            StreamEvent::TypingEnd {} => "typing_end",
            StreamEvent::ToolCall { .. } => "tool_call",
            StreamEvent::ToolEnd { .. } => "tool_end",
            StreamEvent::Final { .. } => "final",
            StreamEvent::Ping {} => "ping",
        }
    }

    pub fn data(&self) -> Value {
        match self {
            StreamEvent::TypingStart {} | StreamEvent::TypingEnd {} | StreamEvent::Ping {} => {
                json!({})
            }
            StreamEvent::ToolCall { name, args } => json!({ "name": name, "args": args }),
            StreamEvent::ToolEnd { name } => json!({ "name": name }),
            StreamEvent::Final { assistant_message } => {
                json!({ "assistantMessage": assistant_message })
            }
        }
    }

    /// Rebuilds an event from a named SSE frame.
    pub fn from_frame(name: &str, data: &str) -> Result<Self, serde_json::Error> {
        let data: Value = if data.trim().is_empty() {
            json!({})
        } else {
            serde_json::from_str(data)?
        };
        serde_json::from_value(json!({ "type": name, "data": data }))
    }

    pub fn is_final(&self) -> bool {
        matches!(self, StreamEvent::Final { .. })
    }
}
