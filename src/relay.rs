//! Drives one chat turn and mirrors its lifecycle onto the session's event stream.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use tracing::{error, info};

use crate::agent::{AgentRunner, ToolHooks};
use crate::bus::EventBus;
use crate::error::ChatError;
use crate::protocol::StreamEvent;

/// Reply used when the agent fails, so the stream still ends with `final`.
pub const FALLBACK_MESSAGE: &str =
    "Sorry, I couldn't complete that request because of an internal error. Please try again.";

pub struct ChatRelay {
    bus: Arc<EventBus>,
    agent: Arc<dyn AgentRunner>,
}

impl ChatRelay {
    pub fn new(bus: Arc<EventBus>, agent: Arc<dyn AgentRunner>) -> Self {
        Self { bus, agent }
    }

    /// Answers `message` for `session_id`.
    ///
    /// Publishes `typing_start`, a `tool_call`/`tool_end` pair per tool,
    /// `typing_end` and finally `final` carrying exactly the returned text.
    /// Invalid input is rejected before anything is published.
    pub async fn invoke(&self, session_id: &str, message: &str) -> Result<String, ChatError> {
        if session_id.trim().is_empty() {
            return Err(ChatError::MissingSession);
        }
        if message.trim().is_empty() {
            return Err(ChatError::EmptyMessage);
        }

        info!(session_id, "chat turn started");
        self.bus.publish(session_id, StreamEvent::TypingStart {});

        let hooks = SessionHooks {
            bus: &self.bus,
            session_id,
        };
        // A panicking agent must still leave the stream with its `final`.
        let outcome = AssertUnwindSafe(self.agent.run(session_id, message, &hooks))
            .catch_unwind()
            .await;
        let text = match outcome {
            Ok(Ok(text)) => text,
            Ok(Err(e)) => {
                error!(session_id, error = %e, "agent run failed");
                FALLBACK_MESSAGE.to_string()
            }
            Err(_) => {
                error!(session_id, "agent panicked");
                FALLBACK_MESSAGE.to_string()
            }
        };

        self.bus.publish(session_id, StreamEvent::TypingEnd {});
        self.bus.publish(
            session_id,
            StreamEvent::Final {
                assistant_message: text.clone(),
            },
        );
        info!(session_id, chars = text.len(), "chat turn finished");

        Ok(text)
    }
}

struct SessionHooks<'a> {
    bus: &'a EventBus,
    session_id: &'a str,
}

impl ToolHooks for SessionHooks<'_> {
    fn on_tool_start(&self, name: &str, args: &serde_json::Value) {
        info!(session_id = self.session_id, "tool-call {name}({args})");
        self.bus.publish(
            self.session_id,
            StreamEvent::ToolCall {
                name: name.to_string(),
                args: args.clone(),
            },
        );
    }

    fn on_tool_end(&self, name: &str) {
        self.bus.publish(
            self.session_id,
            StreamEvent::ToolEnd {
                name: name.to_string(),
            },
        );
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::bus::Subscription;
    use crate::error::AgentError;
    use futures::future::BoxFuture;
    use serde_json::json;

    /// Agent stand-in that calls a fixed list of tools, then replies.
    pub(crate) struct ScriptedAgent {
        pub(crate) tools: Vec<(&'static str, serde_json::Value)>,
        pub(crate) reply: Result<&'static str, &'static str>,
    }

    impl ScriptedAgent {
        pub(crate) fn bug_lookup() -> Self {
            Self {
                tools: vec![("get_bug_from_jira", json!({"bug_id": "BUG-201"}))],
                reply: Ok("Here are retest steps..."),
            }
        }

        pub(crate) fn failing() -> Self {
            Self {
                tools: vec![("get_feature_from_jira", json!({"feature_id": "FEAT-101"}))],
                reply: Err("model unavailable"),
            }
        }
    }

    impl AgentRunner for ScriptedAgent {
        fn run<'a>(
            &'a self,
            _session_id: &'a str,
            _message: &'a str,
            hooks: &'a dyn ToolHooks,
        ) -> BoxFuture<'a, Result<String, AgentError>> {
            Box::pin(async move {
                for (name, args) in &self.tools {
                    hooks.on_tool_start(name, args);
                    tokio::task::yield_now().await;
                    hooks.on_tool_end(name);
                }
                match self.reply {
                    Ok(text) => Ok(text.to_string()),
                    Err(_) => Err(AgentError::MaxTurns(0)),
                }
            })
        }
    }

    /// Runs two tools concurrently within one turn.
    struct ParallelAgent;

    impl AgentRunner for ParallelAgent {
        fn run<'a>(
            &'a self,
            _session_id: &'a str,
            _message: &'a str,
            hooks: &'a dyn ToolHooks,
        ) -> BoxFuture<'a, Result<String, AgentError>> {
            Box::pin(async move {
                let call = |name: &'static str| async move {
                    hooks.on_tool_start(name, &json!({}));
                    tokio::task::yield_now().await;
                    hooks.on_tool_end(name);
                };
                futures::join!(call("get_feature_from_jira"), call("get_project_context"));
                Ok("Prioritized.".to_string())
            })
        }
    }

    struct PanickingAgent;

    impl AgentRunner for PanickingAgent {
        fn run<'a>(
            &'a self,
            _session_id: &'a str,
            _message: &'a str,
            _hooks: &'a dyn ToolHooks,
        ) -> BoxFuture<'a, Result<String, AgentError>> {
            futures::future::lazy(|_| -> Result<String, AgentError> {
                panic!("agent blew up")
            })
            .boxed()
        }
    }

    fn drain(subscription: &mut Subscription) -> Vec<StreamEvent> {
        std::iter::from_fn(|| subscription.try_next()).collect()
    }

    #[tokio::test]
    async fn turn_events_are_published_in_order() {
        let bus = Arc::new(EventBus::default());
        let relay = ChatRelay::new(Arc::clone(&bus), Arc::new(ScriptedAgent::bug_lookup()));
        let mut subscription = bus.subscribe("s1");

        let reply = relay.invoke("s1", "How do I retest BUG-201?").await.unwrap();

        assert_eq!(reply, "Here are retest steps...");
        assert_eq!(
            drain(&mut subscription),
            vec![
                StreamEvent::TypingStart {},
                StreamEvent::ToolCall {
                    name: "get_bug_from_jira".to_string(),
                    args: json!({"bug_id": "BUG-201"}),
                },
                StreamEvent::ToolEnd {
                    name: "get_bug_from_jira".to_string(),
                },
                StreamEvent::TypingEnd {},
                StreamEvent::Final {
                    assistant_message: reply,
                },
            ]
        );
    }

    #[tokio::test]
    async fn agent_failure_still_ends_with_final() {
        let bus = Arc::new(EventBus::default());
        let relay = ChatRelay::new(Arc::clone(&bus), Arc::new(ScriptedAgent::failing()));
        let mut subscription = bus.subscribe("s1");

        let reply = relay.invoke("s1", "Test cases for FEAT-101?").await.unwrap();

        assert_eq!(reply, FALLBACK_MESSAGE);
        let events = drain(&mut subscription);
        assert_eq!(events.len(), 5);
        assert_eq!(events[3], StreamEvent::TypingEnd {});
        assert_eq!(
            events[4],
            StreamEvent::Final {
                assistant_message: FALLBACK_MESSAGE.to_string(),
            }
        );
    }

    #[tokio::test]
    async fn agent_panic_still_ends_with_final() {
        let bus = Arc::new(EventBus::default());
        let relay = ChatRelay::new(Arc::clone(&bus), Arc::new(PanickingAgent));
        let mut subscription = bus.subscribe("s1");

        let reply = relay.invoke("s1", "What is the release scope?").await.unwrap();

        assert_eq!(reply, FALLBACK_MESSAGE);
        let events = drain(&mut subscription);
        assert_eq!(events.len(), 3);
        assert_eq!(events[0], StreamEvent::TypingStart {});
        assert_eq!(events[1], StreamEvent::TypingEnd {});
        assert_eq!(
            events[2],
            StreamEvent::Final {
                assistant_message: FALLBACK_MESSAGE.to_string(),
            }
        );
    }

    #[tokio::test]
    async fn invalid_input_publishes_nothing() {
        let bus = Arc::new(EventBus::default());
        let relay = ChatRelay::new(Arc::clone(&bus), Arc::new(ScriptedAgent::bug_lookup()));
        let mut subscription = bus.subscribe("s1");

        assert!(matches!(
            relay.invoke("s1", "").await,
            Err(ChatError::EmptyMessage)
        ));
        assert!(matches!(
            relay.invoke("s1", "  \n").await,
            Err(ChatError::EmptyMessage)
        ));
        assert!(matches!(
            relay.invoke(" ", "hello").await,
            Err(ChatError::MissingSession)
        ));
        assert!(drain(&mut subscription).is_empty());
    }

    #[tokio::test]
    async fn publishing_without_subscriber_is_fine() {
        let bus = Arc::new(EventBus::default());
        let relay = ChatRelay::new(Arc::clone(&bus), Arc::new(ScriptedAgent::bug_lookup()));

        let reply = relay.invoke("nobody-listening", "hi").await.unwrap();
        assert_eq!(reply, "Here are retest steps...");
        assert_eq!(bus.session_count(), 1);
    }

    #[tokio::test]
    async fn concurrent_tools_each_get_a_matching_end() {
        let bus = Arc::new(EventBus::default());
        let relay = ChatRelay::new(Arc::clone(&bus), Arc::new(ParallelAgent));
        let mut subscription = bus.subscribe("s1");

        relay.invoke("s1", "Which feature is riskiest?").await.unwrap();

        let events = drain(&mut subscription);
        assert_eq!(events.first(), Some(&StreamEvent::TypingStart {}));
        assert!(events[events.len() - 1].is_final());
        for tool in ["get_feature_from_jira", "get_project_context"] {
            let call = events
                .iter()
                .position(|e| matches!(e, StreamEvent::ToolCall { name, .. } if name == tool))
                .unwrap();
            let end = events
                .iter()
                .position(|e| matches!(e, StreamEvent::ToolEnd { name } if name == tool))
                .unwrap();
            assert!(call < end);
            assert!(end < events.len() - 2);
        }
    }
}
