use std::convert::Infallible;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::Json;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Query, State};
use axum::http::header::{CACHE_CONTROL, HeaderName};
use axum::response::IntoResponse;
use axum::response::sse::{Event, Sse};
use axum::routing::{get, post};
use futures::StreamExt;
use serde::Deserialize;
use tokio::task::JoinHandle;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info};

use crate::agent::AgentRunner;
use crate::bus::EventBus;
use crate::error::ChatError;
use crate::protocol::{ChatRequest, ChatResponse, HealthResponse, StreamEvent};
use crate::relay::ChatRelay;

pub struct ServerConfig {
    pub listen: String,
    pub web_dir: Option<PathBuf>,
    pub heartbeat: Duration,
    pub idle_timeout: Duration,
    pub sweep_interval: Duration,
}

#[derive(Clone)]
pub struct AppState {
    bus: Arc<EventBus>,
    agent: Arc<dyn AgentRunner>,
    relay: Arc<ChatRelay>,
}

impl AppState {
    pub fn new(bus: Arc<EventBus>, agent: Arc<dyn AgentRunner>) -> Self {
        let relay = Arc::new(ChatRelay::new(Arc::clone(&bus), Arc::clone(&agent)));
        Self { bus, agent, relay }
    }

    /// Forgets bus sessions and agent history that have been idle for `max_idle`.
    pub fn evict_idle(&self, max_idle: Duration) {
        let sessions = self.bus.evict_idle(max_idle);
        let histories = self.agent.evict_idle(max_idle);
        if sessions + histories > 0 {
            debug!(sessions, histories, "idle sweep finished");
        }
    }
}

/// Runs [`AppState::evict_idle`] every `period` until aborted.
pub fn spawn_sweeper(state: AppState, period: Duration, max_idle: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            state.evict_idle(max_idle);
        }
    })
}

pub async fn run(config: ServerConfig, agent: Arc<dyn AgentRunner>) -> anyhow::Result<()> {
    let bus = Arc::new(EventBus::new(config.heartbeat));
    let state = AppState::new(bus, agent);
    let sweeper = spawn_sweeper(state.clone(), config.sweep_interval, config.idle_timeout);

    let web_dir = config.web_dir.filter(|dir| {
        let exists = dir.is_dir();
        if !exists {
            info!(dir = %dir.display(), "web directory not found, static UI disabled");
        }
        exists
    });
    let app = router(state, web_dir);

    let listener = tokio::net::TcpListener::bind(&config.listen).await?;
    info!(addr = %config.listen, "qa-agent server listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    sweeper.abort();
    info!("server stopped");
    Ok(())
}

/// API routes first; anything else falls through to the static UI when a
/// web directory is configured.
pub fn router(state: AppState, web_dir: Option<PathBuf>) -> axum::Router {
    let router = axum::Router::new()
        .route("/api/chat", post(chat))
        .route("/api/events", get(stream_events))
        .route("/health", get(health))
        .with_state(state);

    let router = match web_dir {
        Some(dir) => router.fallback_service(ServeDir::new(dir)),
        None => router,
    };

    router.layer(TraceLayer::new_for_http())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("shutdown signal received");
}

async fn chat(
    State(state): State<AppState>,
    payload: Result<Json<ChatRequest>, JsonRejection>,
) -> Result<Json<ChatResponse>, ChatError> {
    let Json(request) =
        payload.map_err(|rejection| ChatError::InvalidRequest(rejection.body_text()))?;

    // The turn runs detached so a client hanging up mid-turn cannot stop
    // `typing_end` and `final` from being published.
    let relay = Arc::clone(&state.relay);
    let turn =
        tokio::spawn(async move { relay.invoke(&request.session_id, &request.message).await });
    let assistant_message = turn
        .await
        .map_err(|e| ChatError::Internal(e.to_string()))??;

    Ok(Json(ChatResponse { assistant_message }))
}

#[derive(Debug, Deserialize)]
struct EventsQuery {
    #[serde(rename = "sessionId")]
    session_id: Option<String>,
}

async fn stream_events(
    State(state): State<AppState>,
    Query(query): Query<EventsQuery>,
) -> Result<impl IntoResponse, ChatError> {
    let session_id = query
        .session_id
        .filter(|id| !id.trim().is_empty())
        .ok_or(ChatError::MissingSession)?;

    let subscription = state.bus.subscribe(&session_id);
    info!(session_id = %session_id, "SSE connected");
    let connection = ConnectionLog { session_id };

    let stream = subscription.into_stream().map(move |event| {
        // Owned by the closure so the disconnect is logged when axum drops the stream.
        let _guard = &connection;
        Ok::<Event, Infallible>(to_sse_event(&event))
    });

    let headers = [
        (CACHE_CONTROL, "no-cache"),
        (HeaderName::from_static("x-accel-buffering"), "no"),
    ];
    Ok((headers, Sse::new(stream)))
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        sessions: state.bus.session_count(),
    })
}

fn to_sse_event(event: &StreamEvent) -> Event {
    Event::default()
        .event(event.name())
        .data(event.data().to_string())
}

/// Lives as long as the SSE response stream; logs the disconnect on drop.
struct ConnectionLog {
    session_id: String,
}

impl Drop for ConnectionLog {
    fn drop(&mut self) {
        info!(session_id = %self.session_id, "SSE disconnected");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::FALLBACK_MESSAGE;
    use crate::relay::tests::ScriptedAgent;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use serde_json::{Value, json};
    use tower::ServiceExt;

    fn test_state(agent: ScriptedAgent) -> AppState {
        AppState::new(Arc::new(EventBus::default()), Arc::new(agent))
    }

    async fn post_chat(state: &AppState, body: &str) -> (StatusCode, Value) {
        let app = router(state.clone(), None);
        let request = Request::builder()
            .method("POST")
            .uri("/api/chat")
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    async fn send_get(state: &AppState, uri: &str) -> axum::response::Response {
        let app = router(state.clone(), None);
        let request = Request::builder().uri(uri).body(Body::empty()).unwrap();
        app.oneshot(request).await.unwrap()
    }

    async fn next_frame(body: &mut Body) -> String {
        let frame = body.frame().await.unwrap().unwrap();
        String::from_utf8(frame.into_data().unwrap().to_vec()).unwrap()
    }

    #[tokio::test]
    async fn chat_reply_matches_final_event() {
        let state = test_state(ScriptedAgent::bug_lookup());
        let mut subscription = state.bus.subscribe("s1");

        let (status, body) = post_chat(
            &state,
            r#"{"sessionId":"s1","message":"How do I retest BUG-201?"}"#,
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        let events: Vec<_> = std::iter::from_fn(|| subscription.try_next()).collect();
        assert_eq!(events.len(), 5);
        match events.last() {
            Some(StreamEvent::Final { assistant_message }) => {
                assert_eq!(body["assistantMessage"], json!(assistant_message));
            }
            other => panic!("expected final event, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn agent_failure_answers_with_fallback() {
        let state = test_state(ScriptedAgent::failing());

        let (status, body) =
            post_chat(&state, r#"{"sessionId":"s1","message":"Test FEAT-101"}"#).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["assistantMessage"], FALLBACK_MESSAGE);
    }

    #[tokio::test]
    async fn empty_message_is_rejected_before_publishing() {
        let state = test_state(ScriptedAgent::bug_lookup());
        let mut subscription = state.bus.subscribe("s1");

        let (status, body) = post_chat(&state, r#"{"sessionId":"s1","message":""}"#).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "message must not be empty");
        assert!(subscription.try_next().is_none());
    }

    #[tokio::test]
    async fn malformed_chat_body_is_bad_request() {
        let state = test_state(ScriptedAgent::bug_lookup());

        let (status, body) = post_chat(&state, r#"{"message":"hi"}"#).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().starts_with("invalid request"));

        let (status, _) = post_chat(&state, "not json").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn events_require_session_id() {
        let state = test_state(ScriptedAgent::bug_lookup());

        assert_eq!(send_get(&state, "/api/events").await.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            send_get(&state, "/api/events?sessionId=").await.status(),
            StatusCode::BAD_REQUEST
        );
    }

    #[tokio::test]
    async fn events_stream_forwards_named_frames() {
        let state = test_state(ScriptedAgent::bug_lookup());

        let response = send_get(&state, "/api/events?sessionId=s1").await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["content-type"], "text/event-stream");
        assert_eq!(response.headers()["cache-control"], "no-cache");
        assert_eq!(state.bus.subscriber_count("s1"), 1);

        let mut body = response.into_body();
        state.bus.publish(
            "s1",
            StreamEvent::ToolCall {
                name: "get_bug_from_jira".to_string(),
                args: json!({"bug_id": "BUG-201"}),
            },
        );
        let frame = next_frame(&mut body).await;
        assert!(frame.contains("event: tool_call\n"), "{frame}");
        let data = frame
            .lines()
            .find_map(|line| line.strip_prefix("data: "))
            .unwrap();
        assert_eq!(
            serde_json::from_str::<Value>(data).unwrap(),
            json!({"name": "get_bug_from_jira", "args": {"bug_id": "BUG-201"}})
        );

        drop(body);
        assert_eq!(state.bus.subscriber_count("s1"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_stream_sends_ping_frames() {
        let bus = Arc::new(EventBus::new(Duration::from_secs(15)));
        let state = AppState::new(bus, Arc::new(ScriptedAgent::bug_lookup()));

        let response = send_get(&state, "/api/events?sessionId=quiet").await;
        let mut body = response.into_body();

        let frame = next_frame(&mut body).await;
        assert!(frame.contains("event: ping\n"), "{frame}");
        assert!(frame.contains("data: {}\n"), "{frame}");
    }

    #[tokio::test(start_paused = true)]
    async fn sweeper_evicts_idle_sessions_in_background() {
        let state = test_state(ScriptedAgent::bug_lookup());
        state.bus.publish("abandoned", StreamEvent::TypingStart {});
        let _watched = state.bus.subscribe("watched");
        let sweeper = spawn_sweeper(
            state.clone(),
            Duration::from_secs(60),
            Duration::from_secs(30),
        );

        tokio::time::sleep(Duration::from_secs(61)).await;
        tokio::task::yield_now().await;
        assert_eq!(state.bus.session_count(), 1);
        assert_eq!(state.bus.subscriber_count("watched"), 1);

        sweeper.abort();
        assert!(sweeper.await.unwrap_err().is_cancelled());
    }

    #[tokio::test]
    async fn health_reports_session_count() {
        let state = test_state(ScriptedAgent::bug_lookup());
        let _subscription = state.bus.subscribe("s1");

        let response = send_get(&state, "/health").await;
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let body: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["status"], "ok");
        assert_eq!(body["sessions"], 1);
    }

    #[tokio::test]
    async fn static_files_are_served_after_api_routes() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("index.html"), "<h1>QA Agent</h1>").unwrap();
        let state = test_state(ScriptedAgent::bug_lookup());
        let app = router(state, Some(dir.path().to_path_buf()));

        let request = Request::builder().uri("/").body(Body::empty()).unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&bytes[..], b"<h1>QA Agent</h1>");
    }
}
