use std::path::Path;
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures::StreamExt;
use futures::stream::BoxStream;
use reqwest::{Client as HttpClient, Url};
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::ClientError;
use crate::protocol::{ChatRequest, ChatResponse, StreamEvent};

type ClientResult<T> = Result<T, ClientError>;

#[derive(Clone)]
pub struct ChatClient {
    base_url: String,
    session_id: String,
    http: HttpClient,
}

impl ChatClient {
    pub fn new(base_url: &str, session_id: Option<String>) -> Self {
        Self {
            base_url: normalize_base_url(base_url),
            session_id: session_id.unwrap_or_else(|| Uuid::new_v4().to_string()),
            http: HttpClient::new(),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub async fn send_message(&self, message: String) -> ClientResult<String> {
        let request = ChatRequest {
            session_id: self.session_id.clone(),
            message,
        };
        let response = self
            .http
            .post(format!("{}/api/chat", self.base_url))
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(ClientError::Status {
                context: "Failed to send message",
                status,
                body,
            });
        }

        let body: ChatResponse = response.json().await?;
        Ok(body.assistant_message)
    }

    /// Opens the session's event stream. The server has registered the
    /// subscription by the time this returns.
    pub async fn open_events(&self) -> ClientResult<EventStream> {
        let mut url = Url::parse(&format!("{}/api/events", self.base_url))
            .map_err(|e| ClientError::InvalidUrl(e.to_string()))?;
        url.query_pairs_mut()
            .append_pair("sessionId", &self.session_id);

        let response = self.http.get(url).send().await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(ClientError::Status {
                context: "Failed to open stream",
                status,
                body,
            });
        }

        Ok(EventStream {
            bytes: response.bytes_stream().boxed(),
            buffer: Vec::new(),
        })
    }

    /// Sends `message` while following the event stream, handing each event
    /// to `on_event` until the turn's `final` arrives. A rejected POST ends
    /// the wait with its error, since no `final` follows it.
    pub async fn ask<F>(&self, message: String, mut on_event: F) -> ClientResult<String>
    where
        F: FnMut(&StreamEvent),
    {
        let mut events = self.open_events().await?;
        let client = self.clone();
        let mut reply = tokio::spawn(async move { client.send_message(message).await });
        let mut answer = None;

        loop {
            tokio::select! {
                result = &mut reply, if answer.is_none() => {
                    let text = result.map_err(|_| ClientError::StreamClosed)??;
                    answer = Some(text);
                }
                event = events.next_event() => {
                    let Some(event) = event? else { break };
                    on_event(&event);
                    if event.is_final() {
                        break;
                    }
                }
            }
        }

        match answer {
            Some(text) => Ok(text),
            None => reply.await.map_err(|_| ClientError::StreamClosed)?,
        }
    }
}

pub struct EventStream {
    bytes: BoxStream<'static, reqwest::Result<Bytes>>,
    // Raw bytes so a character split across chunks is decoded whole.
    buffer: Vec<u8>,
}

impl EventStream {
    /// Returns the next decoded event, or `None` once the server closes the stream.
    pub async fn next_event(&mut self) -> ClientResult<Option<StreamEvent>> {
        loop {
            if let Some(idx) = self.buffer.windows(2).position(|w| w == b"\n\n") {
                let frame: Vec<u8> = self.buffer.drain(..idx + 2).collect();
                let raw_event = String::from_utf8_lossy(&frame[..idx]);

                if let Some((name, data)) = parse_frame(&raw_event) {
                    return Ok(Some(StreamEvent::from_frame(&name, &data)?));
                }
                continue;
            }

            let Some(chunk) = self.bytes.next().await else {
                return Ok(None);
            };
            self.buffer
                .extend(chunk?.iter().copied().filter(|&byte| byte != b'\r'));
        }
    }
}

#[derive(Debug)]
pub struct QueryResult {
    pub query: String,
    pub session_id: String,
    pub outcome: Result<String, String>,
    pub elapsed: Duration,
}

/// Sends each query in its own fresh session, one after another.
pub async fn run_batch(base_url: &str, queries: &[String], pause: Duration) -> Vec<QueryResult> {
    let mut results = Vec::with_capacity(queries.len());

    for (i, query) in queries.iter().enumerate() {
        let session_id = format!("test-{}", &Uuid::new_v4().simple().to_string()[..8]);
        let client = ChatClient::new(base_url, Some(session_id.clone()));
        info!(session_id = %session_id, index = i + 1, total = queries.len(), "running query");

        let started = Instant::now();
        let outcome = client
            .send_message(query.clone())
            .await
            .map_err(|e| e.to_string());
        if let Err(error) = &outcome {
            warn!(session_id = %session_id, %error, "query failed");
        }

        results.push(QueryResult {
            query: query.clone(),
            session_id,
            outcome,
            elapsed: started.elapsed(),
        });

        if i + 1 < queries.len() {
            tokio::time::sleep(pause).await;
        }
    }

    results
}

/// One query per line; blank lines, `#` comments and a leading `queries`
/// header are skipped.
pub fn load_queries(path: &Path) -> std::io::Result<Vec<String>> {
    let content = std::fs::read_to_string(path)?;
    Ok(content
        .lines()
        .map(str::trim)
        .enumerate()
        .filter(|(i, line)| !(*i == 0 && line.eq_ignore_ascii_case("queries")))
        .map(|(_, line)| line)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect())
}

pub fn print_summary(results: &[QueryResult]) {
    let total = results.len();
    let passed = results.iter().filter(|r| r.outcome.is_ok()).count();
    let total_time: Duration = results.iter().map(|r| r.elapsed).sum();
    let average = if total > 0 {
        total_time / total as u32
    } else {
        Duration::ZERO
    };

    println!("Total queries: {}", total);
    println!("Successful:    {}", passed);
    println!("Failed:        {}", total - passed);
    println!("Total time:    {:.2}s", total_time.as_secs_f64());
    println!("Average time:  {:.2}s per query", average.as_secs_f64());
    println!();

    for (i, result) in results.iter().enumerate() {
        let status = if result.outcome.is_ok() { "PASS" } else { "FAIL" };
        println!(
            "{}. {} [{:.2}s] session {}",
            i + 1,
            status,
            result.elapsed.as_secs_f64(),
            result.session_id
        );
        println!("   query: {}", result.query);
        match &result.outcome {
            Ok(reply) => println!("   reply: {}", truncate(reply, 150)),
            Err(error) => println!("   error: {}", error),
        }
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}

fn normalize_base_url(value: &str) -> String {
    value.trim_end_matches('/').to_string()
}

/// Splits one SSE frame into its event name and joined data lines.
/// Frames without data (comments) are skipped.
fn parse_frame(raw: &str) -> Option<(String, String)> {
    let mut name = "message".to_string();
    let mut data_lines = Vec::new();
    for line in raw.lines() {
        let line = line.trim_end_matches('\r');
        if let Some(event) = line.strip_prefix("event:") {
            name = event.trim().to_string();
        } else if let Some(data) = line.strip_prefix("data:") {
            data_lines.push(data.trim_start().to_string());
        }
    }

    if data_lines.is_empty() {
        None
    } else {
        Some((name, data_lines.join("\n")))
    }
}
