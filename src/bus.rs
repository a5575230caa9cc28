//! Per-session event fan-out.
//!
//! Every subscriber owns an unbounded queue. Publishing appends the event to
//! each live queue of the session, so concurrent subscribers all see the same
//! sequence and a slow reader never makes the publisher wait or drop events.
//! Nothing is retained for subscribers that arrive later.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::Stream;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::protocol::StreamEvent;

pub const DEFAULT_HEARTBEAT: Duration = Duration::from_secs(15);

pub struct EventBus {
    sessions: Mutex<HashMap<String, SessionChannel>>,
    heartbeat: Duration,
}

struct SessionChannel {
    subscribers: Vec<mpsc::UnboundedSender<StreamEvent>>,
    last_activity: Instant,
}

impl SessionChannel {
    fn new() -> Self {
        Self {
            subscribers: Vec::new(),
            last_activity: Instant::now(),
        }
    }

    fn prune(&mut self) {
        self.subscribers.retain(|tx| !tx.is_closed());
    }
}

impl EventBus {
    pub fn new(heartbeat: Duration) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            heartbeat,
        }
    }

    /// Appends `event` to every current subscriber of `session_id`.
    ///
    /// Creates the session entry when it does not exist yet. Never blocks on
    /// readers and never fails; queues whose subscriber went away are dropped.
    pub fn publish(&self, session_id: &str, event: StreamEvent) {
        let mut sessions = self.lock();
        let channel = sessions
            .entry(session_id.to_string())
            .or_insert_with(SessionChannel::new);
        channel.last_activity = Instant::now();
        channel
            .subscribers
            .retain(|tx| tx.send(event.clone()).is_ok());
        debug!(
            session_id,
            event = event.name(),
            subscribers = channel.subscribers.len(),
            "published event"
        );
    }

    /// Registers a new reader for `session_id`. It receives every event
    /// published from now on, plus a `ping` whenever the heartbeat interval
    /// passes without one.
    pub fn subscribe(&self, session_id: &str) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut sessions = self.lock();
        let channel = sessions
            .entry(session_id.to_string())
            .or_insert_with(SessionChannel::new);
        channel.prune();
        channel.subscribers.push(tx);
        channel.last_activity = Instant::now();

        Subscription {
            rx,
            heartbeat: self.heartbeat,
        }
    }

    pub fn subscriber_count(&self, session_id: &str) -> usize {
        self.lock()
            .get(session_id)
            .map(|channel| {
                channel
                    .subscribers
                    .iter()
                    .filter(|tx| !tx.is_closed())
                    .count()
            })
            .unwrap_or(0)
    }

    pub fn session_count(&self) -> usize {
        self.lock().len()
    }

    /// Removes sessions that have no live subscriber and saw no publish or
    /// subscribe for at least `max_idle`. Returns how many were removed.
    pub fn evict_idle(&self, max_idle: Duration) -> usize {
        let mut sessions = self.lock();
        let before = sessions.len();
        sessions.retain(|session_id, channel| {
            channel.prune();
            let idle =
                channel.subscribers.is_empty() && channel.last_activity.elapsed() >= max_idle;
            if idle {
                debug!(session_id = %session_id, "evicting idle session");
            }
            !idle
        });
        let removed = before - sessions.len();
        if removed > 0 {
            info!(
                removed,
                remaining = sessions.len(),
                "idle session eviction complete"
            );
        }
        removed
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, SessionChannel>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_HEARTBEAT)
    }
}

/// Reading end of one subscriber. Dropping it unsubscribes.
pub struct Subscription {
    rx: mpsc::UnboundedReceiver<StreamEvent>,
    heartbeat: Duration,
}

impl Subscription {
    /// Waits for the next event, yielding `ping` when the heartbeat elapses
    /// first. Returns `None` only if the session was removed from the bus.
    pub async fn next(&mut self) -> Option<StreamEvent> {
        match tokio::time::timeout(self.heartbeat, self.rx.recv()).await {
            Ok(event) => event,
            Err(_) => Some(StreamEvent::Ping {}),
        }
    }

    pub fn into_stream(self) -> impl Stream<Item = StreamEvent> + Send + 'static {
        futures::stream::unfold(self, |mut subscription| async move {
            subscription.next().await.map(|event| (event, subscription))
        })
    }

    #[cfg(test)]
    pub(crate) fn try_next(&mut self) -> Option<StreamEvent> {
        self.rx.try_recv().ok()
    }
}
