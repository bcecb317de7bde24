//! The external pub/sub relay and an in-process implementation of it.
//!
//! The session core needs four things from a relay: subscribe to a topic,
//! publish to a topic, unsubscribe, and a notification when the relay
//! connection drops. Delivery is at most once, with no replay for late
//! subscribers and no ordering promise across publishers.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::debug;

pub type SubscriptionId = u64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayEvent {
    Message(String),
    /// The relay connection dropped. The subscription that received this
    /// is dead; subscribe again once the relay is reachable.
    Lost,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RelayError {
    #[error("relay unavailable")]
    Unavailable,
    #[error("relay rejected request: {0}")]
    Rejected(String),
}

#[derive(Debug)]
pub struct RelaySubscription {
    pub id: SubscriptionId,
    pub events: mpsc::UnboundedReceiver<RelayEvent>,
}

#[async_trait]
pub trait Relay: Send + Sync + 'static {
    async fn subscribe(&self, topic: &str) -> Result<RelaySubscription, RelayError>;
    async fn publish(&self, topic: &str, payload: String) -> Result<(), RelayError>;
    async fn unsubscribe(&self, id: SubscriptionId);
}

struct Subscriber {
    id: SubscriptionId,
    tx: mpsc::UnboundedSender<RelayEvent>,
}

#[derive(Default)]
struct RelayState {
    online: bool,
    next_id: SubscriptionId,
    topics: HashMap<String, Vec<Subscriber>>,
    published: u64,
    discard: u32,
}

/// In-process relay used by tests and the demo binary.
///
/// Each publish is fanned out to the subscribers present at publish time.
/// With a non-zero latency the fan-out happens on a spawned task after
/// the delay, so messages from different publishers can interleave.
#[derive(Clone)]
pub struct InMemoryRelay {
    state: Arc<Mutex<RelayState>>,
    latency: Duration,
}

impl Default for InMemoryRelay {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryRelay {
    pub fn new() -> Self {
        Self::with_latency(Duration::ZERO)
    }

    pub fn with_latency(latency: Duration) -> Self {
        let state = RelayState {
            online: true,
            next_id: 1,
            ..Default::default()
        };
        Self {
            state: Arc::new(Mutex::new(state)),
            latency,
        }
    }

    fn lock(&self) -> MutexGuard<'_, RelayState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Drop the relay connection: every subscriber gets `Lost` and all
    /// traffic is refused until [`restore`](Self::restore).
    pub fn interrupt(&self) {
        let mut state = self.lock();
        state.online = false;
        for (_, subscribers) in state.topics.drain() {
            for subscriber in subscribers {
                let _ = subscriber.tx.send(RelayEvent::Lost);
            }
        }
        debug!("in-memory relay interrupted");
    }

    pub fn restore(&self) {
        self.lock().online = true;
        debug!("in-memory relay restored");
    }

    /// Accept the next `count` publishes and deliver them nowhere.
    pub fn drop_next(&self, count: u32) {
        self.lock().discard = count;
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.lock().topics.get(topic).map_or(0, Vec::len)
    }

    /// Total payloads accepted by `publish`.
    pub fn published(&self) -> u64 {
        self.lock().published
    }

    fn fan_out(state: &Mutex<RelayState>, topic: &str, payload: &str) {
        let mut state = state.lock().unwrap_or_else(|e| e.into_inner());
        if !state.online {
            return;
        }
        if let Some(subscribers) = state.topics.get_mut(topic) {
            subscribers.retain(|s| s.tx.send(RelayEvent::Message(payload.to_string())).is_ok());
        }
    }
}

#[async_trait]
impl Relay for InMemoryRelay {
    async fn subscribe(&self, topic: &str) -> Result<RelaySubscription, RelayError> {
        let mut state = self.lock();
        if !state.online {
            return Err(RelayError::Unavailable);
        }
        let id = state.next_id;
        state.next_id += 1;
        let (tx, events) = mpsc::unbounded_channel();
        state
            .topics
            .entry(topic.to_string())
            .or_default()
            .push(Subscriber { id, tx });
        Ok(RelaySubscription { id, events })
    }

    async fn publish(&self, topic: &str, payload: String) -> Result<(), RelayError> {
        {
            let mut state = self.lock();
            if !state.online {
                return Err(RelayError::Unavailable);
            }
            state.published += 1;
            if state.discard > 0 {
                state.discard -= 1;
                debug!(topic, "in-memory relay dropped a publish");
                return Ok(());
            }
        }

        if self.latency.is_zero() {
            Self::fan_out(&self.state, topic, &payload);
        } else {
            let state = Arc::clone(&self.state);
            let latency = self.latency;
            let topic = topic.to_string();
            tokio::spawn(async move {
                tokio::time::sleep(latency).await;
                Self::fan_out(&state, &topic, &payload);
            });
        }
        Ok(())
    }

    async fn unsubscribe(&self, id: SubscriptionId) {
        let mut state = self.lock();
        for subscribers in state.topics.values_mut() {
            subscribers.retain(|s| s.id != id);
        }
        state.topics.retain(|_, subscribers| !subscribers.is_empty());
    }
}
