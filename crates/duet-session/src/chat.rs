//! Session chat over a sibling relay topic.
//!
//! Same delivery guarantees as signaling: at most once, no ordering
//! across senders. Sequence numbers let the receiver report gaps; late
//! messages are still delivered. Nothing here touches call state.

use std::collections::HashMap;
use std::sync::Arc;

use duet_common::{new_epoch, ChatMessage, Participant, SenderWindows, SessionId};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::archive::{hand_off_chat, SessionArchive};
use crate::error::CallError;
use crate::relay::{Relay, RelayEvent, SubscriptionId};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatEvent {
    Message(ChatMessage),
    /// `sender` skipped from `expected` to `received`.
    Gap {
        sender: String,
        expected: u64,
        received: u64,
    },
    Lost,
}

#[derive(Default)]
struct GapTracker {
    windows: SenderWindows,
    next_expected: HashMap<(String, u64), u64>,
}

impl GapTracker {
    fn admit(&mut self, message: ChatMessage) -> Vec<ChatEvent> {
        if !self
            .windows
            .admit(&message.sender_id, message.epoch, message.seq)
        {
            debug!(sender = %message.sender_id, seq = message.seq, "duplicate chat message dropped");
            return Vec::new();
        }
        let mut events = Vec::with_capacity(2);
        let expected = self
            .next_expected
            .entry((message.sender_id.clone(), message.epoch))
            .or_insert(1);
        if message.seq > *expected {
            events.push(ChatEvent::Gap {
                sender: message.sender_id.clone(),
                expected: *expected,
                received: message.seq,
            });
        }
        *expected = (*expected).max(message.seq.saturating_add(1));
        events.push(ChatEvent::Message(message));
        events
    }
}

pub struct ChatRelay {
    relay: Arc<dyn Relay>,
    session: SessionId,
    local: Participant,
    epoch: u64,
    next_seq: u64,
    archive: Option<Arc<dyn SessionArchive>>,
    active: Option<(SubscriptionId, JoinHandle<()>)>,
}

impl ChatRelay {
    pub fn new(relay: Arc<dyn Relay>, session: SessionId, local: Participant) -> Self {
        Self {
            relay,
            session,
            local,
            epoch: new_epoch(),
            next_seq: 1,
            archive: None,
            active: None,
        }
    }

    /// Archive sent and received messages.
    pub fn with_archive(mut self, archive: Arc<dyn SessionArchive>) -> Self {
        self.archive = Some(archive);
        self
    }

    pub fn is_joined(&self) -> bool {
        self.active.is_some()
    }

    pub async fn join(&mut self, capacity: usize) -> Result<mpsc::Receiver<ChatEvent>, CallError> {
        self.leave().await;

        let mut sub = self
            .relay
            .subscribe(&self.session.chat_topic())
            .await
            .map_err(|_| CallError::ChannelLost)?;
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let session = self.session.clone();
        let local_id = self.local.id.clone();
        let archive = self.archive.clone();

        let forwarder = tokio::spawn(async move {
            let mut tracker = GapTracker::default();
            while let Some(event) = sub.events.recv().await {
                let text = match event {
                    RelayEvent::Message(text) => text,
                    RelayEvent::Lost => break,
                };
                let message = match ChatMessage::decode(&text) {
                    Ok(message) => message,
                    Err(err) => {
                        warn!(%session, "dropping undecodable chat message: {}", err);
                        continue;
                    }
                };
                if message.session != session || message.sender_id == local_id {
                    continue;
                }
                for event in tracker.admit(message) {
                    if let ChatEvent::Message(message) = &event {
                        hand_off_chat(archive.as_ref(), message.clone());
                    }
                    if tx.send(event).await.is_err() {
                        return;
                    }
                }
            }
            let _ = tx.send(ChatEvent::Lost).await;
        });

        self.active = Some((sub.id, forwarder));
        Ok(rx)
    }

    pub async fn send(&mut self, body: impl Into<String>) -> Result<ChatMessage, CallError> {
        let message = ChatMessage {
            session: self.session.clone(),
            sender_id: self.local.id.clone(),
            sender_name: self.local.display_name.clone(),
            epoch: self.epoch,
            seq: self.next_seq,
            body: body.into(),
            sent_at_ms: chrono::Utc::now().timestamp_millis(),
        };
        let payload = message
            .encode()
            .map_err(|err| CallError::negotiation(format!("encode chat: {err}")))?;
        self.relay
            .publish(&self.session.chat_topic(), payload)
            .await
            .map_err(|_| CallError::ChannelLost)?;
        self.next_seq += 1;
        hand_off_chat(self.archive.as_ref(), message.clone());
        Ok(message)
    }

    pub async fn leave(&mut self) {
        if let Some((id, forwarder)) = self.active.take() {
            forwarder.abort();
            self.relay.unsubscribe(id).await;
        }
    }
}

impl Drop for ChatRelay {
    fn drop(&mut self) {
        if let Some((_, forwarder)) = self.active.take() {
            forwarder.abort();
        }
    }
}
