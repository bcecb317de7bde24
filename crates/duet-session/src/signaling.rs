//! Typed signaling over the relay, scoped to one session.

use std::sync::{Arc, Mutex};

use duet_common::{
    new_epoch, Participant, RemotePeer, SenderWindows, SessionId, SignalEnvelope,
    SignalingMessage,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::CallError;
use crate::relay::{Relay, RelayEvent, SubscriptionId};

/// What a subscriber of the signaling channel receives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    Message {
        from: RemotePeer,
        seq: u64,
        message: SignalingMessage,
    },
    /// The relay connection dropped; the subscription is gone.
    Lost,
}

/// Handle to an active subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Subscription {
    pub id: SubscriptionId,
}

/// Publish/subscribe wrapper for one session's signaling topic.
///
/// Inbound envelopes are filtered before they reach the handler: other
/// sessions, our own echoes, and sequence numbers already seen from the
/// same sender instance are dropped. Nothing is reordered.
///
/// Every channel stamps its envelopes with a fresh epoch, so a participant
/// that leaves and rejoins under the same id starts a new window at the
/// far end instead of replaying numbers the peer already saw.
pub struct SignalingChannel {
    relay: Arc<dyn Relay>,
    session: SessionId,
    local: Participant,
    epoch: u64,
    next_seq: u64,
    active: Option<(Subscription, JoinHandle<()>)>,
    windows: Arc<Mutex<SenderWindows>>,
}

impl SignalingChannel {
    pub fn new(relay: Arc<dyn Relay>, session: SessionId, local: Participant) -> Self {
        Self {
            relay,
            session,
            local,
            epoch: new_epoch(),
            next_seq: 1,
            active: None,
            windows: Arc::new(Mutex::new(SenderWindows::new())),
        }
    }

    pub fn session(&self) -> &SessionId {
        &self.session
    }

    pub fn is_subscribed(&self) -> bool {
        self.active.is_some()
    }

    /// Subscribe to the session topic, delivering filtered events to
    /// `handler`. Replaces any previous subscription.
    pub async fn subscribe(
        &mut self,
        handler: mpsc::Sender<ChannelEvent>,
    ) -> Result<Subscription, CallError> {
        self.unsubscribe().await;

        let topic = self.session.signaling_topic();
        let mut relay_sub = self.relay.subscribe(&topic).await.map_err(|err| {
            warn!(session = %self.session, "signaling subscribe failed: {}", err);
            CallError::ChannelLost
        })?;

        let subscription = Subscription { id: relay_sub.id };
        let session = self.session.clone();
        let local_id = self.local.id.clone();
        let windows = Arc::clone(&self.windows);

        let forwarder = tokio::spawn(async move {
            while let Some(event) = relay_sub.events.recv().await {
                let text = match event {
                    RelayEvent::Message(text) => text,
                    RelayEvent::Lost => {
                        let _ = handler.send(ChannelEvent::Lost).await;
                        return;
                    }
                };
                let Some(event) = admit(&text, &session, &local_id, &windows) else {
                    continue;
                };
                if handler.send(event).await.is_err() {
                    return;
                }
            }
            // Relay side closed the stream without saying why.
            let _ = handler.send(ChannelEvent::Lost).await;
        });

        debug!(session = %self.session, subscription = subscription.id, "signaling subscribed");
        self.active = Some((subscription, forwarder));
        Ok(subscription)
    }

    /// Publish `message`, stamping it with our next sequence number.
    pub async fn publish(&mut self, message: SignalingMessage) -> Result<u64, CallError> {
        let seq = self.next_seq;
        self.next_seq += 1;

        let kind = message.kind();
        let envelope = SignalEnvelope {
            session: self.session.clone(),
            from: self.local.id.clone(),
            epoch: self.epoch,
            role: self.local.role,
            seq,
            message,
        };
        let payload = envelope
            .encode()
            .map_err(|err| CallError::negotiation(format!("encode {kind}: {err}")))?;

        self.relay
            .publish(&self.session.signaling_topic(), payload)
            .await
            .map_err(|err| {
                debug!(session = %self.session, seq, "publish {} failed: {}", kind, err);
                CallError::ChannelLost
            })?;
        debug!(session = %self.session, seq, "published {}", kind);
        Ok(seq)
    }

    /// Forget the current subscription after the relay reported it lost.
    pub fn mark_lost(&mut self) {
        if let Some((_, forwarder)) = self.active.take() {
            forwarder.abort();
        }
    }

    pub async fn unsubscribe(&mut self) {
        if let Some((subscription, forwarder)) = self.active.take() {
            forwarder.abort();
            self.relay.unsubscribe(subscription.id).await;
            debug!(session = %self.session, subscription = subscription.id, "signaling unsubscribed");
        }
    }
}

impl Drop for SignalingChannel {
    fn drop(&mut self) {
        if let Some((_, forwarder)) = self.active.take() {
            forwarder.abort();
        }
    }
}

fn admit(
    text: &str,
    session: &SessionId,
    local_id: &str,
    windows: &Mutex<SenderWindows>,
) -> Option<ChannelEvent> {
    let envelope = match SignalEnvelope::decode(text) {
        Ok(envelope) => envelope,
        Err(err) => {
            warn!(session = %session, "dropping undecodable signal: {}", err);
            return None;
        }
    };
    if &envelope.session != session {
        debug!(session = %session, foreign = %envelope.session, "dropping signal for another session");
        return None;
    }
    if envelope.from == local_id {
        return None;
    }
    let fresh = windows
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .admit(&envelope.from, envelope.epoch, envelope.seq);
    if !fresh {
        debug!(session = %session, from = %envelope.from, seq = envelope.seq, "dropping duplicate signal");
        return None;
    }
    Some(ChannelEvent::Message {
        from: envelope.sender(),
        seq: envelope.seq,
        message: envelope.message,
    })
}
