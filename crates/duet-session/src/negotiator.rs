//! Offer/answer sequencing, glare resolution and renegotiation.
//!
//! The decision tables (`remote_offer_action`, `remote_answer_action`) are
//! plain functions of the current state so they can be tested without a
//! peer connection. `SessionNegotiator` carries them out against the
//! platform and the signaling channel.

use std::fmt;

use duet_common::{IceCandidate, Participant, RemotePeer, SignalingMessage};
use tracing::{debug, info, warn};

use crate::error::CallError;
use crate::ice::IceCoordinator;
use crate::media::MediaTrackSet;
use crate::peer::{OfferOptions, PeerConnection, SessionDescription};
use crate::signaling::SignalingChannel;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    Idle,
    HaveLocalOffer,
    HaveRemoteOffer,
    Stable,
    Closed,
}

impl NegotiationState {
    /// A local offer may only be created from `Idle` or `Stable`.
    pub fn can_offer(self) -> bool {
        matches!(self, Self::Idle | Self::Stable)
    }
}

impl fmt::Display for NegotiationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::Idle => "idle",
            Self::HaveLocalOffer => "have-local-offer",
            Self::HaveRemoteOffer => "have-remote-offer",
            Self::Stable => "stable",
            Self::Closed => "closed",
        };
        f.write_str(text)
    }
}

/// What to do with an incoming offer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OfferAction {
    Accept,
    /// Glare, and we are the polite side.
    RollbackThenAccept,
    /// Glare, and we are the impolite side: keep waiting for our answer.
    Ignore,
    Reject,
}

pub fn remote_offer_action(state: NegotiationState, polite: bool) -> OfferAction {
    match state {
        NegotiationState::Idle | NegotiationState::Stable | NegotiationState::HaveRemoteOffer => {
            OfferAction::Accept
        }
        NegotiationState::HaveLocalOffer if polite => OfferAction::RollbackThenAccept,
        NegotiationState::HaveLocalOffer => OfferAction::Ignore,
        NegotiationState::Closed => OfferAction::Reject,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnswerAction {
    Apply,
    /// No offer of ours is outstanding; a late or duplicated answer.
    Ignore,
}

pub fn remote_answer_action(state: NegotiationState) -> AnswerAction {
    match state {
        NegotiationState::HaveLocalOffer => AnswerAction::Apply,
        _ => AnswerAction::Ignore,
    }
}

/// Result of feeding one remote message to the negotiator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    Unchanged,
    /// An offer/answer cycle completed.
    Stable,
    RemoteBye,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OfferPurpose {
    Initial,
    Renegotiation,
    Restart,
}

#[derive(Debug)]
struct LocalOffer {
    sdp: String,
    purpose: OfferPurpose,
}

pub struct SessionNegotiator {
    local: Participant,
    signaling: SignalingChannel,
    ice: IceCoordinator,
    peer: Box<dyn PeerConnection>,
    state: NegotiationState,
    remote: Option<RemotePeer>,
    local_offer: Option<LocalOffer>,
    renegotiation_pending: bool,
    completed_cycles: u32,
    peer_closed: bool,
}

impl SessionNegotiator {
    pub fn new(local: Participant, signaling: SignalingChannel, peer: Box<dyn PeerConnection>) -> Self {
        Self {
            local,
            signaling,
            ice: IceCoordinator::new(),
            peer,
            state: NegotiationState::Idle,
            remote: None,
            local_offer: None,
            renegotiation_pending: false,
            completed_cycles: 0,
            peer_closed: false,
        }
    }

    pub fn state(&self) -> NegotiationState {
        self.state
    }

    pub fn remote(&self) -> Option<&RemotePeer> {
        self.remote.as_ref()
    }

    pub fn signaling(&self) -> &SignalingChannel {
        &self.signaling
    }

    pub fn signaling_mut(&mut self) -> &mut SignalingChannel {
        &mut self.signaling
    }

    pub fn ice(&self) -> &IceCoordinator {
        &self.ice
    }

    pub fn renegotiation_pending(&self) -> bool {
        self.renegotiation_pending
    }

    pub fn completed_cycles(&self) -> u32 {
        self.completed_cycles
    }

    fn transition(&mut self, next: NegotiationState) {
        if self.state != next {
            info!(
                session = %self.signaling.session(),
                peer = %self.local.id,
                "negotiation {} -> {}",
                self.state,
                next
            );
            self.state = next;
        }
    }

    pub async fn attach_tracks(&mut self, tracks: &MediaTrackSet) -> Result<(), CallError> {
        self.peer
            .attach_tracks(tracks)
            .await
            .map_err(CallError::negotiation)
    }

    /// First offer of the session.
    pub async fn start_offer(&mut self) -> Result<(), CallError> {
        self.offer(OfferPurpose::Initial, OfferOptions::default()).await
    }

    async fn offer(&mut self, purpose: OfferPurpose, options: OfferOptions) -> Result<(), CallError> {
        if !self.state.can_offer() {
            return Err(CallError::negotiation(format!(
                "cannot create an offer in state {}",
                self.state
            )));
        }
        let sdp = self
            .peer
            .create_offer(options)
            .await
            .map_err(CallError::negotiation)?;
        self.transition(NegotiationState::HaveLocalOffer);
        self.local_offer = Some(LocalOffer {
            sdp: sdp.clone(),
            purpose,
        });
        debug!(session = %self.signaling.session(), ?purpose, ice_restart = options.ice_restart, "sending offer");
        self.signaling.publish(SignalingMessage::Offer { sdp }).await?;
        Ok(())
    }

    /// Feed one message received from the remote peer.
    pub async fn handle_remote(
        &mut self,
        from: RemotePeer,
        message: SignalingMessage,
    ) -> Result<Progress, CallError> {
        if let Some(known) = &self.remote {
            if known.id != from.id {
                warn!(
                    session = %self.signaling.session(),
                    known = %known.id,
                    stranger = %from.id,
                    "ignoring {} from a third participant",
                    message.kind()
                );
                return Ok(Progress::Unchanged);
            }
        } else {
            self.remote = Some(from.clone());
        }

        match message {
            SignalingMessage::Offer { sdp } => self.on_remote_offer(&from, sdp).await,
            SignalingMessage::Answer { sdp } => self.on_remote_answer(sdp).await,
            SignalingMessage::IceCandidate { candidate } => {
                self.ice
                    .receive_remote_candidate(candidate, self.peer.as_mut())
                    .await;
                Ok(Progress::Unchanged)
            }
            SignalingMessage::Bye => {
                self.transition(NegotiationState::Closed);
                Ok(Progress::RemoteBye)
            }
        }
    }

    async fn on_remote_offer(&mut self, from: &RemotePeer, sdp: String) -> Result<Progress, CallError> {
        let polite = self.local.is_polite_towards(from);
        match remote_offer_action(self.state, polite) {
            OfferAction::Reject => {
                debug!(session = %self.signaling.session(), "offer after close dropped");
                Ok(Progress::Unchanged)
            }
            OfferAction::Ignore => {
                info!(session = %self.signaling.session(), "glare: keeping our offer, remote will yield");
                Ok(Progress::Unchanged)
            }
            OfferAction::RollbackThenAccept => {
                self.peer.rollback().await.map_err(CallError::negotiation)?;
                if let Some(dropped) = self.local_offer.take() {
                    if dropped.purpose == OfferPurpose::Renegotiation {
                        self.renegotiation_pending = true;
                    }
                }
                info!(session = %self.signaling.session(), "glare: rolled back our offer");
                self.transition(NegotiationState::Idle);
                self.accept_offer(sdp).await
            }
            OfferAction::Accept => self.accept_offer(sdp).await,
        }
    }

    async fn accept_offer(&mut self, sdp: String) -> Result<Progress, CallError> {
        self.peer
            .set_remote_description(&SessionDescription::offer(sdp))
            .await
            .map_err(CallError::negotiation)?;
        self.transition(NegotiationState::HaveRemoteOffer);
        self.ice.flush(self.peer.as_mut()).await;

        let answer = self
            .peer
            .create_answer()
            .await
            .map_err(CallError::negotiation)?;
        self.transition(NegotiationState::Stable);
        self.completed_cycles += 1;
        self.signaling
            .publish(SignalingMessage::Answer { sdp: answer })
            .await?;
        self.after_stable().await?;
        Ok(Progress::Stable)
    }

    async fn on_remote_answer(&mut self, sdp: String) -> Result<Progress, CallError> {
        if remote_answer_action(self.state) == AnswerAction::Ignore {
            debug!(session = %self.signaling.session(), state = %self.state, "stale answer dropped");
            return Ok(Progress::Unchanged);
        }
        self.peer
            .set_remote_description(&SessionDescription::answer(sdp))
            .await
            .map_err(CallError::negotiation)?;
        self.ice.flush(self.peer.as_mut()).await;
        self.local_offer = None;
        self.transition(NegotiationState::Stable);
        self.completed_cycles += 1;
        self.after_stable().await?;
        Ok(Progress::Stable)
    }

    async fn after_stable(&mut self) -> Result<(), CallError> {
        if self.renegotiation_pending {
            self.renegotiation_pending = false;
            debug!(session = %self.signaling.session(), "running deferred renegotiation");
            self.offer(OfferPurpose::Renegotiation, OfferOptions::default())
                .await?;
        }
        Ok(())
    }

    /// The outgoing video track changed. Offers right away when stable,
    /// otherwise once the current cycle completes. Returns whether an
    /// offer was sent now.
    pub async fn request_renegotiation(&mut self, tracks: &MediaTrackSet) -> Result<bool, CallError> {
        self.peer
            .replace_video_track(tracks.outgoing_video())
            .await
            .map_err(CallError::negotiation)?;
        match self.state {
            NegotiationState::Stable => {
                self.offer(OfferPurpose::Renegotiation, OfferOptions::default())
                    .await?;
                Ok(true)
            }
            NegotiationState::Closed => Ok(false),
            _ => {
                debug!(session = %self.signaling.session(), state = %self.state, "renegotiation deferred");
                self.renegotiation_pending = true;
                Ok(false)
            }
        }
    }

    /// Republish the outstanding offer under a new sequence number.
    pub async fn retransmit_offer(&mut self) -> Result<bool, CallError> {
        let sdp = match (&self.state, &self.local_offer) {
            (NegotiationState::HaveLocalOffer, Some(offer)) => offer.sdp.clone(),
            _ => return Ok(false),
        };
        self.signaling.publish(SignalingMessage::Offer { sdp }).await?;
        Ok(true)
    }

    /// Fresh offer with an ICE restart, replacing any outstanding one.
    pub async fn restart_offer(&mut self) -> Result<(), CallError> {
        if self.state == NegotiationState::HaveLocalOffer {
            self.peer.rollback().await.map_err(CallError::negotiation)?;
            self.local_offer = None;
            self.transition(NegotiationState::Idle);
        }
        self.offer(OfferPurpose::Restart, OfferOptions { ice_restart: true })
            .await
    }

    pub async fn publish_local_candidate(&mut self, candidate: IceCandidate) -> Result<u64, CallError> {
        self.ice
            .add_local_candidate(candidate, &mut self.signaling)
            .await
    }

    pub async fn send_bye(&mut self) -> Result<(), CallError> {
        self.signaling.publish(SignalingMessage::Bye).await.map(|_| ())
    }

    /// Close the peer connection and leave the signaling topic.
    pub async fn close(&mut self) {
        if !self.peer_closed {
            self.peer_closed = true;
            self.peer.close().await;
        }
        self.ice.discard();
        self.signaling.unsubscribe().await;
        self.transition(NegotiationState::Closed);
    }
}
