//! Boundary to the platform's peer connection.
//!
//! SDP and ICE are produced and consumed by the media stack; the session
//! only decides when to call what. Callback-style notifications from the
//! platform (new local candidates, transport failure) arrive as
//! [`PeerEvent`]s on the session's queue.

use anyhow::Result;
use async_trait::async_trait;
use duet_common::IceCandidate;
use tokio::sync::mpsc;

use crate::media::{MediaTrack, MediaTrackSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdpKind {
    Offer,
    Answer,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDescription {
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OfferOptions {
    /// Gather fresh candidates; used when recovering from connectivity loss.
    pub ice_restart: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerEvent {
    LocalCandidate(IceCandidate),
    /// Media transport dropped (network change, NAT rebinding, ...).
    TransportLost,
}

/// One platform peer connection.
///
/// `create_offer` and `create_answer` also install the result as the
/// local description.
#[async_trait]
pub trait PeerConnection: Send {
    async fn attach_tracks(&mut self, tracks: &MediaTrackSet) -> Result<()>;

    /// Swap the track feeding the outgoing video transceiver.
    async fn replace_video_track(&mut self, track: Option<&MediaTrack>) -> Result<()>;

    async fn create_offer(&mut self, options: OfferOptions) -> Result<String>;

    async fn create_answer(&mut self) -> Result<String>;

    async fn set_remote_description(&mut self, description: &SessionDescription) -> Result<()>;

    /// Discard the pending local offer.
    async fn rollback(&mut self) -> Result<()>;

    async fn add_ice_candidate(&mut self, candidate: &IceCandidate) -> Result<()>;

    async fn close(&mut self);
}

pub trait PeerConnectionFactory: Send + Sync {
    fn create(&self, events: mpsc::UnboundedSender<PeerEvent>) -> Result<Box<dyn PeerConnection>>;
}
