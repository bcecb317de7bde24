//! One-to-one call coordination for Duet.
//!
//! A call is driven by a single task per endpoint
//! ([`ConnectionStateMachine`]). It exchanges offers, answers and ICE
//! candidates with the remote peer over a pub/sub [`Relay`], resolves
//! simultaneous offers with the polite-peer rule, buffers early
//! candidates, recovers from relay or transport loss with bounded
//! backoff, and always ends in an observable `Closed` or `Failed` status.
//!
//! Capture devices and the media transport are platform collaborators
//! behind [`MediaPlatform`] and [`PeerConnectionFactory`]. The [`sim`]
//! module provides in-process versions of both.

#![forbid(unsafe_code)]

pub mod archive;
pub mod backoff;
pub mod call;
pub mod chat;
pub mod config;
pub mod error;
pub mod hangup;
pub mod ice;
pub mod media;
pub mod negotiator;
pub mod peer;
pub mod relay;
pub mod signaling;
pub mod sim;
pub mod status;

pub use archive::{CallOutcome, CallRecord, SessionArchive};
pub use call::{CallDeps, ConnectionStateMachine, LocalIdentity};
pub use chat::{ChatEvent, ChatRelay};
pub use config::CallConfig;
pub use error::{AcquisitionError, AcquisitionFailure, CallError};
pub use media::{MediaPlatform, MediaRequest, MediaTrack, MediaTrackSet};
pub use negotiator::NegotiationState;
pub use peer::{PeerConnection, PeerConnectionFactory, PeerEvent};
pub use relay::{InMemoryRelay, Relay, RelayError, RelayEvent};
pub use status::{CallState, ConnectionStatus};
