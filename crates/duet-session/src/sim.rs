//! Simulated media platform, peer connections and archive.
//!
//! Used by the test suite and the demo binary in place of real capture
//! devices and a real media transport. Every operation is recorded so
//! tests can assert on what the session asked the platform to do.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use duet_common::{ChatMessage, IceCandidate};
use tokio::sync::mpsc;
use tracing::debug;

use crate::archive::{CallRecord, SessionArchive};
use crate::error::{AcquisitionError, AcquisitionFailure};
use crate::media::{LocalMedia, MediaPlatform, MediaRequest, MediaTrack, MediaTrackSet, TrackId, TrackKind};
use crate::peer::{OfferOptions, PeerConnection, PeerConnectionFactory, PeerEvent, SdpKind, SessionDescription};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

#[derive(Default)]
struct DeviceState {
    next_id: TrackId,
    live: Vec<TrackId>,
    stopped: Vec<TrackId>,
    acquisitions: u32,
    toggles: u32,
    deny_camera: bool,
    deny_display: bool,
    failures: VecDeque<AcquisitionFailure>,
    acquire_delay: Duration,
    display_delay: Duration,
}

impl DeviceState {
    fn track(&mut self, kind: TrackKind, label: &str) -> MediaTrack {
        self.next_id += 1;
        self.live.push(self.next_id);
        MediaTrack {
            id: self.next_id,
            kind,
            label: label.to_string(),
            enabled: true,
        }
    }
}

/// Capture devices that always exist unless told otherwise.
#[derive(Default)]
pub struct SimMediaPlatform {
    state: Mutex<DeviceState>,
}

impl SimMediaPlatform {
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse every request that includes video.
    pub fn deny_camera(&self) {
        lock(&self.state).deny_camera = true;
    }

    pub fn deny_display(&self) {
        lock(&self.state).deny_display = true;
    }

    /// Fail the next acquisition with `reason`. Queued failures are used
    /// in order.
    pub fn fail_next(&self, reason: AcquisitionFailure) {
        lock(&self.state).failures.push_back(reason);
    }

    /// Simulate a permission prompt that takes `delay` to resolve.
    pub fn set_acquire_delay(&self, delay: Duration) {
        lock(&self.state).acquire_delay = delay;
    }

    /// Simulate a display picker left open for `delay`.
    pub fn set_display_delay(&self, delay: Duration) {
        lock(&self.state).display_delay = delay;
    }

    pub fn acquisitions(&self) -> u32 {
        lock(&self.state).acquisitions
    }

    /// Ids of stopped tracks, in stop order. A track stopped twice shows
    /// up twice.
    pub fn stopped(&self) -> Vec<TrackId> {
        lock(&self.state).stopped.clone()
    }

    pub fn live(&self) -> Vec<TrackId> {
        lock(&self.state).live.clone()
    }

    pub fn toggles(&self) -> u32 {
        lock(&self.state).toggles
    }
}

#[async_trait]
impl MediaPlatform for SimMediaPlatform {
    async fn acquire(&self, request: MediaRequest) -> Result<LocalMedia, AcquisitionError> {
        let delay = {
            let mut state = lock(&self.state);
            state.acquisitions += 1;
            state.acquire_delay
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let mut state = lock(&self.state);
        if let Some(reason) = state.failures.pop_front() {
            return Err(AcquisitionError::new(reason, "simulated failure"));
        }
        if request.video && state.deny_camera {
            return Err(AcquisitionError::new(
                AcquisitionFailure::PermissionDenied,
                "camera access denied",
            ));
        }
        Ok(LocalMedia {
            audio: request.audio.then(|| state.track(TrackKind::Audio, "sim microphone")),
            camera: request.video.then(|| state.track(TrackKind::Camera, "sim camera")),
        })
    }

    async fn acquire_display(&self) -> Result<MediaTrack, AcquisitionError> {
        let delay = lock(&self.state).display_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let mut state = lock(&self.state);
        if state.deny_display {
            return Err(AcquisitionError::new(
                AcquisitionFailure::PermissionDenied,
                "screen capture denied",
            ));
        }
        Ok(state.track(TrackKind::Screen, "sim display"))
    }

    fn set_enabled(&self, _track: &MediaTrack, _enabled: bool) {
        lock(&self.state).toggles += 1;
    }

    fn stop(&self, track: &MediaTrack) {
        let mut state = lock(&self.state);
        state.live.retain(|id| *id != track.id);
        state.stopped.push(track.id);
    }
}

/// Everything the simulated peer connections of one factory were asked
/// to do.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeerLog {
    pub connections: u32,
    pub offers: Vec<String>,
    pub answers: Vec<String>,
    pub rollbacks: u32,
    pub ice_restarts: u32,
    pub applied_candidates: Vec<String>,
    /// Outgoing video track after each replacement.
    pub video_tracks: Vec<Option<TrackId>>,
    pub closes: u32,
}

pub struct SimPeerFactory {
    name: String,
    candidates: usize,
    log: Arc<Mutex<PeerLog>>,
    latest: Mutex<Option<mpsc::UnboundedSender<PeerEvent>>>,
}

impl SimPeerFactory {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_candidates(name, 2)
    }

    /// `candidates` local candidates are gathered per ICE generation.
    pub fn with_candidates(name: impl Into<String>, candidates: usize) -> Self {
        Self {
            name: name.into(),
            candidates,
            log: Arc::new(Mutex::new(PeerLog::default())),
            latest: Mutex::new(None),
        }
    }

    pub fn log(&self) -> PeerLog {
        lock(&self.log).clone()
    }

    /// Report transport loss on the most recent connection.
    pub fn lose_transport(&self) -> bool {
        lock(&self.latest)
            .as_ref()
            .is_some_and(|tx| tx.send(PeerEvent::TransportLost).is_ok())
    }
}

impl PeerConnectionFactory for SimPeerFactory {
    fn create(&self, events: mpsc::UnboundedSender<PeerEvent>) -> Result<Box<dyn PeerConnection>> {
        lock(&self.log).connections += 1;
        *lock(&self.latest) = Some(events.clone());
        Ok(Box::new(SimPeerConnection {
            name: self.name.clone(),
            candidates: self.candidates,
            log: Arc::clone(&self.log),
            events,
            version: 0,
            ice_generation: 0,
            gathered: None,
            local_offer: false,
            remote_offer: false,
            has_remote: false,
            video: None,
            closed: false,
        }))
    }
}

/// A peer connection producing synthetic SDP.
///
/// Enforces the ordering rules of a real one: answers need a pending
/// remote offer, remote answers need a local offer, candidates need a
/// remote description.
pub struct SimPeerConnection {
    name: String,
    candidates: usize,
    log: Arc<Mutex<PeerLog>>,
    events: mpsc::UnboundedSender<PeerEvent>,
    version: u64,
    ice_generation: u32,
    gathered: Option<u32>,
    local_offer: bool,
    remote_offer: bool,
    has_remote: bool,
    video: Option<TrackId>,
    closed: bool,
}

impl SimPeerConnection {
    fn describe(&mut self, kind: &str) -> String {
        self.version += 1;
        let video = self.video.map_or_else(|| "none".to_string(), |id| id.to_string());
        format!(
            "v=0\r\no={} {} 2 IN IP4 127.0.0.1\r\ns={}\r\na=ice-gen:{}\r\nm=video track:{}\r\n",
            self.name, self.version, kind, self.ice_generation, video
        )
    }

    fn gather(&mut self) {
        if self.gathered == Some(self.ice_generation) {
            return;
        }
        self.gathered = Some(self.ice_generation);
        for n in 0..self.candidates {
            let candidate = IceCandidate {
                candidate: format!(
                    "candidate:{}{} 1 udp 2122260223 192.0.2.{} {} typ host",
                    self.ice_generation,
                    n,
                    n + 1,
                    50_000 + n
                ),
                sdp_mid: Some("0".into()),
                sdp_m_line_index: Some(0),
            };
            let _ = self.events.send(PeerEvent::LocalCandidate(candidate));
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            bail!("peer connection closed");
        }
        Ok(())
    }
}

#[async_trait]
impl PeerConnection for SimPeerConnection {
    async fn attach_tracks(&mut self, tracks: &MediaTrackSet) -> Result<()> {
        self.ensure_open()?;
        self.video = tracks.outgoing_video().map(|t| t.id);
        Ok(())
    }

    async fn replace_video_track(&mut self, track: Option<&MediaTrack>) -> Result<()> {
        self.ensure_open()?;
        self.video = track.map(|t| t.id);
        lock(&self.log).video_tracks.push(self.video);
        Ok(())
    }

    async fn create_offer(&mut self, options: OfferOptions) -> Result<String> {
        self.ensure_open()?;
        if self.remote_offer {
            bail!("cannot offer with a remote offer pending");
        }
        if options.ice_restart {
            self.ice_generation += 1;
            lock(&self.log).ice_restarts += 1;
        }
        let sdp = self.describe("offer");
        self.local_offer = true;
        lock(&self.log).offers.push(sdp.clone());
        self.gather();
        Ok(sdp)
    }

    async fn create_answer(&mut self) -> Result<String> {
        self.ensure_open()?;
        if !self.remote_offer {
            bail!("no remote offer to answer");
        }
        let sdp = self.describe("answer");
        self.remote_offer = false;
        lock(&self.log).answers.push(sdp.clone());
        self.gather();
        Ok(sdp)
    }

    async fn set_remote_description(&mut self, description: &SessionDescription) -> Result<()> {
        self.ensure_open()?;
        if !description.sdp.starts_with("v=0") {
            bail!("malformed session description");
        }
        match description.kind {
            SdpKind::Offer => {
                if self.local_offer {
                    bail!("remote offer while a local offer is outstanding");
                }
                self.remote_offer = true;
            }
            SdpKind::Answer => {
                if !self.local_offer {
                    bail!("answer without a local offer");
                }
                self.local_offer = false;
            }
        }
        self.has_remote = true;
        Ok(())
    }

    async fn rollback(&mut self) -> Result<()> {
        if !self.local_offer {
            bail!("no local offer to roll back");
        }
        self.local_offer = false;
        lock(&self.log).rollbacks += 1;
        Ok(())
    }

    async fn add_ice_candidate(&mut self, candidate: &IceCandidate) -> Result<()> {
        self.ensure_open()?;
        if !self.has_remote {
            bail!("remote description not set");
        }
        if !candidate.candidate.starts_with("candidate:") {
            bail!("malformed candidate {:?}", candidate.candidate);
        }
        lock(&self.log)
            .applied_candidates
            .push(candidate.candidate.clone());
        Ok(())
    }

    async fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            lock(&self.log).closes += 1;
            debug!(peer = %self.name, "sim peer connection closed");
        }
    }
}

/// Archive keeping everything in memory.
#[derive(Default)]
pub struct MemoryArchive {
    calls: Mutex<Vec<CallRecord>>,
    chats: Mutex<Vec<ChatMessage>>,
    offline: bool,
}

impl MemoryArchive {
    pub fn new() -> Self {
        Self::default()
    }

    /// An archive whose every write fails.
    pub fn failing() -> Self {
        Self {
            offline: true,
            ..Self::default()
        }
    }

    pub fn calls(&self) -> Vec<CallRecord> {
        lock(&self.calls).clone()
    }

    pub fn chats(&self) -> Vec<ChatMessage> {
        lock(&self.chats).clone()
    }
}

#[async_trait]
impl SessionArchive for MemoryArchive {
    async fn store_call(&self, record: CallRecord) -> Result<()> {
        if self.offline {
            bail!("archive offline");
        }
        lock(&self.calls).push(record);
        Ok(())
    }

    async fn store_chat(&self, message: ChatMessage) -> Result<()> {
        if self.offline {
            bail!("archive offline");
        }
        lock(&self.chats).push(message);
        Ok(())
    }
}
