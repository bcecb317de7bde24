//! Local capture devices and the outgoing track set.
//!
//! `MediaController` is the only owner of local tracks for the lifetime of
//! a call. Everything else sees them through `&MediaTrackSet`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::{AcquisitionError, CallError};
use crate::hangup::HangupSignal;

pub type TrackId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackKind {
    Audio,
    Camera,
    Screen,
}

/// Handle to a platform capture track.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaTrack {
    pub id: TrackId,
    pub kind: TrackKind,
    pub label: String,
    pub enabled: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaRequest {
    pub video: bool,
    pub audio: bool,
}

impl MediaRequest {
    pub const fn audio_video() -> Self {
        Self {
            video: true,
            audio: true,
        }
    }

    pub const fn audio_only() -> Self {
        Self {
            video: false,
            audio: true,
        }
    }
}

impl Default for MediaRequest {
    fn default() -> Self {
        Self::audio_video()
    }
}

/// What the platform hands back from a capture request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LocalMedia {
    pub audio: Option<MediaTrack>,
    pub camera: Option<MediaTrack>,
}

impl LocalMedia {
    fn into_tracks(self) -> impl Iterator<Item = MediaTrack> {
        self.audio.into_iter().chain(self.camera)
    }
}

/// Capture device access provided by the platform media stack.
#[async_trait]
pub trait MediaPlatform: Send + Sync + 'static {
    async fn acquire(&self, request: MediaRequest) -> Result<LocalMedia, AcquisitionError>;

    async fn acquire_display(&self) -> Result<MediaTrack, AcquisitionError>;

    fn set_enabled(&self, track: &MediaTrack, enabled: bool);

    /// Release the device behind `track`.
    fn stop(&self, track: &MediaTrack);
}

/// Local tracks of a call. At most one video track is outgoing at a
/// time: the screen while sharing, the camera otherwise.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MediaTrackSet {
    pub audio: Option<MediaTrack>,
    pub camera: Option<MediaTrack>,
    pub screen: Option<MediaTrack>,
}

impl MediaTrackSet {
    pub fn outgoing_video(&self) -> Option<&MediaTrack> {
        self.screen.as_ref().or(self.camera.as_ref())
    }

    pub fn is_sharing_screen(&self) -> bool {
        self.screen.is_some()
    }

    /// Whether the outgoing video track is live. While sharing this is
    /// the screen, not the camera.
    pub fn video_enabled(&self) -> bool {
        self.outgoing_video().is_some_and(|t| t.enabled)
    }

    pub fn audio_enabled(&self) -> bool {
        self.audio.as_ref().is_some_and(|t| t.enabled)
    }

    pub fn is_empty(&self) -> bool {
        self.audio.is_none() && self.camera.is_none() && self.screen.is_none()
    }
}

/// Notifications from the controller to the session loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaEvent {
    /// The outgoing video track identity changed; a new offer is needed.
    RenegotiationRequired,
    /// The display picker started by
    /// [`begin_screen_share`](MediaController::begin_screen_share) resolved.
    /// Hand it to [`finish_screen_share`](MediaController::finish_screen_share).
    DisplayReady(Result<MediaTrack, AcquisitionError>),
}

pub struct MediaController {
    platform: Arc<dyn MediaPlatform>,
    tracks: MediaTrackSet,
    events: mpsc::UnboundedSender<MediaEvent>,
    display_pending: bool,
    released: bool,
}

impl MediaController {
    pub fn new(platform: Arc<dyn MediaPlatform>, events: mpsc::UnboundedSender<MediaEvent>) -> Self {
        Self {
            platform,
            tracks: MediaTrackSet::default(),
            events,
            display_pending: false,
            released: false,
        }
    }

    pub fn tracks(&self) -> &MediaTrackSet {
        &self.tracks
    }

    /// Acquire camera and/or microphone.
    ///
    /// A busy device is retried up to `retries` times. If `hangup` fires
    /// while the platform is still prompting, this returns `Cancelled`
    /// and whatever the platform eventually hands back is released.
    pub async fn acquire_local_media(
        &mut self,
        request: MediaRequest,
        retries: u32,
        retry_delay: Duration,
        hangup: &mut HangupSignal,
    ) -> Result<&MediaTrackSet, CallError> {
        if self.released {
            return Err(CallError::Cancelled);
        }
        let mut attempt = 0;
        loop {
            match self.acquire_once(request, hangup).await? {
                Ok(media) => {
                    self.tracks.audio = media.audio;
                    self.tracks.camera = media.camera;
                    info!(
                        audio = self.tracks.audio.is_some(),
                        video = self.tracks.camera.is_some(),
                        "local media acquired"
                    );
                    return Ok(&self.tracks);
                }
                Err(err) if err.is_transient() && attempt < retries => {
                    attempt += 1;
                    warn!(attempt, "capture device busy, retrying in {:?}", retry_delay);
                    tokio::select! {
                        _ = tokio::time::sleep(retry_delay) => {}
                        _ = hangup.raised() => return Err(CallError::Cancelled),
                    }
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    async fn acquire_once(
        &self,
        request: MediaRequest,
        hangup: &mut HangupSignal,
    ) -> Result<Result<LocalMedia, AcquisitionError>, CallError> {
        let platform = Arc::clone(&self.platform);
        let mut pending = tokio::spawn(async move { platform.acquire(request).await });

        let finished = tokio::select! {
            res = &mut pending => Some(res),
            _ = hangup.raised() => None,
        };

        match finished {
            Some(Ok(result)) => Ok(result),
            Some(Err(join_err)) => Err(CallError::negotiation(format!(
                "media acquisition task failed: {join_err}"
            ))),
            None => {
                // The permission prompt cannot be withdrawn; release the
                // devices as soon as the platform hands them over.
                let platform = Arc::clone(&self.platform);
                tokio::spawn(async move {
                    if let Ok(Ok(media)) = pending.await {
                        for track in media.into_tracks() {
                            platform.stop(&track);
                        }
                        debug!("released media acquired after disconnect");
                    }
                });
                Err(CallError::Cancelled)
            }
        }
    }

    /// Flip the outgoing video track: the screen while sharing, the
    /// camera otherwise. Never renegotiates.
    pub fn set_video_enabled(&mut self, enabled: bool) -> bool {
        let outgoing = match self.tracks.screen.as_mut() {
            Some(screen) => Some(screen),
            None => self.tracks.camera.as_mut(),
        };
        match outgoing {
            Some(track) => {
                self.platform.set_enabled(track, enabled);
                track.enabled = enabled;
                enabled
            }
            None => false,
        }
    }

    /// Flip the microphone track. Never renegotiates.
    pub fn set_audio_enabled(&mut self, enabled: bool) -> bool {
        match self.tracks.audio.as_mut() {
            Some(track) => {
                self.platform.set_enabled(track, enabled);
                track.enabled = enabled;
                enabled
            }
            None => false,
        }
    }

    /// Open the display picker in the background.
    ///
    /// Returns `Ok(false)` if already sharing or a picker is already open.
    /// The outcome arrives later as [`MediaEvent::DisplayReady`]. If the
    /// event receiver is gone by then, the track is stopped on the spot.
    pub fn begin_screen_share(&mut self) -> Result<bool, CallError> {
        if self.released {
            return Err(CallError::NotConnected);
        }
        if self.tracks.screen.is_some() || self.display_pending {
            return Ok(false);
        }
        self.display_pending = true;
        let platform = Arc::clone(&self.platform);
        let events = self.events.clone();
        tokio::spawn(async move {
            let result = platform.acquire_display().await;
            if let Err(mpsc::error::SendError(MediaEvent::DisplayReady(Ok(track)))) =
                events.send(MediaEvent::DisplayReady(result))
            {
                platform.stop(&track);
                debug!(track = track.id, "released display capture after teardown");
            }
        });
        debug!("display picker opened");
        Ok(true)
    }

    /// Install the display capture delivered by `DisplayReady`.
    ///
    /// A track that arrives after [`stop_screen_share`](Self::stop_screen_share)
    /// or [`release_all`](Self::release_all) is stopped and reported as
    /// `Cancelled`.
    pub fn finish_screen_share(
        &mut self,
        result: Result<MediaTrack, AcquisitionError>,
    ) -> Result<(), CallError> {
        let wanted = std::mem::take(&mut self.display_pending) && !self.released;
        let screen = result?;
        if !wanted {
            self.platform.stop(&screen);
            debug!(track = screen.id, "display capture no longer wanted");
            return Err(CallError::Cancelled);
        }
        info!(track = screen.id, "screen share started");
        self.tracks.screen = Some(screen);
        let _ = self.events.send(MediaEvent::RenegotiationRequired);
        Ok(())
    }

    /// Stop the display capture and fall back to the camera. Also
    /// abandons an open picker.
    pub fn stop_screen_share(&mut self) -> bool {
        self.display_pending = false;
        let Some(screen) = self.tracks.screen.take() else {
            return false;
        };
        self.platform.stop(&screen);
        info!(track = screen.id, "screen share stopped");
        let _ = self.events.send(MediaEvent::RenegotiationRequired);
        true
    }

    /// Stop every local track. Safe to call more than once; only the
    /// first call reaches the platform.
    pub fn release_all(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        let tracks = std::mem::take(&mut self.tracks);
        for track in [tracks.audio, tracks.camera, tracks.screen].into_iter().flatten() {
            self.platform.stop(&track);
        }
        debug!("local media released");
    }
}

impl Drop for MediaController {
    fn drop(&mut self) {
        self.release_all();
    }
}
