//! The per-call event loop and its public handle.
//!
//! One task owns all call state. Caller commands, filtered signaling,
//! platform callbacks, media events and timers are all consumed by that
//! task in turn, so negotiation state only ever has one writer.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use duet_common::{Participant, ParticipantRole, SessionId};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::archive::{hand_off_call, CallOutcome, CallRecord, SessionArchive};
use crate::backoff::Backoff;
use crate::config::CallConfig;
use crate::error::CallError;
use crate::hangup::HangupSignal;
use crate::media::{MediaController, MediaEvent, MediaPlatform, MediaRequest};
use crate::negotiator::{NegotiationState, Progress, SessionNegotiator};
use crate::peer::{PeerConnectionFactory, PeerEvent};
use crate::relay::Relay;
use crate::signaling::{ChannelEvent, SignalingChannel};
use crate::status::{CallState, ConnectionStatus};

/// Who we are, as supplied by the identity provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalIdentity {
    pub id: String,
    pub display_name: String,
}

impl LocalIdentity {
    pub fn new(id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
        }
    }
}

/// External collaborators of a call.
#[derive(Clone)]
pub struct CallDeps {
    pub relay: Arc<dyn Relay>,
    pub media: Arc<dyn MediaPlatform>,
    pub peers: Arc<dyn PeerConnectionFactory>,
    pub archive: Option<Arc<dyn SessionArchive>>,
}

impl CallDeps {
    pub fn new(
        relay: Arc<dyn Relay>,
        media: Arc<dyn MediaPlatform>,
        peers: Arc<dyn PeerConnectionFactory>,
    ) -> Self {
        Self {
            relay,
            media,
            peers,
            archive: None,
        }
    }

    pub fn with_archive(mut self, archive: Arc<dyn SessionArchive>) -> Self {
        self.archive = Some(archive);
        self
    }
}

enum Command {
    Connect {
        session: SessionId,
        role: ParticipantRole,
        media: MediaRequest,
        hangup: HangupSignal,
        reply: oneshot::Sender<Result<(), CallError>>,
    },
    ToggleVideo(oneshot::Sender<Result<bool, CallError>>),
    ToggleAudio(oneshot::Sender<Result<bool, CallError>>),
    ShareScreen(oneshot::Sender<Result<(), CallError>>),
    StopShare(oneshot::Sender<Result<(), CallError>>),
    Disconnect(oneshot::Sender<()>),
}

/// Handle to one call endpoint.
///
/// Must be created inside a tokio runtime. Dropping the handle hangs up
/// an active call the same way [`disconnect`](Self::disconnect) does.
pub struct ConnectionStateMachine {
    commands: mpsc::Sender<Command>,
    status: watch::Receiver<ConnectionStatus>,
    hangup: watch::Sender<u64>,
}

impl ConnectionStateMachine {
    pub fn new(identity: LocalIdentity, deps: CallDeps, config: CallConfig) -> Self {
        let (commands_tx, commands_rx) = mpsc::channel(config.event_queue.max(1));
        let (status_tx, status_rx) = watch::channel(ConnectionStatus::default());
        let (hangup, _) = watch::channel(0u64);

        let actor = CallActor {
            identity,
            deps,
            config,
            status: status_tx,
            commands: commands_rx,
            call: None,
        };
        tokio::spawn(actor.run());

        Self {
            commands: commands_tx,
            status: status_rx,
            hangup,
        }
    }

    async fn request<T>(&self, command: impl FnOnce(oneshot::Sender<T>) -> Command) -> Option<T> {
        let (tx, rx) = oneshot::channel();
        self.commands.send(command(tx)).await.ok()?;
        rx.await.ok()
    }

    /// Start a call. Resolves once local media is acquired and the first
    /// offer is out (or queued for retry); watch [`subscribe`](Self::subscribe)
    /// for the rest.
    ///
    /// On `Acquisition` errors the handle is back in `Idle` and may be
    /// retried, typically with [`MediaRequest::audio_only`].
    pub async fn connect(
        &self,
        session: SessionId,
        role: ParticipantRole,
        media: MediaRequest,
    ) -> Result<(), CallError> {
        let hangup = HangupSignal::new(self.hangup.subscribe());
        self.request(|reply| Command::Connect {
            session,
            role,
            media,
            hangup,
            reply,
        })
        .await
        .unwrap_or(Err(CallError::Cancelled))
    }

    /// Flip the outgoing video track (the screen while sharing, the camera
    /// otherwise). Returns the new enabled flag.
    pub async fn toggle_video(&self) -> Result<bool, CallError> {
        self.request(Command::ToggleVideo)
            .await
            .unwrap_or(Err(CallError::NotConnected))
    }

    /// Flip the microphone. Returns the new enabled flag.
    pub async fn toggle_audio(&self) -> Result<bool, CallError> {
        self.request(Command::ToggleAudio)
            .await
            .unwrap_or(Err(CallError::NotConnected))
    }

    /// Replace the outgoing video with a display capture. Resolves once
    /// the platform picker closes; the call keeps running meanwhile, and
    /// [`disconnect`](Self::disconnect) resolves this with `Cancelled`.
    pub async fn share_screen(&self) -> Result<(), CallError> {
        self.request(Command::ShareScreen)
            .await
            .unwrap_or(Err(CallError::NotConnected))
    }

    pub async fn stop_share(&self) -> Result<(), CallError> {
        self.request(Command::StopShare)
            .await
            .unwrap_or(Err(CallError::NotConnected))
    }

    /// Hang up and wait for teardown. Extra calls do nothing.
    pub async fn disconnect(&self) {
        // Interrupts a connect() that is still waiting on the devices.
        self.hangup.send_modify(|generation| *generation += 1);
        let _ = self.request(Command::Disconnect).await;
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.clone()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Ending {
    LocalHangup,
    RemoteBye,
    Failed(CallError),
}

enum Flow {
    Continue,
    End(Ending),
}

#[derive(Debug, Clone, Copy, Default)]
struct Timers {
    /// Republish the outstanding local offer.
    retransmit: Option<Instant>,
    connect_deadline: Option<Instant>,
    /// Next reconnection attempt.
    reconnect: Option<Instant>,
    /// Give up on the current reconnection offer.
    restart_deadline: Option<Instant>,
}

enum CallEvent {
    Hangup,
    Channel(ChannelEvent),
    Peer(PeerEvent),
    Media(MediaEvent),
    Retransmit,
    ConnectDeadline,
    ReconnectDue,
    RestartUnanswered,
}

struct ActiveCall {
    session: SessionId,
    local: Participant,
    negotiator: SessionNegotiator,
    media: MediaController,
    channel_tx: mpsc::Sender<ChannelEvent>,
    channel_rx: mpsc::Receiver<ChannelEvent>,
    peer_rx: mpsc::UnboundedReceiver<PeerEvent>,
    media_rx: mpsc::UnboundedReceiver<MediaEvent>,
    hangup: HangupSignal,
    timers: Timers,
    /// Resends of the outstanding offer.
    retransmits: u32,
    reconnect: Option<Backoff>,
    /// Caller of `share_screen` waiting on the display picker.
    share_reply: Option<oneshot::Sender<Result<(), CallError>>>,
    started_at: DateTime<Utc>,
    connected_at: Option<DateTime<Utc>>,
}

async fn deadline(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

impl ActiveCall {
    async fn next_event(&mut self) -> CallEvent {
        let timers = self.timers;
        tokio::select! {
            biased;
            _ = self.hangup.raised() => CallEvent::Hangup,
            Some(event) = self.channel_rx.recv() => CallEvent::Channel(event),
            Some(event) = self.peer_rx.recv() => CallEvent::Peer(event),
            Some(event) = self.media_rx.recv() => CallEvent::Media(event),
            _ = deadline(timers.connect_deadline) => CallEvent::ConnectDeadline,
            _ = deadline(timers.retransmit) => CallEvent::Retransmit,
            _ = deadline(timers.reconnect) => CallEvent::ReconnectDue,
            _ = deadline(timers.restart_deadline) => CallEvent::RestartUnanswered,
        }
    }

    fn is_recovering(&self) -> bool {
        self.reconnect.is_some()
    }
}

struct CallActor {
    identity: LocalIdentity,
    deps: CallDeps,
    config: CallConfig,
    status: watch::Sender<ConnectionStatus>,
    commands: mpsc::Receiver<Command>,
    call: Option<ActiveCall>,
}

enum Input {
    Command(Option<Command>),
    Call(CallEvent),
}

impl CallActor {
    async fn run(mut self) {
        loop {
            let input = match self.call.as_mut() {
                Some(call) => tokio::select! {
                    event = call.next_event() => Input::Call(event),
                    command = self.commands.recv() => Input::Command(command),
                },
                None => Input::Command(self.commands.recv().await),
            };

            match input {
                Input::Command(Some(command)) => self.handle_command(command).await,
                Input::Command(None) => {
                    if let Some(call) = self.call.take() {
                        self.teardown(call, Ending::LocalHangup).await;
                    }
                    break;
                }
                Input::Call(event) => {
                    let Some(mut call) = self.call.take() else {
                        continue;
                    };
                    match self.on_event(&mut call, event).await {
                        Flow::Continue => {
                            self.watch_offer(&mut call);
                            self.call = Some(call);
                        }
                        Flow::End(ending) => self.teardown(call, ending).await,
                    }
                }
            }
        }
        debug!(peer = %self.identity.id, "call task stopped");
    }

    fn set_status(&self, call: &ActiveCall, state: CallState) {
        let tracks = call.media.tracks();
        let next = ConnectionStatus {
            state,
            video_enabled: tracks.video_enabled(),
            audio_enabled: tracks.audio_enabled(),
            sharing_screen: tracks.is_sharing_screen(),
            error: None,
        };
        self.status.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            if current.state != next.state {
                info!(session = %call.session, peer = %call.local.id, "call {} -> {}", current.state, next.state);
            }
            *current = next;
            true
        });
    }

    /// Republish the media flags under the current state.
    fn refresh(&self, call: &ActiveCall) {
        let state = self.status.borrow().state;
        self.set_status(call, state);
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect {
                session,
                role,
                media,
                hangup,
                reply,
            } => {
                let result = self.connect(session, role, media, hangup).await;
                let _ = reply.send(result);
            }
            Command::ToggleVideo(reply) => {
                let result = match self.call.as_mut() {
                    Some(call) => {
                        let enabled = !call.media.tracks().video_enabled();
                        Ok(call.media.set_video_enabled(enabled))
                    }
                    None => Err(CallError::NotConnected),
                };
                if let Some(call) = self.call.as_ref() {
                    self.refresh(call);
                }
                let _ = reply.send(result);
            }
            Command::ToggleAudio(reply) => {
                let result = match self.call.as_mut() {
                    Some(call) => {
                        let enabled = !call.media.tracks().audio_enabled();
                        Ok(call.media.set_audio_enabled(enabled))
                    }
                    None => Err(CallError::NotConnected),
                };
                if let Some(call) = self.call.as_ref() {
                    self.refresh(call);
                }
                let _ = reply.send(result);
            }
            Command::ShareScreen(reply) => {
                let Some(call) = self.call.as_mut() else {
                    let _ = reply.send(Err(CallError::NotConnected));
                    return;
                };
                // The picker answers later as MediaEvent::DisplayReady.
                match call.media.begin_screen_share() {
                    Ok(true) => call.share_reply = Some(reply),
                    Ok(false) => {
                        let _ = reply.send(Ok(()));
                    }
                    Err(err) => {
                        let _ = reply.send(Err(err));
                    }
                }
            }
            Command::StopShare(reply) => {
                let result = match self.call.as_mut() {
                    Some(call) => {
                        call.media.stop_screen_share();
                        if let Some(waiting) = call.share_reply.take() {
                            let _ = waiting.send(Err(CallError::Cancelled));
                        }
                        Ok(())
                    }
                    None => Err(CallError::NotConnected),
                };
                if let Some(call) = self.call.as_ref() {
                    self.refresh(call);
                }
                let _ = reply.send(result);
            }
            Command::Disconnect(reply) => {
                if let Some(call) = self.call.take() {
                    self.teardown(call, Ending::LocalHangup).await;
                }
                let _ = reply.send(());
            }
        }
    }

    async fn connect(
        &mut self,
        session: SessionId,
        role: ParticipantRole,
        request: MediaRequest,
        hangup: HangupSignal,
    ) -> Result<(), CallError> {
        if self.call.is_some() {
            return Err(CallError::AlreadyActive);
        }

        let local = Participant::new(
            self.identity.id.clone(),
            self.identity.display_name.clone(),
            role,
        );
        let (peer_tx, peer_rx) = mpsc::unbounded_channel();
        let peer = match self.deps.peers.create(peer_tx) {
            Ok(peer) => peer,
            Err(err) => {
                let err = CallError::negotiation(format!("peer connection unavailable: {err:#}"));
                error!(%session, "call failed: {}", err);
                self.status.send_replace(ConnectionStatus {
                    state: CallState::Failed,
                    error: Some(err.clone()),
                    ..Default::default()
                });
                return Err(err);
            }
        };

        let signaling =
            SignalingChannel::new(Arc::clone(&self.deps.relay), session.clone(), local.clone());
        let (media_tx, media_rx) = mpsc::unbounded_channel();
        let (channel_tx, channel_rx) = mpsc::channel(self.config.event_queue.max(1));
        let mut call = ActiveCall {
            session: session.clone(),
            local: local.clone(),
            negotiator: SessionNegotiator::new(local, signaling, peer),
            media: MediaController::new(Arc::clone(&self.deps.media), media_tx),
            channel_tx,
            channel_rx,
            peer_rx,
            media_rx,
            hangup,
            timers: Timers::default(),
            retransmits: 0,
            reconnect: None,
            share_reply: None,
            started_at: Utc::now(),
            connected_at: None,
        };
        self.set_status(&call, CallState::Connecting);
        info!(%session, peer = %call.local.id, ?role, "connecting");

        // Subscribe first so offers arriving while the devices are being
        // opened are queued rather than lost.
        let subscribed = match call
            .negotiator
            .signaling_mut()
            .subscribe(call.channel_tx.clone())
            .await
        {
            Ok(_) => true,
            Err(err) => {
                warn!(%session, "signaling unavailable, will retry: {}", err);
                if let Flow::End(ending) = self.schedule_reconnect(&mut call) {
                    self.teardown(call, ending).await;
                    return Err(CallError::ChannelLost);
                }
                false
            }
        };

        let acquired = call
            .media
            .acquire_local_media(
                request,
                self.config.acquire_retries,
                self.config.acquire_retry_delay,
                &mut call.hangup,
            )
            .await
            .map(|_| ());
        match acquired {
            Ok(()) => {}
            Err(err @ CallError::Acquisition(_)) => {
                warn!(%session, "{}", err);
                call.negotiator.close().await;
                call.media.release_all();
                self.status.send_replace(ConnectionStatus {
                    state: CallState::Idle,
                    error: Some(err.clone()),
                    ..Default::default()
                });
                return Err(err);
            }
            Err(err) => {
                let ending = if err == CallError::Cancelled {
                    Ending::LocalHangup
                } else {
                    Ending::Failed(err.clone())
                };
                self.teardown(call, ending).await;
                return Err(err);
            }
        }
        self.set_status(&call, CallState::Connecting);

        if let Err(err) = call.negotiator.attach_tracks(call.media.tracks()).await {
            self.teardown(call, Ending::Failed(err.clone())).await;
            return Err(err);
        }

        call.timers.connect_deadline = Some(Instant::now() + self.config.connect_timeout);
        if subscribed {
            match call.negotiator.start_offer().await {
                Ok(()) => {}
                Err(CallError::ChannelLost) => {
                    if let Flow::End(ending) = self.on_lost(&mut call, "offer not delivered") {
                        self.teardown(call, ending).await;
                        return Err(CallError::ChannelLost);
                    }
                }
                Err(err) => {
                    self.teardown(call, Ending::Failed(err.clone())).await;
                    return Err(err);
                }
            }
        }

        self.watch_offer(&mut call);
        self.call = Some(call);
        Ok(())
    }

    async fn on_event(&mut self, call: &mut ActiveCall, event: CallEvent) -> Flow {
        match event {
            CallEvent::Hangup => Flow::End(Ending::LocalHangup),
            CallEvent::Channel(ChannelEvent::Lost) => {
                call.negotiator.signaling_mut().mark_lost();
                self.on_lost(call, "signaling channel lost")
            }
            CallEvent::Channel(ChannelEvent::Message { from, seq, message }) => {
                debug!(session = %call.session, from = %from.id, seq, "received {}", message.kind());
                match call.negotiator.handle_remote(from, message).await {
                    Ok(Progress::Unchanged) => Flow::Continue,
                    Ok(Progress::Stable) => {
                        self.on_stable(call);
                        Flow::Continue
                    }
                    Ok(Progress::RemoteBye) => Flow::End(Ending::RemoteBye),
                    Err(err) => self.on_error(call, err),
                }
            }
            CallEvent::Peer(PeerEvent::LocalCandidate(candidate)) => {
                match call.negotiator.publish_local_candidate(candidate).await {
                    Ok(_) => Flow::Continue,
                    Err(err) => self.on_error(call, err),
                }
            }
            CallEvent::Peer(PeerEvent::TransportLost) => self.on_lost(call, "media transport lost"),
            CallEvent::Media(MediaEvent::RenegotiationRequired) => {
                match call.negotiator.request_renegotiation(call.media.tracks()).await {
                    Ok(_) => Flow::Continue,
                    Err(err) => self.on_error(call, err),
                }
            }
            CallEvent::Media(MediaEvent::DisplayReady(result)) => {
                let shared = call.media.finish_screen_share(result);
                if let Err(err) = &shared {
                    warn!(session = %call.session, "screen share refused: {}", err);
                }
                self.refresh(call);
                if let Some(reply) = call.share_reply.take() {
                    let _ = reply.send(shared);
                }
                Flow::Continue
            }
            CallEvent::Retransmit => {
                call.timers.retransmit = None;
                if call.connected_at.is_some() && call.retransmits >= self.config.offer_retries {
                    // The peer or the relay is gone; recover with a restart.
                    return self.on_lost(call, "offer unanswered");
                }
                match call.negotiator.retransmit_offer().await {
                    Ok(true) => {
                        call.retransmits += 1;
                        debug!(session = %call.session, attempt = call.retransmits, "offer unanswered, sent again");
                        call.timers.retransmit = Some(Instant::now() + self.config.offer_timeout);
                        Flow::Continue
                    }
                    Ok(false) => Flow::Continue,
                    Err(err) => self.on_error(call, err),
                }
            }
            CallEvent::ConnectDeadline => Flow::End(Ending::Failed(CallError::timeout(format!(
                "not connected after {:?}",
                self.config.connect_timeout
            )))),
            CallEvent::ReconnectDue => self.attempt_reconnect(call).await,
            CallEvent::RestartUnanswered => {
                warn!(session = %call.session, "reconnection offer unanswered");
                self.schedule_reconnect(call)
            }
        }
    }

    /// Arm the retransmit timer while a local offer is outstanding.
    /// Recovery offers are covered by `restart_deadline` instead.
    fn watch_offer(&self, call: &mut ActiveCall) {
        if call.negotiator.state() != NegotiationState::HaveLocalOffer || call.is_recovering() {
            call.timers.retransmit = None;
        } else if call.timers.retransmit.is_none() {
            call.retransmits = 0;
            call.timers.retransmit = Some(Instant::now() + self.config.offer_timeout);
        }
    }

    fn on_error(&mut self, call: &mut ActiveCall, err: CallError) -> Flow {
        if err.is_retryable() {
            self.on_lost(call, "publish failed")
        } else {
            Flow::End(Ending::Failed(err))
        }
    }

    fn on_stable(&mut self, call: &mut ActiveCall) {
        call.timers = Timers::default();
        if call.reconnect.take().is_some() {
            info!(session = %call.session, "connection recovered");
        }
        if call.connected_at.is_none() {
            call.connected_at = Some(Utc::now());
        }
        self.set_status(call, CallState::Connected);
    }

    fn on_lost(&mut self, call: &mut ActiveCall, reason: &str) -> Flow {
        call.timers.retransmit = None;
        if call.timers.reconnect.is_some() {
            // Already waiting for the next attempt.
            return Flow::Continue;
        }
        if !call.is_recovering() {
            warn!(session = %call.session, "{}", reason);
            if self.status.borrow().state == CallState::Connected {
                self.set_status(call, CallState::Reconnecting);
            }
        }
        self.schedule_reconnect(call)
    }

    fn schedule_reconnect(&mut self, call: &mut ActiveCall) -> Flow {
        call.timers.restart_deadline = None;
        let backoff = call
            .reconnect
            .get_or_insert_with(|| self.config.reconnect_backoff());
        match backoff.next_delay() {
            Some(delay) => {
                info!(session = %call.session, attempt = backoff.attempts(), "reconnecting in {:?}", delay);
                call.timers.reconnect = Some(Instant::now() + delay);
                Flow::Continue
            }
            None => {
                error!(session = %call.session, "reconnection attempts exhausted");
                Flow::End(Ending::Failed(CallError::ChannelLost))
            }
        }
    }

    async fn attempt_reconnect(&mut self, call: &mut ActiveCall) -> Flow {
        call.timers.reconnect = None;
        if !call.negotiator.signaling().is_subscribed() {
            let handler = call.channel_tx.clone();
            if let Err(err) = call.negotiator.signaling_mut().subscribe(handler).await {
                debug!(session = %call.session, "resubscribe failed: {}", err);
                return self.schedule_reconnect(call);
            }
        }
        match call.negotiator.restart_offer().await {
            Ok(()) => {
                call.timers.restart_deadline = Some(Instant::now() + self.config.offer_timeout);
                Flow::Continue
            }
            Err(CallError::ChannelLost) => self.schedule_reconnect(call),
            Err(err) => Flow::End(Ending::Failed(err)),
        }
    }

    /// Release everything the call holds and publish the terminal status.
    async fn teardown(&mut self, mut call: ActiveCall, ending: Ending) {
        if ending != Ending::RemoteBye && call.negotiator.signaling().is_subscribed() {
            if let Err(err) = call.negotiator.send_bye().await {
                debug!(session = %call.session, "bye not delivered: {}", err);
            }
        }
        call.negotiator.close().await;
        call.media.release_all();
        // A display track still in flight is stopped by its sender once
        // the queue is closed; one already queued is stopped here.
        call.media_rx.close();
        while let Ok(event) = call.media_rx.try_recv() {
            if let MediaEvent::DisplayReady(result) = event {
                let _ = call.media.finish_screen_share(result);
            }
        }
        if let Some(reply) = call.share_reply.take() {
            let _ = reply.send(Err(CallError::Cancelled));
        }

        let (state, error, outcome) = match ending {
            Ending::LocalHangup => {
                info!(session = %call.session, "call ended locally");
                (CallState::Closed, None, CallOutcome::Completed)
            }
            Ending::RemoteBye => {
                info!(session = %call.session, "remote hung up");
                (CallState::Closed, None, CallOutcome::RemoteHangup)
            }
            Ending::Failed(err) => {
                error!(session = %call.session, "call failed: {}", err);
                let reason = err.to_string();
                (CallState::Failed, Some(err), CallOutcome::Failed { reason })
            }
        };
        self.status.send_if_modified(|current| {
            info!(session = %call.session, peer = %call.local.id, "call {} -> {}", current.state, state);
            *current = ConnectionStatus {
                state,
                error,
                ..Default::default()
            };
            true
        });

        hand_off_call(
            self.deps.archive.as_ref(),
            CallRecord {
                session: call.session.clone(),
                local: call.local.clone(),
                remote: call.negotiator.remote().cloned(),
                started_at: call.started_at,
                connected_at: call.connected_at,
                ended_at: Utc::now(),
                outcome,
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::error::AcquisitionFailure;
    use crate::relay::InMemoryRelay;
    use crate::sim::{MemoryArchive, SimMediaPlatform, SimPeerFactory};

    struct Endpoint {
        call: ConnectionStateMachine,
        media: Arc<SimMediaPlatform>,
        peers: Arc<SimPeerFactory>,
    }

    fn endpoint(relay: &InMemoryRelay, id: &str, archive: Option<Arc<MemoryArchive>>) -> Endpoint {
        let media = Arc::new(SimMediaPlatform::new());
        let peers = Arc::new(SimPeerFactory::new(id));
        let mut deps = CallDeps::new(Arc::new(relay.clone()), media.clone(), peers.clone());
        if let Some(archive) = archive {
            deps = deps.with_archive(archive);
        }
        Endpoint {
            call: ConnectionStateMachine::new(LocalIdentity::new(id, id), deps, CallConfig::default()),
            media,
            peers,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_commands_before_connect_are_rejected() {
        let relay = InMemoryRelay::new();
        let alice = endpoint(&relay, "alice", None);
        assert_eq!(alice.call.toggle_video().await, Err(CallError::NotConnected));
        assert_eq!(alice.call.share_screen().await, Err(CallError::NotConnected));
        alice.call.disconnect().await;
        assert_eq!(alice.call.status().state, CallState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_connect_is_already_active() {
        let relay = InMemoryRelay::new();
        let alice = endpoint(&relay, "alice", None);
        let session = SessionId::new("s1");
        alice
            .call
            .connect(session.clone(), ParticipantRole::Initiator, MediaRequest::default())
            .await
            .unwrap();
        assert_eq!(alice.call.status().state, CallState::Connecting);
        assert_eq!(
            alice
                .call
                .connect(session, ParticipantRole::Initiator, MediaRequest::default())
                .await,
            Err(CallError::AlreadyActive)
        );
        assert_eq!(alice.peers.log().connections, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unanswered_call_times_out() {
        let relay = InMemoryRelay::new();
        let archive = Arc::new(MemoryArchive::new());
        let alice = endpoint(&relay, "alice", Some(archive.clone()));
        let mut status = alice.call.subscribe();
        alice
            .call
            .connect(SessionId::new("s1"), ParticipantRole::Initiator, MediaRequest::default())
            .await
            .unwrap();

        let failed = status
            .wait_for(|s| s.state.is_terminal())
            .await
            .unwrap()
            .clone();
        assert_eq!(failed.state, CallState::Failed);
        assert!(matches!(failed.error, Some(CallError::Timeout(_))));
        // Retransmitted every offer timeout until the deadline.
        assert_eq!(alice.peers.log().offers.len(), 1);
        assert!(relay.published() >= 6);
        assert!(alice.media.live().is_empty());

        tokio::time::sleep(Duration::from_millis(10)).await;
        let records = archive.calls();
        assert_eq!(records.len(), 1);
        assert!(matches!(records[0].outcome, CallOutcome::Failed { .. }));
        assert!(records[0].connected_at.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquisition_failure_returns_to_idle() {
        let relay = InMemoryRelay::new();
        let alice = endpoint(&relay, "alice", None);
        alice.media.fail_next(AcquisitionFailure::DeviceNotFound);

        let err = alice
            .call
            .connect(SessionId::new("s1"), ParticipantRole::Initiator, MediaRequest::default())
            .await
            .unwrap_err();
        assert!(matches!(err, CallError::Acquisition(_)));
        let status = alice.call.status();
        assert_eq!(status.state, CallState::Idle);
        assert_eq!(status.error, Some(err));
        assert_eq!(relay.subscriber_count("session:s1"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_tears_down() {
        let relay = InMemoryRelay::new();
        let alice = endpoint(&relay, "alice", None);
        let mut status = alice.call.subscribe();
        alice
            .call
            .connect(SessionId::new("s1"), ParticipantRole::Initiator, MediaRequest::default())
            .await
            .unwrap();
        let media = alice.media.clone();
        drop(alice);

        let closed = status.wait_for(|s| s.state.is_terminal()).await.unwrap().clone();
        assert_eq!(closed.state, CallState::Closed);
        assert_eq!(media.stopped().len(), 2);
        assert_eq!(relay.subscriber_count("session:s1"), 0);
    }
}
