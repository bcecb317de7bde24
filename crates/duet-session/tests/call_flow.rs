//! Two full endpoints talking over the in-memory relay.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{sleep, timeout, Instant};

use duet_common::{ParticipantRole, SessionId};
use duet_session::sim::{MemoryArchive, SimMediaPlatform, SimPeerFactory};
use duet_session::{
    AcquisitionFailure, CallConfig, CallDeps, CallError, CallOutcome, CallState,
    ConnectionStateMachine, ConnectionStatus, InMemoryRelay, LocalIdentity, MediaRequest,
};

struct Endpoint {
    call: ConnectionStateMachine,
    media: Arc<SimMediaPlatform>,
    peers: Arc<SimPeerFactory>,
    status: watch::Receiver<ConnectionStatus>,
}

fn endpoint(relay: &InMemoryRelay, id: &str, config: CallConfig, archive: Option<&Arc<MemoryArchive>>) -> Endpoint {
    let media = Arc::new(SimMediaPlatform::new());
    let peers = Arc::new(SimPeerFactory::new(id));
    let mut deps = CallDeps::new(Arc::new(relay.clone()), media.clone(), peers.clone());
    if let Some(archive) = archive {
        deps = deps.with_archive(archive.clone());
    }
    let call = ConnectionStateMachine::new(LocalIdentity::new(id, id.to_uppercase()), deps, config);
    let status = call.subscribe();
    Endpoint {
        call,
        media,
        peers,
        status,
    }
}

async fn wait_for_state(endpoint: &mut Endpoint, state: CallState) -> ConnectionStatus {
    timeout(
        Duration::from_secs(120),
        endpoint.status.wait_for(|s| s.state == state),
    )
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {state}"))
    .expect("call task gone")
    .clone()
}

async fn connected_pair(relay: &InMemoryRelay, config: CallConfig) -> (Endpoint, Endpoint) {
    let session = SessionId::new("lesson-42");
    let mut alice = endpoint(relay, "alice", config.clone(), None);
    let mut bob = endpoint(relay, "bob", config, None);
    alice
        .call
        .connect(session.clone(), ParticipantRole::Initiator, MediaRequest::default())
        .await
        .unwrap();
    bob.call
        .connect(session, ParticipantRole::Responder, MediaRequest::default())
        .await
        .unwrap();
    wait_for_state(&mut alice, CallState::Connected).await;
    wait_for_state(&mut bob, CallState::Connected).await;
    (alice, bob)
}

fn total_offers(a: &Endpoint, b: &Endpoint) -> usize {
    a.peers.log().offers.len() + b.peers.log().offers.len()
}

fn total_answers(a: &Endpoint, b: &Endpoint) -> usize {
    a.peers.log().answers.len() + b.peers.log().answers.len()
}

#[tokio::test(start_paused = true)]
async fn test_staggered_connect_finalizes_one_offer_answer_pair() {
    let relay = InMemoryRelay::new();
    let session = SessionId::new("lesson-42");
    let mut alice = endpoint(&relay, "alice", CallConfig::default(), None);
    let mut bob = endpoint(&relay, "bob", CallConfig::default(), None);

    alice
        .call
        .connect(session.clone(), ParticipantRole::Initiator, MediaRequest::default())
        .await
        .unwrap();
    sleep(Duration::from_millis(50)).await;
    bob.call
        .connect(session, ParticipantRole::Responder, MediaRequest::default())
        .await
        .unwrap();

    wait_for_state(&mut alice, CallState::Connected).await;
    wait_for_state(&mut bob, CallState::Connected).await;

    // Alice's first offer went out before Bob was listening; Bob's offer
    // met Alice's pending one and Alice, the polite side, yielded.
    assert_eq!(total_answers(&alice, &bob), 1);
    assert_eq!(alice.peers.log().answers.len(), 1);
    assert_eq!(alice.peers.log().rollbacks, 1);
    assert_eq!(bob.peers.log().rollbacks, 0);

    // Nothing left to retransmit.
    let published = relay.published();
    sleep(Duration::from_secs(20)).await;
    assert_eq!(relay.published(), published);
    assert_eq!(alice.call.status().state, CallState::Connected);
}

#[tokio::test(start_paused = true)]
async fn test_glare_converges_for_any_interleaving() {
    for latency_ms in [0, 15, 120] {
        for stagger_ms in [0, 10, 50, 400] {
            let relay = InMemoryRelay::with_latency(Duration::from_millis(latency_ms));
            let session = SessionId::new(format!("glare-{latency_ms}-{stagger_ms}"));
            let mut alice = endpoint(&relay, "alice", CallConfig::default(), None);
            let mut bob = endpoint(&relay, "bob", CallConfig::default(), None);

            let alice_connect = alice.call.connect(
                session.clone(),
                ParticipantRole::Initiator,
                MediaRequest::default(),
            );
            let bob_connect = async {
                sleep(Duration::from_millis(stagger_ms)).await;
                bob.call
                    .connect(session.clone(), ParticipantRole::Responder, MediaRequest::default())
                    .await
            };
            let (a, b) = tokio::join!(alice_connect, bob_connect);
            a.unwrap();
            b.unwrap();

            wait_for_state(&mut alice, CallState::Connected).await;
            wait_for_state(&mut bob, CallState::Connected).await;
            // The impolite side never gives up its offer.
            assert_eq!(bob.peers.log().rollbacks, 0, "latency {latency_ms} stagger {stagger_ms}");
            assert!(alice.peers.log().answers.len() >= 1);

            alice.call.disconnect().await;
            bob.call.disconnect().await;
        }
    }
}

#[tokio::test(start_paused = true)]
async fn test_offer_arriving_during_acquisition_is_queued() {
    let relay = InMemoryRelay::new();
    let session = SessionId::new("lesson-7");
    // Bob is the polite side here and has a slow permission prompt.
    let mut alice = endpoint(&relay, "alice", CallConfig::default(), None);
    let mut bob = endpoint(&relay, "bob", CallConfig::default(), None);
    bob.media.set_acquire_delay(Duration::from_secs(2));

    let start = Instant::now();
    let bob_connect = bob
        .call
        .connect(session.clone(), ParticipantRole::Initiator, MediaRequest::default());
    let alice_connect = async {
        sleep(Duration::from_millis(20)).await;
        alice
            .call
            .connect(session.clone(), ParticipantRole::Responder, MediaRequest::default())
            .await
    };
    let (b, a) = tokio::join!(bob_connect, alice_connect);
    b.unwrap();
    a.unwrap();

    wait_for_state(&mut bob, CallState::Connected).await;
    wait_for_state(&mut alice, CallState::Connected).await;
    // Alice's offer was held while Bob's devices opened, then won the glare.
    assert!(start.elapsed() < CallConfig::default().offer_timeout);
    assert_eq!(bob.peers.log().rollbacks, 1);
    assert_eq!(bob.peers.log().answers.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_relay_loss_reconnects_without_caller_action() {
    let relay = InMemoryRelay::new();
    let (mut alice, mut bob) = connected_pair(&relay, CallConfig::default()).await;

    relay.interrupt();
    wait_for_state(&mut alice, CallState::Reconnecting).await;
    wait_for_state(&mut bob, CallState::Reconnecting).await;

    sleep(Duration::from_millis(500)).await;
    relay.restore();

    wait_for_state(&mut alice, CallState::Connected).await;
    wait_for_state(&mut bob, CallState::Connected).await;
    assert_eq!(relay.subscriber_count("session:lesson-42"), 2);
    let restarts = alice.peers.log().ice_restarts + bob.peers.log().ice_restarts;
    assert!(restarts >= 1);
    assert!(alice.call.status().error.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_relay_outage_exhausts_backoff_then_fails() {
    let relay = InMemoryRelay::new();
    let config = CallConfig {
        reconnect_initial: Duration::from_millis(100),
        reconnect_attempts: 3,
        ..CallConfig::default()
    };
    let (mut alice, mut bob) = connected_pair(&relay, config).await;

    let lost_at = Instant::now();
    relay.interrupt();
    let failed = wait_for_state(&mut alice, CallState::Failed).await;
    wait_for_state(&mut bob, CallState::Failed).await;

    assert_eq!(failed.error, Some(CallError::ChannelLost));
    // 100ms + 200ms + 400ms of backoff, then give up.
    assert!(lost_at.elapsed() >= Duration::from_millis(700));
    assert!(alice.media.live().is_empty());

    // Disconnecting a failed call changes nothing.
    let stopped = alice.media.stopped().len();
    alice.call.disconnect().await;
    assert_eq!(alice.call.status().state, CallState::Failed);
    assert_eq!(alice.media.stopped().len(), stopped);
}

#[tokio::test(start_paused = true)]
async fn test_transport_loss_restarts_ice() {
    let relay = InMemoryRelay::new();
    let (mut alice, bob) = connected_pair(&relay, CallConfig::default()).await;

    assert!(alice.peers.lose_transport());
    wait_for_state(&mut alice, CallState::Reconnecting).await;
    wait_for_state(&mut alice, CallState::Connected).await;

    assert_eq!(alice.peers.log().ice_restarts, 1);
    assert_eq!(bob.call.status().state, CallState::Connected);
}

#[tokio::test(start_paused = true)]
async fn test_mute_never_renegotiates_screen_share_always_does() {
    let relay = InMemoryRelay::new();
    let (alice, bob) = connected_pair(&relay, CallConfig::default()).await;
    let offers = total_offers(&alice, &bob);
    let answers = total_answers(&alice, &bob);

    assert_eq!(alice.call.toggle_video().await, Ok(false));
    assert_eq!(alice.call.toggle_audio().await, Ok(false));
    assert_eq!(alice.call.toggle_audio().await, Ok(true));
    sleep(Duration::from_secs(1)).await;
    assert_eq!(total_offers(&alice, &bob), offers);
    let status = alice.call.status();
    assert!(!status.video_enabled);
    assert!(status.audio_enabled);
    assert_eq!(alice.media.toggles(), 3);

    alice.call.share_screen().await.unwrap();
    sleep(Duration::from_secs(1)).await;
    assert!(alice.call.status().sharing_screen);
    assert_eq!(total_offers(&alice, &bob), offers + 1);
    assert_eq!(total_answers(&alice, &bob), answers + 1);
    let screen = alice.peers.log().video_tracks.last().copied().flatten();
    assert!(screen.is_some());

    alice.call.stop_share().await.unwrap();
    sleep(Duration::from_secs(1)).await;
    assert!(!alice.call.status().sharing_screen);
    assert_eq!(total_offers(&alice, &bob), offers + 2);
    assert_eq!(total_answers(&alice, &bob), answers + 2);
    assert_ne!(alice.peers.log().video_tracks.last().copied().flatten(), screen);
    assert_eq!(alice.call.status().state, CallState::Connected);
    assert_eq!(bob.call.status().state, CallState::Connected);
}

#[tokio::test(start_paused = true)]
async fn test_lost_renegotiation_offer_is_sent_again() {
    let relay = InMemoryRelay::new();
    let config = CallConfig::default();
    let (alice, bob) = connected_pair(&relay, config.clone()).await;
    sleep(Duration::from_millis(10)).await;
    let offers = alice.peers.log().offers.len();
    let answers = bob.peers.log().answers.len();

    relay.drop_next(1);
    alice.call.share_screen().await.unwrap();
    sleep(Duration::from_secs(1)).await;
    assert_eq!(bob.peers.log().answers.len(), answers);

    sleep(config.offer_timeout).await;
    assert_eq!(bob.peers.log().answers.len(), answers + 1);
    // The same offer went out again; no new one was created.
    assert_eq!(alice.peers.log().offers.len(), offers + 1);

    // Negotiation is not wedged: the next change goes through.
    alice.call.stop_share().await.unwrap();
    sleep(Duration::from_secs(1)).await;
    assert_eq!(alice.peers.log().offers.len(), offers + 2);
    assert_eq!(bob.peers.log().answers.len(), answers + 2);
    let status = alice.call.status();
    assert_eq!(status.state, CallState::Connected);
    assert!(!status.sharing_screen);
}

#[tokio::test(start_paused = true)]
async fn test_unanswered_renegotiation_escalates_to_restart() {
    let relay = InMemoryRelay::new();
    let config = CallConfig {
        offer_retries: 1,
        ..CallConfig::default()
    };
    let (mut alice, bob) = connected_pair(&relay, config).await;
    sleep(Duration::from_millis(10)).await;

    // The offer and its one resend are both lost.
    relay.drop_next(2);
    alice.call.share_screen().await.unwrap();
    wait_for_state(&mut alice, CallState::Reconnecting).await;
    let recovered = wait_for_state(&mut alice, CallState::Connected).await;

    assert!(recovered.sharing_screen);
    assert_eq!(alice.peers.log().ice_restarts, 1);
    assert_eq!(bob.call.status().state, CallState::Connected);
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_does_not_wait_for_screen_picker() {
    let relay = InMemoryRelay::new();
    let (alice, mut bob) = connected_pair(&relay, CallConfig::default()).await;
    alice.media.set_display_delay(Duration::from_secs(60));

    let start = Instant::now();
    let (shared, ()) = tokio::join!(alice.call.share_screen(), async {
        sleep(Duration::from_millis(100)).await;
        // The call still answers while the picker is open.
        assert_eq!(alice.call.toggle_audio().await, Ok(false));
        alice.call.disconnect().await;
    });
    assert!(start.elapsed() < Duration::from_secs(1));
    assert_eq!(shared, Err(CallError::Cancelled));
    assert_eq!(alice.call.status().state, CallState::Closed);
    wait_for_state(&mut bob, CallState::Closed).await;

    // The picker resolves long after hangup; the capture is stopped at once.
    sleep(Duration::from_secs(61)).await;
    assert!(alice.media.live().is_empty());
    assert_eq!(alice.media.stopped().len(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_denied_screen_share_keeps_the_call() {
    let relay = InMemoryRelay::new();
    let (alice, bob) = connected_pair(&relay, CallConfig::default()).await;
    let offers = total_offers(&alice, &bob);
    alice.media.deny_display();

    let err = alice.call.share_screen().await.unwrap_err();
    assert!(matches!(err, CallError::Acquisition(e) if e.reason == AcquisitionFailure::PermissionDenied));
    sleep(Duration::from_secs(1)).await;
    let status = alice.call.status();
    assert_eq!(status.state, CallState::Connected);
    assert!(!status.sharing_screen);
    assert!(status.video_enabled);
    assert_eq!(total_offers(&alice, &bob), offers);
}

#[tokio::test(start_paused = true)]
async fn test_rejoining_peer_is_not_mistaken_for_duplicates() {
    let relay = InMemoryRelay::new();
    let config = CallConfig::default();
    let (alice, bob) = connected_pair(&relay, config.clone()).await;
    sleep(Duration::from_millis(10)).await;

    // Bob vanishes; his goodbye never reaches Alice.
    relay.drop_next(1);
    drop(bob);
    sleep(Duration::from_millis(10)).await;
    assert_eq!(alice.call.status().state, CallState::Connected);

    let mut bob = endpoint(&relay, "bob", config.clone(), None);
    let rejoined = Instant::now();
    bob.call
        .connect(SessionId::new("lesson-42"), ParticipantRole::Responder, MediaRequest::default())
        .await
        .unwrap();
    wait_for_state(&mut bob, CallState::Connected).await;

    // Answered on the first offer, not on a resend.
    assert!(rejoined.elapsed() < config.offer_timeout);
    assert_eq!(bob.peers.log().offers.len(), 1);
    assert_eq!(alice.call.status().state, CallState::Connected);
}

#[tokio::test(start_paused = true)]
async fn test_camera_denied_then_audio_only_connects() {
    let relay = InMemoryRelay::new();
    let session = SessionId::new("lesson-42");
    let mut alice = endpoint(&relay, "alice", CallConfig::default(), None);
    let mut bob = endpoint(&relay, "bob", CallConfig::default(), None);
    alice.media.deny_camera();

    let err = alice
        .call
        .connect(session.clone(), ParticipantRole::Initiator, MediaRequest::default())
        .await
        .unwrap_err();
    assert!(matches!(err, CallError::Acquisition(_)));
    assert_eq!(alice.call.status().state, CallState::Idle);

    alice
        .call
        .connect(session.clone(), ParticipantRole::Initiator, MediaRequest::audio_only())
        .await
        .unwrap();
    bob.call
        .connect(session, ParticipantRole::Responder, MediaRequest::default())
        .await
        .unwrap();

    let status = wait_for_state(&mut alice, CallState::Connected).await;
    wait_for_state(&mut bob, CallState::Connected).await;
    assert!(status.audio_enabled);
    assert!(!status.video_enabled);
    assert!(status.error.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_is_idempotent_and_remote_closes() {
    let relay = InMemoryRelay::new();
    let archive = Arc::new(MemoryArchive::new());
    let session = SessionId::new("lesson-42");
    let mut alice = endpoint(&relay, "alice", CallConfig::default(), Some(&archive));
    let mut bob = endpoint(&relay, "bob", CallConfig::default(), Some(&archive));
    alice
        .call
        .connect(session.clone(), ParticipantRole::Initiator, MediaRequest::default())
        .await
        .unwrap();
    bob.call
        .connect(session, ParticipantRole::Responder, MediaRequest::default())
        .await
        .unwrap();
    wait_for_state(&mut alice, CallState::Connected).await;
    wait_for_state(&mut bob, CallState::Connected).await;

    for _ in 0..3 {
        alice.call.disconnect().await;
    }
    let closed = alice.call.status();
    assert_eq!(closed.state, CallState::Closed);
    assert!(closed.error.is_none());
    assert_eq!(alice.media.stopped().len(), 2);
    assert_eq!(alice.peers.log().closes, 1);

    wait_for_state(&mut bob, CallState::Closed).await;
    assert_eq!(bob.media.stopped().len(), 2);
    assert_eq!(relay.subscriber_count("session:lesson-42"), 0);

    sleep(Duration::from_millis(10)).await;
    let records = archive.calls();
    assert_eq!(records.len(), 2);
    let outcome = |id: &str| {
        records
            .iter()
            .find(|r| r.local.id == id)
            .map(|r| (r.outcome.clone(), r.connected_at.is_some()))
    };
    assert_eq!(outcome("alice"), Some((CallOutcome::Completed, true)));
    assert_eq!(outcome("bob"), Some((CallOutcome::RemoteHangup, true)));
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_cancels_pending_acquisition() {
    let relay = InMemoryRelay::new();
    let alice = endpoint(&relay, "alice", CallConfig::default(), None);
    alice.media.set_acquire_delay(Duration::from_secs(10));

    let (connected, ()) = tokio::join!(
        alice.call.connect(
            SessionId::new("lesson-42"),
            ParticipantRole::Initiator,
            MediaRequest::default()
        ),
        async {
            sleep(Duration::from_millis(100)).await;
            alice.call.disconnect().await;
        }
    );
    assert_eq!(connected, Err(CallError::Cancelled));
    assert_eq!(alice.call.status().state, CallState::Closed);

    // The prompt resolves later; the devices are released right away.
    sleep(Duration::from_secs(11)).await;
    assert!(alice.media.live().is_empty());
    assert_eq!(alice.media.stopped().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_cancels_reconnection_backoff() {
    let relay = InMemoryRelay::new();
    let (mut alice, mut bob) = connected_pair(&relay, CallConfig::default()).await;

    relay.interrupt();
    wait_for_state(&mut alice, CallState::Reconnecting).await;
    wait_for_state(&mut bob, CallState::Reconnecting).await;

    alice.call.disconnect().await;
    bob.call.disconnect().await;
    assert_eq!(alice.call.status().state, CallState::Closed);
    assert_eq!(bob.call.status().state, CallState::Closed);

    let published = relay.published();
    let offers = total_offers(&alice, &bob);
    let restarts = alice.peers.log().ice_restarts + bob.peers.log().ice_restarts;
    relay.restore();
    sleep(Duration::from_secs(60)).await;

    // No reconnection attempt survived the hangup.
    assert_eq!(relay.published(), published);
    assert_eq!(total_offers(&alice, &bob), offers);
    assert_eq!(alice.peers.log().ice_restarts + bob.peers.log().ice_restarts, restarts);
    assert_eq!(relay.subscriber_count("session:lesson-42"), 0);
    for endpoint in [&alice, &bob] {
        assert_eq!(endpoint.call.status().state, CallState::Closed);
        assert_eq!(endpoint.media.stopped().len(), 2);
        assert!(endpoint.media.live().is_empty());
        assert_eq!(endpoint.peers.log().closes, 1);
    }
}
