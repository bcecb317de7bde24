//! Duet CLI: run a simulated two-party call from the command line.

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use clap::{Args as ClapArgs, Parser, Subcommand};
use tokio::sync::watch;
use tokio::time::{sleep, timeout};
use tracing::info;

use duet_common::{Participant, ParticipantRole, SessionId};
use duet_session::sim::{MemoryArchive, SimMediaPlatform, SimPeerFactory};
use duet_session::{
    CallConfig, CallDeps, CallError, CallState, ChatEvent, ChatRelay, ConnectionStateMachine,
    ConnectionStatus, InMemoryRelay, LocalIdentity, MediaRequest,
};

#[derive(Parser, Debug)]
#[command(name = "duet")]
#[command(about = "Duet call coordinator tools")]
struct Args {
    /// Default log filter when RUST_LOG is unset
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run two simulated endpoints through a full call
    Demo(DemoArgs),

    /// Show version information
    Version,
}

#[derive(ClapArgs, Debug)]
struct DemoArgs {
    /// Delay between the two peers calling connect()
    #[arg(long, default_value_t = 50)]
    stagger_ms: u64,

    /// One-way relay delivery latency
    #[arg(long, env = "DUET_DEMO_LATENCY_MS", default_value_t = 20)]
    latency_ms: u64,

    /// Drop the relay this long after the call connects
    #[arg(long)]
    interrupt_after_ms: Option<u64>,

    /// How long the relay stays down
    #[arg(long, default_value_t = 1500)]
    outage_ms: u64,

    /// Refuse the first peer's camera; it falls back to audio only
    #[arg(long, default_value_t = false)]
    deny_camera: bool,

    /// Share the first peer's screen once connected, then stop
    #[arg(long, default_value_t = false)]
    share_screen: bool,

    /// How long to stay connected before hanging up
    #[arg(long, default_value_t = 1000)]
    hold_ms: u64,
}

struct Endpoint {
    name: &'static str,
    call: ConnectionStateMachine,
    media: Arc<SimMediaPlatform>,
    status: watch::Receiver<ConnectionStatus>,
}

fn endpoint(
    name: &'static str,
    relay: &InMemoryRelay,
    archive: &Arc<MemoryArchive>,
    config: CallConfig,
) -> Endpoint {
    let media = Arc::new(SimMediaPlatform::new());
    let deps = CallDeps::new(
        Arc::new(relay.clone()),
        media.clone(),
        Arc::new(SimPeerFactory::new(name)),
    )
    .with_archive(archive.clone());
    let call = ConnectionStateMachine::new(LocalIdentity::new(name, name), deps, config);
    let status = call.subscribe();

    // Print every status change.
    let mut printer = call.subscribe();
    tokio::spawn(async move {
        while printer.changed().await.is_ok() {
            let status = printer.borrow_and_update().clone();
            println!("[{name:>5}] {status}");
        }
    });

    Endpoint {
        name,
        call,
        media,
        status,
    }
}

async fn wait_for(endpoint: &mut Endpoint, wanted: CallState, limit: Duration) -> Result<()> {
    let reached = timeout(
        limit,
        endpoint
            .status
            .wait_for(|s| s.state == wanted || s.state.is_terminal()),
    )
    .await;
    match reached {
        Ok(Ok(status)) if status.state == wanted => Ok(()),
        Ok(Ok(status)) => bail!("{} ended as {} instead of {}", endpoint.name, *status, wanted),
        Ok(Err(_)) => bail!("{} call task stopped", endpoint.name),
        Err(_) => bail!("{} did not reach {} within {:?}", endpoint.name, wanted, limit),
    }
}

async fn connect_with_fallback(
    endpoint: &Endpoint,
    session: SessionId,
    role: ParticipantRole,
) -> Result<()> {
    match endpoint
        .call
        .connect(session.clone(), role, MediaRequest::audio_video())
        .await
    {
        Ok(()) => Ok(()),
        Err(CallError::Acquisition(err)) => {
            println!("[{:>5}] {err}; retrying audio only", endpoint.name);
            endpoint
                .call
                .connect(session, role, MediaRequest::audio_only())
                .await?;
            Ok(())
        }
        Err(err) => Err(err.into()),
    }
}

async fn demo(args: DemoArgs) -> Result<()> {
    let config = CallConfig::from_env();
    let limit = config.connect_timeout;
    let relay = InMemoryRelay::with_latency(Duration::from_millis(args.latency_ms));
    let archive = Arc::new(MemoryArchive::new());
    let session = SessionId::generate();
    info!(%session, "starting demo call");

    let mut alice = endpoint("alice", &relay, &archive, config.clone());
    let mut bob = endpoint("bob", &relay, &archive, config);
    if args.deny_camera {
        alice.media.deny_camera();
    }

    let mut alice_chat = ChatRelay::new(
        Arc::new(relay.clone()),
        session.clone(),
        Participant::new("alice", "alice", ParticipantRole::Initiator),
    )
    .with_archive(archive.clone());
    let mut bob_chat = ChatRelay::new(
        Arc::new(relay.clone()),
        session.clone(),
        Participant::new("bob", "bob", ParticipantRole::Responder),
    );
    let _alice_inbox = alice_chat.join(16).await?;
    let mut bob_inbox = bob_chat.join(16).await?;

    connect_with_fallback(&alice, session.clone(), ParticipantRole::Initiator).await?;
    sleep(Duration::from_millis(args.stagger_ms)).await;
    connect_with_fallback(&bob, session.clone(), ParticipantRole::Responder).await?;

    wait_for(&mut alice, CallState::Connected, limit).await?;
    wait_for(&mut bob, CallState::Connected, limit).await?;

    alice_chat.send("can you hear me?").await?;
    if let Ok(Some(ChatEvent::Message(message))) =
        timeout(Duration::from_secs(1), bob_inbox.recv()).await
    {
        println!("[  bob] chat from {}: {}", message.sender_name, message.body);
    }

    if args.share_screen {
        alice.call.share_screen().await?;
        sleep(Duration::from_millis(500)).await;
        alice.call.stop_share().await?;
        sleep(Duration::from_millis(500)).await;
    }

    if let Some(after) = args.interrupt_after_ms {
        sleep(Duration::from_millis(after)).await;
        println!("-- relay down for {} ms", args.outage_ms);
        relay.interrupt();
        sleep(Duration::from_millis(args.outage_ms)).await;
        relay.restore();
        println!("-- relay restored");
        wait_for(&mut alice, CallState::Connected, limit).await?;
        wait_for(&mut bob, CallState::Connected, limit).await?;
    }

    sleep(Duration::from_millis(args.hold_ms)).await;
    alice.call.disconnect().await;
    wait_for(&mut bob, CallState::Closed, limit).await?;
    alice_chat.leave().await;
    bob_chat.leave().await;

    // Let the archive hand-offs land.
    sleep(Duration::from_millis(50)).await;
    for record in archive.calls() {
        let connected = record
            .connected_duration()
            .map(|d| format!("{} ms connected", d.num_milliseconds()))
            .unwrap_or_else(|| "never connected".to_string());
        println!("record: {} {:?} ({})", record.local.id, record.outcome, connected);
    }
    println!(
        "devices released: alice={} bob={}",
        alice.media.live().is_empty(),
        bob.media.live().is_empty()
    );
    Ok(())
}

fn main() -> Result<()> {
    let args = Args::parse();
    duet_common::init_tracing_with_default(&args.log_level);

    match args.command {
        Command::Demo(demo_args) => {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()?;
            rt.block_on(demo(demo_args))?;
        }
        Command::Version => {
            println!("duet {}", env!("CARGO_PKG_VERSION"));
        }
    }

    Ok(())
}
