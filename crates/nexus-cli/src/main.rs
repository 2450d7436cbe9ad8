//! Quantum Nexus CLI tools: identity creation, in-process peer demo.

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use nexus_common::{MessageDraft, MessageMetadata, MessageType, NeuralState};
use nexus_identity::IdentityService;
use nexus_p2p::{EARTH_RADIUS_KM, MemoryTransport, PeerSessionManager, SessionConfig, SessionEvent};
use tokio::time::timeout;
use tracing::{info, warn};

/// Reference point for the demo: Westminster Bridge.
const DEMO_ORIGIN: (f64, f64) = (51.5007, -0.1246);

#[derive(Parser, Debug)]
#[command(name = "nexus")]
#[command(about = "Quantum Nexus CLI tools")]
struct Args {
    /// Default log filter when RUST_LOG is unset
    #[arg(long, global = true, env = "NEXUS_LOG", default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create a fresh identity and print its DID
    Identity {
        /// Latitude to record with the identity
        #[arg(long, requires = "lng", allow_hyphen_values = true)]
        lat: Option<f64>,

        /// Longitude to record with the identity
        #[arg(long, requires = "lat", allow_hyphen_values = true)]
        lng: Option<f64>,

        /// Accuracy in metres
        #[arg(long, default_value_t = 10.0)]
        accuracy: f64,

        /// Blur the recorded location
        #[arg(long)]
        cloaked: bool,
    },

    /// Run two peers in-process and print everything they observe
    Demo {
        /// Distance between the peers when the emergency is raised
        #[arg(long, default_value_t = 0.5)]
        distance_km: f64,

        /// Delay before the time-warp message unlocks
        #[arg(long, default_value_t = 2)]
        unlock_secs: u64,
    },

    /// Show version information
    Version,
}

fn main() -> Result<()> {
    let args = Args::parse();
    nexus_common::init_tracing_with_default(&args.log_level);

    match args.command {
        Command::Identity {
            lat,
            lng,
            accuracy,
            cloaked,
        } => {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()?;
            rt.block_on(async {
                let service = IdentityService::new();
                service.initialize().await?;
                if let (Some(lat), Some(lng)) = (lat, lng) {
                    service.update_location(lat, lng, accuracy, cloaked).await?;
                }
                let did = service.did().await?;
                println!("{}", serde_json::to_string_pretty(&did)?);
                Ok::<(), anyhow::Error>(())
            })?;
        }
        Command::Demo {
            distance_km,
            unlock_secs,
        } => {
            let rt = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()?;
            rt.block_on(run_demo(distance_km, unlock_secs))?;
        }
        Command::Version => {
            println!("nexus {}", env!("CARGO_PKG_VERSION"));
        }
    }

    Ok(())
}

async fn run_demo(distance_km: f64, unlock_secs: u64) -> Result<()> {
    let config = SessionConfig::from_env().context("reading session configuration")?;
    let transport = Arc::new(MemoryTransport::new());
    let alice = PeerSessionManager::new(transport.clone(), config.clone());
    let bob = PeerSessionManager::new(transport, config);

    let alice_did = alice.initialize().await?;
    let bob_did = bob.initialize().await?;
    println!("alice: {}", alice_did.id);
    println!("bob:   {}", bob_did.id);

    let (lat, lng) = DEMO_ORIGIN;
    alice.identity().update_location(lat, lng, 5.0, false).await?;
    let north = (distance_km / EARTH_RADIUS_KM).to_degrees();
    bob.identity()
        .update_location((lat + north).min(90.0), lng, 5.0, false)
        .await?;

    spawn_printer("alice", &alice);
    spawn_printer("bob", &bob);
    spawn_relay(&alice, &bob);
    spawn_relay(&bob, &alice);

    let mut bob_events = bob.subscribe();
    alice.initialize_peer(&bob_did.id).await?;
    timeout(Duration::from_secs(5), async {
        while let Some(event) = bob_events.recv().await {
            if matches!(event, SessionEvent::PeerConnected(_)) {
                return Ok(());
            }
        }
        Err(anyhow::anyhow!("session closed"))
    })
    .await
    .context("peers did not connect")??;
    info!(peers = alice.consensus_count(), "peers connected");

    alice.send_message(MessageDraft::text("hello from alice")).await?;
    bob.send_message(
        MessageDraft::new(MessageType::Neural, "feeling this").with_metadata(
            MessageMetadata::with_neural(NeuralState {
                emotional_resonance: 0.82,
                cognitive_state: "focused".to_string(),
            }),
        ),
    )
    .await?;
    alice.send_emergency_signal("need assistance").await?;

    let unlock_time = chrono::Utc::now() + chrono::Duration::seconds(unlock_secs as i64);
    alice
        .send_time_warp_message("opened in the future", unlock_time)
        .await?;

    tokio::time::sleep(Duration::from_millis(200)).await;
    let stats = bob.stats().await?;
    println!(
        "bob holds {} time-warp message(s) until {}",
        stats.pending_time_warps,
        unlock_time.to_rfc3339()
    );

    tokio::time::sleep(Duration::from_secs(unlock_secs) + Duration::from_millis(500)).await;

    alice.disconnect().await?;
    tokio::time::sleep(Duration::from_millis(200)).await;
    bob.disconnect().await?;
    tokio::time::sleep(Duration::from_millis(100)).await;
    Ok(())
}

fn spawn_printer(name: &'static str, manager: &PeerSessionManager) {
    let mut events = manager.subscribe();
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            println!("[{name}] {}", describe(&event));
        }
    });
}

/// Carry negotiation events from `from` to `to`.
fn spawn_relay(from: &PeerSessionManager, to: &PeerSessionManager) {
    let mut events = from.subscribe();
    let local_id = from.peer_id().unwrap_or_default().to_string();
    let to = to.clone();
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            let Some(signal) = event.to_signal(&local_id) else {
                continue;
            };
            if let Err(e) = to.apply_signal(signal).await {
                warn!(%e, "relay could not deliver signal");
            }
        }
    });
}

fn describe(event: &SessionEvent) -> String {
    match event {
        SessionEvent::Message(message) => {
            let mut line = format!(
                "message {:?} from {}: {}",
                message.kind, message.sender, message.content
            );
            if let Some(neural) = message.metadata.as_ref().and_then(|m| m.neural.as_ref()) {
                line.push_str(&format!(
                    " (resonance {:.2}, {})",
                    neural.emotional_resonance, neural.cognitive_state
                ));
            }
            line
        }
        SessionEvent::PeerConnected(id) => format!("peer connected: {id}"),
        SessionEvent::PeerDisconnected(id) => format!("peer disconnected: {id}"),
        SessionEvent::EmergencyValidation(v) => {
            format!("emergency from {} validated: {}", v.peer_id, v.validation)
        }
        SessionEvent::Offer(offer) => format!("offer for {}", offer.remote_id),
        SessionEvent::Answer(answer) => format!("answer for {}", answer.remote_id),
        SessionEvent::IceCandidate(c) => format!("candidate for {}", c.remote_id),
        SessionEvent::Disconnected => "disconnected".to_string(),
    }
}
