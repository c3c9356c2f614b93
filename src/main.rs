//! Dry-run host
//!
//! Replays a JSON indication script against the server using the loopback
//! transport and prints every event the server emits.
//!
//! ```text
//! bthps3_server <scenario.json> [settings.json]
//! ```

use anyhow::Context;
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use bthps3_server::domain::models::{ChannelIndication, Indication};
use bthps3_server::infrastructure::bluetooth::loopback::{CompletionMode, LoopbackTransport};
use bthps3_server::infrastructure::logging::init_logger;
use bthps3_server::{BthAddr, ChannelKind, L2capServer, ServerEvent, SettingsService};

#[derive(Debug, Deserialize)]
struct RemoteName {
    address: BthAddr,
    name: String,
}

#[derive(Debug, Deserialize)]
enum ReplayStep {
    Server(Indication),
    Channel {
        address: BthAddr,
        kind: ChannelKind,
        indication: ChannelIndication,
    },
    Sleep {
        ms: u64,
    },
}

#[derive(Debug, Deserialize)]
struct ReplayScenario {
    #[serde(default)]
    remote_names: Vec<RemoteName>,
    steps: Vec<ReplayStep>,
}

fn main() -> anyhow::Result<()> {
    let mut args = std::env::args().skip(1);
    let scenario_path = PathBuf::from(
        args.next()
            .context("usage: bthps3_server <scenario.json> [settings.json]")?,
    );

    let settings_service = match args.next() {
        Some(path) => SettingsService::from_path(PathBuf::from(path)),
        None => SettingsService::new().unwrap_or_else(|e| {
            eprintln!("Using default settings: {}", e);
            SettingsService::in_memory(Default::default())
        }),
    };

    let _logging_guard = init_logger(&settings_service.get().log_settings)
        .map_err(|e| eprintln!("Failed to initialize logging: {}", e))
        .ok();

    let contents = std::fs::read_to_string(&scenario_path)
        .with_context(|| format!("reading {}", scenario_path.display()))?;
    let scenario: ReplayScenario = serde_json::from_str(&contents)
        .with_context(|| format!("parsing {}", scenario_path.display()))?;

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to create tokio runtime")?;

    rt.block_on(replay(scenario, settings_service));
    Ok(())
}

async fn replay(scenario: ReplayScenario, settings_service: SettingsService) {
    info!("Replaying {} step(s)", scenario.steps.len());

    let transport = Arc::new(LoopbackTransport::new(CompletionMode::Spawned(
        tokio::runtime::Handle::current(),
    )));
    for entry in scenario.remote_names {
        transport.set_remote_name(entry.address, entry.name);
    }

    let (event_tx, mut event_rx) = mpsc::unbounded_channel();
    let server = L2capServer::new(
        transport.clone(),
        transport.clone(),
        Arc::new(Mutex::new(settings_service)),
        event_tx,
        tokio::runtime::Handle::current(),
    );

    for step in scenario.steps {
        match step {
            ReplayStep::Server(indication) => {
                if let Some(admission) = server.on_server_indication(indication) {
                    match admission.await {
                        Ok(Ok(admission)) => info!("Admission: {:?}", admission),
                        Ok(Err(e)) => warn!("Admission failed: {}", e),
                        Err(e) => error!("Admission task failed: {}", e),
                    }
                }
            }
            ReplayStep::Channel {
                address,
                kind,
                indication,
            } => match server.registry().find_by_address(address) {
                Some(record) => server.on_channel_indication(&record, kind, indication),
                None => warn!("No connection record for {}", address),
            },
            ReplayStep::Sleep { ms } => tokio::time::sleep(Duration::from_millis(ms)).await,
        }
        print_events(&mut event_rx);
    }

    // Let outstanding loopback completions run before shutting down
    tokio::time::sleep(Duration::from_millis(50)).await;
    server.shutdown().await;
    info!(
        "Replay finished, {} request block(s) submitted",
        transport.submitted().len()
    );
    print_events(&mut event_rx);
}

fn print_events(event_rx: &mut mpsc::UnboundedReceiver<ServerEvent>) {
    while let Ok(event) = event_rx.try_recv() {
        println!("{:?}", event);
    }
}
