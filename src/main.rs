#![allow(clippy::similar_names)]
#![warn(clippy::shadow_reuse, clippy::shadow_same, clippy::builtin_type_shadow)]
mod config;
mod context;
mod engine;
mod logger;
mod schema;
mod supervisor;
mod vehicle;

use crate::config::{Config, OperatingMode};
use crate::context::VehicleContext;
use crate::engine::CommandController;
use crate::schema::Command;
use crate::supervisor::Supervisor;
use crate::vehicle::{LinkState, SitlVehicle, TelemetrySim, VehicleBackend};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;

#[tokio::main(flavor = "multi_thread", worker_threads = 4)]
async fn main() {
    let config = Config::from_env();
    info!(
        "Starting ground control core: mode={:?} rate={} Hz auto_mode_switch={}",
        config.mode, config.telemetry_rate, config.auto_mode_switch
    );

    let vehicle = init_backend(&config).await;
    let kind = vehicle.kind();
    let ctx = Arc::new(VehicleContext::new(vehicle, config));
    let engine = Arc::new(CommandController::new(Arc::clone(&ctx)));
    let token = CancellationToken::new();

    let health = ctx.health().await;
    info!("Health: {} ({})", health.status, health.mode);
    ctx.publish_conn(LinkState::Connected, kind);
    spawn_event_forwarders(&ctx);

    let supervisor = Supervisor::new(Arc::clone(&ctx), Arc::clone(&engine));
    let loop_token = token.clone();
    let loop_handle = tokio::spawn(async move { supervisor.run(loop_token).await });

    tokio::select! {
        () = read_commands(&engine) => info!("Command input closed"),
        _ = tokio::signal::ctrl_c() => info!("Interrupt received"),
    }

    token.cancel();
    let _ = loop_handle.await;
    info!("Shutdown complete");
}

/// Builds the backend the configuration asks for. A SITL endpoint that
/// cannot be reached degrades to the simulator instead of aborting, so the
/// operator surface always has a vehicle behind it.
async fn init_backend(config: &Config) -> Box<dyn VehicleBackend> {
    match config.mode {
        OperatingMode::Sim => {
            info!("Simulator backend selected (seed {})", config.sim_seed);
            Box::new(TelemetrySim::new(config.sim_seed))
        }
        OperatingMode::Sitl => {
            match SitlVehicle::connect(&config.mavlink_addr, config.telemetry_rate).await {
                Ok(sitl) => {
                    info!("SITL backend connected at {}", config.mavlink_addr);
                    Box::new(sitl)
                }
                Err(e) => {
                    warn!("SITL connect failed ({e}), falling back to simulator");
                    Box::new(TelemetrySim::new(config.sim_seed))
                }
            }
        }
    }
}

/// Reads newline-delimited JSON commands from stdin until EOF. Lines that
/// are not valid JSON objects are reported and skipped; everything else
/// resolves through the engine's ack stream.
async fn read_commands(engine: &CommandController) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        match serde_json::from_str::<Command>(trimmed) {
            Ok(command) => engine.handle_command(command).await,
            Err(e) => error!("Unparseable command line: {e}"),
        }
    }
}

/// Forwards every broadcast stream to stdout as one tagged JSON line per
/// event. A lagged receiver skips to the stream head; telemetry is a
/// state stream, dropped frames are superseded by the next one.
fn spawn_event_forwarders(ctx: &Arc<VehicleContext>) {
    let mut acks = ctx.subscribe_acks();
    tokio::spawn(async move {
        loop {
            match acks.recv().await {
                Ok(ack) => emit_event("command_ack", &ack),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
                Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
            }
        }
    });

    let mut telemetry = ctx.subscribe_telemetry();
    tokio::spawn(async move {
        loop {
            match telemetry.recv().await {
                Ok(snapshot) => emit_event("telemetry", &snapshot),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
                Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
            }
        }
    });

    let mut conn = ctx.subscribe_conn();
    tokio::spawn(async move {
        loop {
            match conn.recv().await {
                Ok(event) => emit_event("connection_status", &event),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
                Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
            }
        }
    });
}

fn emit_event<T: serde::Serialize>(name: &str, payload: &T) {
    match serde_json::to_string(payload) {
        Ok(body) => println!("{{\"event\":\"{name}\",\"data\":{body}}}"),
        Err(e) => error!("Failed to serialize {name} event: {e}"),
    }
}
