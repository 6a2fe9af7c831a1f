use crate::config::Config;
use crate::schema::{CommandAck, TelemetrySnapshot};
use crate::vehicle::{LinkState, VehicleBackend, VehicleKind};
use chrono::{DateTime, Utc};
use tokio::sync::{RwLock, broadcast};

/// Connection status event, emitted on every link change and backend swap.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ConnectionEvent {
    pub status: LinkState,
    pub mode: VehicleKind,
    pub timestamp: DateTime<Utc>,
}

/// On-demand health probe payload.
#[derive(Debug, Clone, serde::Serialize)]
pub struct HealthStatus {
    pub status: &'static str,
    pub mode: VehicleKind,
}

/// Owns the active vehicle backend and every outbound channel.
///
/// There is no process-global state: the command path and the telemetry
/// loop both work through one shared `VehicleContext`, and the backend slot
/// is only swapped at controlled transition points (startup, link-loss
/// fallback), never mid-command.
pub struct VehicleContext {
    vehicle: RwLock<Box<dyn VehicleBackend>>,
    latest: RwLock<Option<TelemetrySnapshot>>,
    telemetry_tx: broadcast::Sender<TelemetrySnapshot>,
    ack_tx: broadcast::Sender<CommandAck>,
    conn_tx: broadcast::Sender<ConnectionEvent>,
    config: Config,
}

impl VehicleContext {
    /// Outbound channel depth. Slow consumers lag and drop, they never
    /// stall the telemetry loop.
    const CHANNEL_DEPTH: usize = 32;

    pub fn new(vehicle: Box<dyn VehicleBackend>, config: Config) -> Self {
        Self {
            vehicle: RwLock::new(vehicle),
            latest: RwLock::new(None),
            telemetry_tx: broadcast::Sender::new(Self::CHANNEL_DEPTH),
            ack_tx: broadcast::Sender::new(Self::CHANNEL_DEPTH),
            conn_tx: broadcast::Sender::new(Self::CHANNEL_DEPTH),
            config,
        }
    }

    pub fn vehicle(&self) -> &RwLock<Box<dyn VehicleBackend>> { &self.vehicle }
    pub fn config(&self) -> &Config { &self.config }

    pub async fn latest_telemetry(&self) -> Option<TelemetrySnapshot> {
        self.latest.read().await.clone()
    }

    pub async fn store_telemetry(&self, snapshot: TelemetrySnapshot) {
        *self.latest.write().await = Some(snapshot);
    }

    pub fn subscribe_telemetry(&self) -> broadcast::Receiver<TelemetrySnapshot> {
        self.telemetry_tx.subscribe()
    }

    pub fn subscribe_acks(&self) -> broadcast::Receiver<CommandAck> { self.ack_tx.subscribe() }

    pub fn subscribe_conn(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.conn_tx.subscribe()
    }

    /// Forwards a snapshot to whoever listens; a send with no receivers is
    /// not an error.
    pub fn publish_telemetry(&self, snapshot: TelemetrySnapshot) {
        let _ = self.telemetry_tx.send(snapshot);
    }

    pub fn publish_ack(&self, ack: CommandAck) {
        let _ = self.ack_tx.send(ack);
    }

    pub fn publish_conn(&self, status: LinkState, mode: VehicleKind) {
        let _ = self.conn_tx.send(ConnectionEvent { status, mode, timestamp: Utc::now() });
    }

    /// `{status: ok, mode}` for the external health probe.
    pub async fn health(&self) -> HealthStatus {
        let mode = self.vehicle.read().await.kind();
        HealthStatus { status: "ok", mode }
    }
}
