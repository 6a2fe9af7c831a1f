pub mod flight_mode;
pub mod mavlink;
mod sim;
mod sitl;
#[cfg(test)]
mod tests;

pub use sim::TelemetrySim;
pub use sitl::SitlVehicle;

use crate::schema::{CommandAck, CommandDetail, TelemetrySnapshot};
use async_trait::async_trait;
use strum_macros::Display;

/// Which backend variant is active. Also the `mode` field of connection
/// status events and the health probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, serde::Serialize)]
#[strum(serialize_all = "UPPERCASE")]
#[serde(rename_all = "UPPERCASE")]
pub enum VehicleKind {
    Sim,
    Sitl,
}

/// Live-link connection state. The simulator is always `Connected`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, serde::Serialize)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
    Degraded,
}

#[derive(Debug)]
pub enum VehicleError {
    /// The live link is not usable for commands right now.
    LinkDown(LinkState),
    Io(std::io::Error),
}

impl std::fmt::Display for VehicleError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VehicleError::LinkDown(state) => write!(f, "link {state}, command not sent"),
            VehicleError::Io(e) => write!(f, "link i/o error: {e}"),
        }
    }
}

impl std::error::Error for VehicleError {}

impl From<std::io::Error> for VehicleError {
    fn from(e: std::io::Error) -> Self { VehicleError::Io(e) }
}

/// Contract both vehicle variants implement. The engine and the supervisor
/// only ever talk to a `Box<dyn VehicleBackend>` owned by the context;
/// tick stepping and command application are serialized through that single
/// owner, so implementations never see interleaved partial updates.
#[async_trait]
pub trait VehicleBackend: Send + Sync {
    fn kind(&self) -> VehicleKind;

    /// Current snapshot; recomputed on [`VehicleBackend::tick`], cheap to
    /// read in between.
    fn telemetry(&self) -> TelemetrySnapshot;

    fn link(&self) -> LinkState;

    /// Advances one fixed step: physics for the simulator, heartbeat and
    /// pending-ack bookkeeping for the live link. Returns the terminal acks
    /// of commands that finished since the previous tick.
    fn tick(&mut self, dt: f64) -> Vec<CommandAck>;

    /// Applies one validated command and returns its initial ack
    /// (executing, completed or rejected). Long-running commands resolve on
    /// a later tick. Must not block on network round-trips.
    async fn send_command(
        &mut self,
        id: &str,
        detail: &CommandDetail,
    ) -> Result<CommandAck, VehicleError>;
}
