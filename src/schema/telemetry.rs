use chrono::{DateTime, Utc};

#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Position {
    /// Latitude in degrees.
    pub lat: f64,
    /// Longitude in degrees.
    pub lon: f64,
    /// Altitude MSL in meters.
    pub alt: f64,
    /// Altitude AGL in meters.
    pub relative_alt: f64,
}

/// Attitude in degrees, yaw normalized to `[0, 360)`.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Attitude {
    pub roll: f64,
    pub pitch: f64,
    pub yaw: f64,
}

/// NED velocity in m/s plus ground speed.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Velocity {
    pub vx: f64,
    pub vy: f64,
    pub vz: f64,
    pub speed: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Battery {
    /// Battery voltage in volts, rounded to 2 decimals.
    pub voltage: f64,
    /// Battery current in amps, when the backend reports one.
    pub current: Option<f64>,
    /// Charge level percentage, 0-100.
    pub level: u8,
}

/// One snapshot of vehicle state, recomputed by the owning backend every
/// tick and forwarded unchanged to the broadcast collaborator.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct TelemetrySnapshot {
    pub timestamp: DateTime<Utc>,
    pub position: Position,
    pub attitude: Attitude,
    pub velocity: Velocity,
    pub battery: Battery,
    pub mode: String,
    pub armed: bool,
}

impl TelemetrySnapshot {
    /// Equality over everything except the wall-clock timestamp; what the
    /// determinism guarantee of the simulator is stated over.
    pub fn same_state(&self, other: &TelemetrySnapshot) -> bool {
        self.position == other.position
            && self.attitude == other.attitude
            && self.velocity == other.velocity
            && self.battery == other.battery
            && self.mode == other.mode
            && self.armed == other.armed
    }
}

/// Rounds to two decimals for operator-facing battery fields.
pub(crate) fn round2(v: f64) -> f64 { (v * 100.0).round() / 100.0 }
