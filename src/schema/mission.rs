use super::command::ValidationError;
use strum_macros::Display;

fn default_command_code() -> u16 { 16 }

/// Single mission waypoint. `command_code` carries the MAVLink command id,
/// defaulting to 16 (NAV_WAYPOINT).
#[derive(Debug, Clone, Copy, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct Waypoint {
    pub lat: f64,
    pub lon: f64,
    pub alt: f64,
    #[serde(rename = "command", default = "default_command_code")]
    pub command_code: u16,
}

impl Waypoint {
    /// Range-checks one waypoint; the index only feeds the reason string.
    pub fn check(&self, idx: usize) -> Result<(), ValidationError> {
        if !(-90.0..=90.0).contains(&self.lat) {
            return Err(ValidationError(format!(
                "Waypoint {idx}: latitude must be between -90 and 90."
            )));
        }
        if !(-180.0..=180.0).contains(&self.lon) {
            return Err(ValidationError(format!(
                "Waypoint {idx}: longitude must be between -180 and 180."
            )));
        }
        if self.alt <= 0.0 {
            return Err(ValidationError(format!("Waypoint {idx}: altitude must be > 0 m")));
        }
        Ok(())
    }
}

#[derive(Debug, PartialEq, Eq, Clone, Copy, Display)]
#[strum(serialize_all = "snake_case")]
pub enum MissionState {
    Idle,
    Running,
    Paused,
    Aborted,
    Completed,
}

/// An uploaded mission owned by the active backend. Replaced wholesale by
/// the next upload; the cursor always stays within `[0, len]`.
#[derive(Debug, Clone, PartialEq)]
pub struct Mission {
    waypoints: Vec<Waypoint>,
    cursor: usize,
    state: MissionState,
}

impl Mission {
    pub fn new(waypoints: Vec<Waypoint>) -> Self {
        Self { waypoints, cursor: 0, state: MissionState::Idle }
    }

    pub fn len(&self) -> usize { self.waypoints.len() }
    pub fn is_empty(&self) -> bool { self.waypoints.is_empty() }
    pub fn cursor(&self) -> usize { self.cursor }
    pub fn state(&self) -> MissionState { self.state }

    /// The waypoint the vehicle is currently flying toward, if any.
    pub fn current(&self) -> Option<&Waypoint> { self.waypoints.get(self.cursor) }

    pub fn start(&mut self) {
        self.cursor = 0;
        self.state = MissionState::Running;
    }

    pub fn pause(&mut self) { self.state = MissionState::Paused; }

    pub fn resume(&mut self) { self.state = MissionState::Running; }

    pub fn abort(&mut self) { self.state = MissionState::Aborted; }

    /// Moves the cursor past the current waypoint. Returns `true` when the
    /// mission just finished its last waypoint.
    pub fn advance(&mut self) -> bool {
        if self.cursor < self.waypoints.len() {
            self.cursor += 1;
        }
        if self.cursor >= self.waypoints.len() {
            self.state = MissionState::Completed;
            true
        } else {
            false
        }
    }
}
