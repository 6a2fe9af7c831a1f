use super::mission::Waypoint;
use crate::vehicle::flight_mode::FlightMode;
use std::str::FromStr;
use strum_macros::{Display, EnumString};

/// Raw inbound command as it arrives from the operator transport. The
/// `type`/`params` pair is only trusted after [`CommandDetail::parse`].
#[derive(Debug, Clone, serde::Deserialize, serde::Serialize)]
pub struct Command {
    /// Idempotency key, unique per engine lifetime.
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

#[derive(Debug, PartialEq, Eq, Clone, Copy, Hash, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum CommandType {
    Arm,
    Disarm,
    Takeoff,
    Goto,
    Hover,
    SetAlt,
    SetMode,
    Rtl,
    UploadMission,
    StartMission,
    PauseMission,
    ContinueMission,
    AbortMission,
}

#[derive(Debug, PartialEq, Eq, Clone, Copy, Hash, Display, serde::Serialize, serde::Deserialize)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum AckStatus {
    Accepted,
    Executing,
    Completed,
    Rejected,
    Failed,
}

impl AckStatus {
    /// Terminal statuses end the command lifecycle; exactly one of these is
    /// emitted per command.
    pub fn is_terminal(self) -> bool {
        matches!(self, AckStatus::Completed | AckStatus::Rejected | AckStatus::Failed)
    }
}

/// Lifecycle acknowledgment sent back to the operator transport.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct CommandAck {
    pub id: String,
    pub status: AckStatus,
    pub reason: Option<String>,
}

impl CommandAck {
    pub fn accepted(id: &str) -> Self {
        Self { id: id.to_string(), status: AckStatus::Accepted, reason: None }
    }

    pub fn executing(id: &str) -> Self {
        Self { id: id.to_string(), status: AckStatus::Executing, reason: None }
    }

    pub fn completed(id: &str) -> Self {
        Self { id: id.to_string(), status: AckStatus::Completed, reason: None }
    }

    pub fn rejected(id: &str, reason: &str) -> Self {
        Self { id: id.to_string(), status: AckStatus::Rejected, reason: Some(reason.to_string()) }
    }

    pub fn failed(id: &str, reason: &str) -> Self {
        Self { id: id.to_string(), status: AckStatus::Failed, reason: Some(reason.to_string()) }
    }
}

/// Malformed or out-of-range command input. Always resolves to a rejected
/// ack inside the engine, never reaches a backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError(pub String);

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for ValidationError {}

fn validation(msg: &str) -> ValidationError {
    ValidationError(format!("Validation error: {msg}"))
}

#[derive(Debug, Clone, Copy, PartialEq, serde::Deserialize)]
pub struct TakeoffParams {
    pub alt: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, serde::Deserialize)]
pub struct GotoParams {
    pub lat: f64,
    pub lon: f64,
    pub alt: f64,
    #[serde(default)]
    pub speed: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, serde::Deserialize)]
pub struct SetAltParams {
    pub alt: f64,
    #[serde(default)]
    pub speed: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, serde::Deserialize)]
pub struct HoverParams {
    /// Hover duration in seconds; 0 holds until a further command.
    #[serde(default)]
    pub duration: f64,
}

#[derive(Debug, Clone, serde::Deserialize)]
struct SetModeParams {
    mode: String,
}

#[derive(Debug, Clone, serde::Deserialize)]
struct UploadMissionParams {
    mission: Vec<Waypoint>,
}

/// A command whose type and parameters passed shape and range validation.
/// This is the only form backends ever see.
#[derive(Debug, Clone, PartialEq)]
pub enum CommandDetail {
    Arm,
    Disarm,
    Takeoff(TakeoffParams),
    Goto(GotoParams),
    Hover(HoverParams),
    SetAlt(SetAltParams),
    SetMode(FlightMode),
    Rtl,
    UploadMission(Vec<Waypoint>),
    StartMission,
    PauseMission,
    ContinueMission,
    AbortMission,
}

impl CommandDetail {
    pub fn kind(&self) -> CommandType {
        match self {
            CommandDetail::Arm => CommandType::Arm,
            CommandDetail::Disarm => CommandType::Disarm,
            CommandDetail::Takeoff(_) => CommandType::Takeoff,
            CommandDetail::Goto(_) => CommandType::Goto,
            CommandDetail::Hover(_) => CommandType::Hover,
            CommandDetail::SetAlt(_) => CommandType::SetAlt,
            CommandDetail::SetMode(_) => CommandType::SetMode,
            CommandDetail::Rtl => CommandType::Rtl,
            CommandDetail::UploadMission(_) => CommandType::UploadMission,
            CommandDetail::StartMission => CommandType::StartMission,
            CommandDetail::PauseMission => CommandType::PauseMission,
            CommandDetail::ContinueMission => CommandType::ContinueMission,
            CommandDetail::AbortMission => CommandType::AbortMission,
        }
    }

    /// Parses and range-checks the type-specific params of a raw command.
    pub fn parse(kind: &str, params: &serde_json::Value) -> Result<CommandDetail, ValidationError> {
        let kind = CommandType::from_str(kind)
            .map_err(|_| ValidationError(format!("Unknown command type: {kind}")))?;
        match kind {
            CommandType::Arm => Ok(CommandDetail::Arm),
            CommandType::Disarm => Ok(CommandDetail::Disarm),
            CommandType::Rtl => Ok(CommandDetail::Rtl),
            CommandType::StartMission => Ok(CommandDetail::StartMission),
            CommandType::PauseMission => Ok(CommandDetail::PauseMission),
            CommandType::ContinueMission => Ok(CommandDetail::ContinueMission),
            CommandType::AbortMission => Ok(CommandDetail::AbortMission),
            CommandType::Takeoff => {
                let p: TakeoffParams = from_params(params)?;
                check_alt(p.alt)?;
                Ok(CommandDetail::Takeoff(p))
            }
            CommandType::Goto => {
                let p: GotoParams = from_params(params)?;
                check_lat_lon(p.lat, p.lon)?;
                check_alt(p.alt)?;
                check_speed(p.speed)?;
                Ok(CommandDetail::Goto(p))
            }
            CommandType::Hover => {
                let p: HoverParams = from_params(params)?;
                if p.duration < 0.0 {
                    return Err(validation("Hover duration must be >= 0 s"));
                }
                Ok(CommandDetail::Hover(p))
            }
            CommandType::SetAlt => {
                let p: SetAltParams = from_params(params)?;
                check_alt(p.alt)?;
                check_speed(p.speed)?;
                Ok(CommandDetail::SetAlt(p))
            }
            CommandType::SetMode => {
                let p: SetModeParams = from_params(params)?;
                let mode = FlightMode::from_str(&p.mode)
                    .map_err(|_| ValidationError(format!("Unknown mode: {}", p.mode)))?;
                Ok(CommandDetail::SetMode(mode))
            }
            CommandType::UploadMission => {
                let p: UploadMissionParams = from_params(params)?;
                if p.mission.is_empty() {
                    return Err(ValidationError(
                        "Mission must contain at least one waypoint".to_string(),
                    ));
                }
                for (idx, wp) in p.mission.iter().enumerate() {
                    wp.check(idx)?;
                }
                Ok(CommandDetail::UploadMission(p.mission))
            }
        }
    }
}

fn from_params<T: serde::de::DeserializeOwned>(
    params: &serde_json::Value,
) -> Result<T, ValidationError> {
    serde_json::from_value(params.clone()).map_err(|e| validation(&e.to_string()))
}

fn check_alt(alt: f64) -> Result<(), ValidationError> {
    if alt > 0.0 { Ok(()) } else { Err(validation("Altitude must be > 0 m")) }
}

fn check_lat_lon(lat: f64, lon: f64) -> Result<(), ValidationError> {
    if !(-90.0..=90.0).contains(&lat) {
        return Err(validation("Latitude must be between -90 and 90"));
    }
    if !(-180.0..=180.0).contains(&lon) {
        return Err(validation("Longitude must be between -180 and 180"));
    }
    Ok(())
}

fn check_speed(speed: Option<f64>) -> Result<(), ValidationError> {
    match speed {
        Some(s) if s <= 0.0 => Err(validation("Speed must be > 0 m/s")),
        _ => Ok(()),
    }
}
