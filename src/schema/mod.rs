mod command;
mod mission;
pub(crate) mod telemetry;

pub use command::{
    AckStatus, Command, CommandAck, CommandDetail, CommandType, GotoParams, HoverParams,
    TakeoffParams,
};
pub use mission::{Mission, MissionState, Waypoint};
pub use telemetry::{Attitude, Battery, Position, TelemetrySnapshot, Velocity};
