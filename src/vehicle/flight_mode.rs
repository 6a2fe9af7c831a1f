use strum_macros::{Display, EnumString};

/// Flight modes the core understands, matching the ArduCopter custom-mode
/// table used by the SITL link.
///
/// `Hold` is what the simulator and the operator interface call a parked
/// position hold; on the wire it is indistinguishable from `Loiter`.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Hash, Display, EnumString)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE", ascii_case_insensitive)]
pub enum FlightMode {
    Stabilize,
    Acro,
    AltHold,
    Auto,
    Guided,
    Loiter,
    Rtl,
    Circle,
    Land,
    #[strum(serialize = "POSHOLD")]
    PosHold,
    Brake,
    Hold,
}

impl FlightMode {
    /// ArduCopter custom mode id for outgoing `DO_SET_MODE` commands.
    pub fn custom_mode(self) -> u32 {
        match self {
            FlightMode::Stabilize => 0,
            FlightMode::Acro => 1,
            FlightMode::AltHold => 2,
            FlightMode::Auto => 3,
            FlightMode::Guided => 4,
            // HOLD rides on the loiter id, see type docs.
            FlightMode::Loiter | FlightMode::Hold => 5,
            FlightMode::Rtl => 6,
            FlightMode::Circle => 7,
            FlightMode::Land => 9,
            FlightMode::PosHold => 16,
            FlightMode::Brake => 17,
        }
    }

    /// Decodes an incoming heartbeat custom mode. Unknown ids yield `None`;
    /// the caller keeps a raw `MODE_<n>` label in that case.
    pub fn from_custom_mode(id: u32) -> Option<FlightMode> {
        match id {
            0 => Some(FlightMode::Stabilize),
            1 => Some(FlightMode::Acro),
            2 => Some(FlightMode::AltHold),
            3 => Some(FlightMode::Auto),
            4 => Some(FlightMode::Guided),
            5 => Some(FlightMode::Loiter),
            6 => Some(FlightMode::Rtl),
            7 => Some(FlightMode::Circle),
            9 => Some(FlightMode::Land),
            16 => Some(FlightMode::PosHold),
            17 => Some(FlightMode::Brake),
            _ => None,
        }
    }
}
