use std::{env, time::Duration};

/// Operating mode requested at startup. `Sitl` falls back to `Sim` when the
/// live link cannot be established.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperatingMode {
    Sim,
    Sitl,
}

/// Process configuration, read once from the environment at startup.
///
/// The core never reads the environment after this point; everything that
/// needs a knob gets it through this struct.
#[derive(Debug, Clone)]
pub struct Config {
    /// Requested backend (`SIM_MODE`, `SIM` or `SITL`).
    pub mode: OperatingMode,
    /// Telemetry loop rate in Hz (`TELEMETRY_RATE`).
    pub telemetry_rate: u32,
    /// UDP endpoint of the SITL autopilot (`MAVLINK_UDP_ADDR`).
    pub mavlink_addr: String,
    /// Whether a `goto` in HOLD may auto-switch the vehicle to GUIDED
    /// (`AUTO_MODE_SWITCH`).
    pub auto_mode_switch: bool,
    /// Seed for the deterministic simulator (`SIM_SEED`).
    pub sim_seed: u64,
}

impl Config {
    pub fn from_env() -> Self {
        let mode = match env::var("SIM_MODE").as_deref() {
            Ok("SITL") | Ok("sitl") => OperatingMode::Sitl,
            _ => OperatingMode::Sim,
        };
        let telemetry_rate = env::var("TELEMETRY_RATE")
            .ok()
            .and_then(|v| v.parse::<u32>().ok())
            .filter(|r| *r > 0)
            .unwrap_or(5);
        let mavlink_addr_var = env::var("MAVLINK_UDP_ADDR");
        let mavlink_addr =
            mavlink_addr_var.as_ref().map_or("127.0.0.1:14550", |v| v.as_str()).to_string();
        let auto_mode_switch = env::var("AUTO_MODE_SWITCH")
            .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes"))
            .unwrap_or(true);
        let sim_seed =
            env::var("SIM_SEED").ok().and_then(|v| v.parse::<u64>().ok()).unwrap_or(42);
        Self { mode, telemetry_rate, mavlink_addr, auto_mode_switch, sim_seed }
    }

    /// Telemetry tick period, also the fixed simulator step.
    pub fn tick_period(&self) -> Duration {
        Duration::from_secs_f64(1.0 / f64::from(self.telemetry_rate))
    }

    /// Fixed simulation step in seconds, matching the tick period.
    pub fn tick_dt(&self) -> f64 { 1.0 / f64::from(self.telemetry_rate) }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mode: OperatingMode::Sim,
            telemetry_rate: 5,
            mavlink_addr: "127.0.0.1:14550".to_string(),
            auto_mode_switch: true,
            sim_seed: 42,
        }
    }
}
