use super::flight_mode::FlightMode;
use super::{LinkState, VehicleBackend, VehicleError, VehicleKind};
use crate::schema::{
    Attitude, Battery, CommandAck, CommandDetail, CommandType, Mission, MissionState, Position,
    TelemetrySnapshot, Velocity,
};
use crate::schema::telemetry::round2;
use async_trait::async_trait;
use rand::{Rng, SeedableRng, rngs::StdRng};

/// A command the simulator is still flying; resolved to a terminal ack by a
/// later tick once its completion condition holds.
#[derive(Debug, Clone)]
struct ActiveCommand {
    id: String,
    kind: CommandType,
}

/// Lightweight deterministic drone simulator.
///
/// Advances by a fixed Δt per tick. All randomness comes from an instance
/// RNG seeded at construction, so an identical seed, command sequence and
/// tick timing reproduce an identical telemetry sequence. Time-dependent
/// behavior (hover deadlines) runs on the accumulated simulation clock, not
/// the wall clock.
#[derive(Debug)]
pub struct TelemetrySim {
    rng: StdRng,
    sim_time: f64,

    armed: bool,
    mode: FlightMode,
    lat: f64,
    lon: f64,
    alt_msl: f64,
    alt_rel: f64,
    roll: f64,
    pitch: f64,
    yaw: f64,
    vx: f64,
    vy: f64,
    vz: f64,
    speed: f64,
    battery_level: f64,
    battery_current: f64,

    target_alt: Option<f64>,
    target_lat: Option<f64>,
    target_lon: Option<f64>,
    climb_rate: f64,
    ground_speed: f64,
    home: (f64, f64),
    mission: Option<Mission>,
    hover_deadline: Option<f64>,

    active: Vec<ActiveCommand>,
    completions: Vec<CommandAck>,
}

impl TelemetrySim {
    /// Default climb/descent rate in m/s.
    const CLIMB_RATE: f64 = 2.0;
    /// Default ground speed in m/s.
    const GROUND_SPEED: f64 = 5.0;
    /// Rough meters per degree of latitude/longitude on the flat-earth
    /// approximation the whole core shares.
    const M_PER_DEG: f64 = 111_000.0;
    /// Vertical arrival tolerance in meters.
    const ALT_TOL: f64 = 0.1;
    /// Horizontal arrival tolerance in meters.
    const POS_TOL: f64 = 1.0;
    /// Battery drain in %/s while armed and idle.
    const IDLE_DRAIN: f64 = 0.05;
    /// Additional drain in %/s per m/s of throttle proxy (speed + climb).
    const THROTTLE_DRAIN: f64 = 0.01;
    /// Minimum battery level to accept an arm command.
    const MIN_ARM_LEVEL: f64 = 20.0;
    /// Voltage at 0 % charge; full charge adds `VOLTAGE_SPAN`.
    const VOLTAGE_EMPTY: f64 = 10.5;
    const VOLTAGE_SPAN: f64 = 2.1;

    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            sim_time: 0.0,
            armed: false,
            mode: FlightMode::Stabilize,
            lat: 26.5,
            lon: 80.3,
            alt_msl: 100.0,
            alt_rel: 0.0,
            roll: 0.0,
            pitch: 0.0,
            yaw: 0.0,
            vx: 0.0,
            vy: 0.0,
            vz: 0.0,
            speed: 0.0,
            battery_level: 100.0,
            battery_current: 0.0,
            target_alt: None,
            target_lat: None,
            target_lon: None,
            climb_rate: Self::CLIMB_RATE,
            ground_speed: Self::GROUND_SPEED,
            home: (26.5, 80.3),
            mission: None,
            hover_deadline: None,
            active: Vec::new(),
            completions: Vec::new(),
        }
    }

    pub fn mode(&self) -> FlightMode { self.mode }
    pub fn is_armed(&self) -> bool { self.armed }
    pub fn mission(&self) -> Option<&Mission> { self.mission.as_ref() }

    fn resolve(&mut self, kind: CommandType, ack: fn(&str) -> CommandAck) {
        if let Some(idx) = self.active.iter().position(|a| a.kind == kind) {
            let cmd = self.active.swap_remove(idx);
            self.completions.push(ack(&cmd.id));
        }
    }

    fn resolve_failed(&mut self, kind: CommandType, reason: &str) {
        if let Some(idx) = self.active.iter().position(|a| a.kind == kind) {
            let cmd = self.active.swap_remove(idx);
            self.completions.push(CommandAck::failed(&cmd.id, reason));
        }
    }

    fn update_flight(&mut self, dt: f64) {
        // Vertical movement toward target_alt.
        if let Some(target) = self.target_alt {
            if (self.alt_rel - target).abs() > 0.05 {
                let dir = if target > self.alt_rel { 1.0 } else { -1.0 };
                self.alt_rel += dir * self.climb_rate * dt;
                // Negative is up in NED.
                self.vz = -self.climb_rate * dir;
                let overshot = (dir > 0.0 && self.alt_rel >= target)
                    || (dir < 0.0 && self.alt_rel <= target);
                if overshot {
                    self.alt_rel = target;
                    self.vz = 0.0;
                }
            } else {
                self.vz = 0.0;
            }
            if (self.alt_rel - target).abs() <= Self::ALT_TOL {
                self.resolve(CommandType::Takeoff, CommandAck::completed);
                self.resolve(CommandType::SetAlt, CommandAck::completed);
            }
        }

        // Horizontal movement toward the current target.
        if let (Some(t_lat), Some(t_lon)) = (self.target_lat, self.target_lon) {
            let dlat = t_lat - self.lat;
            let dlon = t_lon - self.lon;
            let distance = (dlat * dlat + dlon * dlon).sqrt() * Self::M_PER_DEG;

            if distance > Self::POS_TOL {
                let bearing = dlon.atan2(dlat);
                let step = (self.ground_speed * dt / Self::M_PER_DEG)
                    .min(distance / Self::M_PER_DEG);
                self.lat += bearing.cos() * step;
                self.lon += bearing.sin() * step;
                self.vx = bearing.cos() * self.ground_speed;
                self.vy = bearing.sin() * self.ground_speed;
                self.speed = self.ground_speed;
                self.yaw = bearing.to_degrees().rem_euclid(360.0);
            } else {
                self.lat = t_lat;
                self.lon = t_lon;
                self.vx = 0.0;
                self.vy = 0.0;
                self.speed = 0.0;
                self.on_target_reached();
            }
        }

        // Hover deadlines run on the simulation clock.
        if let Some(deadline) = self.hover_deadline {
            if self.sim_time >= deadline {
                self.hover_deadline = None;
                self.resolve(CommandType::Hover, CommandAck::completed);
            }
        }
    }

    fn on_target_reached(&mut self) {
        if self.active.iter().any(|a| a.kind == CommandType::Goto) {
            self.target_lat = None;
            self.target_lon = None;
            self.resolve(CommandType::Goto, CommandAck::completed);
            return;
        }
        if self.active.iter().any(|a| a.kind == CommandType::Rtl) {
            self.target_lat = None;
            self.target_lon = None;
            self.resolve(CommandType::Rtl, CommandAck::completed);
            // Back over the launch point: stand down if the ground guard
            // holds, otherwise stay armed where we are.
            if self.alt_rel <= 0.5 && self.speed <= 0.5 {
                self.armed = false;
                self.mode = FlightMode::Stabilize;
                self.hover_deadline = None;
                for cmd in std::mem::take(&mut self.active) {
                    self.completions.push(CommandAck::failed(&cmd.id, "Disarmed"));
                }
            }
            return;
        }

        let running = self
            .mission
            .as_ref()
            .is_some_and(|m| m.state() == MissionState::Running && self.mode == FlightMode::Auto);
        if running {
            let done = self.mission.as_mut().map(|m| m.advance()).unwrap_or(true);
            if done {
                self.target_lat = None;
                self.target_lon = None;
                self.mode = FlightMode::Hold;
                self.resolve(CommandType::StartMission, CommandAck::completed);
            } else if let Some(wp) = self.mission.as_ref().and_then(|m| m.current()).copied() {
                self.target_lat = Some(wp.lat);
                self.target_lon = Some(wp.lon);
                self.target_alt = Some(wp.alt);
            }
        }
    }

    fn drain_battery(&mut self, dt: f64, jitter: f64) {
        let throttle = self.speed + self.vz.abs();
        let drain = (Self::IDLE_DRAIN + Self::THROTTLE_DRAIN * throttle) * dt;
        self.battery_level = (self.battery_level - drain).max(0.0);
        let base = if self.speed > 0.0 { 5.0 } else { 2.0 };
        self.battery_current = (base + 0.8 * throttle + jitter).max(0.0);
    }

    fn voltage(&self) -> f64 {
        Self::VOLTAGE_EMPTY + Self::VOLTAGE_SPAN * self.battery_level / 100.0
    }

    fn snapshot(&self) -> TelemetrySnapshot {
        let current = round2(self.battery_current);
        TelemetrySnapshot {
            timestamp: chrono::Utc::now(),
            position: Position {
                lat: self.lat,
                lon: self.lon,
                alt: self.alt_msl + self.alt_rel,
                relative_alt: self.alt_rel,
            },
            attitude: Attitude { roll: self.roll, pitch: self.pitch, yaw: self.yaw },
            velocity: Velocity { vx: self.vx, vy: self.vy, vz: self.vz, speed: self.speed },
            battery: Battery {
                voltage: round2(self.voltage()),
                current: if current > 0.0 { Some(current) } else { None },
                level: self.battery_level.clamp(0.0, 100.0) as u8,
            },
            mode: self.mode.to_string(),
            armed: self.armed,
        }
    }

    fn apply(&mut self, id: &str, detail: &CommandDetail) -> CommandAck {
        match detail {
            CommandDetail::Arm => {
                if self.armed {
                    return CommandAck::rejected(id, "Already armed");
                }
                if self.battery_level < Self::MIN_ARM_LEVEL {
                    return CommandAck::rejected(id, "Battery too low to arm");
                }
                self.armed = true;
                self.home = (self.lat, self.lon);
                CommandAck::completed(id)
            }
            CommandDetail::Disarm => {
                if !self.armed {
                    return CommandAck::rejected(id, "Already disarmed");
                }
                self.armed = false;
                self.mode = FlightMode::Stabilize;
                self.target_alt = None;
                self.target_lat = None;
                self.target_lon = None;
                self.hover_deadline = None;
                // Motors off: whatever was still flying can never finish.
                for cmd in std::mem::take(&mut self.active) {
                    self.completions.push(CommandAck::failed(&cmd.id, "Disarmed"));
                }
                CommandAck::completed(id)
            }
            CommandDetail::Takeoff(p) => {
                if !self.armed {
                    return CommandAck::rejected(id, "Not armed");
                }
                self.target_alt = Some(p.alt);
                self.mode = FlightMode::Guided;
                self.active.push(ActiveCommand { id: id.to_string(), kind: CommandType::Takeoff });
                CommandAck::executing(id)
            }
            CommandDetail::Goto(p) => {
                if !self.armed {
                    return CommandAck::rejected(id, "Not armed");
                }
                self.target_lat = Some(p.lat);
                self.target_lon = Some(p.lon);
                self.target_alt = Some(p.alt);
                if let Some(speed) = p.speed {
                    self.ground_speed = speed;
                }
                self.mode = FlightMode::Guided;
                self.active.push(ActiveCommand { id: id.to_string(), kind: CommandType::Goto });
                CommandAck::executing(id)
            }
            CommandDetail::Hover(p) => {
                self.target_lat = Some(self.lat);
                self.target_lon = Some(self.lon);
                self.mode = FlightMode::Hold;
                if p.duration > 0.0 {
                    self.hover_deadline = Some(self.sim_time + p.duration);
                    self.active
                        .push(ActiveCommand { id: id.to_string(), kind: CommandType::Hover });
                    CommandAck::executing(id)
                } else {
                    self.hover_deadline = None;
                    CommandAck::completed(id)
                }
            }
            CommandDetail::SetAlt(p) => {
                if !self.armed {
                    return CommandAck::rejected(id, "Not armed");
                }
                self.target_alt = Some(p.alt);
                if let Some(speed) = p.speed {
                    self.climb_rate = speed;
                }
                self.mode = FlightMode::Guided;
                self.active.push(ActiveCommand { id: id.to_string(), kind: CommandType::SetAlt });
                CommandAck::executing(id)
            }
            CommandDetail::SetMode(mode) => {
                self.mode = *mode;
                if *mode == FlightMode::Land {
                    // LAND initiates a descent to ground.
                    self.target_alt = Some(0.0);
                }
                CommandAck::completed(id)
            }
            CommandDetail::Rtl => {
                if !self.armed {
                    return CommandAck::rejected(id, "Not armed");
                }
                self.target_lat = Some(self.home.0);
                self.target_lon = Some(self.home.1);
                self.mode = FlightMode::Rtl;
                self.active.push(ActiveCommand { id: id.to_string(), kind: CommandType::Rtl });
                CommandAck::executing(id)
            }
            CommandDetail::UploadMission(waypoints) => {
                self.mission = Some(Mission::new(waypoints.clone()));
                CommandAck::completed(id)
            }
            CommandDetail::StartMission => {
                let Some(mission) = self.mission.as_mut() else {
                    return CommandAck::rejected(id, "No mission uploaded");
                };
                if mission.is_empty() {
                    return CommandAck::rejected(id, "Mission is empty");
                }
                mission.start();
                let wp = mission.current().copied();
                if let Some(wp) = wp {
                    self.target_lat = Some(wp.lat);
                    self.target_lon = Some(wp.lon);
                    self.target_alt = Some(wp.alt);
                }
                self.mode = FlightMode::Auto;
                self.active
                    .push(ActiveCommand { id: id.to_string(), kind: CommandType::StartMission });
                CommandAck::executing(id)
            }
            CommandDetail::PauseMission => {
                if let Some(mission) = self.mission.as_mut() {
                    mission.pause();
                }
                self.target_lat = None;
                self.target_lon = None;
                self.mode = FlightMode::Hold;
                CommandAck::completed(id)
            }
            CommandDetail::ContinueMission => {
                let Some(mission) = self.mission.as_mut() else {
                    return CommandAck::rejected(id, "No mission uploaded");
                };
                mission.resume();
                let wp = mission.current().copied();
                if let Some(wp) = wp {
                    self.target_lat = Some(wp.lat);
                    self.target_lon = Some(wp.lon);
                    self.target_alt = Some(wp.alt);
                }
                self.mode = FlightMode::Auto;
                CommandAck::completed(id)
            }
            CommandDetail::AbortMission => {
                if let Some(mission) = self.mission.as_mut() {
                    mission.abort();
                }
                self.target_lat = None;
                self.target_lon = None;
                self.mode = FlightMode::Hold;
                self.resolve_failed(CommandType::StartMission, "Mission aborted");
                CommandAck::completed(id)
            }
        }
    }
}

#[async_trait]
impl VehicleBackend for TelemetrySim {
    fn kind(&self) -> VehicleKind { VehicleKind::Sim }

    fn telemetry(&self) -> TelemetrySnapshot { self.snapshot() }

    fn link(&self) -> LinkState { LinkState::Connected }

    fn tick(&mut self, dt: f64) -> Vec<CommandAck> {
        self.sim_time += dt;
        // One jitter draw per tick keeps the RNG stream a pure function of
        // the tick count, armed or not.
        let jitter = self.rng.random_range(-0.15..=0.15);
        if self.armed {
            self.update_flight(dt);
            self.drain_battery(dt, jitter);
        }
        std::mem::take(&mut self.completions)
    }

    async fn send_command(
        &mut self,
        id: &str,
        detail: &CommandDetail,
    ) -> Result<CommandAck, VehicleError> {
        Ok(self.apply(id, detail))
    }
}
